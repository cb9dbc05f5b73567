use std::net::IpAddr;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fakelet_core::ObjectKey;
use tracing::{debug, warn};

use crate::error::IpPoolError;
use crate::ippool::IpPool;
use crate::registry::NodeRegistry;

/// Pod IP assignment: one pool per node and a pod -> (node, ip) table so
/// deleted pods return their address to the right pool.
#[derive(Debug)]
pub struct PodIpAllocator {
    default_cidr: String,
    registry: Arc<NodeRegistry>,
    pools: DashMap<String, Arc<IpPool>>,
    assigned: DashMap<ObjectKey, (String, IpAddr)>,
}

impl PodIpAllocator {
    pub fn new(default_cidr: &str, registry: Arc<NodeRegistry>) -> Result<Self, IpPoolError> {
        IpPool::new(default_cidr)?;
        Ok(Self { default_cidr: default_cidr.to_string(), registry, pools: DashMap::new(), assigned: DashMap::new() })
    }

    /// Pool for `node`, sized from its `spec.podCIDR` when the registry knows it.
    pub fn pool_for(&self, node: &str) -> Result<Arc<IpPool>, IpPoolError> {
        if let Some(p) = self.pools.get(node) {
            return Ok(Arc::clone(p.value()));
        }
        let cidr = self.registry.get(node).and_then(|n| n.pod_cidr).unwrap_or_else(|| self.default_cidr.clone());
        let pool = match IpPool::new(&cidr) {
            Ok(p) => p,
            Err(e) => {
                warn!(node, error = %e, "bad node podCIDR, using default");
                IpPool::new(&self.default_cidr)?
            }
        };
        Ok(Arc::clone(self.pools.entry(node.to_string()).or_insert_with(|| Arc::new(pool)).value()))
    }

    /// The pod's address, allocating one on first call.
    pub fn allocate(&self, node: &str, pod: &ObjectKey) -> Result<IpAddr, IpPoolError> {
        let pool = self.pool_for(node)?;
        match self.assigned.entry(pod.clone()) {
            Entry::Occupied(e) => Ok(e.get().1),
            Entry::Vacant(v) => {
                let ip = pool.get()?;
                debug!(pod = %pod, node, ip = %ip, "pod ip allocated");
                v.insert((node.to_string(), ip));
                Ok(ip)
            }
        }
    }

    /// Record an address a pod already carries.
    pub fn observe(&self, node: &str, pod: &ObjectKey, ip: IpAddr) -> Result<(), IpPoolError> {
        let pool = self.pool_for(node)?;
        pool.mark_used(ip);
        self.assigned.insert(pod.clone(), (node.to_string(), ip));
        Ok(())
    }

    /// Return the pod's address to its node pool.
    pub fn release(&self, pod: &ObjectKey) -> Option<IpAddr> {
        let (_, (node, ip)) = self.assigned.remove(pod)?;
        if let Some(pool) = self.pools.get(&node) {
            pool.put(ip);
        }
        debug!(pod = %pod, node = %node, ip = %ip, "pod ip released");
        Some(ip)
    }

    pub fn assigned(&self, pod: &ObjectKey) -> Option<IpAddr> {
        self.assigned.get(pod).map(|e| e.value().1)
    }

    /// Drop a node's pool once the node is gone.
    pub fn forget_node(&self, node: &str) {
        self.pools.remove(node);
    }
}
