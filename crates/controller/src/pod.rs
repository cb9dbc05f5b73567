use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use dashmap::DashMap;
use fakelet_apply::Renderer;
use fakelet_core::{ObjectClient, ObjectKey, StageObject, WatchEvent};
use k8s_openapi::api::core::v1::Pod;
use minijinja::State;
use tracing::{debug, warn};

use crate::allocator::PodIpAllocator;
use crate::controller::{ControllerBuilder, StageController};
use crate::hooks::StageHooks;
use crate::registry::NodeRegistry;
use crate::template::{invalid, state_opt_str, state_str};

fn node_name(pod: &Pod) -> Option<&str> {
    pod.spec.as_ref().and_then(|s| s.node_name.as_deref()).filter(|n| !n.is_empty())
}

fn host_network(pod: &Pod) -> bool {
    pod.spec.as_ref().and_then(|s| s.host_network).unwrap_or(false)
}

/// Pods are managed when scheduled onto a managed node.
///
/// Pods bound to a node that is not registered yet are parked per node and
/// handed back by [`PodHooks::unpark`] once the node shows up.
pub struct PodHooks {
    registry: Arc<NodeRegistry>,
    allocator: Arc<PodIpAllocator>,
    parked: DashMap<String, BTreeMap<ObjectKey, Pod>>,
}

impl PodHooks {
    pub fn new(registry: Arc<NodeRegistry>, allocator: Arc<PodIpAllocator>) -> Self {
        Self { registry, allocator, parked: DashMap::new() }
    }

    /// Take the parked pods bound to `node`.
    pub fn unpark(&self, node: &str) -> Vec<Pod> {
        self.parked.remove(node).map(|(_, pods)| pods.into_values().collect()).unwrap_or_default()
    }

    pub fn parked(&self) -> usize {
        self.parked.iter().map(|e| e.value().len()).sum()
    }

    fn park(&self, node: &str, pod: &Pod) {
        self.parked.entry(node.to_string()).or_default().insert(StageObject::key(pod), pod.clone());
    }

    fn drop_parked(&self, node: &str, key: &ObjectKey) -> bool {
        let removed = self.parked.get_mut(node).map_or(false, |mut pods| pods.remove(key).is_some());
        self.parked.remove_if(node, |_, pods| pods.is_empty());
        removed
    }
}

impl StageHooks<Pod> for PodHooks {
    fn needs_management(&self, pod: &Pod) -> bool {
        let Some(node) = node_name(pod) else { return false };
        if self.registry.contains(node) {
            return true;
        }
        self.park(node, pod);
        // the node may have registered while parking; its replay could have missed us
        if self.registry.contains(node) {
            self.drop_parked(node, &StageObject::key(pod));
            return true;
        }
        false
    }

    fn observe(&self, pod: &Pod) {
        if host_network(pod) {
            return;
        }
        let (Some(node), Some(ip)) = (node_name(pod), pod.status.as_ref().and_then(|s| s.pod_ip.as_deref())) else {
            return;
        };
        let key = StageObject::key(pod);
        if self.allocator.assigned(&key).is_some() {
            return;
        }
        match ip.parse::<IpAddr>() {
            Ok(addr) => {
                if let Err(e) = self.allocator.observe(node, &key, addr) {
                    warn!(pod = %key, error = %e, "cannot record pod ip");
                }
            }
            Err(_) => warn!(pod = %key, ip, "pod has an unparsable podIP"),
        }
    }

    fn forget(&self, pod: &Pod) {
        let key = StageObject::key(pod);
        if let Some(node) = node_name(pod) {
            self.drop_parked(node, &key);
        }
        self.allocator.release(&key);
    }
}

fn node_ip(registry: &NodeRegistry, default_ip: &str, node: &str) -> String {
    registry.get(node).and_then(|n| n.internal_ip).unwrap_or_else(|| default_ip.to_string())
}

/// Renderer with `PodIP()`, `NodeIP()` and `NodeIPWith(name)`.
///
/// `PodIP()` allocates from the pod's node pool on first use and returns the
/// same address afterwards; host-network pods get their node's address.
pub fn pod_renderer(allocator: Arc<PodIpAllocator>, registry: Arc<NodeRegistry>, default_node_ip: &str) -> Renderer {
    let mut r = Renderer::new();
    let env = r.environment_mut();

    let (reg, ip) = (Arc::clone(&registry), default_node_ip.to_string());
    env.add_function("NodeIPWith", move |node: String| node_ip(&reg, &ip, &node));

    let (reg, ip) = (Arc::clone(&registry), default_node_ip.to_string());
    env.add_function("NodeIP", move |state: &State| -> Result<String, minijinja::Error> {
        let node = state_str(state, "spec", "nodeName")?;
        Ok(node_ip(&reg, &ip, &node))
    });

    let (reg, ip) = (registry, default_node_ip.to_string());
    env.add_function("PodIP", move |state: &State| -> Result<String, minijinja::Error> {
        let node = state_str(state, "spec", "nodeName")?;
        let host = state.lookup("spec").and_then(|s| s.get_attr("hostNetwork").ok()).map_or(false, |v| v.is_true());
        if host {
            return Ok(node_ip(&reg, &ip, &node));
        }
        let name = state_str(state, "metadata", "name")?;
        let namespace = state_opt_str(state, "metadata", "namespace")?;
        let key = ObjectKey::new(namespace.as_deref(), &name);
        allocator.allocate(&node, &key).map(|a| a.to_string()).map_err(|e| invalid(e.to_string()))
    });
    r
}

/// Builder for the `Pod` stage controller.
///
/// Pods parked on an unknown node are re-run through the controller as
/// `Sync` observations when that node registers.
pub fn pod_controller(
    client: Arc<dyn ObjectClient<Pod>>,
    registry: Arc<NodeRegistry>,
    allocator: Arc<PodIpAllocator>,
    default_node_ip: &str,
) -> ControllerBuilder<Pod> {
    let renderer = pod_renderer(Arc::clone(&allocator), Arc::clone(&registry), default_node_ip);
    let hooks = Arc::new(PodHooks::new(Arc::clone(&registry), allocator));
    let parked = Arc::downgrade(&hooks);
    StageController::builder("Pod", client).hooks(hooks).renderer(renderer).on_build(move |ctrl| {
        let ctrl = ctrl.downgrade();
        registry.on_register(move |node| {
            let (Some(ctrl), Some(parked)) = (ctrl.upgrade(), parked.upgrade()) else { return };
            let pods = parked.unpark(node);
            if !pods.is_empty() {
                debug!(node, pods = pods.len(), "replaying pods of newly managed node");
            }
            for pod in pods {
                ctrl.handle_event(WatchEvent::Sync(pod));
            }
        });
    })
}
