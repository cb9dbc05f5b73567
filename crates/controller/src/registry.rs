use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use dashmap::DashMap;

/// What the pod side needs to know about a managed node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeInfo {
    pub pod_cidr: Option<String>,
    pub internal_ip: Option<String>,
}

type Listener = Arc<dyn Fn(&str) + Send + Sync>;

/// Nodes currently managed by the node controller, keyed by name.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: DashMap<String, NodeInfo>,
    listeners: RwLock<Vec<Listener>>,
}

impl fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRegistry").field("nodes", &self.nodes).finish_non_exhaustive()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record or refresh a node; returns true when it was not known before.
    /// Listeners run after a new node is visible to `contains`.
    pub fn insert(&self, name: &str, info: NodeInfo) -> bool {
        let new = self.nodes.insert(name.to_string(), info).is_none();
        if new {
            let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner).clone();
            for listener in listeners {
                listener(name);
            }
        }
        new
    }

    /// Call `f` with the name of every node registered from now on.
    pub fn on_register(&self, f: impl Fn(&str) + Send + Sync + 'static) {
        self.listeners.write().unwrap_or_else(PoisonError::into_inner).push(Arc::new(f));
    }

    pub fn remove(&self, name: &str) -> Option<NodeInfo> {
        self.nodes.remove(name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<NodeInfo> {
        self.nodes.get(name).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
