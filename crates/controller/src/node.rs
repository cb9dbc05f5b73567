use std::collections::BTreeMap;
use std::sync::Arc;

use fakelet_apply::Renderer;
use fakelet_core::{ConfigError, ObjectClient};
use fakelet_lifecycle::LabelSelector;
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use minijinja::State;

use crate::allocator::PodIpAllocator;
use crate::config::NodeSelection;
use crate::controller::{ControllerBuilder, StageController};
use crate::hooks::StageHooks;
use crate::registry::{NodeInfo, NodeRegistry};
use crate::template::state_str;

/// Compiled [`NodeSelection`].
#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    manage_all: bool,
    labels: Option<LabelSelector>,
    annotations: Option<LabelSelector>,
    disregard_labels: Option<LabelSelector>,
    disregard_annotations: Option<LabelSelector>,
}

fn compile(sel: &Option<String>) -> Result<Option<LabelSelector>, ConfigError> {
    match sel.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => LabelSelector::parse(s).map(Some),
    }
}

fn matches(sel: &Option<LabelSelector>, map: &BTreeMap<String, String>) -> bool {
    sel.as_ref().map_or(false, |s| s.matches(Some(map)))
}

impl NodeFilter {
    pub fn compile(sel: &NodeSelection) -> Result<Self, ConfigError> {
        Ok(Self {
            manage_all: sel.manage_all,
            labels: compile(&sel.label_selector)?,
            annotations: compile(&sel.annotation_selector)?,
            disregard_labels: compile(&sel.disregard_label_selector)?,
            disregard_annotations: compile(&sel.disregard_annotation_selector)?,
        })
    }

    pub fn manages(&self, labels: &BTreeMap<String, String>, annotations: &BTreeMap<String, String>) -> bool {
        self.manage_all || matches(&self.labels, labels) || matches(&self.annotations, annotations)
    }

    pub fn disregards(&self, labels: &BTreeMap<String, String>, annotations: &BTreeMap<String, String>) -> bool {
        matches(&self.disregard_labels, labels) || matches(&self.disregard_annotations, annotations)
    }
}

pub fn node_info(node: &Node) -> NodeInfo {
    let pod_cidr = node.spec.as_ref().and_then(|s| s.pod_cidr.clone());
    let internal_ip = node
        .status
        .as_ref()
        .and_then(|s| s.addresses.as_ref())
        .and_then(|addrs| addrs.iter().find(|a| a.type_ == "InternalIP"))
        .map(|a| a.address.clone());
    NodeInfo { pod_cidr, internal_ip }
}

pub struct NodeHooks {
    filter: NodeFilter,
    registry: Arc<NodeRegistry>,
    allocator: Option<Arc<PodIpAllocator>>,
}

impl NodeHooks {
    pub fn new(filter: NodeFilter, registry: Arc<NodeRegistry>, allocator: Option<Arc<PodIpAllocator>>) -> Self {
        Self { filter, registry, allocator }
    }
}

impl StageHooks<Node> for NodeHooks {
    /// Managed nodes are recorded in the registry even when their status is
    /// disregarded, so their pods are still handled.
    fn needs_management(&self, node: &Node) -> bool {
        let (labels, annotations) = (node.labels(), node.annotations());
        if !self.filter.manages(labels, annotations) {
            return false;
        }
        if self.registry.insert(&node.name_any(), node_info(node)) {
            tracing::info!(node = %node.name_any(), "node managed");
        }
        !self.filter.disregards(labels, annotations)
    }

    fn forget(&self, node: &Node) {
        let name = node.name_any();
        if self.registry.remove(&name).is_some() {
            tracing::info!(node = %name, "node released");
        }
        if let Some(a) = &self.allocator {
            a.forget_node(&name);
        }
    }
}

fn node_name(state: &State) -> Result<String, minijinja::Error> {
    state_str(state, "metadata", "name")
}

/// Renderer with `NodeIP()` and `NodeName()`.
pub fn node_renderer(node_ip: &str) -> Renderer {
    let mut r = Renderer::new();
    let ip = node_ip.to_string();
    let env = r.environment_mut();
    env.add_function("NodeIP", move || ip.clone());
    env.add_function("NodeName", node_name);
    r
}

/// Builder for the `Node` stage controller.
pub fn node_controller(
    client: Arc<dyn ObjectClient<Node>>,
    selection: &NodeSelection,
    registry: Arc<NodeRegistry>,
    allocator: Option<Arc<PodIpAllocator>>,
    node_ip: &str,
) -> Result<ControllerBuilder<Node>, ConfigError> {
    let hooks = NodeHooks::new(NodeFilter::compile(selection)?, registry, allocator);
    Ok(StageController::builder("Node", client).hooks(Arc::new(hooks)).renderer(node_renderer(node_ip)))
}
