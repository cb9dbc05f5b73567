//! Fakelet controllers: the generic stage state machine and its node, pod
//! and custom-resource instantiations.

#![forbid(unsafe_code)]

mod allocator;
mod config;
mod controller;
mod custom;
mod error;
mod hooks;
mod ippool;
mod job;
mod node;
mod pod;
mod registry;
mod template;

pub use allocator::PodIpAllocator;
pub use config::{ControllerConfig, NodeSelection};
pub use controller::{ControllerBuilder, StageController, WeakStageController};
pub use custom::custom_controller;
pub use error::{ApplyError, IpPoolError};
pub use hooks::{ManageAll, StageHooks};
pub use ippool::IpPool;
pub use job::{ApplyStep, StageJob};
pub use node::{node_controller, node_info, node_renderer, NodeFilter, NodeHooks};
pub use pod::{pod_controller, pod_renderer, PodHooks};
pub use registry::{NodeInfo, NodeRegistry};
