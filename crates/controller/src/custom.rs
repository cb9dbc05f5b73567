use std::sync::Arc;

use fakelet_core::stage::ResourceRef;
use fakelet_core::ObjectClient;
use kube::core::DynamicObject;

use crate::controller::{ControllerBuilder, StageController};

/// Builder for a stage controller over an arbitrary kind, driven through
/// untyped objects.
pub fn custom_controller(
    resource: &ResourceRef,
    client: Arc<dyn ObjectClient<DynamicObject>>,
) -> ControllerBuilder<DynamicObject> {
    StageController::builder(&format!("{}.{}", resource.kind, resource.api_group), client)
}
