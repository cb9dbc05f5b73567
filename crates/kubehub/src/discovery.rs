use anyhow::{anyhow, Result};
use fakelet_core::stage::ResourceRef;
use kube::core::ApiResource;
use kube::discovery::{Discovery, Scope};
use kube::Client;
use tracing::info;

/// Resolve a stage's `resourceRef` to a served API resource and its scope.
pub async fn find_api_resource(client: Client, resource: &ResourceRef) -> Result<(ApiResource, bool)> {
    let (group, version) = resource.group_version();
    let discovery = Discovery::new(client).filter(&[group]).run().await?;
    for g in discovery.groups() {
        for (ar, caps) in g.versioned_resources(version) {
            if ar.kind == resource.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                info!(group, version, kind = %ar.kind, plural = %ar.plural, namespaced, "resource discovered");
                return Ok((ar, namespaced));
            }
        }
    }
    Err(anyhow!("resource not served: {}/{}", resource.api_group, resource.kind))
}
