use std::fmt::Debug;

use async_trait::async_trait;
use fakelet_core::{ClientError, ObjectClient, ObjectKey, PatchData, PatchKind};
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::core::{ApiResource, DynamicObject};
use kube::{Client, Resource};
use metrics::counter;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::classify;

pub const FIELD_MANAGER: &str = "fakelet";

type ApiFor<K> = Box<dyn Fn(Option<&str>) -> Api<K> + Send + Sync>;

/// `ObjectClient` backed by the kube API for one resource type.
pub struct KubeObjectClient<K> {
    kind: String,
    api_for: ApiFor<K>,
    delete_params: DeleteParams,
}

impl<K> KubeObjectClient<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    /// Cluster-scoped kind such as `Node`.
    pub fn cluster(client: Client) -> Self
    where
        K: Resource<Scope = ClusterResourceScope>,
        K::DynamicType: Default,
    {
        let kind = K::kind(&K::DynamicType::default()).into_owned();
        Self { kind, api_for: Box::new(move |_| Api::all(client.clone())), delete_params: DeleteParams::default() }
    }

    /// Namespaced kind such as `Pod`.
    pub fn namespaced(client: Client) -> Self
    where
        K: Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        let kind = K::kind(&K::DynamicType::default()).into_owned();
        let api_for: ApiFor<K> = Box::new(move |ns| match ns {
            Some(ns) => Api::namespaced(client.clone(), ns),
            None => Api::default_namespaced(client.clone()),
        });
        Self { kind, api_for, delete_params: DeleteParams::default() }
    }

    pub fn with_delete_params(mut self, params: DeleteParams) -> Self {
        self.delete_params = params;
        self
    }
}

impl KubeObjectClient<DynamicObject> {
    /// Untyped client for a discovered resource.
    pub fn dynamic(client: Client, resource: ApiResource, namespaced: bool) -> Self {
        let kind = resource.kind.clone();
        let api_for: ApiFor<DynamicObject> = Box::new(move |ns| match ns {
            Some(ns) if namespaced => Api::namespaced_with(client.clone(), ns, &resource),
            _ => Api::all_with(client.clone(), &resource),
        });
        Self { kind, api_for, delete_params: DeleteParams::default() }
    }
}

#[async_trait]
impl<K> ObjectClient<K> for KubeObjectClient<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async fn patch(&self, key: &ObjectKey, patch: &PatchData) -> Result<K, ClientError> {
        let api = (self.api_for)(key.namespace.as_deref());
        let params = PatchParams::apply(FIELD_MANAGER);
        let body = match patch.kind {
            PatchKind::Merge => Patch::Merge(&patch.body),
            PatchKind::StrategicMerge => Patch::Strategic(&patch.body),
        };
        debug!(kind = %self.kind, key = %key, subresource = ?patch.subresource, "patch");
        let result = match patch.subresource.as_deref() {
            None | Some("") => api.patch(&key.name, &params, &body).await,
            Some("status") => api.patch_status(&key.name, &params, &body).await,
            Some(sub) => api.patch_subresource(sub, &key.name, &params, &body).await,
        };
        counter!("kube_requests_total", 1, "kind" => self.kind.clone(), "verb" => "patch");
        result.map_err(classify)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), ClientError> {
        let api = (self.api_for)(key.namespace.as_deref());
        debug!(kind = %self.kind, key = %key, "delete");
        counter!("kube_requests_total", 1, "kind" => self.kind.clone(), "verb" => "delete");
        api.delete(&key.name, &self.delete_params).await.map(|_| ()).map_err(classify)
    }
}

/// Delete parameters for pods: no grace period, there is no container to stop.
pub fn immediate_delete() -> DeleteParams {
    DeleteParams { grace_period_seconds: Some(0), ..DeleteParams::default() }
}
