//! Fakelet core types: object identity, watch events, patches, sinks.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub mod error;
pub mod stage;

pub use error::{ClientError, ConfigError, EvalError};

/// Stable identity of a watched object: `namespace/name` or just `name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.filter(|ns| !ns.is_empty()).map(str::to_string), name: name.to_string() }
    }

    pub fn cluster(name: &str) -> Self {
        Self { namespace: None, name: name.to_string() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// One observation from the resource stream feeding a controller.
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    /// Re-list of an object already known (watch restart / periodic resync).
    Sync(K),
}

impl<K> WatchEvent<K> {
    pub fn object(&self) -> &K {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) | WatchEvent::Sync(o) => o,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PatchKind {
    /// RFC 7386 JSON merge patch.
    #[default]
    Merge,
    /// Kubernetes strategic merge patch.
    #[serde(alias = "strategic")]
    StrategicMerge,
}

impl PatchKind {
    pub fn content_type(&self) -> &'static str {
        match self {
            PatchKind::Merge => "application/merge-patch+json",
            PatchKind::StrategicMerge => "application/strategic-merge-patch+json",
        }
    }
}

/// A rendered patch ready to be sent to the API server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchData {
    pub kind: PatchKind,
    pub subresource: Option<String>,
    pub body: serde_json::Value,
}

impl PatchData {
    pub fn merge(body: serde_json::Value) -> Self {
        Self { kind: PatchKind::Merge, subresource: None, body }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing a Value cannot fail: keys are always strings.
        serde_json::to_vec(&self.body).unwrap_or_default()
    }
}

/// Capabilities the stage engine needs from a watched object.
///
/// Implemented for every kube resource, which covers typed objects
/// (`Node`, `Pod`) and `DynamicObject` alike.
pub trait StageObject: Clone + Send + Sync + 'static {
    fn key(&self) -> ObjectKey;
    fn resource_version(&self) -> Option<&str>;
    fn labels(&self) -> Option<&BTreeMap<String, String>>;
    fn annotations(&self) -> Option<&BTreeMap<String, String>>;
    fn finalizers(&self) -> &[String];
    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error>;
}

impl<K> StageObject for K
where
    K: kube::Resource + Serialize + Clone + Send + Sync + 'static,
{
    fn key(&self) -> ObjectKey {
        let meta = self.meta();
        ObjectKey::new(meta.namespace.as_deref(), meta.name.as_deref().unwrap_or_default())
    }

    fn resource_version(&self) -> Option<&str> {
        self.meta().resource_version.as_deref()
    }

    fn labels(&self) -> Option<&BTreeMap<String, String>> {
        self.meta().labels.as_ref()
    }

    fn annotations(&self) -> Option<&BTreeMap<String, String>> {
        self.meta().annotations.as_ref()
    }

    fn finalizers(&self) -> &[String] {
        self.meta().finalizers.as_deref().unwrap_or(&[])
    }

    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// Write side of the API server as seen by a controller.
#[async_trait::async_trait]
pub trait ObjectClient<K>: Send + Sync {
    /// Apply `patch` to the object and return the updated object.
    async fn patch(&self, key: &ObjectKey, patch: &PatchData) -> Result<K, ClientError>;

    async fn delete(&self, key: &ObjectKey) -> Result<(), ClientError>;
}

/// Sink for stage events (`next.event`).
#[async_trait::async_trait]
pub trait EventRecorder<K>: Send + Sync {
    async fn record(&self, object: &K, event: &stage::EventSpec) -> Result<(), ClientError>;
}

/// Recorder that drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRecorder;

#[async_trait::async_trait]
impl<K: Send + Sync> EventRecorder<K> for NoopRecorder {
    async fn record(&self, _object: &K, _event: &stage::EventSpec) -> Result<(), ClientError> {
        Ok(())
    }
}
