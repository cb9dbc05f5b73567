use async_trait::async_trait;
use fakelet_core::stage::EventSpec;
use fakelet_core::{ClientError, EventRecorder};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};

use crate::error::classify;

/// Publishes stage events as Kubernetes `Event`s regarding the object.
pub struct KubeEventRecorder<K: Resource> {
    client: Client,
    reporter: Reporter,
    dyntype: K::DynamicType,
}

impl<K: Resource> KubeEventRecorder<K> {
    pub fn new(client: Client, controller: &str, dyntype: K::DynamicType) -> Self {
        let reporter = Reporter { controller: controller.to_string(), instance: None };
        Self { client, reporter, dyntype }
    }
}

fn event_type(t: &str) -> EventType {
    if t.eq_ignore_ascii_case("warning") {
        EventType::Warning
    } else {
        EventType::Normal
    }
}

pub(crate) fn to_event(spec: &EventSpec) -> Event {
    Event {
        type_: event_type(&spec.type_),
        reason: spec.reason.clone(),
        note: (!spec.message.is_empty()).then(|| spec.message.clone()),
        action: "Stage".to_string(),
        secondary: None,
    }
}

#[async_trait]
impl<K> EventRecorder<K> for KubeEventRecorder<K>
where
    K: Resource + Send + Sync,
    K::DynamicType: Send + Sync,
{
    async fn record(&self, object: &K, event: &EventSpec) -> Result<(), ClientError> {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), object.object_ref(&self.dyntype));
        recorder.publish(to_event(event)).await.map_err(classify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_to_event() {
        let ev = to_event(&EventSpec { type_: "Warning".into(), reason: "NodeNotReady".into(), message: String::new() });
        assert!(matches!(ev.type_, EventType::Warning));
        assert_eq!(ev.reason, "NodeNotReady");
        assert!(ev.note.is_none());
        let ev = to_event(&EventSpec { type_: "Normal".into(), reason: "Started".into(), message: "ok".into() });
        assert!(matches!(ev.type_, EventType::Normal));
        assert_eq!(ev.note.as_deref(), Some("ok"));
    }
}
