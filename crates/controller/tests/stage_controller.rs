#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fakelet_apply::apply_local;
use fakelet_controller::{ControllerConfig, StageController};
use fakelet_core::stage::{EventSpec, Stage};
use fakelet_core::{ClientError, EventRecorder, ObjectClient, ObjectKey, PatchData, WatchEvent};
use fakelet_lifecycle::{Lifecycle, SeededRandom};
use fakelet_queue::BackoffConfig;
use kube::core::DynamicObject;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

/// In-memory API server: merge-patches stored JSON, bumps resourceVersion,
/// counts writes, and can be told to fail the next calls.
#[derive(Default)]
struct FakeClient {
    objects: Mutex<BTreeMap<ObjectKey, Value>>,
    writes: AtomicUsize,
    deletes: AtomicUsize,
    failures: Mutex<VecDeque<ClientError>>,
}

impl FakeClient {
    fn insert(&self, obj: &Value) -> DynamicObject {
        let o: DynamicObject = serde_json::from_value(obj.clone()).unwrap();
        let key = ObjectKey::new(o.metadata.namespace.as_deref(), o.metadata.name.as_deref().unwrap());
        self.objects.lock().unwrap().insert(key, obj.clone());
        o
    }

    fn get(&self, name: &str) -> Option<Value> {
        self.objects.lock().unwrap().get(&key(name)).cloned()
    }

    fn get_object(&self, name: &str) -> DynamicObject {
        serde_json::from_value(self.get(name).unwrap()).unwrap()
    }

    fn fail_next(&self, errors: impl IntoIterator<Item = ClientError>) {
        self.failures.lock().unwrap().extend(errors);
    }

    fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> Result<(), ClientError> {
        match self.failures.lock().unwrap().pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ObjectClient<DynamicObject> for FakeClient {
    async fn patch(&self, key: &ObjectKey, patch: &PatchData) -> Result<DynamicObject, ClientError> {
        self.take_failure()?;
        let mut objects = self.objects.lock().unwrap();
        let cur = objects.get_mut(key).ok_or_else(|| ClientError::NotFound(key.to_string()))?;
        let mut next = apply_local(cur, patch);
        let rv: u64 = next["metadata"]["resourceVersion"].as_str().unwrap_or("0").parse().unwrap();
        next["metadata"]["resourceVersion"] = json!((rv + 1).to_string());
        *cur = next.clone();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(serde_json::from_value(next).unwrap())
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), ClientError> {
        self.take_failure()?;
        self.objects.lock().unwrap().remove(key).ok_or_else(|| ClientError::NotFound(key.to_string()))?;
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct Events(Mutex<Vec<String>>);

#[async_trait]
impl EventRecorder<DynamicObject> for Events {
    async fn record(&self, object: &DynamicObject, event: &EventSpec) -> Result<(), ClientError> {
        let name = object.metadata.name.clone().unwrap_or_default();
        self.0.lock().unwrap().push(format!("{} {} {}", name, event.type_, event.reason));
        Ok(())
    }
}

fn key(name: &str) -> ObjectKey {
    ObjectKey::new(Some("default"), name)
}

fn widget(name: &str, rv: &str, phase: &str) -> Value {
    json!({
        "apiVersion": "example.io/v1",
        "kind": "Widget",
        "metadata": {"name": name, "namespace": "default", "resourceVersion": rv},
        "status": {"phase": phase}
    })
}

fn lifecycle(yaml: &str) -> Lifecycle {
    let stages: Vec<Stage> =
        serde_yaml::Deserializer::from_str(yaml).map(|d| serde::Deserialize::deserialize(d).unwrap()).collect();
    Lifecycle::compile_with_random(&stages, Arc::new(SeededRandom::new(1))).unwrap()
}

fn quick_retries() -> ControllerConfig {
    ControllerConfig {
        backoff: BackoffConfig {
            initial: Duration::from_millis(100),
            factor: 2.0,
            jitter: 0.0,
            max: Duration::from_secs(1),
        },
        ..Default::default()
    }
}

fn controller(client: &Arc<FakeClient>, stages: &str, config: ControllerConfig) -> StageController<DynamicObject> {
    StageController::<DynamicObject>::builder("Widget", Arc::clone(client) as Arc<dyn ObjectClient<DynamicObject>>)
        .lifecycle(lifecycle(stages))
        .config(config)
        .build(CancellationToken::new())
}

const MAKE_AVAILABLE: &str = r#"
metadata: {name: available}
spec:
  resourceRef: {apiGroup: example.io/v1, kind: Widget}
  selector:
    matchExpressions:
    - {key: .status.phase, operator: NotIn, values: [Available]}
  next:
    statusTemplate: "phase: Available"
"#;

#[tokio::test(start_paused = true)]
async fn pending_widget_converges_in_one_cycle() {
    let client = Arc::new(FakeClient::default());
    let obj = client.insert(&widget("w", "1", "Pending"));
    let c = controller(&client, MAKE_AVAILABLE, ControllerConfig::default());

    c.handle_event(WatchEvent::Added(obj));
    assert_eq!(c.pending(), 1);
    assert_eq!(c.process_ready().await, 1);
    assert_eq!(client.writes(), 1);
    assert_eq!(client.get("w").unwrap()["status"]["phase"], "Available");

    // the watch echo of our own write no longer matches
    c.handle_event(WatchEvent::Modified(client.get_object("w")));
    assert_eq!(c.pending(), 0);
    assert_eq!(c.process_ready().await, 0);
    assert_eq!(client.writes(), 1);
}

#[tokio::test(start_paused = true)]
async fn already_applied_patch_issues_no_write() {
    let client = Arc::new(FakeClient::default());
    let obj = client.insert(&widget("w", "1", "Available"));
    let always = r#"
metadata: {name: always}
spec:
  resourceRef: {apiGroup: example.io/v1, kind: Widget}
  next: {statusTemplate: "phase: Available"}
"#;
    let c = controller(&client, always, ControllerConfig::default());
    c.handle_event(WatchEvent::Sync(obj));
    assert_eq!(c.process_ready().await, 1);
    assert_eq!(client.writes(), 0);
}

const DELAYED: &str = r#"
metadata: {name: delayed}
spec:
  resourceRef: {apiGroup: example.io/v1, kind: Widget}
  delay: {durationMilliseconds: 1000}
  next:
    patches:
    - template: "seen: '{{ metadata.resourceVersion }}'"
      root: status
      subresource: status
"#;

#[tokio::test(start_paused = true)]
async fn newer_observation_replaces_queued_job() {
    let client = Arc::new(FakeClient::default());
    client.insert(&widget("w", "1", "Pending"));
    let c = controller(&client, DELAYED, ControllerConfig::default());

    c.handle_event(WatchEvent::Added(serde_json::from_value(widget("w", "1", "Pending")).unwrap()));
    c.handle_event(WatchEvent::Modified(serde_json::from_value(widget("w", "1", "Pending")).unwrap()));
    assert!(!c.preprocess(&serde_json::from_value(widget("w", "1", "Pending")).unwrap()).unwrap());
    c.handle_event(WatchEvent::Modified(serde_json::from_value(widget("w", "2", "Pending")).unwrap()));
    assert_eq!(c.pending(), 1);

    assert_eq!(c.process_ready().await, 0);
    tokio::time::advance(Duration::from_millis(1001)).await;
    assert_eq!(c.process_ready().await, 1);
    assert_eq!(client.writes(), 1);
    assert_eq!(client.get("w").unwrap()["status"]["seen"], "2");
}

const MARK: &str = r#"
metadata: {name: mark}
spec:
  resourceRef: {apiGroup: example.io/v1, kind: Widget}
  selector:
    matchExpressions:
    - {key: .status.phase, operator: NotIn, values: [Marked]}
  next:
    statusTemplate: "phase: Marked"
"#;

#[tokio::test(start_paused = true)]
async fn swapped_lifecycle_applies_to_new_observations_only() {
    let client = Arc::new(FakeClient::default());
    let obj = client.insert(&widget("w", "1", "Pending"));
    let c = controller(&client, DELAYED, ControllerConfig::default());
    c.handle_event(WatchEvent::Added(obj));
    assert_eq!(c.pending(), 1);

    c.set_lifecycle(lifecycle(MARK));
    assert_eq!(c.lifecycle().stage_names(), ["mark"]);

    // the queued job keeps the stage it matched
    tokio::time::advance(Duration::from_millis(1001)).await;
    assert_eq!(c.process_ready().await, 1);
    let after = client.get("w").unwrap();
    assert_eq!(after["status"]["seen"], "1");
    assert_eq!(after["status"]["phase"], "Pending");

    c.handle_event(WatchEvent::Modified(client.get_object("w")));
    assert_eq!(c.pending(), 1);
    assert_eq!(c.process_ready().await, 1);
    let after = client.get("w").unwrap();
    assert_eq!(after["status"]["phase"], "Marked");
    assert_eq!(after["status"]["seen"], "1");
    assert_eq!(client.writes(), 2);
}

#[tokio::test(start_paused = true)]
async fn delete_cancels_pending_job() {
    let client = Arc::new(FakeClient::default());
    let obj = client.insert(&widget("w", "1", "Pending"));
    let c = controller(&client, DELAYED, ControllerConfig::default());
    c.handle_event(WatchEvent::Added(obj.clone()));
    c.handle_event(WatchEvent::Deleted(obj));
    assert_eq!(c.pending(), 0);
    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(c.process_ready().await, 0);
    assert_eq!(client.writes(), 0);
}

#[tokio::test(start_paused = true)]
async fn retryable_failures_back_off_then_succeed() {
    let client = Arc::new(FakeClient::default());
    let obj = client.insert(&widget("w", "1", "Pending"));
    client.fail_next([ClientError::Throttled("429".into()), ClientError::Conflict("409".into())]);
    let c = controller(&client, MAKE_AVAILABLE, quick_retries());

    c.handle_event(WatchEvent::Added(obj));
    assert_eq!(c.process_ready().await, 1);
    assert_eq!(c.pending(), 1, "retry is queued");
    assert_eq!(c.process_ready().await, 0, "not before the backoff");

    tokio::time::advance(Duration::from_millis(100)).await;
    assert_eq!(c.process_ready().await, 1);
    // second failure doubles the wait
    tokio::time::advance(Duration::from_millis(150)).await;
    assert_eq!(c.process_ready().await, 0);
    tokio::time::advance(Duration::from_millis(60)).await;
    assert_eq!(c.process_ready().await, 1);
    assert_eq!(client.writes(), 1);
    assert_eq!(c.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn fresh_observation_supersedes_retry() {
    let client = Arc::new(FakeClient::default());
    let obj = client.insert(&widget("w", "1", "Pending"));
    client.fail_next([ClientError::Transient("reset".into())]);
    let c = controller(&client, MAKE_AVAILABLE, quick_retries());

    c.handle_event(WatchEvent::Added(obj));
    c.process_ready().await;
    assert_eq!(c.pending(), 1);
    c.handle_event(WatchEvent::Modified(serde_json::from_value(widget("w", "5", "Pending")).unwrap()));
    assert_eq!(c.pending(), 1);
    // fresh job runs immediately; the cancelled retry never does
    assert_eq!(c.process_ready().await, 1);
    tokio::time::advance(Duration::from_secs(1)).await;
    assert_eq!(c.process_ready().await, 0);
    assert_eq!(client.writes(), 1);
}

#[tokio::test(start_paused = true)]
async fn non_retryable_failures_drop_the_job() {
    let client = Arc::new(FakeClient::default());
    let obj = client.insert(&widget("w", "1", "Pending"));
    client.fail_next([ClientError::Invalid("422".into())]);
    let c = controller(&client, MAKE_AVAILABLE, quick_retries());
    c.handle_event(WatchEvent::Added(obj));
    assert_eq!(c.process_ready().await, 1);
    assert_eq!(c.pending(), 0);
    tokio::time::advance(Duration::from_secs(5)).await;
    assert_eq!(c.process_ready().await, 0);
    assert_eq!(client.writes(), 0);
}

#[tokio::test(start_paused = true)]
async fn retry_limit_drops_after_exhaustion() {
    let client = Arc::new(FakeClient::default());
    let obj = client.insert(&widget("w", "1", "Pending"));
    client.fail_next((0..10).map(|_| ClientError::Transient("down".into())));
    let c = controller(&client, MAKE_AVAILABLE, ControllerConfig { retry_limit: 2, ..quick_retries() });
    c.handle_event(WatchEvent::Added(obj));
    let mut attempts = 0;
    for _ in 0..6 {
        attempts += c.process_ready().await;
        tokio::time::advance(Duration::from_secs(1)).await;
    }
    assert_eq!(attempts, 3);
    assert_eq!(c.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn missing_object_is_success() {
    let client = Arc::new(FakeClient::default());
    let c = controller(&client, MAKE_AVAILABLE, quick_retries());
    c.handle_event(WatchEvent::Added(serde_json::from_value(widget("ghost", "1", "Pending")).unwrap()));
    assert_eq!(c.process_ready().await, 1);
    tokio::time::advance(Duration::from_secs(1)).await;
    assert_eq!(c.process_ready().await, 0);
}

#[tokio::test(start_paused = true)]
async fn event_then_finalizers_then_delete() {
    let client = Arc::new(FakeClient::default());
    let mut w = widget("w", "1", "Terminating");
    w["metadata"]["finalizers"] = json!(["fakelet.dev/hold", "other"]);
    let obj = client.insert(&w);
    let stages = r#"
metadata: {name: reap}
spec:
  resourceRef: {apiGroup: example.io/v1, kind: Widget}
  next:
    event: {type: Normal, reason: Reaped}
    finalizers:
      remove: [{value: fakelet.dev/hold}]
    delete: true
"#;
    let events = Arc::new(Events::default());
    let c = StageController::<DynamicObject>::builder("Widget", Arc::clone(&client) as Arc<dyn ObjectClient<DynamicObject>>)
        .lifecycle(lifecycle(stages))
        .recorder(Arc::clone(&events) as Arc<dyn EventRecorder<DynamicObject>>)
        .build(CancellationToken::new());
    c.handle_event(WatchEvent::Added(obj));
    assert_eq!(c.process_ready().await, 1);
    assert_eq!(*events.0.lock().unwrap(), vec!["w Normal Reaped".to_string()]);
    assert_eq!(client.writes(), 1);
    assert_eq!(client.deletes.load(Ordering::SeqCst), 1);
    assert!(client.get("w").is_none());
}

#[tokio::test(start_paused = true)]
async fn immediate_next_stage_chains_without_watch_events() {
    let client = Arc::new(FakeClient::default());
    let obj = client.insert(&widget("w", "1", "Pending"));
    let stages = r#"
metadata: {name: start}
spec:
  resourceRef: {apiGroup: example.io/v1, kind: Widget}
  selector:
    matchExpressions:
    - {key: .status.phase, operator: In, values: [Pending]}
  next:
    statusTemplate: "phase: Running"
    immediateNextStage: true
---
metadata: {name: finish}
spec:
  resourceRef: {apiGroup: example.io/v1, kind: Widget}
  selector:
    matchExpressions:
    - {key: .status.phase, operator: In, values: [Running]}
  next:
    statusTemplate: "phase: Succeeded"
"#;
    let c = controller(&client, stages, ControllerConfig::default());
    c.handle_event(WatchEvent::Added(obj));
    assert_eq!(c.process_ready().await, 2);
    assert_eq!(client.get("w").unwrap()["status"]["phase"], "Succeeded");
    assert_eq!(client.writes(), 2);
}

#[tokio::test(start_paused = true)]
async fn workers_drain_the_queue_until_done() {
    let client = Arc::new(FakeClient::default());
    let done = CancellationToken::new();
    let c = StageController::<DynamicObject>::builder("Widget", Arc::clone(&client) as Arc<dyn ObjectClient<DynamicObject>>)
        .lifecycle(lifecycle(MAKE_AVAILABLE))
        .config(ControllerConfig::default().with_workers(3))
        .build(done.clone());
    let events: Vec<_> =
        (0..20).map(|i| WatchEvent::Added(client.insert(&widget(&format!("w{}", i), "1", "Pending")))).collect();
    let run = tokio::spawn(c.clone().run(futures::stream::iter(events)));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.writes(), 20);
    done.cancel();
    run.await.unwrap();
}
