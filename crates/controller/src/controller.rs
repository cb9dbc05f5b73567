//! Generic stage controller.
//!
//! One preprocessing path turns watch events into at most one queued job
//! per object key; a pool of workers applies jobs and re-queues retryable
//! failures in the retry band after a per-key backoff.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fakelet_apply::{finalizers_patch, plan_patches, Renderer};
use fakelet_core::{EvalError, EventRecorder, NoopRecorder, ObjectClient, ObjectKey, StageObject, WatchEvent};
use fakelet_lifecycle::Lifecycle;
use fakelet_queue::{BackoffSet, WeightedDelayingQueue, FRESH_WEIGHT, RETRY_WEIGHT};
use futures::{Stream, StreamExt};
use metrics::{counter, histogram};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::error::ApplyError;
use crate::hooks::{ManageAll, StageHooks};
use crate::job::{ApplyStep, StageJob};

pub struct ControllerBuilder<K> {
    kind: String,
    client: Arc<dyn ObjectClient<K>>,
    lifecycle: Lifecycle,
    recorder: Arc<dyn EventRecorder<K>>,
    renderer: Arc<Renderer>,
    hooks: Arc<dyn StageHooks<K>>,
    config: ControllerConfig,
    on_build: Vec<Box<dyn FnOnce(&StageController<K>) + Send>>,
}

impl<K: StageObject> ControllerBuilder<K> {
    pub fn lifecycle(mut self, lifecycle: Lifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn recorder(mut self, recorder: Arc<dyn EventRecorder<K>>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn renderer(mut self, renderer: Renderer) -> Self {
        self.renderer = Arc::new(renderer);
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn StageHooks<K>>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Run `f` with the controller once it is built.
    pub fn on_build(mut self, f: impl FnOnce(&StageController<K>) + Send + 'static) -> Self {
        self.on_build.push(Box::new(f));
        self
    }

    /// Create the controller and its queue. Must run inside a tokio runtime;
    /// everything stops when `done` is cancelled.
    pub fn build(self, done: CancellationToken) -> StageController<K> {
        let backoff = BackoffSet::new(self.config.backoff);
        let ctrl = StageController {
            inner: Arc::new(Inner {
                kind: self.kind,
                client: self.client,
                recorder: self.recorder,
                renderer: self.renderer,
                hooks: self.hooks,
                config: self.config,
                lifecycle: ArcSwap::from_pointee(self.lifecycle),
                queue: WeightedDelayingQueue::new(done.clone()),
                pending: DashMap::new(),
                backoff,
                next_id: AtomicU64::new(1),
                done,
            }),
        };
        for f in self.on_build {
            f(&ctrl);
        }
        ctrl
    }
}

struct Inner<K> {
    kind: String,
    client: Arc<dyn ObjectClient<K>>,
    recorder: Arc<dyn EventRecorder<K>>,
    renderer: Arc<Renderer>,
    hooks: Arc<dyn StageHooks<K>>,
    config: ControllerConfig,
    lifecycle: ArcSwap<Lifecycle>,
    queue: WeightedDelayingQueue<StageJob<K>>,
    /// The one live job per key that has not been dequeued yet.
    pending: DashMap<ObjectKey, StageJob<K>>,
    backoff: BackoffSet<ObjectKey>,
    next_id: AtomicU64,
    done: CancellationToken,
}

/// Drives stages for one resource kind. Cloning yields another handle.
pub struct StageController<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for StageController<K> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

/// Handle that does not keep the controller alive.
pub struct WeakStageController<K> {
    inner: Weak<Inner<K>>,
}

impl<K> WeakStageController<K> {
    pub fn upgrade(&self) -> Option<StageController<K>> {
        self.inner.upgrade().map(|inner| StageController { inner })
    }
}

enum Outcome<K> {
    Applied(K),
    Unchanged,
    Deleted,
    /// Object disappeared under us.
    Gone,
}

struct StepFailure<K> {
    step: ApplyStep,
    object: K,
    error: ApplyError,
}

impl<K: Clone> StepFailure<K> {
    fn new(step: ApplyStep, object: &K, error: impl Into<ApplyError>) -> Self {
        Self { step, object: object.clone(), error: error.into() }
    }
}

impl<K: StageObject> StageController<K> {
    pub fn builder(kind: &str, client: Arc<dyn ObjectClient<K>>) -> ControllerBuilder<K> {
        ControllerBuilder {
            kind: kind.to_string(),
            client,
            lifecycle: Lifecycle::default(),
            recorder: Arc::new(NoopRecorder),
            renderer: Arc::new(Renderer::new()),
            hooks: Arc::new(ManageAll),
            config: ControllerConfig::default(),
            on_build: Vec::new(),
        }
    }

    pub fn kind(&self) -> &str {
        &self.inner.kind
    }

    /// Swap in a new stage set. Jobs already queued keep the stage they matched.
    pub fn set_lifecycle(&self, lifecycle: Lifecycle) {
        info!(kind = %self.inner.kind, stages = ?lifecycle.stage_names(), "lifecycle updated");
        self.inner.lifecycle.store(Arc::new(lifecycle));
    }

    pub fn lifecycle(&self) -> Arc<Lifecycle> {
        self.inner.lifecycle.load_full()
    }

    pub fn downgrade(&self) -> WeakStageController<K> {
        WeakStageController { inner: Arc::downgrade(&self.inner) }
    }

    /// Keys with a job waiting in the queue.
    pub fn pending(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn handle_event(&self, event: WatchEvent<K>) {
        match event {
            WatchEvent::Deleted(obj) => self.forget(&obj),
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Sync(obj) => {
                if let Err(e) = self.preprocess(&obj) {
                    warn!(kind = %self.inner.kind, key = %obj.key(), error = %e, "stage evaluation failed");
                }
            }
        }
    }

    fn forget(&self, obj: &K) {
        let inner = &self.inner;
        let key = obj.key();
        if let Some((_, job)) = inner.pending.remove(&key) {
            if inner.queue.cancel(&job) {
                debug!(kind = %inner.kind, key = %key, "pending job cancelled");
            } else {
                debug!(kind = %inner.kind, key = %key, "job already dequeued, not cancelled");
            }
        }
        inner.backoff.remove(&key);
        inner.hooks.forget(obj);
    }

    /// Match `obj` against the lifecycle and queue a fresh job, replacing any
    /// job still waiting for the same key. Returns whether a job was queued.
    pub fn preprocess(&self, obj: &K) -> Result<bool, EvalError> {
        let inner = &self.inner;
        if !inner.hooks.needs_management(obj) {
            return Ok(false);
        }
        let key = obj.key();
        if let (Some(rv), Some(queued)) = (obj.resource_version(), inner.pending.get(&key)) {
            if queued.object.resource_version() == Some(rv) {
                debug!(kind = %inner.kind, key = %key, rv, "unchanged since queued");
                return Ok(false);
            }
        }
        inner.hooks.observe(obj);

        let lifecycle = inner.lifecycle.load();
        let Some((stage, data)) = lifecycle.match_object(obj)? else {
            debug!(kind = %inner.kind, key = %key, "no stage matches");
            return Ok(false);
        };
        let delay = stage.delay(&data, Utc::now(), lifecycle.random())?.unwrap_or(Duration::ZERO);
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(kind = %inner.kind, key = %key, stage = stage.name(), delay = ?delay, "job queued");
        let job = StageJob::new(id, key.clone(), obj.clone(), stage);

        // insert, cancel and enqueue under the entry lock: one live job per key
        match inner.pending.entry(key) {
            Entry::Occupied(mut e) => {
                let stale = e.insert(job.clone());
                inner.queue.cancel(&stale);
                inner.queue.add_weight_after(job, FRESH_WEIGHT, delay);
            }
            Entry::Vacant(v) => {
                v.insert(job.clone());
                inner.queue.add_weight_after(job, FRESH_WEIGHT, delay);
            }
        }
        counter!("stage_jobs_enqueued_total", 1, "kind" => inner.kind.clone());
        Ok(true)
    }

    pub fn spawn_workers(&self) -> Vec<JoinHandle<()>> {
        (0..self.inner.config.workers.max(1))
            .map(|i| {
                let this = self.clone();
                tokio::spawn(async move { this.worker(i).await })
            })
            .collect()
    }

    async fn worker(self, id: usize) {
        let done = self.inner.done.clone();
        while let Some(job) = self.inner.queue.get_or_wait(&done).await {
            self.take(&job);
            self.process(job).await;
        }
        debug!(kind = %self.inner.kind, worker = id, "worker stopped");
    }

    fn take(&self, job: &StageJob<K>) {
        self.inner.pending.remove_if(&job.key, |_, queued| queued.id == job.id);
    }

    /// Apply every job that is ready right now, one at a time.
    pub async fn process_ready(&self) -> usize {
        let mut n = 0;
        while let Some(job) = self.inner.queue.try_get() {
            self.take(&job);
            self.process(job).await;
            n += 1;
        }
        n
    }

    /// Consume `events` as the preprocessing loop and run the worker pool
    /// until `done` fires.
    pub async fn run<S>(self, events: S)
    where
        S: Stream<Item = WatchEvent<K>> + Send,
    {
        let workers = self.spawn_workers();
        let done = self.inner.done.clone();
        info!(kind = %self.inner.kind, workers = workers.len(), stages = self.lifecycle().len(), "stage controller started");
        futures::pin_mut!(events);
        loop {
            tokio::select! {
                _ = done.cancelled() => break,
                ev = events.next() => match ev {
                    Some(ev) => self.handle_event(ev),
                    None => {
                        warn!(kind = %self.inner.kind, "event stream ended");
                        done.cancelled().await;
                        break;
                    }
                },
            }
        }
        for w in workers {
            let _ = w.await;
        }
        info!(kind = %self.inner.kind, "stage controller stopped");
    }

    async fn process(&self, job: StageJob<K>) {
        let inner = &self.inner;
        let started = Instant::now();
        let result = self.apply(&job).await;
        histogram!("stage_apply_latency_ms", started.elapsed().as_secs_f64() * 1000.0, "kind" => inner.kind.clone());
        let stage = job.stage.name();
        match result {
            Ok(outcome) => {
                inner.backoff.remove(&job.key);
                match outcome {
                    Outcome::Applied(obj) => {
                        counter!("stage_apply_ok_total", 1, "kind" => inner.kind.clone(), "stage" => stage.to_string());
                        info!(kind = %inner.kind, key = %job.key, stage, retries = job.retry_count, "stage applied");
                        if job.stage.immediate_next_stage() && obj.resource_version() != job.object.resource_version() {
                            if let Err(e) = self.preprocess(&obj) {
                                warn!(kind = %inner.kind, key = %job.key, error = %e, "stage evaluation failed");
                            }
                        }
                    }
                    Outcome::Unchanged => {
                        counter!("stage_apply_noop_total", 1, "kind" => inner.kind.clone());
                        debug!(kind = %inner.kind, key = %job.key, stage, "stage already in effect");
                    }
                    Outcome::Deleted => {
                        counter!("stage_apply_ok_total", 1, "kind" => inner.kind.clone(), "stage" => stage.to_string());
                        info!(kind = %inner.kind, key = %job.key, stage, "object deleted");
                    }
                    Outcome::Gone => debug!(kind = %inner.kind, key = %job.key, stage, "object gone"),
                }
            }
            Err(fail) => self.retry_or_drop(job, fail),
        }
    }

    fn retry_or_drop(&self, job: StageJob<K>, fail: StepFailure<K>) {
        let inner = &self.inner;
        let limit = inner.config.retry_limit;
        let key = job.key.clone();
        let stage = job.stage.name().to_string();
        if !fail.error.is_retryable() || (limit > 0 && job.retry_count >= limit) {
            counter!("stage_apply_dropped_total", 1, "kind" => inner.kind.clone());
            error!(kind = %inner.kind, key = %key, stage = %stage, retries = job.retry_count, error = %fail.error, "stage failed, job dropped");
            inner.backoff.remove(&key);
            return;
        }
        let delay = inner.backoff.add_or_update(&key);
        let retry = job.retry(fail.step, fail.object);
        match inner.pending.entry(key.clone()) {
            Entry::Occupied(_) => {
                debug!(kind = %inner.kind, key = %key, stage = %stage, "newer job queued, retry skipped");
            }
            Entry::Vacant(v) => {
                let attempt = retry.retry_count;
                v.insert(retry.clone());
                inner.queue.add_weight_after(retry, RETRY_WEIGHT, delay);
                counter!("stage_apply_retry_total", 1, "kind" => inner.kind.clone());
                warn!(
                    kind = %inner.kind, key = %key, stage = %stage, attempt, delay = ?delay,
                    error = %fail.error, "stage failed, retrying"
                );
            }
        }
    }

    async fn apply(&self, job: &StageJob<K>) -> Result<Outcome<K>, StepFailure<K>> {
        let inner = &self.inner;
        let next = job.stage.next();
        let key = &job.key;
        let mut current = job.object.clone();
        let mut changed = false;

        if job.step <= ApplyStep::Event {
            if let Some(event) = &next.event {
                match inner.recorder.record(&current, event).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => return Ok(Outcome::Gone),
                    Err(e) => return Err(StepFailure::new(ApplyStep::Event, &current, e)),
                }
            }
        }

        if job.step <= ApplyStep::Finalizers {
            if let Some(spec) = &next.finalizers {
                if let Some(patch) = finalizers_patch(current.finalizers(), spec) {
                    match inner.client.patch(key, &patch).await {
                        Ok(obj) => {
                            current = obj;
                            changed = true;
                        }
                        Err(e) if e.is_not_found() => return Ok(Outcome::Gone),
                        Err(e) => return Err(StepFailure::new(ApplyStep::Finalizers, &current, e)),
                    }
                }
            }
        }

        if next.delete {
            return match inner.client.delete(key).await {
                Ok(()) => Ok(Outcome::Deleted),
                Err(e) if e.is_not_found() => Ok(Outcome::Gone),
                Err(e) => Err(StepFailure::new(ApplyStep::Effect, &current, e)),
            };
        }

        let data = current.to_json().map_err(|e| StepFailure::new(ApplyStep::Effect, &current, EvalError::from(e)))?;
        let patches =
            plan_patches(&inner.renderer, next, &data).map_err(|e| StepFailure::new(ApplyStep::Effect, &current, e))?;
        for patch in &patches {
            match inner.client.patch(key, patch).await {
                Ok(obj) => {
                    current = obj;
                    changed = true;
                }
                Err(e) if e.is_not_found() => return Ok(Outcome::Gone),
                Err(e) => return Err(StepFailure::new(ApplyStep::Effect, &current, e)),
            }
        }
        Ok(if changed { Outcome::Applied(current) } else { Outcome::Unchanged })
    }
}
