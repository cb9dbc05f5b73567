use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use fakelet_core::ObjectKey;
use fakelet_lifecycle::LifecycleStage;

/// Where a stage application resumes after a retryable failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ApplyStep {
    #[default]
    Event,
    Finalizers,
    /// Delete, or the rendered patches.
    Effect,
}

/// One scheduled stage application for one object.
///
/// Identity is the job id alone, so the queue can cancel exactly this job
/// while a newer one for the same key is waiting.
#[derive(Clone)]
pub struct StageJob<K> {
    pub id: u64,
    pub key: ObjectKey,
    pub object: K,
    pub stage: Arc<LifecycleStage>,
    pub retry_count: u32,
    pub step: ApplyStep,
}

impl<K> StageJob<K> {
    pub fn new(id: u64, key: ObjectKey, object: K, stage: Arc<LifecycleStage>) -> Self {
        Self { id, key, object, stage, retry_count: 0, step: ApplyStep::Event }
    }

    /// Same job, resumed at `step` against the latest known object.
    pub fn retry(self, step: ApplyStep, object: K) -> Self {
        Self { retry_count: self.retry_count + 1, step, object, ..self }
    }
}

impl<K> PartialEq for StageJob<K> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<K> Eq for StageJob<K> {}

impl<K> Hash for StageJob<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<K> fmt::Debug for StageJob<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageJob")
            .field("id", &self.id)
            .field("key", &self.key.to_string())
            .field("stage", &self.stage.name())
            .field("retry_count", &self.retry_count)
            .field("step", &self.step)
            .finish()
    }
}
