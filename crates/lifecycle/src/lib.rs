//! Fakelet lifecycle: compiled stages for one resource kind and the matcher
//! that picks which stage applies to an observed object.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use fakelet_core::stage::{ResourceRef, Stage};
use fakelet_core::{ConfigError, EvalError, StageObject};
use serde_json::Value;
use tracing::trace;

mod delay;
pub mod path;
pub mod random;
pub mod selector;
mod stage;

pub use delay::parse_go_duration;
pub use random::{RandomSource, SeededRandom, ThreadRandom};
pub use selector::LabelSelector;
pub use stage::LifecycleStage;

/// Ordered, immutable set of compiled stages. Replaced wholesale on reload.
#[derive(Clone)]
pub struct Lifecycle {
    stages: Vec<Arc<LifecycleStage>>,
    random: Arc<dyn RandomSource>,
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle").field("stages", &self.stage_names()).finish()
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self { stages: Vec::new(), random: Arc::new(ThreadRandom) }
    }
}

impl Lifecycle {
    pub fn compile(stages: &[Stage]) -> Result<Self, ConfigError> {
        Self::compile_with_random(stages, Arc::new(ThreadRandom))
    }

    pub fn compile_with_random(stages: &[Stage], random: Arc<dyn RandomSource>) -> Result<Self, ConfigError> {
        let stages = stages
            .iter()
            .map(|s| LifecycleStage::compile(s).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { stages, random })
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn random(&self) -> &dyn RandomSource {
        self.random.as_ref()
    }

    /// Pick the stage for an object, or `None` when no selector matches.
    ///
    /// Several matches are resolved by a weighted draw; when every matching
    /// stage has weight zero the pick is uniform.
    pub fn match_stage(
        &self,
        labels: Option<&BTreeMap<String, String>>,
        annotations: Option<&BTreeMap<String, String>>,
        data: &Value,
    ) -> Result<Option<Arc<LifecycleStage>>, EvalError> {
        let mut hits: Vec<&Arc<LifecycleStage>> = Vec::new();
        for stage in &self.stages {
            if stage.matches(labels, annotations, data)? {
                hits.push(stage);
            }
        }
        trace!(matched = hits.len(), "stage selectors evaluated");
        Ok(match hits.as_slice() {
            [] => None,
            [one] => Some(Arc::clone(one)),
            many => Some(Arc::clone(self.pick_weighted(many))),
        })
    }

    /// [`match_stage`](Self::match_stage) over a watched object.
    pub fn match_object<K: StageObject>(&self, obj: &K) -> Result<Option<(Arc<LifecycleStage>, Value)>, EvalError> {
        let data = obj.to_json()?;
        let stage = self.match_stage(obj.labels(), obj.annotations(), &data)?;
        Ok(stage.map(|s| (s, data)))
    }

    fn pick_weighted<'a>(&self, hits: &[&'a Arc<LifecycleStage>]) -> &'a Arc<LifecycleStage> {
        let total: u64 = hits.iter().map(|s| s.weight()).sum();
        if total == 0 {
            let i = self.random.below(hits.len() as u64) as usize;
            return hits[i];
        }
        let mut off = self.random.below(total) as i128;
        for s in hits.iter().copied() {
            off -= i128::from(s.weight());
            if off < 0 {
                return s;
            }
        }
        // last stage when the walk never goes negative
        hits[hits.len() - 1]
    }
}

/// Split a mixed stage list into per-kind groups, preserving order.
pub fn group_by_resource(stages: Vec<Stage>) -> BTreeMap<ResourceRef, Vec<Stage>> {
    let mut out: BTreeMap<ResourceRef, Vec<Stage>> = BTreeMap::new();
    for s in stages {
        out.entry(s.spec.resource_ref.clone()).or_default().push(s);
    }
    out
}
