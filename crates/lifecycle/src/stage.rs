use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fakelet_core::stage::{NextSpec, ResourceRef, Stage};
use fakelet_core::{ConfigError, EvalError};
use serde_json::Value;

use crate::delay::Delay;
use crate::random::RandomSource;
use crate::selector::Selector;

/// A stage after validation: selector and delay compiled, effect kept as data.
#[derive(Debug, Clone)]
pub struct LifecycleStage {
    name: String,
    resource_ref: ResourceRef,
    selector: Selector,
    weight: u64,
    delay: Option<Delay>,
    next: NextSpec,
}

impl LifecycleStage {
    pub fn compile(stage: &Stage) -> Result<Self, ConfigError> {
        let name = stage.name();
        if stage.spec.resource_ref.kind.is_empty() {
            return Err(ConfigError::InvalidStage { stage: name.to_string(), reason: "resourceRef.kind is empty".into() });
        }
        let next = &stage.spec.next;
        if next.delete && (!next.patches.is_empty() || next.status_template.is_some()) {
            return Err(ConfigError::InvalidStage {
                stage: name.to_string(),
                reason: "next.delete cannot be combined with patches".into(),
            });
        }
        Ok(Self {
            name: name.to_string(),
            resource_ref: stage.spec.resource_ref.clone(),
            selector: Selector::compile(name, stage.spec.selector.as_ref())?,
            weight: u64::try_from(stage.spec.weight).unwrap_or(0),
            delay: Delay::compile(name, stage.spec.delay.as_ref())?,
            next: next.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resource_ref(&self) -> &ResourceRef {
        &self.resource_ref
    }

    /// Share of the weighted draw; negative configured weights count as zero.
    pub fn weight(&self) -> u64 {
        self.weight
    }

    pub fn next(&self) -> &NextSpec {
        &self.next
    }

    pub fn immediate_next_stage(&self) -> bool {
        self.next.immediate_next_stage
    }

    pub fn matches(
        &self,
        labels: Option<&BTreeMap<String, String>>,
        annotations: Option<&BTreeMap<String, String>>,
        data: &Value,
    ) -> Result<bool, EvalError> {
        self.selector.matches(labels, annotations, data)
    }

    /// How long to wait before applying; `None` when the stage has no delay.
    pub fn delay(
        &self,
        data: &Value,
        now: DateTime<Utc>,
        rng: &dyn RandomSource,
    ) -> Result<Option<Duration>, EvalError> {
        match &self.delay {
            Some(d) => d.eval(data, now, rng),
            None => Ok(None),
        }
    }
}
