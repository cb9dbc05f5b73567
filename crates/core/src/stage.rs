//! Stage configuration shape as loaded from YAML/JSON.
//!
//! These types are plain data: they are validated and compiled by
//! `fakelet-lifecycle` and never mutated after parse.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::PatchKind;

pub const STAGE_API_VERSION: &str = "fakelet.dev/v1alpha1";
pub const STAGE_KIND: &str = "Stage";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub metadata: StageMeta,
    pub spec: StageSpec,
}

impl Stage {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageMeta {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageSpec {
    pub resource_ref: ResourceRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<SelectorSpec>,
    /// Relative weight among stages matching the same object.
    #[serde(default)]
    pub weight: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<DelaySpec>,
    #[serde(default)]
    pub next: NextSpec,
}

/// Target kind, e.g. `{apiGroup: v1, kind: Pod}` or `{apiGroup: example.io/v1, kind: Widget}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    #[serde(default = "default_api_group")]
    pub api_group: String,
    pub kind: String,
}

fn default_api_group() -> String {
    "v1".to_string()
}

impl ResourceRef {
    pub fn new(api_group: &str, kind: &str) -> Self {
        Self { api_group: api_group.to_string(), kind: kind.to_string() }
    }

    /// `(group, version)` split of `apiGroup`; core resources have an empty group.
    pub fn group_version(&self) -> (&str, &str) {
        match self.api_group.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", self.api_group.as_str()),
        }
    }

    pub fn is_core(&self, kind: &str) -> bool {
        self.group_version().0.is_empty() && self.kind == kind
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectorSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<ExpressionSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpressionSpec {
    /// Path query into the object, e.g. `.status.phase`.
    pub key: String,
    pub operator: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelaySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_milliseconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_from: Option<ExpressionFrom>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter_duration_milliseconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter_duration_from: Option<ExpressionFrom>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpressionFrom {
    pub expression_from: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patches: Vec<PatchSpec>,
    /// Shorthand for a patch with `subresource: status` and `root: status`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalizers: Option<FinalizersSpec>,
    #[serde(default)]
    pub delete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<EventSpec>,
    #[serde(default)]
    pub immediate_next_stage: bool,
}

impl NextSpec {
    /// Patches in application order, `statusTemplate` first.
    pub fn effective_patches(&self) -> Vec<PatchSpec> {
        let mut out = Vec::with_capacity(self.patches.len() + 1);
        if let Some(t) = &self.status_template {
            out.push(PatchSpec {
                template: t.clone(),
                subresource: Some("status".to_string()),
                root: Some("status".to_string()),
                kind: PatchKind::Merge,
            });
        }
        out.extend(self.patches.iter().cloned());
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchSpec {
    pub template: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subresource: Option<String>,
    /// Dot-separated path the rendered document is nested under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: PatchKind,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalizersSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub add: Vec<FinalizerItem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<FinalizerItem>,
    #[serde(default)]
    pub empty: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizerItem {
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSpec {
    #[serde(default = "default_event_type", rename = "type")]
    pub type_: String,
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

fn default_event_type() -> String {
    "Normal".to_string()
}
