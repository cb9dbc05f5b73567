use std::borrow::Cow;
use std::collections::BTreeMap;
use std::str::FromStr;

use fakelet_core::stage::{ExpressionSpec, SelectorSpec};
use fakelet_core::{ConfigError, EvalError};
use serde_json::Value;
use smallvec::SmallVec;

use crate::path::Query;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

impl FromStr for Operator {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "In" => Ok(Operator::In),
            "NotIn" => Ok(Operator::NotIn),
            "Exists" => Ok(Operator::Exists),
            "DoesNotExist" => Ok(Operator::DoesNotExist),
            _ => Err(()),
        }
    }
}

/// One `matchExpressions` entry: a path query compared against a value set.
#[derive(Debug, Clone)]
pub struct Requirement {
    query: Query,
    operator: Operator,
    values: SmallVec<[String; 4]>,
}

impl Requirement {
    pub fn compile(stage: &str, spec: &ExpressionSpec) -> Result<Self, ConfigError> {
        let query = Query::parse(&spec.key).map_err(|reason| ConfigError::InvalidQuery {
            stage: stage.to_string(),
            query: spec.key.clone(),
            reason,
        })?;
        let operator = spec.operator.parse::<Operator>().map_err(|_| ConfigError::UnknownOperator {
            stage: stage.to_string(),
            key: spec.key.clone(),
            operator: spec.operator.clone(),
        })?;
        let invalid = |reason: &str| ConfigError::InvalidValues {
            stage: stage.to_string(),
            key: spec.key.clone(),
            operator: spec.operator.clone(),
            reason: reason.to_string(),
        };
        match operator {
            Operator::In | Operator::NotIn if spec.values.is_empty() => return Err(invalid("requires values")),
            Operator::Exists | Operator::DoesNotExist if !spec.values.is_empty() => {
                return Err(invalid("does not take values"))
            }
            _ => {}
        }
        Ok(Self { query, operator, values: spec.values.iter().cloned().collect() })
    }

    pub fn matches(&self, data: &Value) -> Result<bool, EvalError> {
        let found = self.query.eval(data);
        match self.operator {
            Operator::Exists => Ok(!found.is_empty()),
            Operator::DoesNotExist => Ok(found.is_empty()),
            Operator::In | Operator::NotIn => {
                let mut hit = false;
                for v in found {
                    let s = scalar(v).ok_or_else(|| EvalError::NonScalar { key: self.query.raw().to_string() })?;
                    if self.values.iter().any(|want| want.as_str() == s.as_ref()) {
                        hit = true;
                        break;
                    }
                }
                Ok(if self.operator == Operator::In { hit } else { !hit })
            }
        }
    }
}

pub(crate) fn scalar(v: &Value) -> Option<Cow<'_, str>> {
    match v {
        Value::String(s) => Some(Cow::Borrowed(s)),
        Value::Number(n) => Some(Cow::Owned(n.to_string())),
        Value::Bool(b) => Some(Cow::Owned(b.to_string())),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LabelRequirement {
    Equals(String, String),
    NotEquals(String, String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
    Exists(String),
    NotExists(String),
}

impl LabelRequirement {
    fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        let get = |k: &str| labels.and_then(|l| l.get(k)).map(String::as_str);
        match self {
            LabelRequirement::Equals(k, v) => get(k) == Some(v.as_str()),
            LabelRequirement::NotEquals(k, v) => get(k) != Some(v.as_str()),
            LabelRequirement::In(k, vs) => get(k).map_or(false, |have| vs.iter().any(|v| v == have)),
            LabelRequirement::NotIn(k, vs) => get(k).map_or(true, |have| !vs.iter().any(|v| v == have)),
            LabelRequirement::Exists(k) => get(k).is_some(),
            LabelRequirement::NotExists(k) => get(k).is_none(),
        }
    }
}

/// Kubernetes-style label (or annotation) selector. Empty selects everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    reqs: SmallVec<[LabelRequirement; 4]>,
}

impl LabelSelector {
    pub fn from_map(map: &BTreeMap<String, String>) -> Self {
        Self { reqs: map.iter().map(|(k, v)| LabelRequirement::Equals(k.clone(), v.clone())).collect() }
    }

    /// Parse `a=b,c!=d,e,!f,g in (x,y),h notin (z)`.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let err = |reason: String| ConfigError::InvalidSelector { selector: s.to_string(), reason };
        let mut reqs = SmallVec::new();
        for term in split_terms(s) {
            let term = term.trim();
            if term.is_empty() {
                continue;
            }
            let req = if let Some(k) = term.strip_prefix('!') {
                LabelRequirement::NotExists(valid_key(k.trim()).map_err(err)?)
            } else if let Some((k, v)) = term.split_once("!=") {
                LabelRequirement::NotEquals(valid_key(k.trim()).map_err(err)?, v.trim().to_string())
            } else if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
                LabelRequirement::Equals(valid_key(k.trim()).map_err(err)?, v.trim().to_string())
            } else if let Some((k, set)) = split_set(term, " notin ") {
                LabelRequirement::NotIn(valid_key(k).map_err(err)?, parse_set(set).map_err(err)?)
            } else if let Some((k, set)) = split_set(term, " in ") {
                LabelRequirement::In(valid_key(k).map_err(err)?, parse_set(set).map_err(err)?)
            } else {
                LabelRequirement::Exists(valid_key(term).map_err(err)?)
            };
            reqs.push(req);
        }
        Ok(Self { reqs })
    }

    pub fn is_empty(&self) -> bool {
        self.reqs.is_empty()
    }

    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        self.reqs.iter().all(|r| r.matches(labels))
    }
}

fn split_terms(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, ch) in s.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&s[start..]);
    out
}

fn split_set<'a>(term: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    term.split_once(op).map(|(k, set)| (k.trim(), set.trim()))
}

fn parse_set(set: &str) -> Result<Vec<String>, String> {
    let inner = set
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| format!("expected parenthesized value set, got {:?}", set))?;
    Ok(inner.split(',').map(|v| v.trim().to_string()).filter(|v| !v.is_empty()).collect())
}

fn valid_key(k: &str) -> Result<String, String> {
    if k.is_empty() || k.chars().any(|c| c.is_whitespace() || matches!(c, '(' | ')' | '=' | '!')) {
        return Err(format!("invalid key {:?}", k));
    }
    Ok(k.to_string())
}

/// Compiled stage selector. All parts must hold.
#[derive(Debug, Clone, Default)]
pub struct Selector {
    labels: LabelSelector,
    annotations: LabelSelector,
    expressions: Vec<Requirement>,
}

impl Selector {
    pub fn compile(stage: &str, spec: Option<&SelectorSpec>) -> Result<Self, ConfigError> {
        let Some(spec) = spec else { return Ok(Self::default()) };
        let expressions = spec
            .match_expressions
            .iter()
            .map(|e| Requirement::compile(stage, e))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            labels: LabelSelector::from_map(&spec.match_labels),
            annotations: LabelSelector::from_map(&spec.match_annotations),
            expressions,
        })
    }

    pub fn matches(
        &self,
        labels: Option<&BTreeMap<String, String>>,
        annotations: Option<&BTreeMap<String, String>>,
        data: &Value,
    ) -> Result<bool, EvalError> {
        if !self.labels.matches(labels) || !self.annotations.matches(annotations) {
            return Ok(false);
        }
        for req in &self.expressions {
            if !req.matches(data)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
