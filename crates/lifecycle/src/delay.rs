//! Delay evaluation for a compiled stage.

use std::time::Duration;

use chrono::{DateTime, Utc};
use fakelet_core::stage::{DelaySpec, ExpressionFrom};
use fakelet_core::{ConfigError, EvalError};
use serde_json::Value;

use crate::path::Query;
use crate::random::RandomSource;

/// A literal millisecond value and/or a query that may override it.
#[derive(Debug, Clone, Default)]
struct DurationSource {
    literal: Option<Duration>,
    from: Option<Query>,
}

impl DurationSource {
    fn compile(stage: &str, millis: Option<i64>, from: Option<&ExpressionFrom>) -> Result<Self, ConfigError> {
        let literal = match millis {
            Some(ms) if ms < 0 => {
                return Err(ConfigError::InvalidStage {
                    stage: stage.to_string(),
                    reason: format!("negative delay {}ms", ms),
                })
            }
            Some(ms) => Some(Duration::from_millis(ms as u64)),
            None => None,
        };
        let from = from
            .map(|f| {
                Query::parse(&f.expression_from).map_err(|reason| ConfigError::InvalidQuery {
                    stage: stage.to_string(),
                    query: f.expression_from.clone(),
                    reason,
                })
            })
            .transpose()?;
        Ok(Self { literal, from })
    }

    fn is_empty(&self) -> bool {
        self.literal.is_none() && self.from.is_none()
    }

    fn eval(&self, data: &Value, now: DateTime<Utc>) -> Result<Option<Duration>, EvalError> {
        if let Some(q) = &self.from {
            if let Some(v) = q.first(data) {
                return duration_from_value(q.raw(), v, now).map(Some);
            }
        }
        Ok(self.literal)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Delay {
    base: DurationSource,
    jitter: DurationSource,
}

impl Delay {
    pub fn compile(stage: &str, spec: Option<&DelaySpec>) -> Result<Option<Self>, ConfigError> {
        let Some(spec) = spec else { return Ok(None) };
        let base = DurationSource::compile(stage, spec.duration_milliseconds, spec.duration_from.as_ref())?;
        let jitter =
            DurationSource::compile(stage, spec.jitter_duration_milliseconds, spec.jitter_duration_from.as_ref())?;
        if base.is_empty() && jitter.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self { base, jitter }))
    }

    /// `None` means apply immediately. A jitter without a base spreads the
    /// delay over `[0, jitter)`, as if the base were zero.
    pub fn eval(
        &self,
        data: &Value,
        now: DateTime<Utc>,
        rng: &dyn RandomSource,
    ) -> Result<Option<Duration>, EvalError> {
        let base = self.base.eval(data, now)?;
        let jitter = self.jitter.eval(data, now)?;
        Ok(match (base, jitter) {
            (None, None) => None,
            (Some(b), None) => Some(b),
            (None, Some(j)) => Some(rng.duration_below(j)),
            (Some(b), Some(j)) if j < b => Some(j),
            (Some(b), Some(j)) => Some(b + rng.duration_below(j - b)),
        })
    }
}

fn duration_from_value(expression: &str, v: &Value, now: DateTime<Utc>) -> Result<Duration, EvalError> {
    let invalid = || EvalError::InvalidDuration { expression: expression.to_string(), value: v.to_string() };
    match v {
        Value::Number(n) => {
            let ms = n.as_f64().ok_or_else(invalid)?;
            if !ms.is_finite() {
                return Err(invalid());
            }
            Ok(Duration::from_nanos((ms.max(0.0) * 1e6).round() as u64))
        }
        Value::String(s) => {
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Ok((ts.with_timezone(&Utc) - now).to_std().unwrap_or(Duration::ZERO));
            }
            parse_go_duration(s).ok_or_else(invalid)
        }
        _ => Err(invalid()),
    }
}

/// Parse `300ms`, `1.5s`, `2h45m`, `-1s` (negative saturates to zero).
pub fn parse_go_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let (negative, mut rest) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    if rest == "0" {
        return Some(Duration::ZERO);
    }
    if rest.is_empty() {
        return None;
    }
    let mut total_nanos = 0f64;
    while !rest.is_empty() {
        let num_end = rest.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(rest.len());
        if num_end == 0 {
            return None;
        }
        let n: f64 = rest[..num_end].parse().ok()?;
        rest = &rest[num_end..];
        let unit_end = rest.find(|c: char| c.is_ascii_digit() || c == '.').unwrap_or(rest.len());
        let scale = match &rest[..unit_end] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return None,
        };
        total_nanos += (n * scale).round();
        rest = &rest[unit_end..];
    }
    if negative {
        return Some(Duration::ZERO);
    }
    if !total_nanos.is_finite() || total_nanos > u64::MAX as f64 {
        return None;
    }
    Some(Duration::from_nanos(total_nanos as u64))
}
