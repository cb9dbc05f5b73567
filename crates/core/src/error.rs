use thiserror::Error;

/// Failures reported by an [`ObjectClient`](crate::ObjectClient) or event sink.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// Object is gone; callers treat this as an idempotent success.
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("throttled: {0}")]
    Throttled(String),
    /// Connection resets, timeouts, 5xx.
    #[error("transient: {0}")]
    Transient(String),
    /// Malformed request or rejected by validation.
    #[error("invalid: {0}")]
    Invalid(String),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Conflict(_) | ClientError::Throttled(_) | ClientError::Transient(_))
    }
}

/// Stage configuration that cannot be compiled. Fatal at controller startup.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("stage {stage}: invalid path query {query:?}: {reason}")]
    InvalidQuery { stage: String, query: String, reason: String },
    #[error("stage {stage}: unknown operator {operator:?} for key {key:?}")]
    UnknownOperator { stage: String, key: String, operator: String },
    #[error("stage {stage}: operator {operator} on key {key:?} {reason}")]
    InvalidValues { stage: String, key: String, operator: String, reason: String },
    #[error("invalid label selector {selector:?}: {reason}")]
    InvalidSelector { selector: String, reason: String },
    #[error("stage {stage}: {reason}")]
    InvalidStage { stage: String, reason: String },
}

/// Per-object evaluation failure while matching a stage or computing its delay.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EvalError {
    #[error("key {key:?} resolved to a non-scalar value")]
    NonScalar { key: String },
    #[error("expression {expression:?} produced an unusable duration {value:?}")]
    InvalidDuration { expression: String, value: String },
    #[error("serializing object: {0}")]
    Serialize(String),
}

impl From<serde_json::Error> for EvalError {
    fn from(e: serde_json::Error) -> Self {
        EvalError::Serialize(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_error_classification() {
        assert!(ClientError::NotFound("pod".into()).is_not_found());
        assert!(!ClientError::NotFound("pod".into()).is_retryable());
        assert!(ClientError::Conflict("rv".into()).is_retryable());
        assert!(ClientError::Throttled("429".into()).is_retryable());
        assert!(ClientError::Transient("reset".into()).is_retryable());
        assert!(!ClientError::Invalid("bad patch".into()).is_retryable());
    }

    #[test]
    fn errors_render_context() {
        let e = ConfigError::UnknownOperator { stage: "pod-ready".into(), key: ".status.phase".into(), operator: "Like".into() };
        assert_eq!(e.to_string(), "stage pod-ready: unknown operator \"Like\" for key \".status.phase\"");
    }
}
