use fakelet_apply::RenderError;
use fakelet_core::{ClientError, EvalError};
use thiserror::Error;

/// Why a worker could not finish applying a stage.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("render: {0}")]
    Render(#[from] RenderError),
    #[error("evaluate: {0}")]
    Eval(#[from] EvalError),
}

impl ApplyError {
    /// Only transport failures are worth retrying; a template or expression
    /// fails the same way on the next attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApplyError::Client(e) => e.is_retryable(),
            ApplyError::Render(_) | ApplyError::Eval(_) => false,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IpPoolError {
    #[error("invalid CIDR {cidr:?}: {reason}")]
    InvalidCidr { cidr: String, reason: String },
    #[error("address pool {0} is exhausted")]
    Exhausted(String),
}
