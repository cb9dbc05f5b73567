use fakelet_queue::BackoffConfig;
use serde::{Deserialize, Serialize};

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse::<T>().ok())
}

/// Knobs shared by every stage controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Parallel apply workers per controller.
    pub workers: usize,
    pub backoff: BackoffConfig,
    /// Retries per job before it is dropped; 0 retries forever.
    pub retry_limit: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self { workers: 4, backoff: BackoffConfig::default(), retry_limit: 0 }
    }
}

impl ControllerConfig {
    /// Defaults overridden by `FAKELET_WORKERS`, `FAKELET_RETRY_LIMIT` and the
    /// `FAKELET_BACKOFF_*` variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            workers: env_parse::<usize>("FAKELET_WORKERS").filter(|n| *n > 0).unwrap_or(d.workers),
            backoff: BackoffConfig::from_env(),
            retry_limit: env_parse("FAKELET_RETRY_LIMIT").unwrap_or(d.retry_limit),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }
}

/// Which nodes fakelet takes over. Selectors use `a=b,c in (x,y)` syntax.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSelection {
    pub manage_all: bool,
    pub label_selector: Option<String>,
    pub annotation_selector: Option<String>,
    /// Managed nodes matching these keep their status untouched.
    pub disregard_label_selector: Option<String>,
    pub disregard_annotation_selector: Option<String>,
}

impl NodeSelection {
    pub fn all() -> Self {
        Self { manage_all: true, ..Default::default() }
    }
}
