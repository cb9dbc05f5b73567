//! Fakelet queue: time-delayed, weight-banded work queue plus per-item retry backoff.

#![forbid(unsafe_code)]

mod backoff;
mod weighted;

pub use backoff::{BackoffConfig, BackoffSet};
pub use weighted::{WeightedDelayingQueue, FRESH_WEIGHT, RETRY_WEIGHT};
