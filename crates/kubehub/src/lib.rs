//! Fakelet kubehub: kube-rs adapters for the stage controllers.

#![forbid(unsafe_code)]

mod client;
mod discovery;
mod error;
mod events;
mod watch;

pub use client::{immediate_delete, KubeObjectClient, FIELD_MANAGER};
pub use discovery::find_api_resource;
pub use error::classify;
pub use events::KubeEventRecorder;
pub use watch::{to_watch_events, watch};
