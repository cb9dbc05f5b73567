//! Fakelet apply: turns a stage's `next` block into concrete writes.
//!
//! Nothing here talks to the API server. Patches are rendered, applied to a
//! local copy of the object, and dropped when they would not change it.

#![forbid(unsafe_code)]

use fakelet_core::stage::NextSpec;
use fakelet_core::PatchData;
use serde_json::Value;
use tracing::debug;

pub mod finalizers;
pub mod patch;
pub mod render;

pub use finalizers::{edit_finalizers, finalizers_patch};
pub use patch::{apply_local, merge_patch, strategic_merge, would_change};
pub use render::{RenderError, Renderer};

/// Rendered patches for `next`, in order, with no-ops removed.
///
/// Each patch is checked against the object as it would look after the
/// previous ones, so a later patch that only repeats an earlier one is
/// dropped too.
pub fn plan_patches(renderer: &Renderer, next: &NextSpec, current: &Value) -> Result<Vec<PatchData>, RenderError> {
    let mut working = current.clone();
    let mut out = Vec::new();
    for spec in next.effective_patches() {
        let patch = renderer.render_patch(&spec, current)?;
        if !would_change(&working, &patch) {
            debug!(subresource = ?patch.subresource, "patch is a no-op");
            continue;
        }
        working = apply_local(&working, &patch);
        out.push(patch);
    }
    Ok(out)
}
