/// Per-kind behavior plugged into the generic stage controller.
pub trait StageHooks<K>: Send + Sync {
    /// Whether the object takes part in stage processing at all.
    fn needs_management(&self, _object: &K) -> bool {
        true
    }

    /// Called for every managed add/modify/sync before stage matching.
    fn observe(&self, _object: &K) {}

    /// Called once the object is deleted.
    fn forget(&self, _object: &K) {}
}

/// Manage everything, track nothing. Used for custom resources.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManageAll;

impl<K> StageHooks<K> for ManageAll {}
