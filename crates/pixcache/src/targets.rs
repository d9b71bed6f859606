//! Display target bookkeeping
//!
//! Each target remembers the key it most recently asked for. A decode that
//! finishes after its target was pointed somewhere else is stale; the
//! worker drops it instead of rendering. Only the latest mark matters, so
//! this stands in for a full cancellation protocol.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::cache::ImageKey;

/// Identity of a display target, derived from its allocation address
pub type TargetId = usize;

/// Latest requested key per display target
///
/// Marks are overwritten by the next request for the same target and never
/// cleared explicitly.
#[derive(Debug, Default)]
pub struct TargetRegistry {
    desired: Mutex<HashMap<TargetId, ImageKey>>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the key the target wants to show
    pub fn mark(&self, target: TargetId, key: ImageKey) {
        self.desired.lock().unwrap().insert(target, key);
    }

    /// Whether `key` is still what the target last asked for
    pub fn is_desired(&self, target: TargetId, key: &ImageKey) -> bool {
        self.desired.lock().unwrap().get(&target) == Some(key)
    }
}
