//! Per-namespace mutual exclusion for unidle operations.
//!
//! At most one unidle may be in flight per namespace. The registry hands out
//! guards with insert-if-absent semantics; dropping the guard releases the
//! entry on every exit path, so a failed unidle never wedges a namespace.

use std::sync::Arc;

use dashmap::DashSet;

#[derive(Clone, Default)]
pub struct LockRegistry {
    held: Arc<DashSet<String>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to acquire the lock for `key`. Returns `None` when another
    /// operation already holds it.
    pub fn try_acquire(&self, key: &str) -> Option<LockGuard> {
        if self.held.insert(key.to_string()) {
            Some(LockGuard { held: Arc::clone(&self.held), key: key.to_string() })
        } else {
            None
        }
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.held.contains(key)
    }
}

pub struct LockGuard {
    held: Arc<DashSet<String>>,
    key: String,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.held.remove(&self.key);
    }
}
