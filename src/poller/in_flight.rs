//! Per-group in-flight registry.
//!
//! A group id is claimed atomically before a poll starts and released
//! when the returned guard drops, which also covers error returns and
//! panics unwinding through the poll.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone, Default)]
pub struct InFlight {
    running: Arc<Mutex<HashSet<i64>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `group_id`, or `None` if a poll for it is already running.
    pub fn try_acquire(&self, group_id: i64) -> Option<InFlightGuard> {
        let mut running = lock(&self.running);
        if running.insert(group_id) {
            Some(InFlightGuard { group_id, running: Arc::clone(&self.running) })
        } else {
            None
        }
    }

    #[cfg(test)]
    pub fn is_running(&self, group_id: i64) -> bool {
        lock(&self.running).contains(&group_id)
    }

    pub fn len(&self) -> usize {
        lock(&self.running).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases the group's claim on drop.
pub struct InFlightGuard {
    group_id: i64,
    running: Arc<Mutex<HashSet<i64>>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.running).remove(&self.group_id);
    }
}

// The set stays consistent even if a holder panicked, so poisoning is ignored.
fn lock(m: &Mutex<HashSet<i64>>) -> MutexGuard<'_, HashSet<i64>> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
