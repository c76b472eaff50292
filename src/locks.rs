use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Per-offering mutual exclusion for result calculation. Two interleaved
/// calculations over the same offering could snapshot a half-written ledger;
/// different offerings are independent.
#[derive(Clone, Default)]
pub struct CalcLockRegistry {
    inner: Arc<Mutex<HashSet<String>>>,
}

pub struct CalcLockGuard {
    key: String,
    inner: Arc<Mutex<HashSet<String>>>,
}

impl CalcLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// None means another calculation holds the offering; the caller maps
    /// that to `recalculation_in_progress` and the client retries after
    /// backoff.
    pub fn acquire(&self, course_offering_id: &str) -> Option<CalcLockGuard> {
        let mut held = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(course_offering_id.to_string()) {
            return None;
        }
        Some(CalcLockGuard {
            key: course_offering_id.to_string(),
            inner: Arc::clone(&self.inner),
        })
    }
}

impl Drop for CalcLockGuard {
    // Release on drop so a panicking calculation cannot wedge its offering.
    fn drop(&mut self) {
        let mut held = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(&self.key);
    }
}
