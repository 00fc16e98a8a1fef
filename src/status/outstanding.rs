//! In-memory per-document counters and cancel flags shared with workers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Parts of each document that have not reached a terminal state yet.
#[derive(Debug, Clone, Default)]
pub struct OutstandingParts {
    counters: Arc<Mutex<HashMap<String, Arc<AtomicUsize>>>>,
}

impl OutstandingParts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `count` outstanding units for a document.
    pub fn register(&self, document_id: &str, count: usize) {
        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters.insert(document_id.to_string(), Arc::new(AtomicUsize::new(count)));
    }

    /// Record one finished unit. Returns true for exactly one caller: the one
    /// that brought the count to zero.
    pub fn decrement_and_check_zero(&self, document_id: &str) -> bool {
        let counter = {
            let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
            match counters.get(document_id) {
                Some(counter) => Arc::clone(counter),
                None => return false,
            }
        };

        let previous = counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .unwrap_or(0);
        if previous == 1 {
            let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
            if counters
                .get(document_id)
                .is_some_and(|current| Arc::ptr_eq(current, &counter))
            {
                counters.remove(document_id);
            }
            return true;
        }
        false
    }

    /// Units still outstanding for a document (0 when untracked)
    pub fn in_flight(&self, document_id: &str) -> usize {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        counters
            .get(document_id)
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }
}

/// Per-document cancellation, checked by workers before converting and
/// before persisting.
#[derive(Debug, Clone, Default)]
pub struct CancelFlags {
    flags: Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>,
}

impl CancelFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flag shared by every worker of a document
    pub fn flag(&self, document_id: &str) -> Arc<AtomicBool> {
        let mut flags = self.flags.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            flags
                .entry(document_id.to_string())
                .or_insert_with(|| Arc::new(AtomicBool::new(false))),
        )
    }

    pub fn cancel(&self, document_id: &str) {
        self.flag(document_id).store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self, document_id: &str) -> bool {
        let flags = self.flags.lock().unwrap_or_else(|e| e.into_inner());
        flags
            .get(document_id)
            .is_some_and(|f| f.load(Ordering::Acquire))
    }

    pub fn clear(&self, document_id: &str) {
        let mut flags = self.flags.lock().unwrap_or_else(|e| e.into_inner());
        flags.remove(document_id);
    }
}
