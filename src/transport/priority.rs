//! High-priority flag raised while a BLE command is being processed.
//!
//! The Modbus polling engines check it between polls and yield so the
//! command's response is not delayed by bus traffic. Only the worker can
//! raise or clear it; everyone else gets a read-only [`PriorityQuery`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Default)]
pub struct PriorityFlag {
    raised: Arc<AtomicBool>,
}

impl PriorityFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag for the lifetime of the returned guard.
    pub(crate) fn raise(&self) -> PriorityGuard<'_> {
        self.raised.store(true, Ordering::Release);
        PriorityGuard { flag: &self.raised }
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }

    pub fn query(&self) -> PriorityQuery {
        PriorityQuery {
            raised: Arc::clone(&self.raised),
        }
    }
}

/// Clears the flag on drop, whichever way processing ends.
pub(crate) struct PriorityGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for PriorityGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Read-only handle handed to the polling engines.
#[derive(Clone)]
pub struct PriorityQuery {
    raised: Arc<AtomicBool>,
}

impl PriorityQuery {
    pub fn is_high_priority(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }
}
