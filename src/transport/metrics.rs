//! Per-connection link, queue and transmission counters.
//!
//! Guarded by their own lock with a bounded wait. A contended update is
//! skipped rather than blocking the fragment or chunk path: counters are
//! diagnostics, not control state.

use core::time::Duration;

use log::debug;
use parking_lot::Mutex;
use serde::Serialize;

/// Counter snapshot. Reset on every connect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkMetrics {
    // Inbound
    pub fragments_received: u32,
    pub bytes_received: u32,
    /// Complete commands handed to the queue.
    pub commands_queued: u32,
    /// Commands the worker took off the queue, whatever the outcome.
    pub commands_processed: u32,
    pub framing_errors: u32,
    /// Inbound failures whose error report was shed.
    pub reports_dropped: u32,
    pub stale_clears: u32,
    pub parse_errors: u32,

    // Queue
    pub queue_depth: u8,
    pub queue_peak: u8,
    pub queue_drops: u32,

    // Outbound
    pub fragments_sent: u32,
    pub bytes_sent: u32,
    pub transmissions_completed: u32,
    pub transmissions_failed: u32,
    pub cancellations: u32,
    pub lock_timeouts: u32,
    pub low_memory_chunks: u32,
    pub secondary_pool_allocs: u32,

    // Negotiation
    pub negotiation_attempts: u32,
    pub negotiation_timeouts: u32,
    pub negotiation_failures: u32,
    pub negotiated_mtu: u16,
}

pub struct MetricsHub {
    inner: Mutex<LinkMetrics>,
    lock_timeout: Duration,
}

impl MetricsHub {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(LinkMetrics::default()),
            lock_timeout,
        }
    }

    /// Apply `f` to the counters. Returns `false` if the lock was busy and
    /// the update skipped.
    pub fn update(&self, f: impl FnOnce(&mut LinkMetrics)) -> bool {
        match self.inner.try_lock_for(self.lock_timeout) {
            Some(mut m) => {
                f(&mut m);
                true
            }
            None => {
                debug!("METRICS: lock busy, update skipped");
                false
            }
        }
    }

    pub fn snapshot(&self) -> Option<LinkMetrics> {
        self.inner.try_lock_for(self.lock_timeout).map(|m| *m)
    }

    pub fn reset(&self) -> bool {
        self.update(|m| *m = LinkMetrics::default())
    }
}
