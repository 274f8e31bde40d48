//! Log-based metrics sink adapter.
//!
//! Implements [`MetricsSink`] by writing one structured line per snapshot
//! to the ESP-IDF logger (UART / USB-CDC in production). A cloud uplink
//! adapter would implement the same trait.

use log::info;

use crate::ports::MetricsSink;
use crate::transport::metrics::LinkMetrics;
use crate::transport::negotiation::LinkState;

/// Adapter that logs every metrics snapshot to the serial console.
#[derive(Default)]
pub struct LogMetricsSink {
    published: u32,
}

impl LogMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> u32 {
        self.published
    }
}

impl MetricsSink for LogMetricsSink {
    fn publish(&mut self, m: &LinkMetrics, link: LinkState) {
        self.published = self.published.wrapping_add(1);
        info!(
            "METRICS | link={} mtu={} | rx={}f/{}B cmds={}/{} | q={}/{} drops={} | \
             tx={}f/{}B ok={} fail={} cancel={} | errs frame={} parse={} stale={} | \
             busy={} lowmem={} pool2={} | neg att={} to={} fail={}",
            link.name(),
            m.negotiated_mtu,
            m.fragments_received,
            m.bytes_received,
            m.commands_queued,
            m.commands_processed,
            m.queue_depth,
            m.queue_peak,
            m.queue_drops,
            m.fragments_sent,
            m.bytes_sent,
            m.transmissions_completed,
            m.transmissions_failed,
            m.cancellations,
            m.framing_errors,
            m.parse_errors,
            m.stale_clears,
            m.lock_timeouts,
            m.low_memory_chunks,
            m.secondary_pool_allocs,
            m.negotiation_attempts,
            m.negotiation_timeouts,
            m.negotiation_failures,
        );
    }
}
