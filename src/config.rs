//! Transport configuration parameters
//!
//! All tunable parameters for the BLE command transport.
//! Values can be overridden by the configuration store, which persists
//! them as a postcard blob (see [`TransportConfig::to_blob`]).
//!
//! Sizes that dimension static storage (queue depth, scratch buffer) are
//! compile-time constants rather than config fields.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Depth of the command queue between the inbound path and the worker.
pub const COMMAND_QUEUE_DEPTH: usize = 20;

/// Inbound failures awaiting an error report from the worker.
pub const FAULT_QUEUE_DEPTH: usize = 4;

/// Capacity of the per-chunk scratch buffer (largest ATT payload for MTU 517,
/// rounded down).
pub const SCRATCH_CAPACITY: usize = 512;

/// ATT header overhead subtracted from the MTU to get the notify payload.
pub const ATT_OVERHEAD: u16 = 3;

/// BLE default ATT MTU before any exchange.
pub const DEFAULT_ATT_MTU: u16 = 23;

/// Lower bound for the negotiation fallback unit size.
pub const MIN_FALLBACK_MTU: u16 = 100;

/// Core transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    // --- Reassembly ---
    /// Capacity of the inbound reassembly buffer (bytes)
    pub reassembly_capacity: u32,
    /// Idle time after which a partial command is discarded (ms)
    pub reassembly_idle_timeout_ms: u32,

    // --- Worker ---
    /// Bounded wait on the command queue before re-checking shutdown (ms)
    pub worker_wait_ms: u32,

    // --- MTU negotiation ---
    /// MTU requested from the link on connect
    pub preferred_mtu: u16,
    /// Per-attempt negotiation timeout (ms)
    pub negotiation_timeout_ms: u32,
    /// Retries after the first attempt times out
    pub negotiation_max_retries: u8,
    /// Base of the exponential backoff between attempts (ms)
    pub negotiation_backoff_base_ms: u32,
    /// Upper bound of the random jitter added to each backoff (ms)
    pub negotiation_jitter_ms: u32,
    /// Unit size installed when negotiation fails (clamped to >= 100)
    pub fallback_mtu: u16,
    /// Monitor task period (ms)
    pub monitor_interval_ms: u32,
    /// Delay between connect and the first synchronous monitor pass (ms)
    pub connect_settle_ms: u32,

    // --- Transmission ---
    /// Serialized responses above this size are refused (bytes)
    pub max_response_bytes: u32,
    /// Slack allocated on top of the serialized length (bytes)
    pub response_margin_bytes: u32,
    /// Free heap below which a transmission is aborted (bytes)
    pub emergency_free_bytes: u32,
    /// Free heap below which chunks shrink to `low_memory_chunk` (bytes)
    pub low_memory_free_bytes: u32,
    /// Chunk size used under memory pressure (bytes)
    pub low_memory_chunk: u16,
    /// Payloads above this size use the moderate delay and report progress
    pub medium_payload_bytes: u32,
    /// Payloads above this size use the slowest delay
    pub large_payload_bytes: u32,
    /// Inter-chunk delay for small payloads (ms)
    pub fast_chunk_delay_ms: u32,
    /// Inter-chunk delay for medium payloads (ms)
    pub moderate_chunk_delay_ms: u32,
    /// Inter-chunk delay for large payloads (ms)
    pub slow_chunk_delay_ms: u32,
    /// Progress notification granularity (percent)
    pub progress_step_percent: u8,

    // --- Locks ---
    /// Bounded wait on the outbound transmission lock (ms)
    pub transmission_lock_timeout_ms: u32,
    /// Bounded wait on the negotiation control lock (ms)
    pub negotiation_lock_timeout_ms: u32,
    /// Bounded wait on the metrics lock (ms)
    pub metrics_lock_timeout_ms: u32,
    /// Bounded wait on the streaming flag lock (ms)
    pub streaming_lock_timeout_ms: u32,

    // --- Background tasks ---
    /// Monitor ticks between two metrics publications
    pub metrics_publish_ticks: u32,
    /// Streamer poll period while streaming is enabled (ms)
    pub stream_poll_ms: u32,
    /// Poll period while draining in-flight transmissions on shutdown (ms)
    pub drain_poll_ms: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            // Reassembly
            reassembly_capacity: 32 * 1024,
            reassembly_idle_timeout_ms: 5_000,

            // Worker
            worker_wait_ms: 100,

            // MTU negotiation
            preferred_mtu: 517,
            negotiation_timeout_ms: 5_000,
            negotiation_max_retries: 2,
            negotiation_backoff_base_ms: 100,
            negotiation_jitter_ms: 100,
            fallback_mtu: 185,
            monitor_interval_ms: 500,
            connect_settle_ms: 200,

            // Transmission
            max_response_bytes: 96 * 1024,
            response_margin_bytes: 64,
            emergency_free_bytes: 8 * 1024,
            low_memory_free_bytes: 24 * 1024,
            low_memory_chunk: 64,
            medium_payload_bytes: 5 * 1024,
            large_payload_bytes: 50 * 1024,
            fast_chunk_delay_ms: 10,
            moderate_chunk_delay_ms: 20,
            slow_chunk_delay_ms: 40,
            progress_step_percent: 10,

            // Locks
            transmission_lock_timeout_ms: 3_000,
            negotiation_lock_timeout_ms: 50,
            metrics_lock_timeout_ms: 10,
            streaming_lock_timeout_ms: 10,

            // Background tasks
            metrics_publish_ticks: 20, // 10 s at 500 ms
            stream_poll_ms: 50,
            drain_poll_ms: 10,
        }
    }
}

impl TransportConfig {
    /// Reject inconsistent values instead of silently clamping them.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reassembly_capacity < 2 {
            return Err(ConfigError::Invalid("reassembly capacity too small"));
        }
        if self.reassembly_idle_timeout_ms == 0 {
            return Err(ConfigError::Invalid("reassembly idle timeout is zero"));
        }
        if self.negotiation_timeout_ms == 0 || self.monitor_interval_ms == 0 {
            return Err(ConfigError::Invalid("negotiation timing is zero"));
        }
        if self.fallback_mtu < MIN_FALLBACK_MTU {
            return Err(ConfigError::Invalid("fallback MTU below 100"));
        }
        if self.preferred_mtu <= DEFAULT_ATT_MTU {
            return Err(ConfigError::Invalid("preferred MTU not above default"));
        }
        if self.medium_payload_bytes >= self.large_payload_bytes {
            return Err(ConfigError::Invalid("medium payload tier not below large tier"));
        }
        if self.emergency_free_bytes >= self.low_memory_free_bytes {
            return Err(ConfigError::Invalid("emergency threshold not below low-memory threshold"));
        }
        if self.low_memory_chunk == 0 || self.low_memory_chunk as usize > SCRATCH_CAPACITY {
            return Err(ConfigError::Invalid("low-memory chunk outside scratch capacity"));
        }
        if self.progress_step_percent == 0 || self.progress_step_percent > 100 {
            return Err(ConfigError::Invalid("progress step must be 1-100"));
        }
        if self.max_response_bytes == 0 {
            return Err(ConfigError::Invalid("response cap is zero"));
        }
        Ok(())
    }

    /// Encode for the configuration store.
    pub fn to_blob(&self) -> Result<Vec<u8>, ConfigError> {
        postcard::to_allocvec(self).map_err(|_| ConfigError::Encode)
    }

    /// Decode a blob written by [`to_blob`](Self::to_blob) and validate it.
    pub fn from_blob(bytes: &[u8]) -> Result<Self, ConfigError> {
        let cfg: Self = postcard::from_bytes(bytes).map_err(|_| ConfigError::Decode)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Fallback unit size with the 100-byte floor applied.
    pub fn clamped_fallback_mtu(&self) -> u16 {
        self.fallback_mtu.max(MIN_FALLBACK_MTU)
    }
}
