//! Port traits: the hexagonal boundary between the transport core and the
//! platform or the rest of the gateway firmware.
//!
//! ```text
//!   BLE stack / heap / timer ──▶ Port trait ──▶ GatewayTransport
//!   GatewayTransport ──▶ Port trait ──▶ command layer / telemetry queue
//! ```
//!
//! Platform adapters live in [`crate::adapters`]; the command handler and
//! telemetry source are supplied by the Modbus side of the firmware.
//! Every port is `Send + Sync` because the transport is shared between the
//! link callback context and the worker, streamer and monitor tasks.

use core::time::Duration;

use crate::buffer::PoolBuffer;
use crate::error::LinkError;
use crate::transport::GatewayTransport;
use crate::transport::metrics::LinkMetrics;
use crate::transport::negotiation::LinkState;

// ───────────────────────────────────────────────────────────────
// Link port (driven adapter: transport → BLE stack)
// ───────────────────────────────────────────────────────────────

/// The outbound half of the BLE link plus the link parameters the
/// negotiation needs.
pub trait LinkPort: Send + Sync {
    /// Send one notification on the outbound characteristic.
    fn notify(&self, data: &[u8]) -> Result<(), LinkError>;

    /// ATT MTU currently in effect for the connected peer.
    fn mtu(&self) -> u16;

    /// Ask the stack to raise the MTU to `mtu`.
    fn request_mtu(&self, mtu: u16) -> Result<(), LinkError>;

    fn is_connected(&self) -> bool;

    /// Resume advertising after the peer dropped.
    fn restart_advertising(&self);
}

// ───────────────────────────────────────────────────────────────
// Clock port
// ───────────────────────────────────────────────────────────────

/// Monotonic time plus the cooperative sleep used for pacing and backoff.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;

    fn sleep(&self, duration: Duration);
}

// ───────────────────────────────────────────────────────────────
// Heap port
// ───────────────────────────────────────────────────────────────

/// Free-memory probe and the two allocation pools used for outbound
/// documents.
///
/// The primary pool is external RAM (the pool under the most pressure is
/// tried first so internal RAM stays free for the radio stack); the
/// secondary pool is internal RAM.
pub trait HeapPort: Send + Sync {
    /// Free heap right now (bytes).
    fn free_bytes(&self) -> usize;

    /// Lowest free heap since boot (bytes).
    fn min_free_bytes(&self) -> usize;

    /// A `len`-byte buffer from the primary pool, or `None` if that pool
    /// cannot hold it.
    fn alloc_primary(&self, len: usize) -> Option<PoolBuffer>;

    fn alloc_secondary(&self, len: usize) -> Option<PoolBuffer>;
}

// ───────────────────────────────────────────────────────────────
// Command handler port (driving: transport → command layer)
// ───────────────────────────────────────────────────────────────

/// Interprets one parsed command and sends its result through the
/// transport (`send_response`, `send_ok`, `send_error`, ...).
pub trait CommandHandler: Send + Sync {
    fn handle(&self, transport: &GatewayTransport, command: serde_json::Value);
}

// ───────────────────────────────────────────────────────────────
// Telemetry source port
// ───────────────────────────────────────────────────────────────

/// Telemetry produced by the Modbus side, drained while streaming is on.
pub trait TelemetrySource: Send + Sync {
    fn has_data(&self) -> bool;

    fn dequeue(&self) -> Option<serde_json::Value>;
}

// ───────────────────────────────────────────────────────────────
// Metrics sink port
// ───────────────────────────────────────────────────────────────

/// Destination of the monitor task's periodic metrics publication.
pub trait MetricsSink: Send {
    fn publish(&mut self, metrics: &LinkMetrics, link: LinkState);
}
