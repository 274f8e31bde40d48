//! Runtime diagnostics and panic logging.
//!
//! [`DiagnosticsHandler`] sits in front of the gateway's command handler
//! and answers `{"type":"get_diagnostics"}` itself with a snapshot of the
//! runtime (uptime, heap) and the link (metrics, negotiation state, chunk
//! size, queue depth). Every other command goes to the delegate.

use std::sync::Arc;

use log::{info, warn};
use serde::Serialize;

use crate::ports::CommandHandler;
use crate::transport::GatewayTransport;
use crate::transport::metrics::LinkMetrics;
use crate::transport::negotiation::LinkState;

pub const DIAGNOSTICS_COMMAND: &str = "get_diagnostics";

/// Runtime diagnostics snapshot collected on-demand.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeMetrics {
    pub uptime_secs: u64,
    pub heap_free: u32,
    pub heap_min_free: u32,
    pub in_flight: u32,
}

impl RuntimeMetrics {
    pub fn collect(transport: &GatewayTransport) -> Self {
        Self {
            uptime_secs: transport.uptime_ms() / 1_000,
            heap_free: transport.free_heap().min(u32::MAX as usize) as u32,
            heap_min_free: transport.min_free_heap().min(u32::MAX as usize) as u32,
            in_flight: transport.in_flight() as u32,
        }
    }
}

/// Response document for `get_diagnostics`.
///
/// `metrics` and `link` are `null` when their lock was busy.
#[derive(Debug, Serialize)]
pub struct DiagnosticsDoc {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub runtime: RuntimeMetrics,
    pub metrics: Option<LinkMetrics>,
    pub link: Option<LinkState>,
    pub chunk_size: usize,
    pub queue_len: usize,
    pub streaming: bool,
}

impl DiagnosticsDoc {
    pub fn collect(transport: &GatewayTransport) -> Self {
        Self {
            kind: "diagnostics",
            runtime: RuntimeMetrics::collect(transport),
            metrics: transport.metrics(),
            link: transport.link_state(),
            chunk_size: transport.chunk_size(),
            queue_len: transport.queue_len(),
            streaming: transport.is_streaming(),
        }
    }
}

/// Answers diagnostics requests, delegates the rest.
#[derive(Default)]
pub struct DiagnosticsHandler {
    delegate: Option<Arc<dyn CommandHandler>>,
}

impl DiagnosticsHandler {
    pub fn new(delegate: Option<Arc<dyn CommandHandler>>) -> Self {
        Self { delegate }
    }
}

impl CommandHandler for DiagnosticsHandler {
    fn handle(&self, transport: &GatewayTransport, command: serde_json::Value) {
        let kind = command.get("type").and_then(|t| t.as_str());
        if kind == Some(DIAGNOSTICS_COMMAND) {
            let doc = DiagnosticsDoc::collect(transport);
            if let Err(e) = transport.send_response(&doc) {
                warn!("DIAG: diagnostics response not delivered: {}", e);
            }
            return;
        }

        match &self.delegate {
            Some(delegate) => delegate.handle(transport, command),
            None => {
                info!("DIAG: no handler for command type {:?}", kind);
                if let Err(e) = transport.send_error("Unsupported command", "unsupported") {
                    warn!("DIAG: error reply not delivered: {}", e);
                }
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Panic hook
// ───────────────────────────────────────────────────────────────

/// Install a panic hook that logs the reason and location before the
/// default handler resets the chip.
pub fn install_panic_handler() {
    std::panic::set_hook(Box::new(|info| {
        let reason = if let Some(msg) = info.payload().downcast_ref::<&str>() {
            *msg
        } else if let Some(msg) = info.payload().downcast_ref::<String>() {
            msg.as_str()
        } else {
            "unknown panic"
        };

        match info.location() {
            Some(loc) => log::error!("PANIC: {} at {}:{}", reason, loc.file(), loc.line()),
            None => log::error!("PANIC: {}", reason),
        }
    }));
}
