//! Gatelink firmware entry point.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                      Adapters (outer ring)                     │
//! │                                                                │
//! │  BleLink (LinkPort)   SystemClock (Clock)   EspHeap (HeapPort) │
//! │  LogMetricsSink (MetricsSink)                                  │
//! │                                                                │
//! │  ──────────────── Port Trait Boundary ───────────────────      │
//! │                                                                │
//! │  ┌────────────────────────────────────────────────────────┐    │
//! │  │  GatewayTransport                                      │    │
//! │  │  reassembly · queue · negotiation · transmission       │    │
//! │  └────────────────────────────────────────────────────────┘    │
//! │                                                                │
//! │  worker · streamer · monitor (APP core) · event loop (main)    │
//! └────────────────────────────────────────────────────────────────┘
//! ```
#![deny(unused_must_use)]

use core::time::Duration;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;

use gatelink::adapters::ble::BleLink;
use gatelink::adapters::heap::EspHeap;
use gatelink::adapters::log_sink::LogMetricsSink;
use gatelink::adapters::time::SystemClock;
use gatelink::config::TransportConfig;
use gatelink::diagnostics::{self, DiagnosticsHandler};
use gatelink::events;
use gatelink::ports::TelemetrySource;
use gatelink::transport::{GatewayTransport, tasks};

const DEVICE_NAME: &str = "gatelink";
const EVENT_POLL: Duration = Duration::from_millis(20);

/// Placeholder until the Modbus poller publishes telemetry.
struct NoTelemetry;

impl TelemetrySource for NoTelemetry {
    fn has_data(&self) -> bool {
        false
    }

    fn dequeue(&self) -> Option<serde_json::Value> {
        None
    }
}

fn main() -> Result<()> {
    // ── 1. ESP-IDF bootstrap ──────────────────────────────────
    esp_idf_svc::sys::link_patches();
    esp_idf_logger::init()?;
    diagnostics::install_panic_handler();

    info!("╔══════════════════════════════════════╗");
    info!("║  Gatelink v{}                        ║", env!("CARGO_PKG_VERSION"));
    info!("╚══════════════════════════════════════╝");

    // ── 2. Transport ──────────────────────────────────────────
    let cfg = TransportConfig::default();
    let preferred_mtu = cfg.preferred_mtu;

    let mut name = heapless::String::<24>::new();
    name.push_str(DEVICE_NAME)
        .map_err(|_| anyhow::anyhow!("device name too long"))?;
    let link = Arc::new(BleLink::new(name));

    let transport = Arc::new(
        GatewayTransport::new(
            cfg,
            link.clone(),
            Arc::new(SystemClock::new()),
            Arc::new(EspHeap::new()),
        )
        .context("transport config rejected")?,
    );
    transport.register_handler(Arc::new(DiagnosticsHandler::new(None)));

    // ── 3. BLE stack ──────────────────────────────────────────
    link.attach(&transport);
    link.start(preferred_mtu).context("BLE start failed")?;

    // ── 4. Tasks ──────────────────────────────────────────────
    let _tasks = tasks::spawn_all(
        &transport,
        Arc::new(NoTelemetry),
        Box::new(LogMetricsSink::new()),
    )
    .context("task spawn failed")?;

    info!("Gatelink ready, advertising as '{}'", link.device_name());

    // ── 5. Link event loop ────────────────────────────────────
    loop {
        events::drain_events(|event| events::route(event, &transport));
        std::thread::sleep(EVENT_POLL);
    }
}
