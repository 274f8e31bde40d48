//! Mock adapters for integration tests.
//!
//! `MockLink` records every notification, `ManualClock` only moves when
//! something sleeps, and `MockHeap` reports whatever free figure the test
//! pins. `Harness` wires them into a `GatewayTransport`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use core::time::Duration;
use parking_lot::Mutex;

use gatelink::buffer::PoolBuffer;
use gatelink::config::{DEFAULT_ATT_MTU, TransportConfig};
use gatelink::error::LinkError;
use gatelink::ports::{Clock, CommandHandler, HeapPort, LinkPort, MetricsSink, TelemetrySource};
use gatelink::transport::GatewayTransport;
use gatelink::transport::engine::CancelToken;
use gatelink::transport::metrics::LinkMetrics;
use gatelink::transport::negotiation::LinkState;
use gatelink::transport::protocol::{END_MARKER, START_MARKER};

// ── MockLink ──────────────────────────────────────────────────

pub struct MockLink {
    connected: AtomicBool,
    mtu: AtomicU16,
    /// MTU the peer agrees to when asked; `None` ignores requests.
    grant: Mutex<Option<u16>>,
    pub mtu_requests: AtomicU32,
    pub adverts: AtomicU32,
    sent: Mutex<Vec<Vec<u8>>>,
    /// Cancel `token` once this many notifications went out.
    cancel_after: Mutex<Option<(usize, CancelToken)>>,
    /// Real-time delay inside every notify.
    notify_delay_ms: AtomicU64,
}

#[allow(dead_code)]
impl MockLink {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            mtu: AtomicU16::new(DEFAULT_ATT_MTU),
            grant: Mutex::new(None),
            mtu_requests: AtomicU32::new(0),
            adverts: AtomicU32::new(0),
            sent: Mutex::new(Vec::new()),
            cancel_after: Mutex::new(None),
            notify_delay_ms: AtomicU64::new(0),
        }
    }

    pub fn connect(&self, mtu: u16) {
        self.mtu.store(mtu, Ordering::Relaxed);
        self.connected.store(true, Ordering::Release);
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
        self.mtu.store(DEFAULT_ATT_MTU, Ordering::Relaxed);
    }

    pub fn grant_mtu(&self, mtu: Option<u16>) {
        *self.grant.lock() = mtu;
    }

    pub fn set_mtu(&self, mtu: u16) {
        self.mtu.store(mtu, Ordering::Relaxed);
    }

    pub fn cancel_after(&self, notifications: usize, token: CancelToken) {
        *self.cancel_after.lock() = Some((notifications, token));
    }

    pub fn set_notify_delay(&self, ms: u64) {
        self.notify_delay_ms.store(ms, Ordering::Relaxed);
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }

    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        core::mem::take(&mut *self.sent.lock())
    }

    pub fn count(&self, marker: &[u8]) -> usize {
        self.sent.lock().iter().filter(|n| n.as_slice() == marker).count()
    }
}

impl LinkPort for MockLink {
    fn notify(&self, data: &[u8]) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        let delay = self.notify_delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        let total = {
            let mut sent = self.sent.lock();
            sent.push(data.to_vec());
            sent.len()
        };
        if let Some((after, token)) = &*self.cancel_after.lock() {
            if total == *after {
                token.cancel();
            }
        }
        Ok(())
    }

    fn mtu(&self) -> u16 {
        self.mtu.load(Ordering::Relaxed)
    }

    fn request_mtu(&self, _mtu: u16) -> Result<(), LinkError> {
        self.mtu_requests.fetch_add(1, Ordering::Relaxed);
        if let Some(granted) = *self.grant.lock() {
            self.mtu.store(granted, Ordering::Relaxed);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn restart_advertising(&self) {
        self.adverts.fetch_add(1, Ordering::Relaxed);
    }
}

// ── ManualClock ───────────────────────────────────────────────

/// Time advances only through `sleep` and `advance`.
#[derive(Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration.as_millis() as u64);
    }
}

// ── MockHeap ──────────────────────────────────────────────────

pub struct MockHeap {
    pub free: AtomicUsize,
    pub fail_primary: AtomicBool,
    pub fail_secondary: AtomicBool,
    pub primary_allocs: AtomicUsize,
    pub secondary_allocs: AtomicUsize,
}

#[allow(dead_code)]
impl MockHeap {
    pub fn new() -> Self {
        Self {
            free: AtomicUsize::new(256 * 1024),
            fail_primary: AtomicBool::new(false),
            fail_secondary: AtomicBool::new(false),
            primary_allocs: AtomicUsize::new(0),
            secondary_allocs: AtomicUsize::new(0),
        }
    }

    pub fn set_free(&self, bytes: usize) {
        self.free.store(bytes, Ordering::Relaxed);
    }
}

impl HeapPort for MockHeap {
    fn free_bytes(&self) -> usize {
        self.free.load(Ordering::Relaxed)
    }

    fn min_free_bytes(&self) -> usize {
        self.free_bytes()
    }

    fn alloc_primary(&self, len: usize) -> Option<PoolBuffer> {
        if self.fail_primary.load(Ordering::Relaxed) {
            return None;
        }
        self.primary_allocs.fetch_add(1, Ordering::Relaxed);
        PoolBuffer::with_capacity(len)
    }

    fn alloc_secondary(&self, len: usize) -> Option<PoolBuffer> {
        if self.fail_secondary.load(Ordering::Relaxed) {
            return None;
        }
        self.secondary_allocs.fetch_add(1, Ordering::Relaxed);
        PoolBuffer::with_capacity(len)
    }
}

// ── Handler / telemetry / sink doubles ────────────────────────

/// Records every command it is handed; optionally replies `ok`.
#[derive(Default)]
pub struct RecordingHandler {
    pub commands: Mutex<Vec<serde_json::Value>>,
    pub saw_high_priority: AtomicBool,
    pub reply_ok: bool,
}

impl CommandHandler for RecordingHandler {
    fn handle(&self, transport: &GatewayTransport, command: serde_json::Value) {
        if transport.is_high_priority() {
            self.saw_high_priority.store(true, Ordering::Relaxed);
        }
        let kind = command
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("unknown")
            .to_owned();
        self.commands.lock().push(command);
        if self.reply_ok {
            let _ = transport.send_ok(&kind);
        }
    }
}

#[derive(Default)]
pub struct QueueTelemetry {
    pub docs: Mutex<VecDeque<serde_json::Value>>,
}

impl TelemetrySource for QueueTelemetry {
    fn has_data(&self) -> bool {
        !self.docs.lock().is_empty()
    }

    fn dequeue(&self) -> Option<serde_json::Value> {
        self.docs.lock().pop_front()
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub published: Vec<(LinkMetrics, LinkState)>,
}

impl MetricsSink for RecordingSink {
    fn publish(&mut self, metrics: &LinkMetrics, link: LinkState) {
        self.published.push((*metrics, link));
    }
}

// ── Harness ───────────────────────────────────────────────────

pub struct Harness {
    pub link: Arc<MockLink>,
    pub clock: Arc<ManualClock>,
    pub heap: Arc<MockHeap>,
    pub transport: Arc<GatewayTransport>,
}

#[allow(dead_code)]
impl Harness {
    pub fn new() -> Self {
        Self::with_config(TransportConfig::default())
    }

    pub fn with_config(cfg: TransportConfig) -> Self {
        let link = Arc::new(MockLink::new());
        let clock = Arc::new(ManualClock::default());
        let heap = Arc::new(MockHeap::new());
        let transport = GatewayTransport::new(cfg, link.clone(), clock.clone(), heap.clone())
            .expect("valid config");
        Self {
            link,
            clock,
            heap,
            transport: Arc::new(transport),
        }
    }

    /// Connect a peer that accepts the preferred MTU as `granted`, running
    /// both the callback and the main-loop halves.
    pub fn connect_with_mtu(&self, granted: u16) {
        self.link.grant_mtu(Some(granted));
        self.link.connect(DEFAULT_ATT_MTU);
        self.transport.on_link_up();
        self.transport.on_connect();
    }

    pub fn disconnect(&self) {
        self.link.disconnect();
        self.transport.on_link_down();
        self.transport.on_disconnect();
    }

    /// Send one framed command as `fragment`-byte writes.
    pub fn write_command(&self, payload: &[u8], fragment: usize) {
        self.transport.on_fragment(START_MARKER);
        for piece in payload.chunks(fragment.max(1)) {
            self.transport.on_fragment(piece);
        }
        self.transport.on_fragment(END_MARKER);
    }
}

// ── Notification stream decoding ──────────────────────────────

pub fn is_progress(notification: &[u8]) -> bool {
    serde_json::from_slice::<serde_json::Value>(notification)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(|t| t.ends_with("_progress")))
        .unwrap_or(false)
}

/// Split recorded notifications into `<END>`-terminated documents,
/// skipping standalone progress notifications and bare markers.
pub fn documents(sent: &[Vec<u8>]) -> Vec<serde_json::Value> {
    let mut docs = Vec::new();
    let mut body = Vec::new();
    for n in sent {
        if n.as_slice() == END_MARKER {
            docs.push(serde_json::from_slice(&body).expect("well-formed document"));
            body.clear();
        } else if n.first() == Some(&b'<') || is_progress(n) {
            continue;
        } else {
            body.extend_from_slice(n);
        }
    }
    docs
}

pub fn progress_reports(sent: &[Vec<u8>]) -> Vec<serde_json::Value> {
    sent.iter()
        .filter(|n| is_progress(n))
        .filter_map(|n| serde_json::from_slice(n).ok())
        .collect()
}
