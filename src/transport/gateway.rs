//! `GatewayTransport`, the shared transport instance.
//!
//! One instance lives for the whole firmware run, shared through an `Arc`
//! by the BLE callback context and the worker, streamer and monitor tasks.
//!
//! It owns four independent locks, never nested in one another:
//!
//! | Lock              | Guards                          | On timeout         |
//! |-------------------|---------------------------------|--------------------|
//! | metrics           | [`LinkMetrics`] counters        | update skipped     |
//! | negotiation       | [`LinkState`], retries, epoch   | check skipped      |
//! | outbound          | scratch buffer, chunk stream    | peer sees "busy"   |
//! | streaming         | telemetry streaming flag        | treated as off     |
//!
//! The reassembly buffer has its own mutex too, but only the link callback
//! context touches it, so it is never contended.
//!
//! Connect and disconnect are split in two. The `on_link_*` halves run in
//! the link callback, in order with the writes, and only reset state. The
//! `on_connect`/`on_disconnect` halves run on the main loop.

use core::time::Duration;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use super::dispatch::{CommandQueue, FaultQueue, InboundFault};
use super::engine::{CancelToken, TransmissionEngine};
use super::metrics::{LinkMetrics, MetricsHub};
use super::negotiation::{LinkState, Negotiator, PollVerdict, Resolution};
use super::priority::{PriorityFlag, PriorityQuery};
use super::protocol::{ACK_MARKER, ProgressKind, StatusDoc};
use super::reassembly::{FragmentOutcome, Reassembler};
use super::stream::StreamControl;
use crate::config::TransportConfig;
use crate::error::{Error, SendError};
use crate::ports::{Clock, CommandHandler, HeapPort, LinkPort};

pub struct GatewayTransport {
    cfg: TransportConfig,
    link: Arc<dyn LinkPort>,
    clock: Arc<dyn Clock>,
    heap: Arc<dyn HeapPort>,
    metrics: Arc<MetricsHub>,
    negotiator: Arc<Negotiator>,
    engine: TransmissionEngine,
    reassembly: Mutex<Reassembler>,
    queue: CommandQueue,
    faults: FaultQueue,
    priority: PriorityFlag,
    streaming: StreamControl,
    handler: RwLock<Option<Arc<dyn CommandHandler>>>,
    shutdown: AtomicBool,
}

impl GatewayTransport {
    pub fn new(
        cfg: TransportConfig,
        link: Arc<dyn LinkPort>,
        clock: Arc<dyn Clock>,
        heap: Arc<dyn HeapPort>,
    ) -> Result<Self, Error> {
        cfg.validate()?;

        let metrics = Arc::new(MetricsHub::new(Duration::from_millis(u64::from(
            cfg.metrics_lock_timeout_ms,
        ))));
        let negotiator = Arc::new(Negotiator::new(&cfg));
        let engine = TransmissionEngine::new(
            &cfg,
            Arc::clone(&link),
            Arc::clone(&clock),
            Arc::clone(&heap),
            Arc::clone(&negotiator),
            Arc::clone(&metrics),
        );
        let reassembly = Reassembler::new(
            cfg.reassembly_capacity as usize,
            u64::from(cfg.reassembly_idle_timeout_ms),
        );
        let streaming = StreamControl::new(Duration::from_millis(u64::from(
            cfg.streaming_lock_timeout_ms,
        )));

        Ok(Self {
            cfg,
            link,
            clock,
            heap,
            metrics,
            negotiator,
            engine,
            reassembly: Mutex::new(reassembly),
            queue: CommandQueue::new(),
            faults: FaultQueue::new(),
            priority: PriorityFlag::new(),
            streaming,
            handler: RwLock::new(None),
            shutdown: AtomicBool::new(false),
        })
    }

    // ── Inbound ──────────────────────────────────────────────

    /// Feed one GATT write on the command characteristic.
    ///
    /// Called serially from the link callback context. Never waits on the
    /// outbound lock: failures are left for the worker to report.
    pub fn on_fragment(&self, fragment: &[u8]) {
        let now = self.clock.now_ms();
        self.metrics.update(|m| {
            m.fragments_received += 1;
            m.bytes_received = m.bytes_received.saturating_add(fragment.len() as u32);
        });

        let report = self.reassembly.lock().push(fragment, now);
        if report.stale_cleared {
            self.metrics.update(|m| m.stale_clears += 1);
        }

        match report.outcome {
            FragmentOutcome::Started
            | FragmentOutcome::Buffered
            | FragmentOutcome::EmptyCommand
            | FragmentOutcome::Dropped => {}
            FragmentOutcome::Cancelled => {
                info!("LINK: cancel requested by peer");
                self.engine.cancel_token().cancel();
                if let Err(e) = self.engine.notify_marker(ACK_MARKER) {
                    warn!("LINK: cancel ACK not sent: {}", e);
                }
            }
            FragmentOutcome::Overflow(_) => {
                self.metrics.update(|m| m.framing_errors += 1);
                self.faults.report(InboundFault::Overflow, &self.metrics);
            }
            FragmentOutcome::AllocFailed { .. } => {
                self.faults.report(InboundFault::NoMemory, &self.metrics);
            }
            FragmentOutcome::Complete(cmd) => {
                // Full queue: already counted and logged by the dispatcher.
                let _ = self.queue.dispatch(cmd, &self.metrics);
            }
        }
    }

    // ── Connection lifecycle ─────────────────────────────────

    /// Link callback half of a connect: clears per-connection state before
    /// the peer's first write can land. Never blocks.
    pub fn on_link_up(&self) {
        self.metrics.reset();
        // Reports owed to the previous peer.
        while self.faults.take().is_some() {}
        let dirty = self.reassembly.lock().discard();
        if dirty > 0 {
            debug!("LINK: {} stale bytes dropped on connect", dirty);
        }
    }

    /// Main-loop half of a connect: starts MTU negotiation and waits for
    /// the link to settle. Writes that arrived since [`Self::on_link_up`]
    /// are kept.
    pub fn on_connect(&self) {
        info!("LINK: peer connected (MTU {})", self.link.mtu());
        self.negotiator
            .restart(self.clock.now_ms(), self.link.as_ref(), &self.metrics);

        self.clock
            .sleep(Duration::from_millis(u64::from(self.cfg.connect_settle_ms)));
        self.monitor_tick();

        let mtu = self.link.mtu();
        info!(
            "LINK: MTU {} -> chunk {} bytes, negotiation {}",
            mtu,
            self.negotiator.chunk_size(mtu),
            self.link_state().map_or("busy", |s| s.name())
        );
    }

    /// Link callback half of a disconnect: drops any unfinished command.
    pub fn on_link_down(&self) {
        let dirty = self.reassembly.lock().discard();
        if dirty > 0 {
            warn!("LINK: peer disconnected with {} bytes of unfinished command", dirty);
        }
    }

    /// Main-loop half of a disconnect.
    pub fn on_disconnect(&self) {
        info!("LINK: peer disconnected");
        self.disable_streaming();
        self.negotiator.stop();
        self.link.restart_advertising();
    }

    /// Send the error reports owed for inbound failures. Runs on the
    /// worker. Returns how many went out.
    pub fn flush_faults(&self) -> usize {
        let mut sent = 0;
        while let Some(fault) = self.faults.take() {
            self.report_failure(fault.message(), fault.peer_type());
            sent += 1;
        }
        sent
    }

    /// One negotiation check; resolves an expired attempt in place.
    pub fn monitor_tick(&self) -> Option<Resolution> {
        let verdict = self
            .negotiator
            .poll(self.clock.now_ms(), self.link.mtu(), &self.metrics);
        match verdict {
            PollVerdict::Expired(expired) => Some(self.negotiator.resolve(
                expired,
                self.link.as_ref(),
                self.clock.as_ref(),
                &self.metrics,
            )),
            PollVerdict::Skipped
            | PollVerdict::Settled
            | PollVerdict::Pending
            | PollVerdict::Completed { .. } => None,
        }
    }

    // ── Outbound API for command handlers ────────────────────

    /// Stream a command result. Large results report
    /// `config_download_progress` while they go out.
    pub fn send_response<T: Serialize + ?Sized>(&self, doc: &T) -> Result<(), SendError> {
        self.engine.send(doc, Some(ProgressKind::ConfigDownload))
    }

    /// Stream a telemetry document (no progress reporting).
    pub fn send_telemetry<T: Serialize + ?Sized>(&self, doc: &T) -> Result<(), SendError> {
        self.engine.send(doc, None)
    }

    pub fn send_ok(&self, kind: &str) -> Result<(), SendError> {
        self.engine.send(&StatusDoc::ok(kind), None)
    }

    pub fn send_error(&self, message: &str, kind: &str) -> Result<(), SendError> {
        self.engine.send(&StatusDoc::error(message, kind), None)
    }

    /// Standalone progress document for OTA and config collaborators.
    pub fn report_progress(&self, kind: ProgressKind, done: usize, total: usize) -> Result<(), SendError> {
        self.engine.report_progress(kind, done, total)
    }

    // ── Control ──────────────────────────────────────────────

    pub fn register_handler(&self, handler: Arc<dyn CommandHandler>) {
        *self.handler.write() = Some(handler);
    }

    pub fn handler(&self) -> Option<Arc<dyn CommandHandler>> {
        self.handler.read().clone()
    }

    pub fn priority_query(&self) -> PriorityQuery {
        self.priority.query()
    }

    pub fn is_high_priority(&self) -> bool {
        self.priority.is_raised()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.engine.cancel_token()
    }

    pub fn enable_streaming(&self) -> bool {
        self.streaming.enable()
    }

    pub fn disable_streaming(&self) -> bool {
        self.streaming.disable()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.is_active()
    }

    pub fn metrics(&self) -> Option<LinkMetrics> {
        self.metrics.snapshot()
    }

    pub fn link_state(&self) -> Option<LinkState> {
        self.negotiator.state()
    }

    /// Notification payload size the next transmission will use.
    pub fn chunk_size(&self) -> usize {
        self.negotiator.chunk_size(self.link.mtu())
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.engine.in_flight()
    }

    pub fn free_heap(&self) -> usize {
        self.heap.free_bytes()
    }

    pub fn min_free_heap(&self) -> usize {
        self.heap.min_free_bytes()
    }

    pub fn uptime_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Stop the tasks and wait up to `timeout` for transmissions to drain.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        info!("LINK: shutting down");
        self.shutdown.store(true, Ordering::Release);
        self.disable_streaming();
        self.engine.drain(timeout)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    // ── Crate-internal accessors for the task loops ──────────

    pub(crate) fn config(&self) -> &TransportConfig {
        &self.cfg
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub(crate) fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub(crate) fn priority(&self) -> &PriorityFlag {
        &self.priority
    }

    pub(crate) fn metrics_hub(&self) -> &MetricsHub {
        &self.metrics
    }

    fn report_failure(&self, message: &str, kind: &str) {
        if let Err(e) = self.send_error(message, kind) {
            warn!("LINK: error report not delivered: {}", e);
        }
    }
}
