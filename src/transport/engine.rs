//! Outbound transmission engine.
//!
//! Streams one JSON document to the peer as a run of notifications:
//!
//! ```text
//!  send(doc)
//!   │ in-flight += 1
//!   │ outbound lock (bounded wait) ──timeout──▶ "busy" owed to the peer
//!   │ measure serialized size ──────above cap──▶ inline "too large" error
//!   │ free heap < emergency ───────────────────▶ inline "low memory" error
//!   │ buffer: primary pool → secondary pool ──▶ inline "out of memory"
//!   │ plan: chunk size + pacing tier
//!   ├─▶ chunk ─▶ delay ─▶ chunk ─▶ ... ─▶ <END>
//!   │      └─ cancel flag set ─▶ <CANCELLED>
//!   │      └─ every ~10 % of a >5 KB payload ─▶ progress document
//!   ▼ in-flight -= 1
//! ```
//!
//! Inline errors are formatted on the stack so they still go out when the
//! heap is exhausted. Every chunk passes through one fixed scratch buffer
//! that lives inside the outbound lock, and every notification, inline
//! errors included, is sent with that lock held. A caller that times out on
//! the lock leaves its "busy" answer pending; the holder writes it after its
//! own `<END>`, so the two documents never interleave.

use core::time::Duration;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;

use super::metrics::MetricsHub;
use super::negotiation::Negotiator;
use super::protocol::{self, CANCELLED_MARKER, END_MARKER, ProgressKind};
use crate::buffer::PoolBuffer;
use crate::config::{SCRATCH_CAPACITY, TransportConfig};
use crate::error::SendError;
use crate::ports::{Clock, HeapPort, LinkPort};

// ── Cancellation ─────────────────────────────────────────────

/// Shared flag set by the `<CANCEL>` marker and consumed by the engine
/// before each chunk.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Clear the flag, returning whether it was set.
    pub fn take(&self) -> bool {
        self.flag.swap(false, Ordering::AcqRel)
    }
}

// ── Chunk planning ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub chunk_size: usize,
    pub delay: Duration,
    pub report_progress: bool,
    /// Chunk size was forced down by memory pressure.
    pub low_memory: bool,
}

/// Payload-size tiers and memory-pressure override.
#[derive(Debug, Clone, Copy)]
pub struct PacingPolicy {
    medium_bytes: usize,
    large_bytes: usize,
    fast: Duration,
    moderate: Duration,
    slow: Duration,
    low_memory_free: usize,
    low_memory_chunk: usize,
}

impl PacingPolicy {
    pub fn from_config(cfg: &TransportConfig) -> Self {
        Self {
            medium_bytes: cfg.medium_payload_bytes as usize,
            large_bytes: cfg.large_payload_bytes as usize,
            fast: Duration::from_millis(u64::from(cfg.fast_chunk_delay_ms)),
            moderate: Duration::from_millis(u64::from(cfg.moderate_chunk_delay_ms)),
            slow: Duration::from_millis(u64::from(cfg.slow_chunk_delay_ms)),
            low_memory_free: cfg.low_memory_free_bytes as usize,
            low_memory_chunk: usize::from(cfg.low_memory_chunk),
        }
    }

    /// Pick chunk size and inter-chunk delay for a `total`-byte payload.
    ///
    /// `unit_chunk` is the negotiated (or fallback) notification payload.
    pub fn plan(&self, total: usize, free_heap: usize, unit_chunk: usize) -> ChunkPlan {
        let delay = if total > self.large_bytes {
            self.slow
        } else if total > self.medium_bytes {
            self.moderate
        } else {
            self.fast
        };
        let low_memory = free_heap < self.low_memory_free;
        let mut chunk_size = unit_chunk.clamp(1, SCRATCH_CAPACITY);
        if low_memory {
            chunk_size = chunk_size.min(self.low_memory_chunk);
        }
        ChunkPlan {
            chunk_size,
            delay,
            report_progress: total > self.medium_bytes,
            low_memory,
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────

/// `io::Write` sink that only counts bytes.
struct ByteCounter(usize);

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Serialized length of `doc` without allocating.
pub fn serialized_len<T: Serialize + ?Sized>(doc: &T) -> Result<usize, SendError> {
    let mut counter = ByteCounter(0);
    serde_json::to_writer(&mut counter, doc).map_err(|_| SendError::Serialize)?;
    Ok(counter.0)
}

/// Keeps the in-flight count raised for its lifetime.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::AcqRel);
        Self(count)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

type Scratch = heapless::Vec<u8, SCRATCH_CAPACITY>;

// ── Engine ───────────────────────────────────────────────────

pub struct TransmissionEngine {
    link: Arc<dyn LinkPort>,
    clock: Arc<dyn Clock>,
    heap: Arc<dyn HeapPort>,
    negotiator: Arc<Negotiator>,
    metrics: Arc<MetricsHub>,
    pacing: PacingPolicy,
    max_response: usize,
    margin: usize,
    emergency_free: usize,
    progress_step: u8,
    lock_timeout: Duration,
    drain_poll: Duration,
    outbound: Mutex<Scratch>,
    /// A "busy" answer owed to the peer, written by whoever holds `outbound`.
    busy_pending: AtomicBool,
    in_flight: AtomicUsize,
    cancel: CancelToken,
}

impl TransmissionEngine {
    pub fn new(
        cfg: &TransportConfig,
        link: Arc<dyn LinkPort>,
        clock: Arc<dyn Clock>,
        heap: Arc<dyn HeapPort>,
        negotiator: Arc<Negotiator>,
        metrics: Arc<MetricsHub>,
    ) -> Self {
        Self {
            link,
            clock,
            heap,
            negotiator,
            metrics,
            pacing: PacingPolicy::from_config(cfg),
            max_response: cfg.max_response_bytes as usize,
            margin: cfg.response_margin_bytes as usize,
            emergency_free: cfg.emergency_free_bytes as usize,
            progress_step: cfg.progress_step_percent,
            lock_timeout: Duration::from_millis(u64::from(cfg.transmission_lock_timeout_ms)),
            drain_poll: Duration::from_millis(u64::from(cfg.drain_poll_ms)),
            outbound: Mutex::new(heapless::Vec::new()),
            busy_pending: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            cancel: CancelToken::default(),
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Stream `doc` to the peer. Large payloads report progress as
    /// `progress`, when given.
    pub fn send<T: Serialize + ?Sized>(
        &self,
        doc: &T,
        progress: Option<ProgressKind>,
    ) -> Result<(), SendError> {
        let _flight = InFlight::enter(&self.in_flight);

        let Some(mut scratch) = self.outbound.try_lock_for(self.lock_timeout) else {
            warn!(
                "TX: outbound lock not acquired in {} ms",
                self.lock_timeout.as_millis()
            );
            self.metrics.update(|m| {
                m.lock_timeouts += 1;
                m.transmissions_failed += 1;
            });
            self.busy_pending.store(true, Ordering::Release);
            // The holder may have finished between the timeout and now.
            if let Some(mut scratch) = self.outbound.try_lock() {
                self.flush_busy(&mut scratch);
            }
            return Err(SendError::LockTimeout);
        };

        // A cancel that arrived while nothing was in flight must not abort
        // this response.
        self.cancel.take();

        let result = self.transmit(&mut scratch, doc, progress);
        match result {
            Ok(()) => self.metrics.update(|m| m.transmissions_completed += 1),
            Err(SendError::Cancelled) => self.metrics.update(|m| m.cancellations += 1),
            Err(_) => self.metrics.update(|m| m.transmissions_failed += 1),
        };
        self.flush_busy(&mut scratch);
        result
    }

    /// Single standalone notification carrying a progress document.
    pub fn report_progress(&self, kind: ProgressKind, done: usize, total: usize) -> Result<(), SendError> {
        let doc = protocol::progress_doc(kind, done, total);
        self.link.notify(doc.as_bytes())?;
        Ok(())
    }

    /// Send a bare marker outside the chunk stream (e.g. `<ACK>`).
    pub fn notify_marker(&self, marker: &[u8]) -> Result<(), SendError> {
        self.link.notify(marker)?;
        Ok(())
    }

    /// Wait until no transmission is in flight. `false` on timeout.
    pub fn drain(&self, timeout: Duration) -> bool {
        let deadline = self.clock.now_ms() + timeout.as_millis() as u64;
        loop {
            let pending = self.in_flight();
            if pending == 0 {
                return true;
            }
            if self.clock.now_ms() >= deadline {
                warn!("TX: drain timed out with {} transmission(s) in flight", pending);
                return false;
            }
            self.clock.sleep(self.drain_poll);
        }
    }

    fn transmit<T: Serialize + ?Sized>(
        &self,
        scratch: &mut Scratch,
        doc: &T,
        progress: Option<ProgressKind>,
    ) -> Result<(), SendError> {
        let total = serialized_len(doc)?;
        if total > self.max_response {
            warn!("TX: response {} bytes exceeds cap {}", total, self.max_response);
            self.emit_inline(scratch, "Response too large", "capacity");
            return Err(SendError::TooLarge {
                len: total,
                cap: self.max_response,
            });
        }

        let free = self.heap.free_bytes();
        if free < self.emergency_free {
            warn!(
                "TX: free heap {} below emergency threshold {}, aborting",
                free, self.emergency_free
            );
            self.emit_inline(scratch, "Low memory", "memory");
            return Err(SendError::LowMemory { free });
        }

        let requested = total + self.margin;
        let Some(mut payload) = self.allocate(requested) else {
            warn!("TX: no pool can hold {} bytes", requested);
            self.emit_inline(scratch, "Out of memory", "memory");
            return Err(SendError::OutOfMemory { requested });
        };
        serde_json::to_writer(&mut payload, doc).map_err(|_| SendError::Serialize)?;

        let unit_chunk = self.negotiator.chunk_size(self.link.mtu());
        let plan = self.pacing.plan(payload.len(), self.heap.free_bytes(), unit_chunk);
        if plan.low_memory {
            debug!("TX: memory pressure, chunk forced to {}", plan.chunk_size);
            self.metrics.update(|m| m.low_memory_chunks += 1);
        }
        debug!(
            "TX: {} bytes in {} byte chunks, {} ms apart",
            payload.len(),
            plan.chunk_size,
            plan.delay.as_millis()
        );

        self.stream(scratch, &payload, &plan, progress)
    }

    fn stream(
        &self,
        scratch: &mut Scratch,
        payload: &[u8],
        plan: &ChunkPlan,
        progress: Option<ProgressKind>,
    ) -> Result<(), SendError> {
        let total = payload.len();
        let step = self.progress_step.max(1);
        let mut next_report = step;
        let mut sent = 0usize;

        for chunk in payload.chunks(plan.chunk_size) {
            if self.cancel.take() {
                info!("TX: cancelled by peer at {}/{} bytes", sent, total);
                self.link.notify(CANCELLED_MARKER)?;
                return Err(SendError::Cancelled);
            }

            scratch.clear();
            if scratch.extend_from_slice(chunk).is_err() {
                return Err(SendError::TooLarge {
                    len: chunk.len(),
                    cap: SCRATCH_CAPACITY,
                });
            }
            self.link.notify(&scratch[..])?;
            sent += chunk.len();
            self.metrics.update(|m| {
                m.fragments_sent += 1;
                m.bytes_sent = m.bytes_sent.saturating_add(chunk.len() as u32);
            });

            if let Some(kind) = progress.filter(|_| plan.report_progress) {
                let pct = protocol::percent(sent, total);
                if pct >= next_report {
                    if let Err(e) = self.report_progress(kind, sent, total) {
                        debug!("TX: progress notify failed: {}", e);
                    }
                    next_report = (pct / step).saturating_add(1).saturating_mul(step);
                }
            }

            self.clock.sleep(plan.delay);
        }

        self.link.notify(END_MARKER)?;
        Ok(())
    }

    fn allocate(&self, len: usize) -> Option<PoolBuffer> {
        if let Some(buf) = self.heap.alloc_primary(len) {
            return Some(buf);
        }
        debug!("TX: primary pool refused {} bytes, trying secondary", len);
        let buf = self.heap.alloc_secondary(len)?;
        self.metrics.update(|m| m.secondary_pool_allocs += 1);
        Some(buf)
    }

    /// Write the pending "busy" answer, if any. Takes the scratch buffer as
    /// proof that the outbound lock is held.
    fn flush_busy(&self, scratch: &mut Scratch) {
        if self.busy_pending.swap(false, Ordering::AcqRel) {
            self.emit_inline(scratch, "Transmission busy", "busy");
        }
    }

    /// Stack-only error document, chunked to the current unit and closed
    /// with `<END>`. Only callable with the outbound lock held.
    fn emit_inline(&self, scratch: &mut Scratch, message: &'static str, kind: &'static str) {
        let doc = protocol::inline_error(message, kind);
        let chunk = self.negotiator.chunk_size(self.link.mtu()).clamp(1, SCRATCH_CAPACITY);
        for piece in doc.as_bytes().chunks(chunk) {
            scratch.clear();
            // `chunk` never exceeds the scratch capacity.
            let _ = scratch.extend_from_slice(piece);
            if let Err(e) = self.link.notify(&scratch[..]) {
                warn!("TX: inline error not delivered: {}", e);
                return;
            }
        }
        if let Err(e) = self.link.notify(END_MARKER) {
            warn!("TX: inline error not terminated: {}", e);
        }
    }
}
