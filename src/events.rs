//! Link event queue.
//!
//! Events are produced by the Bluedroid GATTS callback and consumed by the
//! main loop, which runs the slow lifecycle handlers (the connect path
//! sleeps while the link settles) off the BLE stack's task. The callback
//! has already run the transport's `on_link_up`/`on_link_down` resets by
//! the time an event is queued.
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────────┐
//! │ GATTS CONNECT│────▶│              │     │                  │
//! │ GATTS DISCON │────▶│  Event Queue │────▶│  Main Loop       │
//! │ GATTS MTU    │────▶│  (lock-free) │     │  route() ──▶ hub │
//! └──────────────┘     └──────────────┘     └──────────────────┘
//! ```

use core::sync::atomic::{AtomicU8, Ordering};

use crate::transport::GatewayTransport;

/// Maximum number of pending events.
/// Power of 2 for efficient ring buffer modulo.
const EVENT_QUEUE_CAP: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Event {
    /// A central connected.
    LinkConnected = 1,
    /// The central dropped or disconnected.
    LinkDisconnected = 2,
    /// The peer completed an ATT MTU exchange.
    MtuUpdated = 3,
}

// ── Lock-free SPSC ring buffer ────────────────────────────────
//
// The GATTS callback writes (produces), the main loop reads (consumes).

static EVENT_HEAD: AtomicU8 = AtomicU8::new(0);
static EVENT_TAIL: AtomicU8 = AtomicU8::new(0);
static EVENT_BUFFER: [AtomicU8; EVENT_QUEUE_CAP] = [const { AtomicU8::new(0) }; EVENT_QUEUE_CAP];

/// Push an event into the queue.
/// Returns `false` if the queue is full (event dropped).
pub fn push_event(event: Event) -> bool {
    let head = EVENT_HEAD.load(Ordering::Relaxed);
    let tail = EVENT_TAIL.load(Ordering::Acquire);
    let next_head = (head + 1) % EVENT_QUEUE_CAP as u8;

    if next_head == tail {
        log::warn!("EVENTS: queue full, {:?} dropped", event);
        return false;
    }

    EVENT_BUFFER[head as usize].store(event as u8, Ordering::Relaxed);
    EVENT_HEAD.store(next_head, Ordering::Release);
    true
}

/// Pop the next event from the queue (single consumer).
pub fn pop_event() -> Option<Event> {
    let tail = EVENT_TAIL.load(Ordering::Relaxed);
    let head = EVENT_HEAD.load(Ordering::Acquire);

    if tail == head {
        return None;
    }

    let raw = EVENT_BUFFER[tail as usize].load(Ordering::Relaxed);
    EVENT_TAIL.store((tail + 1) % EVENT_QUEUE_CAP as u8, Ordering::Release);

    event_from_u8(raw)
}

/// Drain all pending events into a callback, in FIFO order.
pub fn drain_events(mut handler: impl FnMut(Event)) {
    while let Some(event) = pop_event() {
        handler(event);
    }
}

/// Number of pending events.
pub fn queue_len() -> usize {
    let head = EVENT_HEAD.load(Ordering::Relaxed) as usize;
    let tail = EVENT_TAIL.load(Ordering::Relaxed) as usize;
    (head + EVENT_QUEUE_CAP - tail) % EVENT_QUEUE_CAP
}

/// Apply the main-loop half of one link event to the transport.
pub fn route(event: Event, transport: &GatewayTransport) {
    match event {
        Event::LinkConnected => transport.on_connect(),
        Event::LinkDisconnected => transport.on_disconnect(),
        Event::MtuUpdated => {
            transport.monitor_tick();
        }
    }
}

// ── Internal ──────────────────────────────────────────────────

fn event_from_u8(raw: u8) -> Option<Event> {
    match raw {
        1 => Some(Event::LinkConnected),
        2 => Some(Event::LinkDisconnected),
        3 => Some(Event::MtuUpdated),
        _ => None,
    }
}
