//! Telemetry streaming to the connected peer.
//!
//! The streaming flag sits behind its own lock with a bounded wait; a busy
//! lock reads as "not streaming" so the streamer simply tries again on its
//! next poll. The telemetry source is only touched while streaming is on.

use core::time::Duration;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;

use super::gateway::GatewayTransport;
use crate::ports::TelemetrySource;

/// Documents forwarded per poll before yielding back to the loop.
const MAX_BATCH: usize = 8;

/// Stream subscription state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No telemetry sent.
    Inactive,
    /// Queued telemetry is forwarded as it arrives.
    Active,
}

pub struct StreamControl {
    state: Mutex<StreamState>,
    lock_timeout: Duration,
}

impl StreamControl {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(StreamState::Inactive),
            lock_timeout,
        }
    }

    /// Returns `false` if the lock was busy and nothing changed.
    pub fn enable(&self) -> bool {
        self.set(StreamState::Active)
    }

    pub fn disable(&self) -> bool {
        self.set(StreamState::Inactive)
    }

    pub fn is_active(&self) -> bool {
        self.state
            .try_lock_for(self.lock_timeout)
            .is_some_and(|s| *s == StreamState::Active)
    }

    fn set(&self, next: StreamState) -> bool {
        let Some(mut state) = self.state.try_lock_for(self.lock_timeout) else {
            warn!("STREAM: flag lock busy, {:?} not applied", next);
            return false;
        };
        if *state != next {
            info!("STREAM: {:?} -> {:?}", *state, next);
            *state = next;
        }
        true
    }
}

/// Forward queued telemetry while streaming stays on. Returns how many
/// documents went out.
pub fn pump(transport: &GatewayTransport, source: &dyn TelemetrySource) -> usize {
    let mut forwarded = 0;
    while forwarded < MAX_BATCH && transport.is_streaming() && source.has_data() {
        let Some(doc) = source.dequeue() else {
            break;
        };
        if let Err(e) = transport.send_telemetry(&doc) {
            warn!("STREAM: telemetry document dropped: {}", e);
            break;
        }
        forwarded += 1;
    }
    if forwarded > 0 {
        debug!("STREAM: forwarded {} document(s)", forwarded);
    }
    forwarded
}

/// Streamer task body. Returns once shutdown is requested.
pub fn run_streamer(transport: Arc<GatewayTransport>, source: Arc<dyn TelemetrySource>) {
    let poll = Duration::from_millis(u64::from(transport.config().stream_poll_ms));
    info!("STREAM: started");
    while !transport.is_shutting_down() {
        if transport.is_streaming() {
            pump(&transport, source.as_ref());
        }
        transport.clock().sleep(poll);
    }
    info!("STREAM: stopped");
}
