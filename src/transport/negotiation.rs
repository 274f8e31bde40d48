//! Link-parameter (MTU) negotiation.
//!
//! ```text
//!           connect                 MTU observed > default
//!   Idle ───────────▶ Initiating ──▶ InProgress ───────────▶ Completed
//!    ▲                    ▲  │            │
//!    │ disconnect         │  └────┬───────┘ elapsed > timeout
//!    │                    │       ▼
//!    │       retry after  └─── Timeout ── retries exhausted ──▶ Failed
//!    │       backoff                                      (fallback MTU)
//! ```
//!
//! The monitor task calls [`Negotiator::poll`] every interval. An expired
//! attempt yields an [`Expired`] token; only that token can drive
//! [`Negotiator::resolve`], which sleeps the backoff with the control lock
//! released. A connection epoch invalidates tokens that outlive their
//! connection.
//!
//! Completion is inferred from the MTU the stack reports for the peer: the
//! peripheral cannot force an exchange, it can only advertise a preferred
//! MTU and watch whether the central picked it up.

use core::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;

use super::metrics::MetricsHub;
use crate::config::{ATT_OVERHEAD, DEFAULT_ATT_MTU, SCRATCH_CAPACITY, TransportConfig};
use crate::ports::{Clock, LinkPort};

// ── States ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LinkState {
    /// No peer connected.
    Idle,
    /// Attempt started, MTU request not yet accepted by the stack.
    Initiating { since_ms: u64 },
    /// MTU request accepted, waiting for the peer.
    InProgress { since_ms: u64 },
    /// Attempt expired, retry decision pending.
    Timeout,
    Completed { mtu: u16 },
    Failed { fallback_mtu: u16 },
}

impl LinkState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Initiating { .. } => "initiating",
            Self::InProgress { .. } => "in_progress",
            Self::Timeout => "timeout",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn is_negotiating(&self) -> bool {
        matches!(self, Self::Initiating { .. } | Self::InProgress { .. })
    }

    // Transition functions. A transition that does not apply to the
    // current state returns it unchanged.

    fn begin(now_ms: u64) -> Self {
        Self::Initiating { since_ms: now_ms }
    }

    fn requested(self) -> Self {
        match self {
            Self::Initiating { since_ms } => Self::InProgress { since_ms },
            other => other,
        }
    }

    fn observe(self, mtu: u16) -> Self {
        if self.is_negotiating() && mtu > DEFAULT_ATT_MTU {
            Self::Completed { mtu }
        } else {
            self
        }
    }

    fn expire(self, now_ms: u64, timeout_ms: u64) -> Self {
        match self {
            Self::Initiating { since_ms } | Self::InProgress { since_ms }
                if now_ms.saturating_sub(since_ms) > timeout_ms =>
            {
                Self::Timeout
            }
            other => other,
        }
    }

    fn retry(self, now_ms: u64) -> Self {
        match self {
            Self::Timeout => Self::begin(now_ms),
            other => other,
        }
    }

    fn fail(self, fallback_mtu: u16) -> Self {
        match self {
            Self::Timeout => Self::Failed { fallback_mtu },
            other => other,
        }
    }
}

// ── Monitor verdicts ─────────────────────────────────────────

/// Proof that an attempt expired on a given connection.
#[derive(Debug)]
#[must_use]
pub struct Expired {
    epoch: u32,
}

#[derive(Debug)]
pub enum PollVerdict {
    /// Control lock busy; try again next tick.
    Skipped,
    /// Idle, Completed or Failed: nothing to check.
    Settled,
    /// Attempt still within its timeout.
    Pending,
    Completed { mtu: u16 },
    Expired(Expired),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Skipped,
    /// The connection changed while the decision was pending.
    Stale,
    Retrying { attempt: u8, delay: Duration },
    Failed { fallback_mtu: u16 },
}

/// `base * 2^(attempt-1) + jitter`.
pub fn backoff_delay(base_ms: u32, attempt: u8, jitter_ms: u32) -> Duration {
    let exp = u32::from(attempt.saturating_sub(1)).min(16);
    let ms = u64::from(base_ms) * (1u64 << exp) + u64::from(jitter_ms);
    Duration::from_millis(ms)
}

// ── Negotiator ───────────────────────────────────────────────

struct Control {
    state: LinkState,
    retry_count: u8,
    epoch: u32,
}

pub struct Negotiator {
    control: Mutex<Control>,
    lock_timeout: Duration,
    preferred_mtu: u16,
    timeout_ms: u64,
    max_retries: u8,
    backoff_base_ms: u32,
    jitter_ms: u32,
    fallback_mtu: u16,
}

impl Negotiator {
    pub fn new(cfg: &TransportConfig) -> Self {
        Self {
            control: Mutex::new(Control {
                state: LinkState::Idle,
                retry_count: 0,
                epoch: 0,
            }),
            lock_timeout: Duration::from_millis(u64::from(cfg.negotiation_lock_timeout_ms)),
            preferred_mtu: cfg.preferred_mtu,
            timeout_ms: u64::from(cfg.negotiation_timeout_ms),
            max_retries: cfg.negotiation_max_retries,
            backoff_base_ms: cfg.negotiation_backoff_base_ms,
            jitter_ms: cfg.negotiation_jitter_ms,
            fallback_mtu: cfg.clamped_fallback_mtu(),
        }
    }

    /// Current state, or `None` if the control lock is busy.
    pub fn state(&self) -> Option<LinkState> {
        self.control.try_lock_for(self.lock_timeout).map(|c| c.state)
    }

    /// Start a fresh negotiation for a new connection.
    pub fn restart(&self, now_ms: u64, link: &dyn LinkPort, metrics: &MetricsHub) -> bool {
        let epoch = {
            let Some(mut ctl) = self.control.try_lock_for(self.lock_timeout) else {
                warn!("NEG: control lock busy, restart skipped");
                return false;
            };
            ctl.epoch = ctl.epoch.wrapping_add(1);
            ctl.state = LinkState::begin(now_ms);
            ctl.retry_count = 0;
            ctl.epoch
        };
        metrics.update(|m| m.negotiation_attempts += 1);
        self.request(link, epoch);
        true
    }

    /// Peer gone: park in `Idle` and invalidate pending tokens.
    pub fn stop(&self) {
        if let Some(mut ctl) = self.control.try_lock_for(self.lock_timeout) {
            ctl.epoch = ctl.epoch.wrapping_add(1);
            ctl.state = LinkState::Idle;
            ctl.retry_count = 0;
        } else {
            warn!("NEG: control lock busy, stop skipped");
        }
    }

    /// One monitor check against the MTU the link currently reports.
    pub fn poll(&self, now_ms: u64, link_mtu: u16, metrics: &MetricsHub) -> PollVerdict {
        let Some(mut ctl) = self.control.try_lock_for(self.lock_timeout) else {
            return PollVerdict::Skipped;
        };
        let state = ctl.state;
        match state {
            LinkState::Initiating { .. } | LinkState::InProgress { .. } => {
                if let LinkState::Completed { mtu } = state.observe(link_mtu) {
                    ctl.state = LinkState::Completed { mtu };
                    drop(ctl);
                    info!("NEG: completed, MTU {}", mtu);
                    metrics.update(|m| m.negotiated_mtu = mtu);
                    return PollVerdict::Completed { mtu };
                }
                if state.expire(now_ms, self.timeout_ms) == LinkState::Timeout {
                    ctl.state = LinkState::Timeout;
                    let epoch = ctl.epoch;
                    let attempt = ctl.retry_count + 1;
                    drop(ctl);
                    warn!("NEG: attempt {} timed out (MTU still {})", attempt, link_mtu);
                    metrics.update(|m| m.negotiation_timeouts += 1);
                    return PollVerdict::Expired(Expired { epoch });
                }
                PollVerdict::Pending
            }
            LinkState::Timeout => PollVerdict::Expired(Expired { epoch: ctl.epoch }),
            LinkState::Idle | LinkState::Completed { .. } | LinkState::Failed { .. } => PollVerdict::Settled,
        }
    }

    /// Retry with backoff, or give up and install the fallback.
    ///
    /// The backoff sleep happens with the control lock released.
    pub fn resolve(
        &self,
        expired: Expired,
        link: &dyn LinkPort,
        clock: &dyn Clock,
        metrics: &MetricsHub,
    ) -> Resolution {
        let attempt = {
            let Some(mut ctl) = self.control.try_lock_for(self.lock_timeout) else {
                return Resolution::Skipped;
            };
            if ctl.epoch != expired.epoch || ctl.state != LinkState::Timeout {
                return Resolution::Stale;
            }
            if ctl.retry_count >= self.max_retries {
                ctl.state = ctl.state.fail(self.fallback_mtu);
                None
            } else {
                ctl.retry_count += 1;
                Some(ctl.retry_count)
            }
        };

        let Some(attempt) = attempt else {
            warn!(
                "NEG: failed after {} retries, fallback MTU {}",
                self.max_retries, self.fallback_mtu
            );
            let fallback = self.fallback_mtu;
            metrics.update(|m| {
                m.negotiation_failures += 1;
                m.negotiated_mtu = fallback;
            });
            return Resolution::Failed {
                fallback_mtu: fallback,
            };
        };

        let delay = backoff_delay(
            self.backoff_base_ms,
            attempt,
            random_below(self.jitter_ms.saturating_add(1)),
        );
        info!(
            "NEG: retry {}/{} in {} ms",
            attempt,
            self.max_retries,
            delay.as_millis()
        );
        clock.sleep(delay);

        {
            let Some(mut ctl) = self.control.try_lock_for(self.lock_timeout) else {
                return Resolution::Skipped;
            };
            if ctl.epoch != expired.epoch || ctl.state != LinkState::Timeout {
                return Resolution::Stale;
            }
            ctl.state = ctl.state.retry(clock.now_ms());
        }
        metrics.update(|m| m.negotiation_attempts += 1);
        self.request(link, expired.epoch);
        Resolution::Retrying { attempt, delay }
    }

    /// MTU unit the transmission engine should size chunks for.
    pub fn unit_mtu(&self, link_mtu: u16) -> u16 {
        match self.state() {
            Some(LinkState::Completed { mtu }) => mtu,
            Some(LinkState::Failed { fallback_mtu }) => fallback_mtu,
            _ => link_mtu,
        }
    }

    /// Notification payload size for the current unit, capped to the
    /// scratch buffer.
    pub fn chunk_size(&self, link_mtu: u16) -> usize {
        let unit = self.unit_mtu(link_mtu).max(DEFAULT_ATT_MTU);
        usize::from(unit - ATT_OVERHEAD).min(SCRATCH_CAPACITY)
    }

    fn request(&self, link: &dyn LinkPort, epoch: u32) {
        match link.request_mtu(self.preferred_mtu) {
            Ok(()) => {
                if let Some(mut ctl) = self.control.try_lock_for(self.lock_timeout) {
                    if ctl.epoch == epoch {
                        ctl.state = ctl.state.requested();
                    }
                }
                debug!("NEG: requested MTU {}", self.preferred_mtu);
            }
            Err(e) => warn!("NEG: MTU request rejected: {}", e),
        }
    }
}

// ── Jitter source ────────────────────────────────────────────

/// Uniform-ish value in `0..bound` from the hardware RNG.
#[cfg(target_os = "espidf")]
fn random_below(bound: u32) -> u32 {
    if bound == 0 {
        return 0;
    }
    // SAFETY: esp_random reads the hardware RNG register; no preconditions.
    (unsafe { esp_idf_svc::sys::esp_random() }) % bound
}

/// Simulation stub: `RandomState` gives non-cryptographic entropy.
#[cfg(not(target_os = "espidf"))]
fn random_below(bound: u32) -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    if bound == 0 {
        return 0;
    }
    (RandomState::new().build_hasher().finish() % u64::from(bound)) as u32
}
