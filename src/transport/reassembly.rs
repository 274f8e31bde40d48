//! Inbound fragment reassembly.
//!
//! The peer writes a command as a run of fragments bracketed by markers:
//!
//! ```text
//!  <START>  {"type":"get_  config","dev  ice":3}  <END>
//!  ───┬───  ─────────────── payload ───────────  ──┬──
//!     └ clears buffer                   terminates ┘
//! ```
//!
//! The buffer is allocated once with a fixed capacity. A fragment that
//! would fill it completely is rejected and the whole command dropped
//! (never truncated); the caller reports that to the peer. The rest of a
//! rejected command is dropped up to its `<END>`, so its tail is never
//! dispatched as a command of its own. A partial command left idle longer
//! than the idle timeout is discarded before the next fragment is looked
//! at.

use log::{debug, warn};

use super::command::QueuedCommand;
use super::protocol::{classify, Marker};
use crate::error::FrameError;

/// What a single fragment did to the reassembly state.
#[derive(Debug)]
pub enum FragmentOutcome {
    /// `<START>`: buffer cleared, new command armed.
    Started,
    /// `<CANCEL>`: buffer cleared; caller raises the cancel flag.
    Cancelled,
    /// Payload appended.
    Buffered,
    /// Payload rejected; buffer cleared.
    Overflow(FrameError),
    /// `<END>` with nothing buffered.
    EmptyCommand,
    /// Payload or `<END>` belonging to a command already rejected.
    Dropped,
    /// `<END>` completed a command.
    Complete(QueuedCommand),
    /// `<END>` completed a command but its owned copy could not be allocated.
    AllocFailed { len: usize },
}

/// Result of [`Reassembler::push`].
#[derive(Debug)]
pub struct FragmentReport {
    /// A stale partial command was discarded before this fragment.
    pub stale_cleared: bool,
    pub outcome: FragmentOutcome,
}

pub struct Reassembler {
    buf: Box<[u8]>,
    cursor: usize,
    /// Set by an overflow until the rejected command's `<END>`.
    rejecting: bool,
    last_fragment_ms: Option<u64>,
    idle_timeout_ms: u64,
}

impl Reassembler {
    pub fn new(capacity: usize, idle_timeout_ms: u64) -> Self {
        Self {
            buf: vec![0; capacity].into_boxed_slice(),
            cursor: 0,
            rejecting: false,
            last_fragment_ms: None,
            idle_timeout_ms,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes of the partial command held right now.
    pub fn len(&self) -> usize {
        self.cursor
    }

    pub fn is_empty(&self) -> bool {
        self.cursor == 0
    }

    /// Process one inbound fragment received at `now_ms`.
    pub fn push(&mut self, fragment: &[u8], now_ms: u64) -> FragmentReport {
        let stale_cleared = self.expire_if_idle(now_ms);
        self.last_fragment_ms = Some(now_ms);

        let outcome = match classify(fragment) {
            Some(Marker::Start) => {
                if self.cursor > 0 {
                    debug!("REASM: <START> discarded {} partial bytes", self.cursor);
                }
                self.reset();
                FragmentOutcome::Started
            }
            Some(Marker::Cancel) => {
                self.reset();
                FragmentOutcome::Cancelled
            }
            Some(Marker::End) if self.rejecting => {
                self.rejecting = false;
                FragmentOutcome::Dropped
            }
            Some(Marker::End) => self.terminate(),
            None if self.rejecting => FragmentOutcome::Dropped,
            None => self.append(fragment),
        };

        FragmentReport {
            stale_cleared,
            outcome,
        }
    }

    /// Drop any partial command. Returns how many bytes were discarded.
    pub fn discard(&mut self) -> usize {
        let dropped = self.cursor;
        self.reset();
        self.last_fragment_ms = None;
        dropped
    }

    fn reset(&mut self) {
        self.cursor = 0;
        self.rejecting = false;
    }

    fn expire_if_idle(&mut self, now_ms: u64) -> bool {
        let Some(last) = self.last_fragment_ms else {
            return false;
        };
        let idle = now_ms.saturating_sub(last);
        if idle <= self.idle_timeout_ms {
            return false;
        }
        // An abandoned rejected command stops swallowing fragments too.
        self.rejecting = false;
        if self.cursor == 0 {
            return false;
        }
        warn!(
            "REASM: stale command cleared ({} bytes, idle {} ms)",
            self.cursor, idle
        );
        self.cursor = 0;
        true
    }

    fn append(&mut self, fragment: &[u8]) -> FragmentOutcome {
        let attempted = self.cursor + fragment.len();
        // One byte stays free for the terminator.
        if attempted >= self.buf.len() {
            warn!(
                "REASM: overflow ({} + {} >= {}), command dropped",
                self.cursor,
                fragment.len(),
                self.buf.len()
            );
            self.cursor = 0;
            self.rejecting = true;
            return FragmentOutcome::Overflow(FrameError::Overflow {
                attempted,
                capacity: self.buf.len(),
            });
        }
        self.buf[self.cursor..attempted].copy_from_slice(fragment);
        self.cursor = attempted;
        FragmentOutcome::Buffered
    }

    fn terminate(&mut self) -> FragmentOutcome {
        let len = self.cursor;
        self.cursor = 0;
        if len == 0 {
            warn!("REASM: <END> with empty buffer ignored");
            return FragmentOutcome::EmptyCommand;
        }
        self.buf[len] = 0;
        match QueuedCommand::try_copy_from(&self.buf[..len]) {
            Some(cmd) => FragmentOutcome::Complete(cmd),
            None => {
                warn!("REASM: no heap for {} byte command", len);
                FragmentOutcome::AllocFailed { len }
            }
        }
    }
}
