//! Command queue between the inbound link context and the worker.
//!
//! Uses an `embassy-sync` bounded channel so the link callback never
//! blocks: a full queue sheds the new command on the spot.
//!
//! ```text
//! ┌──────────────┐ QueuedCommand ┌──────────────┐
//! │ link callback│──try_send────▶│    worker    │
//! │ (reassembly) │   depth 20    │ (bounded wait)│
//! │              │ InboundFault  │              │
//! │              │──try_send────▶│ error report │
//! └──────────────┘    depth 4    └──────────────┘
//! ```
//!
//! Framing failures travel the same way: the callback records an
//! [`InboundFault`] and the worker streams the error document, since a
//! send can wait on the outbound lock.

use core::time::Duration;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::{Channel, TrySendError};
use log::warn;

use super::command::QueuedCommand;
use super::metrics::MetricsHub;
use crate::config::{COMMAND_QUEUE_DEPTH, FAULT_QUEUE_DEPTH};
use crate::error::QueueError;
use crate::ports::Clock;

/// Sleep between two polls while the worker waits for a command.
const POLL_NAP: Duration = Duration::from_millis(5);

pub struct CommandQueue {
    channel: Channel<CriticalSectionRawMutex, QueuedCommand, COMMAND_QUEUE_DEPTH>,
}

impl CommandQueue {
    pub const fn new() -> Self {
        Self {
            channel: Channel::new(),
        }
    }

    /// Hand a complete command to the worker without blocking.
    ///
    /// On a full queue the command is dropped here, releasing its buffer,
    /// and the drop counter advances.
    pub fn dispatch(&self, cmd: QueuedCommand, metrics: &MetricsHub) -> Result<(), QueueError> {
        match self.channel.try_send(cmd) {
            Ok(()) => {
                let depth = self.channel.len() as u8;
                metrics.update(|m| {
                    m.commands_queued += 1;
                    m.queue_depth = depth;
                    m.queue_peak = m.queue_peak.max(depth);
                });
                Ok(())
            }
            Err(TrySendError::Full(rejected)) => {
                warn!(
                    "WORKER: queue full ({}), {} byte command dropped",
                    COMMAND_QUEUE_DEPTH,
                    rejected.len()
                );
                drop(rejected);
                metrics.update(|m| m.queue_drops += 1);
                Err(QueueError::Full)
            }
        }
    }

    /// Wait up to `wait` for the next command.
    pub fn next(&self, wait: Duration, clock: &dyn Clock) -> Option<QueuedCommand> {
        let deadline = clock.now_ms() + wait.as_millis() as u64;
        loop {
            if let Ok(cmd) = self.channel.try_receive() {
                return Some(cmd);
            }
            if clock.now_ms() >= deadline {
                return None;
            }
            clock.sleep(POLL_NAP);
        }
    }

    pub fn len(&self) -> usize {
        self.channel.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channel.is_empty()
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Inbound failure the peer is owed an error document for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundFault {
    /// Command outgrew the reassembly buffer.
    Overflow,
    /// No buffer for a complete command.
    NoMemory,
}

impl InboundFault {
    pub fn message(self) -> &'static str {
        match self {
            Self::Overflow => "Command too large",
            Self::NoMemory => "Out of memory",
        }
    }

    pub fn peer_type(self) -> &'static str {
        match self {
            Self::Overflow => "parse",
            Self::NoMemory => "memory",
        }
    }
}

pub struct FaultQueue {
    channel: Channel<CriticalSectionRawMutex, InboundFault, FAULT_QUEUE_DEPTH>,
}

impl FaultQueue {
    pub const fn new() -> Self {
        Self {
            channel: Channel::new(),
        }
    }

    /// Record a fault without blocking. A full queue sheds it and counts
    /// the loss in `reports_dropped`.
    pub fn report(&self, fault: InboundFault, metrics: &MetricsHub) -> bool {
        match self.channel.try_send(fault) {
            Ok(()) => true,
            Err(TrySendError::Full(shed)) => {
                warn!("WORKER: fault queue full, {:?} report dropped", shed);
                metrics.update(|m| m.reports_dropped += 1);
                false
            }
        }
    }

    pub fn take(&self) -> Option<InboundFault> {
        self.channel.try_receive().ok()
    }

    pub fn len(&self) -> usize {
        self.channel.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channel.is_empty()
    }
}

impl Default for FaultQueue {
    fn default() -> Self {
        Self::new()
    }
}
