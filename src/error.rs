//! Unified error types for the gateway link transport.
//!
//! A single `Error` enum that every subsystem converts into, keeping the
//! task loops' error handling uniform. All variants are `Copy` so they can
//! cross task boundaries without allocation.
//!
//! Errors that reach the peer carry a `type` tag (see [`Error::peer_type`]):
//!
//! | Category   | Peer `type` | Example                                  |
//! |------------|-------------|------------------------------------------|
//! | Framing    | `parse`     | reassembly overflow                      |
//! | Parse      | `parse`     | malformed JSON, oversize command         |
//! | Capacity   | `capacity`  | response above the hard cap              |
//! | Resource   | `memory`    | both pools exhausted, emergency threshold|
//! | Contention | `busy`      | transmission lock timeout                |
//! | Link       | (log only)  | notify failed, peer gone                 |

use core::fmt;

// ---------------------------------------------------------------------------
// Top-level firmware error
// ---------------------------------------------------------------------------

/// Every fallible transport operation funnels into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Inbound fragment stream violated the framing rules.
    Frame(FrameError),
    /// Command queue rejected a complete command.
    Queue(QueueError),
    /// Outbound transmission failed or was aborted.
    Send(SendError),
    /// Platform link layer reported a failure.
    Link(LinkError),
    /// Configuration is invalid or could not be loaded.
    Config(ConfigError),
}

impl Error {
    /// The `type` tag reported to the peer for this error.
    pub fn peer_type(&self) -> &'static str {
        match self {
            Self::Frame(_) => "parse",
            Self::Queue(_) => "capacity",
            Self::Send(e) => e.peer_type(),
            Self::Link(_) => "link",
            Self::Config(_) => "config",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Frame(e) => write!(f, "frame: {e}"),
            Self::Queue(e) => write!(f, "queue: {e}"),
            Self::Send(e) => write!(f, "send: {e}"),
            Self::Link(e) => write!(f, "link: {e}"),
            Self::Config(e) => write!(f, "config: {e}"),
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// Framing errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Appending the fragment would reach the reassembly capacity.
    Overflow { attempted: usize, capacity: usize },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overflow {
                attempted,
                capacity,
            } => write!(f, "command of {attempted}+ bytes exceeds {capacity} byte buffer"),
        }
    }
}

impl From<FrameError> for Error {
    fn from(e: FrameError) -> Self {
        Self::Frame(e)
    }
}

// ---------------------------------------------------------------------------
// Queue errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// All slots occupied; the command was shed.
    Full,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "command queue full"),
        }
    }
}

impl From<QueueError> for Error {
    fn from(e: QueueError) -> Self {
        Self::Queue(e)
    }
}

// ---------------------------------------------------------------------------
// Send errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// Serialized document exceeds the response hard cap.
    TooLarge { len: usize, cap: usize },
    /// Neither buffer pool could satisfy the allocation.
    OutOfMemory { requested: usize },
    /// Free heap fell below the emergency threshold.
    LowMemory { free: usize },
    /// The transmission lock was not acquired in time.
    LockTimeout,
    /// The peer cancelled the transmission.
    Cancelled,
    /// Serialization of the document failed.
    Serialize,
    /// The link refused a notification.
    Link(LinkError),
}

impl SendError {
    pub fn peer_type(&self) -> &'static str {
        match self {
            Self::TooLarge { .. } => "capacity",
            Self::OutOfMemory { .. } | Self::LowMemory { .. } => "memory",
            Self::LockTimeout => "busy",
            Self::Cancelled => "cancelled",
            Self::Serialize => "parse",
            Self::Link(_) => "link",
        }
    }
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooLarge { len, cap } => write!(f, "response {len} bytes exceeds cap {cap}"),
            Self::OutOfMemory { requested } => write!(f, "no pool can allocate {requested} bytes"),
            Self::LowMemory { free } => write!(f, "free heap {free} below emergency threshold"),
            Self::LockTimeout => write!(f, "transmission lock timeout"),
            Self::Cancelled => write!(f, "cancelled by peer"),
            Self::Serialize => write!(f, "document serialization failed"),
            Self::Link(e) => write!(f, "link: {e}"),
        }
    }
}

impl std::error::Error for SendError {}

impl From<SendError> for Error {
    fn from(e: SendError) -> Self {
        Self::Send(e)
    }
}

impl From<LinkError> for SendError {
    fn from(e: LinkError) -> Self {
        Self::Link(e)
    }
}

// ---------------------------------------------------------------------------
// Link errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    /// No peer is connected.
    NotConnected,
    /// Notification payload larger than the current MTU allows.
    PayloadTooLarge,
    /// The BLE stack returned an error code.
    Stack(i32),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "no peer connected"),
            Self::PayloadTooLarge => write!(f, "notification exceeds MTU"),
            Self::Stack(code) => write!(f, "BLE stack error {code}"),
        }
    }
}

impl std::error::Error for LinkError {}

impl From<LinkError> for Error {
    fn from(e: LinkError) -> Self {
        Self::Link(e)
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// A field failed validation.
    Invalid(&'static str),
    /// The blob could not be encoded.
    Encode,
    /// The blob could not be decoded.
    Decode,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid(msg) => write!(f, "invalid: {msg}"),
            Self::Encode => write!(f, "encode failed"),
            Self::Decode => write!(f, "decode failed"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}
