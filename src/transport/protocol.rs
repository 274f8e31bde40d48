//! Wire vocabulary of the command link.
//!
//! ## Markers
//!
//! Markers are whole fragments compared byte-for-byte; a fragment that
//! merely contains a marker is payload.
//!
//! | Fragment      | Direction | Meaning                                    |
//! |---------------|-----------|--------------------------------------------|
//! | `<START>`     | in        | discard partial buffer, begin new command  |
//! | `<CANCEL>`    | in        | discard buffer, abort outbound, reply ACK  |
//! | `<END>`       | in / out  | terminates a command / a response stream   |
//! | `<CANCELLED>` | out       | response aborted at the peer's request     |
//! | `<ACK>`       | out       | cancel request acknowledged                |
//!
//! ## Documents
//!
//! Status documents always carry an empty `config` array, which the mobile
//! app expects in every reply:
//!
//! ```text
//! {"status":"error","message":"...","type":"parse","config":[]}
//! {"status":"ok","message":"Success","type":"<cmd>","config":[]}
//! ```
//!
//! Progress documents are single notifications, never chunked, and are
//! formatted on the stack so they can be emitted mid-transmission.

use core::fmt::Write;

use serde::Serialize;

// ── Markers ──────────────────────────────────────────────────

pub const START_MARKER: &[u8] = b"<START>";
pub const CANCEL_MARKER: &[u8] = b"<CANCEL>";
pub const END_MARKER: &[u8] = b"<END>";
pub const CANCELLED_MARKER: &[u8] = b"<CANCELLED>";
pub const ACK_MARKER: &[u8] = b"<ACK>";

/// Out-of-band control fragment recognised on the inbound endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Start,
    Cancel,
    End,
}

/// Classify an inbound fragment. `None` means payload.
pub fn classify(fragment: &[u8]) -> Option<Marker> {
    match fragment {
        START_MARKER => Some(Marker::Start),
        CANCEL_MARKER => Some(Marker::Cancel),
        END_MARKER => Some(Marker::End),
        _ => None,
    }
}

// ── Status documents ─────────────────────────────────────────

/// `{"status", "message", "type", "config": []}` reply.
#[derive(Debug, Clone, Serialize)]
pub struct StatusDoc<'a> {
    pub status: &'a str,
    pub message: &'a str,
    #[serde(rename = "type")]
    pub kind: &'a str,
    pub config: [u8; 0],
}

impl<'a> StatusDoc<'a> {
    pub fn error(message: &'a str, kind: &'a str) -> Self {
        Self {
            status: "error",
            message,
            kind,
            config: [],
        }
    }

    pub fn ok(kind: &'a str) -> Self {
        Self {
            status: "ok",
            message: "Success",
            kind,
            config: [],
        }
    }
}

/// Upper bound of a stack-formatted error document.
pub const INLINE_DOC_CAPACITY: usize = 192;

/// Format an error document without touching the heap.
///
/// Used on the out-of-memory and emergency paths. `message` and `kind` are
/// static literals, so no JSON escaping is needed.
pub fn inline_error(message: &'static str, kind: &'static str) -> heapless::String<INLINE_DOC_CAPACITY> {
    let mut doc = heapless::String::new();
    let _ = write!(
        doc,
        "{{\"status\":\"error\",\"message\":\"{}\",\"type\":\"{}\",\"config\":[]}}",
        message, kind
    );
    doc
}

// ── Progress documents ───────────────────────────────────────

/// Phase a progress document reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressKind {
    Ota,
    ConfigDownload,
    ConfigUpload,
    ConfigRestore,
}

impl ProgressKind {
    pub fn type_tag(self) -> &'static str {
        match self {
            Self::Ota => "ota_progress",
            Self::ConfigDownload => "config_download_progress",
            Self::ConfigUpload => "config_upload_progress",
            Self::ConfigRestore => "config_restore_progress",
        }
    }

    /// Name of the phase-specific byte counter.
    pub fn counter_field(self) -> &'static str {
        match self {
            Self::Ota => "bytes_written",
            Self::ConfigDownload => "bytes_sent",
            Self::ConfigUpload => "bytes_received",
            Self::ConfigRestore => "bytes_applied",
        }
    }
}

pub const PROGRESS_DOC_CAPACITY: usize = 128;

/// Whole-percent progress, saturating at 100. An empty total is complete.
pub fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) as u128 * 100) / total as u128) as u8
}

/// Format a progress document on the stack.
pub fn progress_doc(kind: ProgressKind, done: usize, total: usize) -> heapless::String<PROGRESS_DOC_CAPACITY> {
    let mut doc = heapless::String::new();
    let _ = write!(
        doc,
        "{{\"type\":\"{}\",\"progress\":{},\"{}\":{},\"total_bytes\":{}}}",
        kind.type_tag(),
        percent(done, total),
        kind.counter_field(),
        done,
        total
    );
    doc
}
