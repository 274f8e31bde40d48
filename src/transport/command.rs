//! Owned command buffer handed from the inbound path to the worker.

use core::fmt;

/// One complete inbound command, NUL-terminated, sized exactly to the
/// command plus its terminator.
///
/// Move-only: the inbound path creates it, the queue holds it, the worker
/// consumes it. Dropping it anywhere releases the memory exactly once.
pub struct QueuedCommand {
    bytes: Box<[u8]>,
}

impl QueuedCommand {
    /// Copy `payload` into a fresh buffer. `None` if the heap cannot
    /// satisfy the allocation.
    pub fn try_copy_from(payload: &[u8]) -> Option<Self> {
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(payload.len() + 1).ok()?;
        bytes.extend_from_slice(payload);
        bytes.push(0);
        Some(Self {
            bytes: bytes.into_boxed_slice(),
        })
    }

    /// Command bytes without the terminator.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[..self.bytes.len() - 1]
    }

    /// Command bytes including the trailing NUL.
    pub fn as_nul_terminated(&self) -> &[u8] {
        &self.bytes
    }

    /// Length of the command without the terminator.
    pub fn len(&self) -> usize {
        self.bytes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for QueuedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedCommand").field("len", &self.len()).finish()
    }
}
