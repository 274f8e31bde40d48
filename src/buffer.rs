//! Fixed-capacity byte buffer owned by the pool that allocated it.
//!
//! Outbound documents are serialized into a [`PoolBuffer`]. The buffer
//! never grows: the engine sizes it up front from the measured document,
//! so the bytes stay in the pool the heap port chose. Dropping the buffer
//! hands the block back through the release function of that pool.

use core::fmt;
use core::ops::Deref;
use core::ptr::{self, NonNull};
use std::alloc::{self, Layout};
use std::io;

/// Returns a block to its pool. Receives the pointer and the capacity the
/// buffer was created with.
pub type ReleaseFn = unsafe fn(NonNull<u8>, usize);

pub struct PoolBuffer {
    ptr: NonNull<u8>,
    len: usize,
    cap: usize,
    release: ReleaseFn,
}

// SAFETY: the buffer exclusively owns its block; shared access only hands
// out `&[u8]`.
unsafe impl Send for PoolBuffer {}
// SAFETY: see above.
unsafe impl Sync for PoolBuffer {}

impl PoolBuffer {
    /// Allocate `cap` bytes from the global allocator. `None` when the
    /// allocator refuses.
    pub fn with_capacity(cap: usize) -> Option<Self> {
        if cap == 0 {
            return Some(Self {
                ptr: NonNull::dangling(),
                len: 0,
                cap: 0,
                release: release_nothing,
            });
        }
        let layout = Layout::array::<u8>(cap).ok()?;
        // SAFETY: `layout` has a non-zero size.
        let ptr = NonNull::new(unsafe { alloc::alloc(layout) })?;
        Some(Self {
            ptr,
            len: 0,
            cap,
            release: release_global,
        })
    }

    /// Wrap a block allocated elsewhere.
    ///
    /// # Safety
    ///
    /// `ptr` must point to at least `cap` writable bytes that nothing else
    /// uses, and `release(ptr, cap)` must be the correct way to free them.
    pub unsafe fn from_raw_parts(ptr: NonNull<u8>, cap: usize, release: ReleaseFn) -> Self {
        Self {
            ptr,
            len: 0,
            cap,
            release,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the first `len` bytes were initialized by `write`; a
        // zero-capacity buffer has a dangling but aligned pointer and len 0.
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Deref for PoolBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl io::Write for PoolBuffer {
    /// Appends what fits. A full buffer reports `WriteZero` instead of
    /// growing.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = buf.len().min(self.cap - self.len);
        if n == 0 && !buf.is_empty() {
            return Err(io::ErrorKind::WriteZero.into());
        }
        // SAFETY: `len + n <= cap`, so the destination lies inside the
        // block, which cannot overlap the caller's slice.
        unsafe { ptr::copy_nonoverlapping(buf.as_ptr(), self.ptr.as_ptr().add(self.len), n) };
        self.len += n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PoolBuffer {
    fn drop(&mut self) {
        // SAFETY: the pointer and capacity are the ones the block was
        // created with, and drop runs once.
        unsafe { (self.release)(self.ptr, self.cap) }
    }
}

impl fmt::Debug for PoolBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBuffer")
            .field("len", &self.len)
            .field("cap", &self.cap)
            .finish()
    }
}

unsafe fn release_nothing(_: NonNull<u8>, _: usize) {}

unsafe fn release_global(ptr: NonNull<u8>, cap: usize) {
    if let Ok(layout) = Layout::array::<u8>(cap) {
        // SAFETY: `ptr` came from `alloc::alloc` with this same layout.
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) }
    }
}
