//! Heap probe and allocation pools.
//!
//! - **`target_os = "espidf"`**: free-heap figures come from the ESP-IDF
//!   heap allocator. The primary pool is PSRAM, the secondary internal
//!   RAM. Buffers come straight from `heap_caps_malloc` with the pool's
//!   capability bits, so the bytes really live in that pool, and go back
//!   through `heap_caps_free` on drop. An exhausted or fragmented pool
//!   returns null and the allocation is refused.
//! - **`not(target_os = "espidf")`**: a simulated heap whose free figure
//!   can be pinned from tests.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::buffer::PoolBuffer;
use crate::ports::HeapPort;

#[cfg(target_os = "espidf")]
unsafe fn release_caps(ptr: core::ptr::NonNull<u8>, _cap: usize) {
    // SAFETY: every block handed to this function came from
    // `heap_caps_malloc` and is released once, by `PoolBuffer::drop`.
    unsafe { esp_idf_svc::sys::heap_caps_free(ptr.as_ptr().cast()) }
}

pub struct EspHeap {
    /// Simulation: reported free heap.
    #[cfg(not(target_os = "espidf"))]
    sim_free: AtomicUsize,
    #[cfg(not(target_os = "espidf"))]
    sim_min_free: AtomicUsize,
    /// Allocations refused by either pool since boot.
    refused: AtomicUsize,
}

impl Default for EspHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl EspHeap {
    #[cfg(not(target_os = "espidf"))]
    const SIM_FREE_BYTES: usize = 300 * 1024;

    pub fn new() -> Self {
        Self {
            #[cfg(not(target_os = "espidf"))]
            sim_free: AtomicUsize::new(Self::SIM_FREE_BYTES),
            #[cfg(not(target_os = "espidf"))]
            sim_min_free: AtomicUsize::new(Self::SIM_FREE_BYTES),
            refused: AtomicUsize::new(0),
        }
    }

    pub fn refused(&self) -> usize {
        self.refused.load(Ordering::Relaxed)
    }

    /// Simulation: pin the reported free heap.
    #[cfg(not(target_os = "espidf"))]
    pub fn set_free(&self, bytes: usize) {
        self.sim_free.store(bytes, Ordering::Relaxed);
        self.sim_min_free.fetch_min(bytes, Ordering::Relaxed);
    }

    #[cfg(target_os = "espidf")]
    fn alloc_in(&self, caps: u32, len: usize) -> Option<PoolBuffer> {
        // SAFETY: plain C allocation call; a refusal comes back as null.
        let raw = unsafe { esp_idf_svc::sys::heap_caps_malloc(len.max(1), caps) };
        let Some(ptr) = core::ptr::NonNull::new(raw.cast::<u8>()) else {
            self.refused.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        // SAFETY: `ptr` is a fresh block of at least `len` bytes from the
        // `caps` pool, owned by nothing else and freed by `release_caps`.
        Some(unsafe { PoolBuffer::from_raw_parts(ptr, len, release_caps) })
    }

    #[cfg(not(target_os = "espidf"))]
    fn alloc_in(&self, len: usize) -> Option<PoolBuffer> {
        let buf = if len > self.free_bytes() {
            None
        } else {
            PoolBuffer::with_capacity(len)
        };
        if buf.is_none() {
            self.refused.fetch_add(1, Ordering::Relaxed);
        }
        buf
    }
}

#[cfg(target_os = "espidf")]
impl HeapPort for EspHeap {
    fn free_bytes(&self) -> usize {
        // SAFETY: read-only query of allocator statistics.
        unsafe { esp_idf_svc::sys::esp_get_free_heap_size() as usize }
    }

    fn min_free_bytes(&self) -> usize {
        // SAFETY: read-only query of allocator statistics.
        unsafe { esp_idf_svc::sys::esp_get_minimum_free_heap_size() as usize }
    }

    fn alloc_primary(&self, len: usize) -> Option<PoolBuffer> {
        self.alloc_in(esp_idf_svc::sys::MALLOC_CAP_SPIRAM, len)
    }

    fn alloc_secondary(&self, len: usize) -> Option<PoolBuffer> {
        self.alloc_in(esp_idf_svc::sys::MALLOC_CAP_INTERNAL, len)
    }
}

#[cfg(not(target_os = "espidf"))]
impl HeapPort for EspHeap {
    fn free_bytes(&self) -> usize {
        self.sim_free.load(Ordering::Relaxed)
    }

    fn min_free_bytes(&self) -> usize {
        self.sim_min_free.load(Ordering::Relaxed)
    }

    fn alloc_primary(&self, len: usize) -> Option<PoolBuffer> {
        self.alloc_in(len)
    }

    fn alloc_secondary(&self, len: usize) -> Option<PoolBuffer> {
        self.alloc_in(len)
    }
}
