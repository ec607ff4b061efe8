//! Process-wide allocation counters backing the allocation and memory
//! measure modes
//!
//! Install [`CountingAllocator`] as the global allocator of the profiled
//! program to make [`allocation_count`] and [`allocated_bytes`] advance:
//!
//! ```ignore
//! use callprof::alloc_counter::CountingAllocator;
//!
//! #[global_allocator]
//! static GLOBAL: CountingAllocator<std::alloc::System> =
//!     CountingAllocator::new(std::alloc::System);
//! ```
//!
//! Without it both counters stay at zero and every measurement in those
//! modes reads as zero cost.

use std::alloc::{GlobalAlloc, Layout};
use std::sync::atomic::{AtomicU64, Ordering};

static ALLOC_COUNT: AtomicU64 = AtomicU64::new(0);
static ALLOC_BYTES: AtomicU64 = AtomicU64::new(0);

/// A global allocator wrapper that counts allocations and allocated bytes.
///
/// Counters only ever increase: frees are not subtracted, so the values are
/// monotonic and usable as a measurement clock.
pub struct CountingAllocator<A: GlobalAlloc> {
    inner: A,
}

impl<A: GlobalAlloc> CountingAllocator<A> {
    pub const fn new(inner: A) -> Self {
        Self { inner }
    }
}

unsafe impl<A: GlobalAlloc> GlobalAlloc for CountingAllocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.inner.alloc(layout) };
        if !ptr.is_null() {
            record_alloc(layout.size() as u64);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { self.inner.dealloc(ptr, layout) };
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let result = unsafe { self.inner.realloc(ptr, layout, new_size) };
        if !result.is_null() && new_size > layout.size() {
            record_alloc((new_size - layout.size()) as u64);
        }
        result
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.inner.alloc_zeroed(layout) };
        if !ptr.is_null() {
            record_alloc(layout.size() as u64);
        }
        ptr
    }
}

/// Count one allocation of `bytes`.
///
/// Exposed so that hosts with their own allocator hooks can feed the same
/// counters.
pub fn record_alloc(bytes: u64) {
    ALLOC_COUNT.fetch_add(1, Ordering::Relaxed);
    ALLOC_BYTES.fetch_add(bytes, Ordering::Relaxed);
}

/// Total allocations observed so far
pub fn allocation_count() -> u64 {
    ALLOC_COUNT.load(Ordering::Relaxed)
}

/// Total bytes allocated so far
pub fn allocated_bytes() -> u64 {
    ALLOC_BYTES.load(Ordering::Relaxed)
}
