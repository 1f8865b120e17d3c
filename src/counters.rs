//! Process-wide allocation counters.
//!
//! Managers read cumulative allocated/deallocated byte counts from an
//! external allocator to account for memory that bypasses their own heaps.
//! [`CountingAlloc`] is a `GlobalAlloc` wrapper that maintains such counts.

use core::alloc::{GlobalAlloc, Layout};
use core::sync::atomic::{AtomicU64, Ordering};

/// Cumulative byte counters of an external allocator.
///
/// Both values only ever grow; readers work with differences between
/// samples.
pub trait AllocCounters {
    fn allocated(&self) -> u64;
    fn deallocated(&self) -> u64;
}

impl<T: AllocCounters + ?Sized> AllocCounters for &'static T {
    fn allocated(&self) -> u64 {
        (**self).allocated()
    }

    fn deallocated(&self) -> u64 {
        (**self).deallocated()
    }
}

/// Lock-free counter pair.
#[derive(Debug, Default)]
pub struct SharedCounters {
    allocated: AtomicU64,
    deallocated: AtomicU64,
}

impl SharedCounters {
    pub const fn new() -> Self {
        Self {
            allocated: AtomicU64::new(0),
            deallocated: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record_alloc(&self, bytes: usize) {
        self.allocated.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dealloc(&self, bytes: usize) {
        self.deallocated.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

impl AllocCounters for SharedCounters {
    fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    fn deallocated(&self) -> u64 {
        self.deallocated.load(Ordering::Relaxed)
    }
}

/// Global allocator wrapper that counts every byte passing through it.
///
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: CountingAlloc<std::alloc::System> = CountingAlloc::new(std::alloc::System);
/// ```
pub struct CountingAlloc<A> {
    inner: A,
    counters: SharedCounters,
}

impl<A> CountingAlloc<A> {
    pub const fn new(inner: A) -> Self {
        Self {
            inner,
            counters: SharedCounters::new(),
        }
    }

    pub fn counters(&self) -> &SharedCounters {
        &self.counters
    }
}

impl<A> AllocCounters for CountingAlloc<A> {
    fn allocated(&self) -> u64 {
        self.counters.allocated()
    }

    fn deallocated(&self) -> u64 {
        self.counters.deallocated()
    }
}

unsafe impl<A: GlobalAlloc> GlobalAlloc for CountingAlloc<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = self.inner.alloc(layout);
        if !ptr.is_null() {
            self.counters.record_alloc(layout.size());
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = self.inner.alloc_zeroed(layout);
        if !ptr.is_null() {
            self.counters.record_alloc(layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.inner.dealloc(ptr, layout);
        self.counters.record_dealloc(layout.size());
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = self.inner.realloc(ptr, layout, new_size);
        if !new_ptr.is_null() {
            self.counters.record_dealloc(layout.size());
            self.counters.record_alloc(new_size);
        }
        new_ptr
    }
}
