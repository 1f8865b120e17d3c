//! Request heap
//!
//! A per-request, thread-local memory manager for the object model of a
//! managed runtime, featuring:
//! - A precomputed size-class table with quantum-spaced and doubling classes
//! - Segregated LIFO free lists for small objects
//! - Sparse and contiguous backing heaps for slabs and big objects
//! - Usage statistics with interval peaks and an advisory OOM budget
//! - Scoped guards for masking allocation traffic and suppressing OOM checks

#![no_std]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

use core::alloc::Layout;
use core::fmt;
use core::ptr::NonNull;

// Logging support - conditionally import log crate
#[cfg(feature = "log")]
extern crate log;

// Stub macros when log is disabled - these become no-ops
#[cfg(not(feature = "log"))]
macro_rules! error {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! warn {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! info {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! debug {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

/// Default slab size: every slab serves exactly one size class.
pub const DEFAULT_SLAB_SIZE: usize = 0x10000;

/// The error type used for allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Invalid size, alignment or configuration.
    InvalidParam,
    /// The backing store cannot supply more memory.
    NoMemory,
    /// The pointer is not owned by this heap.
    NotAllocated,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::InvalidParam => f.write_str("invalid size, alignment or configuration"),
            AllocError::NoMemory => f.write_str("backing store exhausted"),
            AllocError::NotAllocated => f.write_str("pointer not owned by this heap"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for AllocError {}

/// A [`Result`] type with [`AllocError`] as the error type.
pub type AllocResult<T = ()> = Result<T, AllocError>;

/// Provider of raw, aligned memory chunks.
///
/// This is the virtual-memory collaborator heaps draw slabs and big objects
/// from. Implementations decide where the memory comes from and when they
/// are exhausted.
pub trait ChunkSource {
    /// Allocate `bytes` of memory aligned to `align` (a power of two).
    fn alloc_chunk(&mut self, bytes: usize, align: usize) -> AllocResult<NonNull<u8>>;

    /// Return a chunk previously obtained from [`ChunkSource::alloc_chunk`].
    ///
    /// # Safety
    ///
    /// `ptr`, `bytes` and `align` must match a prior successful
    /// `alloc_chunk` on this source, and the chunk must not be used again.
    unsafe fn dealloc_chunk(&mut self, ptr: NonNull<u8>, bytes: usize, align: usize);
}

/// Byte-granularity allocator.
pub trait ByteAllocator {
    /// Allocate memory with the given size (in bytes) and alignment.
    fn alloc(&mut self, layout: Layout) -> AllocResult<NonNull<u8>>;

    /// Deallocate memory at the given position, size, and alignment.
    ///
    /// # Safety
    ///
    /// `pos` must come from [`ByteAllocator::alloc`] on the same allocator
    /// with the same `layout`, and must not be used afterwards.
    unsafe fn dealloc(&mut self, pos: NonNull<u8>, layout: Layout);

    /// Returns total memory size in bytes.
    fn total_bytes(&self) -> usize;

    /// Returns allocated memory size in bytes.
    fn used_bytes(&self) -> usize;

    /// Returns available memory size in bytes.
    fn available_bytes(&self) -> usize;
}

/// Checks whether the address has the demanded alignment.
///
/// Equivalent to `addr % align == 0`, but the alignment must be a power of two.
#[inline]
const fn is_aligned(base_addr: usize, align: usize) -> bool {
    base_addr & (align - 1) == 0
}

pub mod counters;
pub use counters::{AllocCounters, CountingAlloc, SharedCounters};

pub mod slab;
pub use slab::{FreeList, FreeNode, SizeClassConfig, SizeClassTable};

pub mod heap;
pub use heap::{
    AllocPolicy, ContiguousHeap, HeaderKind, Heap, HeapObject, SharedChunkSource, SparseHeap,
    SystemChunks,
};

pub mod manager;
pub use manager::{
    HeapKind, MaskAlloc, MemoryManager, MemoryManagerConfig, MemoryUsageStats, SuppressOom,
};

#[cfg(feature = "std")]
pub mod context;
#[cfg(feature = "std")]
pub use context::SweepScope;
