//! Chunk sources.
//!
//! [`SystemChunks`] takes memory from the `alloc` global allocator, optionally
//! capped at a byte limit. [`SharedChunkSource`] puts any source behind a
//! spin lock so the heaps of several threads can draw from one reservation.

use alloc::alloc::{alloc, dealloc};
use alloc::sync::Arc;
use core::alloc::Layout;
use core::ptr::NonNull;

use kspin::SpinNoIrq;
#[cfg(feature = "log")]
use log::warn;

use crate::{AllocError, AllocResult, ChunkSource};

/// Chunks from the global allocator.
#[derive(Debug, Default)]
pub struct SystemChunks {
    limit: Option<usize>,
    reserved: usize,
    chunk_allocs: usize,
    live_chunks: usize,
}

impl SystemChunks {
    pub const fn new() -> Self {
        Self {
            limit: None,
            reserved: 0,
            chunk_allocs: 0,
            live_chunks: 0,
        }
    }

    /// A source that refuses to hold more than `limit` bytes at once.
    pub const fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            reserved: 0,
            chunk_allocs: 0,
            live_chunks: 0,
        }
    }

    /// Bytes currently handed out.
    pub fn reserved_bytes(&self) -> usize {
        self.reserved
    }

    /// Number of successful `alloc_chunk` calls so far.
    pub fn chunk_allocs(&self) -> usize {
        self.chunk_allocs
    }

    /// Chunks handed out and not yet returned.
    pub fn live_chunks(&self) -> usize {
        self.live_chunks
    }
}

impl ChunkSource for SystemChunks {
    fn alloc_chunk(&mut self, bytes: usize, align: usize) -> AllocResult<NonNull<u8>> {
        if bytes == 0 || !align.is_power_of_two() {
            return Err(AllocError::InvalidParam);
        }
        if let Some(limit) = self.limit {
            if self.reserved + bytes > limit {
                warn!(
                    "chunk source: limit reached, {} reserved, {} requested, limit {}",
                    self.reserved, bytes, limit
                );
                return Err(AllocError::NoMemory);
            }
        }
        let layout = Layout::from_size_align(bytes, align).map_err(|_| AllocError::InvalidParam)?;
        // SAFETY: `layout` has a non-zero size.
        let ptr = NonNull::new(unsafe { alloc(layout) }).ok_or(AllocError::NoMemory)?;
        self.reserved += bytes;
        self.chunk_allocs += 1;
        self.live_chunks += 1;
        Ok(ptr)
    }

    unsafe fn dealloc_chunk(&mut self, ptr: NonNull<u8>, bytes: usize, align: usize) {
        let layout = Layout::from_size_align_unchecked(bytes, align);
        dealloc(ptr.as_ptr(), layout);
        self.reserved = self.reserved.saturating_sub(bytes);
        self.live_chunks = self.live_chunks.saturating_sub(1);
    }
}

/// A chunk source shared between threads.
pub struct SharedChunkSource<S> {
    inner: Arc<SpinNoIrq<S>>,
}

impl<S> SharedChunkSource<S> {
    pub fn new(source: S) -> Self {
        Self {
            inner: Arc::new(SpinNoIrq::new(source)),
        }
    }

    /// Run `f` with exclusive access to the underlying source.
    pub fn with<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

impl<S> Clone for SharedChunkSource<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: ChunkSource> ChunkSource for SharedChunkSource<S> {
    fn alloc_chunk(&mut self, bytes: usize, align: usize) -> AllocResult<NonNull<u8>> {
        self.inner.lock().alloc_chunk(bytes, align)
    }

    unsafe fn dealloc_chunk(&mut self, ptr: NonNull<u8>, bytes: usize, align: usize) {
        self.inner.lock().dealloc_chunk(ptr, bytes, align)
    }
}
