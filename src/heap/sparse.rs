//! Sparse heap: every slab and every big object is its own chunk.

use alloc::boxed::Box;
use core::ptr::NonNull;

#[cfg(feature = "log")]
use log::{debug, error};

use super::{
    AllocPolicy, BigAlloc, BigFree, BigRecord, Directory, Heap, HeapObject, SlabRange,
};
use crate::slab::SlabRecord;
use crate::{AllocError, AllocResult, ChunkSource};

pub struct SparseHeap {
    source: Box<dyn ChunkSource>,
    slab_size: usize,
    big_align: usize,
    dir: Directory,
}

impl SparseHeap {
    /// Create a heap drawing from `source`.
    ///
    /// Slabs are `slab_size` bytes aligned to their size; big objects are
    /// aligned to `big_align`. Both must be powers of two.
    pub fn new(source: Box<dyn ChunkSource>, slab_size: usize, big_align: usize) -> Self {
        debug_assert!(slab_size.is_power_of_two());
        debug_assert!(big_align.is_power_of_two());
        Self {
            source,
            slab_size,
            big_align,
            dir: Directory::new(),
        }
    }

    pub fn slab_size(&self) -> usize {
        self.slab_size
    }
}

impl Heap for SparseHeap {
    fn alloc_slab(&mut self, class_size: usize) -> AllocResult<SlabRange> {
        if class_size == 0 || class_size > self.slab_size {
            return Err(AllocError::InvalidParam);
        }
        let base = self.source.alloc_chunk(self.slab_size, self.slab_size)?;
        let addr = base.as_ptr() as usize;
        self.dir
            .slabs
            .insert(addr, SlabRecord::new(addr, self.slab_size, class_size));
        debug!(
            "sparse heap: new slab {:#x} for class size {}",
            addr, class_size
        );
        Ok(SlabRange {
            base,
            bytes: self.slab_size,
        })
    }

    fn alloc_big(&mut self, bytes: usize, policy: AllocPolicy) -> AllocResult<BigAlloc> {
        let capacity = bytes
            .max(1)
            .checked_next_multiple_of(self.big_align)
            .ok_or(AllocError::NoMemory)?;
        let ptr = self.source.alloc_chunk(capacity, self.big_align)?;
        if policy == AllocPolicy::Zeroed {
            // SAFETY: the chunk was just allocated with `capacity` bytes.
            unsafe { ptr.as_ptr().write_bytes(0, capacity) };
        }
        let base = ptr.as_ptr() as usize;
        self.dir.bigs.insert(
            base,
            BigRecord {
                base,
                size: bytes,
                capacity,
            },
        );
        Ok(BigAlloc { ptr, capacity })
    }

    fn free_big(&mut self, ptr: NonNull<u8>) -> AllocResult<BigFree> {
        let addr = ptr.as_ptr() as usize;
        let Some(record) = self.dir.bigs.remove(&addr) else {
            error!("sparse heap: {:#x} is not a big object", addr);
            return Err(AllocError::NotAllocated);
        };
        // SAFETY: the record was created from this chunk in `alloc_big`.
        unsafe {
            self.source
                .dealloc_chunk(ptr, record.capacity, self.big_align)
        };
        Ok(BigFree {
            size: record.size,
            capacity: record.capacity,
        })
    }

    fn empty(&self) -> bool {
        self.dir.is_empty()
    }

    fn contains(&self, ptr: *const u8) -> bool {
        self.dir.contains(ptr as usize)
    }

    fn find(&self, ptr: *const u8) -> Option<HeapObject> {
        self.dir.find(ptr as usize)
    }

    fn clear_free_marks(&mut self) {
        self.dir.clear_free_marks();
    }

    fn mark_free(&mut self, start: NonNull<u8>, len: usize) {
        self.dir.mark_free(start.as_ptr() as usize, len);
    }

    fn reset(&mut self) {
        let slabs = core::mem::take(&mut self.dir.slabs);
        for (addr, record) in slabs {
            if let Some(ptr) = NonNull::new(addr as *mut u8) {
                // SAFETY: every slab record owns a chunk from `alloc_slab`.
                unsafe {
                    self.source
                        .dealloc_chunk(ptr, record.bytes(), self.slab_size)
                };
            }
        }
        let bigs = core::mem::take(&mut self.dir.bigs);
        for (addr, record) in bigs {
            if let Some(ptr) = NonNull::new(addr as *mut u8) {
                // SAFETY: every big record owns a chunk from `alloc_big`.
                unsafe {
                    self.source
                        .dealloc_chunk(ptr, record.capacity, self.big_align)
                };
            }
        }
    }

    fn slab_count(&self) -> usize {
        self.dir.slabs.len()
    }

    fn big_count(&self) -> usize {
        self.dir.bigs.len()
    }
}

impl Drop for SparseHeap {
    fn drop(&mut self) {
        self.reset();
    }
}
