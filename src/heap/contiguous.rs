//! Contiguous heap: one reserved region carved into fixed-size chunks.
//!
//! New chunks come from a bump pointer (`front`) moving up from `base`.
//! Released big objects leave runs of free chunks that are reused first-fit
//! and coalesced; a run that reaches `front` pulls the front back down.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use core::ptr::NonNull;

#[cfg(feature = "log")]
use log::{debug, error, warn};

use super::{
    AllocPolicy, BigAlloc, BigFree, BigRecord, Directory, Heap, HeapObject, SlabRange,
};
use crate::slab::SlabRecord;
use crate::{AllocError, AllocResult, ChunkSource};

pub struct ContiguousHeap {
    source: Box<dyn ChunkSource>,
    chunk_size: usize,
    base: usize,
    front: usize,
    limit: usize,
    /// Free runs keyed by first chunk index, valued by chunk count.
    free_runs: BTreeMap<usize, usize>,
    dir: Directory,
}

impl ContiguousHeap {
    /// Reserve `capacity` bytes (rounded up to whole chunks) from `source`.
    pub fn new(
        mut source: Box<dyn ChunkSource>,
        chunk_size: usize,
        capacity: usize,
    ) -> AllocResult<Self> {
        if !chunk_size.is_power_of_two() || capacity == 0 {
            return Err(AllocError::InvalidParam);
        }
        let capacity = capacity
            .checked_next_multiple_of(chunk_size)
            .ok_or(AllocError::InvalidParam)?;
        let base = source.alloc_chunk(capacity, chunk_size)?.as_ptr() as usize;
        debug!(
            "contiguous heap: reserved [{:#x}, {:#x})",
            base,
            base + capacity
        );
        Ok(Self {
            source,
            chunk_size,
            base,
            front: base,
            limit: base + capacity,
            free_runs: BTreeMap::new(),
            dir: Directory::new(),
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Bytes between `base` and `front`.
    pub fn used_bytes(&self) -> usize {
        self.front - self.base
    }

    pub fn capacity(&self) -> usize {
        self.limit - self.base
    }

    /// Index of the chunk holding `addr`. `addr` must not be below the base.
    pub fn chunk_index(&self, addr: usize) -> usize {
        assert!(addr >= self.base, "address {:#x} below heap base", addr);
        (addr - self.base) / self.chunk_size
    }

    fn chunk_addr(&self, index: usize) -> usize {
        self.base + index * self.chunk_size
    }

    fn alloc_chunks(&mut self, count: usize) -> AllocResult<usize> {
        let reusable = self
            .free_runs
            .iter()
            .find(|&(_, &len)| len >= count)
            .map(|(&start, &len)| (start, len));
        if let Some((start, len)) = reusable {
            self.free_runs.remove(&start);
            if len > count {
                self.free_runs.insert(start + count, len - count);
            }
            return Ok(self.chunk_addr(start));
        }

        let bytes = count * self.chunk_size;
        if self.limit - self.front < bytes {
            warn!(
                "contiguous heap: exhausted, {} of {} bytes used, {} requested",
                self.used_bytes(),
                self.capacity(),
                bytes
            );
            return Err(AllocError::NoMemory);
        }
        let addr = self.front;
        self.front += bytes;
        Ok(addr)
    }

    fn release_chunks(&mut self, addr: usize, count: usize) {
        let mut start = self.chunk_index(addr);
        let mut len = count;

        let before = self
            .free_runs
            .range(..start)
            .next_back()
            .map(|(&s, &l)| (s, l));
        if let Some((prev_start, prev_len)) = before {
            if prev_start + prev_len == start {
                self.free_runs.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }
        if let Some(next_len) = self.free_runs.remove(&(start + len)) {
            len += next_len;
        }

        if self.chunk_addr(start + len) == self.front {
            self.front = self.chunk_addr(start);
        } else {
            self.free_runs.insert(start, len);
        }
    }
}

impl Heap for ContiguousHeap {
    fn alloc_slab(&mut self, class_size: usize) -> AllocResult<SlabRange> {
        if class_size == 0 || class_size > self.chunk_size {
            return Err(AllocError::InvalidParam);
        }
        let addr = self.alloc_chunks(1)?;
        self.dir
            .slabs
            .insert(addr, SlabRecord::new(addr, self.chunk_size, class_size));
        debug!(
            "contiguous heap: new slab {:#x} (chunk {}) for class size {}",
            addr,
            self.chunk_index(addr),
            class_size
        );
        let base = NonNull::new(addr as *mut u8).ok_or(AllocError::NoMemory)?;
        Ok(SlabRange {
            base,
            bytes: self.chunk_size,
        })
    }

    fn alloc_big(&mut self, bytes: usize, policy: AllocPolicy) -> AllocResult<BigAlloc> {
        let count = bytes
            .max(1)
            .checked_next_multiple_of(self.chunk_size)
            .ok_or(AllocError::NoMemory)?
            / self.chunk_size;
        let addr = self.alloc_chunks(count)?;
        let capacity = count * self.chunk_size;
        let ptr = NonNull::new(addr as *mut u8).ok_or(AllocError::NoMemory)?;
        if policy == AllocPolicy::Zeroed {
            // SAFETY: the chunks lie inside the reserved region.
            unsafe { ptr.as_ptr().write_bytes(0, capacity) };
        }
        self.dir.bigs.insert(
            addr,
            BigRecord {
                base: addr,
                size: bytes,
                capacity,
            },
        );
        Ok(BigAlloc { ptr, capacity })
    }

    fn free_big(&mut self, ptr: NonNull<u8>) -> AllocResult<BigFree> {
        let addr = ptr.as_ptr() as usize;
        let Some(record) = self.dir.bigs.remove(&addr) else {
            error!("contiguous heap: {:#x} is not a big object", addr);
            return Err(AllocError::NotAllocated);
        };
        self.release_chunks(addr, record.capacity / self.chunk_size);
        Ok(BigFree {
            size: record.size,
            capacity: record.capacity,
        })
    }

    fn empty(&self) -> bool {
        self.front == self.base
    }

    fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        addr >= self.base && addr < self.front
    }

    fn find(&self, ptr: *const u8) -> Option<HeapObject> {
        if !self.contains(ptr) {
            return None;
        }
        self.dir.find(ptr as usize)
    }

    fn clear_free_marks(&mut self) {
        self.dir.clear_free_marks();
    }

    fn mark_free(&mut self, start: NonNull<u8>, len: usize) {
        self.dir.mark_free(start.as_ptr() as usize, len);
    }

    fn reset(&mut self) {
        self.dir = Directory::new();
        self.free_runs.clear();
        self.front = self.base;
    }

    fn slab_count(&self) -> usize {
        self.dir.slabs.len()
    }

    fn big_count(&self) -> usize {
        self.dir.bigs.len()
    }
}

impl Drop for ContiguousHeap {
    fn drop(&mut self) {
        if let Some(base) = NonNull::new(self.base as *mut u8) {
            // SAFETY: the region was reserved in `new` with these parameters.
            unsafe {
                self.source
                    .dealloc_chunk(base, self.limit - self.base, self.chunk_size)
            };
        }
    }
}
