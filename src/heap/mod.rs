//! Heap backing stores
//!
//! This module provides the raw-memory layer the memory manager draws from:
//! - [`SparseHeap`]: independent chunks per slab and per big object
//! - [`ContiguousHeap`]: one reserved region handed out by a bump pointer
//! - Chunk sources supplying the underlying memory
//!
//! Both strategies keep slab and big-object records outside the memory they
//! describe, so `find` can resolve any interior pointer.

use alloc::collections::BTreeMap;
use core::ptr::NonNull;

use crate::slab::SlabRecord;

pub mod chunk_source;
pub mod contiguous;
pub mod sparse;

pub use chunk_source::{SharedChunkSource, SystemChunks};
pub use contiguous::ContiguousHeap;
pub use sparse::SparseHeap;

use crate::AllocResult;

/// Kind tag of a heap object header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum HeaderKind {
    /// A live block carved from a slab.
    Small = 1,
    /// A live block above the small-object ceiling.
    Big = 2,
    /// A block sitting on a free list or in an uncarved slab tail.
    Free = 3,
}

/// Whether new big-object memory must be cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocPolicy {
    Zeroed,
    Unzeroed,
}

/// Description of the object owning an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapObject {
    addr: usize,
    size: usize,
    kind: HeaderKind,
}

impl HeapObject {
    pub const fn new(addr: usize, size: usize, kind: HeaderKind) -> Self {
        Self { addr, size, kind }
    }

    /// Start address of the object.
    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.addr as *mut u8
    }

    /// Size of the object: the class size for slab slots, the requested
    /// size for big objects.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn kind(&self) -> HeaderKind {
        self.kind
    }
}

/// A freshly acquired slab.
#[derive(Debug, Clone, Copy)]
pub struct SlabRange {
    pub base: NonNull<u8>,
    pub bytes: usize,
}

/// A freshly allocated big object.
#[derive(Debug, Clone, Copy)]
pub struct BigAlloc {
    pub ptr: NonNull<u8>,
    /// Bytes taken from the backing memory, at least the requested size.
    pub capacity: usize,
}

/// What releasing a big object gave back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BigFree {
    /// Size requested when the object was allocated.
    pub size: usize,
    pub capacity: usize,
}

/// Backing store of a memory manager.
///
/// The manager is agnostic to the strategy behind this trait.
pub trait Heap {
    /// Acquire a slab dedicated to blocks of `class_size` bytes.
    fn alloc_slab(&mut self, class_size: usize) -> AllocResult<SlabRange>;

    /// Allocate an object above the small-object ceiling.
    fn alloc_big(&mut self, bytes: usize, policy: AllocPolicy) -> AllocResult<BigAlloc>;

    /// Release a big object by its start address.
    fn free_big(&mut self, ptr: NonNull<u8>) -> AllocResult<BigFree>;

    /// Whether no slabs or big objects are held.
    fn empty(&self) -> bool;

    fn contains(&self, ptr: *const u8) -> bool;

    /// The object owning `ptr`. Slab slots read as [`HeaderKind::Small`]
    /// unless marked free since the last [`Heap::clear_free_marks`].
    fn find(&self, ptr: *const u8) -> Option<HeapObject>;

    fn clear_free_marks(&mut self);

    /// Mark the slab slots in `[start, start + len)` as free.
    fn mark_free(&mut self, start: NonNull<u8>, len: usize);

    /// Release everything back to the chunk source.
    fn reset(&mut self);

    fn slab_count(&self) -> usize;

    fn big_count(&self) -> usize;
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct BigRecord {
    pub base: usize,
    pub size: usize,
    pub capacity: usize,
}

impl BigRecord {
    fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.size.max(1)
    }
}

/// Address-ordered records shared by both heap strategies.
#[derive(Default)]
pub(crate) struct Directory {
    pub slabs: BTreeMap<usize, SlabRecord>,
    pub bigs: BTreeMap<usize, BigRecord>,
}

impl Directory {
    pub const fn new() -> Self {
        Self {
            slabs: BTreeMap::new(),
            bigs: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slabs.is_empty() && self.bigs.is_empty()
    }

    fn slab_for(&self, addr: usize) -> Option<&SlabRecord> {
        self.slabs
            .range(..=addr)
            .next_back()
            .map(|(_, record)| record)
            .filter(|record| record.contains(addr))
    }

    fn slab_for_mut(&mut self, addr: usize) -> Option<&mut SlabRecord> {
        self.slabs
            .range_mut(..=addr)
            .next_back()
            .map(|(_, record)| record)
            .filter(|record| record.contains(addr))
    }

    fn big_for(&self, addr: usize) -> Option<&BigRecord> {
        self.bigs
            .range(..=addr)
            .next_back()
            .map(|(_, record)| record)
            .filter(|record| record.contains(addr))
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.slab_for(addr).is_some() || self.big_for(addr).is_some()
    }

    pub fn find(&self, addr: usize) -> Option<HeapObject> {
        if let Some(slab) = self.slab_for(addr) {
            return slab.find(addr);
        }
        self.big_for(addr)
            .map(|big| HeapObject::new(big.base, big.size, HeaderKind::Big))
    }

    pub fn clear_free_marks(&mut self) {
        self.slabs
            .values_mut()
            .for_each(SlabRecord::clear_free_marks);
    }

    pub fn mark_free(&mut self, start: usize, len: usize) {
        if let Some(slab) = self.slab_for_mut(start) {
            slab.mark_free(start, len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_find() {
        let mut dir = Directory::new();
        assert!(dir.is_empty());
        dir.slabs.insert(0x10000, SlabRecord::new(0x10000, 0x1000, 32));
        dir.bigs.insert(
            0x40000,
            BigRecord {
                base: 0x40000,
                size: 5000,
                capacity: 5008,
            },
        );

        let small = dir.find(0x10000 + 70).unwrap();
        assert_eq!(small.addr(), 0x10000 + 64);
        assert_eq!(small.size(), 32);
        assert_eq!(small.kind(), HeaderKind::Small);

        let big = dir.find(0x40000 + 4999).unwrap();
        assert_eq!(big.addr(), 0x40000);
        assert_eq!(big.kind(), HeaderKind::Big);

        assert!(dir.find(0x40000 + 5000).is_none());
        assert!(dir.find(0x11000).is_none());
        assert!(!dir.contains(0xffff));
    }

    #[test]
    fn test_directory_free_marks() {
        let mut dir = Directory::new();
        dir.slabs.insert(0x10000, SlabRecord::new(0x10000, 0x1000, 32));
        dir.mark_free(0x10000 + 32, 32);
        assert_eq!(dir.find(0x10000 + 32).unwrap().kind(), HeaderKind::Free);
        dir.clear_free_marks();
        assert_eq!(dir.find(0x10000 + 32).unwrap().kind(), HeaderKind::Small);
    }
}
