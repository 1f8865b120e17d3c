//! Slab record implementation.
//!
//! A slab is a contiguous region carved into equal slots of one size class.
//! Slot metadata lives outside the slab, so live objects are never
//! reinterpreted; the free bitmap is only meaningful after the owning
//! manager has materialized free marks for a heap walk.

use alloc::vec;
use alloc::vec::Vec;

#[cfg(feature = "log")]
use log::error;

use crate::heap::{HeaderKind, HeapObject};

#[derive(Debug, Clone)]
pub struct SlabRecord {
    base: usize,
    bytes: usize,
    class_size: usize,
    slot_count: usize,
    free_bitmap: Vec<u64>,
}

impl SlabRecord {
    pub fn new(base: usize, bytes: usize, class_size: usize) -> Self {
        debug_assert!(class_size > 0);
        let slot_count = bytes / class_size;
        Self {
            base,
            bytes,
            class_size,
            slot_count,
            free_bitmap: vec![0; (slot_count + 63) / 64],
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn class_size(&self) -> usize {
        self.class_size
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// End of the last whole slot.
    pub fn slots_end(&self) -> usize {
        self.base + self.slot_count * self.class_size
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.base + self.bytes
    }

    pub fn slot_addr(&self, slot: usize) -> usize {
        self.base + slot * self.class_size
    }

    /// Index of the slot covering `addr`, if any.
    pub fn slot_index_from_addr(&self, addr: usize) -> Option<usize> {
        if addr < self.base {
            return None;
        }
        let slot = (addr - self.base) / self.class_size;
        if slot < self.slot_count {
            Some(slot)
        } else {
            None
        }
    }

    /// Forget all free marks: every slot reads as live.
    pub fn clear_free_marks(&mut self) {
        self.free_bitmap.iter_mut().for_each(|word| *word = 0);
    }

    /// Mark the slots in `[start, start + len)` as free.
    pub fn mark_free(&mut self, start: usize, len: usize) {
        let Some(first) = self.slot_index_from_addr(start) else {
            error!("Invalid free range start {:#x} in slab at {:#x}", start, self.base);
            return;
        };
        if self.slot_addr(first) != start {
            error!("Unaligned free range start {:#x} in slab at {:#x}", start, self.base);
            return;
        }
        let end = start.saturating_add(len).min(self.slots_end());
        for slot in first..(end - self.base) / self.class_size {
            self.free_bitmap[slot / 64] |= 1u64 << (slot % 64);
        }
    }

    pub fn is_marked_free(&self, slot: usize) -> bool {
        slot < self.slot_count && self.free_bitmap[slot / 64] & (1u64 << (slot % 64)) != 0
    }

    /// The slot owning `addr`, described as a heap object.
    pub fn find(&self, addr: usize) -> Option<HeapObject> {
        let slot = self.slot_index_from_addr(addr)?;
        let kind = if self.is_marked_free(slot) {
            HeaderKind::Free
        } else {
            HeaderKind::Small
        };
        Some(HeapObject::new(self.slot_addr(slot), self.class_size, kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_geometry() {
        let record = SlabRecord::new(0x10000, 4096, 48);
        assert_eq!(record.slot_count(), 85);
        assert_eq!(record.slots_end(), 0x10000 + 85 * 48);
        assert_eq!(record.slot_index_from_addr(0x10000), Some(0));
        assert_eq!(record.slot_index_from_addr(0x10000 + 47), Some(0));
        assert_eq!(record.slot_index_from_addr(0x10000 + 48), Some(1));
        assert_eq!(record.slot_index_from_addr(0x10000 + 85 * 48), None);
        assert_eq!(record.slot_index_from_addr(0xffff), None);
    }

    #[test]
    fn test_free_marks_stop_at_last_slot() {
        let mut record = SlabRecord::new(0x10000, 4096, 48);
        record.mark_free(0x10000 + 83 * 48, usize::MAX);
        assert!(!record.is_marked_free(82));
        assert!(record.is_marked_free(83));
        assert!(record.is_marked_free(84));
        assert!(!record.is_marked_free(85));
    }

    #[test]
    fn test_free_marks() {
        let mut record = SlabRecord::new(0x10000, 4096, 64);
        record.mark_free(0x10000 + 64, 3 * 64);
        assert!(!record.is_marked_free(0));
        assert!(record.is_marked_free(1));
        assert!(record.is_marked_free(3));
        assert!(!record.is_marked_free(4));

        let found = record.find(0x10000 + 2 * 64 + 5).unwrap();
        assert_eq!(found.addr(), 0x10000 + 2 * 64);
        assert_eq!(found.kind(), HeaderKind::Free);
        assert_eq!(record.find(0x10000).unwrap().kind(), HeaderKind::Small);

        record.clear_free_marks();
        assert!(!record.is_marked_free(1));
    }

    #[test]
    fn test_mark_free_rejects_unaligned_start() {
        let mut record = SlabRecord::new(0x10000, 4096, 64);
        record.mark_free(0x10000 + 8, 64);
        assert!(!record.is_marked_free(0));
        assert!(!record.is_marked_free(1));
    }
}
