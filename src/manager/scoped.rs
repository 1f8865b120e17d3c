//! Scoped allocator modes.
//!
//! Both guards borrow the manager mutably for their lifetime and dereference
//! to it, so the guarded region keeps allocating through the guard and
//! guards nest by plain scope composition.

use core::ops::{Deref, DerefMut};

#[cfg(feature = "log")]
use log::debug;

use super::MemoryManager;

/// Excludes external allocator traffic inside its scope from usage.
///
/// On creation the statistics are refreshed so earlier traffic is captured;
/// on drop the counter delta accrued meanwhile is parked in the reset
/// counters, which the next refresh subtracts.
pub struct MaskAlloc<'a> {
    mm: &'a mut MemoryManager,
    start_allocated: u64,
    start_deallocated: u64,
}

impl<'a> MaskAlloc<'a> {
    pub fn new(mm: &'a mut MemoryManager) -> Self {
        let (start_allocated, start_deallocated) = mm.read_counters().unwrap_or((0, 0));
        debug!("MaskAlloc()");
        mm.refresh_stats();
        Self {
            mm,
            start_allocated,
            start_deallocated,
        }
    }
}

impl Drop for MaskAlloc<'_> {
    fn drop(&mut self) {
        debug!("~MaskAlloc()");
        if let Some((allocated, deallocated)) = self.mm.read_counters() {
            debug!(
                "old: reset alloc: {} reset dealloc: {}",
                self.mm.reset_allocated, self.mm.reset_deallocated
            );
            self.mm.reset_allocated = self
                .mm
                .reset_allocated
                .wrapping_add(allocated.wrapping_sub(self.start_allocated));
            self.mm.reset_deallocated = self
                .mm
                .reset_deallocated
                .wrapping_add(deallocated.wrapping_sub(self.start_deallocated));
            debug!(
                "new: reset alloc: {} reset dealloc: {}",
                self.mm.reset_allocated, self.mm.reset_deallocated
            );
        }
    }
}

impl Deref for MaskAlloc<'_> {
    type Target = MemoryManager;

    fn deref(&self) -> &MemoryManager {
        self.mm
    }
}

impl DerefMut for MaskAlloc<'_> {
    fn deref_mut(&mut self) -> &mut MemoryManager {
        self.mm
    }
}

/// Disables OOM checks for its scope and restores the saved state on drop.
pub struct SuppressOom<'a> {
    mm: &'a mut MemoryManager,
    saved_could_oom: bool,
}

impl<'a> SuppressOom<'a> {
    pub fn new(mm: &'a mut MemoryManager) -> Self {
        let saved_could_oom = mm.could_oom;
        debug!("SuppressOom() [could_oom was {}]", saved_could_oom);
        mm.could_oom = false;
        Self {
            mm,
            saved_could_oom,
        }
    }
}

impl Drop for SuppressOom<'_> {
    fn drop(&mut self) {
        debug!("~SuppressOom() [could_oom is {}]", self.saved_could_oom);
        self.mm.could_oom = self.saved_could_oom;
    }
}

impl Deref for SuppressOom<'_> {
    type Target = MemoryManager;

    fn deref(&self) -> &MemoryManager {
        self.mm
    }
}

impl DerefMut for SuppressOom<'_> {
    fn deref_mut(&mut self) -> &mut MemoryManager {
        self.mm
    }
}

impl MemoryManager {
    pub fn mask_alloc(&mut self) -> MaskAlloc<'_> {
        MaskAlloc::new(self)
    }

    pub fn suppress_oom(&mut self) -> SuppressOom<'_> {
        SuppressOom::new(self)
    }
}
