//! Memory manager configuration.

#[cfg(feature = "log")]
use log::warn;

use crate::slab::SizeClassConfig;
use crate::{AllocError, AllocResult, DEFAULT_SLAB_SIZE};

/// Backing strategy of a manager's heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapKind {
    /// Independent chunks per slab and per big object.
    Sparse,
    /// One region of `capacity` bytes reserved up front.
    Contiguous { capacity: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryManagerConfig {
    pub size_classes: SizeClassConfig,
    /// Bytes per slab. Also the chunk size of a contiguous heap.
    pub slab_size: usize,
    /// Soft limit checked by the OOM admission checks.
    pub usage_limit: i64,
    /// Serve small requests from the big-object path instead of slabs.
    pub bypass_slab_alloc: bool,
    /// Request a collection on every slab refill (debug builds only).
    pub eager_gc: bool,
    pub heap: HeapKind,
}

impl MemoryManagerConfig {
    pub const fn new() -> Self {
        Self {
            size_classes: SizeClassConfig::new(),
            slab_size: DEFAULT_SLAB_SIZE,
            usage_limit: i64::MAX,
            bypass_slab_alloc: false,
            eager_gc: false,
            heap: HeapKind::Sparse,
        }
    }

    pub const fn with_size_classes(mut self, size_classes: SizeClassConfig) -> Self {
        self.size_classes = size_classes;
        self
    }

    pub const fn with_slab_size(mut self, slab_size: usize) -> Self {
        self.slab_size = slab_size;
        self
    }

    pub const fn with_usage_limit(mut self, usage_limit: i64) -> Self {
        self.usage_limit = usage_limit;
        self
    }

    pub const fn with_bypass_slab_alloc(mut self, bypass: bool) -> Self {
        self.bypass_slab_alloc = bypass;
        self
    }

    pub const fn with_eager_gc(mut self, eager_gc: bool) -> Self {
        self.eager_gc = eager_gc;
        self
    }

    pub const fn with_heap(mut self, heap: HeapKind) -> Self {
        self.heap = heap;
        self
    }

    pub fn validate(&self) -> AllocResult {
        self.size_classes.validate()?;
        if !self.slab_size.is_power_of_two() || self.slab_size < self.size_classes.max_small_size
        {
            warn!(
                "memory manager: slab size {:#x} must be a power of two of at least {:#x}",
                self.slab_size, self.size_classes.max_small_size
            );
            return Err(AllocError::InvalidParam);
        }
        if let HeapKind::Contiguous { capacity } = self.heap {
            if capacity < self.slab_size {
                warn!(
                    "memory manager: contiguous capacity {:#x} is below one slab",
                    capacity
                );
                return Err(AllocError::InvalidParam);
            }
        }
        Ok(())
    }
}

impl Default for MemoryManagerConfig {
    fn default() -> Self {
        Self::new()
    }
}
