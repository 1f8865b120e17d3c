//! Size-class table.
//!
//! Small requests are rounded up to a canonical class size. The first
//! `1 << lg_classes_per_doubling` classes are denormal and spaced by the
//! quantum; above them every power-of-two range is split into
//! `1 << lg_classes_per_doubling` classes, which bounds internal
//! fragmentation to a fixed ratio.

use alloc::vec::Vec;

#[cfg(feature = "log")]
use log::warn;

use super::free_list::FreeNode;
use crate::{AllocError, AllocResult};

/// Parameters of the size-class table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClassConfig {
    /// log2 of the spacing between denormal classes (and of the minimum
    /// alignment of every small block).
    pub lg_quantum: u32,
    /// log2 of the number of classes per doubling.
    pub lg_classes_per_doubling: u32,
    /// Largest request served from the free lists. Must be a class size.
    pub max_small_size: usize,
    /// Requests up to this size are classified by direct table lookup.
    pub max_lookup_size: usize,
    /// log2 of the largest class size in the table.
    pub lg_max_size_class: u32,
}

impl SizeClassConfig {
    pub const fn new() -> Self {
        Self {
            lg_quantum: 4,
            lg_classes_per_doubling: 2,
            max_small_size: 4096,
            max_lookup_size: 4096,
            lg_max_size_class: 24,
        }
    }

    pub const fn quantum(&self) -> usize {
        1 << self.lg_quantum
    }

    /// Check that the parameters describe a usable table.
    pub fn validate(&self) -> AllocResult {
        if self.quantum() < core::mem::size_of::<FreeNode>() {
            warn!(
                "size classes: quantum {} cannot hold a free node",
                self.quantum()
            );
            return Err(AllocError::InvalidParam);
        }
        if self.lg_classes_per_doubling > 8 || self.lg_max_size_class >= usize::BITS - 1 {
            return Err(AllocError::InvalidParam);
        }
        let max_size_class = 1usize << self.lg_max_size_class;
        if self.lg_max_size_class < self.lg_quantum + self.lg_classes_per_doubling
            || self.max_small_size == 0
            || self.max_small_size > max_size_class
            || self.max_lookup_size == 0
            || self.max_lookup_size > max_size_class
        {
            return Err(AllocError::InvalidParam);
        }
        if round_up(self.max_small_size, self.lg_quantum, self.lg_classes_per_doubling)
            != self.max_small_size
        {
            warn!(
                "size classes: small ceiling {} is not a class size",
                self.max_small_size
            );
            return Err(AllocError::InvalidParam);
        }
        Ok(())
    }
}

impl Default for SizeClassConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Index of the highest set bit. `x` must be non-zero.
#[inline]
fn fls(x: usize) -> u32 {
    usize::BITS - 1 - x.leading_zeros()
}

/// Closed-form size to index. Valid for any `size >= 1`.
#[inline]
fn compute_index(size: usize, lg_quantum: u32, lg_per_doubling: u32) -> usize {
    let size = size - 1;
    if size == 0 {
        return 0;
    }
    let n_bits = fls(size);
    if n_bits < lg_per_doubling + lg_quantum {
        return size >> lg_quantum;
    }
    // The raw mantissa keeps its leading one, which stands in for the
    // `+ 1` on the exponent and the `- 1` on the mantissa.
    let exp = (n_bits - (lg_per_doubling + lg_quantum)) as usize;
    let raw_mantissa = size >> (n_bits - lg_per_doubling);
    (exp << lg_per_doubling) + raw_mantissa
}

/// Closed-form index to size.
#[inline]
fn compute_size(index: usize, lg_quantum: u32, lg_per_doubling: u32) -> usize {
    let per_doubling = 1usize << lg_per_doubling;
    if index < per_doubling {
        return (index + 1) << lg_quantum;
    }
    let exp = (index >> lg_per_doubling) - 1;
    let mantissa = (index & (per_doubling - 1)) | per_doubling;
    (mantissa + 1) << (exp + lg_quantum as usize)
}

/// Round up to `lg_per_doubling + 1` significant bits or to the quantum,
/// whichever is coarser.
#[inline]
fn round_up(size: usize, lg_quantum: u32, lg_per_doubling: u32) -> usize {
    let size = size - 1;
    if size == 0 {
        return 1 << lg_quantum;
    }
    let insignificant = fls(size) as i64 - lg_per_doubling as i64;
    let round_to = if insignificant < lg_quantum as i64 {
        lg_quantum
    } else {
        insignificant as u32
    };
    ((size >> round_to) + 1) << round_to
}

/// Immutable mapping between request sizes and class indices.
///
/// Built once and shared (typically behind an `Arc`) by every manager that
/// uses the same parameters.
#[derive(Debug, Clone)]
pub struct SizeClassTable {
    config: SizeClassConfig,
    index_to_size: Vec<usize>,
    small_lookup: Vec<u16>,
    num_small_sizes: usize,
}

impl SizeClassTable {
    pub fn new(config: SizeClassConfig) -> AllocResult<Self> {
        config.validate()?;
        let lgq = config.lg_quantum;
        let lgd = config.lg_classes_per_doubling;
        let max_size_class = 1usize << config.lg_max_size_class;

        let num_classes = compute_index(max_size_class, lgq, lgd) + 1;
        let index_to_size: Vec<usize> = (0..num_classes)
            .map(|index| compute_size(index, lgq, lgd))
            .collect();

        let lookup_slots = (config.max_lookup_size - 1) >> lgq;
        let small_lookup = (0..=lookup_slots)
            .map(|slot| compute_index((slot << lgq) + 1, lgq, lgd) as u16)
            .collect();

        let num_small_sizes = compute_index(config.max_small_size, lgq, lgd) + 1;

        Ok(Self {
            config,
            index_to_size,
            small_lookup,
            num_small_sizes,
        })
    }

    pub fn config(&self) -> &SizeClassConfig {
        &self.config
    }

    /// Size of the allocation quantum; every class size is a multiple of it.
    #[inline]
    pub fn quantum(&self) -> usize {
        self.config.quantum()
    }

    /// Largest request served by the small-object path.
    #[inline]
    pub fn max_small_size(&self) -> usize {
        self.config.max_small_size
    }

    /// Largest size covered by the table.
    #[inline]
    pub fn max_size_class(&self) -> usize {
        *self.index_to_size.last().unwrap_or(&0)
    }

    /// Number of indices served by the small-object path.
    #[inline]
    pub fn num_small_sizes(&self) -> usize {
        self.num_small_sizes
    }

    /// Total number of classes in the table.
    #[inline]
    pub fn num_size_classes(&self) -> usize {
        self.index_to_size.len()
    }

    /// Smallest class index whose size is at least `size`.
    ///
    /// `size` must be in `1..=max_size_class()`.
    #[inline]
    pub fn size_to_index(&self, size: usize) -> usize {
        debug_assert!(size > 0);
        debug_assert!(size <= self.max_size_class());
        if size <= self.config.max_lookup_size {
            return self.lookup_size_to_index(size);
        }
        self.compute_size_to_index(size)
    }

    #[inline]
    fn lookup_size_to_index(&self, size: usize) -> usize {
        self.small_lookup[(size - 1) >> self.config.lg_quantum] as usize
    }

    /// The bit-scan path of [`SizeClassTable::size_to_index`].
    #[inline]
    pub fn compute_size_to_index(&self, size: usize) -> usize {
        debug_assert!(size > 0);
        let index = compute_index(
            size,
            self.config.lg_quantum,
            self.config.lg_classes_per_doubling,
        );
        debug_assert!(index < self.num_size_classes());
        index
    }

    /// Class size of `index`.
    #[inline]
    pub fn index_to_size(&self, index: usize) -> usize {
        self.index_to_size[index]
    }

    /// Concrete size of the class `size` falls into, without the index.
    #[inline]
    pub fn round_to_class_size(&self, size: usize) -> usize {
        debug_assert!(size > 0);
        debug_assert!(size <= self.max_size_class());
        let rounded = round_up(
            size,
            self.config.lg_quantum,
            self.config.lg_classes_per_doubling,
        );
        debug_assert!(rounded >= self.quantum());
        rounded
    }

    /// Whether `size` is served by the free lists.
    #[inline]
    pub fn is_small_size(&self, size: usize) -> bool {
        size <= self.config.max_small_size
    }

    /// Whether `index` is served by the free lists.
    #[inline]
    pub fn is_small_index(&self, index: usize) -> bool {
        index < self.num_small_sizes
    }
}
