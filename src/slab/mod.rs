//! Small-object machinery.
//!
//! This module implements the size-class table, the per-class free lists and
//! the slot metadata of slabs.

pub mod free_list;
pub mod size_class;
pub mod slab_record;

// Re-export public types
pub use free_list::{FreeList, FreeListIter, FreeNode};
pub use size_class::{SizeClassConfig, SizeClassTable};
pub use slab_record::SlabRecord;
