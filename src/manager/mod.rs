//! Memory manager
//!
//! One manager per execution context. Small requests are rounded to a size
//! class and served from per-class free lists, refilled from slabs of the
//! backing heap; larger requests go straight to the heap's big-object path.
//! Usage is charged inline on every allocation and free.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::alloc::Layout;
use core::ptr::NonNull;

#[cfg(feature = "log")]
use log::{debug, error, trace, warn};

mod config;
mod scoped;
mod stats;

pub use config::{HeapKind, MemoryManagerConfig};
pub use scoped::{MaskAlloc, SuppressOom};
pub use stats::MemoryUsageStats;

use crate::counters::AllocCounters;
use crate::heap::{
    AllocPolicy, ContiguousHeap, HeaderKind, Heap, HeapObject, SparseHeap, SystemChunks,
};
use crate::slab::{FreeList, FreeNode, SizeClassTable};
use crate::{AllocError, AllocResult, ByteAllocator, ChunkSource};

/// Uncarved remainder of the current slab of one size class.
#[derive(Debug, Clone, Copy, Default)]
struct SlabCursor {
    front: usize,
    limit: usize,
}

type OomHandler = Box<dyn FnMut(&MemoryUsageStats)>;

pub struct MemoryManager {
    heap: Box<dyn Heap>,
    table: Arc<SizeClassTable>,
    free_lists: Vec<FreeList>,
    cursors: Vec<SlabCursor>,
    /// Live small objects per index while slab allocation is bypassed.
    small_allocs: Vec<i64>,
    /// Free marks in the heap are stale.
    need_init_free: bool,

    stats: MemoryUsageStats,
    usage_limit: i64,
    stats_interval_active: bool,
    could_oom: bool,
    oom_exceeded: bool,
    oom_handler: Option<OomHandler>,
    mem_threshold: Option<i64>,
    mem_threshold_reached: bool,

    bypass_slab_alloc: bool,
    eager_gc: bool,
    gc_requested: bool,

    counters: Option<Arc<dyn AllocCounters>>,
    prev_allocated: u64,
    prev_deallocated: u64,
    reset_allocated: u64,
    reset_deallocated: u64,
}

impl MemoryManager {
    /// Create a manager over a caller-supplied heap.
    pub fn new(config: MemoryManagerConfig, heap: Box<dyn Heap>) -> AllocResult<Self> {
        config.validate()?;
        let table = Arc::new(SizeClassTable::new(config.size_classes)?);
        Self::with_table(config, table, heap)
    }

    /// Create a manager sharing an already built size-class table.
    pub fn with_table(
        config: MemoryManagerConfig,
        table: Arc<SizeClassTable>,
        heap: Box<dyn Heap>,
    ) -> AllocResult<Self> {
        config.validate()?;
        if *table.config() != config.size_classes {
            return Err(AllocError::InvalidParam);
        }
        let num_small = table.num_small_sizes();
        debug!(
            "memory manager: {} small classes up to {} bytes, limit {}",
            num_small,
            table.max_small_size(),
            config.usage_limit
        );
        Ok(Self {
            heap,
            table,
            free_lists: (0..num_small).map(|_| FreeList::new()).collect(),
            cursors: vec![SlabCursor::default(); num_small],
            small_allocs: vec![0; num_small],
            need_init_free: false,
            stats: MemoryUsageStats::new(),
            usage_limit: config.usage_limit,
            stats_interval_active: false,
            could_oom: true,
            oom_exceeded: false,
            oom_handler: None,
            mem_threshold: None,
            mem_threshold_reached: false,
            bypass_slab_alloc: config.bypass_slab_alloc,
            eager_gc: config.eager_gc,
            gc_requested: false,
            counters: None,
            prev_allocated: 0,
            prev_deallocated: 0,
            reset_allocated: 0,
            reset_deallocated: 0,
        })
    }

    /// Create a manager whose heap, chosen by `config.heap`, draws from
    /// `source`.
    pub fn with_source(
        config: MemoryManagerConfig,
        source: Box<dyn ChunkSource>,
    ) -> AllocResult<Self> {
        config.validate()?;
        let heap: Box<dyn Heap> = match config.heap {
            HeapKind::Sparse => Box::new(SparseHeap::new(
                source,
                config.slab_size,
                config.size_classes.quantum(),
            )),
            HeapKind::Contiguous { capacity } => {
                Box::new(ContiguousHeap::new(source, config.slab_size, capacity)?)
            }
        };
        Self::new(config, heap)
    }

    /// Create a manager backed by the global allocator.
    pub fn with_config(config: MemoryManagerConfig) -> AllocResult<Self> {
        Self::with_source(config, Box::new(SystemChunks::new()))
    }

    pub fn size_classes(&self) -> &Arc<SizeClassTable> {
        &self.table
    }

    /// Read process-wide allocation counters on every stats refresh.
    ///
    /// The counters are baselined at their current values.
    pub fn set_alloc_counters(&mut self, counters: Arc<dyn AllocCounters>) {
        self.prev_allocated = counters.allocated();
        self.prev_deallocated = counters.deallocated();
        self.reset_allocated = 0;
        self.reset_deallocated = 0;
        self.counters = Some(counters);
    }

    /// Whether external counters are folded into the statistics.
    pub fn stats_enabled(&self) -> bool {
        self.counters.is_some()
    }

    /// Cumulative bytes allocated through the external counters, or 0
    /// without them.
    pub fn get_allocated(&self) -> u64 {
        self.counters.as_ref().map_or(0, |c| c.allocated())
    }

    /// Cumulative bytes deallocated through the external counters, or 0
    /// without them.
    pub fn get_deallocated(&self) -> u64 {
        self.counters.as_ref().map_or(0, |c| c.deallocated())
    }

    fn read_counters(&self) -> Option<(u64, u64)> {
        self.counters
            .as_ref()
            .map(|c| (c.allocated(), c.deallocated()))
    }

    /* small objects */

    /// Allocate a small object of `bytes` bytes, `0 < bytes <= max_small_size`.
    ///
    /// Usage is charged the full class size.
    #[inline]
    pub fn malloc_small_size(&mut self, bytes: usize) -> AllocResult<NonNull<u8>> {
        debug_assert!(bytes > 0);
        debug_assert!(bytes <= self.table.max_small_size());
        let index = self.table.size_to_index(bytes);
        self.malloc_small_index(index)
    }

    #[inline]
    pub fn malloc_small_index(&mut self, index: usize) -> AllocResult<NonNull<u8>> {
        debug_assert!(self.table.is_small_index(index));
        let bytes = self.table.index_to_size(index);
        self.stats.mm_usage += bytes as i64;
        self.need_init_free = true;

        let ptr = match self.free_lists[index].likely_pop() {
            Some(ptr) => ptr,
            None => match self.malloc_small_size_slow(bytes, index) {
                Ok(ptr) => ptr,
                Err(err) => {
                    self.stats.mm_usage -= bytes as i64;
                    return Err(err);
                }
            },
        };
        debug_assert!(crate::is_aligned(ptr.as_ptr() as usize, self.table.quantum()));
        trace!("malloc_small_index: {} -> {:?}", bytes, ptr);
        Ok(ptr)
    }

    #[cold]
    fn malloc_small_size_slow(&mut self, bytes: usize, index: usize) -> AllocResult<NonNull<u8>> {
        if self.bypass_slab_alloc {
            let big = self.heap.alloc_big(bytes, AllocPolicy::Unzeroed)?;
            self.small_allocs[index] += 1;
            self.stats.mm_capacity += big.capacity as i64;
            return Ok(big.ptr);
        }
        if cfg!(debug_assertions) && self.eager_gc {
            self.request_eager_gc();
        }

        let cursor = self.cursors[index];
        let addr = if cursor.front + bytes <= cursor.limit {
            cursor.front
        } else {
            let slab = self.heap.alloc_slab(bytes)?;
            self.stats.mm_capacity += slab.bytes as i64;
            let base = slab.base.as_ptr() as usize;
            self.cursors[index].limit = base + (slab.bytes / bytes) * bytes;
            base
        };
        self.cursors[index].front = addr + bytes;
        NonNull::new(addr as *mut u8).ok_or(AllocError::NoMemory)
    }

    /// Return a small object to its free list.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`MemoryManager::malloc_small_size`] (or an
    /// equivalent entry point) on this manager with the same `bytes`, and
    /// must not be used afterwards.
    #[inline]
    pub unsafe fn free_small_size(&mut self, ptr: NonNull<u8>, bytes: usize) {
        let index = self.table.size_to_index(bytes);
        self.free_small_index(ptr, index)
    }

    /// # Safety
    ///
    /// As [`MemoryManager::free_small_size`], with the class index used to
    /// allocate `ptr`.
    #[inline]
    pub unsafe fn free_small_index(&mut self, ptr: NonNull<u8>, index: usize) {
        debug_assert!(self.table.is_small_index(index));
        if !crate::is_aligned(ptr.as_ptr() as usize, self.table.quantum()) {
            error!("free_small_index: {:?} is not a small block", ptr);
            panic!("misaligned small free of {:?}", ptr);
        }

        if self.bypass_slab_alloc {
            self.small_allocs[index] -= 1;
            return self.free_big_size(ptr);
        }

        let bytes = self.table.index_to_size(index);
        trace!("free_small_index({:?}, {}), freelist {}", ptr, bytes, index);
        self.free_lists[index].push(ptr);
        self.need_init_free = true;
        self.stats.mm_usage -= bytes as i64;
    }

    /// Live small objects of `index` served by the big-object path.
    pub fn small_allocs(&self, index: usize) -> i64 {
        self.small_allocs[index]
    }

    /* big objects */

    pub fn malloc_big_size(
        &mut self,
        bytes: usize,
        policy: AllocPolicy,
    ) -> AllocResult<NonNull<u8>> {
        if bytes > i64::MAX as usize {
            warn!("malloc_big_size: {} bytes cannot be accounted", bytes);
            return Err(AllocError::NoMemory);
        }
        let big = self.heap.alloc_big(bytes, policy)?;
        self.stats.mm_usage += bytes as i64;
        self.stats.mm_capacity += big.capacity as i64;
        trace!("malloc_big_size: {} -> {:?}", bytes, big.ptr);
        Ok(big.ptr)
    }

    /// # Safety
    ///
    /// `ptr` must be the start of a live big object of this manager and
    /// must not be used afterwards.
    pub unsafe fn free_big_size(&mut self, ptr: NonNull<u8>) {
        match self.heap.free_big(ptr) {
            Ok(freed) => {
                self.stats.mm_usage -= freed.size as i64;
                self.stats.mm_capacity -= freed.capacity as i64;
            }
            Err(_) => {
                error!("free_big_size: {:?} is not owned by this manager", ptr);
                panic!("free of unowned pointer {:?}", ptr);
            }
        }
    }

    /// Move a big object to a block of `new_size` bytes, keeping the common
    /// prefix of its contents. On failure the old object is left intact.
    ///
    /// # Safety
    ///
    /// `ptr` must be the start of a live big object of this manager; on
    /// success it must not be used afterwards.
    pub unsafe fn resize_big(
        &mut self,
        ptr: NonNull<u8>,
        new_size: usize,
    ) -> AllocResult<NonNull<u8>> {
        let old_size = match self.heap.find(ptr.as_ptr()) {
            Some(obj) if obj.kind() == HeaderKind::Big && obj.as_ptr() == ptr.as_ptr() => {
                obj.size()
            }
            _ => {
                error!("resize_big: {:?} is not a big object", ptr);
                panic!("resize of unowned pointer {:?}", ptr);
            }
        };
        let new_ptr = self.malloc_big_size(new_size, AllocPolicy::Unzeroed)?;
        core::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_size.min(new_size));
        self.free_big_size(ptr);
        Ok(new_ptr)
    }

    /* dispatchers */

    /// Allocate `size` bytes from whichever path serves that size.
    #[inline]
    pub fn obj_malloc(&mut self, size: usize) -> AllocResult<NonNull<u8>> {
        if self.table.is_small_size(size) {
            return self.malloc_small_size(size);
        }
        self.malloc_big_size(size, AllocPolicy::Unzeroed)
    }

    /// # Safety
    ///
    /// `ptr` must come from [`MemoryManager::obj_malloc`] on this manager
    /// with the same `size`, and must not be used afterwards.
    #[inline]
    pub unsafe fn obj_free(&mut self, ptr: NonNull<u8>, size: usize) {
        if self.table.is_small_size(size) {
            return self.free_small_size(ptr, size);
        }
        self.free_big_size(ptr)
    }

    #[inline]
    pub fn obj_malloc_index(&mut self, index: usize) -> AllocResult<NonNull<u8>> {
        if self.table.is_small_index(index) {
            return self.malloc_small_index(index);
        }
        self.malloc_big_size(self.table.index_to_size(index), AllocPolicy::Unzeroed)
    }

    /// # Safety
    ///
    /// `ptr` must come from [`MemoryManager::obj_malloc_index`] on this
    /// manager with the same `index`, and must not be used afterwards.
    #[inline]
    pub unsafe fn obj_free_index(&mut self, ptr: NonNull<u8>, index: usize) {
        if self.table.is_small_index(index) {
            return self.free_small_index(ptr, index);
        }
        self.free_big_size(ptr)
    }

    /* queries */

    /// Whether the backing heap holds no slabs or big objects.
    pub fn empty(&self) -> bool {
        self.heap.empty()
    }

    pub fn contains(&self, ptr: *const u8) -> bool {
        self.heap.contains(ptr)
    }

    /// The object owning `ptr`, with free blocks reported as
    /// [`HeaderKind::Free`].
    pub fn find(&mut self, ptr: *const u8) -> Option<HeapObject> {
        self.init_free();
        self.heap.find(ptr)
    }

    /// Write free headers into every listed block and mark them, along with
    /// the uncarved slab tails, free in the heap.
    fn init_free(&mut self) {
        if !self.need_init_free {
            return;
        }
        self.need_init_free = false;
        self.heap.clear_free_marks();
        for (index, list) in self.free_lists.iter().enumerate() {
            let size = self.table.index_to_size(index);
            for node in list.iter() {
                // SAFETY: listed blocks are owned by the list and at least a
                // quantum in size.
                unsafe { FreeNode::init_from(node.cast(), size as u32, HeaderKind::Free) };
                self.heap.mark_free(node.cast(), size);
            }
        }
        for cursor in &self.cursors {
            if let Some(front) = NonNull::new(cursor.front as *mut u8) {
                if cursor.front < cursor.limit {
                    self.heap.mark_free(front, cursor.limit - cursor.front);
                }
            }
        }
    }

    pub fn slab_count(&self) -> usize {
        self.heap.slab_count()
    }

    pub fn big_count(&self) -> usize {
        self.heap.big_count()
    }

    /* eager collection */

    fn request_eager_gc(&mut self) {
        if !self.gc_requested {
            debug!("memory manager: eager collection requested");
        }
        self.gc_requested = true;
    }

    /// Whether a collection has been requested since the last
    /// [`MemoryManager::take_gc_request`].
    pub fn gc_requested(&self) -> bool {
        self.gc_requested
    }

    pub fn take_gc_request(&mut self) -> bool {
        core::mem::take(&mut self.gc_requested)
    }

    /// Drop every free list and slab, return all memory to the backing
    /// store and reset the statistics.
    pub fn reset_allocator(&mut self) {
        debug!(
            "memory manager: reset, {} slabs and {} big objects released",
            self.heap.slab_count(),
            self.heap.big_count()
        );
        self.free_lists.iter_mut().for_each(FreeList::clear);
        self.cursors.fill(SlabCursor::default());
        self.small_allocs.fill(0);
        self.need_init_free = false;
        self.heap.reset();
        self.stats.mm_usage = 0;
        self.stats.mm_capacity = 0;
        self.gc_requested = false;
        self.reset_stats();
    }
}

impl ByteAllocator for MemoryManager {
    fn alloc(&mut self, layout: Layout) -> AllocResult<NonNull<u8>> {
        if layout.align() > self.table.quantum() {
            return Err(AllocError::InvalidParam);
        }
        self.obj_malloc(layout.size().max(1))
    }

    unsafe fn dealloc(&mut self, pos: NonNull<u8>, layout: Layout) {
        self.obj_free(pos, layout.size().max(1))
    }

    fn total_bytes(&self) -> usize {
        self.stats.capacity() as usize
    }

    fn used_bytes(&self) -> usize {
        self.stats.usage().max(0) as usize
    }

    fn available_bytes(&self) -> usize {
        self.usage_limit.saturating_sub(self.stats.usage()).max(0) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::SharedChunkSource;
    use crate::slab::SizeClassConfig;

    fn manager() -> MemoryManager {
        MemoryManager::with_config(MemoryManagerConfig::default()).unwrap()
    }

    fn counted(config: MemoryManagerConfig) -> (MemoryManager, SharedChunkSource<SystemChunks>) {
        let source = SharedChunkSource::new(SystemChunks::new());
        let mm = MemoryManager::with_source(config, Box::new(source.clone())).unwrap();
        (mm, source)
    }

    #[test]
    fn test_small_charges_class_size() {
        let mut mm = manager();
        let p = mm.malloc_small_size(17).unwrap();
        assert_eq!(mm.current_usage(), 32);
        assert_eq!(p.as_ptr() as usize % 16, 0);
        unsafe { mm.free_small_size(p, 17) };
        assert_eq!(mm.current_usage(), 0);
    }

    #[test]
    fn test_freed_block_is_reused_first() {
        let mut mm = manager();
        let a = mm.malloc_small_size(64).unwrap();
        let b = mm.malloc_small_size(64).unwrap();
        unsafe {
            mm.free_small_size(a, 64);
            mm.free_small_size(b, 64);
        }
        assert_eq!(mm.malloc_small_size(64).unwrap(), b);
        assert_eq!(mm.malloc_small_size(64).unwrap(), a);
    }

    #[test]
    fn test_slab_refills_once_per_slab() {
        let (mut mm, source) = counted(MemoryManagerConfig::default());
        let per_slab = crate::DEFAULT_SLAB_SIZE / 32;
        let ptrs: Vec<_> = (0..per_slab)
            .map(|_| mm.malloc_small_size(32).unwrap())
            .collect();
        assert_eq!(source.with(|s| s.chunk_allocs()), 1);
        mm.malloc_small_size(32).unwrap();
        assert_eq!(source.with(|s| s.chunk_allocs()), 2);
        assert_eq!(mm.slab_count(), 2);
        drop(ptrs);
    }

    #[test]
    fn test_classes_use_separate_slabs() {
        let mut mm = manager();
        let a = mm.malloc_small_size(16).unwrap();
        let b = mm.malloc_small_size(48).unwrap();
        assert_eq!(mm.slab_count(), 2);
        assert_eq!(mm.find(a.as_ptr()).unwrap().size(), 16);
        assert_eq!(mm.find(b.as_ptr()).unwrap().size(), 48);
    }

    #[test]
    fn test_big_path_accounting() {
        let mut mm = manager();
        let p = mm.malloc_big_size(10_000, AllocPolicy::Zeroed).unwrap();
        assert_eq!(mm.current_usage(), 10_000);
        assert_eq!(mm.big_count(), 1);
        let bytes = unsafe { core::slice::from_raw_parts(p.as_ptr(), 10_000) };
        assert!(bytes.iter().all(|&b| b == 0));
        unsafe { mm.free_big_size(p) };
        assert_eq!(mm.current_usage(), 0);
        assert!(mm.empty());
    }

    #[test]
    #[should_panic]
    fn test_free_unowned_big_panics() {
        let mut mm = manager();
        let p = mm.malloc_small_size(32).unwrap();
        unsafe { mm.free_big_size(p) };
    }

    #[test]
    fn test_resize_big_keeps_contents() {
        let mut mm = manager();
        let p = mm.malloc_big_size(5000, AllocPolicy::Unzeroed).unwrap();
        unsafe { p.as_ptr().write_bytes(0xab, 5000) };
        let q = unsafe { mm.resize_big(p, 9000) }.unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(q.as_ptr(), 5000) };
        assert!(bytes.iter().all(|&b| b == 0xab));
        assert_eq!(mm.current_usage(), 9000);
        assert_eq!(mm.big_count(), 1);
    }

    #[test]
    fn test_dispatch_by_size_and_index() {
        let mut mm = manager();
        let small = mm.obj_malloc(100).unwrap();
        let big = mm.obj_malloc(8000).unwrap();
        assert_eq!(mm.big_count(), 1);
        assert_eq!(mm.slab_count(), 1);

        let table = Arc::clone(mm.size_classes());
        let big_index = table.num_small_sizes();
        let by_index = mm.obj_malloc_index(big_index).unwrap();
        assert_eq!(mm.big_count(), 2);
        assert_eq!(
            mm.find(by_index.as_ptr()).unwrap().size(),
            table.index_to_size(big_index)
        );
        unsafe {
            mm.obj_free(small, 100);
            mm.obj_free(big, 8000);
            mm.obj_free_index(by_index, big_index);
        }
        assert_eq!(mm.current_usage(), 0);
        assert_eq!(mm.big_count(), 0);
    }

    #[test]
    fn test_find_reports_free_blocks() {
        let mut mm = manager();
        let a = mm.malloc_small_size(32).unwrap();
        let b = mm.malloc_small_size(32).unwrap();
        unsafe { mm.free_small_size(a, 32) };

        assert_eq!(mm.find(a.as_ptr()).unwrap().kind(), HeaderKind::Free);
        assert_eq!(mm.find(b.as_ptr()).unwrap().kind(), HeaderKind::Small);
        // Uncarved tail of the slab.
        let tail = unsafe { b.as_ptr().add(32) };
        assert_eq!(mm.find(tail).unwrap().kind(), HeaderKind::Free);

        // Reallocating the block makes it live again.
        assert_eq!(mm.malloc_small_size(32).unwrap(), a);
        assert_eq!(mm.find(a.as_ptr()).unwrap().kind(), HeaderKind::Small);
    }

    #[test]
    fn test_free_marks_refreshed_only_when_stale() {
        let mut mm = manager();
        let a = mm.malloc_small_size(32).unwrap();
        let b = mm.malloc_small_size(32).unwrap();
        unsafe { mm.free_small_size(a, 32) };
        assert!(mm.need_init_free);

        assert_eq!(mm.find(a.as_ptr()).unwrap().kind(), HeaderKind::Free);
        assert!(!mm.need_init_free);
        // Big traffic leaves slab marks alone.
        let big = mm.malloc_big_size(70_000, AllocPolicy::Unzeroed).unwrap();
        assert!(!mm.need_init_free);
        assert_eq!(mm.find(a.as_ptr()).unwrap().kind(), HeaderKind::Free);
        assert_eq!(mm.find(b.as_ptr()).unwrap().kind(), HeaderKind::Small);
        assert_eq!(mm.find(big.as_ptr()).unwrap().kind(), HeaderKind::Big);
        assert!(!mm.need_init_free);

        assert_eq!(mm.malloc_small_size(32).unwrap(), a);
        assert!(mm.need_init_free);
        assert_eq!(mm.find(a.as_ptr()).unwrap().kind(), HeaderKind::Small);
    }

    #[test]
    fn test_oversized_big_leaves_usage() {
        let mut mm = manager();
        mm.malloc_small_size(16).unwrap();
        assert_eq!(mm.obj_malloc(usize::MAX - 3), Err(AllocError::NoMemory));
        assert_eq!(
            mm.malloc_big_size(i64::MAX as usize + 1, AllocPolicy::Zeroed),
            Err(AllocError::NoMemory)
        );
        assert_eq!(mm.current_usage(), 16);
        assert_eq!(mm.big_count(), 0);
    }

    #[test]
    fn test_counter_getters() {
        let mut mm = manager();
        assert_eq!(mm.get_allocated(), 0);
        assert_eq!(mm.get_deallocated(), 0);
        let counters = Arc::new(crate::counters::SharedCounters::new());
        counters.record_alloc(300);
        counters.record_dealloc(120);
        mm.set_alloc_counters(counters.clone());
        assert_eq!(mm.get_allocated(), 300);
        assert_eq!(mm.get_deallocated(), 120);
    }

    #[test]
    fn test_bypass_round_trip() {
        let config = MemoryManagerConfig::default().with_bypass_slab_alloc(true);
        let mut mm = MemoryManager::with_config(config).unwrap();
        let index = mm.size_classes().size_to_index(40);
        let p = mm.malloc_small_size(40).unwrap();
        assert_eq!(mm.current_usage(), 48);
        assert_eq!(mm.small_allocs(index), 1);
        assert_eq!(mm.slab_count(), 0);
        assert_eq!(mm.big_count(), 1);
        unsafe { mm.free_small_size(p, 40) };
        assert_eq!(mm.small_allocs(index), 0);
        assert_eq!(mm.current_usage(), 0);
        assert!(mm.empty());
    }

    #[test]
    fn test_exhaustion_rolls_back_usage() {
        let config = MemoryManagerConfig::default().with_slab_size(0x1000);
        let source = SystemChunks::with_limit(0x1000);
        let mut mm = MemoryManager::with_source(config, Box::new(source)).unwrap();
        mm.malloc_small_size(16).unwrap();
        assert_eq!(mm.malloc_small_size(64), Err(AllocError::NoMemory));
        assert_eq!(mm.current_usage(), 16);
        assert_eq!(
            mm.malloc_big_size(0x2000, AllocPolicy::Unzeroed),
            Err(AllocError::NoMemory)
        );
        assert_eq!(mm.current_usage(), 16);
    }

    #[test]
    fn test_eager_gc_request() {
        let config = MemoryManagerConfig::default().with_eager_gc(true);
        let mut mm = MemoryManager::with_config(config).unwrap();
        mm.malloc_small_size(16).unwrap();
        assert_eq!(mm.gc_requested(), cfg!(debug_assertions));
        mm.take_gc_request();
        assert!(!mm.gc_requested());
    }

    #[test]
    fn test_contiguous_heap() {
        let config = MemoryManagerConfig::default().with_heap(HeapKind::Contiguous {
            capacity: 8 * crate::DEFAULT_SLAB_SIZE,
        });
        let mut mm = MemoryManager::with_config(config).unwrap();
        assert!(mm.empty());
        let p = mm.obj_malloc(200).unwrap();
        let q = mm.obj_malloc(100_000).unwrap();
        assert!(mm.contains(p.as_ptr()));
        assert!(mm.contains(q.as_ptr()));
        unsafe { mm.obj_free(q, 100_000) };
        mm.reset_allocator();
        assert!(mm.empty());
        assert_eq!(mm.current_usage(), 0);
    }

    #[test]
    fn test_reset_allocator() {
        let (mut mm, source) = counted(MemoryManagerConfig::default());
        mm.obj_malloc(24).unwrap();
        mm.obj_malloc(20_000).unwrap();
        mm.reset_allocator();
        assert!(mm.empty());
        assert_eq!(mm.current_usage(), 0);
        assert_eq!(mm.get_stats().capacity(), 0);
        assert_eq!(source.with(|s| s.live_chunks()), 0);
        // Cursors are gone too, so the next request takes a fresh slab.
        mm.obj_malloc(24).unwrap();
        assert_eq!(mm.slab_count(), 1);
    }

    #[test]
    fn test_shared_table_must_match() {
        let table = Arc::new(SizeClassTable::new(SizeClassConfig::default()).unwrap());
        let heap = || -> Box<dyn Heap> {
            Box::new(SparseHeap::new(
                Box::new(SystemChunks::new()),
                crate::DEFAULT_SLAB_SIZE,
                16,
            ))
        };
        assert!(
            MemoryManager::with_table(MemoryManagerConfig::default(), table.clone(), heap())
                .is_ok()
        );
        let mut other = SizeClassConfig::default();
        other.lg_classes_per_doubling = 3;
        let config = MemoryManagerConfig::default().with_size_classes(other);
        assert_eq!(
            MemoryManager::with_table(config, table, heap()).err(),
            Some(AllocError::InvalidParam)
        );
    }

    #[test]
    fn test_byte_allocator() {
        let mut mm = manager();
        let layout = Layout::from_size_align(40, 8).unwrap();
        let p = ByteAllocator::alloc(&mut mm, layout).unwrap();
        assert_eq!(mm.used_bytes(), 48);
        assert_eq!(mm.total_bytes(), crate::DEFAULT_SLAB_SIZE);
        unsafe { ByteAllocator::dealloc(&mut mm, p, layout) };
        assert_eq!(mm.used_bytes(), 0);
        let aligned = Layout::from_size_align(64, 64).unwrap();
        assert_eq!(
            ByteAllocator::alloc(&mut mm, aligned),
            Err(AllocError::InvalidParam)
        );
    }
}
