//! Segregated free lists.
//!
//! A free block is reinterpreted as a [`FreeNode`] while it sits on a list.
//! Only the `next` link is written on push; the header tag is materialized
//! lazily by [`FreeNode::init_from`] when a heap walk needs it.

use core::ptr::{self, NonNull};

#[cfg(feature = "log")]
use log::trace;

use crate::heap::HeaderKind;

/// Overlay of a free block.
#[repr(C)]
pub struct FreeNode {
    next: Option<NonNull<FreeNode>>,
    kind: u32,
    size: u32,
}

impl FreeNode {
    /// Write a full free header (tag and size) at `addr`.
    ///
    /// # Safety
    ///
    /// `addr` must be valid for writes of a `FreeNode`, suitably aligned and
    /// not in use by anything else. The `next` link is left untouched.
    pub unsafe fn init_from(addr: NonNull<u8>, size: u32, kind: HeaderKind) -> NonNull<FreeNode> {
        let node = addr.cast::<FreeNode>();
        let raw = node.as_ptr();
        ptr::addr_of_mut!((*raw).kind).write(kind as u32);
        ptr::addr_of_mut!((*raw).size).write(size);
        node
    }

    /// Link the block at `addr` in front of `next` without writing a header.
    ///
    /// # Safety
    ///
    /// Same requirements as [`FreeNode::init_from`].
    pub unsafe fn uninit_from(
        addr: NonNull<u8>,
        next: Option<NonNull<FreeNode>>,
    ) -> NonNull<FreeNode> {
        let node = addr.cast::<FreeNode>();
        ptr::addr_of_mut!((*node.as_ptr()).next).write(next);
        node
    }

    /// Header tag last written by [`FreeNode::init_from`].
    ///
    /// # Safety
    ///
    /// `node` must point at a block currently owned by a free list.
    #[cfg(test)]
    pub(crate) unsafe fn kind(node: NonNull<FreeNode>) -> u32 {
        ptr::addr_of!((*node.as_ptr()).kind).read()
    }

    /// Size last written by [`FreeNode::init_from`].
    ///
    /// # Safety
    ///
    /// `node` must point at a block currently owned by a free list.
    #[cfg(test)]
    pub(crate) unsafe fn size(node: NonNull<FreeNode>) -> u32 {
        ptr::addr_of!((*node.as_ptr()).size).read()
    }
}

#[inline(always)]
fn prefetch(node: Option<NonNull<FreeNode>>) {
    #[cfg(target_arch = "x86_64")]
    if let Some(node) = node {
        // SAFETY: prefetch never faults, even on invalid addresses.
        unsafe {
            core::arch::x86_64::_mm_prefetch::<{ core::arch::x86_64::_MM_HINT_T1 }>(
                node.as_ptr() as *const i8,
            );
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = node;
}

/// Singly-linked LIFO list of free blocks of one size class.
pub struct FreeList {
    head: Option<NonNull<FreeNode>>,
}

impl FreeList {
    pub const fn new() -> Self {
        Self { head: None }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Pop for the hot path, where the list is expected to be populated.
    #[inline]
    pub fn likely_pop(&mut self) -> Option<NonNull<u8>> {
        let ret = self.head;
        if let Some(node) = ret {
            // SAFETY: every node on the list was pushed by `push`, which
            // requires the block to stay valid while listed.
            let next = unsafe { ptr::addr_of!((*node.as_ptr()).next).read() };
            prefetch(next);
            self.head = next;
        }
        trace!("FreeList::likely_pop(): returning {:?}", ret);
        ret.map(NonNull::cast)
    }

    /// Pop for cold paths, where the list is expected to be empty.
    #[inline]
    pub fn unlikely_pop(&mut self) -> Option<NonNull<u8>> {
        let head = self.head;
        let ret = match head {
            None => None,
            Some(node) => Some(self.pop_cold(node)),
        };
        trace!("FreeList::unlikely_pop(): returning {:?}", ret);
        ret
    }

    #[cold]
    fn pop_cold(&mut self, node: NonNull<FreeNode>) -> NonNull<u8> {
        // SAFETY: see `likely_pop`.
        self.head = unsafe { ptr::addr_of!((*node.as_ptr()).next).read() };
        node.cast()
    }

    /// Prepend `block`.
    ///
    /// # Safety
    ///
    /// `block` must be at least `size_of::<FreeNode>()` bytes, aligned for a
    /// `FreeNode`, exclusively owned by the caller, and not already listed.
    /// Its size class is not checked.
    #[inline]
    pub unsafe fn push(&mut self, block: NonNull<u8>) {
        trace!("FreeList::push({:?}), prev head = {:?}", block, self.head);
        self.head = Some(FreeNode::uninit_from(block, self.head));
    }

    /// Drop every block without touching them.
    pub fn clear(&mut self) {
        self.head = None;
    }

    /// Walk the listed blocks from head to tail.
    pub fn iter(&self) -> FreeListIter<'_> {
        FreeListIter {
            current: self.head,
            _list: core::marker::PhantomData,
        }
    }
}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over the nodes of a [`FreeList`].
pub struct FreeListIter<'a> {
    current: Option<NonNull<FreeNode>>,
    _list: core::marker::PhantomData<&'a FreeList>,
}

impl<'a> Iterator for FreeListIter<'a> {
    type Item = NonNull<FreeNode>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.current?;
        // SAFETY: the list is borrowed, so its nodes stay listed and valid.
        self.current = unsafe { ptr::addr_of!((*node.as_ptr()).next).read() };
        Some(node)
    }
}
