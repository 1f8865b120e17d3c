//! Thread-local manager boundary.
//!
//! A manager is installed into the current thread at request start and
//! taken out again at request end. The collector and shutdown paths query
//! the sweeping and exiting flags here; both read false while no manager is
//! installed.

use core::cell::{Cell, RefCell};

#[cfg(feature = "log")]
use log::debug;

use crate::manager::MemoryManager;

std::thread_local! {
    static THREAD_HEAP: RefCell<Option<MemoryManager>> = const { RefCell::new(None) };
    static SWEEPING: Cell<bool> = const { Cell::new(false) };
    static EXITING: Cell<bool> = const { Cell::new(false) };
}

/// Install `manager` as this thread's heap, returning the previous one.
pub fn install(manager: MemoryManager) -> Option<MemoryManager> {
    debug!("context: installing thread heap");
    EXITING.with(|exiting| exiting.set(false));
    THREAD_HEAP.with(|heap| heap.borrow_mut().replace(manager))
}

/// Remove this thread's heap.
pub fn uninstall() -> Option<MemoryManager> {
    debug!("context: uninstalling thread heap");
    EXITING.with(|exiting| exiting.set(false));
    THREAD_HEAP.with(|heap| heap.borrow_mut().take())
}

/// Run `f` with this thread's heap, or return `None` if none is installed.
///
/// # Panics
///
/// Panics if called from within another `with_thread_heap` on the same
/// thread.
pub fn with_thread_heap<R>(f: impl FnOnce(&mut MemoryManager) -> R) -> Option<R> {
    THREAD_HEAP.with(|heap| heap.borrow_mut().as_mut().map(f))
}

/// Whether this thread has a heap installed.
pub fn has_thread_heap() -> bool {
    // A heap that is currently borrowed is installed.
    THREAD_HEAP.with(|heap| heap.try_borrow().map_or(true, |heap| heap.is_some()))
}

/// Marks the current thread as sweeping for its lifetime.
pub struct SweepScope {
    saved: bool,
}

impl SweepScope {
    pub fn new() -> Self {
        let saved = SWEEPING.with(|sweeping| sweeping.replace(true));
        Self { saved }
    }
}

impl Default for SweepScope {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SweepScope {
    fn drop(&mut self) {
        SWEEPING.with(|sweeping| sweeping.set(self.saved));
    }
}

impl MemoryManager {
    /// True only while this thread has a heap and a sweep is in progress.
    pub fn sweeping() -> bool {
        has_thread_heap() && SWEEPING.with(Cell::get)
    }

    /// True once [`MemoryManager::set_exiting`] was called for the current
    /// thread heap.
    pub fn exiting() -> bool {
        has_thread_heap() && EXITING.with(Cell::get)
    }

    /// Flag the current thread heap as exiting. No effect without one.
    pub fn set_exiting() {
        if has_thread_heap() {
            EXITING.with(|exiting| exiting.set(true));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::MemoryManagerConfig;

    fn manager() -> MemoryManager {
        MemoryManager::with_config(MemoryManagerConfig::default()).unwrap()
    }

    #[test]
    fn test_sweeping_needs_heap() {
        uninstall();
        let scope = SweepScope::new();
        assert!(!MemoryManager::sweeping());
        install(manager());
        assert!(MemoryManager::sweeping());
        drop(scope);
        assert!(!MemoryManager::sweeping());
        uninstall();
    }

    #[test]
    fn test_sweep_scope_nesting() {
        install(manager());
        {
            let _outer = SweepScope::new();
            {
                let _inner = SweepScope::new();
                assert!(MemoryManager::sweeping());
            }
            assert!(MemoryManager::sweeping());
        }
        assert!(!MemoryManager::sweeping());
        uninstall();
    }

    #[test]
    fn test_exiting_follows_heap() {
        uninstall();
        MemoryManager::set_exiting();
        assert!(!MemoryManager::exiting());

        install(manager());
        assert!(!MemoryManager::exiting());
        MemoryManager::set_exiting();
        assert!(MemoryManager::exiting());

        // A fresh heap starts out not exiting.
        install(manager());
        assert!(!MemoryManager::exiting());
        uninstall();
        assert!(!MemoryManager::exiting());
    }

    #[test]
    fn test_with_thread_heap() {
        uninstall();
        assert_eq!(with_thread_heap(|mm| mm.current_usage()), None);
        install(manager());
        let usage = with_thread_heap(|mm| {
            mm.obj_malloc(100).unwrap();
            assert!(has_thread_heap());
            mm.current_usage()
        });
        assert_eq!(usage, Some(112));
        let mm = uninstall().unwrap();
        assert_eq!(mm.current_usage(), 112);
        assert!(!has_thread_heap());
    }
}
