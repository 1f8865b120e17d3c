//! Usage statistics and OOM admission.

use alloc::boxed::Box;

#[cfg(feature = "log")]
use log::{debug, warn};

use super::MemoryManager;

/// Snapshot of a manager's memory accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsageStats {
    /// Bytes charged by the small and big paths of the manager itself.
    pub mm_usage: i64,
    /// Net bytes of external allocator traffic since the last reset.
    pub aux_usage: i64,
    /// Bytes held from the backing heap: slabs plus big-object capacity.
    pub mm_capacity: i64,
    pub peak_usage: i64,
    pub peak_cap: i64,
    pub peak_interval_usage: i64,
    pub peak_interval_cap: i64,
    /// Cumulative external allocations since the last reset.
    pub total_alloc: i64,
}

impl MemoryUsageStats {
    pub const fn new() -> Self {
        Self {
            mm_usage: 0,
            aux_usage: 0,
            mm_capacity: 0,
            peak_usage: 0,
            peak_cap: 0,
            peak_interval_usage: 0,
            peak_interval_cap: 0,
            total_alloc: 0,
        }
    }

    pub fn usage(&self) -> i64 {
        self.mm_usage + self.aux_usage
    }

    /// Never negative, even when external traffic nets out below zero.
    pub fn capacity(&self) -> i64 {
        (self.mm_capacity + self.aux_usage).max(0)
    }
}

impl MemoryManager {
    /// Bytes charged by this manager's own allocations.
    pub fn current_usage(&self) -> i64 {
        self.stats.mm_usage
    }

    pub fn get_memory_limit(&self) -> i64 {
        self.usage_limit
    }

    pub fn set_memory_limit(&mut self, limit: i64) {
        debug!("memory manager: limit {} -> {}", self.usage_limit, limit);
        self.usage_limit = limit;
    }

    /// Fold external counter traffic since the last live refresh into
    /// `stats`. Returns the counter values read.
    fn fold_counters(&self, stats: &mut MemoryUsageStats) -> Option<(u64, u64)> {
        let (allocated, deallocated) = self.read_counters()?;
        let alloc_delta = allocated
            .wrapping_sub(self.prev_allocated)
            .wrapping_sub(self.reset_allocated) as i64;
        let dealloc_delta = deallocated
            .wrapping_sub(self.prev_deallocated)
            .wrapping_sub(self.reset_deallocated) as i64;
        stats.aux_usage += alloc_delta - dealloc_delta;
        stats.total_alloc += alloc_delta;
        Some((allocated, deallocated))
    }

    /// Reconcile the live statistics with the external counters, update
    /// peaks, and signal OOM if the limit is exceeded.
    pub fn refresh_stats(&mut self) {
        let mut stats = self.stats;
        if let Some((allocated, deallocated)) = self.fold_counters(&mut stats) {
            self.prev_allocated = allocated;
            self.prev_deallocated = deallocated;
            self.reset_allocated = 0;
            self.reset_deallocated = 0;
        }

        let usage = stats.usage();
        let cap = stats.capacity();
        stats.peak_usage = stats.peak_usage.max(usage);
        stats.peak_cap = stats.peak_cap.max(cap);
        if self.stats_interval_active {
            stats.peak_interval_usage = stats.peak_interval_usage.max(usage);
            stats.peak_interval_cap = stats.peak_interval_cap.max(cap);
        }
        self.stats = stats;

        if self.could_oom && usage > self.usage_limit {
            self.signal_oom(&stats);
        }
        if let Some(threshold) = self.mem_threshold {
            if !self.mem_threshold_reached && usage > threshold {
                debug!(
                    "memory manager: usage {} crossed threshold {}",
                    usage, threshold
                );
                self.mem_threshold_reached = true;
            }
        }
    }

    pub fn get_stats(&mut self) -> MemoryUsageStats {
        self.refresh_stats();
        self.stats
    }

    /// A refreshed snapshot that leaves the live statistics untouched and
    /// never signals OOM.
    pub fn get_stats_copy(&self) -> MemoryUsageStats {
        let mut copy = self.stats;
        self.fold_counters(&mut copy);
        copy
    }

    /// Start tracking interval peaks. Returns whether the interval was
    /// inactive before.
    pub fn start_stats_interval(&mut self) -> bool {
        let was_inactive = !self.stats_interval_active;
        let stats = self.get_stats_copy();
        self.stats.peak_interval_usage = stats.usage().max(0);
        self.stats.peak_interval_cap = self.stats.capacity();
        self.stats_interval_active = true;
        was_inactive
    }

    /// Stop tracking interval peaks. Returns whether the interval was active.
    pub fn stop_stats_interval(&mut self) -> bool {
        let was_active = self.stats_interval_active;
        self.stats_interval_active = false;
        self.stats.peak_interval_usage = 0;
        self.stats.peak_interval_cap = 0;
        was_active
    }

    pub fn stats_interval_active(&self) -> bool {
        self.stats_interval_active
    }

    /// Zero the external-traffic and peak figures and re-baseline the
    /// external counters. Usage and capacity of memory still held by the
    /// heap are kept.
    pub fn reset_stats(&mut self) {
        let held = MemoryUsageStats {
            mm_usage: self.stats.mm_usage,
            mm_capacity: self.stats.mm_capacity,
            ..MemoryUsageStats::new()
        };
        self.stats = MemoryUsageStats {
            peak_usage: held.usage().max(0),
            peak_cap: held.capacity(),
            ..held
        };
        if self.stats_interval_active {
            self.stats.peak_interval_usage = self.stats.peak_usage;
            self.stats.peak_interval_cap = self.stats.peak_cap;
        }
        if let Some((allocated, deallocated)) = self.read_counters() {
            self.prev_allocated = allocated;
            self.prev_deallocated = deallocated;
        }
        self.reset_allocated = 0;
        self.reset_deallocated = 0;
    }

    /* OOM */

    /// Whether OOM checks are currently enabled.
    pub fn could_oom(&self) -> bool {
        self.could_oom
    }

    pub fn reset_could_oom(&mut self, state: bool) {
        self.could_oom = state;
    }

    /// Admission check for an allocation of `size` bytes.
    ///
    /// Returns true, and signals OOM, iff checks are enabled and the
    /// allocation would take usage past the limit. Never allocates.
    pub fn pre_alloc_oom(&mut self, size: i64) -> bool {
        if self.could_oom {
            let stats = self.get_stats_copy();
            if stats.usage().saturating_add(size) > self.usage_limit {
                self.signal_oom(&stats);
                return true;
            }
        }
        false
    }

    /// Signal OOM regardless of usage, if checks are enabled.
    pub fn force_oom(&mut self) {
        if self.could_oom {
            let stats = self.get_stats_copy();
            self.signal_oom(&stats);
        }
    }

    fn signal_oom(&mut self, stats: &MemoryUsageStats) {
        warn!(
            "memory manager: usage {} exceeds limit {}",
            stats.usage(),
            self.usage_limit
        );
        self.oom_exceeded = true;
        if let Some(handler) = self.oom_handler.as_mut() {
            handler(stats);
        }
    }

    /// Callback run with the current snapshot whenever OOM is signalled.
    pub fn set_oom_handler(&mut self, handler: impl FnMut(&MemoryUsageStats) + 'static) {
        self.oom_handler = Some(Box::new(handler));
    }

    /// Whether OOM has been signalled since the last
    /// [`MemoryManager::take_oom_exceeded`].
    pub fn oom_exceeded(&self) -> bool {
        self.oom_exceeded
    }

    pub fn take_oom_exceeded(&mut self) -> bool {
        core::mem::take(&mut self.oom_exceeded)
    }

    /// Raise a one-shot flag on the first live refresh with usage above
    /// `bytes`.
    pub fn set_mem_threshold(&mut self, bytes: i64) {
        self.mem_threshold = Some(bytes);
        self.mem_threshold_reached = false;
    }

    pub fn take_mem_threshold_reached(&mut self) -> bool {
        core::mem::take(&mut self.mem_threshold_reached)
    }
}
