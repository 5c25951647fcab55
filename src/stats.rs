use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Live counters, updated with atomic adds so no lock is needed.
#[derive(Debug, Default)]
pub struct SafetyStats {
    total_allocations: AtomicUsize,
    active_allocations: AtomicUsize,
    total_freed: AtomicUsize,
    bytes_allocated: AtomicUsize,
    bytes_freed: AtomicUsize,
    corruption_detected: AtomicUsize,
    use_after_free_detected: AtomicUsize,
    double_free_detected: AtomicUsize,
    buffer_overflow_detected: AtomicUsize,
}

/// A point-in-time copy of [`SafetyStats`](struct.SafetyStats.html).
///
/// Each field is read atomically, but the snapshot as a whole is not taken
/// under a lock; concurrent operations may land between two reads.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub total_allocations: usize,
    pub active_allocations: usize,
    pub total_freed: usize,
    pub bytes_allocated: usize,
    pub bytes_freed: usize,
    pub corruption_detected: usize,
    pub use_after_free_detected: usize,
    pub double_free_detected: usize,
    pub buffer_overflow_detected: usize,
}

impl SafetyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_allocation(&self, size: usize) {
        self.total_allocations.fetch_add(1, Ordering::Relaxed);
        self.active_allocations.fetch_add(1, Ordering::Relaxed);
        self.bytes_allocated.fetch_add(size, Ordering::Relaxed);
    }

    pub(crate) fn record_free(&self, size: usize) {
        self.total_freed.fetch_add(1, Ordering::Relaxed);
        self.active_allocations.fetch_sub(1, Ordering::Relaxed);
        self.bytes_freed.fetch_add(size, Ordering::Relaxed);
    }

    pub(crate) fn record_corruption(&self) {
        self.corruption_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_use_after_free(&self) {
        self.use_after_free_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_double_free(&self) {
        self.double_free_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_overflow(&self) {
        self.buffer_overflow_detected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_allocations: self.total_allocations.load(Ordering::Relaxed),
            active_allocations: self.active_allocations.load(Ordering::Relaxed),
            total_freed: self.total_freed.load(Ordering::Relaxed),
            bytes_allocated: self.bytes_allocated.load(Ordering::Relaxed),
            bytes_freed: self.bytes_freed.load(Ordering::Relaxed),
            corruption_detected: self.corruption_detected.load(Ordering::Relaxed),
            use_after_free_detected: self.use_after_free_detected.load(Ordering::Relaxed),
            double_free_detected: self.double_free_detected.load(Ordering::Relaxed),
            buffer_overflow_detected: self.buffer_overflow_detected.load(Ordering::Relaxed),
        }
    }

    /// Zero the event counters. The active count is left alone, since it
    /// describes blocks that are still out there.
    pub fn reset(&self) {
        for counter in &[
            &self.total_allocations,
            &self.total_freed,
            &self.bytes_allocated,
            &self.bytes_freed,
            &self.corruption_detected,
            &self.use_after_free_detected,
            &self.double_free_detected,
            &self.buffer_overflow_detected,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl StatsSnapshot {
    /// Sum of all detected violations.
    pub fn violations(&self) -> usize {
        self.corruption_detected
            + self.use_after_free_detected
            + self.double_free_detected
            + self.buffer_overflow_detected
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== MEMORY SAFETY REPORT ===")?;
        let rows = [
            ("Total allocations:", self.total_allocations),
            ("Active allocations:", self.active_allocations),
            ("Total freed:", self.total_freed),
            ("Bytes allocated:", self.bytes_allocated),
            ("Bytes freed:", self.bytes_freed),
            ("Corruption detected:", self.corruption_detected),
            ("Use-after-free detected:", self.use_after_free_detected),
            ("Double-free detected:", self.double_free_detected),
            ("Buffer overflow detected:", self.buffer_overflow_detected),
        ];
        for (label, value) in rows.iter() {
            writeln!(f, "{:<26}{}", label, value)?;
        }
        writeln!(f, "============================")
    }
}
