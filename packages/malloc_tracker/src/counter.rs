//! Lock-free allocation statistics cell.

use std::sync::atomic::{AtomicUsize, Ordering};

/// An atomic (count, size) pair, the unit of aggregate accounting.
///
/// In diagnostic builds the counter also tracks its historical peaks.
/// Peaks are monotonically non-decreasing and always at least the current
/// value at any observation.
///
/// All updates are wait-free except the peak update, which retries a
/// compare-exchange against concurrent raisers; there are no locks anywhere
/// because [`record_allocate`](Counter::record_allocate) and
/// [`record_free`](Counter::record_free) sit on the allocation hot path.
#[derive(Debug)]
pub struct Counter {
    count: AtomicUsize,
    size: AtomicUsize,
    #[cfg(debug_assertions)]
    peak_count: AtomicUsize,
    #[cfg(debug_assertions)]
    peak_size: AtomicUsize,
}

impl Counter {
    pub(crate) const fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
            size: AtomicUsize::new(0),
            #[cfg(debug_assertions)]
            peak_count: AtomicUsize::new(0),
            #[cfg(debug_assertions)]
            peak_size: AtomicUsize::new(0),
        }
    }

    /// Records one allocation of `size` bytes.
    #[inline]
    pub fn record_allocate(&self, size: usize) {
        // Relaxed is sufficient: we need atomicity, not ordering against
        // other memory operations. Wrapping arithmetic because overflowing
        // a usize of live allocation bytes is not a realistic scenario.
        let count = self.count.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let total = self
            .size
            .fetch_add(size, Ordering::Relaxed)
            .wrapping_add(size);

        self.update_peak_count(count);
        self.update_peak_size(total);
    }

    /// Records the release of one allocation of `size` bytes.
    ///
    /// Releasing more than was allocated is a caller contract violation and
    /// is not detected here; the counters simply wrap.
    #[inline]
    pub fn record_free(&self, size: usize) {
        self.count.fetch_sub(1, Ordering::Relaxed);
        self.size.fetch_sub(size, Ordering::Relaxed);
    }

    /// Number of live allocations.
    #[must_use]
    #[inline]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Bytes held by live allocations.
    #[must_use]
    #[inline]
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Highest allocation count ever observed.
    #[cfg(debug_assertions)]
    #[must_use]
    pub fn peak_count(&self) -> usize {
        self.peak_count.load(Ordering::Relaxed)
    }

    /// Highest byte total ever observed.
    #[cfg(debug_assertions)]
    #[must_use]
    pub fn peak_size(&self) -> usize {
        self.peak_size.load(Ordering::Relaxed)
    }

    #[cfg(debug_assertions)]
    fn update_peak_count(&self, candidate: usize) {
        raise_peak(&self.peak_count, candidate);
    }

    #[cfg(not(debug_assertions))]
    #[inline]
    fn update_peak_count(&self, _candidate: usize) {}

    #[cfg(debug_assertions)]
    fn update_peak_size(&self, candidate: usize) {
        raise_peak(&self.peak_size, candidate);
    }

    #[cfg(not(debug_assertions))]
    #[inline]
    fn update_peak_size(&self, _candidate: usize) {}
}

/// Raises `peak` to `candidate` unless another thread already raised it
/// higher.
///
/// Each failed exchange observes a strictly larger peak, so the loop
/// terminates: either this thread wins the exchange or the peak is already
/// at or above the candidate.
#[cfg(debug_assertions)]
fn raise_peak(peak: &AtomicUsize, candidate: usize) {
    let mut observed = peak.load(Ordering::Relaxed);
    while observed < candidate {
        match peak.compare_exchange(observed, candidate, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(current) => observed = current,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Counter: Send, Sync);

    #[test]
    fn matched_pairs_return_to_baseline() {
        let counter = Counter::new();

        counter.record_allocate(100);
        counter.record_allocate(28);
        counter.record_free(28);
        counter.record_free(100);

        assert_eq!(counter.count(), 0);
        assert_eq!(counter.size(), 0);
    }

    #[test]
    fn count_and_size_track_live_allocations() {
        let counter = Counter::new();

        counter.record_allocate(64);
        counter.record_allocate(64);

        assert_eq!(counter.count(), 2);
        assert_eq!(counter.size(), 128);

        counter.record_free(64);

        assert_eq!(counter.count(), 1);
        assert_eq!(counter.size(), 64);
    }

    #[cfg(debug_assertions)]
    #[test]
    fn peaks_cover_every_intermediate_observation() {
        let counter = Counter::new();

        counter.record_allocate(100);
        counter.record_allocate(200);
        counter.record_free(100);
        counter.record_free(200);

        assert_eq!(counter.peak_count(), 2);
        assert_eq!(counter.peak_size(), 300);

        // Peaks never decrease once set, even after everything is freed.
        counter.record_allocate(1);
        assert_eq!(counter.peak_count(), 2);
        assert_eq!(counter.peak_size(), 300);
    }

    #[cfg(debug_assertions)]
    #[test]
    fn peak_is_at_least_current_value() {
        let counter = Counter::new();

        counter.record_allocate(500);

        assert!(counter.peak_size() >= counter.size());
        assert!(counter.peak_count() >= counter.count());
    }

    #[cfg(debug_assertions)]
    #[test]
    fn concurrent_raisers_settle_on_the_largest_peak() {
        let peak = AtomicUsize::new(0);

        thread::scope(|scope| {
            for candidate in 1_usize..=8 {
                let peak = &peak;
                scope.spawn(move || {
                    for _ in 0..1_000 {
                        raise_peak(peak, candidate);
                    }
                });
            }
        });

        assert_eq!(peak.load(Ordering::Relaxed), 8);
    }

    #[test]
    fn concurrent_matched_cycles_net_to_zero() {
        let counter = Counter::new();

        thread::scope(|scope| {
            for _ in 0..4 {
                let counter = &counter;
                scope.spawn(move || {
                    for _ in 0..10_000 {
                        counter.record_allocate(64);
                        counter.record_free(64);
                    }
                });
            }
        });

        assert_eq!(counter.count(), 0);
        assert_eq!(counter.size(), 0);
    }
}
