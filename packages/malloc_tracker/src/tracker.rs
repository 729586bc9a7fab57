//! Public entry points and the tracking-level state machine.

use std::ptr;
use std::ptr::NonNull;

use thiserror::Error;

use crate::category::Category;
use crate::failure::FailurePolicy;
use crate::header::{self, BlockHeader};
use crate::level::{LevelAuthority, TrackingLevel};
use crate::site::{CapturedStack, SiteTable};
use crate::summary::ProcessSummary;

/// Errors from [`Tracker::initialize`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InitializeError {
    /// The call-site table could not be set up. The caller should fall
    /// back to a level below [`TrackingLevel::Detail`]; summary accounting
    /// is already initialized at that point and remains usable.
    #[error("call-site table initialization failed")]
    SiteTable,
}

/// The tracking layer's public entry point: wraps raw allocations with a
/// [`BlockHeader`], unwraps and validates them on release, and applies
/// tracking-level transitions.
///
/// The tracker is generic over its three collaborator seams — the
/// call-site table, the tracking-level authority and the failure policy —
/// which it owns. [`Tracker::record_malloc`] and [`Tracker::record_free`]
/// are wait-free and safe to call concurrently from any number of threads;
/// [`Tracker::initialize`] and [`Tracker::transition`] must be serialized
/// against all allocation activity by the embedder.
#[derive(Debug)]
pub struct Tracker<S, L, F> {
    sites: S,
    levels: L,
    failure: F,
}

impl<S, L, F> Tracker<S, L, F>
where
    S: SiteTable,
    L: LevelAuthority,
    F: FailurePolicy,
{
    /// Creates a tracker wired to the given collaborators.
    #[must_use]
    pub const fn new(sites: S, levels: L, failure: F) -> Self {
        Self {
            sites,
            levels,
            failure,
        }
    }

    /// Prepares the subsystem for tracking at `level`.
    ///
    /// At [`TrackingLevel::Summary`] or richer this performs the one-time
    /// [`ProcessSummary`] initialization; at [`TrackingLevel::Detail`] it
    /// additionally initializes the call-site table.
    ///
    /// # Errors
    ///
    /// [`InitializeError::SiteTable`] when the call-site table cannot be
    /// set up; the caller should continue at a lower level instead of
    /// calling this again.
    ///
    /// # Panics
    ///
    /// Panics when the process summary was already initialized; this is a
    /// fatal programming error in the embedder's startup sequence.
    pub fn initialize(&self, level: TrackingLevel) -> Result<(), InitializeError> {
        if level >= TrackingLevel::Summary {
            ProcessSummary::initialize();
        }

        if level == TrackingLevel::Detail && !self.sites.initialize() {
            return Err(InitializeError::SiteTable);
        }

        Ok(())
    }

    /// Applies a tracking-level transition.
    ///
    /// [`TrackingLevel::Off`] cannot be transitioned from or to (the off
    /// state has no bookkeeping to migrate), and [`TrackingLevel::Minimal`]
    /// cannot be promoted out of because its statistics have gone stale;
    /// both are programming errors checked in validating builds. Leaving
    /// [`TrackingLevel::Detail`] shuts the call-site table down first. The
    /// process summary's counters persist unchanged across every legal
    /// transition.
    ///
    /// The embedder must serialize this call against in-flight
    /// [`Tracker::record_malloc`]/[`Tracker::record_free`] calls, which may
    /// still touch the call-site table being shut down.
    pub fn transition(&self, from: TrackingLevel, to: TrackingLevel) {
        debug_assert!(
            from != TrackingLevel::Off,
            "cannot transition from the off state"
        );
        debug_assert!(to != TrackingLevel::Off, "cannot transition to the off state");
        debug_assert!(
            from != TrackingLevel::Minimal,
            "minimal tracking cannot be promoted"
        );

        if from == TrackingLevel::Detail {
            debug_assert!(
                to < TrackingLevel::Detail,
                "leaving detail must lower the level"
            );
            self.sites.shutdown();
        }
    }

    /// Wraps a freshly allocated raw block and returns the caller-visible
    /// pointer, `base + HEADER_SIZE`.
    ///
    /// A null `base` means the underlying allocation itself failed; it is
    /// propagated untouched, with no accounting performed. The returned
    /// pointer satisfies the platform's natural allocation alignment.
    ///
    /// # Safety
    ///
    /// A non-null `base` must point to at least
    /// [`raw_allocation_size`](header::raw_allocation_size)`(size)`
    /// writable bytes freshly obtained from the underlying allocator with
    /// its natural alignment, and `level` must be the level in force (not
    /// [`TrackingLevel::Off`]) under the embedder's transition
    /// serialization.
    #[must_use = "the caller must hand out the wrapped pointer, not the raw block"]
    pub unsafe fn record_malloc(
        &self,
        base: *mut u8,
        size: usize,
        category: Category,
        stack: CapturedStack,
        level: TrackingLevel,
    ) -> *mut u8 {
        debug_assert!(
            level != TrackingLevel::Off,
            "recording requires active tracking"
        );

        let Some(base) = NonNull::new(base) else {
            // The underlying allocation already failed; stay out of the way.
            return ptr::null_mut();
        };

        // SAFETY: the caller guarantees the raw block spans header +
        // payload + footer.
        unsafe {
            BlockHeader::construct(
                base,
                size,
                category,
                stack,
                level,
                &self.sites,
                &self.levels,
            );
        }

        if level >= TrackingLevel::Summary {
            let summary = ProcessSummary::get();
            summary.by_category(category).record_malloc(size);
            summary
                .header_overhead()
                .record_allocate(header::HEADER_SIZE);
        }

        let user = header::user_pointer(base.as_ptr());
        debug_assert!(
            user.addr() % header::BLOCK_ALIGNMENT == 0,
            "the wrapped pointer must keep the natural allocation alignment"
        );

        #[cfg(debug_assertions)]
        {
            // Read back through the public recovery path.
            let written = header::header_pointer(user);
            // SAFETY: just constructed at this address.
            let (size_back, category_back) = unsafe { ((*written).size(), (*written).category()) };
            debug_assert_eq!(size_back, size);
            debug_assert_eq!(category_back, category);
        }

        user
    }

    /// Unwraps a previously wrapped pointer: validates the block, records
    /// the free, dead-marks the header and returns the raw block address
    /// for the caller to hand back to the underlying deallocator.
    ///
    /// # Safety
    ///
    /// `user_pointer` must be non-null and have been produced by
    /// [`Tracker::record_malloc`] for a block not yet freed; the calling
    /// thread must be the one releasing the block; and tracking must not
    /// be [`TrackingLevel::Off`].
    #[must_use = "the caller must release the returned raw block"]
    pub unsafe fn record_free(&self, user_pointer: *mut u8) -> *mut u8 {
        debug_assert!(
            !user_pointer.is_null(),
            "releasing a null pointer is a caller contract violation"
        );
        debug_assert!(
            self.levels.current_level() != TrackingLevel::Off,
            "releasing while tracking is off is a caller contract violation"
        );

        let header = header::header_pointer(user_pointer);

        // SAFETY: the pointer was produced by record_malloc, so stepping
        // back over the header recovers the block we wrote; the caller
        // guarantees single release and thread ownership.
        unsafe {
            BlockHeader::release(header, &self.sites, &self.levels, &self.failure);
        }

        header.cast::<u8>()
    }
}

#[cfg(test)]
mod tests {
    use std::alloc::{Layout, alloc, dealloc};

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::failure::AbortOnCorruption;
    use crate::failure::CorruptionReport;
    use crate::header::{BLOCK_ALIGNMENT, HEADER_SIZE, raw_allocation_size};
    use crate::level::MockLevelAuthority;
    use crate::site::{MockSiteTable, SiteReference};
    use crate::summary::ensure_initialized_for_tests;

    struct NoSites;

    impl SiteTable for NoSites {
        fn initialize(&self) -> bool {
            true
        }

        fn shutdown(&self) {}

        fn allocate_at(
            &self,
            _stack: CapturedStack,
            _size: usize,
            _category: Category,
        ) -> Option<SiteReference> {
            None
        }

        fn deallocate_at(&self, _size: usize, _site: SiteReference) {}

        fn lookup_stack(&self, _site: SiteReference) -> Option<CapturedStack> {
            None
        }
    }

    struct FixedLevel(TrackingLevel);

    impl LevelAuthority for FixedLevel {
        fn current_level(&self) -> TrackingLevel {
            self.0
        }

        fn request_downgrade(&self, _to: TrackingLevel) {}
    }

    struct PanicOnCorruption;

    impl FailurePolicy for PanicOnCorruption {
        fn on_corruption(&self, report: &CorruptionReport) -> ! {
            panic!("unexpected corruption in test: {report}");
        }
    }

    assert_impl_all!(Tracker<NoSites, FixedLevel, AbortOnCorruption>: Send, Sync);

    fn summary_tracker() -> Tracker<NoSites, FixedLevel, PanicOnCorruption> {
        Tracker::new(NoSites, FixedLevel(TrackingLevel::Summary), PanicOnCorruption)
    }

    #[test]
    fn null_raw_block_propagates_without_accounting() {
        let tracker = summary_tracker();

        // SAFETY: a null base takes the early-out path and touches nothing.
        let user = unsafe {
            tracker.record_malloc(
                ptr::null_mut(),
                128,
                Category::Runtime,
                CapturedStack::default(),
                TrackingLevel::Summary,
            )
        };

        assert!(user.is_null());
    }

    #[test]
    fn wrap_then_unwrap_round_trips_through_the_raw_block() {
        ensure_initialized_for_tests();
        let tracker = summary_tracker();

        let payload = 96_usize;
        let layout = Layout::from_size_align(raw_allocation_size(payload), BLOCK_ALIGNMENT)
            .expect("test layout is valid");
        // SAFETY: the layout has non-zero size.
        let base = unsafe { alloc(layout) };
        assert!(!base.is_null());

        // SAFETY: `base` spans the whole raw allocation for `payload`.
        let user = unsafe {
            tracker.record_malloc(
                base,
                payload,
                Category::Chunk,
                CapturedStack::default(),
                TrackingLevel::Summary,
            )
        };

        assert_eq!(user.addr(), base.addr() + HEADER_SIZE);
        assert_eq!(user.addr() % BLOCK_ALIGNMENT, 0);

        // SAFETY: `user` was produced by record_malloc above.
        let recovered = unsafe { tracker.record_free(user) };
        assert_eq!(recovered.addr(), base.addr());

        // SAFETY: same allocation, same layout.
        unsafe {
            dealloc(recovered, layout);
        }
    }

    #[test]
    fn summary_accounting_reflects_payload_and_header_overhead() {
        ensure_initialized_for_tests();
        let tracker = summary_tracker();
        let summary = ProcessSummary::get();

        let payload = 100_usize;
        let size_before = summary.by_category(Category::Runtime).memory().size();
        let count_before = summary.by_category(Category::Runtime).memory().count();

        let layout = Layout::from_size_align(raw_allocation_size(payload), BLOCK_ALIGNMENT)
            .expect("test layout is valid");
        // SAFETY: the layout has non-zero size.
        let base = unsafe { alloc(layout) };
        // SAFETY: `base` spans the whole raw allocation for `payload`.
        let user = unsafe {
            tracker.record_malloc(
                base,
                payload,
                Category::Runtime,
                CapturedStack::default(),
                TrackingLevel::Summary,
            )
        };

        assert_eq!(
            summary.by_category(Category::Runtime).memory().size(),
            size_before + payload
        );
        assert_eq!(
            summary.by_category(Category::Runtime).memory().count(),
            count_before + 1
        );

        // SAFETY: produced by record_malloc above, released once.
        let recovered = unsafe { tracker.record_free(user) };

        assert_eq!(
            summary.by_category(Category::Runtime).memory().size(),
            size_before
        );
        assert_eq!(
            summary.by_category(Category::Runtime).memory().count(),
            count_before
        );

        // SAFETY: same allocation, same layout.
        unsafe {
            dealloc(recovered, layout);
        }
    }

    #[test]
    fn minimal_level_writes_headers_but_no_summary_accounting() {
        ensure_initialized_for_tests();
        let tracker = Tracker::new(
            NoSites,
            FixedLevel(TrackingLevel::Minimal),
            PanicOnCorruption,
        );
        let summary = ProcessSummary::get();

        let payload = 40_usize;
        let size_before = summary.by_category(Category::Threads).memory().size();

        let layout = Layout::from_size_align(raw_allocation_size(payload), BLOCK_ALIGNMENT)
            .expect("test layout is valid");
        // SAFETY: the layout has non-zero size.
        let base = unsafe { alloc(layout) };
        // SAFETY: `base` spans the whole raw allocation for `payload`.
        let user = unsafe {
            tracker.record_malloc(
                base,
                payload,
                Category::Threads,
                CapturedStack::default(),
                TrackingLevel::Minimal,
            )
        };

        assert_eq!(
            summary.by_category(Category::Threads).memory().size(),
            size_before
        );

        // record_free at minimal leaves the header alone too.
        // SAFETY: produced by record_malloc above.
        let recovered = unsafe { tracker.record_free(user) };
        assert_eq!(
            summary.by_category(Category::Threads).memory().size(),
            size_before
        );

        // SAFETY: same allocation, same layout.
        unsafe {
            dealloc(recovered, layout);
        }
    }

    #[test]
    fn leaving_detail_shuts_down_the_site_table_exactly_once() {
        let mut sites = MockSiteTable::new();
        sites.expect_shutdown().times(1).return_const(());
        let levels = MockLevelAuthority::new();

        let tracker = Tracker::new(sites, levels, PanicOnCorruption);
        tracker.transition(TrackingLevel::Detail, TrackingLevel::Summary);
    }

    #[test]
    fn promoting_summary_to_detail_does_not_touch_the_site_table() {
        let sites = MockSiteTable::new(); // Any call would panic.
        let levels = MockLevelAuthority::new();

        let tracker = Tracker::new(sites, levels, PanicOnCorruption);
        tracker.transition(TrackingLevel::Summary, TrackingLevel::Detail);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "minimal tracking cannot be promoted")]
    fn promoting_out_of_minimal_is_rejected() {
        let tracker = summary_tracker();
        tracker.transition(TrackingLevel::Minimal, TrackingLevel::Summary);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "cannot transition from the off state")]
    fn transitioning_from_off_is_rejected() {
        let tracker = summary_tracker();
        tracker.transition(TrackingLevel::Off, TrackingLevel::Summary);
    }
}
