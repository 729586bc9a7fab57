//! Accounting lifecycle scenarios against the process-wide summary.
//!
//! Everything lives in one test function: the scenarios assert exact
//! global totals, which only works while nothing else is mutating the
//! summary singleton of this test process.

use std::alloc::{Layout, alloc, dealloc};

use malloc_tracker::{
    BLOCK_ALIGNMENT, CapturedStack, Category, CorruptionReport, FailurePolicy, HEADER_SIZE,
    LevelAuthority, ProcessSummary, SiteReference, SiteTable, Tracker, TrackingLevel,
    raw_allocation_size,
};

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

fn wrap(
    tracker: &Tracker<NoSites, FixedLevel, PanicOnCorruption>,
    payload: usize,
    category: Category,
) -> (*mut u8, Layout) {
    let layout = Layout::from_size_align(raw_allocation_size(payload), BLOCK_ALIGNMENT)
        .expect("test layout is valid");
    // SAFETY: the layout has non-zero size.
    let base = unsafe { alloc(layout) };
    assert!(!base.is_null(), "test allocation failed");

    // SAFETY: `base` spans the whole raw allocation for `payload` bytes.
    let user = unsafe {
        tracker.record_malloc(
            base,
            payload,
            category,
            CapturedStack::default(),
            TrackingLevel::Summary,
        )
    };
    (user, layout)
}

fn unwrap_and_free(
    tracker: &Tracker<NoSites, FixedLevel, PanicOnCorruption>,
    user: *mut u8,
    layout: Layout,
) {
    // SAFETY: `user` was produced by `wrap` and is released exactly once.
    let base = unsafe { tracker.record_free(user) };
    // SAFETY: same allocation, same layout.
    unsafe {
        dealloc(base, layout);
    }
}

#[test]
fn totals_follow_the_allocation_lifecycle() {
    let tracker = Tracker::new(NoSites, FixedLevel(TrackingLevel::Summary), PanicOnCorruption);
    tracker
        .initialize(TrackingLevel::Summary)
        .expect("summary tracking has no fallible setup");
    let summary = ProcessSummary::get();

    let baseline_total = summary.total();
    let baseline_count = summary.total_count();

    // One allocation moves the total by payload plus header overhead.
    let (user, layout) = wrap(&tracker, 100, Category::Code);
    assert_eq!(summary.total(), baseline_total + 100 + HEADER_SIZE);
    assert_eq!(summary.total_count(), baseline_count + 1);

    // Releasing it returns the totals to the pre-allocation baseline.
    unwrap_and_free(&tracker, user, layout);
    assert_eq!(summary.total(), baseline_total);
    assert_eq!(summary.total_count(), baseline_count);

    // Any sequence of matched pairs does the same, across categories.
    let mut live = Vec::new();
    for (payload, category) in [
        (16_usize, Category::Runtime),
        (32, Category::Gc),
        (64, Category::Code),
        (128, Category::Runtime),
    ] {
        live.push((wrap(&tracker, payload, category), category));
    }
    for ((user, layout), _category) in live.drain(..) {
        unwrap_and_free(&tracker, user, layout);
    }
    assert_eq!(summary.total(), baseline_total);
    assert_eq!(summary.total_count(), baseline_count);

    #[cfg(debug_assertions)]
    {
        // Peaks remember the high-water mark even after everything was
        // released.
        assert!(summary.by_category(Category::Runtime).memory().peak_size() >= 16 + 128);
        assert!(summary.by_category(Category::Runtime).memory().peak_count() >= 2);
    }

    // Arena accounting: chunks arrive under the raw-chunk category, then
    // get re-reported as arena-held memory by the owning categories.
    summary
        .by_category(Category::RAW_CHUNKS)
        .record_malloc(8192);
    summary.by_category(Category::Gc).record_arena_allocate(3000);
    summary
        .by_category(Category::Compiler)
        .record_arena_allocate(1000);

    assert_eq!(summary.total_arena(), 4000);

    let chunk_size_before = summary.by_category(Category::RAW_CHUNKS).memory().size();
    summary.make_adjustment();
    assert_eq!(
        summary.by_category(Category::RAW_CHUNKS).memory().size(),
        chunk_size_before - 4000
    );
}
