//! Example demonstrating summary-level tracking.
//!
//! Plays the role of the embedding allocator layer: allocates raw blocks,
//! asks the tracker to wrap them, and reads the per-category statistics
//! back out of the process summary.

use std::alloc::{Layout, alloc, dealloc};

use malloc_tracker::{
    AbortOnCorruption, BLOCK_ALIGNMENT, CapturedStack, Category, HEADER_SIZE, LevelAuthority,
    ProcessSummary, SiteReference, SiteTable, Tracker, TrackingLevel, raw_allocation_size,
};

/// Summary-level tracking never consults the call-site table.
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

fn main() {
    let tracker = Tracker::new(
        NoSites,
        FixedLevel(TrackingLevel::Summary),
        AbortOnCorruption,
    );
    tracker
        .initialize(TrackingLevel::Summary)
        .expect("summary tracking has no fallible setup");

    println!("=== Summary tracking example ===\n");
    println!("header overhead per block: {HEADER_SIZE} bytes\n");

    // Wrap a few allocations across categories, as the embedder's malloc
    // path would.
    let blocks: Vec<_> = [
        (1024_usize, Category::Runtime),
        (256, Category::Code),
        (4096, Category::Gc),
        (512, Category::Runtime),
    ]
    .into_iter()
    .map(|(payload, category)| {
        let layout = Layout::from_size_align(raw_allocation_size(payload), BLOCK_ALIGNMENT)
            .expect("example layouts are valid");
        // SAFETY: the layout has non-zero size.
        let base = unsafe { alloc(layout) };
        assert!(!base.is_null(), "example allocation failed");

        // SAFETY: `base` spans the whole raw allocation for `payload`.
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
    })
    .collect();

    let summary = ProcessSummary::get();
    println!("with {} blocks live:", blocks.len());
    for category in [Category::Runtime, Category::Code, Category::Gc] {
        let usage = summary.by_category(category).memory();
        println!(
            "  {category}: {} blocks, {} bytes",
            usage.count(),
            usage.size()
        );
    }
    println!("  total (incl. header overhead): {} bytes", summary.total());

    for (user, layout) in blocks {
        // SAFETY: produced by record_malloc above, released exactly once.
        let base = unsafe { tracker.record_free(user) };
        // SAFETY: same allocation, same layout.
        unsafe {
            dealloc(base, layout);
        }
    }

    println!("\nafter releasing everything:");
    println!("  total: {} bytes", summary.total());
    println!("  live blocks: {}", summary.total_count());
}
