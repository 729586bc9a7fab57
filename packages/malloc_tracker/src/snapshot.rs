//! Per-category aggregation of allocation statistics.

use crate::category::Category;
use crate::counter::Counter;

/// Statistics for a single category: directly malloc'd memory plus memory
/// held by the category's arenas.
///
/// The two counters are deliberately separate. Arena-backed categories
/// receive memory through backing chunks that are themselves malloc'd under
/// [`Category::RAW_CHUNKS`], so arena-held bytes show up twice across the
/// snapshot until [`CategorySnapshot::make_adjustment`] corrects for it.
#[derive(Debug)]
pub struct CategoryUsage {
    memory: Counter,
    arena: Counter,
}

impl CategoryUsage {
    const fn new() -> Self {
        Self {
            memory: Counter::new(),
            arena: Counter::new(),
        }
    }

    /// Counter for directly malloc'd blocks of this category.
    #[must_use]
    pub fn memory(&self) -> &Counter {
        &self.memory
    }

    /// Counter for memory held by this category's arenas.
    #[must_use]
    pub fn arena(&self) -> &Counter {
        &self.arena
    }

    /// Records a malloc'd block of `size` payload bytes.
    #[inline]
    pub fn record_malloc(&self, size: usize) {
        self.memory.record_allocate(size);
    }

    /// Records the release of a malloc'd block of `size` payload bytes.
    #[inline]
    pub fn record_free(&self, size: usize) {
        self.memory.record_free(size);
    }

    /// Records `size` bytes newly held by one of this category's arenas.
    #[inline]
    pub fn record_arena_allocate(&self, size: usize) {
        self.arena.record_allocate(size);
    }

    /// Records `size` bytes returned by one of this category's arenas.
    #[inline]
    pub fn record_arena_free(&self, size: usize) {
        self.arena.record_free(size);
    }
}

/// A fixed array of per-category usage records, plus one counter for the
/// tracking headers themselves.
///
/// The derived totals are best-effort reads: each counter is individually
/// atomic, but nothing freezes the array while it is being summed, so a
/// total is not a linearizable snapshot across categories.
#[derive(Debug)]
pub struct CategorySnapshot {
    usage: [CategoryUsage; Category::COUNT],
    header_overhead: Counter,
}

impl CategorySnapshot {
    pub(crate) const fn new() -> Self {
        Self {
            usage: [const { CategoryUsage::new() }; Category::COUNT],
            header_overhead: Counter::new(),
        }
    }

    /// Usage record for one category.
    #[must_use]
    #[inline]
    pub fn by_category(&self, category: Category) -> &CategoryUsage {
        #[expect(
            clippy::indexing_slicing,
            reason = "the index comes from a closed enum the array is sized to"
        )]
        &self.usage[category.index()]
    }

    /// Counter tracking the memory consumed by the block headers themselves.
    #[must_use]
    pub fn header_overhead(&self) -> &Counter {
        &self.header_overhead
    }

    /// Total number of live tracked blocks across all categories.
    #[must_use]
    pub fn total_count(&self) -> usize {
        Category::ALL
            .iter()
            .map(|category| self.by_category(*category).memory().count())
            .fold(0, usize::wrapping_add)
    }

    /// Total tracked bytes: malloc'd payloads, tracking headers and
    /// arena-held memory.
    #[must_use]
    pub fn total(&self) -> usize {
        let malloc_total = Category::ALL
            .iter()
            .map(|category| self.by_category(*category).memory().size())
            .fold(0, usize::wrapping_add);

        malloc_total
            .wrapping_add(self.header_overhead.size())
            .wrapping_add(self.total_arena())
    }

    /// Bytes held by the arenas of arena-backed categories.
    #[must_use]
    pub fn total_arena(&self) -> usize {
        Category::ALL
            .iter()
            .filter(|category| category.uses_arenas())
            .map(|category| self.by_category(*category).arena().size())
            .fold(0, usize::wrapping_add)
    }

    /// Removes the double counting between arena-held memory and the raw
    /// chunks backing it by recording the arena total as freed against
    /// [`Category::RAW_CHUNKS`].
    ///
    /// Call exactly once per reporting pass, at a point where a consistent
    /// correction is wanted; this is not a hot-path operation.
    pub fn make_adjustment(&self) {
        let arena_total = self.total_arena();
        self.by_category(Category::RAW_CHUNKS)
            .record_free(arena_total);
    }
}
