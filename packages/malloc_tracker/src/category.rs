//! The closed set of allocation categories.

use std::fmt;

/// Classifies an allocation by the subsystem it serves.
///
/// The set is closed by design: per-category statistics live in fixed
/// arrays sized by [`Category::COUNT`] and indexed by the discriminant.
/// Adding a variant means extending [`Category::ALL`] alongside it.
#[expect(
    clippy::exhaustive_enums,
    reason = "the category set is intentionally closed; statistics arrays are sized to it"
)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum Category {
    /// Core runtime data structures.
    Runtime = 0,

    /// Thread bookkeeping, excluding the stacks themselves.
    Threads = 1,

    /// Generated and loaded executable code.
    Code = 2,

    /// Garbage collector working memory.
    Gc = 3,

    /// Compiler working memory.
    Compiler = 4,

    /// Interned symbols and string tables.
    Symbols = 5,

    /// Internal bookkeeping that fits no other category.
    Internal = 6,

    /// Raw backing chunks carved up by arena allocators.
    Chunk = 7,

    /// Allocations whose origin is not classified.
    Other = 8,
}

impl Category {
    /// Number of categories; fixed per-category arrays use this as their length.
    pub const COUNT: usize = 9;

    /// Every category, in discriminant order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::Runtime,
        Self::Threads,
        Self::Code,
        Self::Gc,
        Self::Compiler,
        Self::Symbols,
        Self::Internal,
        Self::Chunk,
        Self::Other,
    ];

    /// The category whose accounting carries the raw chunks that back arena
    /// allocators.
    ///
    /// Arena-held memory is reported twice: once by the owning category's
    /// arena counter and once through the chunks recorded here. The
    /// duplication is corrected by
    /// [`CategorySnapshot::make_adjustment`](crate::CategorySnapshot::make_adjustment).
    pub const RAW_CHUNKS: Self = Self::Chunk;

    /// Position of this category in fixed per-category arrays.
    #[must_use]
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Inverse of [`Category::index`].
    #[must_use]
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Whether allocations of this category are served out of arenas.
    #[must_use]
    pub const fn uses_arenas(self) -> bool {
        matches!(self, Self::Gc | Self::Compiler | Self::Symbols)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Runtime => "runtime",
            Self::Threads => "threads",
            Self::Code => "code",
            Self::Gc => "gc",
            Self::Compiler => "compiler",
            Self::Symbols => "symbols",
            Self::Internal => "internal",
            Self::Chunk => "chunk",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}
