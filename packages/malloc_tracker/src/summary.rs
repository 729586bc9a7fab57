//! The process-wide allocation summary singleton.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::snapshot::CategorySnapshot;

/// Statically reserved storage for the snapshot singleton.
///
/// The tracking layer instruments allocation itself, so the singleton must
/// not come from the ordinary dynamic-allocation or lazy-initialization
/// machinery: the storage is a plain static and construction is an explicit
/// step in the embedder's startup sequence.
struct SummaryStorage {
    initialized: AtomicBool,
    snapshot: UnsafeCell<MaybeUninit<CategorySnapshot>>,
}

// SAFETY: The snapshot cell is written exactly once, before the release
// store of `initialized` publishes it; every later access is a shared read
// of the cell, and the snapshot's own interior is atomic.
unsafe impl Sync for SummaryStorage {}

static STORAGE: SummaryStorage = SummaryStorage {
    initialized: AtomicBool::new(false),
    snapshot: UnsafeCell::new(MaybeUninit::uninit()),
};

/// The process-wide [`CategorySnapshot`] singleton.
///
/// [`ProcessSummary::initialize`] must run exactly once, before any
/// accounting call, whenever tracking operates at
/// [`TrackingLevel::Summary`](crate::TrackingLevel::Summary) or richer.
/// There is no teardown: the summary lives for the rest of the process.
#[derive(Debug)]
pub struct ProcessSummary;

impl ProcessSummary {
    /// One-time construction of the summary singleton in its reserved
    /// storage.
    ///
    /// The embedder's startup sequence must order this call before any
    /// accounting call; that ordering is not re-established here.
    ///
    /// # Panics
    ///
    /// Panics when called a second time. Double initialization is a fatal
    /// programming error in the startup sequence, not a recoverable
    /// condition.
    pub fn initialize() {
        assert!(
            !STORAGE.initialized.load(Ordering::Relaxed),
            "the process summary must be initialized exactly once"
        );

        // SAFETY: First initialization; nothing reads the cell until the
        // release store below publishes it.
        unsafe {
            (*STORAGE.snapshot.get()).write(CategorySnapshot::new());
        }

        STORAGE.initialized.store(true, Ordering::Release);
    }

    /// Whether [`ProcessSummary::initialize`] has run.
    #[must_use]
    pub fn is_initialized() -> bool {
        STORAGE.initialized.load(Ordering::Acquire)
    }

    /// The summary singleton.
    ///
    /// # Panics
    ///
    /// Panics if the summary has not been initialized.
    #[must_use]
    pub fn get() -> &'static CategorySnapshot {
        assert!(
            Self::is_initialized(),
            "the process summary was used before initialization"
        );

        // SAFETY: The acquire load above observed the release store that
        // published the fully written snapshot, and the snapshot is never
        // dropped or moved out of its static storage.
        unsafe { (*STORAGE.snapshot.get()).assume_init_ref() }
    }
}

/// Shared one-time initialization for tests living inside this crate, which
/// all run in one process and would otherwise trip the double-init panic.
#[cfg(test)]
pub(crate) fn ensure_initialized_for_tests() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(ProcessSummary::initialize);
}
