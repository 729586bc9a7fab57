//! Heap allocation accounting with per-block corruption detection.
//!
//! This package wraps every heap allocation of a long-running native
//! process in an invisible metadata block, verifies that block's integrity
//! when it is released, and maintains lock-free aggregate statistics
//! (count, size and historical peak) per allocation category and globally.
//! It answers "how much memory is in use, by whom, and is it corrupted?"
//! at low, tunable overhead.
//!
//! The building blocks:
//! - [`Tracker`] — the entry point: wraps raw allocations
//!   ([`Tracker::record_malloc`]), unwraps and validates them
//!   ([`Tracker::record_free`]) and drives the tracking-level state
//!   machine.
//! - [`BlockHeader`] — per-allocation metadata placed immediately before
//!   the caller-visible pointer, bracketed by canary values, with one
//!   canary byte after the payload.
//! - [`ProcessSummary`] / [`CategorySnapshot`] / [`Counter`] — the
//!   process-wide aggregate statistics, updated wait-free on every wrapped
//!   allocation and release.
//! - Collaborator seams — [`SiteTable`] (per-call-site statistics),
//!   [`LevelAuthority`] (owns the active [`TrackingLevel`]) and
//!   [`FailurePolicy`] (what to do about corruption;
//!   [`AbortOnCorruption`] by default).
//!
//! This package does not replace an allocator. The embedder allocates
//! [`raw_allocation_size`]`(payload)` bytes however it likes, asks the
//! tracker to wrap the block, and hands the returned pointer to its
//! caller; on free it asks the tracker to unwrap and then releases the
//! raw block itself.
//!
//! # Wrapping and unwrapping
//!
//! ```
//! use std::alloc::{Layout, alloc, dealloc};
//!
//! use malloc_tracker::{
//!     AbortOnCorruption, BLOCK_ALIGNMENT, CapturedStack, Category, LevelAuthority,
//!     ProcessSummary, SiteReference, SiteTable, Tracker, TrackingLevel,
//!     raw_allocation_size,
//! };
//!
//! // Summary-level tracking needs no call-site table; wire trivial seams.
//! struct NoSites;
//!
//! impl SiteTable for NoSites {
//!     fn initialize(&self) -> bool {
//!         true
//!     }
//!     fn shutdown(&self) {}
//!     fn allocate_at(
//!         &self,
//!         _stack: CapturedStack,
//!         _size: usize,
//!         _category: Category,
//!     ) -> Option<SiteReference> {
//!         None
//!     }
//!     fn deallocate_at(&self, _size: usize, _site: SiteReference) {}
//!     fn lookup_stack(&self, _site: SiteReference) -> Option<CapturedStack> {
//!         None
//!     }
//! }
//!
//! struct FixedLevel(TrackingLevel);
//!
//! impl LevelAuthority for FixedLevel {
//!     fn current_level(&self) -> TrackingLevel {
//!         self.0
//!     }
//!     fn request_downgrade(&self, _to: TrackingLevel) {}
//! }
//!
//! let tracker = Tracker::new(
//!     NoSites,
//!     FixedLevel(TrackingLevel::Summary),
//!     AbortOnCorruption,
//! );
//! tracker
//!     .initialize(TrackingLevel::Summary)
//!     .expect("summary tracking has no fallible setup");
//!
//! let payload = 64_usize;
//! let layout = Layout::from_size_align(raw_allocation_size(payload), BLOCK_ALIGNMENT)
//!     .expect("valid layout");
//!
//! // SAFETY: the layout has non-zero size.
//! let raw = unsafe { alloc(layout) };
//!
//! // SAFETY: `raw` spans the whole raw allocation for `payload` bytes.
//! let user = unsafe {
//!     tracker.record_malloc(
//!         raw,
//!         payload,
//!         Category::Runtime,
//!         CapturedStack::default(),
//!         TrackingLevel::Summary,
//!     )
//! };
//! assert!(!user.is_null());
//! assert!(ProcessSummary::get().total() >= payload);
//!
//! // SAFETY: `user` came from record_malloc above and is released once.
//! let base = unsafe { tracker.record_free(user) };
//! // SAFETY: same allocation, same layout.
//! unsafe { dealloc(base, layout) };
//! ```
//!
//! # Tracking levels
//!
//! Tracking runs at one of four levels, ordered by richness:
//! [`TrackingLevel::Off`], [`TrackingLevel::Minimal`] (headers only,
//! accounting shut down), [`TrackingLevel::Summary`] (per-category
//! aggregates) and [`TrackingLevel::Detail`] (aggregates plus call-site
//! attribution). Levels only ever degrade while the process runs — for
//! example, a full call-site table downgrades detail tracking to summary
//! instead of failing allocations.
//!
//! # Corruption handling
//!
//! A block that fails validation on release is unrecoverable by
//! definition: the header cannot be trusted, so no error is returned to
//! the caller. The injected [`FailurePolicy`] decides what happens;
//! the default dumps the memory around the corruption and aborts the
//! process.

mod category;
mod counter;
mod failure;
mod header;
mod level;
mod site;
mod snapshot;
mod summary;
mod tracker;

pub use category::Category;
pub use counter::Counter;
pub use failure::{
    AbortOnCorruption, Corruption, CorruptionKind, CorruptionReport, FailurePolicy,
};
pub use header::{
    BLOCK_ALIGNMENT, BlockHeader, FOOTER_SIZE, HEADER_SIZE, MAX_REASONABLE_BLOCK_SIZE,
    header_pointer, raw_allocation_size, user_pointer,
};
pub use level::{LevelAuthority, TrackingLevel};
pub use site::{CapturedStack, SiteReference, SiteTable};
pub use snapshot::{CategorySnapshot, CategoryUsage};
pub use summary::ProcessSummary;
pub use tracker::{InitializeError, Tracker};
