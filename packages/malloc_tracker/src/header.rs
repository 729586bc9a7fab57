//! The per-block tracking header and its corruption checks.
//!
//! Every wrapped allocation is laid out as `[header][payload][footer byte]`,
//! with the caller-visible pointer aimed just past the header. The header
//! carries the payload size, the category tag and the call-site reference,
//! bracketed by canary values that are validated when the block is
//! released and overwritten with distinct dead marks afterwards.

use std::ptr::NonNull;

use crate::category::Category;
use crate::failure::{Corruption, CorruptionKind, CorruptionReport, FailurePolicy};
use crate::level::{LevelAuthority, TrackingLevel};
use crate::site::{CapturedStack, SiteReference, SiteTable};
use crate::summary::ProcessSummary;

/// Header canary while the block is live.
const HEADER_CANARY_LIFE_MARK: u16 = 0xE99E;

/// Header canary after release. Distinct from the life mark so that
/// revalidating a released block reliably fails instead of appearing
/// healthy.
const HEADER_CANARY_DEAD_MARK: u16 = 0xD99D;

const FOOTER_CANARY_LIFE_MARK: u8 = 0xE9;
const FOOTER_CANARY_DEAD_MARK: u8 = 0xD9;

#[cfg(target_pointer_width = "32")]
const SECONDARY_CANARY_LIFE_MARK: u32 = 0xE99E_E99E;
#[cfg(target_pointer_width = "32")]
const SECONDARY_CANARY_DEAD_MARK: u32 = 0xD99D_D99D;

/// Any block claiming a payload at or above this many bytes is considered
/// corrupt.
#[cfg(target_pointer_width = "64")]
pub const MAX_REASONABLE_BLOCK_SIZE: usize = 256 * 1024 * 1024 * 1024;

/// Any block claiming a payload at or above this many bytes is considered
/// corrupt.
#[cfg(target_pointer_width = "32")]
pub const MAX_REASONABLE_BLOCK_SIZE: usize = 3500 * 1024 * 1024;

/// Header addresses below this are rejected outright as implausible.
const MIN_PLAUSIBLE_BLOCK_ADDRESS: usize = 1024;

/// The least alignment any underlying allocator gives us: a full u64 word
/// even on 32-bit targets. Header addresses are validated against this.
const MIN_MALLOC_ALIGNMENT: usize = size_of::<u64>();

/// Natural allocation alignment the wrapped pointer must preserve: 8 bytes
/// on 32-bit, 16 bytes on 64-bit pointer widths.
pub const BLOCK_ALIGNMENT: usize = 2 * size_of::<usize>();

/// Metadata written into the bytes immediately preceding the pointer the
/// caller sees.
///
/// The layout is fixed at 16 bytes on both pointer widths so that a base
/// pointer with the allocator's natural alignment stays naturally aligned
/// after the header is skipped; the compile-time assertions in the test
/// module pin this down. On 32-bit targets the unused leading word doubles
/// as a secondary canary.
#[repr(C)]
#[derive(Debug)]
pub struct BlockHeader {
    #[cfg(target_pointer_width = "32")]
    secondary_canary: u32,
    size: usize,
    bucket: u16,
    position: u16,
    canary: u16,
    category: u8,
}

/// Bytes occupied by the tracking header in front of every payload.
pub const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// One canary byte appended immediately after the payload.
pub const FOOTER_SIZE: usize = 1;

/// Bytes the underlying allocator must provide for a block of
/// `payload_size` usable bytes.
#[expect(
    clippy::arithmetic_side_effects,
    reason = "payload sizes are bounded far below usize::MAX by the plausibility ceiling"
)]
#[must_use]
pub const fn raw_allocation_size(payload_size: usize) -> usize {
    HEADER_SIZE + payload_size + FOOTER_SIZE
}

/// The caller-visible pointer for a raw allocation starting at `base`.
///
/// Together with [`header_pointer`] this is the only place block geometry
/// is computed; all offset arithmetic goes through these two functions.
#[must_use]
pub fn user_pointer(base: *mut u8) -> *mut u8 {
    base.wrapping_add(HEADER_SIZE)
}

/// Recovers the header of a wrapped allocation from its caller-visible
/// pointer. Inverse of [`user_pointer`].
#[must_use]
pub fn header_pointer(user: *mut u8) -> *mut BlockHeader {
    #[expect(
        clippy::cast_ptr_alignment,
        reason = "a wrapped pointer is BLOCK_ALIGNMENT-aligned, so stepping back over the header keeps header alignment"
    )]
    user.wrapping_sub(HEADER_SIZE).cast::<BlockHeader>()
}

/// Address of the footer canary byte: one past the payload.
fn footer_pointer(header: *const BlockHeader, payload_size: usize) -> *const u8 {
    header
        .cast::<u8>()
        .wrapping_add(HEADER_SIZE)
        .wrapping_add(payload_size)
}

impl BlockHeader {
    /// In-place initializes a header at the start of the raw allocation
    /// `base`, including the footer canary past the payload.
    ///
    /// At [`TrackingLevel::Detail`] the call site is recorded with the
    /// call-site table first. A full table is not corruption: it files a
    /// downgrade request with the level authority and the block is tracked
    /// without a site.
    ///
    /// # Safety
    ///
    /// `base` must point to the start of a raw allocation of at least
    /// [`raw_allocation_size`]`(size)` writable bytes, carrying the
    /// underlying allocator's natural alignment.
    pub unsafe fn construct<S, L>(
        base: NonNull<u8>,
        size: usize,
        category: Category,
        stack: CapturedStack,
        level: TrackingLevel,
        sites: &S,
        levels: &L,
    ) where
        S: SiteTable,
        L: LevelAuthority,
    {
        debug_assert!(
            size < MAX_REASONABLE_BLOCK_SIZE,
            "a genuine allocation request must stay below the plausibility ceiling"
        );
        debug_assert!(
            base.addr().get() % MIN_MALLOC_ALIGNMENT == 0,
            "raw allocations carry at least the minimum malloc alignment"
        );

        let site = if level == TrackingLevel::Detail {
            record_site(stack, size, category, sites, levels)
        } else {
            SiteReference::NULL
        };

        #[expect(
            clippy::cast_ptr_alignment,
            reason = "the base alignment was just asserted and covers the header"
        )]
        let header = base.as_ptr().cast::<Self>();

        let value = Self {
            #[cfg(target_pointer_width = "32")]
            secondary_canary: SECONDARY_CANARY_LIFE_MARK,
            size,
            bucket: site.bucket,
            position: site.position,
            canary: HEADER_CANARY_LIFE_MARK,
            category: category as u8,
        };
        // SAFETY: the caller guarantees the raw allocation covers the
        // header bytes.
        unsafe {
            header.write(value);
        }

        // SAFETY: the caller guarantees the raw allocation extends one byte
        // past the payload for the footer canary.
        unsafe {
            footer_pointer(header, size)
                .cast_mut()
                .write(FOOTER_CANARY_LIFE_MARK);
        }
    }

    /// Runs the ordered integrity checks against a block header.
    ///
    /// The pointer itself is validated before the header is ever read: the
    /// address must be plausible and aligned first. The first failing check
    /// determines the classification.
    ///
    /// # Errors
    ///
    /// The classification of the first failed check, together with the
    /// address the check looked at.
    ///
    /// # Safety
    ///
    /// A `header` that passes the address checks is dereferenced, so it
    /// must point to readable memory spanning the header and, unless the
    /// recorded size is implausible, the footer byte. A wild pointer that
    /// slips past the address checks crashes on the reads below; that still
    /// beats trusting it.
    pub unsafe fn verify(header: *const Self) -> Result<(), Corruption> {
        let address = header.addr();

        if address < MIN_PLAUSIBLE_BLOCK_ADDRESS {
            return Err(Corruption::new(CorruptionKind::ImplausibleAddress, address));
        }
        if address % MIN_MALLOC_ALIGNMENT != 0 {
            return Err(Corruption::new(CorruptionKind::MisalignedAddress, address));
        }

        // SAFETY: plausibility and alignment were established above; the
        // caller guarantees readability.
        let block = unsafe { &*header };

        if block.canary == HEADER_CANARY_DEAD_MARK {
            return Err(Corruption::new(CorruptionKind::BlockReleased, address));
        }
        if block.canary != HEADER_CANARY_LIFE_MARK {
            return Err(Corruption::new(CorruptionKind::HeaderCanaryBroken, address));
        }

        #[cfg(target_pointer_width = "32")]
        if block.secondary_canary != SECONDARY_CANARY_LIFE_MARK {
            return Err(Corruption::new(
                CorruptionKind::SecondaryCanaryBroken,
                address,
            ));
        }

        if block.size >= MAX_REASONABLE_BLOCK_SIZE {
            return Err(Corruption::new(CorruptionKind::ImplausibleSize, address));
        }

        let footer = footer_pointer(header, block.size);
        // SAFETY: the size was just bounded, so the footer lies within the
        // raw allocation per the construction contract.
        let footer_byte = unsafe { footer.read() };
        if footer_byte != FOOTER_CANARY_LIFE_MARK {
            return Err(Corruption::new(
                CorruptionKind::FooterCanaryBroken,
                footer.addr(),
            ));
        }

        Ok(())
    }

    /// Validates the block and, on any failure, hands a corruption report
    /// to the failure policy, which does not return.
    ///
    /// # Safety
    ///
    /// Same contract as [`BlockHeader::verify`].
    pub unsafe fn check_integrity<F>(header: *const Self, failure: &F)
    where
        F: FailurePolicy,
    {
        // SAFETY: forwarded caller contract.
        if let Err(corruption) = unsafe { Self::verify(header) } {
            failure.on_corruption(&CorruptionReport::new(header.addr(), corruption));
        }
    }

    /// Unwraps a block on deallocation: validates it, records the free
    /// (payload and header overhead) in the process summary, notifies the
    /// call-site table when detail tracking is active, and permanently
    /// dead-marks the header.
    ///
    /// When tracking has already been reduced to
    /// [`TrackingLevel::Minimal`] or lower there is no bookkeeping left to
    /// do and the header is left untouched.
    ///
    /// # Safety
    ///
    /// `header` must have been written by [`BlockHeader::construct`] for a
    /// block not yet released, and the calling thread must logically own
    /// the block: each block is released exactly once, by one thread.
    pub unsafe fn release<S, L, F>(header: *mut Self, sites: &S, levels: &L, failure: &F)
    where
        S: SiteTable,
        L: LevelAuthority,
        F: FailurePolicy,
    {
        if levels.current_level() <= TrackingLevel::Minimal {
            return;
        }

        // SAFETY: forwarded caller contract.
        unsafe {
            Self::check_integrity(header, failure);
        }

        // SAFETY: check_integrity does not return on a broken header, so
        // the block is intact here.
        let block = unsafe { &*header };
        let size = block.size();
        let category = block.category();
        let site = block.site();

        let summary = ProcessSummary::get();
        summary.by_category(category).record_free(size);
        summary.header_overhead().record_free(HEADER_SIZE);

        if levels.current_level() == TrackingLevel::Detail {
            sites.deallocate_at(size, site);
        }

        // SAFETY: exclusive ownership during release per the caller
        // contract.
        unsafe {
            Self::mark_dead(header);
        }
    }

    /// Overwrites every canary with its dead mark so that a later
    /// revalidation of this block reliably fails.
    ///
    /// # Safety
    ///
    /// The caller must own `header` exclusively, and it must span a full
    /// raw allocation so the footer byte is writable.
    pub unsafe fn mark_dead(header: *mut Self) {
        // SAFETY: forwarded caller contract.
        let block = unsafe { &mut *header };
        block.canary = HEADER_CANARY_DEAD_MARK;
        #[cfg(target_pointer_width = "32")]
        {
            block.secondary_canary = SECONDARY_CANARY_DEAD_MARK;
        }

        let footer = footer_pointer(header, block.size).cast_mut();
        // SAFETY: the footer byte is part of the raw allocation per the
        // caller contract.
        unsafe {
            footer.write(FOOTER_CANARY_DEAD_MARK);
        }
    }

    /// Payload size recorded at construction.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Category recorded at construction.
    #[must_use]
    pub fn category(&self) -> Category {
        debug_assert!(
            usize::from(self.category) < Category::COUNT,
            "category bytes are written from the closed enum"
        );
        // A corrupt category byte that survived the canary checks folds
        // into the catch-all rather than indexing out of bounds.
        Category::from_index(usize::from(self.category)).unwrap_or(Category::Other)
    }

    /// Call-site reference recorded at construction. Only meaningful while
    /// detail tracking is active.
    #[must_use]
    pub fn site(&self) -> SiteReference {
        SiteReference {
            bucket: self.bucket,
            position: self.position,
        }
    }

    /// Resolves the stored call-site reference back to its captured stack.
    pub fn lookup_stack<S>(&self, sites: &S) -> Option<CapturedStack>
    where
        S: SiteTable,
    {
        sites.lookup_stack(self.site())
    }
}

/// Records a call site with the call-site table.
///
/// Exhaustion is expected under memory pressure: tracking degrades to
/// summary accounting instead of failing the allocation.
fn record_site<S, L>(
    stack: CapturedStack,
    size: usize,
    category: Category,
    sites: &S,
    levels: &L,
) -> SiteReference
where
    S: SiteTable,
    L: LevelAuthority,
{
    sites.allocate_at(stack, size, category).unwrap_or_else(|| {
        levels.request_downgrade(TrackingLevel::Summary);
        SiteReference::NULL
    })
}
