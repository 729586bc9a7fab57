//! Corruption classification and the failure policy seam.

use std::fmt;
use std::io::Write;
use std::process;

/// Which integrity check a block failed first.
///
/// The checks run in a fixed order, so the kind identifies the first broken
/// property, not necessarily the only one.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum CorruptionKind {
    /// The block address is null or too low to be a real allocation.
    ImplausibleAddress,

    /// The block address does not meet the minimum malloc alignment.
    MisalignedAddress,

    /// The header canary carries the dead mark: this block was already
    /// released. In practice this is a double free.
    BlockReleased,

    /// The header canary matches neither the life nor the dead mark.
    HeaderCanaryBroken,

    /// The secondary header canary is broken. Only possible on targets
    /// whose pointer width is narrower than the canary field.
    #[cfg(target_pointer_width = "32")]
    SecondaryCanaryBroken,

    /// The recorded payload size exceeds the plausibility ceiling.
    ImplausibleSize,

    /// The canary byte after the payload is broken; the usual cause is a
    /// buffer overflow out of the payload.
    FooterCanaryBroken,
}

impl fmt::Display for CorruptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            Self::ImplausibleAddress => "invalid block address",
            Self::MisalignedAddress => "block address is unaligned",
            Self::BlockReleased => "block was already released (double free?)",
            Self::HeaderCanaryBroken => "header canary broken",
            #[cfg(target_pointer_width = "32")]
            Self::SecondaryCanaryBroken => "secondary header canary broken",
            Self::ImplausibleSize => "header looks invalid (weirdly large block size)",
            Self::FooterCanaryBroken => "footer canary broken (buffer overflow?)",
        };
        f.write_str(message)
    }
}

/// One failed integrity check: what failed, and at which address.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Corruption {
    kind: CorruptionKind,
    corrupted_address: usize,
}

impl Corruption {
    pub(crate) const fn new(kind: CorruptionKind, corrupted_address: usize) -> Self {
        Self {
            kind,
            corrupted_address,
        }
    }

    /// Classification of the first failed check.
    #[must_use]
    pub const fn kind(&self) -> CorruptionKind {
        self.kind
    }

    /// Address of the bytes the failed check looked at.
    #[must_use]
    pub const fn corrupted_address(&self) -> usize {
        self.corrupted_address
    }
}

/// Everything a failure policy needs to report a corrupt block.
#[derive(Clone, Copy, Debug)]
pub struct CorruptionReport {
    header_address: usize,
    corruption: Corruption,
}

impl CorruptionReport {
    pub(crate) const fn new(header_address: usize, corruption: Corruption) -> Self {
        Self {
            header_address,
            corruption,
        }
    }

    /// Address of the block header that failed validation.
    #[must_use]
    pub const fn header_address(&self) -> usize {
        self.header_address
    }

    /// The failed check.
    #[must_use]
    pub const fn corruption(&self) -> Corruption {
        self.corruption
    }
}

impl fmt::Display for CorruptionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tracked block at {:#x}: {}, corruption at: {:#x}",
            self.header_address,
            self.corruption.kind(),
            self.corruption.corrupted_address()
        )
    }
}

/// Decides what happens when a corrupt block is detected.
///
/// Injectable so embedders preferring a structured shutdown can substitute
/// their own termination path; [`AbortOnCorruption`] is the default and the
/// safety-preserving choice. The policy must not return: once a header's
/// canaries are broken, the tracking metadata — and possibly the allocator
/// state behind it — cannot be trusted, so there is no caller to report an
/// error to.
pub trait FailurePolicy {
    /// Handles a corrupt block. Must not return.
    fn on_corruption(&self, report: &CorruptionReport) -> !;
}

/// Default policy: dump the memory around the corruption to stderr, then
/// abort the process.
#[derive(Clone, Copy, Debug, Default)]
pub struct AbortOnCorruption;

impl FailurePolicy for AbortOnCorruption {
    #[cfg_attr(test, mutants::skip)] // Terminates the process; nothing observable to assert.
    fn on_corruption(&self, report: &CorruptionReport) -> ! {
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "{report}");

        // SAFETY: Best-effort dump of memory this process may not own; the
        // reads can fault on unmapped addresses, and this path ends in
        // abort either way.
        unsafe {
            dump_block_neighborhood(&mut stderr, report);
        }

        process::abort();
    }
}

/// Hex-dumps the memory around the failed header and, when disjoint from
/// the first range, around the corrupted bytes as well. Overwrites usually
/// land just outside the block, so a fixed window around each address is
/// what a human wants to see first.
///
/// # Safety
///
/// Reads raw memory with no validity guarantee and may fault on unmapped
/// addresses. Only call on a path that terminates the process.
#[expect(
    clippy::arithmetic_side_effects,
    reason = "window arithmetic on addresses is saturating or far below usize::MAX"
)]
pub(crate) unsafe fn dump_block_neighborhood(out: &mut impl Write, report: &CorruptionReport) {
    let word = size_of::<usize>();

    let from = align_down(report.header_address(), word).saturating_sub(8);
    let to = from + 64;
    // SAFETY: forwarded caller contract.
    unsafe {
        dump_range(out, from, to);
    }

    // If the corruption sits past the first window (block body or footer),
    // show that part too, without repeating anything already dumped.
    let corrupted = report.corruption().corrupted_address();
    let from_second = align_down(corrupted, word).saturating_sub(8).max(to);
    let to_second = from_second + 96;
    if to_second > to {
        if from_second > to {
            let _ = writeln!(out, "...");
        }
        // SAFETY: forwarded caller contract.
        unsafe {
            dump_range(out, from_second, to_second);
        }
    }
}

/// Writes `[from, to)` as lines of eight space-separated hex bytes.
///
/// # Safety
///
/// Every address in `[from, to)` is read raw; the caller accepts that the
/// reads may fault.
#[expect(
    clippy::arithmetic_side_effects,
    reason = "line arithmetic on addresses is bounded by the fixed dump window"
)]
unsafe fn dump_range(out: &mut impl Write, from: usize, to: usize) {
    let mut line = from;
    while line < to {
        let _ = write!(out, "{line:#018x}:");
        for offset in 0..8_usize {
            // SAFETY: forwarded caller contract.
            let byte = unsafe { ((line + offset) as *const u8).read() };
            let _ = write!(out, " {byte:02x}");
        }
        let _ = writeln!(out);
        line += 8;
    }
}

const fn align_down(value: usize, alignment: usize) -> usize {
    value & !(alignment.wrapping_sub(1))
}
