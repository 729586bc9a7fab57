//! Tracking levels and the authority that owns the active level.

use std::fmt;

/// How much bookkeeping the tracking layer performs.
///
/// Levels are ordered by richness, so comparisons read naturally:
/// `level >= TrackingLevel::Summary` means "aggregate accounting is active".
#[expect(
    clippy::exhaustive_enums,
    reason = "the level state machine is intentionally closed"
)]
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(u8)]
pub enum TrackingLevel {
    /// No tracking at all. The only level reachable without initialization.
    Off = 0,

    /// Block headers are still written, but aggregate accounting is shut
    /// down. Reached only by downgrading; never promoted out of, because
    /// the statistics go stale while this level is in force.
    Minimal = 1,

    /// Per-category aggregate accounting.
    Summary = 2,

    /// Aggregate accounting plus per-call-site attribution.
    Detail = 3,
}

impl fmt::Display for TrackingLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Off => "off",
            Self::Minimal => "minimal",
            Self::Summary => "summary",
            Self::Detail => "detail",
        };
        f.write_str(name)
    }
}

/// Owns the process-wide tracking level.
///
/// The authority serializes level transitions against all mutator
/// allocation activity; this crate only reads the level in force and files
/// downgrade requests, for example when the call-site table fills up.
#[cfg_attr(test, mockall::automock)]
pub trait LevelAuthority {
    /// The level currently in force.
    fn current_level(&self) -> TrackingLevel;

    /// Asks the authority to lower the tracking level.
    ///
    /// The request is asynchronous from this crate's point of view: the
    /// authority applies it once in-flight allocation activity permits.
    fn request_downgrade(&self, to: TrackingLevel);
}
