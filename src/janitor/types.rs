//! Types used by the snapshot janitor.

use std::time::Duration;

/// Default age a directory must reach before the janitor touches it.
pub const DEFAULT_MIN_AGE_SECS: u64 = 3600;

/// Configuration for a janitor sweep.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct JanitorConfig {
    /// Directories modified more recently than this are left alone, since
    /// they may belong to a copy in progress or a volume not yet published.
    pub min_age: Duration,
    /// Whether committed snapshots no volume references are removed rather
    /// than only reported.
    pub delete_unreferenced: bool,
}

impl JanitorConfig {
    /// Builds a configuration from command-line values.
    #[must_use]
    pub const fn new(min_age_secs: u64, delete_unreferenced: bool) -> Self {
        Self {
            min_age: Duration::from_secs(min_age_secs),
            delete_unreferenced,
        }
    }
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_AGE_SECS, false)
    }
}

/// Summary of janitor work.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SweepSummary {
    /// Snapshot directories referenced by a published volume.
    pub referenced: usize,
    /// Directories without completion marker that were removed.
    pub removed_partial: usize,
    /// Committed but unreferenced directories that were removed.
    pub removed_unreferenced: usize,
    /// Committed but unreferenced directories left in place.
    pub kept_unreferenced: Vec<String>,
    /// Directories skipped because they are younger than the minimum age.
    pub skipped_recent: usize,
    /// Entries whose names are not valid snapshot labels.
    pub skipped_foreign: usize,
}
