//! # Identifiers and shared names for the fit engine
//!
//! This module centralizes the **typed handles** used as registry keys and the
//! **column names** of batch result tables.
//!
//! ## Overview
//!
//! - [`PageId`] – opaque fit-page handle, with the two reserved aggregate pages
//!   [`PageId::SIMULTANEOUS`] and [`PageId::COMBINED_BATCH`]
//! - [`DataId`] – dataset handle, unique within a page
//! - [`JobId`] – background job handle returned by a fit request
//! - [`FitId`] – integer id under which a problem is bound to a fitter instance
//! - [`GroupId`] – plot group a result curve belongs to
//! - [`IdSequence`] – monotonic counter used to mint job and group ids
//!
//! Composite keys are never built by string concatenation: a problem is addressed by
//! the `(PageId, DataId)` pair.

use std::fmt;

use serde::{Deserialize, Serialize};

// -------------------------------------------------------------------------------------------------
// Batch table column names
// -------------------------------------------------------------------------------------------------

/// Column holding the recomputed chi-squared of each batch row
pub const CHI2_COLUMN: &str = "Chi2";

/// Column holding the dataset name of each batch row
pub const DATA_COLUMN: &str = "Data";

/// Prefix of the standard-error column emitted for each fitted parameter
pub const ERROR_COLUMN_PREFIX: &str = "error on ";

/// Minted plot-group ids start above this value so they never collide with the
/// default group of a dataset (its own id).
pub const MINTED_GROUP_OFFSET: u64 = 1 << 32;

// -------------------------------------------------------------------------------------------------
// Identifiers
// -------------------------------------------------------------------------------------------------

/// Opaque identifier of a fit page.
///
/// Two values are reserved for the aggregate pages: a fit requested on one of them
/// runs over every armed problem of every ordinary page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageId(pub u64);

impl PageId {
    /// The simultaneous/constrained fit page.
    pub const SIMULTANEOUS: PageId = PageId(u64::MAX);

    /// The combined-batch fit page.
    pub const COMBINED_BATCH: PageId = PageId(u64::MAX - 1);

    pub fn is_reserved(self) -> bool {
        self == Self::SIMULTANEOUS || self == Self::COMBINED_BATCH
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            PageId::SIMULTANEOUS => write!(f, "simultaneous fit page"),
            PageId::COMBINED_BATCH => write!(f, "combined batch page"),
            PageId(n) => write!(f, "page {n}"),
        }
    }
}

impl From<u64> for PageId {
    fn from(n: u64) -> Self {
        PageId(n)
    }
}

/// Dataset identifier, unique within its page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataId(pub u64);

impl fmt::Display for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for DataId {
    fn from(n: u64) -> Self {
        DataId(n)
    }
}

/// Handle of a submitted background job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Id of a problem inside one fitter instance.
///
/// Ids start at 1 and are allocated once per bound problem, so that constraint
/// expressions can address models as `M<fit_id>`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct FitId(pub usize);

impl FitId {
    /// Canonical model label used in resolved constraint expressions.
    pub fn label(self) -> String {
        format!("M{}", self.0)
    }
}

impl fmt::Display for FitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Plot group a theory/residual curve is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId(pub u64);

/// Monotonic id source.
///
/// Starts at 1 so that `0` never appears as a minted handle.
#[derive(Debug, Clone)]
pub struct IdSequence {
    next: u64,
}

impl Default for IdSequence {
    fn default() -> Self {
        Self::new()
    }
}

impl IdSequence {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Start minting after `offset`, useful to keep minted group ids clear of
    /// caller-provided ones.
    pub fn starting_after(offset: u64) -> Self {
        Self {
            next: offset.saturating_add(1),
        }
    }

    pub fn next_raw(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }

    pub fn next_job(&mut self) -> JobId {
        JobId(self.next_raw())
    }

    pub fn next_group(&mut self) -> GroupId {
        GroupId(self.next_raw())
    }
}

#[cfg(test)]
mod ids_tests {
    use super::*;

    #[test]
    fn test_reserved_pages() {
        assert!(PageId::SIMULTANEOUS.is_reserved());
        assert!(PageId::COMBINED_BATCH.is_reserved());
        assert!(!PageId(3).is_reserved());
        assert_ne!(PageId::SIMULTANEOUS, PageId::COMBINED_BATCH);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", PageId(4)), "page 4");
        assert_eq!(format!("{}", PageId::SIMULTANEOUS), "simultaneous fit page");
        assert_eq!(FitId(2).label(), "M2");
        assert_eq!(format!("{}", JobId(7)), "job-7");
    }

    #[test]
    fn test_sequence_is_monotonic() {
        let mut seq = IdSequence::new();
        assert_eq!(seq.next_job(), JobId(1));
        assert_eq!(seq.next_job(), JobId(2));

        let mut groups = IdSequence::starting_after(1000);
        assert_eq!(groups.next_group(), GroupId(1001));
    }
}
