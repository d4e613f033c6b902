//! # Error taxonomy of the fit-orchestration engine
//!
//! Every fallible operation of the crate returns [`FitError`]. Variants are grouped by
//! the category they belong to:
//!
//! * **Configuration** – caller misuse such as an unknown page or dataset id
//!   ([`FitError::UnknownPage`], [`FitError::UnknownData`], [`FitError::Configuration`]).
//!   These are integration bugs and are never shown to the user.
//! * **Validation** – recoverable, user-visible problems detected while building a job
//!   ([`FitError::Validation`]). The offending page is always named.
//! * **Conflict** – a fit was requested while one is already active ([`FitError::Conflict`]).
//! * **Engine failure** – the optimizer could not be bound or raised during a run
//!   ([`FitError::EngineFailure`]).
//!
//! Non-converged results are not errors: they travel as [`ConvergenceWarning`] values
//! inside the aggregated results of a job.
use std::fmt;

use thiserror::Error;

use crate::constants::{DataId, PageId};
use crate::engine::EngineError;

/// Why a fit request was rejected before any background work started.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationReason {
    #[error("no dataset is scheduled for fit")]
    NothingScheduled,

    #[error("no parameter selected to fit on dataset {0}")]
    NoParameters(DataId),

    #[error("invalid fit range [{qmin}, {qmax}]")]
    InvalidRange { qmin: f64, qmax: f64 },

    #[error("fit range [{qmin}, {qmax}] contains no data point of dataset {data}")]
    EmptyRange { data: DataId, qmin: f64, qmax: f64 },

    #[error("parameter '{0}' is not fittable for this model")]
    UnknownParameter(String),

    #[error("parameter '{name}' has a non-numeric value ({value})")]
    NonNumericParameter { name: String, value: f64 },

    #[error("unresolved constraint reference '{0}'")]
    UnresolvedConstraint(String),
}

#[derive(Error, Debug)]
pub enum FitError {
    #[error("Unknown page id: {0}")]
    UnknownPage(PageId),

    #[error("Unknown dataset {data} on {page}")]
    UnknownData { page: PageId, data: DataId },

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Invalid fit setting: {0}")]
    InvalidSetting(String),

    #[error("Fit rejected on {page}: {reason}")]
    Validation {
        page: PageId,
        reason: ValidationReason,
    },

    #[error("A fit is already running for {0}")]
    Conflict(PageId),

    #[error("Fit engine failure: {0}")]
    EngineFailure(#[from] EngineError),

    #[error("Unable to start the fit executor: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("Batch table export failed: {0}")]
    Export(#[from] csv::Error),
}

impl FitError {
    pub(crate) fn validation(page: PageId, reason: ValidationReason) -> Self {
        FitError::Validation { page, reason }
    }

    /// `true` for the caller-misuse category (unknown ids, malformed inputs).
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            FitError::UnknownPage(_) | FitError::UnknownData { .. } | FitError::Configuration(_)
        )
    }
}

impl PartialEq for FitError {
    fn eq(&self, other: &Self) -> bool {
        use FitError::*;
        match (self, other) {
            (UnknownPage(a), UnknownPage(b)) => a == b,
            (
                UnknownData {
                    page: pa,
                    data: da,
                },
                UnknownData {
                    page: pb,
                    data: db,
                },
            ) => pa == pb && da == db,
            (Configuration(a), Configuration(b)) => a == b,
            (InvalidSetting(a), InvalidSetting(b)) => a == b,
            (
                Validation {
                    page: pa,
                    reason: ra,
                },
                Validation {
                    page: pb,
                    reason: rb,
                },
            ) => pa == pb && ra == rb,
            (Conflict(a), Conflict(b)) => a == b,
            (EngineFailure(a), EngineFailure(b)) => a == b,

            // Not comparable: same variant is enough
            (Runtime(_), Runtime(_)) => true,
            (Export(_), Export(_)) => true,

            _ => false,
        }
    }
}

/// A result the optimizer returned but that cannot be trusted.
///
/// The fitness was missing or non-finite, or the parameter vector had missing or
/// non-finite entries. The affected problem keeps its previous theory and residuals;
/// in batch mode its row is still emitted with NaN cells.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceWarning {
    pub page_id: PageId,
    pub data_id: DataId,
    pub data_name: String,
    pub model_name: String,
}

impl fmt::Display for ConvergenceWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Data {} and Model {} did not fit.",
            self.data_name, self.model_name
        )
    }
}
