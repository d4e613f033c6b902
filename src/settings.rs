//! # Session-level fit settings
//!
//! [`FitSettings`] gathers the knobs that are independent of any single fit page:
//!
//! * `chain_fit` – in combined batch fits, seed each dataset with the best-fit values of
//!   the previous converged one instead of its own initial guess,
//! * `worker_threads` – size of the background executor,
//! * `max_concurrent_jobs` – cap on simultaneously active jobs across all pages,
//! * `progress_interval` – minimum wall-clock delay between two progress events of the
//!   same job (the first report always goes through; zero disables throttling),
//! * `job_history` – number of finished jobs whose terminal state stays queryable.
//!
//! Defaults
//! -----------------
//! * `chain_fit`: false
//! * `worker_threads`: 2
//! * `max_concurrent_jobs`: 8
//! * `progress_interval`: 100 ms
//! * `job_history`: 256
//!
//! ```rust
//! use sasfit::settings::FitSettings;
//!
//! let settings = FitSettings::builder()
//!     .chain_fit(true)
//!     .worker_threads(4)
//!     .build()
//!     .unwrap();
//! assert!(settings.chain_fit);
//! ```
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::fit_errors::FitError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitSettings {
    pub chain_fit: bool,
    pub worker_threads: usize,
    pub max_concurrent_jobs: usize,
    pub progress_interval: Duration,
    pub job_history: usize,
}

impl FitSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> FitSettingsBuilder {
        FitSettingsBuilder::new()
    }
}

impl Default for FitSettings {
    fn default() -> Self {
        FitSettings {
            chain_fit: false,
            worker_threads: 2,
            max_concurrent_jobs: 8,
            progress_interval: Duration::from_millis(100),
            job_history: 256,
        }
    }
}

/// Builder for [`FitSettings`], with validation.
#[derive(Debug, Clone)]
pub struct FitSettingsBuilder {
    settings: FitSettings,
}

impl Default for FitSettingsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FitSettingsBuilder {
    pub fn new() -> Self {
        Self {
            settings: FitSettings::default(),
        }
    }

    pub fn chain_fit(mut self, v: bool) -> Self {
        self.settings.chain_fit = v;
        self
    }

    pub fn worker_threads(mut self, v: usize) -> Self {
        self.settings.worker_threads = v;
        self
    }

    pub fn max_concurrent_jobs(mut self, v: usize) -> Self {
        self.settings.max_concurrent_jobs = v;
        self
    }

    pub fn progress_interval(mut self, v: Duration) -> Self {
        self.settings.progress_interval = v;
        self
    }

    pub fn job_history(mut self, v: usize) -> Self {
        self.settings.job_history = v;
        self
    }

    /// Validate and return the settings.
    ///
    /// Return
    /// ----------
    /// * `Err(FitError::InvalidSetting)` if `worker_threads`, `max_concurrent_jobs` or
    ///   `job_history` is 0.
    pub fn build(self) -> Result<FitSettings, FitError> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}

impl FitSettings {
    /// Check the invariants the builder enforces, for settings built by hand.
    pub fn validate(&self) -> Result<(), FitError> {
        if self.worker_threads == 0 {
            return Err(FitError::InvalidSetting(
                "worker_threads must be >= 1".into(),
            ));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(FitError::InvalidSetting(
                "max_concurrent_jobs must be >= 1".into(),
            ));
        }
        if self.job_history == 0 {
            return Err(FitError::InvalidSetting("job_history must be >= 1".into()));
        }
        Ok(())
    }
}

impl fmt::Display for FitSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            writeln!(f, "Fit settings")?;
            writeln!(f, "------------")?;
            writeln!(f, "  chain_fit           = {}", self.chain_fit)?;
            writeln!(f, "  worker_threads      = {}", self.worker_threads)?;
            writeln!(f, "  max_concurrent_jobs = {}", self.max_concurrent_jobs)?;
            writeln!(
                f,
                "  progress_interval   = {} ms",
                self.progress_interval.as_millis()
            )?;
            write!(f, "  job_history         = {}", self.job_history)
        } else {
            write!(
                f,
                "chain_fit={}, worker_threads={}, max_concurrent_jobs={}, progress_interval={}ms, job_history={}",
                self.chain_fit,
                self.worker_threads,
                self.max_concurrent_jobs,
                self.progress_interval.as_millis(),
                self.job_history
            )
        }
    }
}
