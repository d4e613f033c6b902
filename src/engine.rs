//! # Pluggable optimizer contract
//!
//! The orchestration engine never implements an optimizer. It drives any type
//! implementing [`FitEngine`] through a narrow contract:
//!
//! 1. [`set_model`](FitEngine::set_model) – bind a model and the names of the
//!    parameters to vary under an integer [`FitId`] (plus constraint terms in
//!    simultaneous fits),
//! 2. [`set_data`](FitEngine::set_data) – bind the dataset, its fit mask, effective
//!    errors and optional smearer under the same id,
//! 3. [`select_problem_for_fit`](FitEngine::select_problem_for_fit) – arm the id,
//! 4. [`run`](FitEngine::run) – optimize every armed problem and return one
//!    [`FitResult`] per problem.
//!
//! Engines are created on demand through an [`EngineFactory`]: one instance for a
//! single or simultaneous fit, one per dataset for batch fits.
//!
//! During [`run`](FitEngine::run) an engine receives a [`FitMonitor`]. It should call
//! [`FitMonitor::report`] with intermediate fitness values and poll
//! [`FitMonitor::is_cancelled`] between iterations, returning early when it is set.
use std::cell::Cell;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc::UnboundedSender, watch};

use crate::constants::{FitId, JobId, PageId};
use crate::data::FitData;
use crate::fit_problem::{Constraint, Smearer};
use crate::fit_thread::FitEvent;
use crate::model::FitModel;

/// Raw optimizer output for one bound problem.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FitResult {
    pub fit_id: FitId,
    /// Best-fit values, aligned with `param_list`.
    pub pvec: Vec<f64>,
    /// Standard errors, aligned with `param_list`.
    pub stderr: Vec<f64>,
    /// Final fitness (reduced chi-squared as reported by the optimizer).
    pub fitness: Option<f64>,
    pub param_list: Vec<String>,
    /// Points actually evaluated; empty means "the bound fit mask".
    pub index: Vec<bool>,
    /// Theory over the whole dataset; empty when the optimizer does not provide it.
    pub theory: Vec<f64>,
}

impl FitResult {
    /// A result is valid iff the fitness is finite and every parameter received a
    /// finite value.
    pub fn is_valid(&self) -> bool {
        self.fitness.is_some_and(f64::is_finite)
            && self.pvec.len() == self.param_list.len()
            && self.pvec.iter().all(|v| v.is_finite())
    }

    /// Standard error of `param_list[i]`, NaN when the optimizer gave none.
    pub fn stderr_at(&self, i: usize) -> f64 {
        self.stderr.get(i).copied().unwrap_or(f64::NAN)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("no problem bound under fit id {0}")]
    UnknownFitId(FitId),

    #[error("no problem selected for fit")]
    NothingSelected,

    #[error("invalid binding: {0}")]
    InvalidBinding(String),

    #[error("optimizer failed: {0}")]
    Failed(String),
}

/// Data half of an optimizer binding.
#[derive(Debug, Clone)]
pub struct DataBinding {
    pub data: Arc<FitData>,
    /// Points inside the fit range.
    pub mask: Vec<bool>,
    /// Effective errors from the weighting mode (zeros not yet substituted).
    pub errors: DVector<f64>,
    pub smearer: Option<Arc<dyn Smearer>>,
}

pub trait FitEngine: Send {
    fn set_model(
        &mut self,
        fit_id: FitId,
        model: Box<dyn FitModel>,
        params: &[String],
        constraints: &[Constraint],
    ) -> Result<(), EngineError>;

    fn set_data(&mut self, fit_id: FitId, binding: DataBinding) -> Result<(), EngineError>;

    fn select_problem_for_fit(&mut self, fit_id: FitId, selected: bool)
        -> Result<(), EngineError>;

    fn run(&mut self, monitor: &FitMonitor) -> Result<Vec<FitResult>, EngineError>;
}

/// Creates fresh engine instances for each job.
pub trait EngineFactory: Send + Sync {
    fn create(&self) -> Box<dyn FitEngine>;
}

impl<F> EngineFactory for F
where
    F: Fn() -> Box<dyn FitEngine> + Send + Sync,
{
    fn create(&self) -> Box<dyn FitEngine> {
        self()
    }
}

/// Worker-side handle given to an engine while it runs.
///
/// Progress reports are throttled to at most one per `progress_interval` (the first
/// report always goes through) and are delivered to the interactive loop, never
/// executed on the worker.
pub struct FitMonitor {
    job_id: JobId,
    page_id: PageId,
    cancel: watch::Receiver<bool>,
    events: UnboundedSender<FitEvent>,
    progress_interval: Duration,
    last_report: Cell<Option<Instant>>,
}

impl FitMonitor {
    pub(crate) fn new(
        job_id: JobId,
        page_id: PageId,
        cancel: watch::Receiver<bool>,
        events: UnboundedSender<FitEvent>,
        progress_interval: Duration,
    ) -> Self {
        Self {
            job_id,
            page_id,
            cancel,
            events,
            progress_interval,
            last_report: Cell::new(None),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Publish an intermediate fitness value.
    pub fn report(&self, fitness: f64) {
        let now = Instant::now();
        if let Some(last) = self.last_report.get() {
            if now.duration_since(last) < self.progress_interval {
                return;
            }
        }
        self.last_report.set(Some(now));
        // The receiver only disappears when the orchestrator is dropped.
        let _ = self.events.send(FitEvent::Progress {
            job_id: self.job_id,
            page_id: self.page_id,
            fitness,
        });
    }
}

#[cfg(test)]
mod engine_tests {
    use super::*;

    fn result(pvec: Vec<f64>, fitness: Option<f64>) -> FitResult {
        FitResult {
            fit_id: FitId(1),
            param_list: vec!["a".into(), "b".into()],
            stderr: vec![0.1],
            pvec,
            fitness,
            ..FitResult::default()
        }
    }

    #[test]
    fn test_validity_rules() {
        assert!(result(vec![1.0, 2.0], Some(1.2)).is_valid());
        assert!(!result(vec![1.0, 2.0], None).is_valid());
        assert!(!result(vec![1.0, 2.0], Some(f64::INFINITY)).is_valid());
        assert!(!result(vec![1.0], Some(1.2)).is_valid());
        assert!(!result(vec![1.0, f64::NAN], Some(1.2)).is_valid());
    }

    #[test]
    fn test_stderr_lookup() {
        let r = result(vec![1.0, 2.0], Some(1.0));
        assert_eq!(r.stderr_at(0), 0.1);
        assert!(r.stderr_at(1).is_nan());
    }

    #[test]
    fn test_progress_is_throttled() {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let monitor = FitMonitor::new(JobId(1), PageId(1), cancel_rx, tx, Duration::from_secs(60));
        monitor.report(3.0);
        monitor.report(2.0);
        assert!(matches!(
            rx.try_recv(),
            Ok(FitEvent::Progress { fitness, .. }) if fitness == 3.0
        ));
        assert!(rx.try_recv().is_err());
    }
}
