//! # FitOrchestrator: the engine façade used by the UI layer
//!
//! [`FitOrchestrator`] owns the session's [`ProblemRegistry`], the background executor
//! and the callback set. It is driven from a single interactive thread:
//!
//! * setters mutate the registry directly,
//! * [`request_fit`](FitOrchestrator::request_fit) builds a job from an immutable
//!   snapshot and submits it without blocking,
//! * [`process_events`](FitOrchestrator::process_events) (non-blocking) or
//!   [`wait_for_job`](FitOrchestrator::wait_for_job) / [`wait_idle`](FitOrchestrator::wait_idle)
//!   (blocking, with timeout) deliver worker events and run the callbacks on the
//!   calling thread.
//!
//! Job admission
//! -----------------
//! * One active job per requesting page; a second request is a [`FitError::Conflict`].
//! * A page belongs to at most one active job: a request whose pages (requesting page
//!   included) overlap those of an active job is a [`FitError::Conflict`].
//! * Simultaneous and combined batch fits are mutually exclusive.
//! * At most `max_concurrent_jobs` jobs are active at once. Workers of cancelled jobs
//!   do not count, even while their engine is still running.
//!
//! Completion
//! -----------------
//! `on_job_finished` fires exactly once per job, after the result callbacks, with the
//! requesting page and every participating page, whatever the outcome. Results of a
//! page deleted (or deleted and created again) while the job ran are dropped. The
//! last `job_history` terminal states stay queryable through
//! [`job_state`](FitOrchestrator::job_state); older ones are forgotten.
//!
//! Cancellation
//! -----------------
//! [`cancel_fit`](FitOrchestrator::cancel_fit) signals the worker and detaches the job
//! from its page at once: the page may request a new fit immediately, the
//! `on_cancelled` callback fires exactly once, and anything the worker still reports
//! for that job is discarded. Deleting a page with an active job behaves the same.
//!
//! The orchestrator must not be used from inside an async context: the blocking waits
//! drive the runtime with `Handle::block_on`.
//!
//! Example
//! -----------------
//! ```rust,no_run
//! use std::time::Duration;
//! use sasfit::{FitOrchestrator, FitSettings, PageId};
//! # use sasfit::engine::FitEngine;
//! # fn engine() -> Box<dyn FitEngine> { unimplemented!() }
//!
//! # fn main() -> Result<(), sasfit::FitError> {
//! let mut fit = FitOrchestrator::new(engine, FitSettings::default())?;
//! fit.create_fit_problem(PageId(1));
//! // ... fit.set_problem(PageId(1), data, model, config)?;
//! fit.on_single_complete(|report| println!("{:?} fitness={}", report.page_id, report.fitness));
//! let job = fit.request_fit(PageId(1))?;
//! fit.wait_for_job(job, Duration::from_secs(30))?;
//! # Ok(())
//! # }
//! ```
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::RandomState;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::aggregator::batch_table::BatchTable;
use crate::aggregator::{AggregatedResults, SingleFitReport};
use crate::constants::{DataId, IdSequence, JobId, PageId, MINTED_GROUP_OFFSET};
use crate::data::FitData;
use crate::engine::EngineFactory;
use crate::fit_errors::FitError;
use crate::fit_problem::{Constraint, FitRange, ProblemConfig, Smearing, Weighting};
use crate::fit_thread::{FitEvent, FitThread, JobOutcome, JobState};
use crate::job_builder::{FitMode, JobBuilder};
use crate::model::FitModel;
use crate::registry::ProblemRegistry;
use crate::settings::FitSettings;

type ProgressFn = Box<dyn FnMut(JobId, f64)>;
type SingleFn = Box<dyn FnMut(&SingleFitReport)>;
type BatchFn = Box<dyn FnMut(PageId, &BatchTable)>;
type MessageFn = Box<dyn FnMut(PageId, &str)>;
type CancelledFn = Box<dyn FnMut(PageId, JobId)>;
type FinishedFn = Box<dyn FnMut(JobId, PageId, &[PageId], JobState)>;

#[derive(Default)]
struct FitCallbacks {
    progress: Option<ProgressFn>,
    single_complete: Option<SingleFn>,
    batch_complete: Option<BatchFn>,
    error: Option<MessageFn>,
    warning: Option<MessageFn>,
    cancelled: Option<CancelledFn>,
    job_finished: Option<FinishedFn>,
}

impl FitCallbacks {
    fn progress(&mut self, job_id: JobId, fitness: f64) {
        if let Some(f) = self.progress.as_mut() {
            f(job_id, fitness);
        }
    }

    fn single_complete(&mut self, report: &SingleFitReport) {
        if let Some(f) = self.single_complete.as_mut() {
            f(report);
        }
    }

    fn batch_complete(&mut self, page_id: PageId, table: &BatchTable) {
        if let Some(f) = self.batch_complete.as_mut() {
            f(page_id, table);
        }
    }

    fn error(&mut self, page_id: PageId, message: &str) {
        if let Some(f) = self.error.as_mut() {
            f(page_id, message);
        }
    }

    fn warning(&mut self, page_id: PageId, message: &str) {
        if let Some(f) = self.warning.as_mut() {
            f(page_id, message);
        }
    }

    fn cancelled(&mut self, page_id: PageId, job_id: JobId) {
        if let Some(f) = self.cancelled.as_mut() {
            f(page_id, job_id);
        }
    }

    fn job_finished(&mut self, job_id: JobId, page_id: PageId, pages: &[PageId], state: JobState) {
        if let Some(f) = self.job_finished.as_mut() {
            f(job_id, page_id, pages, state);
        }
    }
}

pub struct FitOrchestrator {
    registry: ProblemRegistry,
    settings: FitSettings,
    factory: Arc<dyn EngineFactory>,
    runtime: Option<Runtime>,
    handle: Handle,
    events_tx: UnboundedSender<FitEvent>,
    events_rx: UnboundedReceiver<FitEvent>,
    active: HashMap<PageId, FitThread, RandomState>,
    states: HashMap<JobId, JobState, RandomState>,
    /// Terminal jobs, oldest first.
    history: VecDeque<JobId>,
    job_ids: IdSequence,
    group_ids: IdSequence,
    callbacks: FitCallbacks,
}

impl FitOrchestrator {
    /// Create an orchestrator and start its background executor.
    ///
    /// Arguments
    /// -----------------
    /// * `factory`: creates one fresh [`FitEngine`](crate::engine::FitEngine) per fitter
    ///   instance; any `Fn() -> Box<dyn FitEngine> + Send + Sync` works.
    /// * `settings`: session-level settings.
    ///
    /// Return
    /// ----------
    /// * `Err(FitError::InvalidSetting)` if the settings are out of range.
    /// * `Err(FitError::Runtime)` if the executor cannot be started.
    pub fn new(
        factory: impl EngineFactory + 'static,
        settings: FitSettings,
    ) -> Result<Self, FitError> {
        settings.validate()?;
        let runtime = Builder::new_multi_thread()
            .worker_threads(settings.worker_threads)
            .thread_name("sasfit-worker")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        log::debug!("fit orchestrator started ({settings})");

        Ok(FitOrchestrator {
            registry: ProblemRegistry::new(),
            settings,
            factory: Arc::new(factory),
            runtime: Some(runtime),
            handle,
            events_tx,
            events_rx,
            active: HashMap::default(),
            states: HashMap::default(),
            history: VecDeque::new(),
            job_ids: IdSequence::new(),
            group_ids: IdSequence::starting_after(MINTED_GROUP_OFFSET),
            callbacks: FitCallbacks::default(),
        })
    }

    pub fn settings(&self) -> &FitSettings {
        &self.settings
    }

    /// Session-level chain fitting flag, read when the next job is built.
    pub fn set_chain_fit(&mut self, on: bool) {
        self.settings.chain_fit = on;
    }

    pub fn registry(&self) -> &ProblemRegistry {
        &self.registry
    }

    // ---------------------------------------------------------------------------------
    // Registry front-end
    // ---------------------------------------------------------------------------------

    pub fn create_fit_problem(&mut self, page_id: PageId) {
        self.registry.create(page_id);
    }

    /// Remove a page. An active job requested from it is cancelled and its late
    /// results are discarded.
    pub fn delete_fit_problem(&mut self, page_id: PageId) {
        self.withdraw(page_id);
        self.registry.delete(page_id);
    }

    pub fn set_problem(
        &mut self,
        page_id: PageId,
        data: Arc<FitData>,
        model: Box<dyn FitModel>,
        config: ProblemConfig,
    ) -> Result<(), FitError> {
        self.registry.set_problem(page_id, data, model, config)
    }

    pub fn remove_problem(&mut self, page_id: PageId, data_id: DataId) -> Result<(), FitError> {
        self.registry.remove_problem(page_id, data_id)
    }

    pub fn schedule(&mut self, page_id: PageId, flag: bool) -> Result<(), FitError> {
        self.registry.schedule(page_id, flag)
    }

    pub fn schedule_all(&mut self, flag: bool) {
        self.registry.schedule_all(flag);
    }

    pub fn set_params_to_fit(
        &mut self,
        page_id: PageId,
        data_id: DataId,
        params: Vec<String>,
    ) -> Result<(), FitError> {
        self.registry.set_params_to_fit(page_id, data_id, params)
    }

    pub fn set_range(&mut self, page_id: PageId, range: FitRange) -> Result<(), FitError> {
        self.registry.set_range(page_id, range)
    }

    pub fn set_weighting(&mut self, page_id: PageId, weighting: Weighting) -> Result<(), FitError> {
        self.registry.set_weighting(page_id, weighting)
    }

    pub fn set_smearing(
        &mut self,
        page_id: PageId,
        data_id: DataId,
        smearing: Smearing,
    ) -> Result<(), FitError> {
        self.registry.set_smearing(page_id, data_id, smearing)
    }

    pub fn set_constraints(
        &mut self,
        page_id: PageId,
        data_id: DataId,
        constraints: Vec<Constraint>,
    ) -> Result<(), FitError> {
        self.registry.set_constraints(page_id, data_id, constraints)
    }

    pub fn set_model_param(
        &mut self,
        page_id: PageId,
        data_id: DataId,
        name: &str,
        value: f64,
    ) -> Result<(), FitError> {
        self.registry.set_model_param(page_id, data_id, name, value)
    }

    // ---------------------------------------------------------------------------------
    // Callback registration
    // ---------------------------------------------------------------------------------

    pub fn on_progress(&mut self, f: impl FnMut(JobId, f64) + 'static) {
        self.callbacks.progress = Some(Box::new(f));
    }

    pub fn on_single_complete(&mut self, f: impl FnMut(&SingleFitReport) + 'static) {
        self.callbacks.single_complete = Some(Box::new(f));
    }

    pub fn on_batch_complete(&mut self, f: impl FnMut(PageId, &BatchTable) + 'static) {
        self.callbacks.batch_complete = Some(Box::new(f));
    }

    pub fn on_error(&mut self, f: impl FnMut(PageId, &str) + 'static) {
        self.callbacks.error = Some(Box::new(f));
    }

    pub fn on_warning(&mut self, f: impl FnMut(PageId, &str) + 'static) {
        self.callbacks.warning = Some(Box::new(f));
    }

    pub fn on_cancelled(&mut self, f: impl FnMut(PageId, JobId) + 'static) {
        self.callbacks.cancelled = Some(Box::new(f));
    }

    /// Called once per job when it reaches a terminal state, with the job, its
    /// requesting page, the participating pages and the terminal state.
    pub fn on_job_finished(
        &mut self,
        f: impl FnMut(JobId, PageId, &[PageId], JobState) + 'static,
    ) {
        self.callbacks.job_finished = Some(Box::new(f));
    }

    // ---------------------------------------------------------------------------------
    // Jobs
    // ---------------------------------------------------------------------------------

    /// Build a job for `page_id` and submit it in the background.
    ///
    /// Return
    /// ----------
    /// * `Ok(job_id)` once the job is queued; the call never waits for the fit.
    /// * `Err(FitError::Conflict)` if the page already has an active job, if one of the
    ///   pages the job would include belongs to an active job, if a simultaneous and a
    ///   combined batch fit would overlap, or if the concurrent job cap is reached. The
    ///   running job is left untouched.
    /// * Any error of [`JobBuilder::build`]; nothing is submitted in that case.
    pub fn request_fit(&mut self, page_id: PageId) -> Result<JobId, FitError> {
        if self.active.contains_key(&page_id) {
            log::warn!("{page_id}: a fit is already running");
            return Err(FitError::Conflict(page_id));
        }
        let mode = FitMode::for_page(page_id);
        let aggregate_clash = mode != FitMode::Single
            && self.active.values().any(|t| t.mode() != FitMode::Single);
        if aggregate_clash || self.active.len() >= self.settings.max_concurrent_jobs {
            log::warn!("{page_id}: fit request rejected, conflicting job active");
            return Err(FitError::Conflict(page_id));
        }

        let builder = JobBuilder::new(&self.registry, self.factory.as_ref())
            .chain_fit(self.settings.chain_fit);
        let pages = builder.participants(page_id)?;
        if let Some(busy) = self.active.values().find(|t| t.overlaps(page_id, &pages)) {
            log::warn!(
                "{page_id}: fit request rejected, pages in use by {}",
                busy.job_id()
            );
            return Err(FitError::Conflict(page_id));
        }

        let job_id = self.job_ids.next_job();
        let job = builder
            .build(job_id, page_id, &mut self.group_ids)
            .inspect_err(|e| log::warn!("{job_id}: not submitted: {e}"))?;

        let thread = FitThread::submit(
            &self.handle,
            job,
            self.events_tx.clone(),
            self.settings.progress_interval,
        );
        self.states.insert(job_id, JobState::Queued);
        self.active.insert(page_id, thread);
        Ok(job_id)
    }

    /// Cancel the active job of `page_id`, if any. Never fails.
    pub fn cancel_fit(&mut self, page_id: PageId) {
        if !self.withdraw(page_id) {
            log::debug!("{page_id}: no active fit to cancel");
        }
    }

    fn withdraw(&mut self, page_id: PageId) -> bool {
        let Some(thread) = self.active.remove(&page_id) else {
            return false;
        };
        let job_id = thread.job_id();
        thread.cancel();
        self.retire(job_id, JobState::Cancelled);
        log::info!("{job_id}: cancelled from {page_id}");
        // Delivered through the queue so callbacks keep their per-page order.
        let _ = self.events_tx.send(FitEvent::Withdrawn {
            job_id,
            page_id,
            pages: thread.pages().to_vec(),
        });
        true
    }

    /// Record a terminal state, forgetting the oldest ones beyond `job_history`.
    fn retire(&mut self, job_id: JobId, state: JobState) {
        self.states.insert(job_id, state);
        self.history.push_back(job_id);
        while self.history.len() > self.settings.job_history {
            if let Some(oldest) = self.history.pop_front() {
                self.states.remove(&oldest);
            }
        }
    }

    /// State of a job; `None` for an id never issued or already forgotten.
    pub fn job_state(&self, job_id: JobId) -> Option<JobState> {
        self.states.get(&job_id).copied()
    }

    pub fn is_fitting(&self, page_id: PageId) -> bool {
        self.active.contains_key(&page_id)
    }

    pub fn active_jobs(&self) -> usize {
        self.active.len()
    }

    // ---------------------------------------------------------------------------------
    // Event loop
    // ---------------------------------------------------------------------------------

    /// Deliver every pending worker event. Returns the number of events handled.
    pub fn process_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.dispatch(event);
            handled += 1;
        }
        handled
    }

    /// Block until `job_id` reaches a terminal state or `timeout` elapses, delivering
    /// events meanwhile.
    ///
    /// Return
    /// ----------
    /// * `Ok(state)` – the terminal state, or the current one on timeout.
    /// * `Err(FitError::Configuration)` – the job id was never issued or is no longer
    ///   remembered.
    pub fn wait_for_job(&mut self, job_id: JobId, timeout: Duration) -> Result<JobState, FitError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.process_events();
            let state = self
                .job_state(job_id)
                .ok_or_else(|| FitError::Configuration(format!("unknown {job_id}")))?;
            if state.is_terminal() || !self.next_event(deadline) {
                return Ok(state);
            }
        }
    }

    /// Block until no job is active and every event is delivered, or `timeout` elapses.
    ///
    /// Returns `true` when idle.
    pub fn wait_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.process_events();
            if self.active.is_empty() {
                return true;
            }
            if !self.next_event(deadline) {
                return false;
            }
        }
    }

    /// Wait for one event until `deadline` and dispatch it. `false` on timeout.
    fn next_event(&mut self, deadline: Instant) -> bool {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return false;
        }
        let rx = &mut self.events_rx;
        let received = self
            .handle
            .block_on(async { tokio::time::timeout(remaining, rx.recv()).await });
        match received {
            Ok(Some(event)) => {
                self.dispatch(event);
                true
            }
            _ => false,
        }
    }

    fn is_current(&self, page_id: PageId, job_id: JobId) -> bool {
        self.active
            .get(&page_id)
            .is_some_and(|t| t.job_id() == job_id)
    }

    fn dispatch(&mut self, event: FitEvent) {
        match event {
            FitEvent::Started { job_id, page_id } => {
                if self.is_current(page_id, job_id) {
                    self.states.insert(job_id, JobState::Running);
                }
            }
            FitEvent::Progress {
                job_id,
                page_id,
                fitness,
            } => {
                if self.is_current(page_id, job_id) {
                    self.callbacks.progress(job_id, fitness);
                }
            }
            FitEvent::Withdrawn {
                job_id,
                page_id,
                pages,
            } => {
                self.callbacks.cancelled(page_id, job_id);
                self.callbacks
                    .job_finished(job_id, page_id, &pages, JobState::Cancelled);
            }
            FitEvent::Finished {
                job_id,
                page_id,
                outcome,
            } => {
                if !self.is_current(page_id, job_id) {
                    log::debug!("{job_id}: late outcome for {page_id} discarded");
                    return;
                }
                let Some(thread) = self.active.remove(&page_id) else {
                    return;
                };
                let state = match &outcome {
                    JobOutcome::Completed(_) => JobState::Completed,
                    JobOutcome::Cancelled => JobState::Cancelled,
                    JobOutcome::Failed(_) => JobState::Failed,
                };
                self.retire(job_id, state);
                match outcome {
                    JobOutcome::Completed(results) => self.apply(page_id, &thread, results),
                    JobOutcome::Cancelled => self.callbacks.cancelled(page_id, job_id),
                    JobOutcome::Failed(message) => self.callbacks.error(page_id, &message),
                }
                self.callbacks
                    .job_finished(job_id, page_id, thread.pages(), state);
            }
        }
    }

    /// Write a completed job back into the registry and notify the pages.
    ///
    /// Pages no longer holding the generation the job was built from get nothing.
    fn apply(&mut self, requested_by: PageId, thread: &FitThread, results: AggregatedResults) {
        for update in results.updates {
            if !same_page(&self.registry, thread, update.page_id) {
                log::debug!("{}: page replaced during the fit, result skipped", update.page_id);
                continue;
            }
            let Ok(problem) = self.registry.problem_mut(update.page_id, update.data_id) else {
                log::debug!(
                    "dataset {} of {} is gone, result skipped",
                    update.data_id,
                    update.page_id
                );
                continue;
            };
            for (name, value) in &update.params {
                problem.model.set_param(name, *value);
            }
            problem.theory = Some(update.theory);
            problem.residuals = Some(update.residuals);
            problem.chi2 = Some(update.chi2);
            problem.result = Some(update.result);
            problem.result_count += 1;
        }

        for warning in &results.warnings {
            if same_page(&self.registry, thread, warning.page_id) {
                self.callbacks
                    .warning(warning.page_id, &warning.to_string());
            }
        }
        for report in &results.reports {
            if same_page(&self.registry, thread, report.page_id) {
                self.callbacks.single_complete(report);
            }
        }
        if let Some(table) = results.table {
            self.callbacks.batch_complete(requested_by, &table);
            if self.registry.contains(requested_by) {
                let _ = self.registry.set_batch_result(requested_by, table);
            }
        }
    }
}

/// Whether `page_id` is still the page `thread` was built from.
fn same_page(registry: &ProblemRegistry, thread: &FitThread, page_id: PageId) -> bool {
    registry
        .generation(page_id)
        .is_some_and(|g| thread.generation(page_id) == Some(g))
}

impl Drop for FitOrchestrator {
    fn drop(&mut self) {
        for thread in self.active.values() {
            thread.cancel();
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
