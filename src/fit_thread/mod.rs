//! # BackgroundJob: cancellable fit execution off the interactive thread
//!
//! A [`FitThread`] owns one submitted [`FitJob`]. Submission returns immediately: the
//! job body runs on the tokio blocking pool and communicates with the interactive loop
//! only through [`FitEvent`]s sent on an unbounded channel. The interactive loop is the
//! single place where events are turned into callbacks.
//!
//! Lifecycle
//! -----------------
//! ```text
//! Queued ──Started──▶ Running ──Finished──▶ Completed | Cancelled | Failed
//! ```
//!
//! * `Progress` events may arrive any number of times while running.
//! * Exactly one `Finished` event is sent per job, carrying a [`JobOutcome`].
//! * [`FitThread::cancel`] flips a `watch` token; the worker observes it between fitter
//!   runs and the engine may poll it between iterations. It never blocks the caller.
//!
//! See also
//! ------------
//! * [`crate::engine::FitMonitor`] – Worker-side view of the token and event channel.
//! * [`crate::orchestrator::FitOrchestrator`] – Dispatches the events.
pub(crate) mod timing;
mod worker;

use std::fmt;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{mpsc::UnboundedSender, watch};

use crate::aggregator::AggregatedResults;
use crate::constants::{JobId, PageId};
use crate::job_builder::{FitJob, FitMode};

use worker::{run_job, WorkerContext};

/// Message from a worker (or from a cancel request) to the interactive loop.
#[derive(Debug)]
pub enum FitEvent {
    Started {
        job_id: JobId,
        page_id: PageId,
    },
    Progress {
        job_id: JobId,
        page_id: PageId,
        fitness: f64,
    },
    Finished {
        job_id: JobId,
        page_id: PageId,
        outcome: JobOutcome,
    },
    /// The job was cancelled from the interactive loop and detached from its page.
    Withdrawn {
        job_id: JobId,
        page_id: PageId,
        pages: Vec<PageId>,
    },
}

#[derive(Debug)]
pub enum JobOutcome {
    Completed(AggregatedResults),
    Cancelled,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Cancelled | JobState::Failed
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Cancelled => "cancelled",
            JobState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Interactive-side handle of a submitted job.
pub(crate) struct FitThread {
    job_id: JobId,
    requested_by: PageId,
    mode: FitMode,
    pages: Vec<PageId>,
    generations: Vec<u64>,
    cancel: watch::Sender<bool>,
}

impl FitThread {
    /// Spawn `job` on the blocking pool of `handle` and return at once.
    pub(crate) fn submit(
        handle: &Handle,
        job: FitJob,
        events: UnboundedSender<FitEvent>,
        progress_interval: Duration,
    ) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let job_id = job.id;
        let requested_by = job.requested_by;
        let mode = job.mode;
        let pages = job.pages.clone();
        let generations = job.generations.clone();
        let ctx = WorkerContext {
            cancel: cancel_rx,
            events,
            progress_interval,
        };
        handle.spawn_blocking(move || run_job(job, ctx));
        log::debug!("{job_id}: submitted");
        FitThread {
            job_id,
            requested_by,
            mode,
            pages,
            generations,
            cancel: cancel_tx,
        }
    }

    pub(crate) fn job_id(&self) -> JobId {
        self.job_id
    }

    pub(crate) fn mode(&self) -> FitMode {
        self.mode
    }

    /// Pages taking part in the job, in registry order.
    pub(crate) fn pages(&self) -> &[PageId] {
        &self.pages
    }

    /// Registry generation `page_id` had when the job was built.
    pub(crate) fn generation(&self, page_id: PageId) -> Option<u64> {
        let pos = self.pages.iter().position(|&p| p == page_id)?;
        self.generations.get(pos).copied()
    }

    /// Whether a job requested from `requested_by` over `pages` would touch a page this
    /// job owns, the requesting page included.
    pub(crate) fn overlaps(&self, requested_by: PageId, pages: &[PageId]) -> bool {
        let owns = |page: &PageId| *page == self.requested_by || self.pages.contains(page);
        owns(&requested_by) || pages.iter().any(owns)
    }

    /// Request cooperative termination. Idempotent.
    pub(crate) fn cancel(&self) {
        self.cancel.send_replace(true);
    }
}
