//! Body of a background fit job.
//!
//! Runs on a blocking executor thread. Every fitter unit of the job is run in order;
//! the cancellation token is checked before and after each run, and engine panics are
//! contained so that a misbehaving optimizer only fails its own job.
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use tokio::sync::{mpsc::UnboundedSender, watch};

use crate::aggregator::{self, chain_seed};
use crate::engine::{FitMonitor, FitResult};
use crate::job_builder::{BoundProblem, FitJob};

use super::timing::{format_duration, RunTimer};
use super::{FitEvent, JobOutcome};

pub(crate) struct WorkerContext {
    pub(crate) cancel: watch::Receiver<bool>,
    pub(crate) events: UnboundedSender<FitEvent>,
    pub(crate) progress_interval: Duration,
}

pub(crate) fn run_job(job: FitJob, ctx: WorkerContext) {
    let job_id = job.id;
    let page_id = job.requested_by;
    // A closed channel means the orchestrator is gone: nothing left to report to.
    let _ = ctx.events.send(FitEvent::Started { job_id, page_id });

    let outcome = execute(job, &ctx);
    match &outcome {
        JobOutcome::Completed(results) => log::debug!(
            "{job_id}: completed ({} update(s), {} warning(s))",
            results.updates.len(),
            results.warnings.len()
        ),
        JobOutcome::Cancelled => log::debug!("{job_id}: cancelled"),
        JobOutcome::Failed(msg) => log::error!("{job_id}: failed: {msg}"),
    }
    let _ = ctx.events.send(FitEvent::Finished {
        job_id,
        page_id,
        outcome,
    });
}

fn execute(mut job: FitJob, ctx: &WorkerContext) -> JobOutcome {
    let monitor = FitMonitor::new(
        job.id,
        job.requested_by,
        ctx.cancel.clone(),
        ctx.events.clone(),
        ctx.progress_interval,
    );
    let mut timer = RunTimer::new(0.2);
    let mut results: Vec<FitResult> = Vec::with_capacity(job.problem_count());
    let mut seed: Option<Vec<(String, f64)>> = None;
    let total = job.units.len();

    for (i, unit) in job.units.iter_mut().enumerate() {
        if monitor.is_cancelled() {
            return JobOutcome::Cancelled;
        }

        if let Some(seed) = &seed {
            if let Err(e) = unit.reseed(seed) {
                return JobOutcome::Failed(e.to_string());
            }
        }

        let run = panic::catch_unwind(AssertUnwindSafe(|| unit.engine.run(&monitor)));
        let unit_results = match run {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => return JobOutcome::Failed(e.to_string()),
            Err(_) => return JobOutcome::Failed("fit engine panicked".to_string()),
        };

        let dt = timer.lap();
        log::debug!(
            "{}: fitter {}/{} done in {} (avg {})",
            job.id,
            i + 1,
            total,
            format_duration(dt),
            format_duration(timer.mean())
        );

        if job.chain_fit {
            if let Some(next) = chain_seed(&unit_results) {
                seed = Some(next);
            }
        }
        results.extend(unit_results);

        if monitor.is_cancelled() {
            return JobOutcome::Cancelled;
        }
    }

    log::debug!(
        "{}: {} fitter run(s), mean {}",
        job.id,
        timer.laps(),
        format_duration(timer.mean())
    );
    let bound: Vec<BoundProblem> = job.units.into_iter().flat_map(|u| u.problems).collect();
    JobOutcome::Completed(aggregator::aggregate(job.batch_on, &bound, &results))
}
