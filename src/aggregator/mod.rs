//! # ResultAggregator: from raw optimizer output to page results
//!
//! The aggregator runs on the worker once every fitter of a job has returned. It never
//! touches the registry: it works on the immutable snapshots of the bound problems and
//! returns an [`AggregatedResults`] value that the interactive loop applies.
//!
//! For each bound problem, its [`FitResult`] is looked up by [`FitId`](crate::constants::FitId):
//!
//! * **valid result** – the fitted values are written into a copy of the model, the
//!   theory is taken from the optimizer (or recomputed with the fitted parameters when
//!   it is absent), and residuals / chi-squared are recomputed with
//!   [`chisq::residuals`]. This yields a [`ProblemUpdate`] and, outside batch mode, a
//!   [`SingleFitReport`].
//! * **invalid or missing result** – a [`ConvergenceWarning`] is emitted and no update
//!   is produced, so the cached theory and residuals of the problem stay as they were.
//!
//! In batch mode every bound problem contributes exactly one [`BatchRow`], valid or not,
//! in binding order.
//!
//! See also
//! ------------
//! * [`batch_table::BatchTable`] – Column layout and CSV export.
//! * [`FitResult::is_valid`] – Convergence policy.
pub mod batch_table;

use std::collections::BTreeMap;

use nalgebra::DVector;

use crate::chisq::{self, Residuals};
use crate::constants::{DataId, GroupId, PageId};
use crate::engine::FitResult;
use crate::fit_errors::ConvergenceWarning;
use crate::job_builder::BoundProblem;
use crate::model::FitModel;

use batch_table::{BatchRow, BatchTable};

/// Everything the interactive loop needs to write back into one problem.
#[derive(Debug, Clone)]
pub struct ProblemUpdate {
    pub page_id: PageId,
    pub data_id: DataId,
    pub group_id: GroupId,
    /// Fitted `(name, value)` pairs to set on the model.
    pub params: Vec<(String, f64)>,
    pub theory: DVector<f64>,
    pub residuals: Residuals,
    pub chi2: f64,
    pub result: FitResult,
}

/// Payload of the single/simultaneous completion callback.
#[derive(Debug, Clone, PartialEq)]
pub struct SingleFitReport {
    pub page_id: PageId,
    pub data_id: DataId,
    pub group_id: GroupId,
    pub fitness: f64,
    pub names: Vec<String>,
    pub values: Vec<f64>,
    pub errors: Vec<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct AggregatedResults {
    pub updates: Vec<ProblemUpdate>,
    pub reports: Vec<SingleFitReport>,
    pub table: Option<BatchTable>,
    pub warnings: Vec<ConvergenceWarning>,
}

/// Aggregate the raw results of a job.
///
/// Arguments
/// -----------------
/// * `batch_on`: produce a [`BatchTable`] instead of per-page reports.
/// * `bound`: every problem bound in the job, in binding order.
/// * `results`: raw optimizer results of every fitter, in any order.
pub fn aggregate(
    batch_on: bool,
    bound: &[BoundProblem],
    results: &[FitResult],
) -> AggregatedResults {
    let mut out = AggregatedResults::default();
    let mut rows = Vec::with_capacity(if batch_on { bound.len() } else { 0 });

    for problem in bound {
        let result = results
            .iter()
            .find(|r| r.fit_id == problem.fit_id)
            .filter(|r| r.is_valid());

        match result {
            Some(result) => {
                let update = apply(problem, result);
                if batch_on {
                    rows.push(converged_row(problem, &update));
                } else {
                    out.reports.push(SingleFitReport {
                        page_id: problem.page_id,
                        data_id: problem.data_id,
                        group_id: problem.group_id,
                        fitness: result.fitness.unwrap_or(f64::NAN),
                        names: result.param_list.clone(),
                        values: result.pvec.clone(),
                        errors: (0..result.param_list.len())
                            .map(|i| result.stderr_at(i))
                            .collect(),
                    });
                }
                out.updates.push(update);
            }
            None => {
                let warning = ConvergenceWarning {
                    page_id: problem.page_id,
                    data_id: problem.data_id,
                    data_name: problem.snapshot.data.name.clone(),
                    model_name: problem.snapshot.model.name().to_string(),
                };
                log::warn!("{warning}");
                out.warnings.push(warning);
                if batch_on {
                    rows.push(failed_row(problem));
                }
            }
        }
    }

    if batch_on {
        let fittable: Vec<Vec<String>> = bound
            .iter()
            .map(|p| p.snapshot.model.fittable_params())
            .collect();
        out.table = Some(BatchTable::new(rows, fittable.iter().map(Vec::as_slice)));
    }
    out
}

fn apply(problem: &BoundProblem, result: &FitResult) -> ProblemUpdate {
    let snapshot = &problem.snapshot;
    let data = &snapshot.data;
    let params: Vec<(String, f64)> = result
        .param_list
        .iter()
        .cloned()
        .zip(result.pvec.iter().copied())
        .collect();

    let theory = if result.theory.len() == data.len() {
        DVector::from_column_slice(&result.theory)
    } else {
        let mut fitted = snapshot.clone();
        for (name, value) in &params {
            fitted.model.set_param(name, *value);
        }
        fitted.compute_theory()
    };

    let mask: &[bool] = if result.index.len() == data.len() && result.index.iter().any(|&m| m) {
        &result.index
    } else {
        &problem.mask
    };

    let errors = snapshot.weighting.effective_errors(data);
    let residuals = chisq::residuals(
        data.values().as_slice(),
        theory.as_slice(),
        errors.as_slice(),
        mask,
    );
    let chi2 = residuals.chi_squared();

    ProblemUpdate {
        page_id: problem.page_id,
        data_id: problem.data_id,
        group_id: problem.group_id,
        params,
        theory,
        residuals,
        chi2,
        result: result.clone(),
    }
}

/// Model values of the fittable parameters that were held fixed.
fn fixed_values(model: &dyn FitModel, fitted: &[String]) -> BTreeMap<String, f64> {
    model
        .fittable_params()
        .into_iter()
        .filter(|name| !fitted.contains(name))
        .filter_map(|name| model.get_param(&name).map(|v| (name, v)))
        .collect()
}

fn converged_row(problem: &BoundProblem, update: &ProblemUpdate) -> BatchRow {
    let snapshot = &problem.snapshot;
    let values = update.params.iter().cloned().collect();
    let errors = update
        .result
        .param_list
        .iter()
        .enumerate()
        .map(|(i, name)| (name.clone(), update.result.stderr_at(i)))
        .collect();
    BatchRow {
        page_id: problem.page_id,
        data_id: problem.data_id,
        data_name: snapshot.data.name.clone(),
        model_name: snapshot.model.name().to_string(),
        chi2: update.chi2,
        converged: true,
        values,
        errors,
        fixed: fixed_values(snapshot.model.as_ref(), &problem.params),
    }
}

fn failed_row(problem: &BoundProblem) -> BatchRow {
    let snapshot = &problem.snapshot;
    let sentinel = || problem.params.iter().map(|p| (p.clone(), f64::NAN)).collect();
    BatchRow {
        page_id: problem.page_id,
        data_id: problem.data_id,
        data_name: snapshot.data.name.clone(),
        model_name: snapshot.model.name().to_string(),
        chi2: f64::NAN,
        converged: false,
        values: sentinel(),
        errors: sentinel(),
        fixed: fixed_values(snapshot.model.as_ref(), &problem.params),
    }
}

/// Fitted `(name, value)` pairs of the first valid result, used to seed the next
/// dataset of a chained batch fit.
pub(crate) fn chain_seed(results: &[FitResult]) -> Option<Vec<(String, f64)>> {
    results.iter().find(|r| r.is_valid()).map(|r| {
        r.param_list
            .iter()
            .cloned()
            .zip(r.pvec.iter().copied())
            .collect()
    })
}
