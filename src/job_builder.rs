//! # JobBuilder: from a fit request to bound fitter instances
//!
//! A fit request names a page. The builder turns it into a [`FitJob`]: an immutable
//! snapshot of every problem taking part, already bound to freshly created
//! [`FitEngine`] instances.
//!
//! Execution modes
//! -----------------
//! | requested page                | problems included                   | fitters            |
//! |-------------------------------|-------------------------------------|--------------------|
//! | ordinary page, 1 armed        | that problem                        | one                |
//! | ordinary page, n > 1 armed    | the page's armed problems           | one per dataset    |
//! | [`PageId::SIMULTANEOUS`]      | every armed problem, ordinary pages | one shared         |
//! | [`PageId::COMBINED_BATCH`]    | every armed problem, ordinary pages | one per dataset    |
//!
//! The last two rows, and an ordinary page with several datasets, set the job's
//! `batch_on` flag except for the simultaneous case.
//!
//! Build steps
//! -----------------
//! 1. Collect the armed problems for the mode; none is a [`ValidationReason::NothingScheduled`].
//! 2. Validate every problem ([`FitProblem::validate`]); the first failure aborts the
//!    whole build, nothing is submitted.
//! 3. Allocate one [`FitId`] per problem, starting at 1.
//! 4. Choose plot groups: batch-style jobs share one freshly minted group for 1D data
//!    and mint a new group for every 2D dataset; other jobs keep the dataset's group.
//! 5. In simultaneous mode, resolve constraint expressions to canonical
//!    `M<fit_id>.<param>` references.
//! 6. Bind each problem: `set_model`, `set_data`, `select_problem_for_fit`.
//!
//! See also
//! ------------
//! * [`crate::fit_thread`] – Executes the built job.
//! * [`crate::aggregator`] – Consumes the [`BoundProblem`] snapshots after the run.
use std::collections::HashMap;
use std::sync::Arc;

use ahash::RandomState;
use itertools::Itertools;
use regex::{Captures, Regex};

use crate::constants::{DataId, FitId, GroupId, IdSequence, JobId, PageId};
use crate::engine::{DataBinding, EngineError, EngineFactory, FitEngine};
use crate::fit_errors::{FitError, ValidationReason};
use crate::fit_problem::{Constraint, FitProblem};
use crate::registry::ProblemRegistry;

/// `<label>.<param>` reference inside a constraint expression.
const REFERENCE_PATTERN: &str = r"\b([A-Za-z_][A-Za-z0-9_]*)\.([A-Za-z_][A-Za-z0-9_]*)\b";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitMode {
    Single,
    Simultaneous,
    CombinedBatch,
}

impl FitMode {
    pub fn for_page(page_id: PageId) -> Self {
        match page_id {
            PageId::SIMULTANEOUS => FitMode::Simultaneous,
            PageId::COMBINED_BATCH => FitMode::CombinedBatch,
            _ => FitMode::Single,
        }
    }
}

/// One problem as bound in a job: an immutable snapshot plus its binding metadata.
#[derive(Debug, Clone)]
pub struct BoundProblem {
    pub fit_id: FitId,
    pub page_id: PageId,
    pub data_id: DataId,
    pub caption: Option<String>,
    pub group_id: GroupId,
    /// Parameters handed to the optimizer.
    pub params: Vec<String>,
    /// Points inside the fit range.
    pub mask: Vec<bool>,
    pub snapshot: FitProblem,
}

/// A fitter instance and the problems bound to it.
pub struct FitterUnit {
    pub engine: Box<dyn FitEngine>,
    pub problems: Vec<BoundProblem>,
}

impl FitterUnit {
    /// Overwrite the starting values of every bound model and rebind it.
    ///
    /// Parameters unknown to a model are skipped.
    pub(crate) fn reseed(&mut self, seed: &[(String, f64)]) -> Result<(), EngineError> {
        for problem in &mut self.problems {
            let model = &mut problem.snapshot.model;
            for (name, value) in seed {
                model.set_param(name, *value);
            }
            self.engine
                .set_model(problem.fit_id, model.clone_box(), &problem.params, &[])?;
        }
        Ok(())
    }
}

/// Job descriptor handed to a background worker.
pub struct FitJob {
    pub id: JobId,
    pub requested_by: PageId,
    pub mode: FitMode,
    pub batch_on: bool,
    pub chain_fit: bool,
    pub units: Vec<FitterUnit>,
    /// Pages that took part, in registry order.
    pub pages: Vec<PageId>,
    /// Registry generation of each entry of `pages` when the job was built.
    pub generations: Vec<u64>,
}

impl FitJob {
    pub fn bound(&self) -> impl Iterator<Item = &BoundProblem> {
        self.units.iter().flat_map(|u| u.problems.iter())
    }

    pub fn problem_count(&self) -> usize {
        self.units.iter().map(|u| u.problems.len()).sum()
    }
}

pub struct JobBuilder<'a> {
    registry: &'a ProblemRegistry,
    factory: &'a dyn EngineFactory,
    chain_fit: bool,
}

impl<'a> JobBuilder<'a> {
    pub fn new(registry: &'a ProblemRegistry, factory: &'a dyn EngineFactory) -> Self {
        Self {
            registry,
            factory,
            chain_fit: false,
        }
    }

    /// Session-level chain fitting flag; only honoured for combined batch jobs.
    pub fn chain_fit(mut self, on: bool) -> Self {
        self.chain_fit = on;
        self
    }

    /// Pages a job requested from `page_id` would take part in, without binding anything.
    ///
    /// Return
    /// ----------
    /// * `Err(FitError::UnknownPage)` for an unknown ordinary page.
    /// * The pages owning at least one armed problem, in registry order; empty when
    ///   nothing is armed.
    pub fn participants(&self, page_id: PageId) -> Result<Vec<PageId>, FitError> {
        let pages = match FitMode::for_page(page_id) {
            FitMode::Single => self
                .registry
                .iter_armed_in(page_id)?
                .map(|p| p.page_id)
                .unique()
                .collect(),
            _ => self.registry.iter_armed().map(|(page, _)| page).unique().collect(),
        };
        Ok(pages)
    }

    /// Build and bind the job requested from `page_id`.
    ///
    /// Arguments
    /// -----------------
    /// * `job_id`: handle the job will be known under.
    /// * `page_id`: requesting page; the reserved ids select the aggregate modes.
    /// * `groups`: session counter used to mint plot-group ids.
    ///
    /// Return
    /// ----------
    /// * `Err(FitError::UnknownPage)` for an unknown ordinary page.
    /// * `Err(FitError::Validation)` when nothing is armed, a problem is malformed, or
    ///   a constraint cannot be resolved.
    /// * `Err(FitError::EngineFailure)` when a fitter rejects a binding.
    pub fn build(
        &self,
        job_id: JobId,
        page_id: PageId,
        groups: &mut IdSequence,
    ) -> Result<FitJob, FitError> {
        let mode = FitMode::for_page(page_id);
        let selected: Vec<&FitProblem> = match mode {
            FitMode::Single => self.registry.iter_armed_in(page_id)?.collect(),
            _ => self.registry.iter_armed().map(|(_, p)| p).collect(),
        };
        if selected.is_empty() {
            return Err(FitError::validation(
                page_id,
                ValidationReason::NothingScheduled,
            ));
        }

        let masks = selected
            .iter()
            .map(|p| p.validate())
            .collect::<Result<Vec<_>, _>>()?;

        let batch_on = match mode {
            FitMode::CombinedBatch => true,
            FitMode::Simultaneous => false,
            FitMode::Single => selected.len() > 1,
        };

        let mut shared_group = None;
        let bound: Vec<BoundProblem> = selected
            .iter()
            .zip(masks)
            .enumerate()
            .map(|(i, (problem, mask))| {
                let group_id = if !batch_on {
                    problem.data.group_id
                } else if problem.data.is_2d() {
                    groups.next_group()
                } else {
                    *shared_group.get_or_insert_with(|| groups.next_group())
                };
                BoundProblem {
                    fit_id: FitId(i + 1),
                    page_id: problem.page_id,
                    data_id: problem.data_id(),
                    caption: problem.caption.clone(),
                    group_id,
                    params: problem.params_to_fit.clone(),
                    mask,
                    snapshot: (*problem).clone(),
                }
            })
            .collect();
        let pages: Vec<PageId> = bound.iter().map(|b| b.page_id).unique().collect();
        let generations = pages
            .iter()
            .map(|&p| self.registry.page(p).map(|page| page.generation()))
            .collect::<Result<Vec<_>, _>>()?;

        let units = if mode == FitMode::Simultaneous {
            let constraints = resolve_constraints(&bound)?;
            vec![self.bind(bound.into_iter().zip(constraints))?]
        } else if batch_on {
            bound
                .into_iter()
                .map(|b| self.bind([(b, Vec::new())]))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            vec![self.bind(bound.into_iter().map(|b| (b, Vec::new())))?]
        };

        let job = FitJob {
            id: job_id,
            requested_by: page_id,
            mode,
            batch_on,
            chain_fit: self.chain_fit && mode == FitMode::CombinedBatch,
            units,
            pages,
            generations,
        };
        log::info!(
            "{job_id}: built {:?} fit from {page_id} ({} problem(s), {} fitter(s), batch={})",
            job.mode,
            job.problem_count(),
            job.units.len(),
            job.batch_on
        );
        Ok(job)
    }

    fn bind<I>(&self, problems: I) -> Result<FitterUnit, FitError>
    where
        I: IntoIterator<Item = (BoundProblem, Vec<Constraint>)>,
    {
        let mut engine = self.factory.create();
        let mut bound = Vec::new();
        for (problem, constraints) in problems {
            bind_problem(engine.as_mut(), &problem, &constraints)?;
            bound.push(problem);
        }
        Ok(FitterUnit {
            engine,
            problems: bound,
        })
    }
}

fn bind_problem(
    engine: &mut dyn FitEngine,
    problem: &BoundProblem,
    constraints: &[Constraint],
) -> Result<(), EngineError> {
    let snapshot = &problem.snapshot;
    engine.set_model(
        problem.fit_id,
        snapshot.model.clone_box(),
        &problem.params,
        constraints,
    )?;
    engine.set_data(
        problem.fit_id,
        DataBinding {
            data: Arc::clone(&snapshot.data),
            mask: problem.mask.clone(),
            errors: snapshot.weighting.effective_errors(&snapshot.data),
            smearer: snapshot.smearing.active().cloned(),
        },
    )?;
    engine.select_problem_for_fit(problem.fit_id, true)
}

/// Rewrite the constraints of every bound problem with canonical model labels.
///
/// A problem is addressed either by its caption or by `M<fit_id>`. The constrained
/// parameter becomes `M<fit_id>.<param>` of its owner.
fn resolve_constraints(bound: &[BoundProblem]) -> Result<Vec<Vec<Constraint>>, FitError> {
    let reference =
        Regex::new(REFERENCE_PATTERN).map_err(|e| FitError::Configuration(e.to_string()))?;

    let mut labels: HashMap<String, &BoundProblem, RandomState> = HashMap::default();
    for b in bound {
        labels.insert(b.fit_id.label(), b);
    }
    for b in bound {
        if let Some(caption) = &b.caption {
            labels.entry(caption.clone()).or_insert(b);
        }
    }

    let mut resolved = Vec::with_capacity(bound.len());
    for b in bound {
        let mut terms = Vec::with_capacity(b.snapshot.constraints.len());
        for c in &b.snapshot.constraints {
            if !b.snapshot.model.param_names().contains(&c.param) {
                return Err(FitError::validation(
                    b.page_id,
                    ValidationReason::UnknownParameter(c.param.clone()),
                ));
            }
            for caps in reference.captures_iter(&c.expression) {
                let known = labels
                    .get(&caps[1])
                    .is_some_and(|t| t.snapshot.model.param_names().iter().any(|p| p == &caps[2]));
                if !known {
                    return Err(FitError::validation(
                        b.page_id,
                        ValidationReason::UnresolvedConstraint(caps[0].to_string()),
                    ));
                }
            }
            let expression = reference.replace_all(&c.expression, |caps: &Captures| {
                match labels.get(&caps[1]) {
                    Some(t) => format!("{}.{}", t.fit_id.label(), &caps[2]),
                    None => caps[0].to_string(),
                }
            });
            terms.push(Constraint::new(
                format!("{}.{}", b.fit_id.label(), c.param),
                expression,
            ));
        }
        resolved.push(terms);
    }
    Ok(resolved)
}
