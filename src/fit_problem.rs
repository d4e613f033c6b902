//! # FitProblem: one dataset bound to one model
//!
//! A [`FitProblem`] is the unit of work of the orchestration engine. It pairs a dataset
//! with a model and carries everything needed to turn that pair into an optimizer
//! binding:
//!
//! * the fit range ([`FitRange`]),
//! * the weighting mode ([`Weighting`]) used to derive effective errors,
//! * the smearing configuration ([`Smearing`]), an opaque resolution object,
//! * the parameters selected for fitting and the constraint terms ([`Constraint`]),
//! * the scheduled flag, which arms the problem for the next fit request.
//!
//! It also caches the outcome of the last job that included it (theory, residuals,
//! chi-squared, raw [`FitResult`]) together with a `result_count` that increases by one
//! every time a result is applied. Caches are only written by the orchestrator after a
//! completed job, never cleared on re-schedule.
use std::fmt;
use std::sync::Arc;

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::chisq::Residuals;
use crate::constants::{DataId, PageId};
use crate::data::FitData;
use crate::engine::FitResult;
use crate::fit_errors::{FitError, ValidationReason};
use crate::model::FitModel;

/// Closed interval `[qmin, qmax]` of the scattering vector used in a fit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitRange {
    pub qmin: f64,
    pub qmax: f64,
}

impl FitRange {
    pub fn new(qmin: f64, qmax: f64) -> Self {
        Self { qmin, qmax }
    }

    /// Range covering every point of `data`.
    pub fn covering(data: &FitData) -> Self {
        match data.q_bounds() {
            Some((lo, hi)) => Self::new(lo, hi),
            None => Self::new(0.0, 0.0),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.qmin.is_finite() && self.qmax.is_finite() && self.qmin < self.qmax
    }
}

/// How the effective error of each point is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Weighting {
    /// Unit errors.
    None,
    /// Measured uncertainties; unit errors when the dataset has none.
    #[default]
    Dy,
    /// `sqrt(|I|)`.
    SqrtY,
    /// `|I|`.
    AbsY,
}

impl Weighting {
    /// Effective error vector for `data`.
    ///
    /// Zero entries are left untouched here; the chi-squared engine replaces them with 1.
    pub fn effective_errors(self, data: &FitData) -> DVector<f64> {
        let y = data.values();
        match self {
            Weighting::None => DVector::from_element(y.len(), 1.0),
            Weighting::Dy => match data.uncertainties() {
                Some(dy) => dy.clone(),
                None => DVector::from_element(y.len(), 1.0),
            },
            Weighting::SqrtY => y.map(|v| v.abs().sqrt()),
            Weighting::AbsY => y.map(f64::abs),
        }
    }
}

/// Instrumental resolution applied to a theory curve before comparison with data.
pub trait Smearer: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn smear(&self, data: &FitData, theory: &DVector<f64>) -> DVector<f64>;
}

#[derive(Debug, Clone, Default)]
pub struct Smearing {
    pub enabled: bool,
    pub smearer: Option<Arc<dyn Smearer>>,
}

impl Smearing {
    pub fn off() -> Self {
        Self::default()
    }

    pub fn with(smearer: Arc<dyn Smearer>) -> Self {
        Self {
            enabled: true,
            smearer: Some(smearer),
        }
    }

    /// The smearer to apply, if smearing is both enabled and configured.
    pub fn active(&self) -> Option<&Arc<dyn Smearer>> {
        if self.enabled {
            self.smearer.as_ref()
        } else {
            None
        }
    }
}

/// A constraint term: `param` is tied to `expression`.
///
/// In simultaneous fits the expression may reference parameters of other models as
/// `<label>.<param>`, where the label is a page caption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub param: String,
    pub expression: String,
}

impl Constraint {
    pub fn new(param: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            param: param.into(),
            expression: expression.into(),
        }
    }
}

/// Configuration half of a [`FitProblem`], as set by the page that owns it.
#[derive(Debug, Clone, Default)]
pub struct ProblemConfig {
    /// `None` means: cover the whole dataset.
    pub range: Option<FitRange>,
    pub weighting: Weighting,
    pub smearing: Smearing,
    pub constraints: Vec<Constraint>,
    pub params_to_fit: Vec<String>,
    /// Model label used by constraint expressions; defaults to `M<fit_id>`.
    pub caption: Option<String>,
}

impl ProblemConfig {
    pub fn fitting<I, S>(params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            params_to_fit: params.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn range(mut self, qmin: f64, qmax: f64) -> Self {
        self.range = Some(FitRange::new(qmin, qmax));
        self
    }

    pub fn weighting(mut self, weighting: Weighting) -> Self {
        self.weighting = weighting;
        self
    }

    pub fn smearing(mut self, smearing: Smearing) -> Self {
        self.smearing = smearing;
        self
    }

    pub fn constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct FitProblem {
    pub page_id: PageId,
    pub data: Arc<FitData>,
    pub model: Box<dyn FitModel>,
    pub range: FitRange,
    pub weighting: Weighting,
    pub smearing: Smearing,
    pub constraints: Vec<Constraint>,
    pub params_to_fit: Vec<String>,
    pub caption: Option<String>,
    pub scheduled: bool,

    pub theory: Option<DVector<f64>>,
    pub residuals: Option<Residuals>,
    pub chi2: Option<f64>,
    pub result: Option<FitResult>,
    pub result_count: u64,
}

impl FitProblem {
    pub fn new(
        page_id: PageId,
        data: Arc<FitData>,
        model: Box<dyn FitModel>,
        config: ProblemConfig,
    ) -> Self {
        let range = config
            .range
            .unwrap_or_else(|| FitRange::covering(&data));
        FitProblem {
            page_id,
            data,
            model,
            range,
            weighting: config.weighting,
            smearing: config.smearing,
            constraints: config.constraints,
            params_to_fit: config.params_to_fit,
            caption: config.caption,
            scheduled: true,
            theory: None,
            residuals: None,
            chi2: None,
            result: None,
            result_count: 0,
        }
    }

    pub fn data_id(&self) -> DataId {
        self.data.id
    }

    /// Replace dataset, model and configuration while keeping the cached results.
    pub(crate) fn reconfigure(
        &mut self,
        data: Arc<FitData>,
        model: Box<dyn FitModel>,
        config: ProblemConfig,
    ) {
        self.range = config.range.unwrap_or_else(|| FitRange::covering(&data));
        self.data = data;
        self.model = model;
        self.weighting = config.weighting;
        self.smearing = config.smearing;
        self.constraints = config.constraints;
        self.params_to_fit = config.params_to_fit;
        self.caption = config.caption;
    }

    /// Check that the problem can be handed to an optimizer.
    ///
    /// Return
    /// ----------
    /// * `Ok(mask)` – the points that fall inside the fit range.
    /// * `Err(FitError::Validation)` – no parameter selected, a selected parameter is
    ///   unknown or non-numeric, the range is malformed, or it selects no data.
    pub fn validate(&self) -> Result<Vec<bool>, FitError> {
        let page = self.page_id;
        if self.params_to_fit.is_empty() {
            return Err(FitError::validation(
                page,
                ValidationReason::NoParameters(self.data_id()),
            ));
        }

        let fittable = self.model.fittable_params();
        for name in &self.params_to_fit {
            if !fittable.contains(name) {
                return Err(FitError::validation(
                    page,
                    ValidationReason::UnknownParameter(name.clone()),
                ));
            }
            match self.model.get_param(name) {
                Some(v) if v.is_finite() => {}
                Some(v) => {
                    return Err(FitError::validation(
                        page,
                        ValidationReason::NonNumericParameter {
                            name: name.clone(),
                            value: v,
                        },
                    ))
                }
                None => {
                    return Err(FitError::validation(
                        page,
                        ValidationReason::UnknownParameter(name.clone()),
                    ))
                }
            }
        }

        if !self.range.is_valid() {
            return Err(FitError::validation(
                page,
                ValidationReason::InvalidRange {
                    qmin: self.range.qmin,
                    qmax: self.range.qmax,
                },
            ));
        }

        let mask = self.data.fit_mask(&self.range);
        if !mask.iter().any(|&m| m) {
            return Err(FitError::validation(
                page,
                ValidationReason::EmptyRange {
                    data: self.data_id(),
                    qmin: self.range.qmin,
                    qmax: self.range.qmax,
                },
            ));
        }
        Ok(mask)
    }

    /// Theory of the current model over the whole dataset, smeared when active.
    pub fn compute_theory(&self) -> DVector<f64> {
        let theory = self.model.evaluate(&self.data);
        match self.smearing.active() {
            Some(smearer) => smearer.smear(&self.data, &theory),
            None => theory,
        }
    }
}
