//! Model abstraction consumed by the fit engine.
//!
//! A model is anything that exposes named parameters and can compute a theory curve
//! over a dataset. The engine never inspects model internals: it only reads/writes
//! parameters by name and asks for the fittable parameter list.
use std::fmt;

use nalgebra::DVector;

use crate::data::FitData;

pub trait FitModel: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Every parameter the model exposes, fittable or not.
    fn param_names(&self) -> Vec<String>;

    /// Subset of [`param_names`](FitModel::param_names) an optimizer may vary.
    fn fittable_params(&self) -> Vec<String>;

    fn get_param(&self, name: &str) -> Option<f64>;

    /// Returns `false` if the model has no parameter called `name`.
    fn set_param(&mut self, name: &str, value: f64) -> bool;

    /// Theory value at every point (1D) or pixel (2D) of `data`.
    fn evaluate(&self, data: &FitData) -> DVector<f64>;

    fn clone_box(&self) -> Box<dyn FitModel>;
}

impl Clone for Box<dyn FitModel> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}
