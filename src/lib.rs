//! Fit orchestration for small-angle scattering analysis.
//!
//! Pages pair datasets with models in a [`registry::ProblemRegistry`]; a fit request is
//! turned into bound optimizer runs by [`job_builder::JobBuilder`], executed off the
//! interactive thread by [`fit_thread`], and merged back by [`aggregator`]. The
//! [`FitOrchestrator`] ties these together behind a callback-based API.
pub mod aggregator;
pub mod chisq;
pub mod constants;
pub mod data;
pub mod engine;
pub mod fit_errors;
pub mod fit_problem;
pub mod fit_thread;
pub mod job_builder;
pub mod model;
pub mod orchestrator;
pub mod registry;
pub mod settings;

pub use constants::{DataId, FitId, GroupId, JobId, PageId};
pub use fit_errors::FitError;
pub use orchestrator::FitOrchestrator;
pub use settings::FitSettings;
