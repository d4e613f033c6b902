//! Combined batch fit of three synthetic power-law curves.
//!
//! Run with `RUST_LOG=debug cargo run --example batch_fit` to see the orchestration
//! logs. The optimizer is a small coordinate-descent search written against the
//! `FitEngine` contract; it is enough to show the full request → run → aggregate loop.
use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use nalgebra::DVector;
use sasfit::chisq::chi_squared;
use sasfit::data::FitData;
use sasfit::engine::{DataBinding, EngineError, FitEngine, FitMonitor, FitResult};
use sasfit::fit_problem::{Constraint, ProblemConfig};
use sasfit::model::FitModel;
use sasfit::{DataId, FitError, FitId, FitOrchestrator, FitSettings, PageId};

/// `I(q) = scale * q^-exponent + background`
#[derive(Debug, Clone)]
struct PowerLaw {
    scale: f64,
    exponent: f64,
    background: f64,
}

impl FitModel for PowerLaw {
    fn name(&self) -> &str {
        "power_law"
    }

    fn param_names(&self) -> Vec<String> {
        vec!["scale".into(), "exponent".into(), "background".into()]
    }

    fn fittable_params(&self) -> Vec<String> {
        self.param_names()
    }

    fn get_param(&self, name: &str) -> Option<f64> {
        match name {
            "scale" => Some(self.scale),
            "exponent" => Some(self.exponent),
            "background" => Some(self.background),
            _ => None,
        }
    }

    fn set_param(&mut self, name: &str, value: f64) -> bool {
        match name {
            "scale" => self.scale = value,
            "exponent" => self.exponent = value,
            "background" => self.background = value,
            _ => return false,
        }
        true
    }

    fn evaluate(&self, data: &FitData) -> DVector<f64> {
        data.q()
            .map(|q| self.scale * q.powf(-self.exponent) + self.background)
    }

    fn clone_box(&self) -> Box<dyn FitModel> {
        Box::new(self.clone())
    }
}

struct Slot {
    model: Box<dyn FitModel>,
    params: Vec<String>,
    data: Option<DataBinding>,
    selected: bool,
}

impl Slot {
    fn chi2(&self, binding: &DataBinding) -> f64 {
        let mut theory = self.model.evaluate(&binding.data);
        if let Some(smearer) = &binding.smearer {
            theory = smearer.smear(&binding.data, &theory);
        }
        chi_squared(
            binding.data.values().as_slice(),
            theory.as_slice(),
            binding.errors.as_slice(),
            &binding.mask,
        )
    }
}

/// Multiplicative coordinate descent with step halving.
#[derive(Default)]
struct CoordinateDescent {
    slots: BTreeMap<FitId, Slot>,
}

impl CoordinateDescent {
    const SWEEPS: usize = 200;
    const MIN_STEP: f64 = 1e-9;
}

impl FitEngine for CoordinateDescent {
    fn set_model(
        &mut self,
        fit_id: FitId,
        model: Box<dyn FitModel>,
        params: &[String],
        _constraints: &[Constraint],
    ) -> Result<(), EngineError> {
        match self.slots.get_mut(&fit_id) {
            Some(slot) => {
                slot.model = model;
                slot.params = params.to_vec();
            }
            None => {
                self.slots.insert(
                    fit_id,
                    Slot {
                        model,
                        params: params.to_vec(),
                        data: None,
                        selected: false,
                    },
                );
            }
        }
        Ok(())
    }

    fn set_data(&mut self, fit_id: FitId, binding: DataBinding) -> Result<(), EngineError> {
        let slot = self
            .slots
            .get_mut(&fit_id)
            .ok_or(EngineError::UnknownFitId(fit_id))?;
        slot.data = Some(binding);
        Ok(())
    }

    fn select_problem_for_fit(&mut self, fit_id: FitId, selected: bool) -> Result<(), EngineError> {
        let slot = self
            .slots
            .get_mut(&fit_id)
            .ok_or(EngineError::UnknownFitId(fit_id))?;
        slot.selected = selected;
        Ok(())
    }

    fn run(&mut self, monitor: &FitMonitor) -> Result<Vec<FitResult>, EngineError> {
        let mut results = Vec::new();
        for (&fit_id, slot) in self.slots.iter_mut().filter(|(_, s)| s.selected) {
            let binding = slot.data.clone().ok_or(EngineError::NothingSelected)?;
            let mut steps = vec![0.1; slot.params.len()];
            let mut best = slot.chi2(&binding);

            for _ in 0..Self::SWEEPS {
                if monitor.is_cancelled() {
                    return Ok(Vec::new());
                }
                for (k, name) in slot.params.iter().enumerate() {
                    let current = slot.model.get_param(name).unwrap_or(0.0);
                    let mut improved = false;
                    for factor in [1.0 + steps[k], 1.0 - steps[k]] {
                        let trial = if current == 0.0 { steps[k] * (factor - 1.0) } else { current * factor };
                        slot.model.set_param(name, trial);
                        let chi2 = slot.chi2(&binding);
                        if chi2 < best {
                            best = chi2;
                            improved = true;
                            break;
                        }
                        slot.model.set_param(name, current);
                    }
                    if !improved {
                        steps[k] = (steps[k] * 0.5).max(Self::MIN_STEP);
                    }
                }
                monitor.report(best);
            }

            let pvec = slot
                .params
                .iter()
                .map(|p| slot.model.get_param(p).unwrap_or(f64::NAN))
                .collect::<Vec<_>>();
            let stderr = pvec.iter().zip(&steps).map(|(v, s)| (v * s).abs()).collect();
            results.push(FitResult {
                fit_id,
                pvec,
                stderr,
                fitness: Some(best),
                param_list: slot.params.clone(),
                index: binding.mask.clone(),
                theory: slot.model.evaluate(&binding.data).iter().copied().collect(),
            });
        }
        Ok(results)
    }
}

fn synthetic(id: u64, scale: f64, exponent: f64) -> Result<Arc<FitData>, FitError> {
    let q: Vec<f64> = (1..=60).map(|i| 0.005 * f64::from(i)).collect();
    let y: Vec<f64> = q
        .iter()
        .map(|q| scale * q.powf(-exponent) + 0.1)
        .collect();
    let dy = y.iter().map(|v| 0.02 * v).collect();
    Ok(Arc::new(FitData::one_d(
        DataId(id),
        format!("sample-{id}"),
        q,
        y,
        Some(dy),
    )?))
}

fn main() -> Result<(), FitError> {
    env_logger::init();

    let settings = FitSettings::builder()
        .chain_fit(true)
        .progress_interval(Duration::from_millis(50))
        .build()?;
    println!("{settings:#}");

    let engine = || -> Box<dyn FitEngine> { Box::new(CoordinateDescent::default()) };
    let mut fit = FitOrchestrator::new(engine, settings)?;

    for (n, (scale, exponent)) in [(1.0e-3, 3.8), (1.2e-3, 4.0), (0.9e-3, 3.6)]
        .into_iter()
        .enumerate()
    {
        let page = PageId(n as u64 + 1);
        fit.create_fit_problem(page);
        fit.set_problem(
            page,
            synthetic(n as u64 + 1, scale, exponent)?,
            Box::new(PowerLaw {
                scale: 5.0e-4,
                exponent: 3.0,
                background: 0.1,
            }),
            ProblemConfig::fitting(["scale", "exponent"]).range(0.01, 0.25),
        )?;
    }

    fit.on_progress(|job, fitness| log::info!("{job}: chi2 = {fitness:.4}"));
    fit.on_warning(|page, msg| eprintln!("{page}: {msg}"));
    fit.on_error(|page, msg| eprintln!("{page}: fit failed: {msg}"));
    fit.on_job_finished(|job, page, pages, state| {
        log::info!("{job} from {page}: {state} over {} page(s)", pages.len())
    });
    fit.on_batch_complete(|page, table| {
        println!("{page}: {} row(s)", table.len());
        if let Err(e) = table.write_csv(io::stdout()) {
            eprintln!("{e}");
        }
    });

    let job = fit.request_fit(PageId::COMBINED_BATCH)?;
    let state = fit.wait_for_job(job, Duration::from_secs(60))?;
    println!("{job}: {state}");
    Ok(())
}
