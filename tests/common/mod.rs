#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use nalgebra::DVector;
use sasfit::data::FitData;
use sasfit::engine::{DataBinding, EngineError, FitEngine, FitMonitor, FitResult};
use sasfit::fit_problem::Constraint;
use sasfit::model::FitModel;
use sasfit::{DataId, FitId, FitOrchestrator, FitSettings, GroupId};

pub const WAIT: Duration = Duration::from_secs(10);

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// `y = slope * q + intercept`
#[derive(Debug, Clone)]
pub struct Line {
    pub slope: f64,
    pub intercept: f64,
}

impl FitModel for Line {
    fn name(&self) -> &str {
        "line"
    }

    fn param_names(&self) -> Vec<String> {
        vec!["slope".into(), "intercept".into()]
    }

    fn fittable_params(&self) -> Vec<String> {
        self.param_names()
    }

    fn get_param(&self, name: &str) -> Option<f64> {
        match name {
            "slope" => Some(self.slope),
            "intercept" => Some(self.intercept),
            _ => None,
        }
    }

    fn set_param(&mut self, name: &str, value: f64) -> bool {
        match name {
            "slope" => self.slope = value,
            "intercept" => self.intercept = value,
            _ => return false,
        }
        true
    }

    fn evaluate(&self, data: &FitData) -> DVector<f64> {
        data.q().map(|q| self.slope * q + self.intercept)
    }

    fn clone_box(&self) -> Box<dyn FitModel> {
        Box::new(self.clone())
    }
}

pub fn line(slope: f64, intercept: f64) -> Box<dyn FitModel> {
    Box::new(Line { slope, intercept })
}

/// Five points on `y = 2q + 1` with unit errors.
pub fn curve(id: u64, name: &str) -> Arc<FitData> {
    let x: Vec<f64> = (1..=5).map(f64::from).collect();
    let y = x.iter().map(|q| 2.0 * q + 1.0).collect();
    Arc::new(FitData::one_d(DataId(id), name, x, y, Some(vec![1.0; 5])).unwrap())
}

/// A 2x2 detector image attached to plot group `group`.
pub fn image(id: u64, name: &str, group: GroupId) -> Arc<FitData> {
    Arc::new(
        FitData::two_d(
            DataId(id),
            name,
            vec![1.0, 2.0, 1.0, 2.0],
            vec![0.0, 0.0, 1.0, 1.0],
            vec![3.0, 5.0, 3.5, 5.5],
            None,
            vec![true; 4],
        )
        .unwrap()
        .with_group(group),
    )
}

/// What the mock optimizer saw when it ran one bound problem.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub fit_id: FitId,
    pub data_name: String,
    pub start: BTreeMap<String, f64>,
    pub params: Vec<String>,
    pub constraints: Vec<Constraint>,
}

/// Behaviour shared by every engine created from one factory.
#[derive(Debug, Default)]
pub struct Script {
    /// Best-fit value per parameter name; parameters without a target keep their
    /// starting value.
    pub targets: HashMap<String, f64>,
    /// Data names for which the optimizer returns NaN values.
    pub diverge: Vec<String>,
    /// Make `run` fail with this message.
    pub fail: Option<String>,
    pub panic: bool,
    /// Simulated optimizer duration; cancellation is polled every 2 ms.
    pub run_time: Duration,
    /// Data names whose runs block for the given time without ever looking at
    /// cancellation.
    pub stall: HashMap<String, Duration>,
    pub runs: Mutex<Vec<RunRecord>>,
    pub engines_created: Mutex<usize>,
}

impl Script {
    pub fn fitting(targets: &[(&str, f64)]) -> Self {
        Script {
            targets: targets.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            ..Script::default()
        }
    }

    pub fn slow(mut self, run_time: Duration) -> Self {
        self.run_time = run_time;
        self
    }

    pub fn stalling(mut self, data_name: &str, time: Duration) -> Self {
        self.stall.insert(data_name.to_string(), time);
        self
    }

    pub fn diverging(mut self, data_name: &str) -> Self {
        self.diverge.push(data_name.to_string());
        self
    }

    pub fn failing(mut self, message: &str) -> Self {
        self.fail = Some(message.to_string());
        self
    }

    pub fn runs(&self) -> Vec<RunRecord> {
        self.runs.lock().unwrap().clone()
    }
}

struct Slot {
    model: Box<dyn FitModel>,
    params: Vec<String>,
    constraints: Vec<Constraint>,
    data: Option<DataBinding>,
    selected: bool,
}

pub struct MockEngine {
    script: Arc<Script>,
    slots: BTreeMap<FitId, Slot>,
}

impl FitEngine for MockEngine {
    fn set_model(
        &mut self,
        fit_id: FitId,
        model: Box<dyn FitModel>,
        params: &[String],
        constraints: &[Constraint],
    ) -> Result<(), EngineError> {
        let slot = self.slots.entry(fit_id).or_insert_with(|| Slot {
            model: model.clone_box(),
            params: Vec::new(),
            constraints: Vec::new(),
            data: None,
            selected: false,
        });
        slot.model = model;
        slot.params = params.to_vec();
        slot.constraints = constraints.to_vec();
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
        let script = Arc::clone(&self.script);
        if script.panic {
            panic!("mock optimizer panic");
        }

        let stalled = self
            .slots
            .values()
            .filter(|s| s.selected)
            .filter_map(|s| s.data.as_ref())
            .filter_map(|d| script.stall.get(&d.data.name))
            .max();
        if let Some(time) = stalled {
            thread::sleep(*time);
        }

        let started = Instant::now();
        let mut fitness = 10.0;
        while started.elapsed() < script.run_time {
            if monitor.is_cancelled() {
                return Ok(Vec::new());
            }
            monitor.report(fitness);
            fitness *= 0.9;
            thread::sleep(Duration::from_millis(2));
        }
        monitor.report(1.0);

        if let Some(message) = &script.fail {
            return Err(EngineError::Failed(message.clone()));
        }

        let mut results = Vec::new();
        for (&fit_id, slot) in self.slots.iter().filter(|(_, s)| s.selected) {
            let data = slot.data.as_ref().ok_or(EngineError::NothingSelected)?;
            script.runs.lock().unwrap().push(RunRecord {
                fit_id,
                data_name: data.data.name.clone(),
                start: slot
                    .model
                    .param_names()
                    .into_iter()
                    .filter_map(|n| slot.model.get_param(&n).map(|v| (n, v)))
                    .collect(),
                params: slot.params.clone(),
                constraints: slot.constraints.clone(),
            });

            let diverged = script.diverge.contains(&data.data.name);
            let pvec = slot
                .params
                .iter()
                .map(|p| match (diverged, script.targets.get(p)) {
                    (true, _) => f64::NAN,
                    (false, Some(v)) => *v,
                    (false, None) => slot.model.get_param(p).unwrap_or(f64::NAN),
                })
                .collect();
            results.push(FitResult {
                fit_id,
                pvec,
                stderr: vec![0.05; slot.params.len()],
                fitness: Some(1.0),
                param_list: slot.params.clone(),
                index: data.mask.clone(),
                theory: Vec::new(),
            });
        }
        Ok(results)
    }
}

pub fn factory(script: &Arc<Script>) -> impl Fn() -> Box<dyn FitEngine> + Send + Sync + 'static {
    let script = Arc::clone(script);
    move || -> Box<dyn FitEngine> {
        *script.engines_created.lock().unwrap() += 1;
        Box::new(MockEngine {
            script: Arc::clone(&script),
            slots: BTreeMap::new(),
        })
    }
}

pub fn orchestrator(script: &Arc<Script>) -> FitOrchestrator {
    orchestrator_with(script, FitSettings::builder().progress_interval(Duration::ZERO))
}

pub fn orchestrator_with(
    script: &Arc<Script>,
    settings: sasfit::settings::FitSettingsBuilder,
) -> FitOrchestrator {
    init_logger();
    FitOrchestrator::new(factory(script), settings.build().unwrap()).unwrap()
}

/// Callback recorder shared with closures registered on the orchestrator.
pub type Journal<T> = Rc<RefCell<Vec<T>>>;

pub fn journal<T>() -> Journal<T> {
    Rc::new(RefCell::new(Vec::new()))
}
