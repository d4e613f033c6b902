mod common;

use std::rc::Rc;
use std::sync::Arc;

use approx::assert_relative_eq;
use sasfit::aggregator::batch_table::BatchTable;
use sasfit::aggregator::SingleFitReport;
use sasfit::fit_problem::ProblemConfig;
use sasfit::fit_thread::JobState;
use sasfit::settings::FitSettings;
use sasfit::{DataId, FitOrchestrator, PageId};

use crate::common::{curve, journal, line, orchestrator, orchestrator_with, Script, WAIT};

/// Three pages with one dataset each: `run1`, `run2`, `run3`.
fn three_pages(fit: &mut FitOrchestrator, slopes: [f64; 3]) {
    for (i, slope) in slopes.into_iter().enumerate() {
        let n = i as u64 + 1;
        fit.create_fit_problem(PageId(n));
        fit.set_problem(
            PageId(n),
            curve(n, &format!("run{n}")),
            line(slope, 1.0),
            ProblemConfig::fitting(["slope"]),
        )
        .unwrap();
    }
}

#[test]
fn test_batch_rows_align_with_inputs() {
    let script = Arc::new(Script::fitting(&[("slope", 2.0)]).diverging("run2"));
    let mut fit = orchestrator(&script);
    three_pages(&mut fit, [1.0, 1.0, 1.0]);
    fit.create_fit_problem(PageId::COMBINED_BATCH);

    let tables = journal::<(PageId, BatchTable)>();
    let warnings = journal::<(PageId, String)>();
    {
        let tables = Rc::clone(&tables);
        fit.on_batch_complete(move |page, table| tables.borrow_mut().push((page, table.clone())));
        let warnings = Rc::clone(&warnings);
        fit.on_warning(move |page, msg| warnings.borrow_mut().push((page, msg.to_string())));
    }

    let job = fit.request_fit(PageId::COMBINED_BATCH).unwrap();
    assert_eq!(fit.wait_for_job(job, WAIT).unwrap(), JobState::Completed);
    assert_eq!(*script.engines_created.lock().unwrap(), 3);

    let tables = tables.borrow();
    assert_eq!(tables.len(), 1);
    let (page, table) = &tables[0];
    assert_eq!(*page, PageId::COMBINED_BATCH);
    assert_eq!(table.len(), 3);
    assert_eq!(table.columns, vec!["slope", "intercept", "Chi2", "Data"]);

    let names: Vec<_> = table.rows.iter().map(|r| r.data_name.as_str()).collect();
    assert_eq!(names, vec!["run1", "run2", "run3"]);
    for row in [0, 2] {
        assert_eq!(table.value(row, "slope"), Some(2.0));
        assert_relative_eq!(table.value(row, "Chi2").unwrap(), 0.0);
    }
    assert!(!table.rows[1].converged);
    assert!(table.value(1, "slope").unwrap().is_nan());
    assert!(table.value(1, "Chi2").unwrap().is_nan());
    assert_eq!(table.value(1, "intercept"), Some(1.0));

    assert_eq!(
        warnings.borrow().as_slice(),
        &[(PageId(2), "Data run2 and Model line did not fit.".to_string())]
    );

    let stored = fit
        .registry()
        .page(PageId::COMBINED_BATCH)
        .unwrap()
        .batch_result()
        .unwrap();
    assert_eq!(stored.len(), 3);
    assert_eq!(stored.columns, table.columns);

    let reg = fit.registry();
    assert_eq!(reg.problem(PageId(1), DataId(1)).unwrap().result_count, 1);
    assert_eq!(reg.problem(PageId(2), DataId(2)).unwrap().result_count, 0);
    assert_eq!(reg.problem(PageId(3), DataId(3)).unwrap().result_count, 1);
}

#[test]
fn test_single_page_with_several_datasets_runs_batch_style() {
    let script = Arc::new(Script::fitting(&[("slope", 2.0)]));
    let mut fit = orchestrator(&script);
    let page = PageId(7);
    fit.create_fit_problem(page);
    for id in [30, 10, 20] {
        fit.set_problem(
            page,
            curve(id, &format!("d{id}")),
            line(1.0, 1.0),
            ProblemConfig::fitting(["slope"]),
        )
        .unwrap();
    }

    let tables = journal::<(PageId, BatchTable)>();
    let singles = journal::<SingleFitReport>();
    {
        let tables = Rc::clone(&tables);
        fit.on_batch_complete(move |page, table| tables.borrow_mut().push((page, table.clone())));
        let singles = Rc::clone(&singles);
        fit.on_single_complete(move |r| singles.borrow_mut().push(r.clone()));
    }

    let job = fit.request_fit(page).unwrap();
    assert_eq!(fit.wait_for_job(job, WAIT).unwrap(), JobState::Completed);
    assert!(singles.borrow().is_empty());

    let tables = tables.borrow();
    let (reported, table) = &tables[0];
    assert_eq!(*reported, page);
    let ids: Vec<_> = table.rows.iter().map(|r| r.data_id.0).collect();
    assert_eq!(ids, vec![30, 10, 20]);
    assert!(fit.registry().page(page).unwrap().batch_result().is_some());
}

#[test]
fn test_chain_fit_seeds_next_dataset() {
    let script = Arc::new(Script::fitting(&[("slope", 3.0)]));
    let settings = FitSettings::builder()
        .chain_fit(true)
        .progress_interval(std::time::Duration::ZERO);
    let mut fit = orchestrator_with(&script, settings);
    three_pages(&mut fit, [1.0, 1.5, 1.7]);

    let job = fit.request_fit(PageId::COMBINED_BATCH).unwrap();
    fit.wait_for_job(job, WAIT).unwrap();

    let starts: Vec<f64> = script.runs().iter().map(|r| r.start["slope"]).collect();
    assert_eq!(starts, vec![1.0, 3.0, 3.0]);
}

#[test]
fn test_without_chain_fit_each_dataset_starts_from_its_own_guess() {
    let script = Arc::new(Script::fitting(&[("slope", 3.0)]));
    let mut fit = orchestrator(&script);
    three_pages(&mut fit, [1.0, 1.5, 1.7]);

    let job = fit.request_fit(PageId::COMBINED_BATCH).unwrap();
    fit.wait_for_job(job, WAIT).unwrap();
    let starts: Vec<f64> = script.runs().iter().map(|r| r.start["slope"]).collect();
    assert_eq!(starts, vec![1.0, 1.5, 1.7]);

    // the session flag is read when the next job is built
    fit.set_chain_fit(true);
    three_pages(&mut fit, [1.0, 1.5, 1.7]);
    let job = fit.request_fit(PageId::COMBINED_BATCH).unwrap();
    fit.wait_for_job(job, WAIT).unwrap();
    let starts: Vec<f64> = script.runs()[3..].iter().map(|r| r.start["slope"]).collect();
    assert_eq!(starts, vec![1.0, 3.0, 3.0]);
}

#[test]
fn test_chain_fit_is_ignored_outside_combined_batch() {
    let script = Arc::new(Script::fitting(&[("slope", 3.0)]));
    let mut fit = orchestrator(&script);
    fit.set_chain_fit(true);
    let page = PageId(1);
    fit.create_fit_problem(page);
    for (id, slope) in [(1, 1.0), (2, 1.5)] {
        fit.set_problem(page, curve(id, "d"), line(slope, 1.0), ProblemConfig::fitting(["slope"]))
            .unwrap();
    }
    let job = fit.request_fit(page).unwrap();
    fit.wait_for_job(job, WAIT).unwrap();
    let starts: Vec<f64> = script.runs().iter().map(|r| r.start["slope"]).collect();
    assert_eq!(starts, vec![1.0, 1.5]);
}

#[test]
fn test_batch_table_csv_export() {
    let script = Arc::new(Script::fitting(&[("slope", 2.0)]).diverging("run2"));
    let mut fit = orchestrator(&script);
    three_pages(&mut fit, [1.0, 1.0, 1.0]);
    fit.create_fit_problem(PageId::COMBINED_BATCH);
    let job = fit.request_fit(PageId::COMBINED_BATCH).unwrap();
    fit.wait_for_job(job, WAIT).unwrap();

    let table = fit
        .registry()
        .page(PageId::COMBINED_BATCH)
        .unwrap()
        .batch_result()
        .unwrap();
    let mut out = Vec::new();
    table.write_csv(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    let lines: Vec<_> = text.lines().collect();
    assert_eq!(
        lines,
        vec![
            "slope,error on slope,intercept,error on intercept,Chi2,Data",
            "2,0.05,1,NaN,0,run1",
            "NaN,NaN,1,NaN,NaN,run2",
            "2,0.05,1,NaN,0,run3",
        ]
    );
}
