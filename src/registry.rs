//! # ProblemRegistry: the page finder
//!
//! The registry maps every fit page to the ordered collection of [`FitProblem`]s it owns.
//! It is the only state shared between the interactive loop and fit jobs, and only the
//! interactive loop mutates its structure. Jobs work on snapshots cloned out of it at
//! build time.
//!
//! Data Model
//! -----------------
//! * **Pages** are kept in a `Vec` in creation order with an `ahash` index from
//!   [`PageId`] to position, so iteration order is stable for a whole session.
//! * **Problems** within a page are kept in insertion order with the same
//!   index-by-[`DataId`] scheme.
//! * Every page carries a **generation** drawn from a session counter when it is
//!   created. A page deleted and created again under the same id gets a new one, so
//!   results computed for the old page can be told apart.
//! * The two reserved pages ([`PageId::SIMULTANEOUS`], [`PageId::COMBINED_BATCH`]) may be
//!   created like any other page but are never yielded by [`ProblemRegistry::iter_armed`].
//!
//! Error Semantics
//! -----------------
//! * [`create`](ProblemRegistry::create) and [`delete`](ProblemRegistry::delete) are
//!   idempotent and never fail.
//! * Every setter fails with [`FitError::UnknownPage`] / [`FitError::UnknownData`] when
//!   addressed with an id the registry does not know.
use std::collections::HashMap;
use std::sync::Arc;

use ahash::RandomState;

use crate::aggregator::batch_table::BatchTable;
use crate::constants::{DataId, PageId};
use crate::data::FitData;
use crate::fit_errors::FitError;
use crate::fit_problem::{Constraint, FitProblem, FitRange, ProblemConfig, Smearing, Weighting};
use crate::model::FitModel;

/// All problems owned by one fit page.
#[derive(Debug, Clone)]
pub struct Page {
    id: PageId,
    generation: u64,
    problems: Vec<FitProblem>,
    index: HashMap<DataId, usize, RandomState>,
    batch_result: Option<BatchTable>,
}

impl Page {
    fn new(id: PageId, generation: u64) -> Self {
        Self {
            id,
            generation,
            problems: Vec::new(),
            index: HashMap::default(),
            batch_result: None,
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn problems(&self) -> &[FitProblem] {
        &self.problems
    }

    pub fn len(&self) -> usize {
        self.problems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.problems.is_empty()
    }

    pub fn get(&self, data_id: DataId) -> Option<&FitProblem> {
        self.index.get(&data_id).map(|&i| &self.problems[i])
    }

    fn get_mut(&mut self, data_id: DataId) -> Option<&mut FitProblem> {
        self.index.get(&data_id).map(|&i| &mut self.problems[i])
    }

    fn remove(&mut self, data_id: DataId) -> Option<FitProblem> {
        let pos = self.index.remove(&data_id)?;
        let removed = self.problems.remove(pos);
        for slot in self.index.values_mut() {
            if *slot > pos {
                *slot -= 1;
            }
        }
        Some(removed)
    }

    /// Last batch table produced by a job requested from this page.
    pub fn batch_result(&self) -> Option<&BatchTable> {
        self.batch_result.as_ref()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProblemRegistry {
    pages: Vec<Page>,
    index: HashMap<PageId, usize, RandomState>,
    next_generation: u64,
}

impl ProblemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an empty page. No-op if the page already exists.
    pub fn create(&mut self, page_id: PageId) {
        if self.index.contains_key(&page_id) {
            return;
        }
        log::debug!("registry: create {page_id}");
        self.index.insert(page_id, self.pages.len());
        self.pages.push(Page::new(page_id, self.next_generation));
        self.next_generation += 1;
    }

    /// Remove a page and all its problems. No-op if the page is absent.
    pub fn delete(&mut self, page_id: PageId) {
        let Some(pos) = self.index.remove(&page_id) else {
            return;
        };
        log::debug!("registry: delete {page_id}");
        self.pages.remove(pos);
        for slot in self.index.values_mut() {
            if *slot > pos {
                *slot -= 1;
            }
        }
    }

    pub fn contains(&self, page_id: PageId) -> bool {
        self.index.contains_key(&page_id)
    }

    /// Generation of a live page, `None` once it is deleted.
    pub fn generation(&self, page_id: PageId) -> Option<u64> {
        self.index.get(&page_id).map(|&i| self.pages[i].generation)
    }

    pub fn page(&self, page_id: PageId) -> Result<&Page, FitError> {
        self.index
            .get(&page_id)
            .map(|&i| &self.pages[i])
            .ok_or(FitError::UnknownPage(page_id))
    }

    fn page_mut(&mut self, page_id: PageId) -> Result<&mut Page, FitError> {
        match self.index.get(&page_id) {
            Some(&i) => Ok(&mut self.pages[i]),
            None => Err(FitError::UnknownPage(page_id)),
        }
    }

    pub fn pages(&self) -> impl Iterator<Item = &Page> {
        self.pages.iter()
    }

    pub fn problem(&self, page_id: PageId, data_id: DataId) -> Result<&FitProblem, FitError> {
        self.page(page_id)?
            .get(data_id)
            .ok_or(FitError::UnknownData {
                page: page_id,
                data: data_id,
            })
    }

    pub(crate) fn problem_mut(
        &mut self,
        page_id: PageId,
        data_id: DataId,
    ) -> Result<&mut FitProblem, FitError> {
        self.page_mut(page_id)?
            .get_mut(data_id)
            .ok_or(FitError::UnknownData {
                page: page_id,
                data: data_id,
            })
    }

    /// Upsert the problem for `data.id` on `page_id`.
    ///
    /// A new dataset is appended after the existing ones; an existing one is
    /// reconfigured in place, keeping its position, scheduled flag and cached results.
    pub fn set_problem(
        &mut self,
        page_id: PageId,
        data: Arc<FitData>,
        model: Box<dyn FitModel>,
        config: ProblemConfig,
    ) -> Result<(), FitError> {
        let page = self.page_mut(page_id)?;
        let data_id = data.id;
        match page.get_mut(data_id) {
            Some(problem) => problem.reconfigure(data, model, config),
            None => {
                log::debug!("registry: add dataset {data_id} to {page_id}");
                page.index.insert(data_id, page.problems.len());
                page.problems
                    .push(FitProblem::new(page_id, data, model, config));
            }
        }
        Ok(())
    }

    /// Remove a single dataset from a page.
    pub fn remove_problem(&mut self, page_id: PageId, data_id: DataId) -> Result<(), FitError> {
        self.page_mut(page_id)?
            .remove(data_id)
            .map(|_| ())
            .ok_or(FitError::UnknownData {
                page: page_id,
                data: data_id,
            })
    }

    /// Arm (`true`) or disarm (`false`) every problem of a page.
    pub fn schedule(&mut self, page_id: PageId, flag: bool) -> Result<(), FitError> {
        for problem in self.page_mut(page_id)?.problems.iter_mut() {
            problem.scheduled = flag;
        }
        Ok(())
    }

    pub fn schedule_all(&mut self, flag: bool) {
        for problem in self.pages.iter_mut().flat_map(|p| p.problems.iter_mut()) {
            problem.scheduled = flag;
        }
    }

    pub fn set_params_to_fit(
        &mut self,
        page_id: PageId,
        data_id: DataId,
        params: Vec<String>,
    ) -> Result<(), FitError> {
        self.problem_mut(page_id, data_id)?.params_to_fit = params;
        Ok(())
    }

    /// Set the fit range of every problem on a page.
    pub fn set_range(&mut self, page_id: PageId, range: FitRange) -> Result<(), FitError> {
        for problem in self.page_mut(page_id)?.problems.iter_mut() {
            problem.range = range;
        }
        Ok(())
    }

    pub fn set_weighting(&mut self, page_id: PageId, weighting: Weighting) -> Result<(), FitError> {
        for problem in self.page_mut(page_id)?.problems.iter_mut() {
            problem.weighting = weighting;
        }
        Ok(())
    }

    pub fn set_smearing(
        &mut self,
        page_id: PageId,
        data_id: DataId,
        smearing: Smearing,
    ) -> Result<(), FitError> {
        self.problem_mut(page_id, data_id)?.smearing = smearing;
        Ok(())
    }

    pub fn set_constraints(
        &mut self,
        page_id: PageId,
        data_id: DataId,
        constraints: Vec<Constraint>,
    ) -> Result<(), FitError> {
        self.problem_mut(page_id, data_id)?.constraints = constraints;
        Ok(())
    }

    /// Set a model parameter of one problem.
    ///
    /// Return
    /// ----------
    /// * `Err(FitError::Configuration)` if the model has no such parameter.
    pub fn set_model_param(
        &mut self,
        page_id: PageId,
        data_id: DataId,
        name: &str,
        value: f64,
    ) -> Result<(), FitError> {
        let problem = self.problem_mut(page_id, data_id)?;
        if problem.model.set_param(name, value) {
            Ok(())
        } else {
            Err(FitError::Configuration(format!(
                "model '{}' has no parameter '{name}'",
                problem.model.name()
            )))
        }
    }

    pub(crate) fn set_batch_result(
        &mut self,
        page_id: PageId,
        table: BatchTable,
    ) -> Result<(), FitError> {
        self.page_mut(page_id)?.batch_result = Some(table);
        Ok(())
    }

    /// Armed problems of every ordinary page, in registry order.
    ///
    /// The iterator is lazy and finite; calling this again restarts it.
    pub fn iter_armed(&self) -> impl Iterator<Item = (PageId, &FitProblem)> + Clone + '_ {
        self.pages
            .iter()
            .filter(|page| !page.id.is_reserved())
            .flat_map(|page| page.problems.iter().map(move |p| (page.id, p)))
            .filter(|(_, p)| p.scheduled)
    }

    /// Armed problems of a single page, in insertion order.
    pub fn iter_armed_in(
        &self,
        page_id: PageId,
    ) -> Result<impl Iterator<Item = &FitProblem> + Clone + '_, FitError> {
        Ok(self
            .page(page_id)?
            .problems
            .iter()
            .filter(|p| p.scheduled))
    }
}

#[cfg(test)]
mod registry_tests {
    use super::*;
    use nalgebra::DVector;

    #[derive(Debug, Clone)]
    struct Const;

    impl FitModel for Const {
        fn name(&self) -> &str {
            "const"
        }
        fn param_names(&self) -> Vec<String> {
            vec!["c".into()]
        }
        fn fittable_params(&self) -> Vec<String> {
            vec!["c".into()]
        }
        fn get_param(&self, _name: &str) -> Option<f64> {
            Some(1.0)
        }
        fn set_param(&mut self, name: &str, _value: f64) -> bool {
            name == "c"
        }
        fn evaluate(&self, data: &FitData) -> DVector<f64> {
            DVector::from_element(data.len(), 1.0)
        }
        fn clone_box(&self) -> Box<dyn FitModel> {
            Box::new(Const)
        }
    }

    fn data(id: u64) -> Arc<FitData> {
        Arc::new(
            FitData::one_d(DataId(id), format!("d{id}"), vec![1.0, 2.0], vec![1.0, 1.0], None)
                .unwrap(),
        )
    }

    fn add(reg: &mut ProblemRegistry, page: u64, id: u64) {
        reg.set_problem(PageId(page), data(id), Box::new(Const), ProblemConfig::default())
            .unwrap();
    }

    #[test]
    fn test_create_delete_idempotent() {
        let mut reg = ProblemRegistry::new();
        reg.create(PageId(1));
        add(&mut reg, 1, 10);
        reg.create(PageId(1));
        assert_eq!(reg.page(PageId(1)).unwrap().len(), 1);

        reg.delete(PageId(1));
        reg.delete(PageId(1));
        assert!(!reg.contains(PageId(1)));
        reg.delete(PageId(42));
    }

    #[test]
    fn test_recreated_page_gets_new_generation() {
        let mut reg = ProblemRegistry::new();
        reg.create(PageId(1));
        reg.create(PageId(2));
        let first = reg.generation(PageId(1)).unwrap();
        reg.create(PageId(1));
        assert_eq!(reg.generation(PageId(1)), Some(first));

        reg.delete(PageId(1));
        assert_eq!(reg.generation(PageId(1)), None);
        reg.create(PageId(1));
        let second = reg.page(PageId(1)).unwrap().generation();
        assert_ne!(second, first);
        assert_ne!(Some(second), reg.generation(PageId(2)));
    }

    #[test]
    fn test_unknown_ids_are_configuration_errors() {
        let mut reg = ProblemRegistry::new();
        let err = reg
            .set_problem(PageId(9), data(1), Box::new(Const), ProblemConfig::default())
            .unwrap_err();
        assert_eq!(err, FitError::UnknownPage(PageId(9)));
        assert!(err.is_configuration());

        reg.create(PageId(9));
        assert_eq!(
            reg.set_params_to_fit(PageId(9), DataId(3), vec![]),
            Err(FitError::UnknownData {
                page: PageId(9),
                data: DataId(3)
            })
        );
        assert!(reg.schedule(PageId(10), true).is_err());
    }

    #[test]
    fn test_iteration_order_and_reserved_exclusion() {
        let mut reg = ProblemRegistry::new();
        reg.create(PageId(2));
        reg.create(PageId::COMBINED_BATCH);
        reg.create(PageId(1));
        add(&mut reg, 2, 30);
        add(&mut reg, 2, 10);
        add(&mut reg, 1, 20);
        add(&mut reg, PageId::COMBINED_BATCH.0, 99);
        // upsert keeps position
        add(&mut reg, 2, 30);

        let order: Vec<_> = reg
            .iter_armed()
            .map(|(page, p)| (page.0, p.data_id().0))
            .collect();
        assert_eq!(order, vec![(2, 30), (2, 10), (1, 20)]);

        reg.schedule(PageId(2), false).unwrap();
        let armed = reg.iter_armed();
        assert_eq!(armed.clone().count(), 1);
        assert_eq!(armed.count(), 1);
    }

    #[test]
    fn test_remove_problem_keeps_order() {
        let mut reg = ProblemRegistry::new();
        reg.create(PageId(1));
        for id in [1, 2, 3] {
            add(&mut reg, 1, id);
        }
        reg.remove_problem(PageId(1), DataId(2)).unwrap();
        let ids: Vec<_> = reg
            .iter_armed_in(PageId(1))
            .unwrap()
            .map(|p| p.data_id().0)
            .collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(reg.problem(PageId(1), DataId(3)).unwrap().data_id(), DataId(3));
    }
}
