//! # Tabular results of a batch-style fit
//!
//! One [`BatchRow`] per dataset that took part in the job, in input order. Rows of
//! datasets that failed to converge are kept, with NaN fitted values and chi-squared,
//! so that the table geometry depends only on the number of inputs.
//!
//! Columns
//! -----------------
//! * every fittable parameter name of every fitted model, in first-seen order,
//! * [`CHI2_COLUMN`], the recomputed chi-squared,
//! * [`DATA_COLUMN`], the dataset name.
//!
//! A parameter column of a row reads the fitted value when the parameter was varied,
//! the model value when it was held fixed, and NaN when the model has no such
//! parameter.
use std::collections::BTreeMap;
use std::io;

use itertools::Itertools;
use serde::Serialize;

use crate::constants::{DataId, PageId, CHI2_COLUMN, DATA_COLUMN, ERROR_COLUMN_PREFIX};
use crate::fit_errors::FitError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchRow {
    pub page_id: PageId,
    pub data_id: DataId,
    pub data_name: String,
    pub model_name: String,
    pub chi2: f64,
    pub converged: bool,
    pub values: BTreeMap<String, f64>,
    pub errors: BTreeMap<String, f64>,
    pub fixed: BTreeMap<String, f64>,
}

impl BatchRow {
    /// Cell value of a parameter column.
    pub fn param(&self, name: &str) -> f64 {
        self.values
            .get(name)
            .or_else(|| self.fixed.get(name))
            .copied()
            .unwrap_or(f64::NAN)
    }

    /// Standard error of a fitted parameter, NaN for fixed or unknown ones.
    pub fn error(&self, name: &str) -> f64 {
        self.errors.get(name).copied().unwrap_or(f64::NAN)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchTable {
    pub columns: Vec<String>,
    pub rows: Vec<BatchRow>,
}

impl BatchTable {
    /// Build a table from rows and the per-row fittable parameter lists.
    pub fn new<'a, I>(rows: Vec<BatchRow>, fittable: I) -> Self
    where
        I: IntoIterator<Item = &'a [String]>,
    {
        let columns = fittable
            .into_iter()
            .flatten()
            .unique()
            .cloned()
            .chain([CHI2_COLUMN.to_string(), DATA_COLUMN.to_string()])
            .collect();
        BatchTable { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Parameter columns only, without `Chi2` and `Data`.
    pub fn param_columns(&self) -> &[String] {
        let n = self.columns.len().saturating_sub(2);
        &self.columns[..n]
    }

    /// Numeric cell at `(row, column)`.
    ///
    /// Return
    /// ----------
    /// * `None` if the row is out of bounds, the column is unknown, or the column is
    ///   the textual `Data` column.
    pub fn value(&self, row: usize, column: &str) -> Option<f64> {
        let row = self.rows.get(row)?;
        match column {
            CHI2_COLUMN => Some(row.chi2),
            DATA_COLUMN => None,
            name if self.columns.iter().any(|c| c == name) => Some(row.param(name)),
            _ => None,
        }
    }

    /// Write the table as CSV.
    ///
    /// Each parameter column is followed by its `error on <param>` column, then come
    /// `Chi2` and `Data`. NaN cells are written as `NaN`.
    pub fn write_csv<W: io::Write>(&self, writer: W) -> Result<(), FitError> {
        let mut wtr = csv::Writer::from_writer(writer);
        let params = self.param_columns();

        let header = params
            .iter()
            .flat_map(|p| [p.clone(), format!("{ERROR_COLUMN_PREFIX}{p}")])
            .chain([CHI2_COLUMN.to_string(), DATA_COLUMN.to_string()]);
        wtr.write_record(header)?;

        for row in &self.rows {
            let record = params
                .iter()
                .flat_map(|p| [row.param(p).to_string(), row.error(p).to_string()])
                .chain([row.chi2.to_string(), row.data_name.clone()]);
            wtr.write_record(record)?;
        }
        wtr.flush().map_err(csv::Error::from)?;
        Ok(())
    }
}
