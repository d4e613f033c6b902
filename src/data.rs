//! # Datasets consumed by the fit engine
//!
//! A [`FitData`] wraps either a 1D curve ([`Data1D`]: `x`, `y`, optional `dy`) or a flattened
//! 2D detector image ([`Data2D`]: per-pixel `qx`, `qy`, intensity, optional error and a
//! boolean pixel mask). Both carry an [`id`](FitData::id), a display name and a
//! [`group_id`](FitData::group_id) used to attach result curves to a plot.
//!
//! Datasets are immutable once built and shared between the registry and in-flight jobs
//! through `Arc<FitData>`.
//!
//! Fit range semantics
//! -----------------
//! * 1D – a point is in range when `qmin <= x <= qmax` and `y` is finite.
//! * 2D – a pixel is in range when `qmin <= sqrt(qx² + qy²) <= qmax`, its intensity is
//!   finite and its mask bit is set.
use nalgebra::DVector;

use crate::constants::{DataId, GroupId};
use crate::fit_errors::FitError;
use crate::fit_problem::FitRange;

#[derive(Debug, Clone, PartialEq)]
pub struct Data1D {
    pub x: DVector<f64>,
    pub y: DVector<f64>,
    pub dy: Option<DVector<f64>>,
}

/// Flattened 2D detector data. All vectors have one entry per pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct Data2D {
    pub qx: DVector<f64>,
    pub qy: DVector<f64>,
    pub data: DVector<f64>,
    pub err: Option<DVector<f64>>,
    pub mask: Vec<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    OneD(Data1D),
    TwoD(Data2D),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FitData {
    pub id: DataId,
    pub name: String,
    pub group_id: GroupId,
    pub signal: Signal,
}

impl FitData {
    /// Build a 1D dataset. The plot group defaults to the dataset id.
    ///
    /// Return
    /// ----------
    /// * `Err(FitError::Configuration)` if `x`, `y` and `dy` lengths disagree.
    pub fn one_d(
        id: DataId,
        name: impl Into<String>,
        x: Vec<f64>,
        y: Vec<f64>,
        dy: Option<Vec<f64>>,
    ) -> Result<Self, FitError> {
        let name = name.into();
        if x.len() != y.len() || dy.as_ref().is_some_and(|e| e.len() != y.len()) {
            return Err(FitError::Configuration(format!(
                "dataset '{name}' has inconsistent array lengths"
            )));
        }
        Ok(FitData {
            id,
            name,
            group_id: GroupId(id.0),
            signal: Signal::OneD(Data1D {
                x: DVector::from_vec(x),
                y: DVector::from_vec(y),
                dy: dy.map(DVector::from_vec),
            }),
        })
    }

    /// Build a 2D dataset from flattened pixel arrays.
    ///
    /// `mask` marks the pixels that may take part in a fit (`true` = usable).
    pub fn two_d(
        id: DataId,
        name: impl Into<String>,
        qx: Vec<f64>,
        qy: Vec<f64>,
        data: Vec<f64>,
        err: Option<Vec<f64>>,
        mask: Vec<bool>,
    ) -> Result<Self, FitError> {
        let name = name.into();
        let n = data.len();
        if qx.len() != n
            || qy.len() != n
            || mask.len() != n
            || err.as_ref().is_some_and(|e| e.len() != n)
        {
            return Err(FitError::Configuration(format!(
                "dataset '{name}' has inconsistent pixel array lengths"
            )));
        }
        Ok(FitData {
            id,
            name,
            group_id: GroupId(id.0),
            signal: Signal::TwoD(Data2D {
                qx: DVector::from_vec(qx),
                qy: DVector::from_vec(qy),
                data: DVector::from_vec(data),
                err: err.map(DVector::from_vec),
                mask,
            }),
        })
    }

    pub fn with_group(mut self, group_id: GroupId) -> Self {
        self.group_id = group_id;
        self
    }

    pub fn is_2d(&self) -> bool {
        matches!(self.signal, Signal::TwoD(_))
    }

    /// Number of points (1D) or pixels (2D).
    pub fn len(&self) -> usize {
        self.values().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Measured intensities.
    pub fn values(&self) -> &DVector<f64> {
        match &self.signal {
            Signal::OneD(d) => &d.y,
            Signal::TwoD(d) => &d.data,
        }
    }

    /// Measurement uncertainties, if the dataset carries any.
    pub fn uncertainties(&self) -> Option<&DVector<f64>> {
        match &self.signal {
            Signal::OneD(d) => d.dy.as_ref(),
            Signal::TwoD(d) => d.err.as_ref(),
        }
    }

    /// Scattering vector magnitude of every point.
    pub fn q(&self) -> DVector<f64> {
        match &self.signal {
            Signal::OneD(d) => d.x.clone(),
            Signal::TwoD(d) => d.qx.zip_map(&d.qy, |qx, qy| qx.hypot(qy)),
        }
    }

    pub fn q_bounds(&self) -> Option<(f64, f64)> {
        let q = self.q();
        let finite = q.iter().copied().filter(|v| v.is_finite());
        finite.fold(None, |acc, v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
    }

    /// Points taking part in a fit over `range`.
    pub fn fit_mask(&self, range: &FitRange) -> Vec<bool> {
        let values = self.values();
        let q = self.q();
        let in_range = |i: usize| {
            let qi = q[i];
            qi >= range.qmin && qi <= range.qmax && values[i].is_finite()
        };
        match &self.signal {
            Signal::OneD(_) => (0..self.len()).map(in_range).collect(),
            Signal::TwoD(d) => (0..self.len()).map(|i| d.mask[i] && in_range(i)).collect(),
        }
    }
}

#[cfg(test)]
mod data_tests {
    use super::*;

    #[test]
    fn test_one_d_length_check() {
        let err = FitData::one_d(DataId(1), "bad", vec![1.0, 2.0], vec![1.0], None);
        assert!(matches!(err, Err(FitError::Configuration(_))));
    }

    #[test]
    fn test_one_d_mask_follows_range_and_finiteness() {
        let data = FitData::one_d(
            DataId(1),
            "curve",
            vec![0.01, 0.02, 0.03, 0.04],
            vec![1.0, f64::NAN, 3.0, 4.0],
            None,
        )
        .unwrap();
        let mask = data.fit_mask(&FitRange::new(0.015, 0.035));
        assert_eq!(mask, vec![false, false, true, false]);
        assert_eq!(data.q_bounds(), Some((0.01, 0.04)));
    }

    #[test]
    fn test_two_d_mask_combines_pixel_mask() {
        let data = FitData::two_d(
            DataId(2),
            "detector",
            vec![0.03, 0.0, 0.1, 0.03],
            vec![0.04, 0.02, 0.1, 0.04],
            vec![1.0, 2.0, 3.0, 4.0],
            None,
            vec![true, true, true, false],
        )
        .unwrap();
        assert!(data.is_2d());
        let mask = data.fit_mask(&FitRange::new(0.01, 0.1));
        assert_eq!(mask, vec![true, true, false, false]);
    }
}
