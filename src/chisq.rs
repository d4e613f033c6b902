//! # Normalized residuals and chi-squared
//!
//! Pure numerical helpers shared by every execution mode.
//!
//! For each point selected by `mask`:
//!
//! ```text
//! residual_i = (data_i - theory_i) / e_i      with e_i = 1 when error_i == 0
//! chi2       = mean(residual_i²) over finite residuals only
//! ```
//!
//! Points outside the mask appear neither in the residual vector nor in the mean.
//! A non-finite residual (e.g. a NaN theory point) is kept in the residual vector but
//! does not take part in the mean. When no finite residual remains, chi-squared is NaN.
//!
//! Notes
//! -----------------
//! * The substitution of zero errors by 1 is a legacy normalization convention kept for
//!   behavioral compatibility with existing fit results. It is an approximation, not a
//!   statistically motivated weight.
//! * Inputs of different lengths are truncated to the shortest one.
//! * 2D detector images are handled by flattening the pixel grids (see [`chi_squared_2d`]).
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// Residuals of the points that took part in a fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Residuals {
    /// Position of each residual in the original dataset.
    pub indices: Vec<usize>,
    pub values: Vec<f64>,
}

impl Residuals {
    /// Mean of the squared finite residuals, NaN if there is none.
    pub fn chi_squared(&self) -> f64 {
        let (sum, n) = self
            .values
            .iter()
            .filter(|r| r.is_finite())
            .fold((0.0, 0usize), |(s, n), r| (s + r * r, n + 1));
        if n == 0 {
            f64::NAN
        } else {
            sum / n as f64
        }
    }
}

#[inline]
fn effective_error(e: f64) -> f64 {
    if e == 0.0 {
        1.0
    } else {
        e
    }
}

/// Normalized residuals `(data - theory) / error` over the masked points.
pub fn residuals(data_y: &[f64], theory_y: &[f64], error_y: &[f64], mask: &[bool]) -> Residuals {
    let mut indices = Vec::new();
    let mut values = Vec::new();
    let points = data_y
        .iter()
        .zip(theory_y)
        .zip(error_y)
        .zip(mask)
        .enumerate();
    for (i, (((&d, &t), &e), &selected)) in points {
        if selected {
            indices.push(i);
            values.push((d - t) / effective_error(e));
        }
    }
    Residuals { indices, values }
}

pub fn chi_squared(data_y: &[f64], theory_y: &[f64], error_y: &[f64], mask: &[bool]) -> f64 {
    residuals(data_y, theory_y, error_y, mask).chi_squared()
}

/// Chi-squared over a 2D pixel grid.
///
/// All four grids must share the same shape; they are flattened in the same storage
/// order so pixels line up.
pub fn chi_squared_2d(
    data: &DMatrix<f64>,
    theory: &DMatrix<f64>,
    error: &DMatrix<f64>,
    mask: &DMatrix<bool>,
) -> f64 {
    chi_squared(
        data.as_slice(),
        theory.as_slice(),
        error.as_slice(),
        mask.as_slice(),
    )
}

#[cfg(test)]
mod chisq_tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_reference_triple() {
        let r = residuals(&[1.0, 2.0, 3.0], &[1.0, 2.0, 4.0], &[1.0, 1.0, 1.0], &[true; 3]);
        assert_eq!(r.values, vec![0.0, 0.0, -1.0]);
        assert_eq!(r.indices, vec![0, 1, 2]);
        assert_relative_eq!(r.chi_squared(), 1.0 / 3.0, epsilon = 1e-15);
    }

    #[test]
    fn test_zero_error_is_unit_error() {
        let data = [1.0, 2.0, 3.0];
        let theory = [0.5, 2.5, 4.0];
        let zeros = residuals(&data, &theory, &[0.0, 1.0, 0.0], &[true; 3]);
        let ones = residuals(&data, &theory, &[1.0, 1.0, 1.0], &[true; 3]);
        assert_eq!(zeros, ones);
    }

    #[test]
    fn test_mask_excludes_points() {
        let r = residuals(
            &[1.0, 2.0, 3.0],
            &[0.0, 2.0, 4.0],
            &[1.0, 1.0, 1.0],
            &[false, true, true],
        );
        assert_eq!(r.indices, vec![1, 2]);
        assert_relative_eq!(r.chi_squared(), 0.5, epsilon = 1e-15);
    }

    #[test]
    fn test_nan_theory_does_not_poison_mean() {
        let chi2 = chi_squared(
            &[1.0, 2.0, 3.0],
            &[f64::NAN, 2.0, 4.0],
            &[1.0, 1.0, 1.0],
            &[true; 3],
        );
        assert_relative_eq!(chi2, 0.5, epsilon = 1e-15);
    }

    #[test]
    fn test_nothing_selected_is_nan() {
        assert!(chi_squared(&[1.0], &[2.0], &[1.0], &[false]).is_nan());
    }

    #[test]
    fn test_two_d_grid() {
        let data = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let theory = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 3.0, 2.0]);
        let error = DMatrix::from_row_slice(2, 2, &[0.0, 2.0, 1.0, 0.0]);
        let mask = DMatrix::from_row_slice(2, 2, &[true, true, false, true]);
        // residuals: 0, 1, -, 2 -> (0 + 1 + 4) / 3
        assert_relative_eq!(
            chi_squared_2d(&data, &theory, &error, &mask),
            5.0 / 3.0,
            epsilon = 1e-15
        );
    }
}
