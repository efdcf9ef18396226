//! Weighted linear regression.
//!
//! The diffusion-law analyzer reduces each binning to a `(area, time)` point
//! with a standard deviation, and then fits a straight line
//! `time = intercept + slope * area` with weights `1 / sd²`.
//!
//! Implementation choices:
//! - Rows are scaled by `sqrt(w_i)` and the resulting ordinary least-squares
//!   problem is solved by SVD, which stays robust for tall design matrices
//!   and near-degenerate sweeps (e.g. almost-identical areas).
//! - The parameter dimension is 2, so SVD cost is negligible.

use nalgebra::{DMatrix, DVector};

use crate::error::FitError;

/// Solve a least-squares problem using SVD.
///
/// Returns `None` if the system is too ill-conditioned to solve robustly.
pub fn solve_least_squares(x: &DMatrix<f64>, y: &DVector<f64>) -> Option<DVector<f64>> {
    let svd = x.clone().svd(true, true);

    // Try progressively looser tolerances if the strict solve fails.
    for &tol in &[1e-10, 1e-8, 1e-6] {
        if let Ok(beta) = svd.solve(y, tol) {
            if beta.iter().all(|v| v.is_finite()) {
                return Some(beta);
            }
        }
    }

    None
}

/// Straight-line fit result.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LineFit {
    pub intercept: f64,
    pub slope: f64,
}

impl LineFit {
    pub fn value_at(&self, x: f64) -> f64 {
        self.intercept + self.slope * x
    }
}

/// Fit `y = intercept + slope * x` weighting each observation by
/// `1 / standard_deviation²`.
pub fn weighted_line_fit(
    x: &[f64],
    y: &[f64],
    standard_deviation: &[f64],
) -> Result<LineFit, FitError> {
    let n = x.len();
    if n < 2 || y.len() != n || standard_deviation.len() != n {
        return Err(FitError::config(format!(
            "Line fit needs at least 2 aligned points: x={}, y={}, sd={}.",
            n,
            y.len(),
            standard_deviation.len()
        )));
    }
    if standard_deviation.iter().any(|s| !s.is_finite() || *s <= 0.0) {
        return Err(FitError::config(
            "Line fit standard deviations must be positive and finite.",
        ));
    }
    if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
        return Err(FitError::config("Line fit inputs must be finite."));
    }

    let mut xw = DMatrix::<f64>::zeros(n, 2);
    let mut yw = DVector::<f64>::zeros(n);
    for i in 0..n {
        let sw = 1.0 / standard_deviation[i];
        xw[(i, 0)] = sw;
        xw[(i, 1)] = x[i] * sw;
        yw[i] = y[i] * sw;
    }

    let beta = solve_least_squares(&xw, &yw)
        .ok_or_else(|| FitError::config("Line fit design matrix is too ill-conditioned."))?;

    Ok(LineFit {
        intercept: beta[0],
        slope: beta[1],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovers_exact_line() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let y: Vec<f64> = x.iter().map(|&xi| 0.5 + 2.0 * xi).collect();
        let sd = [1.0; 4];
        let fit = weighted_line_fit(&x, &y, &sd).unwrap();
        assert!((fit.intercept - 0.5).abs() < 1e-10);
        assert!((fit.slope - 2.0).abs() < 1e-10);
    }

    #[test]
    fn weights_pull_the_fit_toward_precise_points() {
        // Three points on y = x, one outlier with a huge standard deviation.
        let x = [1.0, 2.0, 3.0, 4.0];
        let y = [1.0, 2.0, 3.0, 40.0];
        let sd = [0.01, 0.01, 0.01, 1e4];
        let fit = weighted_line_fit(&x, &y, &sd).unwrap();
        assert!((fit.slope - 1.0).abs() < 1e-3);
        assert!(fit.intercept.abs() < 1e-2);
    }

    #[test]
    fn matches_closed_form_weighted_solution() {
        let x = [1.0, 2.0, 4.0];
        let y = [2.0, 2.5, 5.0];
        let sd = [0.5, 1.0, 2.0];
        let fit = weighted_line_fit(&x, &y, &sd).unwrap();

        // Closed-form weighted normal equations.
        let w: Vec<f64> = sd.iter().map(|s| 1.0 / (s * s)).collect();
        let sw: f64 = w.iter().sum();
        let sx: f64 = w.iter().zip(&x).map(|(wi, xi)| wi * xi).sum();
        let sy: f64 = w.iter().zip(&y).map(|(wi, yi)| wi * yi).sum();
        let sxx: f64 = w.iter().zip(&x).map(|(wi, xi)| wi * xi * xi).sum();
        let sxy: f64 = w
            .iter()
            .zip(x.iter().zip(&y))
            .map(|(wi, (xi, yi))| wi * xi * yi)
            .sum();
        let det = sw * sxx - sx * sx;
        let intercept = (sxx * sy - sx * sxy) / det;
        let slope = (sw * sxy - sx * sy) / det;

        assert!((fit.intercept - intercept).abs() < 1e-9);
        assert!((fit.slope - slope).abs() < 1e-9);
    }

    #[test]
    fn rejects_non_positive_standard_deviation() {
        let err = weighted_line_fit(&[1.0, 2.0], &[1.0, 2.0], &[1.0, 0.0]).unwrap_err();
        assert!(matches!(err, FitError::InvalidConfiguration(_)));
    }
}
