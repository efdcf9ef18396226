//! Per-pixel nonlinear least-squares engine.
//!
//! One Levenberg–Marquardt solve per pixel against that pixel's observed
//! correlation curve:
//!
//! - observations are restricted to the fit-channel window and weighted by
//!   `1 / variance`
//! - fixed parameters are held constant for the entire iteration
//! - the fitted curve and residuals are reconstructed for *all* channels,
//!   zero outside the window
//!
//! Failure policy: optimizer non-convergence yields the best available point
//! and the pixel is still recorded as fitted; callers threshold on the
//! chi-square or iteration count. Only structurally invalid input (bad
//! window, non-positive variance, non-positive degrees of freedom, zero free
//! parameters) is a hard error.

use rayon::prelude::*;

use crate::domain::{AcquisitionSettings, FitParameters, PixelResult, PixelSample};
use crate::error::FitError;
use crate::fit::config::FitConfig;
use crate::math::{LmSettings, SolveState, minimize};
use crate::models::{ModelShape, evaluate, evaluate_with_gradient};

/// Per-pixel fitting engine for one geometry/settings combination.
pub struct StandardFit {
    shape: ModelShape,
    lm: LmSettings,
}

impl StandardFit {
    /// Resolve the configured model against the acquisition settings.
    pub fn new(config: &FitConfig, settings: &AcquisitionSettings) -> Result<Self, FitError> {
        let shape = ModelShape::new(config.geometry, config.mode, settings)?;
        Ok(StandardFit {
            shape,
            lm: LmSettings::default(),
        })
    }

    /// Override the optimizer budget/tolerance (defaults: 2000 iterations,
    /// 2000 evaluations).
    pub fn with_lm_settings(mut self, lm: LmSettings) -> Self {
        self.lm = lm;
        self
    }

    pub fn shape(&self) -> &ModelShape {
        &self.shape
    }

    /// Fit one pixel's curve.
    ///
    /// On success the configuration's stored initial guess is rewritten with
    /// the result when warm start is enabled (`fix == false`), creating the
    /// sequential scan-order dependency; with `fix == true` the configuration
    /// is left untouched.
    ///
    /// Residuals are variance-normalized (`sqrt(weight) * (observed - fit)`),
    /// so the reduced chi-square is their squared sum over the window divided
    /// by the degrees of freedom.
    pub fn fit_pixel(
        &self,
        config: &mut FitConfig,
        sample: &PixelSample,
        lag_times: &[f64],
    ) -> Result<PixelResult, FitError> {
        config.validate()?;
        let channel_count = lag_times.len();
        if channel_count != config.channel_count() {
            return Err(FitError::config(format!(
                "Lag time series has {channel_count} channels, configuration expects {}.",
                config.channel_count()
            )));
        }
        if sample.acf.len() != channel_count || sample.variance.len() != channel_count {
            return Err(FitError::config(format!(
                "Pixel sample arrays (acf={}, variance={}) are not aligned to {} lag channels.",
                sample.acf.len(),
                sample.variance.len(),
                channel_count
            )));
        }

        let fit_start = config.fit_start();
        let fit_end = config.fit_end();
        let window = fit_end - fit_start + 1;
        let mut x = Vec::with_capacity(window);
        let mut y = Vec::with_capacity(window);
        let mut weights = Vec::with_capacity(window);
        for i in fit_start..=fit_end {
            let variance = sample.variance[i];
            if !variance.is_finite() || variance <= 0.0 {
                return Err(FitError::config(format!(
                    "Non-positive variance {variance} at channel {i}."
                )));
            }
            x.push(lag_times[i]);
            y.push(sample.acf[i]);
            weights.push(1.0 / variance);
        }

        let outcome = minimize(
            |tau, params| evaluate_with_gradient(&self.shape, tau, params),
            &x,
            &y,
            &weights,
            config.parameter_values(),
            &config.parameters_to_fit(),
            &config.bounds(),
            &self.lm,
        )?;

        let mut result = PixelResult::empty(channel_count);
        result.iterations = outcome.iterations;
        if outcome.state == SolveState::ModelNonFinite {
            // Recoverable fit failure: leave the pixel unfitted.
            return Ok(result);
        }

        let mut chi2 = 0.0;
        for i in fit_start..=fit_end {
            let fitted = evaluate(&self.shape, lag_times[i], &outcome.params);
            let residual = (sample.acf[i] - fitted) * weights[i - fit_start].sqrt();
            result.fitted_acf[i] = fitted;
            result.residuals[i] = residual;
            chi2 += residual * residual;
        }
        result.chi2 = chi2 / config.degrees_of_freedom() as f64;
        result.fitted = true;
        result.converged = outcome.converged();
        let params = FitParameters::from_array(&outcome.params);
        result.params = Some(params);

        if !config.fix {
            config.update_parameter_values(&params);
        }

        Ok(result)
    }

    /// Evaluate the configured parameters over all lag channels without
    /// optimizing (theoretical curve for the current initial guess).
    pub fn theoretical_curve(&self, config: &FitConfig, lag_times: &[f64]) -> Vec<f64> {
        let params = config.parameter_values();
        lag_times
            .iter()
            .map(|&tau| evaluate(&self.shape, tau, &params))
            .collect()
    }

    /// Fit every pixel of a grid in parallel.
    ///
    /// Warm start would make pixel N's initial guess depend on pixel N-1,
    /// which changes numerical results under parallel execution, so this path
    /// requires `fix == true`; each worker owns a private configuration copy
    /// and a disjoint output slot.
    pub fn fit_grid(
        &self,
        config: &FitConfig,
        samples: &[PixelSample],
        lag_times: &[f64],
    ) -> Result<Vec<PixelResult>, FitError> {
        if !config.fix {
            return Err(FitError::config(
                "Warm start (fix = false) creates a sequential scan-order dependency; \
                 set fix = true for parallel grid fitting.",
            ));
        }
        config.validate()?;

        samples
            .par_iter()
            .map(|sample| {
                let mut local = config.clone();
                self.fit_pixel(&mut local, sample, lag_times)
            })
            .collect()
    }
}
