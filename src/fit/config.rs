//! Fit configuration: the parameter vector, which entries are free, their
//! bounds, the fit-channel window, and the warm-start policy.
//!
//! Analysis layers clone a configuration per run (e.g. one private copy per
//! diffusion-law binning) so that interface settings are never mutated behind
//! the caller's back.

use serde::{Deserialize, Serialize};

use crate::domain::{
    DIFFUSION_COEFFICIENT_BASE, FitParameters, GeometryKind, PARAM_COUNT, PARAM_D,
};
use crate::error::FitError;

/// One fit parameter: current value (doubling as the initial guess), hold
/// state, and the box constraint applied during optimization.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub value: f64,
    /// Held parameters keep `value` for the entire iteration.
    pub hold: bool,
    pub lower: f64,
    pub upper: f64,
}

impl Parameter {
    fn new(value: f64, hold: bool, lower: f64, upper: f64) -> Self {
        Parameter {
            value,
            hold,
            lower,
            upper,
        }
    }
}

/// Complete configuration for the fitting engines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitConfig {
    params: [Parameter; PARAM_COUNT],
    pub geometry: GeometryKind,
    /// PSF-convention mode within the geometry.
    pub mode: u8,
    channel_count: usize,
    fit_start: usize,
    fit_end: usize,
    /// When `false`, each completed fit rewrites the stored initial guess
    /// (warm start for spatially continuous scans). `true` disables the
    /// sequential dependency and allows safe parallel execution.
    pub fix: bool,
}

impl FitConfig {
    /// Default configuration for a correlation curve of `channel_count`
    /// channels: N, D and G free, triplet terms held at zero, fit window
    /// `[1, channel_count - 1]` (channel 0 carries shot noise and is never
    /// part of the objective).
    pub fn new(
        geometry: GeometryKind,
        mode: u8,
        channel_count: usize,
    ) -> Result<Self, FitError> {
        if channel_count < 3 {
            return Err(FitError::config(format!(
                "At least 3 lag channels are required, got {channel_count}."
            )));
        }
        let params = [
            // N: particle number, strictly positive.
            Parameter::new(1.0, false, 1e-10, f64::INFINITY),
            // D: diffusion coefficient, 1 µm²/s in internal units.
            Parameter::new(1.0 / DIFFUSION_COEFFICIENT_BASE, false, 0.0, f64::INFINITY),
            // G: offset, unbounded.
            Parameter::new(0.0, false, f64::NEG_INFINITY, f64::INFINITY),
            // Triplet fraction, held by default.
            Parameter::new(0.0, true, 0.0, 0.999),
            // Triplet time, held by default.
            Parameter::new(0.0, true, 0.0, f64::INFINITY),
        ];
        Ok(FitConfig {
            params,
            geometry,
            mode,
            channel_count,
            fit_start: 1,
            fit_end: channel_count - 1,
            fix: true,
        })
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    pub fn fit_start(&self) -> usize {
        self.fit_start
    }

    pub fn fit_end(&self) -> usize {
        self.fit_end
    }

    /// Set the first fitted channel. Must stay in `[1, fit_end)`.
    pub fn set_fit_start(&mut self, fit_start: usize) -> Result<(), FitError> {
        if fit_start < 1 || fit_start >= self.fit_end {
            return Err(FitError::config(format!(
                "Fit start must be in [1, {}), got {fit_start}.",
                self.fit_end
            )));
        }
        self.fit_start = fit_start;
        Ok(())
    }

    /// Set the last fitted channel (inclusive). Must stay in
    /// `(fit_start, channel_count)`.
    pub fn set_fit_end(&mut self, fit_end: usize) -> Result<(), FitError> {
        if fit_end <= self.fit_start || fit_end >= self.channel_count {
            return Err(FitError::config(format!(
                "Fit end must be in ({}, {}), got {fit_end}.",
                self.fit_start, self.channel_count
            )));
        }
        self.fit_end = fit_end;
        Ok(())
    }

    pub fn param(&self, index: usize) -> &Parameter {
        &self.params[index]
    }

    /// Set a parameter's value (also its initial guess), checked against the
    /// parameter's bounds.
    pub fn set_value(&mut self, index: usize, value: f64) -> Result<(), FitError> {
        let param = &mut self.params[index];
        if !value.is_finite() || value < param.lower || value > param.upper {
            return Err(FitError::config(format!(
                "Parameter {index} value {value} outside [{}, {}].",
                param.lower, param.upper
            )));
        }
        param.value = value;
        Ok(())
    }

    pub fn set_hold(&mut self, index: usize, hold: bool) {
        self.params[index].hold = hold;
    }

    /// Diffusion coefficient in interface units (µm²/s).
    pub fn diffusion_interface(&self) -> f64 {
        self.params[PARAM_D].value * DIFFUSION_COEFFICIENT_BASE
    }

    /// Values of the free parameters, in stable parameter-index order. This
    /// sub-vector seeds the optimizer.
    pub fn free_parameter_values(&self) -> Vec<f64> {
        self.params
            .iter()
            .filter(|p| !p.hold)
            .map(|p| p.value)
            .collect()
    }

    /// Reconstruct the full parameter vector from optimized free values,
    /// substituting free slots and leaving held slots at their constant.
    pub fn fill_params(&self, free_values: &[f64]) -> [f64; PARAM_COUNT] {
        let mut out = [0.0; PARAM_COUNT];
        let mut cursor = 0;
        for (i, param) in self.params.iter().enumerate() {
            if param.hold {
                out[i] = param.value;
            } else {
                out[i] = free_values[cursor];
                cursor += 1;
            }
        }
        out
    }

    /// Free/fixed mask in parameter-index order (`true` = fitted).
    pub fn parameters_to_fit(&self) -> [bool; PARAM_COUNT] {
        let mut out = [false; PARAM_COUNT];
        for (i, param) in self.params.iter().enumerate() {
            out[i] = !param.hold;
        }
        out
    }

    /// Full current parameter vector (initial guess for a solve).
    pub fn parameter_values(&self) -> [f64; PARAM_COUNT] {
        let mut out = [0.0; PARAM_COUNT];
        for (i, param) in self.params.iter().enumerate() {
            out[i] = param.value;
        }
        out
    }

    /// Current parameter vector as `f32`, the layout the batched engine's
    /// initial-parameter blocks use.
    pub fn f32_parameter_values(&self) -> [f32; PARAM_COUNT] {
        self.parameter_values().map(|v| v as f32)
    }

    /// Box constraints in parameter-index order.
    pub fn bounds(&self) -> [(f64, f64); PARAM_COUNT] {
        let mut out = [(0.0, 0.0); PARAM_COUNT];
        for (i, param) in self.params.iter().enumerate() {
            out[i] = (param.lower, param.upper);
        }
        out
    }

    pub fn free_count(&self) -> usize {
        self.params.iter().filter(|p| !p.hold).count()
    }

    pub fn can_fit(&self) -> bool {
        self.free_count() > 0
    }

    /// Degrees of freedom of the current window:
    /// `(fit_end - fit_start) - free_count - 1`.
    pub fn degrees_of_freedom(&self) -> i64 {
        (self.fit_end - self.fit_start) as i64 - self.free_count() as i64 - 1
    }

    /// Reject structurally invalid configurations before any optimizer call.
    pub fn validate(&self) -> Result<(), FitError> {
        if !self.can_fit() {
            return Err(FitError::config(
                "All parameters are held: nothing to optimize.",
            ));
        }
        if self.fit_start < 1 || self.fit_start >= self.fit_end || self.fit_end >= self.channel_count
        {
            return Err(FitError::config(format!(
                "Fit window [{}, {}] is invalid for {} channels.",
                self.fit_start, self.fit_end, self.channel_count
            )));
        }
        let dof = self.degrees_of_freedom();
        if dof <= 0 {
            return Err(FitError::config(format!(
                "Degrees of freedom must be positive, got {dof} \
                 ({} window channels, {} free parameters).",
                self.fit_end - self.fit_start,
                self.free_count()
            )));
        }
        Ok(())
    }

    /// Warm start: rewrite the stored initial guess from a completed fit so
    /// the next pixel in scan order starts from its neighbour's result. The
    /// engine only calls this when `fix` is `false`.
    pub fn update_parameter_values(&mut self, fitted: &FitParameters) {
        let values = fitted.to_array();
        for (param, value) in self.params.iter_mut().zip(values.iter()) {
            param.value = *value;
        }
    }
}
