//! Batched fitting engine.
//!
//! Mirrors the calling convention of data-parallel fitting libraries: the
//! caller sizes flat `f32` buffers up front (curve data, optional weights,
//! per-slot initial parameter blocks, a shared lag-time block), then submits
//! the whole batch in one call. Every slot carries its own terminal status,
//! chi-square and iteration count; one slot failing to converge never affects
//! its neighbours.
//!
//! Buffer validation is fail-fast: any size or content mismatch rejects the
//! entire batch as a [`FitError::BatchSubmission`] before a single slot runs.

use rayon::prelude::*;

use crate::domain::PARAM_COUNT;
use crate::error::FitError;
use crate::math::{LmSettings, SolveState, minimize};
use crate::models::{ModelShape, evaluate_with_gradient};

/// Default per-slot convergence tolerance.
pub const DEFAULT_TOLERANCE: f32 = 1e-4;
/// Default per-slot iteration cap. The batched path trades solve depth for
/// throughput; the per-pixel engine carries the deep budget.
pub const DEFAULT_MAX_ITERATIONS: usize = 25;

/// Objective estimator for the batched engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Estimator {
    /// Weighted least squares.
    #[default]
    Lse,
    /// Maximum likelihood for Poisson counts. Not available on this backend;
    /// selecting it is rejected at submission time.
    Mle,
}

/// Pre-sized buffers plus solver settings for one batch submission.
pub struct BatchFitBuffers {
    shape: ModelShape,
    number_fits: usize,
    number_points: usize,
    /// Curve data, `number_fits * number_points`, slot-major.
    pub data: Vec<f32>,
    /// Per-point variances aligned to `data`; `None` runs unweighted.
    pub weights: Option<Vec<f32>>,
    /// Initial parameter blocks, `number_fits * PARAM_COUNT`, slot-major.
    pub initial_parameters: Vec<f32>,
    /// Lag times shared by every slot; must hold `number_points` entries at
    /// submission.
    pub user_info: Vec<f32>,
    tolerance: f32,
    max_iterations: usize,
    parameters_to_fit: [bool; PARAM_COUNT],
    estimator: Estimator,
}

/// Per-slot results of one batch run, slot-major like the inputs.
#[derive(Debug, Clone)]
pub struct BatchFitOutput {
    /// Fitted parameter blocks, `number_fits * PARAM_COUNT`.
    pub parameters: Vec<f32>,
    /// Terminal state per slot.
    pub states: Vec<SolveState>,
    /// Weighted sum of squared residuals per slot (not reduced by dof).
    pub chi_squares: Vec<f32>,
    pub iterations: Vec<u32>,
}

impl BatchFitBuffers {
    /// Allocate zeroed buffers for `number_fits` curves of `number_points`
    /// channels each. `None` settings fall back to the engine defaults:
    /// tolerance 1e-4, 25 iterations, all parameters free, LSE estimator.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        number_fits: usize,
        number_points: usize,
        with_weights: bool,
        shape: ModelShape,
        tolerance: Option<f32>,
        max_iterations: Option<usize>,
        parameters_to_fit: Option<[bool; PARAM_COUNT]>,
        estimator: Option<Estimator>,
    ) -> Result<Self, FitError> {
        if number_fits == 0 || number_points == 0 {
            return Err(FitError::batch(format!(
                "Batch dimensions must be positive, got {number_fits} fits x {number_points} points."
            )));
        }
        let tolerance = tolerance.unwrap_or(DEFAULT_TOLERANCE);
        if !tolerance.is_finite() || tolerance <= 0.0 {
            return Err(FitError::batch(format!(
                "Tolerance must be positive and finite, got {tolerance}."
            )));
        }
        let max_iterations = max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS);
        if max_iterations == 0 {
            return Err(FitError::batch("Iteration cap must be at least 1."));
        }
        let parameters_to_fit = parameters_to_fit.unwrap_or([true; PARAM_COUNT]);
        if parameters_to_fit.iter().all(|&f| !f) {
            return Err(FitError::batch(
                "The shared free-parameter mask holds every parameter.",
            ));
        }

        Ok(BatchFitBuffers {
            shape,
            number_fits,
            number_points,
            data: vec![0.0; number_fits * number_points],
            weights: with_weights.then(|| vec![0.0; number_fits * number_points]),
            initial_parameters: vec![0.0; number_fits * PARAM_COUNT],
            user_info: Vec::new(),
            tolerance,
            max_iterations,
            parameters_to_fit,
            estimator: estimator.unwrap_or_default(),
        })
    }

    pub fn number_fits(&self) -> usize {
        self.number_fits
    }

    pub fn number_points(&self) -> usize {
        self.number_points
    }

    pub fn tolerance(&self) -> f32 {
        self.tolerance
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub fn parameters_to_fit(&self) -> &[bool; PARAM_COUNT] {
        &self.parameters_to_fit
    }

    /// Copy one slot's initial parameter block into place.
    pub fn set_initial_parameters(&mut self, slot: usize, params: &[f32; PARAM_COUNT]) {
        let offset = slot * PARAM_COUNT;
        self.initial_parameters[offset..offset + PARAM_COUNT].copy_from_slice(params);
    }

    /// Copy one slot's curve (and optionally its variances) into place.
    pub fn set_data(&mut self, slot: usize, curve: &[f32], variances: Option<&[f32]>) {
        let offset = slot * self.number_points;
        self.data[offset..offset + self.number_points].copy_from_slice(curve);
        if let (Some(weights), Some(variances)) = (self.weights.as_mut(), variances) {
            weights[offset..offset + self.number_points].copy_from_slice(variances);
        }
    }

    fn validate(&self) -> Result<(), FitError> {
        let expected = self.number_fits * self.number_points;
        if self.data.len() != expected {
            return Err(FitError::batch(format!(
                "Data buffer holds {} values, expected {expected}.",
                self.data.len()
            )));
        }
        if let Some(weights) = &self.weights {
            if weights.len() != expected {
                return Err(FitError::batch(format!(
                    "Weight buffer holds {} values, expected {expected}.",
                    weights.len()
                )));
            }
            if weights.iter().any(|w| !w.is_finite() || *w <= 0.0) {
                return Err(FitError::batch(
                    "Weight buffer contains non-positive or non-finite variances.",
                ));
            }
        }
        let expected_params = self.number_fits * PARAM_COUNT;
        if self.initial_parameters.len() != expected_params {
            return Err(FitError::batch(format!(
                "Initial-parameter buffer holds {} values, expected {expected_params}.",
                self.initial_parameters.len()
            )));
        }
        if self.user_info.len() != self.number_points {
            return Err(FitError::batch(format!(
                "Lag-time block holds {} values, expected {}.",
                self.user_info.len(),
                self.number_points
            )));
        }
        if self.user_info.iter().any(|t| !t.is_finite()) {
            return Err(FitError::batch("Lag-time block contains non-finite values."));
        }
        if self.estimator == Estimator::Mle {
            return Err(FitError::batch(
                "The MLE estimator is not available on this backend; use LSE.",
            ));
        }
        Ok(())
    }

    /// Run every slot. Slots execute independently in parallel; per-slot
    /// failures surface through [`SolveState`], never as an error.
    pub fn run(&self) -> Result<BatchFitOutput, FitError> {
        self.validate()?;

        let lags: Vec<f64> = self.user_info.iter().map(|&t| t as f64).collect();
        let settings = LmSettings::batched(self.tolerance as f64, self.max_iterations);
        let bounds = [(f64::NEG_INFINITY, f64::INFINITY); PARAM_COUNT];

        let slots: Vec<(LmOutcomeLite, [f64; PARAM_COUNT])> = (0..self.number_fits)
            .into_par_iter()
            .map(|slot| {
                let data_offset = slot * self.number_points;
                let y: Vec<f64> = self.data[data_offset..data_offset + self.number_points]
                    .iter()
                    .map(|&v| v as f64)
                    .collect();
                let weights: Vec<f64> = match &self.weights {
                    Some(variances) => variances[data_offset..data_offset + self.number_points]
                        .iter()
                        .map(|&v| 1.0 / v as f64)
                        .collect(),
                    None => vec![1.0; self.number_points],
                };
                let param_offset = slot * PARAM_COUNT;
                let mut initial = [0.0; PARAM_COUNT];
                for (i, v) in self.initial_parameters[param_offset..param_offset + PARAM_COUNT]
                    .iter()
                    .enumerate()
                {
                    initial[i] = *v as f64;
                }

                let outcome = minimize(
                    |tau, params| evaluate_with_gradient(&self.shape, tau, params),
                    &lags,
                    &y,
                    &weights,
                    initial,
                    &self.parameters_to_fit,
                    &bounds,
                    &settings,
                )?;
                Ok((
                    LmOutcomeLite {
                        state: outcome.state,
                        chi_square: outcome.chi_square,
                        iterations: outcome.iterations,
                    },
                    outcome.params,
                ))
            })
            .collect::<Result<_, FitError>>()?;

        let mut output = BatchFitOutput {
            parameters: Vec::with_capacity(self.number_fits * PARAM_COUNT),
            states: Vec::with_capacity(self.number_fits),
            chi_squares: Vec::with_capacity(self.number_fits),
            iterations: Vec::with_capacity(self.number_fits),
        };
        for (lite, params) in slots {
            output.parameters.extend(params.iter().map(|&p| p as f32));
            output.states.push(lite.state);
            output.chi_squares.push(lite.chi_square as f32);
            output.iterations.push(lite.iterations as u32);
        }
        Ok(output)
    }
}

struct LmOutcomeLite {
    state: SolveState,
    chi_square: f64,
    iterations: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AcquisitionSettings, GeometryKind, PARAM_D, PARAM_G, PARAM_N};
    use crate::models::evaluate;

    const POINTS: usize = 48;

    fn shape() -> ModelShape {
        ModelShape::new(GeometryKind::Itir2d, 0, &AcquisitionSettings::default()).unwrap()
    }

    fn lag_times() -> Vec<f32> {
        (0..POINTS).map(|i| i as f32 * 1e-3).collect()
    }

    fn curve(shape: &ModelShape, lags: &[f32], n: f64, d: f64) -> Vec<f32> {
        let mut params = [0.0; PARAM_COUNT];
        params[PARAM_N] = n;
        params[PARAM_D] = d;
        params[PARAM_G] = 0.001;
        lags.iter()
            .map(|&tau| evaluate(shape, tau as f64, &params) as f32)
            .collect()
    }

    fn initial_guess() -> [f32; PARAM_COUNT] {
        let mut p = [0.0; PARAM_COUNT];
        p[PARAM_N] = 1.0;
        p[PARAM_D] = 1e-12;
        p
    }

    #[test]
    fn defaults_match_the_batched_convention() {
        let buffers =
            BatchFitBuffers::new(4, POINTS, false, shape(), None, None, None, None).unwrap();
        assert_eq!(buffers.tolerance(), 1e-4);
        assert_eq!(buffers.max_iterations(), 25);
        assert!(buffers.parameters_to_fit().iter().all(|&f| f));
        assert_eq!(buffers.data.len(), 4 * POINTS);
        assert!(buffers.weights.is_none());
        assert_eq!(buffers.initial_parameters.len(), 4 * PARAM_COUNT);
    }

    #[test]
    fn size_mismatch_rejects_the_whole_batch() {
        let mut buffers =
            BatchFitBuffers::new(2, POINTS, false, shape(), None, None, None, None).unwrap();
        buffers.user_info = lag_times();
        buffers.data.pop();
        let err = buffers.run().unwrap_err();
        assert!(matches!(err, FitError::BatchSubmission(_)));
    }

    #[test]
    fn missing_lag_block_rejects_the_whole_batch() {
        let buffers =
            BatchFitBuffers::new(2, POINTS, false, shape(), None, None, None, None).unwrap();
        let err = buffers.run().unwrap_err();
        assert!(matches!(err, FitError::BatchSubmission(_)));
    }

    #[test]
    fn mle_estimator_is_rejected() {
        let mut buffers = BatchFitBuffers::new(
            1,
            POINTS,
            false,
            shape(),
            None,
            None,
            None,
            Some(Estimator::Mle),
        )
        .unwrap();
        buffers.user_info = lag_times();
        let err = buffers.run().unwrap_err();
        assert!(matches!(err, FitError::BatchSubmission(_)));
    }

    #[test]
    fn slots_succeed_and_fail_independently() {
        let shape = shape();
        let lags = lag_times();
        let fits = 100;
        let mut buffers = BatchFitBuffers::new(
            fits,
            POINTS,
            false,
            shape.clone(),
            None,
            Some(200),
            None,
            None,
        )
        .unwrap();
        buffers.user_info = lags.clone();
        for slot in 0..fits {
            let n = 1.0 + slot as f64 * 0.05;
            buffers.set_data(slot, &curve(&shape, &lags, n, 5e-13), None);
            buffers.set_initial_parameters(slot, &initial_guess());
        }
        // Poison one slot with non-finite data.
        let poisoned = 7;
        buffers.data[poisoned * POINTS + 3] = f32::NAN;

        let output = buffers.run().unwrap();
        assert_eq!(output.states.len(), fits);
        assert_eq!(output.parameters.len(), fits * PARAM_COUNT);
        assert_eq!(output.states[poisoned], SolveState::ModelNonFinite);
        assert!(output.chi_squares[poisoned].is_infinite());
        for slot in 0..fits {
            if slot == poisoned {
                continue;
            }
            assert_ne!(output.states[slot], SolveState::ModelNonFinite, "slot {slot}");
            let n = output.parameters[slot * PARAM_COUNT + PARAM_N];
            let expected = 1.0 + slot as f32 * 0.05;
            assert!(
                (n - expected).abs() / expected < 1e-2,
                "slot {slot}: n = {n}, expected {expected}"
            );
        }
    }

    #[test]
    fn shared_mask_holds_parameters_in_every_slot() {
        let shape = shape();
        let lags = lag_times();
        let mut mask = [true; PARAM_COUNT];
        mask[PARAM_D] = false;
        let mut buffers = BatchFitBuffers::new(
            3,
            POINTS,
            false,
            shape.clone(),
            None,
            Some(200),
            Some(mask),
            None,
        )
        .unwrap();
        buffers.user_info = lags.clone();
        let mut guess = initial_guess();
        guess[PARAM_D] = 4e-13;
        for slot in 0..3 {
            buffers.set_data(slot, &curve(&shape, &lags, 2.0, 5e-13), None);
            buffers.set_initial_parameters(slot, &guess);
        }

        let output = buffers.run().unwrap();
        for slot in 0..3 {
            let d = output.parameters[slot * PARAM_COUNT + PARAM_D];
            assert_eq!(d, 4e-13, "slot {slot}");
        }
    }
}
