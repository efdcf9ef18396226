//! Levenberg–Marquardt nonlinear least-squares core.
//!
//! Given observations `(x_i, y_i)` with weights `w_i` and a model with
//! analytic gradients, we minimize `Σ w_i (y_i - f(x_i, θ))²` over the *free*
//! entries of the full parameter vector; held entries stay at their configured
//! constant for the entire iteration, not merely at initialization.
//!
//! The iteration/tolerance budget is an explicit settings struct passed per
//! invocation, so the per-pixel engine and the batched engine can be tuned
//! independently and deterministically in tests.

use nalgebra::{DMatrix, DVector};

use crate::domain::PARAM_COUNT;
use crate::error::FitError;

/// Damping factor above which the step size has effectively collapsed.
const LAMBDA_CEILING: f64 = 1e10;

/// Tuning knobs for one Levenberg–Marquardt solve.
#[derive(Debug, Clone)]
pub struct LmSettings {
    /// Maximum accepted-or-rejected iterations.
    pub max_iterations: usize,
    /// Maximum objective evaluations.
    pub max_evaluations: usize,
    /// Relative chi-square decrease below which an accepted step counts as
    /// converged.
    pub tolerance: f64,
    /// Initial damping parameter.
    pub initial_lambda: f64,
    /// Factor applied to lambda on a rejected step.
    pub lambda_up: f64,
    /// Factor applied to lambda on an accepted step.
    pub lambda_down: f64,
}

impl Default for LmSettings {
    /// Per-pixel defaults: a deep 2000/2000 iteration/evaluation budget.
    fn default() -> Self {
        LmSettings {
            max_iterations: 2000,
            max_evaluations: 2000,
            tolerance: 1e-10,
            initial_lambda: 1e-3,
            lambda_up: 10.0,
            lambda_down: 0.1,
        }
    }
}

impl LmSettings {
    /// Throughput-oriented settings used per slot by the batched engine.
    pub fn batched(tolerance: f64, max_iterations: usize) -> Self {
        LmSettings {
            max_iterations,
            max_evaluations: 2 * max_iterations,
            tolerance,
            ..LmSettings::default()
        }
    }
}

/// Terminal state of one solve, aligned with the status codes the batched
/// engine reports per fit slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SolveState {
    /// Tolerance met within the budget.
    Converged,
    /// Budget exhausted, or the damped step collapsed before the tolerance
    /// was met; the best point found is still returned.
    MaxIteration,
    /// The damped normal equations stayed unsolvable.
    SingularHessian,
    /// The model was non-finite at the initial point. Recoverable: the caller
    /// records the pixel as unfitted and moves on.
    ModelNonFinite,
}

/// Result of one solve. Always carries the best point found, whatever the
/// terminal state.
#[derive(Debug, Clone)]
pub struct LmOutcome {
    /// Full parameter vector (free entries optimized, held entries untouched).
    pub params: [f64; PARAM_COUNT],
    /// Weighted sum of squared residuals at `params`.
    pub chi_square: f64,
    pub iterations: usize,
    pub evaluations: usize,
    pub state: SolveState,
}

impl LmOutcome {
    pub fn converged(&self) -> bool {
        self.state == SolveState::Converged
    }
}

fn clamp_params(params: &mut [f64; PARAM_COUNT], bounds: &[(f64, f64); PARAM_COUNT]) {
    for (p, &(lo, hi)) in params.iter_mut().zip(bounds.iter()) {
        *p = p.clamp(lo, hi);
    }
}

fn chi_square<F>(eval: &F, x: &[f64], y: &[f64], w: &[f64], params: &[f64; PARAM_COUNT]) -> Option<f64>
where
    F: Fn(f64, &[f64; PARAM_COUNT]) -> (f64, [f64; PARAM_COUNT]),
{
    let mut sum = 0.0;
    for i in 0..x.len() {
        let (value, _) = eval(x[i], params);
        if !value.is_finite() {
            return None;
        }
        let r = y[i] - value;
        sum += w[i] * r * r;
    }
    sum.is_finite().then_some(sum)
}

/// Minimize the weighted least-squares objective over the free parameters.
///
/// `eval` maps `(x, full_params)` to `(value, gradient)` where the gradient is
/// taken with respect to the *full* vector; the solver selects the free
/// entries itself. Candidate steps are clamped into `bounds` before
/// evaluation, which keeps physical parameters non-negative throughout.
///
/// Errors only on structurally invalid input (empty or mismatched
/// observations, non-positive weights, no free parameters). Non-convergence
/// and non-finite model values are reported through [`SolveState`].
pub fn minimize<F>(
    eval: F,
    x: &[f64],
    y: &[f64],
    weights: &[f64],
    initial: [f64; PARAM_COUNT],
    free: &[bool; PARAM_COUNT],
    bounds: &[(f64, f64); PARAM_COUNT],
    settings: &LmSettings,
) -> Result<LmOutcome, FitError>
where
    F: Fn(f64, &[f64; PARAM_COUNT]) -> (f64, [f64; PARAM_COUNT]),
{
    let n = x.len();
    if n == 0 || y.len() != n || weights.len() != n {
        return Err(FitError::config(format!(
            "Observation arrays are empty or mismatched: x={}, y={}, w={}.",
            n,
            y.len(),
            weights.len()
        )));
    }
    if weights.iter().any(|w| !w.is_finite() || *w <= 0.0) {
        return Err(FitError::config("Observation weights must be positive and finite."));
    }
    let free_idx: Vec<usize> = (0..PARAM_COUNT).filter(|&i| free[i]).collect();
    if free_idx.is_empty() {
        return Err(FitError::config("No free parameters: nothing to optimize."));
    }
    let n_free = free_idx.len();

    let mut params = initial;
    clamp_params(&mut params, bounds);

    let mut evaluations = 1;
    let Some(mut chi2) = chi_square(&eval, x, y, weights, &params) else {
        return Ok(LmOutcome {
            params,
            chi_square: f64::INFINITY,
            iterations: 0,
            evaluations,
            state: SolveState::ModelNonFinite,
        });
    };

    let mut lambda = settings.initial_lambda;
    let mut iterations = 0;
    let mut state = SolveState::MaxIteration;

    while iterations < settings.max_iterations {
        iterations += 1;

        // Accumulate the weighted normal equations J^T W J and J^T W r over
        // the free parameter subset.
        let mut jtj = DMatrix::<f64>::zeros(n_free, n_free);
        let mut jtr = DVector::<f64>::zeros(n_free);
        for i in 0..n {
            let (value, gradient) = eval(x[i], &params);
            if !value.is_finite() {
                // The current point went non-finite through a gradient
                // evaluation; treat like an unsolvable step.
                state = SolveState::ModelNonFinite;
                break;
            }
            let r = y[i] - value;
            let w = weights[i];
            for (a, &pa) in free_idx.iter().enumerate() {
                let ga = gradient[pa];
                jtr[a] += w * ga * r;
                for (b, &pb) in free_idx.iter().enumerate().skip(a) {
                    jtj[(a, b)] += w * ga * gradient[pb];
                }
            }
        }
        if state == SolveState::ModelNonFinite {
            break;
        }
        // Mirror the upper triangle.
        for a in 1..n_free {
            for b in 0..a {
                jtj[(a, b)] = jtj[(b, a)];
            }
        }

        let mut damped = jtj.clone();
        for a in 0..n_free {
            let d = damped[(a, a)] * (1.0 + lambda);
            // A free parameter the model is currently insensitive to (zero
            // gradient at every observation) leaves an all-zero row; a
            // neutral diagonal keeps the factorization regular and its step
            // exactly zero.
            damped[(a, a)] = if d > 0.0 { d } else { 1.0 };
        }

        let Some(delta) = damped.lu().solve(&jtr) else {
            lambda *= settings.lambda_up;
            if lambda > LAMBDA_CEILING {
                state = SolveState::SingularHessian;
                break;
            }
            continue;
        };

        let mut candidate = params;
        for (a, &pa) in free_idx.iter().enumerate() {
            candidate[pa] += delta[a];
        }
        clamp_params(&mut candidate, bounds);

        if evaluations >= settings.max_evaluations {
            break;
        }
        evaluations += 1;
        let Some(new_chi2) = chi_square(&eval, x, y, weights, &candidate) else {
            // Non-finite candidate: shrink the step and retry.
            lambda *= settings.lambda_up;
            if lambda > LAMBDA_CEILING {
                state = SolveState::SingularHessian;
                break;
            }
            continue;
        };

        if new_chi2 <= chi2 {
            let relative_drop = (chi2 - new_chi2) / chi2.max(f64::MIN_POSITIVE);
            params = candidate;
            chi2 = new_chi2;
            lambda *= settings.lambda_down;
            if relative_drop < settings.tolerance {
                state = SolveState::Converged;
                break;
            }
        } else {
            lambda *= settings.lambda_up;
            if lambda > LAMBDA_CEILING {
                // The damped step collapsed without meeting the tolerance;
                // keep the budget state so callers thresholding on
                // convergence see the stall.
                break;
            }
        }
    }

    Ok(LmOutcome {
        params,
        chi_square: chi2,
        iterations,
        evaluations,
        state,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // Simple exponential-decay test model: f(x) = p0 * exp(-x / p1) + p2.
    // The remaining two parameter slots are unused and held.
    fn eval(x: f64, p: &[f64; PARAM_COUNT]) -> (f64, [f64; PARAM_COUNT]) {
        let e = (-x / p[1]).exp();
        let value = p[0] * e + p[2];
        let mut grad = [0.0; PARAM_COUNT];
        grad[0] = e;
        grad[1] = p[0] * e * x / (p[1] * p[1]);
        grad[2] = 1.0;
        (value, grad)
    }

    fn open_bounds() -> [(f64, f64); PARAM_COUNT] {
        [(f64::NEG_INFINITY, f64::INFINITY); PARAM_COUNT]
    }

    #[test]
    fn recovers_exponential_parameters() {
        let truth = [2.0, 1.5, 0.3, 0.0, 0.0];
        let x: Vec<f64> = (0..50).map(|i| i as f64 * 0.1).collect();
        let y: Vec<f64> = x.iter().map(|&xi| eval(xi, &truth).0).collect();
        let w = vec![1.0; x.len()];

        let initial = [1.0, 1.0, 0.0, 0.0, 0.0];
        let free = [true, true, true, false, false];
        let outcome = minimize(eval, &x, &y, &w, initial, &free, &open_bounds(), &LmSettings::default())
            .unwrap();

        assert!(outcome.converged(), "state = {:?}", outcome.state);
        assert!((outcome.params[0] - 2.0).abs() < 1e-6);
        assert!((outcome.params[1] - 1.5).abs() < 1e-6);
        assert!((outcome.params[2] - 0.3).abs() < 1e-6);
        assert!(outcome.chi_square < 1e-12);
    }

    #[test]
    fn held_parameters_never_move() {
        let truth = [2.0, 1.5, 0.3, 0.0, 0.0];
        let x: Vec<f64> = (0..50).map(|i| i as f64 * 0.1).collect();
        let y: Vec<f64> = x.iter().map(|&xi| eval(xi, &truth).0).collect();
        let w = vec![1.0; x.len()];

        // Hold the decay time at a wrong value; it must stay there.
        let initial = [1.0, 2.5, 0.0, 0.0, 0.0];
        let free = [true, false, true, false, false];
        let outcome = minimize(eval, &x, &y, &w, initial, &free, &open_bounds(), &LmSettings::default())
            .unwrap();

        assert_eq!(outcome.params[1], 2.5);
    }

    #[test]
    fn bounds_clamp_candidate_steps() {
        let truth = [2.0, 1.5, -0.3, 0.0, 0.0];
        let x: Vec<f64> = (0..50).map(|i| i as f64 * 0.1).collect();
        let y: Vec<f64> = x.iter().map(|&xi| eval(xi, &truth).0).collect();
        let w = vec![1.0; x.len()];

        let mut bounds = open_bounds();
        bounds[2] = (0.0, f64::INFINITY);
        let initial = [1.0, 1.0, 0.5, 0.0, 0.0];
        let free = [true, true, true, false, false];
        let outcome =
            minimize(eval, &x, &y, &w, initial, &free, &bounds, &LmSettings::default()).unwrap();

        // The true offset is negative, so the bounded solve pins it at zero.
        assert!(outcome.params[2] >= 0.0);
    }

    #[test]
    fn no_free_parameters_is_a_configuration_error() {
        let x = [0.0, 1.0];
        let y = [1.0, 2.0];
        let w = [1.0, 1.0];
        let free = [false; PARAM_COUNT];
        let err = minimize(
            eval,
            &x,
            &y,
            &w,
            [1.0; PARAM_COUNT],
            &free,
            &open_bounds(),
            &LmSettings::default(),
        )
        .unwrap_err();
        assert!(matches!(err, FitError::InvalidConfiguration(_)));
    }

    #[test]
    fn collapsed_step_is_not_reported_as_converged() {
        // A model whose reported gradient has the wrong sign: every proposed
        // step increases chi-square, so the solver keeps rejecting until the
        // damping overflows. The stall must not be labelled as convergence.
        fn misleading(_x: f64, p: &[f64; PARAM_COUNT]) -> (f64, [f64; PARAM_COUNT]) {
            let mut grad = [0.0; PARAM_COUNT];
            grad[0] = -1.0;
            (p[0], grad)
        }

        let x = [0.0, 1.0, 2.0];
        let y = [0.0, 0.0, 0.0];
        let w = [1.0, 1.0, 1.0];
        let mut initial = [0.0; PARAM_COUNT];
        initial[0] = 1.0;
        let mut free = [false; PARAM_COUNT];
        free[0] = true;

        let outcome = minimize(
            misleading,
            &x,
            &y,
            &w,
            initial,
            &free,
            &open_bounds(),
            &LmSettings::default(),
        )
        .unwrap();

        assert_eq!(outcome.state, SolveState::MaxIteration);
        assert!(!outcome.converged());
        // The best point found is the starting point.
        assert_eq!(outcome.params[0], 1.0);
        assert!(outcome.chi_square.is_finite());
        assert!(outcome.iterations < LmSettings::default().max_iterations);
    }

    #[test]
    fn iteration_budget_returns_best_point_without_error() {
        let truth = [2.0, 1.5, 0.3, 0.0, 0.0];
        let x: Vec<f64> = (0..50).map(|i| i as f64 * 0.1).collect();
        let y: Vec<f64> = x.iter().map(|&xi| eval(xi, &truth).0).collect();
        let w = vec![1.0; x.len()];

        let settings = LmSettings {
            max_iterations: 2,
            max_evaluations: 3,
            ..LmSettings::default()
        };
        let initial = [1.0, 1.0, 0.0, 0.0, 0.0];
        let free = [true, true, true, false, false];
        let outcome = minimize(eval, &x, &y, &w, initial, &free, &open_bounds(), &settings).unwrap();

        assert_eq!(outcome.state, SolveState::MaxIteration);
        assert!(outcome.chi_square.is_finite());
    }
}
