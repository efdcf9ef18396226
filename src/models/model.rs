//! Correlation model evaluation for the supported acquisition geometries.
//!
//! All models share the same spatial building block: the correlation of a
//! square (binned-pixel) observation area with itself — or with a laterally
//! shifted copy for cross-correlation — under a Gaussian PSF. Per axis, with
//! `p(τ) = sqrt(4 D τ + w²)`, side length `a` and channel shift `r`:
//!
//! ```text
//! B(p, a, r) = p/√π · [exp(-((a+r)/p)²) + exp(-((a-r)/p)²) - 2·exp(-(r/p)²)]
//!            + (a+r)·erf((a+r)/p) + (a-r)·erf((a-r)/p) - 2r·erf(r/p)
//! ```
//!
//! The full curve is `g(τ) = (1/N) · S(τ) · T(τ) + G` where `S` is the
//! normalized spatial factor (`S(0) = 1` for autocorrelation), and `T` the
//! optional triplet-blinking factor. The light-sheet geometry adds an axial
//! factor `sz / sqrt(sz² + 4 D τ)`.
//!
//! Functions here are pure and stateless: no side effects, no I/O. Non-finite
//! output for in-bounds parameters is a recoverable fit failure upstream, not
//! a panic.

use crate::domain::{
    AcquisitionSettings, GeometryKind, PARAM_COUNT, PARAM_D, PARAM_F_TRIP, PARAM_G, PARAM_N,
    PARAM_T_TRIP, SQRT_PI,
};
use crate::error::FitError;
use crate::math::erf;

/// Per-axis spatial correlation factor `B(p, a, r)`.
pub fn axis_factor(p: f64, a: f64, r: f64) -> f64 {
    let apr = a + r;
    let amr = a - r;
    p / SQRT_PI
        * ((-(apr / p).powi(2)).exp() + (-(amr / p).powi(2)).exp()
            - 2.0 * (-(r / p).powi(2)).exp())
        + apr * erf(apr / p)
        + amr * erf(amr / p)
        - 2.0 * r * erf(r / p)
}

/// Derivative of [`axis_factor`] with respect to `p`. The erf terms cancel
/// against the Gaussian prefactor, leaving only the exponentials.
pub fn axis_factor_dp(p: f64, a: f64, r: f64) -> f64 {
    let apr = a + r;
    let amr = a - r;
    ((-(apr / p).powi(2)).exp() + (-(amr / p).powi(2)).exp() - 2.0 * (-(r / p).powi(2)).exp())
        / SQRT_PI
}

/// Geometry-resolved model shape: the physical lengths a model evaluation
/// needs, precomputed once per (settings, geometry, mode) so that evaluation
/// stays a pure function of `(τ, params)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelShape {
    pub geometry: GeometryKind,
    /// PSF-convention mode within the geometry (e.g. which calibrated waist
    /// applies for the second detection channel).
    pub mode: u8,
    ax: f64,
    ay: f64,
    w: f64,
    sz: f64,
    rx: f64,
    ry: f64,
    /// `B_x(w, ax, 0) · B_y(w, ay, 0)`: the zero-lag autocorrelation spatial
    /// factor used for normalization and the effective area.
    norm: f64,
}

impl ModelShape {
    /// Resolve a geometry id + mode against acquisition settings.
    ///
    /// Mode 0 uses the primary PSF waist; for the single-channel 2D geometry
    /// mode 1 selects the second channel's calibrated waist. Any other mode is
    /// an invalid configuration.
    pub fn new(
        geometry: GeometryKind,
        mode: u8,
        settings: &AcquisitionSettings,
    ) -> Result<Self, FitError> {
        let w = match (geometry, mode) {
            (GeometryKind::Itir2d, 0) | (GeometryKind::Spim3d, 0) | (GeometryKind::DcFccs2d, 0) => {
                settings.param_w()
            }
            (GeometryKind::Itir2d, 1) => settings.param_w2(),
            _ => {
                return Err(FitError::config(format!(
                    "Unknown mode {mode} for model {}.",
                    geometry.display_name()
                )));
            }
        };

        let ax = settings.param_ax();
        let ay = settings.param_ay();
        let sz = settings.param_z();
        if !(ax > 0.0 && ay > 0.0 && w > 0.0) {
            return Err(FitError::config(
                "Observation side lengths and PSF waist must be positive.",
            ));
        }
        if geometry == GeometryKind::Spim3d && sz <= 0.0 {
            return Err(FitError::config("Light-sheet thickness must be positive."));
        }

        let (rx, ry) = match geometry {
            GeometryKind::DcFccs2d => (settings.param_rx(), settings.param_ry()),
            _ => (0.0, 0.0),
        };

        let norm = axis_factor(w, ax, 0.0) * axis_factor(w, ay, 0.0);

        Ok(ModelShape {
            geometry,
            mode,
            ax,
            ay,
            w,
            sz,
            rx,
            ry,
            norm,
        })
    }

    /// Effective observation area in m²: `4·ax²·ay² / (Bx(0)·By(0))`.
    ///
    /// Reduces to the pixel area `ax·ay` as the PSF waist goes to zero and
    /// grows with PSF broadening; the diffusion law plots diffusion time
    /// against this area.
    pub fn observation_area(&self) -> f64 {
        4.0 * self.ax * self.ax * self.ay * self.ay / self.norm
    }
}

fn triplet(tau: f64, f_trip: f64, t_trip: f64) -> (f64, f64, f64) {
    if t_trip <= 0.0 {
        return (1.0, 0.0, 0.0);
    }
    let e = (-tau / t_trip).exp();
    let one_minus = 1.0 - f_trip;
    let factor = 1.0 + f_trip / one_minus * e;
    let d_f = e / (one_minus * one_minus);
    let d_t = f_trip / one_minus * e * tau / (t_trip * t_trip);
    (factor, d_f, d_t)
}

/// Evaluate the correlation model at lag time `tau`.
pub fn evaluate(shape: &ModelShape, tau: f64, params: &[f64; PARAM_COUNT]) -> f64 {
    evaluate_with_gradient(shape, tau, params).0
}

/// Evaluate the model and its analytic partial derivatives with respect to
/// the full parameter vector `[N, D, G, f_trip, t_trip]`.
pub fn evaluate_with_gradient(
    shape: &ModelShape,
    tau: f64,
    params: &[f64; PARAM_COUNT],
) -> (f64, [f64; PARAM_COUNT]) {
    let n = params[PARAM_N];
    let d = params[PARAM_D];
    let g = params[PARAM_G];

    let p = (4.0 * d * tau + shape.w * shape.w).sqrt();
    let bx = axis_factor(p, shape.ax, shape.rx);
    let by = axis_factor(p, shape.ay, shape.ry);
    // dp/dD = 2τ/p.
    let dp_dd = 2.0 * tau / p;
    let mut spatial = bx * by / shape.norm;
    let mut d_spatial_dd =
        (axis_factor_dp(p, shape.ax, shape.rx) * by + bx * axis_factor_dp(p, shape.ay, shape.ry))
            * dp_dd
            / shape.norm;

    if shape.geometry == GeometryKind::Spim3d {
        let q2 = shape.sz * shape.sz + 4.0 * d * tau;
        let gz = shape.sz / q2.sqrt();
        d_spatial_dd = d_spatial_dd * gz + spatial * gz * (-2.0 * tau / q2);
        spatial *= gz;
    }

    let (trip, d_trip_df, d_trip_dt) = triplet(tau, params[PARAM_F_TRIP], params[PARAM_T_TRIP]);

    let value = spatial * trip / n + g;

    let mut gradient = [0.0; PARAM_COUNT];
    gradient[PARAM_N] = -spatial * trip / (n * n);
    gradient[PARAM_D] = d_spatial_dd * trip / n;
    gradient[PARAM_G] = 1.0;
    gradient[PARAM_F_TRIP] = spatial * d_trip_df / n;
    gradient[PARAM_T_TRIP] = spatial * d_trip_dt / n;

    (value, gradient)
}
