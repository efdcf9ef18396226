//! Shared domain types.
//!
//! These types are intentionally kept lightweight and serializable so they can be:
//!
//! - used in-memory during fitting
//! - exported alongside analysis results
//! - reloaded later for plotting or comparisons

use serde::{Deserialize, Serialize};

/// Internal diffusion coefficients are kept in m²/s; interface values and
/// diffusion-law outputs are in µm²/s.
pub const DIFFUSION_COEFFICIENT_BASE: f64 = 1e12;

/// Conversion between metres (internal) and micrometres (interface).
pub const PIXEL_SIZE_REAL_SPACE_CONVERSION_FACTOR: f64 = 1e6;

/// Refractive index of water (aqueous imaging medium).
pub const REFRACTIVE_INDEX: f64 = 1.3333;

pub const SQRT_PI: f64 = 1.772_453_850_905_516;

/// Acquisition geometry the correlation curves were recorded with.
///
/// Each variant selects a distinct analytic model function; the set is closed
/// so model dispatch is exhaustively checkable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GeometryKind {
    /// Single-channel camera-based total internal reflection FCS (2D).
    Itir2d,
    /// Single-plane illumination (light-sheet) FCS with an axial factor (3D).
    Spim3d,
    /// Dual-channel cross-correlation between laterally shifted observation
    /// areas (2D).
    DcFccs2d,
}

impl GeometryKind {
    /// Human-readable label matching the acquisition-software naming.
    pub fn display_name(self) -> &'static str {
        match self {
            GeometryKind::Itir2d => "ITIR-FCS (2D)",
            GeometryKind::Spim3d => "SPIM-FCS (3D)",
            GeometryKind::DcFccs2d => "DC-FCCS (2D)",
        }
    }
}

/// Number of entries in the full fit parameter vector.
pub const PARAM_COUNT: usize = 5;

/// Indices into the full parameter vector. The order is fixed: it defines the
/// layout of initial-parameter blocks in the batched engine and the meaning of
/// the free/fixed mask.
pub const PARAM_N: usize = 0;
pub const PARAM_D: usize = 1;
pub const PARAM_G: usize = 2;
pub const PARAM_F_TRIP: usize = 3;
pub const PARAM_T_TRIP: usize = 4;

/// Named view of a full parameter vector, produced as the output of a fit.
///
/// Units: `d` is in m²/s (multiply by [`DIFFUSION_COEFFICIENT_BASE`] for
/// µm²/s), `t_trip` in seconds, the rest dimensionless.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitParameters {
    /// Particle number in the effective observation area.
    pub n: f64,
    /// Diffusion coefficient.
    pub d: f64,
    /// Convergence offset of the correlation curve at large lag times.
    pub g: f64,
    /// Triplet-blinking fraction (0 disables the triplet factor).
    pub f_trip: f64,
    /// Triplet-blinking relaxation time.
    pub t_trip: f64,
}

impl FitParameters {
    pub fn from_array(params: &[f64; PARAM_COUNT]) -> Self {
        FitParameters {
            n: params[PARAM_N],
            d: params[PARAM_D],
            g: params[PARAM_G],
            f_trip: params[PARAM_F_TRIP],
            t_trip: params[PARAM_T_TRIP],
        }
    }

    pub fn to_array(self) -> [f64; PARAM_COUNT] {
        let mut out = [0.0; PARAM_COUNT];
        out[PARAM_N] = self.n;
        out[PARAM_D] = self.d;
        out[PARAM_G] = self.g;
        out[PARAM_F_TRIP] = self.f_trip;
        out[PARAM_T_TRIP] = self.t_trip;
        out
    }
}

/// One pixel's observed correlation curve, aligned to the shared lag time
/// series. Produced by the external correlator; read-only to the engines.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelSample {
    /// Auto- or cross-correlation value per lag channel.
    pub acf: Vec<f64>,
    /// Variance of the correlation estimate per lag channel. The CPU engine
    /// weights observations by `1 / variance`.
    pub variance: Vec<f64>,
}

/// Fit output for one pixel.
///
/// Created empty, filled exactly once per fit attempt. The fitted curve and
/// residuals span *all* channels; entries outside the fit window are zero
/// because those channels were never part of the objective.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PixelResult {
    pub fitted: bool,
    pub fitted_acf: Vec<f64>,
    pub residuals: Vec<f64>,
    /// Chi-square normalized by degrees of freedom over the fit window.
    pub chi2: f64,
    pub params: Option<FitParameters>,
    /// Iterations the optimizer spent on this pixel.
    pub iterations: usize,
    /// Whether the optimizer met its tolerance within the iteration budget.
    /// `false` still carries the best point found.
    pub converged: bool,
}

impl PixelResult {
    pub fn empty(channel_count: usize) -> Self {
        PixelResult {
            fitted: false,
            fitted_acf: vec![0.0; channel_count],
            residuals: vec![0.0; channel_count],
            chi2: 0.0,
            params: None,
            iterations: 0,
            converged: false,
        }
    }
}

/// Physical acquisition settings from which the model shape parameters
/// (observation-area side lengths, PSF waists, channel offsets) are derived.
///
/// All lengths are in metres, times in seconds. Spatial binning widens the
/// effective per-pixel observation side length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionSettings {
    /// Physical camera pixel pitch.
    pub pixel_size: f64,
    /// Total optical magnification.
    pub magnification: f64,
    /// Numerical aperture of the objective.
    pub na: f64,
    /// Emission wavelength.
    pub em_lambda: f64,
    /// Lateral PSF calibration factor (dimensionless `sigma`).
    pub psf_sigma: f64,
    /// Lateral PSF calibration factor of the second channel.
    pub psf_sigma2: f64,
    /// Axial calibration factor for the light-sheet thickness.
    pub sigma_z: f64,
    /// Spatial binning in x (pixels combined per observation area).
    pub binning_x: usize,
    /// Spatial binning in y.
    pub binning_y: usize,
    /// Lateral distance between cross-correlation channels, x (in pixels).
    pub ccf_distance_x: f64,
    /// Lateral distance between cross-correlation channels, y (in pixels).
    pub ccf_distance_y: f64,
    /// Camera frame time; lag channel `i` of a linear correlator sits at
    /// `i * frame_time`.
    pub frame_time: f64,
}

impl AcquisitionSettings {
    /// Side length of the binned observation area in object space, x.
    pub fn param_ax(&self) -> f64 {
        self.pixel_size * self.binning_x as f64 / self.magnification
    }

    /// Side length of the binned observation area in object space, y.
    pub fn param_ay(&self) -> f64 {
        self.pixel_size * self.binning_y as f64 / self.magnification
    }

    /// Lateral PSF 1/e² waist.
    pub fn param_w(&self) -> f64 {
        self.psf_sigma * self.em_lambda / self.na
    }

    /// Lateral PSF waist of the second channel.
    pub fn param_w2(&self) -> f64 {
        self.psf_sigma2 * self.em_lambda / self.na
    }

    /// Axial 1/e² half-thickness of the light sheet.
    pub fn param_z(&self) -> f64 {
        self.sigma_z * self.em_lambda / self.na
    }

    /// Channel separation in object space, x.
    pub fn param_rx(&self) -> f64 {
        self.ccf_distance_x * self.pixel_size / self.magnification
    }

    /// Channel separation in object space, y.
    pub fn param_ry(&self) -> f64 {
        self.ccf_distance_y * self.pixel_size / self.magnification
    }

    /// Copy of these settings with a different square binning. Used by the
    /// diffusion-law sweep, which must never mutate interface settings.
    pub fn with_binning(&self, binning: usize) -> Self {
        let mut out = self.clone();
        out.binning_x = binning;
        out.binning_y = binning;
        out
    }
}

impl Default for AcquisitionSettings {
    /// Defaults for a typical EMCCD TIRF setup: 24 µm pixels, 100x
    /// magnification, NA 1.49, green emission.
    fn default() -> Self {
        AcquisitionSettings {
            pixel_size: 24e-6,
            magnification: 100.0,
            na: 1.49,
            em_lambda: 515e-9,
            psf_sigma: 0.8,
            psf_sigma2: 0.8,
            sigma_z: 1.0,
            binning_x: 1,
            binning_y: 1,
            ccf_distance_x: 0.0,
            ccf_distance_y: 0.0,
            frame_time: 0.001,
        }
    }
}
