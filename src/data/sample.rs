//! Synthetic pixel correlation curves from a known ground-truth scene.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::Normal;

use crate::difflaw::Correlator;
use crate::domain::{
    AcquisitionSettings, GeometryKind, PARAM_COUNT, PARAM_D, PARAM_G, PARAM_N,
    PIXEL_SIZE_REAL_SPACE_CONVERSION_FACTOR, PixelSample,
};
use crate::error::FitError;
use crate::models::{ModelShape, evaluate};

/// Ground truth for the synthetic scene.
#[derive(Debug, Clone)]
pub struct SyntheticScene {
    /// Particles per µm². The particle number of a binned pixel scales with
    /// its observation area.
    pub particle_density: f64,
    /// Diffusion coefficient, m²/s.
    pub diffusion: f64,
    /// Constant correlation offset.
    pub offset: f64,
    /// Gaussian noise amplitude as a fraction of the zero-lag amplitude.
    /// Zero produces exact model curves.
    pub noise: f64,
    pub seed: u64,
}

impl Default for SyntheticScene {
    fn default() -> Self {
        SyntheticScene {
            particle_density: 10.0,
            diffusion: 5e-13,
            offset: 0.0,
            noise: 0.0,
            seed: 42,
        }
    }
}

/// Deterministic synthetic correlator over a ground-truth scene.
///
/// Each pixel's noise stream is seeded from `(scene seed, binning, x, y)`, so
/// a pixel's curve never depends on how many other pixels were generated
/// before it.
pub struct SyntheticCorrelator {
    geometry: GeometryKind,
    mode: u8,
    scene: SyntheticScene,
    lag_times: Vec<f64>,
}

impl SyntheticCorrelator {
    pub fn new(
        geometry: GeometryKind,
        mode: u8,
        scene: SyntheticScene,
        channel_count: usize,
        frame_time: f64,
    ) -> Result<Self, FitError> {
        if channel_count < 3 {
            return Err(FitError::config(format!(
                "At least 3 lag channels are required, got {channel_count}."
            )));
        }
        if !(frame_time.is_finite() && frame_time > 0.0) {
            return Err(FitError::config(format!(
                "Frame time must be positive, got {frame_time}."
            )));
        }
        if !(scene.particle_density.is_finite() && scene.particle_density > 0.0) {
            return Err(FitError::config(format!(
                "Particle density must be positive, got {}.",
                scene.particle_density
            )));
        }
        if !(scene.diffusion.is_finite() && scene.diffusion >= 0.0) {
            return Err(FitError::config(format!(
                "Diffusion coefficient must be non-negative, got {}.",
                scene.diffusion
            )));
        }
        if !(scene.noise.is_finite() && scene.noise >= 0.0) {
            return Err(FitError::config(format!(
                "Noise amplitude must be non-negative, got {}.",
                scene.noise
            )));
        }

        Ok(SyntheticCorrelator {
            geometry,
            mode,
            scene,
            lag_times: (0..channel_count).map(|i| i as f64 * frame_time).collect(),
        })
    }

    fn pixel_seed(&self, binning: usize, x: usize, y: usize) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.scene.seed.hash(&mut hasher);
        self.scene.particle_density.to_bits().hash(&mut hasher);
        self.scene.diffusion.to_bits().hash(&mut hasher);
        self.scene.noise.to_bits().hash(&mut hasher);
        binning.hash(&mut hasher);
        x.hash(&mut hasher);
        y.hash(&mut hasher);
        hasher.finish()
    }
}

impl Correlator for SyntheticCorrelator {
    fn lag_times(&self) -> Vec<f64> {
        self.lag_times.clone()
    }

    fn correlate_pixel(
        &self,
        settings: &AcquisitionSettings,
        x: usize,
        y: usize,
    ) -> Result<PixelSample, FitError> {
        let shape = ModelShape::new(self.geometry, self.mode, settings)?;
        let area_um2 = shape.observation_area()
            * PIXEL_SIZE_REAL_SPACE_CONVERSION_FACTOR
            * PIXEL_SIZE_REAL_SPACE_CONVERSION_FACTOR;
        let n = self.scene.particle_density * area_um2;

        let mut params = [0.0; PARAM_COUNT];
        params[PARAM_N] = n;
        params[PARAM_D] = self.scene.diffusion;
        params[PARAM_G] = self.scene.offset;

        let amplitude = 1.0 / n;
        let sigma = self.scene.noise * amplitude;
        // The fit weights are 1 / variance, so the variance channel must stay
        // positive even for noiseless curves.
        let variance_floor = (amplitude * 1e-4).powi(2);
        let variance = (sigma * sigma).max(variance_floor);

        let mut acf = Vec::with_capacity(self.lag_times.len());
        if sigma > 0.0 {
            let mut rng = StdRng::seed_from_u64(self.pixel_seed(settings.binning_x, x, y));
            let normal = Normal::new(0.0, sigma)
                .map_err(|e| FitError::config(format!("Noise distribution error: {e}")))?;
            for &tau in &self.lag_times {
                acf.push(evaluate(&shape, tau, &params) + normal.sample(&mut rng));
            }
        } else {
            for &tau in &self.lag_times {
                acf.push(evaluate(&shape, tau, &params));
            }
        }

        Ok(PixelSample {
            acf,
            variance: vec![variance; self.lag_times.len()],
        })
    }
}
