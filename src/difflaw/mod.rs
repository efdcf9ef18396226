//! Diffusion-law analysis.
//!
//! Sweeps spatial binning over a region of interest, fits every binned pixel,
//! and relates the effective observation area to the mean diffusion time. A
//! weighted straight line through `(area, time)` then separates free diffusion
//! (intercept near zero) from confined or domain-partitioned diffusion.
//!
//! The sweep is strictly sequential in binning and pixel order, so repeated
//! runs over the same inputs are bit-for-bit identical.

use crate::domain::{AcquisitionSettings, DIFFUSION_COEFFICIENT_BASE, PixelSample};
use crate::error::FitError;
use crate::fit::{FitConfig, StandardFit};
use crate::math::{LineFit, weighted_line_fit};

/// Exclusive upper bound on the sweep's largest binning. Binnings at or
/// above this value are rejected outright.
pub const MAX_BINNING: usize = 30;

/// Produces correlation curves for (binned) pixels of an image stack.
pub trait Correlator {
    /// Lag time per correlation channel, in seconds.
    fn lag_times(&self) -> Vec<f64>;

    /// Correlate the binned pixel at `(x, y)`. `settings` carries the binning
    /// currently applied by the sweep.
    fn correlate_pixel(
        &self,
        settings: &AcquisitionSettings,
        x: usize,
        y: usize,
    ) -> Result<PixelSample, FitError>;
}

/// Per-binning observables of one completed sweep. All vectors share the
/// length `binning_end - binning_start + 1`, indexed by binning offset.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SweepResult {
    /// First and last binning of the sweep that produced these arrays.
    pub binning_start: usize,
    pub binning_end: usize,
    /// Effective observation area per binning, µm².
    pub effective_area: Vec<f64>,
    /// Mean fitted diffusion coefficient per binning, µm²/s.
    pub mean_d: Vec<f64>,
    /// Variance of the fitted diffusion coefficients, (µm²/s)².
    pub variance_d: Vec<f64>,
    /// Mean diffusion time per binning (area / mean D), seconds.
    pub time: Vec<f64>,
    /// Propagated standard deviation of the diffusion time, seconds.
    pub standard_deviation: Vec<f64>,
    /// Smallest `mean_d - variance_d` over the sweep, for plot scaling.
    pub min_value: f64,
    /// Largest `mean_d + variance_d` over the sweep.
    pub max_value: f64,
}

/// Diffusion-law analyzer: binning range, line-fit sub-range, and the result
/// of the last sweep.
pub struct DiffusionLaw {
    binning_start: usize,
    binning_end: usize,
    fit_start: usize,
    fit_end: usize,
    result: Option<SweepResult>,
}

impl DiffusionLaw {
    /// Analyzer over binnings `[binning_start, binning_end]`, line-fitting the
    /// full range by default.
    pub fn new(binning_start: usize, binning_end: usize) -> Result<Self, FitError> {
        Self::check_range(binning_start, binning_end)?;
        Ok(DiffusionLaw {
            binning_start,
            binning_end,
            fit_start: binning_start,
            fit_end: binning_end,
            result: None,
        })
    }

    fn check_range(start: usize, end: usize) -> Result<(), FitError> {
        if start < 1 || end <= start {
            return Err(FitError::config(format!(
                "Binning range [{start}, {end}] must satisfy 1 <= start < end."
            )));
        }
        if end >= MAX_BINNING {
            return Err(FitError::config(format!(
                "Binning range [{start}, {end}] exceeds the largest supported binning ({}).",
                MAX_BINNING - 1
            )));
        }
        Ok(())
    }

    pub fn binning_start(&self) -> usize {
        self.binning_start
    }

    pub fn binning_end(&self) -> usize {
        self.binning_end
    }

    pub fn result(&self) -> Option<&SweepResult> {
        self.result.as_ref()
    }

    /// Change the sweep range. Any previous sweep result is discarded and the
    /// line-fit sub-range snaps back to the full range.
    pub fn set_binning_range(&mut self, start: usize, end: usize) -> Result<(), FitError> {
        Self::check_range(start, end)?;
        if (start, end) != (self.binning_start, self.binning_end) {
            self.binning_start = start;
            self.binning_end = end;
            self.fit_start = start;
            self.fit_end = end;
            self.result = None;
        }
        Ok(())
    }

    /// Restrict the straight-line fit to `[start, end]`, a strictly ordered
    /// sub-range of the sweep's binning range.
    pub fn set_fit_range(&mut self, start: usize, end: usize) -> Result<(), FitError> {
        if start < self.binning_start || end > self.binning_end || end <= start {
            return Err(FitError::config(format!(
                "Line-fit range [{start}, {end}] is not an ordered sub-range of the \
                 binning range [{}, {}].",
                self.binning_start, self.binning_end
            )));
        }
        self.fit_start = start;
        self.fit_end = end;
        Ok(())
    }

    /// Discard the sweep result, keeping the configured ranges.
    pub fn reset(&mut self) {
        self.result = None;
    }

    /// Run the binning sweep over a `roi_width x roi_height` pixel region.
    ///
    /// For every binning `b`, the region is tiled into `(roi_width / b) x
    /// (roi_height / b)` binned pixels, each is correlated and fitted, and the
    /// fitted diffusion coefficients are averaged. Pixels whose fit fails are
    /// skipped; a binning where *no* pixel fits aborts the sweep.
    ///
    /// The caller's configuration is never mutated; the sweep works on a
    /// private copy with warm start disabled so results do not depend on pixel
    /// visiting order.
    pub fn run_sweep<C: Correlator>(
        &mut self,
        correlator: &C,
        config: &FitConfig,
        settings: &AcquisitionSettings,
        roi_width: usize,
        roi_height: usize,
    ) -> Result<&SweepResult, FitError> {
        let lag_times = correlator.lag_times();
        if lag_times.len() != config.channel_count() {
            return Err(FitError::config(format!(
                "Correlator produces {} lag channels, configuration expects {}.",
                lag_times.len(),
                config.channel_count()
            )));
        }

        let points = self.binning_end - self.binning_start + 1;
        let mut effective_area = Vec::with_capacity(points);
        let mut mean_d = Vec::with_capacity(points);
        let mut variance_d = Vec::with_capacity(points);
        let mut time = Vec::with_capacity(points);
        let mut standard_deviation = Vec::with_capacity(points);
        let mut min_value = f64::INFINITY;
        let mut max_value = f64::NEG_INFINITY;

        for binning in self.binning_start..=self.binning_end {
            let cols = roi_width / binning;
            let rows = roi_height / binning;
            if cols == 0 || rows == 0 {
                return Err(FitError::config(format!(
                    "Region {roi_width}x{roi_height} has no complete pixel at binning {binning}."
                )));
            }
            let binned = settings.with_binning(binning);
            let mut local = config.clone();
            local.fix = true;
            let engine = StandardFit::new(&local, &binned)?;

            let mut sum = 0.0;
            let mut sum_sq = 0.0;
            let mut fitted = 0usize;
            for y in 0..rows {
                for x in 0..cols {
                    let sample = correlator.correlate_pixel(&binned, x, y)?;
                    let mut pixel_config = local.clone();
                    let result = engine.fit_pixel(&mut pixel_config, &sample, &lag_times)?;
                    let Some(params) = result.params else {
                        continue;
                    };
                    if !params.d.is_finite() {
                        continue;
                    }
                    let d = params.d * DIFFUSION_COEFFICIENT_BASE;
                    sum += d;
                    sum_sq += d * d;
                    fitted += 1;
                }
            }
            if fitted == 0 {
                return Err(FitError::config(format!(
                    "No pixel fitted at binning {binning}; sweep aborted."
                )));
            }

            let n = fitted as f64;
            let area = engine.shape().observation_area() * DIFFUSION_COEFFICIENT_BASE;
            let d_mean = sum / n;
            let d_var = (sum_sq / n - d_mean * d_mean).max(0.0);
            let t = area / d_mean;
            let sd = area / (d_mean * d_mean) * d_var.sqrt();

            min_value = min_value.min(d_mean - d_var);
            max_value = max_value.max(d_mean + d_var);
            effective_area.push(area);
            mean_d.push(d_mean);
            variance_d.push(d_var);
            time.push(t);
            standard_deviation.push(sd);
        }

        let result = SweepResult {
            binning_start: self.binning_start,
            binning_end: self.binning_end,
            effective_area,
            mean_d,
            variance_d,
            time,
            standard_deviation,
            min_value,
            max_value,
        };
        Ok(&*self.result.insert(result))
    }

    /// Weighted straight-line fit of diffusion time against effective area
    /// over the configured sub-range of the last sweep.
    pub fn linear_fit(&self) -> Result<LineFit, FitError> {
        let result = self.result.as_ref().ok_or_else(|| {
            FitError::state("No sweep result available; run the binning sweep first.")
        })?;

        let from = self.fit_start - result.binning_start;
        let to = self.fit_end - result.binning_start;
        let x = &result.effective_area[from..=to];
        let y = &result.time[from..=to];
        // Zero spread (e.g. a single-pixel region) would produce zero weights;
        // fall back to the smallest useful deviation instead.
        let sd: Vec<f64> = result.standard_deviation[from..=to]
            .iter()
            .map(|&s| if s > 0.0 { s } else { f64::EPSILON.sqrt() })
            .collect();
        weighted_line_fit(x, y, &sd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{GeometryKind, PARAM_COUNT, PARAM_D, PARAM_G, PARAM_N};
    use crate::models::{ModelShape, evaluate};

    const CHANNELS: usize = 64;
    const TRUE_D: f64 = 5e-13;

    /// Synthetic-free mock: every pixel carries the exact model curve for the
    /// binned settings it is asked about.
    struct ExactCorrelator {
        lag_times: Vec<f64>,
    }

    impl ExactCorrelator {
        fn new(frame_time: f64) -> Self {
            ExactCorrelator {
                lag_times: (0..CHANNELS).map(|i| i as f64 * frame_time).collect(),
            }
        }
    }

    impl Correlator for ExactCorrelator {
        fn lag_times(&self) -> Vec<f64> {
            self.lag_times.clone()
        }

        fn correlate_pixel(
            &self,
            settings: &AcquisitionSettings,
            _x: usize,
            _y: usize,
        ) -> Result<PixelSample, FitError> {
            let shape = ModelShape::new(GeometryKind::Itir2d, 0, settings)?;
            let mut params = [0.0; PARAM_COUNT];
            params[PARAM_N] = 2.0;
            params[PARAM_D] = TRUE_D;
            params[PARAM_G] = 0.0;
            let acf = self
                .lag_times
                .iter()
                .map(|&tau| evaluate(&shape, tau, &params))
                .collect();
            Ok(PixelSample {
                acf,
                variance: vec![1e-8; CHANNELS],
            })
        }
    }

    fn fixture() -> (ExactCorrelator, FitConfig, AcquisitionSettings) {
        let settings = AcquisitionSettings::default();
        let config = FitConfig::new(GeometryKind::Itir2d, 0, CHANNELS).unwrap();
        (ExactCorrelator::new(settings.frame_time), config, settings)
    }

    #[test]
    fn sweep_fills_one_entry_per_binning() {
        let (correlator, config, settings) = fixture();
        let mut law = DiffusionLaw::new(1, 5).unwrap();
        let result = law
            .run_sweep(&correlator, &config, &settings, 10, 10)
            .unwrap();

        assert_eq!(result.effective_area.len(), 5);
        assert_eq!(result.mean_d.len(), 5);
        assert_eq!(result.variance_d.len(), 5);
        assert_eq!(result.time.len(), 5);
        assert_eq!(result.standard_deviation.len(), 5);

        // Larger binning, larger observation area, longer diffusion time.
        for i in 1..5 {
            assert!(result.effective_area[i] > result.effective_area[i - 1]);
            assert!(result.time[i] > result.time[i - 1]);
        }
        // Every binned pixel carries the same exact curve, so the fitted D is
        // the ground truth at every binning.
        let d_interface = TRUE_D * DIFFUSION_COEFFICIENT_BASE;
        for &d in &result.mean_d {
            assert!((d - d_interface).abs() / d_interface < 1e-3, "d = {d}");
        }

        // The tracked extrema span the diffusion-coefficient spread.
        let expected_min = result
            .mean_d
            .iter()
            .zip(&result.variance_d)
            .map(|(m, v)| m - v)
            .fold(f64::INFINITY, f64::min);
        let expected_max = result
            .mean_d
            .iter()
            .zip(&result.variance_d)
            .map(|(m, v)| m + v)
            .fold(f64::NEG_INFINITY, f64::max);
        assert_eq!(result.min_value, expected_min);
        assert_eq!(result.max_value, expected_max);
        assert!(result.min_value <= result.max_value);
    }

    #[test]
    fn free_diffusion_line_passes_near_the_origin() {
        let (correlator, config, settings) = fixture();
        let mut law = DiffusionLaw::new(1, 4).unwrap();
        law.run_sweep(&correlator, &config, &settings, 8, 8)
            .unwrap();

        let line = law.linear_fit().unwrap();
        // time = area / D: slope = 1/D in s/µm², intercept ~ 0.
        let d_interface = TRUE_D * DIFFUSION_COEFFICIENT_BASE;
        assert!(
            (line.slope - 1.0 / d_interface).abs() / (1.0 / d_interface) < 1e-2,
            "slope = {}",
            line.slope
        );
        assert!(line.intercept.abs() < 1e-3 * line.value_at(1.0).abs().max(1.0));
    }

    #[test]
    fn linear_fit_before_sweep_is_a_state_error() {
        let law = DiffusionLaw::new(1, 5).unwrap();
        assert!(matches!(law.linear_fit(), Err(FitError::StateError(_))));
    }

    #[test]
    fn fit_range_must_be_an_ordered_sub_range() {
        let mut law = DiffusionLaw::new(2, 6).unwrap();
        assert!(law.set_fit_range(1, 6).is_err());
        assert!(law.set_fit_range(2, 7).is_err());
        assert!(law.set_fit_range(5, 3).is_err());
        // A single-point range cannot anchor a line.
        assert!(law.set_fit_range(3, 3).is_err());
        assert!(law.set_fit_range(3, 5).is_ok());
    }

    #[test]
    fn binning_cap_and_ordering_are_enforced() {
        assert!(DiffusionLaw::new(1, 29).is_ok());
        // Binning 30 is out of range no matter where the sweep starts.
        assert!(DiffusionLaw::new(1, 30).is_err());
        assert!(DiffusionLaw::new(5, 34).is_err());
        assert!(DiffusionLaw::new(0, 5).is_err());
        assert!(DiffusionLaw::new(5, 4).is_err());
        assert!(DiffusionLaw::new(3, 3).is_err());
    }

    #[test]
    fn changing_the_binning_range_discards_results() {
        let (correlator, config, settings) = fixture();
        let mut law = DiffusionLaw::new(1, 3).unwrap();
        law.run_sweep(&correlator, &config, &settings, 6, 6)
            .unwrap();
        assert!(law.result().is_some());

        // Same range: results survive.
        law.set_binning_range(1, 3).unwrap();
        assert!(law.result().is_some());

        law.set_binning_range(1, 4).unwrap();
        assert!(law.result().is_none());
    }

    #[test]
    fn repeated_sweeps_are_identical() {
        let (correlator, config, settings) = fixture();
        let mut law = DiffusionLaw::new(1, 3).unwrap();
        let first = law
            .run_sweep(&correlator, &config, &settings, 6, 6)
            .unwrap()
            .clone();
        let second = law
            .run_sweep(&correlator, &config, &settings, 6, 6)
            .unwrap()
            .clone();
        assert_eq!(first, second);
    }
}
