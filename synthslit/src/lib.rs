//! Synthetic IFU pseudo-slit exposures with known ground truth.
//!
//! Renders flat-field and arc-lamp detector images for calibration tests:
//! Gaussian cross-dispersion fiber profiles follow known polynomial traces,
//! arc lines land at the pixels implied by a known dispersion relation, and
//! detector noise is seeded for reproducibility. Every rendered quantity is
//! available as ground truth so tests can assert recovery instead of
//! plausibility.

use ndarray::Array2;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

use slit_math::Polynomial;

/// One emission line of a synthetic arc lamp.
#[derive(Debug, Clone, Copy)]
pub struct ArcLine {
    /// Line wavelength in catalog units.
    pub wavelength: f64,
    /// Peak flux of the line along the dispersion axis.
    pub strength: f64,
}

/// Description of a synthetic pseudo-slit scene.
///
/// Fiber traces are polynomials in `row - reference_row` yielding the
/// fractional column, matching the convention of the calibration engine's
/// trace models.
#[derive(Debug, Clone)]
pub struct SlitScene {
    /// Detector rows (dispersion direction).
    pub rows: usize,
    /// Detector columns (spatial direction).
    pub cols: usize,
    /// Row the trace polynomials are centered on.
    pub reference_row: usize,
    /// Per-fiber trace polynomial.
    pub traces: Vec<Polynomial>,
    /// Per-fiber flux scale.
    pub amplitudes: Vec<f64>,
    /// Cross-dispersion Gaussian sigma in columns.
    pub profile_sigma: f64,
    /// Constant background level.
    pub background: f64,
    /// Gaussian read-noise sigma; 0.0 renders noiseless images.
    pub noise_sigma: f64,
    /// Seed for the noise generator.
    pub seed: u64,
}

impl SlitScene {
    /// Evenly spaced fibers with a shared slope and curvature.
    pub fn uniform(
        rows: usize,
        cols: usize,
        reference_row: usize,
        fiber_count: usize,
        first_column: f64,
        pitch: f64,
    ) -> Self {
        let traces = (0..fiber_count)
            .map(|i| Polynomial::new(vec![first_column + pitch * i as f64, 0.0, 0.0]))
            .collect();
        Self {
            rows,
            cols,
            reference_row,
            traces,
            amplitudes: vec![1000.0; fiber_count],
            profile_sigma: 1.5,
            background: 0.0,
            noise_sigma: 0.0,
            seed: 7,
        }
    }

    /// Give every fiber the same slope and curvature in `row - reference_row`.
    pub fn with_curvature(mut self, slope: f64, curvature: f64) -> Self {
        self.traces = self
            .traces
            .iter()
            .map(|t| {
                let c0 = t.coeffs().first().copied().unwrap_or(0.0);
                Polynomial::new(vec![c0, slope, curvature])
            })
            .collect();
        self
    }

    /// Set per-fiber flux scales (throughput differences).
    pub fn with_amplitudes(mut self, amplitudes: Vec<f64>) -> Self {
        assert_eq!(amplitudes.len(), self.traces.len());
        self.amplitudes = amplitudes;
        self
    }

    /// Set the constant background level.
    pub fn with_background(mut self, background: f64) -> Self {
        self.background = background;
        self
    }

    /// Enable seeded Gaussian noise.
    pub fn with_noise(mut self, sigma: f64, seed: u64) -> Self {
        self.noise_sigma = sigma;
        self.seed = seed;
        self
    }

    /// Shift every fiber by a constant column offset (flexure between
    /// exposures).
    pub fn shifted(&self, dc0: f64) -> Self {
        let mut scene = self.clone();
        scene.traces = scene.traces.iter().map(|t| t.shifted(dc0, 0.0)).collect();
        scene
    }

    /// Number of fibers in the scene.
    pub fn fiber_count(&self) -> usize {
        self.traces.len()
    }

    /// Ground-truth column of a fiber at a detector row.
    pub fn column_at(&self, fiber: usize, row: f64) -> f64 {
        self.traces[fiber].eval(row - self.reference_row as f64)
    }

    /// Ground-truth columns at the reference row.
    pub fn reference_columns(&self) -> Vec<f64> {
        (0..self.fiber_count())
            .map(|f| self.column_at(f, self.reference_row as f64))
            .collect()
    }

    /// Render a flat-field exposure: constant flux along every fiber.
    pub fn render_flat(&self) -> Array2<f64> {
        self.render_with(|_, _| 1.0)
    }

    /// Render an arc exposure under a known dispersion relation.
    ///
    /// Per-fiber flux along the dispersion axis is `continuum` plus a
    /// Gaussian of width `line_sigma` rows for each line, centered at the
    /// row where the relation reaches the line wavelength. Lines whose
    /// wavelength falls outside the detector are skipped.
    pub fn render_arc(
        &self,
        dispersion: &Polynomial,
        lines: &[ArcLine],
        line_sigma: f64,
        continuum: f64,
    ) -> Array2<f64> {
        let line_rows: Vec<(f64, f64)> = lines
            .iter()
            .filter_map(|line| {
                dispersion
                    .invert_monotonic(line.wavelength, 0.0, (self.rows - 1) as f64)
                    .map(|row| (row, line.strength))
            })
            .collect();

        self.render_with(|_, row| {
            let mut flux = continuum;
            for &(center, strength) in &line_rows {
                let d = row - center;
                flux += strength * (-d * d / (2.0 * line_sigma * line_sigma)).exp();
            }
            flux
        })
    }

    /// Render with an arbitrary per-fiber flux profile along the rows.
    fn render_with<F>(&self, flux_at: F) -> Array2<f64>
    where
        F: Fn(usize, f64) -> f64,
    {
        let mut image = Array2::from_elem((self.rows, self.cols), self.background);
        let window = (4.0 * self.profile_sigma).ceil() as isize;
        let two_sigma_sq = 2.0 * self.profile_sigma * self.profile_sigma;

        for (fiber, trace) in self.traces.iter().enumerate() {
            let amplitude = self.amplitudes[fiber];
            for row in 0..self.rows {
                let center = trace.eval(row as f64 - self.reference_row as f64);
                let flux = amplitude * flux_at(fiber, row as f64);
                let c0 = (center.floor() as isize - window).max(0);
                let c1 = (center.ceil() as isize + window).min(self.cols as isize - 1);
                for col in c0..=c1 {
                    let d = col as f64 - center;
                    image[[row, col as usize]] += flux * (-d * d / two_sigma_sq).exp();
                }
            }
        }

        if self.noise_sigma > 0.0 {
            let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
            let normal = Normal::new(0.0, self.noise_sigma)
                .expect("noise sigma checked positive");
            for value in image.iter_mut() {
                *value += normal.sample(&mut rng);
            }
        }

        image
    }
}
