//! Relative fiber transmission correction from resampled flat spectra.
//!
//! Fibers see the same flat-field illumination, so the ratio of their
//! integrated flux over a reference wavelength band measures their relative
//! throughput. The correction factor is near 1.0 and divides into the
//! corresponding rows of arc and science resampled spectra.

use crate::resample::ResampledSpectrum;

/// Per-fiber relative transmission factors and the band integrals they were
/// derived from.
#[derive(Debug, Clone)]
pub struct TransmissionTable {
    /// Multiplicative correction factor per fiber; 0.0 for an invalid fiber.
    pub factors: Vec<f64>,
    /// Integrated reference-band flux per fiber.
    pub band_flux: Vec<f64>,
    /// Per-fiber validity: false when the band integral was not positive.
    pub valid: Vec<bool>,
    /// Reference band (low, high) in wavelength units.
    pub band: (f64, f64),
}

impl TransmissionTable {
    /// Number of fibers.
    pub fn len(&self) -> usize {
        self.factors.len()
    }

    /// True when the table holds no fibers.
    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }

    /// Number of fibers with an invalid transmission.
    pub fn lost_count(&self) -> usize {
        self.valid.iter().filter(|&&v| !v).count()
    }

    /// Divide the correction into a resampled exposure in place.
    ///
    /// Rows of fibers with invalid transmission become NaN and are marked
    /// invalid; everything else is scaled by `1 / factor`.
    pub fn apply(&self, spectra: &mut ResampledSpectrum) {
        let n = spectra.fiber_count().min(self.len());
        for fiber in 0..n {
            if !spectra.valid[fiber] {
                continue;
            }
            if !self.valid[fiber] {
                spectra.valid[fiber] = false;
                spectra.flux.row_mut(fiber).fill(f64::NAN);
                continue;
            }
            let factor = self.factors[fiber];
            spectra.flux.row_mut(fiber).mapv_inplace(|v| v / factor);
        }
    }
}

/// Integrate one fiber's flux over the reference band.
///
/// NaN bins inside the band (missing coverage) contribute nothing.
fn band_integral(spectra: &ResampledSpectrum, fiber: usize, band: (f64, f64)) -> f64 {
    let mut sum = 0.0;
    for (bin, &value) in spectra.flux.row(fiber).iter().enumerate() {
        let lambda = spectra.grid.wavelength_at(bin);
        if lambda < band.0 || lambda > band.1 || value.is_nan() {
            continue;
        }
        sum += value * spectra.grid.step;
    }
    sum
}

/// Derive relative transmission factors from the resampled flat exposure.
///
/// Integrals are normalized by their mean over fibers with positive
/// integrals, so factors scatter around 1.0. A fiber with a non-positive
/// integral gets factor 0.0 and an invalid flag rather than failing the run.
pub fn derive_transmission(flat: &ResampledSpectrum, band: (f64, f64)) -> TransmissionTable {
    let n_fibers = flat.fiber_count();
    let band_flux: Vec<f64> = (0..n_fibers)
        .map(|fiber| {
            if flat.valid[fiber] {
                band_integral(flat, fiber, band)
            } else {
                0.0
            }
        })
        .collect();

    let positive: Vec<f64> = band_flux.iter().copied().filter(|&f| f > 0.0).collect();
    let mean = if positive.is_empty() {
        0.0
    } else {
        positive.iter().sum::<f64>() / positive.len() as f64
    };

    let mut factors = Vec::with_capacity(n_fibers);
    let mut valid = Vec::with_capacity(n_fibers);
    for &flux in &band_flux {
        if flux > 0.0 && mean > 0.0 {
            factors.push(flux / mean);
            valid.push(true);
        } else {
            factors.push(0.0);
            valid.push(false);
        }
    }

    let lost = valid.iter().filter(|&&v| !v).count();
    log::info!(
        "transmission correction: {}/{} fibers, band {:.1}..{:.1}",
        n_fibers - lost,
        n_fibers,
        band.0,
        band.1
    );

    TransmissionTable {
        factors,
        band_flux,
        valid,
        band,
    }
}
