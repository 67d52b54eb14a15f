//! Resampling extracted spectra onto a common uniform wavelength grid.

use ndarray::Array2;

use slit_math::{bracket_ascending, lerp_at, Polynomial};

use crate::config::WavelengthGrid;
use crate::extract::ExtractedSpectrum;
use crate::wavecal::IdsTable;

/// Spectra on the uniform wavelength grid: fiber × wavelength bin.
///
/// The shape is fixed by fiber count × bin count regardless of how many
/// fibers carry data; invalid fibers are NaN rows with `valid[f] == false`.
#[derive(Debug, Clone)]
pub struct ResampledSpectrum {
    /// Flux per fiber and wavelength bin.
    pub flux: Array2<f64>,
    /// The grid the flux is sampled on.
    pub grid: WavelengthGrid,
    /// Per-fiber validity.
    pub valid: Vec<bool>,
}

impl ResampledSpectrum {
    /// Number of fibers.
    pub fn fiber_count(&self) -> usize {
        self.flux.nrows()
    }
}

/// Per-pixel wavelengths of one fiber, reversed together with the flux when
/// the dispersion runs downward so interpolation always sees an ascending
/// grid. Returns `None` when the solution is not strictly monotonic.
fn monotonic_wavelengths(poly: &Polynomial, flux: &[f64]) -> Option<(Vec<f64>, Vec<f64>)> {
    let mut wavelengths: Vec<f64> = (0..flux.len()).map(|p| poly.eval(p as f64)).collect();
    let ascending = wavelengths.windows(2).all(|w| w[1] > w[0]);
    let descending = wavelengths.windows(2).all(|w| w[1] < w[0]);
    if ascending {
        return Some((wavelengths, flux.to_vec()));
    }
    if descending {
        wavelengths.reverse();
        let mut reversed = flux.to_vec();
        reversed.reverse();
        return Some((wavelengths, reversed));
    }
    None
}

fn resample_row(
    flux_row: &[f64],
    poly: &Polynomial,
    grid: &WavelengthGrid,
    out: &mut [f64],
) -> bool {
    let Some((wavelengths, flux)) = monotonic_wavelengths(poly, flux_row) else {
        return false;
    };
    for (bin, sample) in out.iter_mut().enumerate() {
        let lambda = grid.wavelength_at(bin);
        *sample = bracket_ascending(&wavelengths, lambda)
            .and_then(|(lo, frac)| lerp_at(&flux, lo as f64 + frac))
            .unwrap_or(f64::NAN);
    }
    true
}

/// Resample every fiber of an exposure using its wavelength solution.
///
/// Fibers without a valid spectrum or IDS copy through as NaN rows; bins
/// outside a fiber's wavelength coverage stay NaN. A non-monotonic solution
/// invalidates the fiber rather than aborting the run.
pub fn resample(
    spectra: &ExtractedSpectrum,
    ids: &IdsTable,
    grid: &WavelengthGrid,
) -> ResampledSpectrum {
    let n_fibers = spectra.fiber_count();
    let mut flux = Array2::from_elem((n_fibers, grid.bins), f64::NAN);
    let mut valid = vec![false; n_fibers];

    for fiber in 0..n_fibers {
        let solution = ids.solutions.get(fiber).and_then(|s| s.poly.as_ref());
        let (Some(poly), true) = (solution, spectra.valid[fiber]) else {
            continue;
        };
        let row: Vec<f64> = spectra.flux.row(fiber).to_vec();
        let mut out = vec![f64::NAN; grid.bins];
        if resample_row(&row, poly, grid, &mut out) {
            valid[fiber] = true;
            for (bin, v) in out.into_iter().enumerate() {
                flux[[fiber, bin]] = v;
            }
        } else {
            log::warn!("fiber {fiber}: non-monotonic wavelength solution, marking invalid");
        }
    }

    ResampledSpectrum {
        flux,
        grid: *grid,
        valid,
    }
}

/// Resample with a single shared pixel-to-wavelength relation.
///
/// Used when no arc exposure is available: the configuration seed relation
/// stands in for every fiber's IDS at degraded accuracy.
pub fn resample_with_relation(
    spectra: &ExtractedSpectrum,
    relation: &Polynomial,
    grid: &WavelengthGrid,
) -> ResampledSpectrum {
    let n_fibers = spectra.fiber_count();
    let mut flux = Array2::from_elem((n_fibers, grid.bins), f64::NAN);
    let mut valid = vec![false; n_fibers];

    for fiber in 0..n_fibers {
        if !spectra.valid[fiber] {
            continue;
        }
        let row: Vec<f64> = spectra.flux.row(fiber).to_vec();
        let mut out = vec![f64::NAN; grid.bins];
        if resample_row(&row, relation, grid, &mut out) {
            valid[fiber] = true;
            for (bin, v) in out.into_iter().enumerate() {
                flux[[fiber, bin]] = v;
            }
        }
    }

    ResampledSpectrum {
        flux,
        grid: *grid,
        valid,
    }
}
