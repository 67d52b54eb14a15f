//! Spectral extraction: integrating detector flux along each fiber's trace.

use ndarray::Array2;

use crate::image::DetectorImage;
use crate::trace_fit::TraceTable;

/// Extracted spectra of one exposure: fiber × spectral pixel (detector row).
///
/// Rows of dead fibers are NaN-filled; the `valid` flags are authoritative.
#[derive(Debug, Clone)]
pub struct ExtractedSpectrum {
    /// Summed flux per fiber and spectral pixel.
    pub flux: Array2<f64>,
    /// Propagated variance, when the input image carried a variance plane.
    pub variance: Option<Array2<f64>>,
    /// Per-fiber validity, index-aligned with the trace table.
    pub valid: Vec<bool>,
}

impl ExtractedSpectrum {
    /// Number of fibers.
    pub fn fiber_count(&self) -> usize {
        self.flux.nrows()
    }

    /// Number of spectral pixels.
    pub fn pixel_count(&self) -> usize {
        self.flux.ncols()
    }
}

/// Overlap of a pixel centered on integer `c` with the window `[lo, hi]`.
fn pixel_weight(c: isize, lo: f64, hi: f64) -> f64 {
    let left = (c as f64 - 0.5).max(lo);
    let right = (c as f64 + 0.5).min(hi);
    (right - left).max(0.0)
}

/// Extract one spectrum per fiber by summing flux in a fixed window around
/// the trace.
///
/// For each spectral pixel the trace polynomial gives the cross-dispersion
/// center; flux is summed over `center ± half_width` columns with fractional
/// weights at the window ends. A window that leaves the detector yields a NaN
/// sample; a dead fiber yields an all-NaN row.
pub fn extract_spectra(
    image: &DetectorImage,
    traces: &TraceTable,
    half_width: f64,
) -> ExtractedSpectrum {
    let n_fibers = traces.len();
    let n_pixels = image.rows();
    let n_cols = image.cols() as isize;
    let flux_in = image.flux();
    let var_in = image.variance();

    let mut flux = Array2::from_elem((n_fibers, n_pixels), f64::NAN);
    let mut variance = var_in
        .is_some()
        .then(|| Array2::from_elem((n_fibers, n_pixels), f64::NAN));
    let mut valid = vec![false; n_fibers];

    for (fiber, model) in traces.models.iter().enumerate() {
        if !model.is_valid() {
            continue;
        }
        valid[fiber] = true;

        for pixel in 0..n_pixels {
            let Some(center) = traces.column_at(fiber, pixel as f64) else {
                continue;
            };
            let lo = center - half_width;
            let hi = center + half_width;
            if lo < -0.5 || hi > n_cols as f64 - 0.5 {
                continue; // window leaves the detector, sample stays NaN
            }

            let first = (lo - 0.5).ceil() as isize;
            let last = (hi + 0.5).floor() as isize;
            let mut sum = 0.0;
            let mut var_sum = 0.0;
            for c in first.max(0)..=last.min(n_cols - 1) {
                let w = pixel_weight(c, lo, hi);
                sum += w * flux_in[[pixel, c as usize]];
                if let Some(v) = &var_in {
                    var_sum += w * w * v[[pixel, c as usize]];
                }
            }
            flux[[fiber, pixel]] = sum;
            if let Some(var) = &mut variance {
                var[[fiber, pixel]] = var_sum;
            }
        }
    }

    ExtractedSpectrum {
        flux,
        variance,
        valid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace_fit::TraceModel;
    use approx::assert_relative_eq;
    use ndarray::Array2;
    use slit_math::Polynomial;

    fn straight_table(columns: &[f64], reference_row: usize) -> TraceTable {
        TraceTable {
            reference_row,
            models: columns
                .iter()
                .enumerate()
                .map(|(fiber, &c)| TraceModel {
                    fiber,
                    poly: Some(Polynomial::new(vec![c])),
                    rms: Some(0.0),
                    rejected: 0,
                })
                .collect(),
        }
    }

    #[test]
    fn test_gaussian_flux_recovered() {
        // One fiber at column 10.3 with a Gaussian profile of unit total flux
        // per row; a +-3 sigma window recovers nearly all of it.
        let sigma = 1.0;
        let center = 10.3;
        let image = DetectorImage::new(Array2::from_shape_fn((5, 21), |(_, c)| {
            let d = c as f64 - center;
            (-d * d / (2.0 * sigma * sigma)).exp() / (sigma * (2.0 * std::f64::consts::PI).sqrt())
        }))
        .unwrap();
        let traces = straight_table(&[center], 2);

        let spectra = extract_spectra(&image, &traces, 3.0);
        assert!(spectra.valid[0]);
        for pixel in 0..5 {
            assert_relative_eq!(spectra.flux[[0, pixel]], 1.0, epsilon = 5e-3);
        }
    }

    #[test]
    fn test_fractional_window_weights() {
        // Uniform unit image: any window of width 2w must integrate to 2w
        // regardless of the fractional center.
        let image = DetectorImage::new(Array2::ones((3, 30))).unwrap();
        for &center in &[10.0, 10.25, 10.5, 10.75] {
            let traces = straight_table(&[center], 1);
            let spectra = extract_spectra(&image, &traces, 2.3);
            assert_relative_eq!(spectra.flux[[0, 1]], 4.6, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_dead_fiber_yields_nan_row() {
        let image = DetectorImage::new(Array2::ones((4, 20))).unwrap();
        let mut traces = straight_table(&[10.0, 15.0], 2);
        traces.models[1].poly = None;

        let spectra = extract_spectra(&image, &traces, 2.0);
        assert!(spectra.valid[0]);
        assert!(!spectra.valid[1]);
        assert!(spectra.flux.row(1).iter().all(|v| v.is_nan()));
        assert_eq!(spectra.fiber_count(), 2, "row count never shrinks");
    }

    #[test]
    fn test_window_leaving_detector_is_nan() {
        let image = DetectorImage::new(Array2::ones((3, 20))).unwrap();
        let traces = straight_table(&[1.0], 1);

        let spectra = extract_spectra(&image, &traces, 3.0);
        assert!(spectra.flux[[0, 0]].is_nan());
        assert!(spectra.valid[0], "fiber itself stays valid");
    }

    #[test]
    fn test_variance_propagation() {
        let flux = Array2::ones((3, 20));
        let var = Array2::from_elem((3, 20), 2.0);
        let image = DetectorImage::with_variance(flux, var).unwrap();
        let traces = straight_table(&[10.0], 1);

        let spectra = extract_spectra(&image, &traces, 1.5);
        let variance = spectra.variance.as_ref().unwrap();
        // Window covers 3 pixels fully: weights 1,1,1 -> var = 3 * 2.
        assert_relative_eq!(variance[[0, 1]], 6.0, epsilon = 1e-12);
    }
}
