//! Wavelength calibration: matching arc-lamp lines to a reference catalog
//! and fitting a per-fiber inverse dispersion solution (IDS).
//!
//! Two matching policies are available. First-guess prediction inverts the
//! seed pixel-to-wavelength relation per catalog line and pairs it with the
//! nearest detected peak; it is precise but needs a trustworthy seed. Blind
//! matching scans dispersion candidates around the seed value and scores each
//! against the full catalog, which survives a poor seed at the cost of
//! precision. First-guess falls back to blind per fiber when too few pairs
//! form.

use rayon::prelude::*;

use slit_math::{fit_robust, Polynomial};

use crate::config::{MatchPolicy, WavecalParams};
use crate::error::Error;
use crate::extract::ExtractedSpectrum;
use crate::peaks::find_peaks;

/// Ordered reference wavelengths for the active dispersive element.
#[derive(Debug, Clone)]
pub struct LineCatalog {
    wavelengths: Vec<f64>,
}

impl LineCatalog {
    /// Build a catalog from reference wavelengths, sorting them ascending.
    ///
    /// # Errors
    /// * `Error::EmptyCatalog` - No wavelengths supplied
    pub fn new(mut wavelengths: Vec<f64>) -> Result<Self, Error> {
        wavelengths.retain(|w| w.is_finite());
        if wavelengths.is_empty() {
            return Err(Error::EmptyCatalog);
        }
        wavelengths.sort_by(|a, b| a.partial_cmp(b).unwrap());
        Ok(Self { wavelengths })
    }

    /// Reference wavelengths in ascending order.
    pub fn wavelengths(&self) -> &[f64] {
        &self.wavelengths
    }

    /// Number of catalog lines.
    pub fn len(&self) -> usize {
        self.wavelengths.len()
    }

    /// True when the catalog holds no lines (never after construction).
    pub fn is_empty(&self) -> bool {
        self.wavelengths.is_empty()
    }
}

/// Inverse dispersion solution of one fiber: polynomial mapping spectral
/// pixel to wavelength.
#[derive(Debug, Clone)]
pub struct Ids {
    /// Fiber index within the pseudo-slit.
    pub fiber: usize,
    /// Fitted polynomial; `None` for a wavelength-lost fiber.
    pub poly: Option<Polynomial>,
    /// RMS residual in wavelength units.
    pub rms: Option<f64>,
    /// RMS residual expressed in pixels via the local dispersion.
    pub rms_px: Option<f64>,
    /// Number of (pixel, wavelength) pairs used by the fit.
    pub lines_used: usize,
}

impl Ids {
    /// Whether the fiber has a usable wavelength solution.
    pub fn is_valid(&self) -> bool {
        self.poly.is_some()
    }
}

/// Per-slit table of wavelength solutions, index-aligned with the trace
/// table that produced the extracted spectra.
#[derive(Debug, Clone)]
pub struct IdsTable {
    /// One solution per fiber.
    pub solutions: Vec<Ids>,
}

impl IdsTable {
    /// Number of fibers.
    pub fn len(&self) -> usize {
        self.solutions.len()
    }

    /// True when the table holds no fibers.
    pub fn is_empty(&self) -> bool {
        self.solutions.is_empty()
    }

    /// Number of wavelength-lost fibers.
    pub fn lost_count(&self) -> usize {
        self.solutions.iter().filter(|s| !s.is_valid()).count()
    }

    /// Mean pixel RMS over valid fibers.
    pub fn mean_rms_px(&self) -> Option<f64> {
        let rms: Vec<f64> = self.solutions.iter().filter_map(|s| s.rms_px).collect();
        if rms.is_empty() {
            None
        } else {
            Some(rms.iter().sum::<f64>() / rms.len() as f64)
        }
    }
}

/// Diagnostics of one wavelength calibration run.
#[derive(Debug, Clone, Default)]
pub struct WavecalDiagnostics {
    /// Fibers where first-guess matching fell back to blind matching.
    pub blind_fallbacks: usize,
    /// Fibers marked wavelength-lost.
    pub lost: usize,
}

/// Pair catalog lines with detected peaks via the seed relation.
fn first_guess_pairs(
    peaks: &[f64],
    catalog: &LineCatalog,
    seed: &Polynomial,
    window: f64,
    n_pixels: usize,
) -> Vec<(f64, f64)> {
    let mut pairs = Vec::new();
    for &lambda in catalog.wavelengths() {
        let Some(predicted) = seed.invert_monotonic(lambda, 0.0, (n_pixels - 1) as f64) else {
            continue;
        };
        let nearest = peaks
            .iter()
            .copied()
            .min_by(|a, b| {
                (a - predicted)
                    .abs()
                    .partial_cmp(&(b - predicted).abs())
                    .unwrap()
            });
        if let Some(p) = nearest {
            if (p - predicted).abs() <= window {
                pairs.push((p, lambda, (p - predicted).abs()));
            }
        }
    }
    dedupe_pairs(pairs)
}

/// Pair catalog lines with detected peaks by scanning dispersion candidates.
///
/// For each candidate scale, every (brightest peak, catalog line) anchor
/// fixes an offset; the candidate matching the most catalog lines with the
/// smallest total residual wins and its matches become the pairs.
fn blind_pairs(
    peaks: &[f64],
    heights: &[f64],
    catalog: &LineCatalog,
    seed: &Polynomial,
    params: &WavecalParams,
    n_pixels: usize,
) -> Vec<(f64, f64)> {
    if peaks.is_empty() {
        return Vec::new();
    }
    let seed_dispersion = seed.derivative_at(n_pixels as f64 / 2.0);
    if seed_dispersion == 0.0 {
        return Vec::new();
    }

    // Anchor the offset search on the brightest peaks only.
    let mut order: Vec<usize> = (0..peaks.len()).collect();
    order.sort_by(|&a, &b| heights[b].partial_cmp(&heights[a]).unwrap());
    let anchors: Vec<f64> = order.iter().take(8).map(|&i| peaks[i]).collect();

    let steps = params.scan_steps.max(1);
    let mut best: Option<(usize, f64, f64, f64)> = None; // (count, -residual, scale, offset)
    for step in 0..steps {
        let frac = if steps == 1 {
            0.0
        } else {
            2.0 * step as f64 / (steps - 1) as f64 - 1.0
        };
        let scale = seed_dispersion * (1.0 + params.scan_span * frac);
        for &anchor in &anchors {
            for &lambda in catalog.wavelengths() {
                let offset = lambda - scale * anchor;
                let (count, residual) =
                    score_candidate(peaks, catalog, scale, offset, params.match_window);
                let better = match &best {
                    None => true,
                    Some((c, r, _, _)) => count > *c || (count == *c && residual < -r),
                };
                if better && count >= 2 {
                    best = Some((count, -residual, scale, offset));
                }
            }
        }
    }

    let Some((_, _, scale, offset)) = best else {
        return Vec::new();
    };
    let mut pairs = Vec::new();
    for &lambda in catalog.wavelengths() {
        let predicted = (lambda - offset) / scale;
        if predicted < 0.0 || predicted > (n_pixels - 1) as f64 {
            continue;
        }
        let nearest = peaks
            .iter()
            .copied()
            .min_by(|a, b| {
                (a - predicted)
                    .abs()
                    .partial_cmp(&(b - predicted).abs())
                    .unwrap()
            });
        if let Some(p) = nearest {
            if (p - predicted).abs() <= params.match_window {
                pairs.push((p, lambda, (p - predicted).abs()));
            }
        }
    }
    dedupe_pairs(pairs)
}

/// Matched lines and total residual of a linear dispersion candidate.
fn score_candidate(
    peaks: &[f64],
    catalog: &LineCatalog,
    scale: f64,
    offset: f64,
    window: f64,
) -> (usize, f64) {
    let mut count = 0;
    let mut residual = 0.0;
    for &lambda in catalog.wavelengths() {
        let predicted = (lambda - offset) / scale;
        let nearest = peaks
            .iter()
            .map(|&p| (p - predicted).abs())
            .fold(f64::INFINITY, f64::min);
        if nearest <= window {
            count += 1;
            residual += nearest;
        }
    }
    (count, residual)
}

/// Keep each peak's closest catalog match when several lines claim it.
fn dedupe_pairs(mut pairs: Vec<(f64, f64, f64)>) -> Vec<(f64, f64)> {
    pairs.sort_by(|a, b| (a.0, a.2).partial_cmp(&(b.0, b.2)).unwrap());
    let mut out: Vec<(f64, f64)> = Vec::with_capacity(pairs.len());
    for (pixel, lambda, _) in pairs {
        match out.last() {
            Some(last) if (last.0 - pixel).abs() < f64::EPSILON => {}
            _ => out.push((pixel, lambda)),
        }
    }
    out
}

fn solve_fiber(
    fiber: usize,
    spectrum: &[f64],
    catalog: &LineCatalog,
    seed: &Polynomial,
    params: &WavecalParams,
) -> (Ids, bool) {
    let lost = |lines_used| {
        Ids {
            fiber,
            poly: None,
            rms: None,
            rms_px: None,
            lines_used,
        }
    };

    let detected = find_peaks(spectrum, params.detection_sigma, params.min_separation);
    if detected.is_empty() {
        return (lost(0), false);
    }
    let positions: Vec<f64> = detected.iter().map(|p| p.position).collect();
    let heights: Vec<f64> = detected.iter().map(|p| p.height).collect();
    let n_pixels = spectrum.len();

    let min_pairs = params.order + 1;
    let mut fallback = false;
    let pairs = match params.policy {
        MatchPolicy::FirstGuess => {
            let pairs =
                first_guess_pairs(&positions, catalog, seed, params.match_window, n_pixels);
            if pairs.len() >= min_pairs {
                pairs
            } else {
                fallback = true;
                blind_pairs(&positions, &heights, catalog, seed, params, n_pixels)
            }
        }
        MatchPolicy::Blind => blind_pairs(&positions, &heights, catalog, seed, params, n_pixels),
    };
    if pairs.len() < min_pairs {
        return (lost(pairs.len()), fallback);
    }

    let (pixels, lambdas): (Vec<f64>, Vec<f64>) = pairs.iter().copied().unzip();
    let dispersion = seed.derivative_at(n_pixels as f64 / 2.0).abs();
    let tolerance = (3.0 * params.max_rms_px * dispersion).max(f64::EPSILON);

    let fit = match fit_robust(&pixels, &lambdas, params.order, tolerance, params.max_iterations)
    {
        Ok(fit) => fit,
        Err(_) => return (lost(pairs.len()), fallback),
    };

    let local_dispersion = fit.poly.derivative_at(n_pixels as f64 / 2.0).abs();
    let rms_px = if local_dispersion > 0.0 {
        fit.rms / local_dispersion
    } else {
        f64::INFINITY
    };
    if rms_px > params.max_rms_px {
        return (lost(fit.used), fallback);
    }

    (
        Ids {
            fiber,
            poly: Some(fit.poly),
            rms: Some(fit.rms),
            rms_px: Some(rms_px),
            lines_used: fit.used,
        },
        fallback,
    )
}

/// Fit a wavelength solution for every fiber of an extracted arc exposure.
///
/// Fibers without a valid extracted spectrum are wavelength-lost from the
/// start; fibers whose fit RMS exceeds `params.max_rms_px` are wavelength-lost
/// independently of their spatial-trace validity. Per-fiber solutions are
/// independent and solved in parallel.
pub fn calibrate_wavelengths(
    spectra: &ExtractedSpectrum,
    catalog: &LineCatalog,
    seed: &Polynomial,
    params: &WavecalParams,
) -> (IdsTable, WavecalDiagnostics) {
    let results: Vec<(Ids, bool)> = (0..spectra.fiber_count())
        .into_par_iter()
        .map(|fiber| {
            if !spectra.valid[fiber] {
                return (
                    Ids {
                        fiber,
                        poly: None,
                        rms: None,
                        rms_px: None,
                        lines_used: 0,
                    },
                    false,
                );
            }
            let row: Vec<f64> = spectra.flux.row(fiber).to_vec();
            solve_fiber(fiber, &row, catalog, seed, params)
        })
        .collect();

    let mut diagnostics = WavecalDiagnostics::default();
    let solutions: Vec<Ids> = results
        .into_iter()
        .map(|(ids, fell_back)| {
            if fell_back {
                diagnostics.blind_fallbacks += 1;
            }
            if !ids.is_valid() {
                diagnostics.lost += 1;
            }
            ids
        })
        .collect();

    let table = IdsTable { solutions };
    log::info!(
        "wavelength calibration: {}/{} fibers solved, {} blind fallbacks, mean rms {:.3} px",
        table.len() - table.lost_count(),
        table.len(),
        diagnostics.blind_fallbacks,
        table.mean_rms_px().unwrap_or(f64::NAN)
    );
    (table, diagnostics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    /// Arc spectrum with Gaussian lines at the pixel positions implied by
    /// `dispersion` for each catalog wavelength.
    fn arc_spectrum(n_pixels: usize, dispersion: &Polynomial, lines: &[f64]) -> Vec<f64> {
        let mut spectrum = vec![0.0; n_pixels];
        for &lambda in lines {
            let center = dispersion
                .invert_monotonic(lambda, 0.0, (n_pixels - 1) as f64)
                .expect("line inside detector");
            for (i, value) in spectrum.iter_mut().enumerate() {
                let d = i as f64 - center;
                *value += 800.0 * (-d * d / (2.0 * 1.5 * 1.5)).exp();
            }
        }
        spectrum
    }

    fn spectra_from_rows(rows: Vec<Vec<f64>>) -> ExtractedSpectrum {
        let n = rows.len();
        let m = rows[0].len();
        let flat: Vec<f64> = rows.into_iter().flatten().collect();
        ExtractedSpectrum {
            flux: Array2::from_shape_vec((n, m), flat).unwrap(),
            variance: None,
            valid: vec![true; n],
        }
    }

    fn catalog_5_lines() -> LineCatalog {
        LineCatalog::new(vec![4200.0, 4750.0, 5300.0, 5900.0, 6450.0]).unwrap()
    }

    #[test]
    fn test_catalog_sorts_and_rejects_empty() {
        let catalog = LineCatalog::new(vec![5300.0, 4200.0]).unwrap();
        assert_eq!(catalog.wavelengths(), &[4200.0, 5300.0]);
        assert!(matches!(
            LineCatalog::new(vec![]),
            Err(Error::EmptyCatalog)
        ));
        assert!(matches!(
            LineCatalog::new(vec![f64::NAN]),
            Err(Error::EmptyCatalog)
        ));
    }

    #[test]
    fn test_first_guess_recovers_linear_dispersion() {
        // 5 lines under a known linear dispersion must
        // be recovered to better than 0.05 px RMS.
        let truth = Polynomial::new(vec![4000.0, 2.6]);
        let catalog = catalog_5_lines();
        let spectrum = arc_spectrum(1024, &truth, catalog.wavelengths());
        let spectra = spectra_from_rows(vec![spectrum]);

        let params = WavecalParams {
            order: 1,
            max_rms_px: 0.05,
            ..WavecalParams::default()
        };
        let (table, diagnostics) =
            calibrate_wavelengths(&spectra, &catalog, &truth, &params);

        let ids = &table.solutions[0];
        assert!(ids.is_valid(), "fiber should be solved");
        assert_eq!(ids.lines_used, 5);
        assert!(ids.rms_px.unwrap() < 0.05);
        assert_eq!(diagnostics.blind_fallbacks, 0);

        let poly = ids.poly.as_ref().unwrap();
        for pixel in [100.0, 500.0, 900.0] {
            assert_relative_eq!(poly.eval(pixel), truth.eval(pixel), epsilon = 0.2);
        }
    }

    #[test]
    fn test_first_guess_with_offset_seed() {
        // Seed shifted by 3 px worth of wavelength still guides matching
        // within the window; the fit recovers the true relation.
        let truth = Polynomial::new(vec![4000.0, 2.6]);
        let seed = Polynomial::new(vec![4000.0 - 3.0 * 2.6, 2.6]);
        let catalog = catalog_5_lines();
        let spectrum = arc_spectrum(1024, &truth, catalog.wavelengths());
        let spectra = spectra_from_rows(vec![spectrum]);

        let params = WavecalParams {
            order: 1,
            match_window: 5.0,
            ..WavecalParams::default()
        };
        let (table, _) = calibrate_wavelengths(&spectra, &catalog, &seed, &params);
        let poly = table.solutions[0].poly.as_ref().unwrap();
        assert_relative_eq!(poly.eval(512.0), truth.eval(512.0), epsilon = 0.2);
    }

    #[test]
    fn test_blind_policy_matches_catalog() {
        let truth = Polynomial::new(vec![4000.0, 2.6]);
        // Seed dispersion off by 2 percent, covered by the scan span.
        let seed = Polynomial::new(vec![4010.0, 2.55]);
        let catalog = catalog_5_lines();
        let spectrum = arc_spectrum(1024, &truth, catalog.wavelengths());
        let spectra = spectra_from_rows(vec![spectrum]);

        let params = WavecalParams {
            order: 1,
            policy: MatchPolicy::Blind,
            scan_span: 0.05,
            scan_steps: 201,
            ..WavecalParams::default()
        };
        let (table, _) = calibrate_wavelengths(&spectra, &catalog, &seed, &params);
        let ids = &table.solutions[0];
        assert!(ids.is_valid(), "blind matching should solve the fiber");
        assert_eq!(ids.lines_used, 5);
        let poly = ids.poly.as_ref().unwrap();
        assert_relative_eq!(poly.eval(512.0), truth.eval(512.0), epsilon = 0.3);
    }

    #[test]
    fn test_rms_threshold_marks_wavelength_lost() {
        let truth = Polynomial::new(vec![4000.0, 2.6]);
        let catalog = catalog_5_lines();
        let mut spectrum = arc_spectrum(1024, &truth, catalog.wavelengths());
        // Displace one line by 2 px: with refitting capped at one iteration
        // the outlier is never rejected and an order-1 fit cannot stay below
        // 0.01 px RMS.
        let shifted = arc_spectrum(1024, &truth, &[5300.0 + 2.0 * 2.6]);
        let original = arc_spectrum(1024, &truth, &[5300.0]);
        for i in 0..1024 {
            spectrum[i] += shifted[i] - original[i];
        }
        let spectra = spectra_from_rows(vec![spectrum]);

        let params = WavecalParams {
            order: 1,
            max_rms_px: 0.01,
            max_iterations: 1,
            ..WavecalParams::default()
        };
        let (table, diagnostics) =
            calibrate_wavelengths(&spectra, &catalog, &truth, &params);
        assert!(!table.solutions[0].is_valid());
        assert_eq!(diagnostics.lost, 1);
    }

    #[test]
    fn test_invalid_spectrum_propagates() {
        let truth = Polynomial::new(vec![4000.0, 2.6]);
        let catalog = catalog_5_lines();
        let spectrum = arc_spectrum(1024, &truth, catalog.wavelengths());
        let mut spectra = spectra_from_rows(vec![spectrum.clone(), spectrum]);
        spectra.valid[1] = false;

        let (table, diagnostics) =
            calibrate_wavelengths(&spectra, &catalog, &truth, &WavecalParams::default());
        assert_eq!(table.len(), 2, "row count never shrinks");
        assert!(table.solutions[0].is_valid());
        assert!(!table.solutions[1].is_valid());
        assert_eq!(diagnostics.lost, 1);
    }
}
