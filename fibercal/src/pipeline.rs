//! Calibration run orchestration.
//!
//! Wires the stages together in dependency order: flat calibration produces
//! the geometric trace model, arc calibration the wavelength solutions and
//! transmission factors, and `reduce` applies the stored calibration to a
//! science exposure. Degraded fallbacks (blind identification, skipped
//! alignment, blind line matching) are taken silently for the data path and
//! loudly for the QC report.

use slit_math::{median, Polynomial};

use crate::align::{align_or_fallback, Alignment};
use crate::config::{SlitConfig, WavecalParams, WavelengthGrid};
use crate::error::Error;
use crate::extract::{extract_spectra, ExtractedSpectrum};
use crate::identify::{
    detect_fiber_candidates, identify_fibers, upgrade_identification, FiberMap,
};
use crate::image::{smooth_vertical, DetectorImage};
use crate::qc::QcReport;
use crate::resample::{resample, resample_with_relation, ResampledSpectrum};
use crate::trace::{short_trace_fibers, trace_fibers};
use crate::trace_fit::{fit_short_traces, fit_trace_models, TraceTable};
use crate::transmission::{derive_transmission, TransmissionTable};
use crate::wavecal::{calibrate_wavelengths, IdsTable, LineCatalog};

/// Products of the flat-field calibration of one pseudo-slit.
#[derive(Debug, Clone)]
pub struct FlatCalibration {
    /// Identified reference-row columns.
    pub fiber_map: FiberMap,
    /// Fitted trace models, the authoritative slit geometry.
    pub traces: TraceTable,
    /// Extracted flat spectra, input to the transmission correction.
    pub flat_spectra: ExtractedSpectrum,
    /// QC entries of this stage.
    pub qc: QcReport,
}

/// Products of the arc-lamp calibration referencing a flat calibration.
#[derive(Debug, Clone)]
pub struct DispersionCalibration {
    /// Per-fiber wavelength solutions.
    pub ids: IdsTable,
    /// Per-fiber transmission factors from the resampled flat.
    pub transmission: TransmissionTable,
    /// Trace table aligned onto the arc exposure.
    pub arc_traces: TraceTable,
    /// Alignment applied to the flat model, when matching succeeded.
    pub alignment: Option<Alignment>,
    /// QC entries of this stage.
    pub qc: QcReport,
}

/// Derive the geometric calibration of one pseudo-slit from a flat exposure.
///
/// With a prior reference map the faster upgrade identification is attempted
/// first; its non-convergence falls back to blind identification and is
/// flagged in QC rather than failing the run.
pub fn calibrate_flat(
    flat: &DetectorImage,
    prior: Option<&FiberMap>,
    cfg: &SlitConfig,
) -> Result<FlatCalibration, Error> {
    let smoothed = smooth_vertical(flat, cfg.smoothing_half_width, cfg.smoothing);
    let smoothed = smoothed.view();

    let mut qc = QcReport::new();
    let fiber_map = match prior {
        Some(prior_map) => match upgrade_identification(&smoothed, prior_map, cfg)? {
            Some(map) => {
                qc.set_flag("identify.blind_fallback", false);
                map
            }
            None => {
                log::warn!("upgrade identification did not converge, falling back to blind");
                qc.set_flag("identify.blind_fallback", true);
                identify_fibers(&smoothed, cfg)?
            }
        },
        None => identify_fibers(&smoothed, cfg)?,
    };
    qc.set_count("identify.fibers", fiber_map.len());

    let raw_traces = trace_fibers(&smoothed, &fiber_map, cfg);
    let traces = fit_trace_models(&raw_traces, fiber_map.reference_row, cfg)?;
    qc.set_count("trace.lost", traces.lost_count());
    if let Some(rms) = traces.mean_rms() {
        qc.set_float("trace.mean_rms", rms);
    }
    for k in 0..=cfg.trace.order {
        let coeffs: Vec<f64> = traces
            .models
            .iter()
            .filter_map(|m| m.poly.as_ref())
            .filter_map(|p| p.coeffs().get(k).copied())
            .collect();
        if let Some(m) = median(&coeffs) {
            qc.set_float(&format!("trace.median_c{k}"), m);
        }
    }

    let flat_spectra = extract_spectra(flat, &traces, cfg.extraction_half_width);

    Ok(FlatCalibration {
        fiber_map,
        traces,
        flat_spectra,
        qc,
    })
}

/// Align the stored flat geometry onto another exposure of the same
/// configuration.
///
/// Runs an independent candidate detection and short re-trace on the new
/// exposure; any failure on that path degrades to the unmodified flat model.
fn align_onto(
    image: &DetectorImage,
    flat_cal: &FlatCalibration,
    cfg: &SlitConfig,
    qc: &mut QcReport,
) -> (TraceTable, Option<Alignment>) {
    let smoothed = smooth_vertical(image, cfg.smoothing_half_width, cfg.smoothing);

    let candidates = match detect_fiber_candidates(&smoothed.view(), cfg) {
        Ok(map) => map,
        Err(err) => {
            log::warn!("candidate detection failed ({err}), keeping unmodified flat model");
            qc.set_flag("align.skipped", true);
            return (flat_cal.traces.clone(), None);
        }
    };

    let short_raw = short_trace_fibers(&smoothed.view(), &candidates, cfg);
    let short_fit = fit_short_traces(&short_raw, candidates.reference_row, cfg);
    let (aligned, alignment) =
        align_or_fallback(&flat_cal.traces, &short_fit, cfg.align_match_radius);

    qc.set_flag("align.skipped", alignment.is_none());
    if let Some(a) = &alignment {
        qc.set_float("align.dc0", a.dc0);
        qc.set_float("align.dc1", a.dc1);
        qc.set_count("align.matched", a.matched);
    }
    (aligned, alignment)
}

/// Derive wavelength solutions and transmission factors from an arc exposure.
///
/// The flat trace model is first re-aligned onto the arc, the arc is
/// extracted along the aligned traces, lines are matched against the catalog
/// per fiber, and the resampled flat spectra yield the transmission factors
/// over `band`.
pub fn calibrate_arc(
    arc: &DetectorImage,
    flat_cal: &FlatCalibration,
    catalog: &LineCatalog,
    seed: &Polynomial,
    cfg: &SlitConfig,
    wavecal: &WavecalParams,
    grid: &WavelengthGrid,
    band: (f64, f64),
) -> Result<DispersionCalibration, Error> {
    let mut qc = QcReport::new();
    let (arc_traces, alignment) = align_onto(arc, flat_cal, cfg, &mut qc);

    let arc_spectra = extract_spectra(arc, &arc_traces, cfg.extraction_half_width);
    let (ids, diagnostics) = calibrate_wavelengths(&arc_spectra, catalog, seed, wavecal);
    if !ids.is_empty() && ids.lost_count() == ids.len() {
        return Err(Error::AllFibersLost {
            count: ids.len(),
            stage: "wavelength calibration",
        });
    }
    qc.set_count("wavecal.lost", ids.lost_count());
    qc.set_count("wavecal.blind_fallbacks", diagnostics.blind_fallbacks);
    if let Some(rms) = ids.mean_rms_px() {
        qc.set_float("wavecal.mean_rms_px", rms);
    }

    let flat_resampled = resample(&flat_cal.flat_spectra, &ids, grid);
    let transmission = derive_transmission(&flat_resampled, band);
    qc.set_count("transmission.lost", transmission.lost_count());

    Ok(DispersionCalibration {
        ids,
        transmission,
        arc_traces,
        alignment,
        qc,
    })
}

/// Reduce a science exposure with a stored calibration.
///
/// Re-aligns the flat geometry onto the exposure, extracts along the aligned
/// traces, resamples onto the uniform grid, and applies the transmission
/// correction.
pub fn reduce(
    image: &DetectorImage,
    flat_cal: &FlatCalibration,
    dispersion: &DispersionCalibration,
    cfg: &SlitConfig,
    grid: &WavelengthGrid,
) -> Result<(ResampledSpectrum, QcReport), Error> {
    if dispersion.ids.len() != flat_cal.traces.len() {
        return Err(Error::FiberTableMismatch {
            expected: flat_cal.traces.len(),
            got: dispersion.ids.len(),
        });
    }
    let mut qc = QcReport::new();
    let (traces, _) = align_onto(image, flat_cal, cfg, &mut qc);

    let spectra = extract_spectra(image, &traces, cfg.extraction_half_width);
    let mut resampled = resample(&spectra, &dispersion.ids, grid);
    dispersion.transmission.apply(&mut resampled);

    let lost = resampled.valid.iter().filter(|&&v| !v).count();
    qc.set_count("reduce.lost", lost);
    Ok((resampled, qc))
}

/// Reduce a science exposure without an arc calibration.
///
/// The seed pixel-to-wavelength relation stands in for every fiber's IDS at
/// degraded accuracy and no transmission correction is applied.
pub fn reduce_with_relation(
    image: &DetectorImage,
    flat_cal: &FlatCalibration,
    relation: &Polynomial,
    cfg: &SlitConfig,
    grid: &WavelengthGrid,
) -> Result<(ResampledSpectrum, QcReport), Error> {
    let mut qc = QcReport::new();
    qc.set_flag("reduce.seed_relation", true);
    let (traces, _) = align_onto(image, flat_cal, cfg, &mut qc);

    let spectra = extract_spectra(image, &traces, cfg.extraction_half_width);
    let resampled = resample_with_relation(&spectra, relation, grid);

    let lost = resampled.valid.iter().filter(|&&v| !v).count();
    qc.set_count("reduce.lost", lost);
    Ok((resampled, qc))
}
