//! Rigid re-alignment of a flat-derived trace model onto a later exposure.
//!
//! Instrument flexure shifts every fiber by nearly the same column offset and
//! slope between exposures. A short re-trace of the new exposure is matched
//! fiber-to-fiber against the flat model at the shared reference row, and the
//! mean offset and slope difference of the surviving matches are applied as a
//! two-parameter correction to the full model.

use slit_math::median;

use crate::trace_fit::{TraceModel, TraceTable};

/// Result of a successful trace alignment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Alignment {
    /// Mean column offset at the reference row.
    pub dc0: f64,
    /// Mean slope difference at the reference row.
    pub dc1: f64,
    /// Matches that survived outlier rejection.
    pub matched: usize,
    /// Matches discarded as outliers.
    pub discarded: usize,
}

/// Offset and slope of a valid model at the reference row.
///
/// Models are fit in `row - reference_row`, so these are the first two
/// coefficients directly.
fn offset_and_slope(model: &TraceModel) -> Option<(f64, f64)> {
    let poly = model.poly.as_ref()?;
    let coeffs = poly.coeffs();
    let c0 = coeffs.first().copied()?;
    let c1 = coeffs.get(1).copied().unwrap_or(0.0);
    Some((c0, c1))
}

/// Match an observed short-trace fit against the flat model and compute the
/// rigid correction.
///
/// Pairs are formed by nearest-column proximity at the reference row within
/// `match_radius`; pairs whose offset deviates from the median offset by more
/// than half the radius are discarded. Returns `None` when fewer than two
/// matches survive, in which case the caller keeps the unmodified flat model
/// as a degraded-quality fallback.
pub fn solve_alignment(
    flat: &TraceTable,
    observed: &TraceTable,
    match_radius: f64,
) -> Option<Alignment> {
    let flat_anchors: Vec<(f64, f64)> = flat
        .models
        .iter()
        .filter_map(offset_and_slope)
        .collect();
    if flat_anchors.is_empty() {
        return None;
    }

    let mut offsets = Vec::new();
    let mut slopes = Vec::new();
    for model in &observed.models {
        let Some((col, slope)) = offset_and_slope(model) else {
            continue;
        };
        let nearest = flat_anchors
            .iter()
            .min_by(|a, b| {
                (a.0 - col)
                    .abs()
                    .partial_cmp(&(b.0 - col).abs())
                    .unwrap()
            })
            .unwrap();
        if (col - nearest.0).abs() <= match_radius {
            offsets.push(col - nearest.0);
            slopes.push(slope - nearest.1);
        }
    }

    let median_offset = median(&offsets)?;
    let keep: Vec<bool> = offsets
        .iter()
        .map(|&d| (d - median_offset).abs() <= 0.5 * match_radius)
        .collect();
    let survivors = keep.iter().filter(|&&k| k).count();
    if survivors < 2 {
        return None;
    }

    let dc0 = offsets
        .iter()
        .zip(&keep)
        .filter(|(_, &k)| k)
        .map(|(&d, _)| d)
        .sum::<f64>()
        / survivors as f64;
    let dc1 = slopes
        .iter()
        .zip(&keep)
        .filter(|(_, &k)| k)
        .map(|(&d, _)| d)
        .sum::<f64>()
        / survivors as f64;

    Some(Alignment {
        dc0,
        dc1,
        matched: survivors,
        discarded: offsets.len() - survivors,
    })
}

/// Apply a rigid correction to every valid fiber of a flat model.
///
/// Coefficients are in powers of `row - reference_row`, so the correction is
/// a plain shift of the constant and linear terms; RMS and validity carry
/// over unchanged.
pub fn apply_alignment(flat: &TraceTable, alignment: &Alignment) -> TraceTable {
    let models = flat
        .models
        .iter()
        .map(|m| TraceModel {
            fiber: m.fiber,
            poly: m.poly.as_ref().map(|p| p.shifted(alignment.dc0, alignment.dc1)),
            rms: m.rms,
            rejected: m.rejected,
        })
        .collect();
    TraceTable {
        reference_row: flat.reference_row,
        models,
    }
}

/// Align the flat model onto a new exposure, falling back to the unmodified
/// model when matching fails.
pub fn align_or_fallback(
    flat: &TraceTable,
    observed: &TraceTable,
    match_radius: f64,
) -> (TraceTable, Option<Alignment>) {
    match solve_alignment(flat, observed, match_radius) {
        Some(alignment) => {
            log::info!(
                "trace alignment: dc0={:+.3} dc1={:+.5} from {} fibers ({} discarded)",
                alignment.dc0,
                alignment.dc1,
                alignment.matched,
                alignment.discarded
            );
            (apply_alignment(flat, &alignment), Some(alignment))
        }
        None => {
            log::warn!("trace alignment failed, keeping unmodified flat model");
            (flat.clone(), None)
        }
    }
}
