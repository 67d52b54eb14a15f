//! Fiber identification on the reference row of a smoothed flat.
//!
//! Blind identification scans the full reference-row profile and must find
//! exactly the nominal fiber population. Upgrade identification re-locates
//! each fiber of a prior reference map within a small tolerance radius, which
//! survives low-contrast regions where blind thresholding loses peaks; its
//! failure is a returned `None` so the caller can fall back to blind mode.

use ndarray::ArrayView2;

use crate::config::SlitConfig;
use crate::error::Error;
use crate::peaks::{find_peaks, peak_in_window};

/// Reference-row columns of all fibers of a pseudo-slit, in ascending
/// spatial order. Index position is the fiber index used by every
/// downstream table.
#[derive(Debug, Clone, PartialEq)]
pub struct FiberMap {
    /// Reference row the columns were measured on.
    pub reference_row: usize,
    /// Per-fiber fractional column on the reference row.
    pub columns: Vec<f64>,
}

impl FiberMap {
    /// Number of fibers in the map.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// True when the map holds no fibers.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

fn reference_profile(
    smoothed: &ArrayView2<'_, f64>,
    cfg: &SlitConfig,
) -> Result<Vec<f64>, Error> {
    if cfg.reference_row >= smoothed.nrows() {
        return Err(Error::ReferenceRowOutOfBounds {
            row: cfg.reference_row,
            rows: smoothed.nrows(),
        });
    }
    Ok(smoothed.row(cfg.reference_row).to_vec())
}

fn outside_zero_order(position: f64, cfg: &SlitConfig) -> bool {
    match cfg.zero_order_column {
        Some(col) => (position - col).abs() > cfg.min_separation,
        None => true,
    }
}

/// Blind identification: every significant reference-row peak is a fiber.
///
/// Peaks adjacent to the configured zero-order contamination column are
/// ignored. Exactly `cfg.fiber_count` survivors are required under nominal
/// geometry.
///
/// # Errors
/// * `Error::NoFibersFound` - No significant peak on the reference row
/// * `Error::FiberCountMismatch` - Peak count diverges from the nominal count
pub fn identify_fibers(
    smoothed: &ArrayView2<'_, f64>,
    cfg: &SlitConfig,
) -> Result<FiberMap, Error> {
    let profile = reference_profile(smoothed, cfg)?;
    let columns: Vec<f64> = find_peaks(&profile, cfg.detection_sigma, cfg.min_separation)
        .into_iter()
        .map(|p| p.position)
        .filter(|&p| outside_zero_order(p, cfg))
        .collect();

    if columns.is_empty() {
        return Err(Error::NoFibersFound {
            row: cfg.reference_row,
        });
    }
    if columns.len() != cfg.fiber_count {
        return Err(Error::FiberCountMismatch {
            expected: cfg.fiber_count,
            found: columns.len(),
        });
    }

    Ok(FiberMap {
        reference_row: cfg.reference_row,
        columns,
    })
}

/// Detect reference-row peaks without enforcing the nominal count.
///
/// Used to seed the short re-trace of a non-flat exposure, where only a
/// subset of fibers may show enough signal.
pub fn detect_fiber_candidates(
    smoothed: &ArrayView2<'_, f64>,
    cfg: &SlitConfig,
) -> Result<FiberMap, Error> {
    let profile = reference_profile(smoothed, cfg)?;
    let columns: Vec<f64> = find_peaks(&profile, cfg.detection_sigma, cfg.min_separation)
        .into_iter()
        .map(|p| p.position)
        .filter(|&p| outside_zero_order(p, cfg))
        .collect();
    if columns.is_empty() {
        return Err(Error::NoFibersFound {
            row: cfg.reference_row,
        });
    }
    Ok(FiberMap {
        reference_row: cfg.reference_row,
        columns,
    })
}

/// Upgrade identification from a prior reference map.
///
/// Each expected fiber is re-located within `cfg.identify_tolerance` columns
/// of its prior position. Returns `None` when any fiber fails to converge or
/// the recovered ordering is no longer strictly ascending; the caller then
/// falls back to blind identification.
pub fn upgrade_identification(
    smoothed: &ArrayView2<'_, f64>,
    prior: &FiberMap,
    cfg: &SlitConfig,
) -> Result<Option<FiberMap>, Error> {
    let profile = reference_profile(smoothed, cfg)?;
    if prior.len() != cfg.fiber_count {
        return Ok(None);
    }

    let radius = cfg.identify_tolerance.ceil().max(1.0) as usize;
    let mut columns = Vec::with_capacity(prior.len());
    for &expected in &prior.columns {
        match peak_in_window(&profile, expected, radius, 0.0) {
            Some(found) if (found - expected).abs() <= cfg.identify_tolerance => {
                columns.push(found)
            }
            _ => return Ok(None),
        }
    }

    // Re-located peaks must preserve the spatial ordering of the slit.
    if columns.windows(2).any(|w| w[1] <= w[0]) {
        return Ok(None);
    }

    Ok(Some(FiberMap {
        reference_row: cfg.reference_row,
        columns,
    }))
}
