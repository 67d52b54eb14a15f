//! Fiber tracing: following each identified fiber outward from the
//! reference row.
//!
//! The tracer marches row by row (optionally skipping rows for speed) and
//! searches a fixed-radius window anchored on the previous estimate. A row
//! where no significant interior peak is found is recorded as invalid while
//! the anchor holds at the last known column, so the march recovers when the
//! fiber reappears.

use ndarray::ArrayView2;
use rayon::prelude::*;

use crate::config::SlitConfig;
use crate::identify::FiberMap;
use crate::peaks::{peak_in_window, significance_threshold};

/// One trace sample: fractional column of a fiber at a detector row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FiberPosition {
    /// Detector row the sample was taken at.
    pub row: usize,
    /// Fractional column; for an invalid sample this is the held anchor.
    pub column: f64,
    /// Whether a significant peak was actually found at this row.
    pub valid: bool,
}

/// Raw centroid sequence of one fiber, ordered by ascending row.
#[derive(Debug, Clone)]
pub struct RawTrace {
    /// Fiber index within the pseudo-slit.
    pub fiber: usize,
    /// Samples at the traced rows.
    pub positions: Vec<FiberPosition>,
}

impl RawTrace {
    /// Rows and columns of the valid samples, as fit inputs.
    pub fn valid_samples(&self) -> (Vec<f64>, Vec<f64>) {
        let mut rows = Vec::with_capacity(self.positions.len());
        let mut cols = Vec::with_capacity(self.positions.len());
        for p in self.positions.iter().filter(|p| p.valid) {
            rows.push(p.row as f64);
            cols.push(p.column);
        }
        (rows, cols)
    }

    /// Number of rows where no peak was found.
    pub fn invalid_count(&self) -> usize {
        self.positions.iter().filter(|p| !p.valid).count()
    }
}

/// Rows sampled by the tracer and the index of the reference row within
/// them. Shared by all fibers of a slit.
fn sampled_rows(
    reference_row: usize,
    above: usize,
    below: usize,
    step: usize,
    image_rows: usize,
) -> (Vec<usize>, usize) {
    let step = step.max(1);
    let lowest = reference_row.saturating_sub(below);
    let highest = (reference_row + above).min(image_rows - 1);

    let mut rows = Vec::new();
    let mut r = reference_row;
    while r > lowest {
        r = r.saturating_sub(step);
        if r < lowest {
            break;
        }
        rows.push(r);
    }
    rows.reverse();
    let reference_index = rows.len();
    rows.push(reference_row);
    let mut r = reference_row;
    while r + step <= highest {
        r += step;
        rows.push(r);
    }
    (rows, reference_index)
}

/// Per-row profiles and significance floors for the sampled rows.
fn row_profiles(
    smoothed: &ArrayView2<'_, f64>,
    rows: &[usize],
    detection_sigma: f64,
) -> (Vec<Vec<f64>>, Vec<f64>) {
    let profiles: Vec<Vec<f64>> = rows.iter().map(|&r| smoothed.row(r).to_vec()).collect();
    let floors: Vec<f64> = profiles
        .iter()
        .map(|p| significance_threshold(p, detection_sigma).unwrap_or(f64::INFINITY))
        .collect();
    (profiles, floors)
}

fn trace_one(
    profiles: &[Vec<f64>],
    floors: &[f64],
    rows: &[usize],
    reference_index: usize,
    fiber: usize,
    start_column: f64,
    radius: usize,
) -> RawTrace {
    let mut positions = vec![
        FiberPosition {
            row: 0,
            column: 0.0,
            valid: false,
        };
        rows.len()
    ];
    positions[reference_index] = FiberPosition {
        row: rows[reference_index],
        column: start_column,
        valid: true,
    };

    // Upward march, then a fresh downward march from the same start.
    for (range, ascending) in [
        (reference_index + 1..rows.len(), true),
        (0..reference_index, false),
    ] {
        let mut anchor = start_column;
        let indices: Vec<usize> = if ascending {
            range.collect()
        } else {
            range.rev().collect()
        };
        for i in indices {
            match peak_in_window(&profiles[i], anchor, radius, floors[i]) {
                Some(column) => {
                    positions[i] = FiberPosition {
                        row: rows[i],
                        column,
                        valid: true,
                    };
                    anchor = column;
                }
                None => {
                    positions[i] = FiberPosition {
                        row: rows[i],
                        column: anchor,
                        valid: false,
                    };
                }
            }
        }
    }

    RawTrace { fiber, positions }
}

/// Trace all fibers of a map across the configured row range.
///
/// Produces one [`RawTrace`] per fiber, index-aligned with the map. Fibers
/// are independent and traced in parallel.
pub fn trace_fibers(
    smoothed: &ArrayView2<'_, f64>,
    map: &FiberMap,
    cfg: &SlitConfig,
) -> Vec<RawTrace> {
    trace_range(
        smoothed,
        map,
        cfg,
        cfg.rows_above,
        cfg.rows_below,
        cfg.trace_step,
    )
}

/// Short re-trace around the reference row for cross-exposure alignment.
///
/// Covers `cfg.short_trace_radius` rows on each side at unit step; the map
/// may come from independent candidate detection rather than full
/// identification.
pub fn short_trace_fibers(
    smoothed: &ArrayView2<'_, f64>,
    map: &FiberMap,
    cfg: &SlitConfig,
) -> Vec<RawTrace> {
    trace_range(
        smoothed,
        map,
        cfg,
        cfg.short_trace_radius,
        cfg.short_trace_radius,
        1,
    )
}

fn trace_range(
    smoothed: &ArrayView2<'_, f64>,
    map: &FiberMap,
    cfg: &SlitConfig,
    above: usize,
    below: usize,
    step: usize,
) -> Vec<RawTrace> {
    let (rows, reference_index) = sampled_rows(
        map.reference_row,
        above,
        below,
        step,
        smoothed.nrows(),
    );
    let (profiles, floors) = row_profiles(smoothed, &rows, cfg.detection_sigma);

    map.columns
        .par_iter()
        .enumerate()
        .map(|(fiber, &start)| {
            trace_one(
                &profiles,
                &floors,
                &rows,
                reference_index,
                fiber,
                start,
                cfg.search_radius,
            )
        })
        .collect()
}
