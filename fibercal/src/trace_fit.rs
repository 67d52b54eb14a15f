//! Per-fiber trace model fitting with the dead-fiber rejection budget.
//!
//! Each raw trace is fit by a polynomial in `row - reference_row` with
//! iterative outlier rejection. The constant coefficient is therefore the
//! fiber's column at the reference row and the linear coefficient its local
//! slope, which keeps alignment corrections a plain coefficient shift.

use rayon::prelude::*;

use slit_math::{fit_robust, Polynomial};

use crate::config::SlitConfig;
use crate::error::Error;
use crate::trace::RawTrace;

/// Geometric model of one fiber: polynomial in `row - reference_row`
/// yielding the fractional column.
#[derive(Debug, Clone)]
pub struct TraceModel {
    /// Fiber index within the pseudo-slit.
    pub fiber: usize,
    /// Fitted polynomial; `None` for a dead fiber.
    pub poly: Option<Polynomial>,
    /// RMS residual of the surviving trace samples, in columns.
    pub rms: Option<f64>,
    /// Invalid trace samples plus samples rejected during fitting.
    pub rejected: usize,
}

impl TraceModel {
    /// Whether the fiber has a usable geometric model.
    pub fn is_valid(&self) -> bool {
        self.poly.is_some()
    }

    /// Predicted column at a detector row, for a valid model.
    pub fn column_at(&self, row: f64, reference_row: usize) -> Option<f64> {
        self.poly
            .as_ref()
            .map(|p| p.eval(row - reference_row as f64))
    }
}

/// Immutable per-slit table of trace models, index-aligned with the fiber
/// map that produced it.
#[derive(Debug, Clone)]
pub struct TraceTable {
    /// Reference row the model abscissa is centered on.
    pub reference_row: usize,
    /// One model per fiber.
    pub models: Vec<TraceModel>,
}

impl TraceTable {
    /// Number of fibers in the table.
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// True when the table holds no fibers.
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Number of dead fibers.
    pub fn lost_count(&self) -> usize {
        self.models.iter().filter(|m| !m.is_valid()).count()
    }

    /// Predicted column of a fiber at a row, when its model is valid.
    pub fn column_at(&self, fiber: usize, row: f64) -> Option<f64> {
        self.models
            .get(fiber)
            .and_then(|m| m.column_at(row, self.reference_row))
    }

    /// Mean fit RMS over valid fibers.
    pub fn mean_rms(&self) -> Option<f64> {
        let rms: Vec<f64> = self.models.iter().filter_map(|m| m.rms).collect();
        if rms.is_empty() {
            None
        } else {
            Some(rms.iter().sum::<f64>() / rms.len() as f64)
        }
    }
}

/// Maximum tolerated invalid-plus-rejected samples before a fiber is
/// declared dead.
///
/// `(above - above/step) + (below - below/step) + reject_fraction * (above + below)/step`
/// with integer division on the sampled counts. Kept as given instrument
/// policy.
pub fn rejection_budget(cfg: &SlitConfig) -> f64 {
    let step = cfg.trace_step.max(1);
    let absolute = (cfg.rows_above - cfg.rows_above / step)
        + (cfg.rows_below - cfg.rows_below / step);
    let fractional = cfg.trace.reject_fraction
        * ((cfg.rows_above + cfg.rows_below) / step) as f64;
    absolute as f64 + fractional
}

fn fit_one(trace: &RawTrace, reference_row: usize, cfg: &SlitConfig, budget: f64) -> TraceModel {
    let (rows, cols) = trace.valid_samples();
    let centered: Vec<f64> = rows.iter().map(|r| r - reference_row as f64).collect();
    let invalid = trace.invalid_count();

    let fit = match fit_robust(
        &centered,
        &cols,
        cfg.trace.order,
        cfg.trace.tolerance,
        cfg.trace.max_iterations,
    ) {
        Ok(fit) => fit,
        Err(err) => {
            log::debug!("fiber {}: trace fit failed: {err}", trace.fiber);
            return TraceModel {
                fiber: trace.fiber,
                poly: None,
                rms: None,
                rejected: trace.positions.len(),
            };
        }
    };

    let rejected = invalid + fit.rejected;
    if rejected as f64 > budget {
        log::debug!(
            "fiber {}: {rejected} samples over budget {budget:.1}, marking dead",
            trace.fiber
        );
        return TraceModel {
            fiber: trace.fiber,
            poly: None,
            rms: None,
            rejected,
        };
    }

    TraceModel {
        fiber: trace.fiber,
        poly: Some(fit.poly),
        rms: Some(fit.rms),
        rejected,
    }
}

/// Fit trace models for all fibers of a slit.
///
/// Fibers exceeding the rejection budget are recorded as dead rather than
/// failing the run; only a slit with no surviving fiber at all is fatal.
pub fn fit_trace_models(
    traces: &[RawTrace],
    reference_row: usize,
    cfg: &SlitConfig,
) -> Result<TraceTable, Error> {
    let budget = rejection_budget(cfg);
    let models: Vec<TraceModel> = traces
        .par_iter()
        .map(|t| fit_one(t, reference_row, cfg, budget))
        .collect();

    let table = TraceTable {
        reference_row,
        models,
    };
    if !table.is_empty() && table.lost_count() == table.len() {
        return Err(Error::AllFibersLost {
            count: table.len(),
            stage: "trace fit",
        });
    }
    log::info!(
        "trace fit: {}/{} fibers valid, mean rms {:.3}",
        table.len() - table.lost_count(),
        table.len(),
        table.mean_rms().unwrap_or(f64::NAN)
    );
    Ok(table)
}

/// Fit linear short-trace models for cross-exposure alignment.
///
/// The short re-trace covers too few rows to constrain the full trace order;
/// offset and slope at the reference row are all the aligner needs. No
/// rejection budget applies: a fiber that cannot be fit is simply skipped by
/// the aligner.
pub fn fit_short_traces(traces: &[RawTrace], reference_row: usize, cfg: &SlitConfig) -> TraceTable {
    let models: Vec<TraceModel> = traces
        .par_iter()
        .map(|trace| {
            let (rows, cols) = trace.valid_samples();
            let centered: Vec<f64> =
                rows.iter().map(|r| r - reference_row as f64).collect();
            match fit_robust(&centered, &cols, 1, cfg.trace.tolerance, cfg.trace.max_iterations)
            {
                Ok(fit) => TraceModel {
                    fiber: trace.fiber,
                    poly: Some(fit.poly),
                    rms: Some(fit.rms),
                    rejected: trace.invalid_count() + fit.rejected,
                },
                Err(_) => TraceModel {
                    fiber: trace.fiber,
                    poly: None,
                    rms: None,
                    rejected: trace.positions.len(),
                },
            }
        })
        .collect();

    TraceTable {
        reference_row,
        models,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::FiberPosition;
    use approx::assert_relative_eq;

    fn synthetic_trace(fiber: usize, poly: &Polynomial, rows: std::ops::Range<usize>) -> RawTrace {
        let reference_row = 40.0;
        RawTrace {
            fiber,
            positions: rows
                .map(|r| FiberPosition {
                    row: r,
                    column: poly.eval(r as f64 - reference_row),
                    valid: true,
                })
                .collect(),
        }
    }

    fn test_config() -> SlitConfig {
        SlitConfig {
            reference_row: 40,
            rows_above: 40,
            rows_below: 40,
            trace_step: 1,
            trace: crate::config::TraceParams {
                order: 2,
                tolerance: 0.3,
                reject_fraction: 0.25,
                max_iterations: 10,
            },
            ..SlitConfig::default()
        }
    }

    #[test]
    fn test_budget_formula() {
        let cfg = test_config();
        // step 1: absolute terms vanish, 0.25 * 80 sampled rows = 20.
        assert_relative_eq!(rejection_budget(&cfg), 20.0);

        let stepped = SlitConfig {
            trace_step: 5,
            ..test_config()
        };
        // (40 - 8) * 2 + 0.25 * 16 = 68.
        assert_relative_eq!(rejection_budget(&stepped), 68.0);
    }

    #[test]
    fn test_reference_row_column_recovered() {
        let cfg = test_config();
        let truth = Polynomial::new(vec![25.4, 0.05, 0.0004]);
        let raw = vec![synthetic_trace(0, &truth, 0..81)];

        let table = fit_trace_models(&raw, cfg.reference_row, &cfg).unwrap();
        let at_reference = table.column_at(0, 40.0).unwrap();
        assert_relative_eq!(at_reference, 25.4, epsilon = 1e-6);
        assert!(table.models[0].rms.unwrap() < 1e-9);
    }

    #[test]
    fn test_budget_boundary_exact_and_one_over() {
        let cfg = test_config();
        let truth = Polynomial::new(vec![25.0, 0.05]);
        let budget = rejection_budget(&cfg) as usize;

        // Exactly at the budget: still valid.
        let mut at_budget = synthetic_trace(0, &truth, 0..81);
        for p in at_budget.positions.iter_mut().take(budget) {
            p.valid = false;
        }
        // One over the budget: dead.
        let mut over_budget = synthetic_trace(1, &truth, 0..81);
        for p in over_budget.positions.iter_mut().take(budget + 1) {
            p.valid = false;
        }

        let table =
            fit_trace_models(&[at_budget, over_budget], cfg.reference_row, &cfg).unwrap();
        assert!(table.models[0].is_valid(), "at budget must stay valid");
        assert!(!table.models[1].is_valid(), "over budget must be dead");
        assert_eq!(table.lost_count(), 1);
    }

    #[test]
    fn test_fit_idempotent() {
        let cfg = test_config();
        let truth = Polynomial::new(vec![25.0, -0.03, 0.0002]);
        let mut raw = synthetic_trace(0, &truth, 0..81);
        // A few outliers to exercise the rejection path.
        raw.positions[10].column += 2.0;
        raw.positions[60].column -= 1.5;

        let a = fit_trace_models(std::slice::from_ref(&raw), cfg.reference_row, &cfg).unwrap();
        let b = fit_trace_models(std::slice::from_ref(&raw), cfg.reference_row, &cfg).unwrap();
        assert_eq!(
            a.models[0].poly.as_ref().unwrap(),
            b.models[0].poly.as_ref().unwrap(),
            "refitting the same trace must reproduce identical coefficients"
        );
    }

    #[test]
    fn test_all_dead_is_fatal() {
        let cfg = test_config();
        let truth = Polynomial::new(vec![25.0, 0.0]);
        let mut raw = synthetic_trace(0, &truth, 0..81);
        for p in raw.positions.iter_mut() {
            p.valid = false;
        }

        assert!(matches!(
            fit_trace_models(&[raw], cfg.reference_row, &cfg),
            Err(Error::AllFibersLost {
                count: 1,
                stage: "trace fit"
            })
        ));
    }

    #[test]
    fn test_short_fit_offset_and_slope() {
        let cfg = test_config();
        let truth = Polynomial::new(vec![30.0, 0.1]);
        let raw = vec![synthetic_trace(0, &truth, 35..46)];

        let table = fit_short_traces(&raw, cfg.reference_row, &cfg);
        let poly = table.models[0].poly.as_ref().unwrap();
        assert_relative_eq!(poly.coeffs()[0], 30.0, epsilon = 1e-9);
        assert_relative_eq!(poly.coeffs()[1], 0.1, epsilon = 1e-9);
    }
}
