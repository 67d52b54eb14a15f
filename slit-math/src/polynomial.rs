//! Polynomial least-squares fitting with iterative outlier rejection.
//!
//! The calibration pipeline fits low-order polynomials to noisy per-fiber
//! samples (trace centroids, arc line positions). Fits are solved by SVD on
//! the Vandermonde system and optionally iterated with residual-based
//! rejection until the surviving sample set is stable.

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

/// Errors that can occur while fitting a polynomial
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    /// Fewer samples than coefficients to solve for.
    #[error("insufficient samples: need at least {needed}, got {got}")]
    InsufficientData { needed: usize, got: usize },

    /// Sample and value slices differ in length.
    #[error("length mismatch: {x_len} abscissae vs {y_len} ordinates")]
    LengthMismatch { x_len: usize, y_len: usize },

    /// The SVD solve failed to produce a solution.
    #[error("singular least-squares system")]
    SingularSystem,
}

/// Dense polynomial with coefficients in ascending-power order.
///
/// `coeffs[k]` multiplies `x^k`. Evaluation uses Horner's scheme.
#[derive(Debug, Clone, PartialEq)]
pub struct Polynomial {
    coeffs: Vec<f64>,
}

impl Polynomial {
    /// Create a polynomial from ascending-power coefficients.
    ///
    /// An empty coefficient list is treated as the zero polynomial.
    pub fn new(coeffs: Vec<f64>) -> Self {
        Self { coeffs }
    }

    /// Ascending-power coefficients.
    pub fn coeffs(&self) -> &[f64] {
        &self.coeffs
    }

    /// Polynomial degree (0 for constants and the zero polynomial).
    pub fn degree(&self) -> usize {
        self.coeffs.len().saturating_sub(1)
    }

    /// Evaluate at `x` using Horner's scheme.
    pub fn eval(&self, x: f64) -> f64 {
        self.coeffs
            .iter()
            .rev()
            .fold(0.0, |acc, &c| acc.mul_add(x, c))
    }

    /// First derivative evaluated at `x`.
    pub fn derivative_at(&self, x: f64) -> f64 {
        self.coeffs
            .iter()
            .enumerate()
            .skip(1)
            .rev()
            .fold(0.0, |acc, (k, &c)| acc.mul_add(x, k as f64 * c))
    }

    /// Shift the constant and linear coefficients by `dc0` and `dc1`.
    ///
    /// Used by trace alignment to apply a rigid offset+slope correction
    /// without refitting.
    pub fn shifted(&self, dc0: f64, dc1: f64) -> Self {
        let mut coeffs = self.coeffs.clone();
        if coeffs.is_empty() {
            coeffs.push(0.0);
        }
        coeffs[0] += dc0;
        if coeffs.len() > 1 {
            coeffs[1] += dc1;
        } else if dc1 != 0.0 {
            coeffs.push(dc1);
        }
        Self { coeffs }
    }

    /// Invert a monotonic polynomial by bisection on `[lo, hi]`.
    ///
    /// Returns the abscissa where the polynomial equals `target`, or `None`
    /// when `target` is not bracketed by the interval endpoints.
    pub fn invert_monotonic(&self, target: f64, lo: f64, hi: f64) -> Option<f64> {
        let (f_lo, f_hi) = (self.eval(lo), self.eval(hi));
        let ascending = f_hi >= f_lo;
        let (mut below, mut above) = if ascending { (lo, hi) } else { (hi, lo) };
        if target < f_lo.min(f_hi) || target > f_lo.max(f_hi) {
            return None;
        }
        // 60 halvings take any detector-scale interval below 1e-12 px.
        for _ in 0..60 {
            let mid = 0.5 * (below + above);
            if self.eval(mid) < target {
                below = mid;
            } else {
                above = mid;
            }
        }
        Some(0.5 * (below + above))
    }
}

/// Result of a robust polynomial fit
#[derive(Debug, Clone)]
pub struct RobustFit {
    /// Fitted polynomial over the surviving samples.
    pub poly: Polynomial,
    /// Root-mean-square residual of the surviving samples.
    pub rms: f64,
    /// Number of samples that survived rejection.
    pub used: usize,
    /// Number of samples rejected across all iterations.
    pub rejected: usize,
    /// Number of fit iterations performed.
    pub iterations: usize,
}

/// Fit a polynomial of the given order by linear least squares.
///
/// Solves the Vandermonde system with SVD, which tolerates the mild
/// ill-conditioning of detector-scale abscissae at the orders used here.
///
/// # Arguments
/// * `x` - Sample abscissae
/// * `y` - Sample ordinates, same length as `x`
/// * `order` - Polynomial order (number of coefficients minus one)
///
/// # Errors
/// * `FitError::LengthMismatch` - If `x` and `y` differ in length
/// * `FitError::InsufficientData` - If fewer than `order + 1` samples
/// * `FitError::SingularSystem` - If the SVD solve fails
pub fn fit_polynomial(x: &[f64], y: &[f64], order: usize) -> Result<Polynomial, FitError> {
    if x.len() != y.len() {
        return Err(FitError::LengthMismatch {
            x_len: x.len(),
            y_len: y.len(),
        });
    }
    let n_coeffs = order + 1;
    if x.len() < n_coeffs {
        return Err(FitError::InsufficientData {
            needed: n_coeffs,
            got: x.len(),
        });
    }

    let design = DMatrix::from_fn(x.len(), n_coeffs, |i, j| x[i].powi(j as i32));
    let rhs = DVector::from_column_slice(y);

    let solution = design
        .svd(true, true)
        .solve(&rhs, 1e-12)
        .map_err(|_| FitError::SingularSystem)?;

    Ok(Polynomial::new(solution.iter().copied().collect()))
}

/// Fit a polynomial with iterative rejection of outlying samples.
///
/// Fits all samples, discards those whose absolute residual exceeds
/// `tolerance`, and refits until no sample is rejected or `max_iterations`
/// is reached. The rejection count accumulates across iterations so callers
/// can charge it against a dead-fiber budget.
///
/// # Arguments
/// * `x` - Sample abscissae
/// * `y` - Sample ordinates, same length as `x`
/// * `order` - Polynomial order
/// * `tolerance` - Absolute residual above which a sample is discarded
/// * `max_iterations` - Cap on refit rounds
///
/// # Errors
/// Propagates [`fit_polynomial`] errors; `InsufficientData` also fires when
/// rejection leaves fewer samples than coefficients.
pub fn fit_robust(
    x: &[f64],
    y: &[f64],
    order: usize,
    tolerance: f64,
    max_iterations: usize,
) -> Result<RobustFit, FitError> {
    if x.len() != y.len() {
        return Err(FitError::LengthMismatch {
            x_len: x.len(),
            y_len: y.len(),
        });
    }

    let mut active_x: Vec<f64> = x.to_vec();
    let mut active_y: Vec<f64> = y.to_vec();
    let mut rejected = 0usize;
    let mut iterations = 0usize;

    loop {
        iterations += 1;
        let poly = fit_polynomial(&active_x, &active_y, order)?;

        let keep: Vec<bool> = active_x
            .iter()
            .zip(active_y.iter())
            .map(|(&xi, &yi)| (yi - poly.eval(xi)).abs() <= tolerance)
            .collect();
        let n_dropped = keep.iter().filter(|&&k| !k).count();

        if n_dropped == 0 || iterations >= max_iterations {
            let rms = residual_rms(&poly, &active_x, &active_y);
            return Ok(RobustFit {
                poly,
                rms,
                used: active_x.len(),
                rejected,
                iterations,
            });
        }

        rejected += n_dropped;
        let mut keep_iter = keep.iter();
        active_x.retain(|_| *keep_iter.next().unwrap());
        let mut keep_iter = keep.iter();
        active_y.retain(|_| *keep_iter.next().unwrap());
    }
}

fn residual_rms(poly: &Polynomial, x: &[f64], y: &[f64]) -> f64 {
    if x.is_empty() {
        return 0.0;
    }
    let ss: f64 = x
        .iter()
        .zip(y.iter())
        .map(|(&xi, &yi)| (yi - poly.eval(xi)).powi(2))
        .sum();
    (ss / x.len() as f64).sqrt()
}
