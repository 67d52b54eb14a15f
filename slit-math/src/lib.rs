//! Numerical support for the fiber calibration pipeline.
//!
//! Small, dependency-light building blocks shared by the calibration stages:
//! polynomial least-squares fitting with iterative outlier rejection, robust
//! statistics for noise estimation, and linear interpolation on sampled grids.

pub mod interp;
pub mod polynomial;
pub mod stats;

pub use interp::{bracket_ascending, lerp_at};
pub use polynomial::{fit_polynomial, fit_robust, FitError, Polynomial, RobustFit};
pub use stats::{mean_std, median, robust_sigma};
