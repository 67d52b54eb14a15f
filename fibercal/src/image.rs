//! Detector image container and vertical smoothing.
//!
//! Images follow the ndarray convention used across the workspace: axis 0 is
//! the detector row (dispersion direction), axis 1 the column (spatial
//! direction across the pseudo-slit).

use ndarray::{Array2, ArrayView1, ArrayView2};

use crate::config::SmoothingKind;
use crate::error::Error;

/// Bias-subtracted detector image with an optional variance plane.
#[derive(Debug, Clone)]
pub struct DetectorImage {
    flux: Array2<f64>,
    variance: Option<Array2<f64>>,
}

impl DetectorImage {
    /// Wrap a flux plane, validating that it is non-empty.
    pub fn new(flux: Array2<f64>) -> Result<Self, Error> {
        let (rows, cols) = flux.dim();
        if rows == 0 || cols == 0 {
            return Err(Error::EmptyImage { rows, cols });
        }
        Ok(Self {
            flux,
            variance: None,
        })
    }

    /// Wrap flux and variance planes, validating matching shapes.
    pub fn with_variance(flux: Array2<f64>, variance: Array2<f64>) -> Result<Self, Error> {
        let image = Self::new(flux)?;
        let (rows, cols) = image.flux.dim();
        let (var_rows, var_cols) = variance.dim();
        if (var_rows, var_cols) != (rows, cols) {
            return Err(Error::VarianceShapeMismatch {
                rows,
                cols,
                var_rows,
                var_cols,
            });
        }
        Ok(Self {
            variance: Some(variance),
            ..image
        })
    }

    /// Number of detector rows (dispersion direction).
    pub fn rows(&self) -> usize {
        self.flux.nrows()
    }

    /// Number of detector columns (spatial direction).
    pub fn cols(&self) -> usize {
        self.flux.ncols()
    }

    /// Flux plane view.
    pub fn flux(&self) -> ArrayView2<'_, f64> {
        self.flux.view()
    }

    /// Variance plane view, when present.
    pub fn variance(&self) -> Option<ArrayView2<'_, f64>> {
        self.variance.as_ref().map(|v| v.view())
    }

    /// One detector row of the flux plane.
    pub fn row(&self, row: usize) -> ArrayView1<'_, f64> {
        self.flux.row(row)
    }
}

/// Smooth an image along the row axis with a running window per column.
///
/// Each output sample is the median or mean of the input samples within
/// `half_width` rows, clamped at the image edges so the window shrinks rather
/// than wraps. Smoothing suppresses cosmic rays and pixel noise before peak
/// detection without displacing vertically extended fiber profiles.
pub fn smooth_vertical(
    image: &DetectorImage,
    half_width: usize,
    kind: SmoothingKind,
) -> Array2<f64> {
    let flux = image.flux();
    let (rows, cols) = flux.dim();
    let mut out = Array2::zeros((rows, cols));
    let mut window = Vec::with_capacity(2 * half_width + 1);

    for col in 0..cols {
        for row in 0..rows {
            let lo = row.saturating_sub(half_width);
            let hi = (row + half_width).min(rows - 1);
            window.clear();
            window.extend((lo..=hi).map(|r| flux[[r, col]]));
            out[[row, col]] = match kind {
                SmoothingKind::Median => slit_math::median(&window).unwrap_or(f64::NAN),
                SmoothingKind::Mean => {
                    window.iter().sum::<f64>() / window.len() as f64
                }
            };
        }
    }

    out
}
