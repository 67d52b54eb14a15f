//! Robust statistics for noise estimation and quality reporting.

/// Scale factor relating the median absolute deviation of a Gaussian
/// distribution to its standard deviation.
const MAD_TO_SIGMA: f64 = 1.4826;

/// Median of a slice, ignoring NaN values.
///
/// For an even count the two middle values are averaged. Returns `None`
/// when no finite-or-infinite value remains after NaN filtering.
pub fn median(values: &[f64]) -> Option<f64> {
    let mut valid: Vec<f64> = values.iter().filter(|v| !v.is_nan()).copied().collect();
    if valid.is_empty() {
        return None;
    }
    valid.sort_by(|a, b| a.partial_cmp(b).unwrap());

    let mid = valid.len() / 2;
    Some(if valid.len() % 2 == 0 {
        0.5 * (valid[mid - 1] + valid[mid])
    } else {
        valid[mid]
    })
}

/// Mean and population standard deviation, ignoring NaN values.
///
/// Returns `None` for an empty (or all-NaN) input.
pub fn mean_std(values: &[f64]) -> Option<(f64, f64)> {
    let valid: Vec<f64> = values.iter().filter(|v| !v.is_nan()).copied().collect();
    if valid.is_empty() {
        return None;
    }
    let n = valid.len() as f64;
    let mean = valid.iter().sum::<f64>() / n;
    let var = valid.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some((mean, var.sqrt()))
}

/// Robust noise sigma from the median absolute deviation.
///
/// Insensitive to the bright outliers (fiber peaks, arc lines) that dominate
/// a detector profile, which makes it the right scale for significance
/// thresholds. Returns `None` when the input has no valid values.
pub fn robust_sigma(values: &[f64]) -> Option<f64> {
    let med = median(values)?;
    let deviations: Vec<f64> = values
        .iter()
        .filter(|v| !v.is_nan())
        .map(|v| (v - med).abs())
        .collect();
    median(&deviations).map(|mad| mad * MAD_TO_SIGMA)
}
