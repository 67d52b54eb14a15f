use serde::{Deserialize, Serialize};

/// Kind of vertical running-window filter applied before identification
/// and tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SmoothingKind {
    /// Running median: robust against cosmic ray hits.
    Median,
    /// Running mean: cheaper, adequate for clean flats.
    Mean,
}

/// Trace polynomial fitting parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceParams {
    /// Polynomial order of the trace model (3 for low/medium resolution
    /// gratings, 4 for high resolution).
    pub order: usize,
    /// Absolute residual in pixels above which a trace sample is rejected.
    pub tolerance: f64,
    /// Fractional term of the dead-fiber rejection budget.
    pub reject_fraction: f64,
    /// Cap on reject-and-refit rounds.
    pub max_iterations: usize,
}

impl Default for TraceParams {
    fn default() -> Self {
        Self {
            order: 3,
            tolerance: 0.3,
            reject_fraction: 0.3,
            max_iterations: 10,
        }
    }
}

/// Geometry and detection parameters for one pseudo-slit.
///
/// Instrument-specific constants (reference row, half-widths, fiber count)
/// arrive here from external configuration; nothing in the pipeline reads
/// them from global state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlitConfig {
    /// Nominal number of fibers in the pseudo-slit.
    pub fiber_count: usize,
    /// Detector row where fiber identification is anchored.
    pub reference_row: usize,
    /// Rows traced above the reference row.
    pub rows_above: usize,
    /// Rows traced below the reference row.
    pub rows_below: usize,
    /// Row sampling step while tracing (1 = every row).
    pub trace_step: usize,
    /// Half-width in columns of the peak search window around the previous
    /// trace estimate.
    pub search_radius: usize,
    /// Half-width in rows of the vertical smoothing window.
    pub smoothing_half_width: usize,
    /// Vertical smoothing filter kind.
    pub smoothing: SmoothingKind,
    /// Peak significance threshold in units of the robust noise sigma.
    pub detection_sigma: f64,
    /// Minimum separation between fiber peaks in columns.
    pub min_separation: f64,
    /// Search radius in columns for upgrade identification from a prior
    /// reference-row map.
    pub identify_tolerance: f64,
    /// Cross-dispersion extraction half-width in columns.
    pub extraction_half_width: f64,
    /// Rows covered on each side of the reference row by the short
    /// cross-exposure re-trace.
    pub short_trace_radius: usize,
    /// Maximum column distance for pairing fibers during alignment.
    pub align_match_radius: f64,
    /// Column contaminated by the zero-order image, if any; peaks this close
    /// to it are ignored during identification.
    pub zero_order_column: Option<f64>,
    /// Trace polynomial fitting parameters.
    pub trace: TraceParams,
}

impl Default for SlitConfig {
    fn default() -> Self {
        Self {
            fiber_count: 400,
            reference_row: 1024,
            rows_above: 900,
            rows_below: 900,
            trace_step: 5,
            search_radius: 2,
            smoothing_half_width: 7,
            smoothing: SmoothingKind::Median,
            detection_sigma: 2.0,
            min_separation: 3.0,
            identify_tolerance: 2.0,
            extraction_half_width: 2.0,
            short_trace_radius: 30,
            align_match_radius: 2.0,
            zero_order_column: None,
            trace: TraceParams::default(),
        }
    }
}

/// Line-matching policy for wavelength calibration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchPolicy {
    /// Predict each catalog line from the seed relation and take the nearest
    /// detected peak. Falls back to `Blind` when too few pairs form.
    FirstGuess,
    /// Match the detected peak set against the catalog by scanning dispersion
    /// candidates around the seed value.
    Blind,
}

/// Wavelength calibration parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WavecalParams {
    /// Polynomial order of the inverse dispersion solution.
    pub order: usize,
    /// Fit RMS in pixels above which a fiber is marked wavelength-lost.
    pub max_rms_px: f64,
    /// Matching window in pixels around each predicted line position.
    pub match_window: f64,
    /// Arc peak significance threshold in units of the robust noise sigma.
    pub detection_sigma: f64,
    /// Minimum separation between arc peaks in pixels.
    pub min_separation: f64,
    /// Line-matching policy.
    pub policy: MatchPolicy,
    /// Fractional span around the seed dispersion scanned by blind matching.
    pub scan_span: f64,
    /// Number of dispersion candidates scanned by blind matching.
    pub scan_steps: usize,
    /// Cap on reject-and-refit rounds of the IDS fit.
    pub max_iterations: usize,
}

impl Default for WavecalParams {
    fn default() -> Self {
        Self {
            order: 3,
            max_rms_px: 0.3,
            match_window: 5.0,
            detection_sigma: 3.0,
            min_separation: 3.0,
            policy: MatchPolicy::FirstGuess,
            scan_span: 0.05,
            scan_steps: 101,
            max_iterations: 5,
        }
    }
}

/// Uniform output wavelength grid of the resampler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WavelengthGrid {
    /// Wavelength of the first output bin.
    pub start: f64,
    /// Bin width in wavelength units.
    pub step: f64,
    /// Number of output bins.
    pub bins: usize,
}

impl WavelengthGrid {
    /// Wavelength at the center of bin `i`.
    pub fn wavelength_at(&self, i: usize) -> f64 {
        self.start + self.step * i as f64
    }

    /// Wavelength of the last bin.
    pub fn end(&self) -> f64 {
        self.wavelength_at(self.bins.saturating_sub(1))
    }
}
