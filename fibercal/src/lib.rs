//! IFU fiber spectrograph calibration engine.
//!
//! Given a bias-subtracted flat-field exposure (and optionally an arc-lamp
//! exposure) of a pseudo-slit, this crate derives the three calibration
//! products a science reduction needs:
//!
//! - a per-fiber geometric **trace model** (polynomial column-vs-row path of
//!   each fiber across the detector),
//! - a per-fiber **inverse dispersion solution** (polynomial pixel-to-
//!   wavelength mapping) from arc lines matched against a reference catalog,
//! - a per-fiber relative **transmission correction** from the resampled
//!   flat spectra.
//!
//! Stages are plain functions over owned tables; the [`pipeline`] module
//! wires them together and collects a QC report. Fiber indices are stable
//! across every table and invalid fibers propagate as explicitly flagged
//! NaN rows, so per-slit table shapes never shrink. Image axis convention:
//! axis 0 is the detector row (dispersion direction), axis 1 the column
//! (spatial direction across the slit).
//!
//! Bias/overscan correction, FITS I/O, and product persistence are external
//! collaborators; this crate only consumes `ndarray` images and produces
//! in-memory tables.

pub mod align;
pub mod config;
pub mod error;
pub mod extract;
pub mod identify;
pub mod image;
pub mod peaks;
pub mod pipeline;
pub mod qc;
pub mod resample;
pub mod trace;
pub mod trace_fit;
pub mod transmission;
pub mod wavecal;

pub use align::{align_or_fallback, apply_alignment, solve_alignment, Alignment};
pub use config::{
    MatchPolicy, SlitConfig, SmoothingKind, TraceParams, WavecalParams, WavelengthGrid,
};
pub use error::Error;
pub use extract::{extract_spectra, ExtractedSpectrum};
pub use identify::{
    detect_fiber_candidates, identify_fibers, upgrade_identification, FiberMap,
};
pub use image::{smooth_vertical, DetectorImage};
pub use peaks::{find_peaks, parabolic_offset, peak_in_window, Peak};
pub use pipeline::{
    calibrate_arc, calibrate_flat, reduce, reduce_with_relation, DispersionCalibration,
    FlatCalibration,
};
pub use qc::{QcReport, QcValue};
pub use resample::{resample, resample_with_relation, ResampledSpectrum};
pub use trace::{short_trace_fibers, trace_fibers, FiberPosition, RawTrace};
pub use trace_fit::{
    fit_short_traces, fit_trace_models, rejection_budget, TraceModel, TraceTable,
};
pub use transmission::{derive_transmission, TransmissionTable};
pub use wavecal::{calibrate_wavelengths, Ids, IdsTable, LineCatalog, WavecalDiagnostics};
