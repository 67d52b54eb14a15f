use thiserror::Error;

/// Fatal errors produced by the calibration pipeline.
///
/// Only unrecoverable input conditions surface here; a single misbehaving
/// fiber is recorded through validity flags and QC counters instead.
#[derive(Error, Debug)]
pub enum Error {
    /// Detector image has a zero dimension.
    #[error("empty detector image ({rows}x{cols})")]
    EmptyImage {
        /// Image row count.
        rows: usize,
        /// Image column count.
        cols: usize,
    },

    /// Variance plane does not match the flux plane.
    #[error("variance shape {var_rows}x{var_cols} does not match flux shape {rows}x{cols}")]
    VarianceShapeMismatch {
        /// Flux row count.
        rows: usize,
        /// Flux column count.
        cols: usize,
        /// Variance row count.
        var_rows: usize,
        /// Variance column count.
        var_cols: usize,
    },

    /// Reference row lies outside the image.
    #[error("reference row {row} outside image with {rows} rows")]
    ReferenceRowOutOfBounds {
        /// Requested reference row.
        row: usize,
        /// Image row count.
        rows: usize,
    },

    /// No fiber peaks found on the reference row.
    #[error("no fibers identified on reference row {row}")]
    NoFibersFound {
        /// Reference row that was scanned.
        row: usize,
    },

    /// Identified fiber count diverges from the nominal slit population.
    #[error("identified {found} fibers, expected {expected}")]
    FiberCountMismatch {
        /// Nominal fiber count from configuration.
        expected: usize,
        /// Number of peaks actually identified.
        found: usize,
    },

    /// Line catalog contains no usable wavelengths.
    #[error("empty line catalog")]
    EmptyCatalog,

    /// A per-fiber table does not line up with the slit fiber count.
    #[error("table holds {got} fibers, slit has {expected}")]
    FiberTableMismatch {
        /// Expected fiber count.
        expected: usize,
        /// Fiber count found in the table.
        got: usize,
    },

    /// Every fiber of the slit was lost during a calibration stage.
    #[error("all {count} fibers lost during {stage}")]
    AllFibersLost {
        /// Number of fibers in the slit.
        count: usize,
        /// Stage that invalidated the last fiber.
        stage: &'static str,
    },
}
