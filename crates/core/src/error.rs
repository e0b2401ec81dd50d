//! Error types for terratrend
//!
//! Only conditions that abort a unit of work live here. Absence of data is
//! never an error: it travels as a `Fallback` composite, an `Undefined`
//! anomaly or trend, or a `None` regional value.

use thiserror::Error;

/// Main error type for terratrend operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid raster dimensions: {width}x{height}")]
    InvalidDimensions { width: usize, height: usize },

    #[error("Index out of bounds: ({row}, {col}) in raster of size ({rows}, {cols})")]
    IndexOutOfBounds {
        row: usize,
        col: usize,
        rows: usize,
        cols: usize,
    },

    #[error("Raster size mismatch: expected ({er}, {ec}), got ({ar}, {ac})")]
    SizeMismatch { er: usize, ec: usize, ar: usize, ac: usize },

    /// The dataset schema does not carry the requested band at all.
    #[error("Band '{band}' is not part of the schema of dataset '{dataset}'")]
    SchemaMismatch { band: String, dataset: String },

    /// Empty or degenerate region polygon.
    #[error("Invalid geometry for region '{region}': {reason}")]
    InvalidGeometry { region: String, reason: String },

    #[error("Invalid parameter: {name} = {value} ({reason})")]
    InvalidParameter {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("Raster source error: {0}")]
    Source(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TIFF error: {0}")]
    Tiff(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error aborts a single (region, year) unit rather than
    /// signalling a broken setup.
    pub fn is_unit_fatal(&self) -> bool {
        matches!(
            self,
            Error::SchemaMismatch { .. } | Error::InvalidGeometry { .. } | Error::SizeMismatch { .. }
        )
    }
}

impl From<tiff::TiffError> for Error {
    fn from(e: tiff::TiffError) -> Self {
        Error::Tiff(e.to_string())
    }
}

/// Result type alias for terratrend operations
pub type Result<T> = std::result::Result<T, Error>;
