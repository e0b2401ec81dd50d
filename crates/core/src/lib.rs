//! # terratrend core
//!
//! Core types, contracts and I/O for seasonal anomaly and trend pipelines
//! over satellite raster time series.
//!
//! This crate provides:
//! - `Raster<T>`: georeferenced grid with NaN masking
//! - `GridSpec` / `StudyArea`: dataset extent and study-geometry mask
//! - `RasterFrame` / `SeasonalWindow`: the temporal model
//! - `Region` / `RegionId`: polygons that rasters are reduced over
//! - `RasterTimeSeriesSource`: the frame supplier contract
//! - GeoTIFF, frame-directory and CSV I/O

pub mod error;
pub mod io;
pub mod raster;
pub mod region;
pub mod source;
pub mod temporal;

pub use error::{Error, Result};
pub use raster::{GeoTransform, GridSpec, Raster, RasterElement, StudyArea};
pub use region::{Region, RegionId};
pub use source::{DatasetSchema, InMemorySource, RasterTimeSeriesSource};
pub use temporal::{DateRange, MonthDay, RasterFrame, SeasonalWindow};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::raster::{GeoTransform, GridSpec, Raster, RasterElement, StudyArea};
    pub use crate::region::{Region, RegionId};
    pub use crate::source::{DatasetSchema, InMemorySource, RasterTimeSeriesSource};
    pub use crate::temporal::{DateRange, MonthDay, RasterFrame, SeasonalWindow};
    pub use crate::Algorithm;
}

/// Common shape of the pipeline's algorithms.
///
/// Algorithms are pure: they never mutate their input and return a new artifact.
pub trait Algorithm {
    /// Input type for the algorithm
    type Input;
    /// Output type for the algorithm
    type Output;
    /// Parameters controlling algorithm behavior
    type Params: Default;
    /// Error type for algorithm execution
    type Error: std::error::Error;

    /// Returns the algorithm name
    fn name(&self) -> &'static str;

    /// Returns a description of what the algorithm does
    fn description(&self) -> &'static str;

    /// Execute the algorithm
    fn execute(&self, input: Self::Input, params: Self::Params) -> std::result::Result<Self::Output, Self::Error>;

    /// Execute with default parameters
    fn execute_default(&self, input: Self::Input) -> std::result::Result<Self::Output, Self::Error> {
        self.execute(input, Self::Params::default())
    }
}
