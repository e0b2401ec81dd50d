//! Statistical reductions of composites
//!
//! - **trend**: least-squares trend against year, scalar or per pixel
//! - **zonal**: reduction of a raster to one scalar per region

pub mod trend;
pub mod zonal;

pub use trend::{fit_linear_trend, fit_pixel_trend, LinearTrend, PixelTrend, TrendRaster, TrendResult};
pub use zonal::{aggregate, aggregate_stack, AreaWeighting, ZonalParams, ZonalStatistic};
