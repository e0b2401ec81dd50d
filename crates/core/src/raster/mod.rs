//! Raster data structures and grid extents

mod element;
mod extent;
mod geotransform;
mod grid;

pub use element::RasterElement;
pub use extent::{rasterize_membership, GridSpec, PixelWindow, StudyArea};
pub use geotransform::GeoTransform;
pub use grid::{Raster, RasterStatistics};
