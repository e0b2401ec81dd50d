//! I/O for rasters, frame directories and result tables

mod directory;
mod geotiff;
mod table;

pub use directory::{date_from_stem, DirectorySource};
pub use geotiff::{
    read_band_names, read_geotiff, read_geotiff_bands, read_geotiff_from_buffer, read_grid,
    write_geotiff, write_geotiff_to_buffer, GeoTiffOptions, NamedBand,
};
pub use table::{format_optional, Table};

use crate::error::Result;
use crate::raster::Raster;
use std::path::Path;

/// A terminal pipeline artifact ready for persistence
#[derive(Debug, Clone, Copy)]
pub enum Artifact<'a> {
    /// Named bands of equal shape
    Raster(&'a [(&'a str, &'a Raster<f64>)]),
    Table(&'a Table),
}

/// Persists rasters and tables produced by the pipeline
pub trait ResultExporter {
    fn save(&self, artifact: Artifact<'_>, destination: &Path) -> Result<()>;
}

/// Writes rasters as GeoTIFF and tables as CSV
#[derive(Debug, Clone, Default)]
pub struct FileExporter {
    pub geotiff: GeoTiffOptions,
}

impl FileExporter {
    /// Exporter substituting `sentinel` for masked pixels
    pub fn with_sentinel(sentinel: f64) -> Self {
        Self {
            geotiff: GeoTiffOptions {
                nodata: Some(sentinel),
                ..Default::default()
            },
        }
    }

    /// Attach key/value metadata to every raster this exporter writes
    pub fn with_metadata<K, V>(mut self, items: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.geotiff
            .metadata
            .extend(items.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }
}

impl ResultExporter for FileExporter {
    fn save(&self, artifact: Artifact<'_>, destination: &Path) -> Result<()> {
        match artifact {
            Artifact::Raster(bands) => write_geotiff(bands, destination, &self.geotiff),
            Artifact::Table(table) => table.save_csv(destination),
        }
    }
}
