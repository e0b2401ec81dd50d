//! Raster time-series source contract
//!
//! The pipeline only consumes this contract; retrieval, caching and timeouts
//! belong to the implementation.

use crate::error::{Error, Result};
use crate::raster::GridSpec;
use crate::temporal::{DateRange, RasterFrame};
use geo_types::MultiPolygon;
use serde::{Deserialize, Serialize};

/// Declared bands of a dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSchema {
    pub dataset_id: String,
    pub bands: Vec<String>,
}

impl DatasetSchema {
    pub fn new(dataset_id: impl Into<String>, bands: Vec<String>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            bands,
        }
    }

    pub fn has_band(&self, band: &str) -> bool {
        self.bands.iter().any(|b| b == band)
    }

    /// Fails with `SchemaMismatch` when the band is not declared at all
    pub fn require_band(&self, band: &str) -> Result<()> {
        if self.has_band(band) {
            Ok(())
        } else {
            Err(Error::SchemaMismatch {
                band: band.to_string(),
                dataset: self.dataset_id.clone(),
            })
        }
    }
}

/// Supplier of dated raster frames over a fixed grid
pub trait RasterTimeSeriesSource: Send + Sync {
    /// Bands the dataset declares
    fn schema(&self) -> Result<DatasetSchema>;

    /// Grid every frame is delivered on
    fn grid(&self) -> Result<GridSpec>;

    /// Frames whose date falls in `range`, restricted to `bands`.
    ///
    /// `geometry` is a hint for sources that can clip server-side; frames
    /// are always returned on the full dataset grid.
    fn query(
        &self,
        geometry: Option<&MultiPolygon<f64>>,
        range: &DateRange,
        bands: &[&str],
    ) -> Result<Vec<RasterFrame>>;
}

/// Source backed by frames held in memory
#[derive(Debug, Clone)]
pub struct InMemorySource {
    schema: DatasetSchema,
    grid: GridSpec,
    frames: Vec<RasterFrame>,
}

impl InMemorySource {
    /// Frames must all be delivered on `grid`
    pub fn new(schema: DatasetSchema, grid: GridSpec, mut frames: Vec<RasterFrame>) -> Result<Self> {
        for frame in &frames {
            for name in frame.band_names() {
                if let Some(band) = frame.band(name) {
                    band.ensure_shape(grid.rows, grid.cols)?;
                }
            }
        }
        frames.sort_by_key(RasterFrame::date);
        Ok(Self { schema, grid, frames })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl RasterTimeSeriesSource for InMemorySource {
    fn schema(&self) -> Result<DatasetSchema> {
        Ok(self.schema.clone())
    }

    fn grid(&self) -> Result<GridSpec> {
        Ok(self.grid)
    }

    fn query(
        &self,
        _geometry: Option<&MultiPolygon<f64>>,
        range: &DateRange,
        bands: &[&str],
    ) -> Result<Vec<RasterFrame>> {
        Ok(self
            .frames
            .iter()
            .filter(|f| range.contains(f.date()))
            .map(|f| f.select(bands))
            .collect())
    }
}
