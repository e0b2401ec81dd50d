//! A raster time series stored as a directory of dated GeoTIFF files
//!
//! Each file is one frame. The acquisition date is taken from the file name
//! (`YYYY-MM-DD` or `YYYYMMDD` anywhere in the stem); each TIFF page is one
//! band named by its ImageDescription tag.

use crate::error::{Error, Result};
use crate::io::geotiff::{read_band_names, read_geotiff_bands, read_grid};
use crate::raster::GridSpec;
use crate::source::{DatasetSchema, RasterTimeSeriesSource};
use crate::temporal::{DateRange, RasterFrame};
use chrono::NaiveDate;
use geo_types::MultiPolygon;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Extract an acquisition date from a file stem
pub fn date_from_stem(stem: &str) -> Option<NaiveDate> {
    let bytes = stem.as_bytes();

    for start in 0..bytes.len().saturating_sub(9) {
        if let Some(slice) = stem.get(start..start + 10) {
            if let Ok(date) = NaiveDate::parse_from_str(slice, "%Y-%m-%d") {
                return Some(date);
            }
        }
    }

    // Runs of exactly eight digits
    let mut run_start = None;
    for (i, b) in bytes.iter().chain(std::iter::once(&b'_')).enumerate() {
        match (b.is_ascii_digit(), run_start) {
            (true, None) => run_start = Some(i),
            (false, Some(s)) => {
                if i - s == 8 {
                    if let Ok(date) = NaiveDate::parse_from_str(&stem[s..i], "%Y%m%d") {
                        return Some(date);
                    }
                }
                run_start = None;
            }
            _ => {}
        }
    }
    None
}

/// Directory-backed [`RasterTimeSeriesSource`]
#[derive(Debug, Clone)]
pub struct DirectorySource {
    dataset_id: String,
    files: Vec<(NaiveDate, PathBuf)>,
    bands: Vec<String>,
    grid: GridSpec,
}

impl DirectorySource {
    /// Index the dated GeoTIFF files of `dir`. Pixel data is not read here.
    pub fn open<P: AsRef<Path>>(dir: P, dataset_id: impl Into<String>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut files = Vec::new();

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let is_tiff = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("tif") || e.eq_ignore_ascii_case("tiff"));
            if !is_tiff {
                continue;
            }
            match path.file_stem().and_then(|s| s.to_str()).and_then(date_from_stem) {
                Some(date) => files.push((date, path)),
                None => debug!(path = %path.display(), "skipping file without a date in its name"),
            }
        }

        files.sort();
        let Some((_, first)) = files.first() else {
            return Err(Error::Source(format!(
                "no dated GeoTIFF frames found in {}",
                dir.display()
            )));
        };

        let grid = read_grid(first)?;
        let bands = read_band_names(first)?;
        debug!(frames = files.len(), bands = ?bands, "indexed frame directory");

        Ok(Self {
            dataset_id: dataset_id.into(),
            files,
            bands,
            grid,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// First and last acquisition dates
    pub fn date_span(&self) -> Option<DateRange> {
        let first = self.files.first()?.0;
        let last = self.files.last()?.0;
        DateRange::new(first, last).ok()
    }
}

impl RasterTimeSeriesSource for DirectorySource {
    fn schema(&self) -> Result<DatasetSchema> {
        Ok(DatasetSchema::new(self.dataset_id.clone(), self.bands.clone()))
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
        let mut frames = Vec::new();
        for (date, path) in self.files.iter().filter(|(d, _)| range.contains(*d)) {
            let mut frame = RasterFrame::new(*date)
                .with_property("source_path", path.display().to_string());
            for band in read_geotiff_bands(path)? {
                if !bands.contains(&band.name.as_str()) {
                    continue;
                }
                band.raster.ensure_shape(self.grid.rows, self.grid.cols)?;
                frame = frame.with_band(band.name, band.raster);
            }
            frames.push(frame);
        }
        debug!(range = %range, frames = frames.len(), "queried frame directory");
        Ok(frames)
    }
}
