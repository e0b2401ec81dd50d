//! Lazily materialized composites over a set of years
//!
//! Each year is computed at most once and shared read-only afterwards. The
//! cells are independent, so distinct years may be materialized concurrently.

use crate::compositing::seasonal::{seasonal_composite, CompositeImage, CompositeParams};
use once_cell::sync::OnceCell;
use std::collections::BTreeMap;
use std::sync::Arc;
use terratrend_core::raster::StudyArea;
use terratrend_core::source::RasterTimeSeriesSource;
use terratrend_core::{Error, Result};
use terratrend_parallel::{ParallelStrategy, ProcessingMode};
use tracing::{debug, info};

/// One composite per requested year, computed on first use
pub struct CompositeSeries<'a> {
    source: &'a dyn RasterTimeSeriesSource,
    study: &'a StudyArea,
    params: CompositeParams,
    cells: BTreeMap<i32, OnceCell<Arc<CompositeImage>>>,
}

impl<'a> CompositeSeries<'a> {
    /// Series over `years`. The study grid must be the source grid.
    pub fn new(
        source: &'a dyn RasterTimeSeriesSource,
        study: &'a StudyArea,
        params: CompositeParams,
        years: impl IntoIterator<Item = i32>,
    ) -> Result<Self> {
        let grid = source.grid()?;
        let study_grid = study.grid();
        if grid.rows != study_grid.rows || grid.cols != study_grid.cols {
            return Err(Error::SizeMismatch {
                er: grid.rows,
                ec: grid.cols,
                ar: study_grid.rows,
                ac: study_grid.cols,
            });
        }
        let cells = years.into_iter().map(|y| (y, OnceCell::new())).collect();
        Ok(Self {
            source,
            study,
            params,
            cells,
        })
    }

    /// Requested years, ascending
    pub fn years(&self) -> impl Iterator<Item = i32> + '_ {
        self.cells.keys().copied()
    }

    pub fn params(&self) -> &CompositeParams {
        &self.params
    }

    pub fn study(&self) -> &StudyArea {
        self.study
    }

    /// Composite of `year`, materializing it if needed.
    ///
    /// Fails for years outside the series, when the dataset does not declare
    /// the band, or when the source fails.
    pub fn get(&self, year: i32) -> Result<Arc<CompositeImage>> {
        let cell = self.cells.get(&year).ok_or_else(|| Error::InvalidParameter {
            name: "year",
            value: year.to_string(),
            reason: "not part of this composite series".to_string(),
        })?;
        cell.get_or_try_init(|| self.compute(year)).cloned()
    }

    fn compute(&self, year: i32) -> Result<Arc<CompositeImage>> {
        let band = self.params.band.as_str();
        self.source.schema()?.require_band(band)?;

        let range = self.params.window.range_for(year)?;
        let frames = self.source.query(self.study.geometry(), &range, &[band])?;
        debug!(year, %range, frames = frames.len(), "frames retrieved");

        seasonal_composite(&frames, self.study, year, &self.params).map(Arc::new)
    }

    pub fn is_materialized(&self, year: i32) -> bool {
        self.cells.get(&year).is_some_and(|c| c.get().is_some())
    }

    /// Materialize every year, at most `mode`'s worth at a time.
    ///
    /// Returns the per-year outcome; a failed year does not stop the others.
    pub fn materialize_all(&self, mode: ProcessingMode) -> BTreeMap<i32, Result<Arc<CompositeImage>>> {
        let years: Vec<i32> = self.years().collect();
        info!(years = years.len(), band = %self.params.band, "materializing composites");
        let results = mode.par_map_items(&years, |&year| self.get(year));
        years.into_iter().zip(results).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositing::{CompositeStatus, Reducer};
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use terratrend_core::raster::{GridSpec, Raster};
    use terratrend_core::source::{DatasetSchema, InMemorySource};
    use terratrend_core::temporal::{DateRange, RasterFrame, SeasonalWindow};
    use terratrend_core::GeoTransform;

    fn grid() -> GridSpec {
        GridSpec::new(2, 2, GeoTransform::new(0.0, 2.0, 1.0, -1.0))
    }

    fn source() -> InMemorySource {
        let frames = (2018..=2020)
            .filter(|&y| y != 2019)
            .map(|y| {
                RasterFrame::new(NaiveDate::from_ymd_opt(y, 6, 1).unwrap())
                    .with_band("precip", Raster::for_grid(&grid(), f64::from(y - 2000)))
            })
            .collect();
        InMemorySource::new(DatasetSchema::new("test", vec!["precip".into()]), grid(), frames).unwrap()
    }

    fn params(band: &str) -> CompositeParams {
        CompositeParams {
            band: band.into(),
            reducer: Reducer::Sum,
            window: SeasonalWindow::from_month_days((3, 1), (9, 30)).unwrap(),
            fallback_value: 0.0,
        }
    }

    /// Counts queries to check single materialization
    struct Counting {
        inner: InMemorySource,
        queries: AtomicUsize,
    }

    impl RasterTimeSeriesSource for Counting {
        fn schema(&self) -> Result<terratrend_core::DatasetSchema> {
            self.inner.schema()
        }
        fn grid(&self) -> Result<GridSpec> {
            self.inner.grid()
        }
        fn query(
            &self,
            geometry: Option<&geo_types::MultiPolygon<f64>>,
            range: &DateRange,
            bands: &[&str],
        ) -> Result<Vec<RasterFrame>> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            self.inner.query(geometry, range, bands)
        }
    }

    #[test]
    fn test_every_year_yields_a_composite() {
        let src = source();
        let study = StudyArea::full(grid());
        let series = CompositeSeries::new(&src, &study, params("precip"), 2018..=2020).unwrap();

        let all = series.materialize_all(ProcessingMode::Parallel);
        assert_eq!(all.len(), 3);
        assert_eq!(all[&2018].as_ref().unwrap().status(), CompositeStatus::Data);
        assert_eq!(all[&2019].as_ref().unwrap().status(), CompositeStatus::Fallback);
        assert_eq!(all[&2020].as_ref().unwrap().raster().get(0, 0).unwrap(), 20.0);
    }

    #[test]
    fn test_composites_are_computed_once() {
        let src = Counting {
            inner: source(),
            queries: AtomicUsize::new(0),
        };
        let study = StudyArea::full(grid());
        let series = CompositeSeries::new(&src, &study, params("precip"), [2018]).unwrap();

        assert!(!series.is_materialized(2018));
        let a = series.get(2018).unwrap();
        let b = series.get(2018).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(series.is_materialized(2018));
        assert_eq!(src.queries.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_undeclared_band_is_schema_mismatch() {
        let src = source();
        let study = StudyArea::full(grid());
        let series = CompositeSeries::new(&src, &study, params("ndvi"), [2018]).unwrap();
        assert!(matches!(series.get(2018), Err(Error::SchemaMismatch { .. })));
        assert!(!series.is_materialized(2018));
    }

    #[test]
    fn test_unknown_year_and_grid_mismatch() {
        let src = source();
        let study = StudyArea::full(grid());
        let series = CompositeSeries::new(&src, &study, params("precip"), [2018]).unwrap();
        assert!(series.get(1999).is_err());

        let other = StudyArea::full(GridSpec::new(3, 3, GeoTransform::default()));
        assert!(CompositeSeries::new(&src, &other, params("precip"), [2018]).is_err());
    }
}
