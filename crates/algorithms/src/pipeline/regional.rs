//! Region × year batches
//!
//! [`RegionalTrendPlan::evaluate`] runs in two phases:
//!
//! 1. one composite per year, materialized with bounded concurrency;
//! 2. one reduction per (region, year) unit, again bounded.
//!
//! Units never share mutable state. A unit-fatal error (undeclared band,
//! invalid region geometry, off-grid raster) is logged and recorded in
//! `failures`; every other unit still runs. Results are keyed by
//! `(region_id, year)`, so output order never depends on completion order.

use crate::compositing::{CompositeImage, CompositeParams, CompositeSeries, CompositeStatus, FallbackPolicy};
use crate::imagery::AnomalyRaster;
use crate::pipeline::plan::materialize;
use crate::pipeline::PipelineConfig;
use crate::statistics::{aggregate, fit_linear_trend, TrendResult, ZonalParams};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use terratrend_core::io::{format_optional, Table};
use terratrend_core::raster::StudyArea;
use terratrend_core::region::{Region, RegionId};
use terratrend_core::source::RasterTimeSeriesSource;
use terratrend_core::Result;
use terratrend_parallel::{ParallelStrategy, ProcessingMode};
use tracing::{debug, info, warn};

/// Reduced value of one (region, year) unit
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionYearValue {
    /// `None` when the region had no valid pixels or the year was excluded
    pub value: Option<f64>,
    /// Status of the composite the value came from
    pub status: CompositeStatus,
}

/// A unit that aborted on a fatal error
#[derive(Debug, Clone, PartialEq)]
pub struct UnitFailure {
    pub region: RegionId,
    /// `None` when every year of the region failed for the same reason
    pub year: Option<i32>,
    pub message: String,
}

impl fmt::Display for UnitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.year {
            Some(year) => write!(f, "{} / {}: {}", self.region, year, self.message),
            None => write!(f, "{}: {}", self.region, self.message),
        }
    }
}

/// Outcome of a regional trend batch
#[derive(Debug, Clone, Default)]
pub struct RegionalTrendReport {
    pub series: BTreeMap<(RegionId, i32), RegionYearValue>,
    /// Regions with at least one successful unit
    pub trends: BTreeMap<RegionId, TrendResult>,
    pub failures: Vec<UnitFailure>,
}

impl RegionalTrendReport {
    /// Yearly values of one region, ascending by year
    pub fn region_series(&self, region: &RegionId) -> Vec<(i32, Option<f64>)> {
        self.series
            .range((region.clone(), i32::MIN)..=(region.clone(), i32::MAX))
            .map(|((_, year), v)| (*year, v.value))
            .collect()
    }

    /// `region_id, slope, intercept, points_used`; undefined cells are empty
    pub fn trend_table(&self) -> Result<Table> {
        let mut table = Table::new(["region_id", "slope", "intercept", "points_used"]);
        for (id, trend) in &self.trends {
            table.push_row(vec![
                id.to_string(),
                format_optional(trend.slope),
                format_optional(trend.intercept),
                trend.points_used.to_string(),
            ])?;
        }
        Ok(table)
    }

    /// `region_id, year, value, status`, one row per successful unit
    pub fn series_table(&self) -> Result<Table> {
        let mut table = Table::new(["region_id", "year", "value", "status"]);
        for ((id, year), v) in &self.series {
            table.push_row(vec![
                id.to_string(),
                year.to_string(),
                format_optional(v.value),
                v.status.to_string(),
            ])?;
        }
        Ok(table)
    }
}

/// Per-region trends of yearly regional values
#[derive(Debug, Clone)]
pub struct RegionalTrendPlan {
    pub composite: CompositeParams,
    pub years: Vec<i32>,
    pub policy: FallbackPolicy,
    pub zonal: ZonalParams,
    pub mode: ProcessingMode,
}

/// Keep the first region of each id; later duplicates fail
fn distinct_regions<'r>(regions: &'r [Region], failures: &mut Vec<UnitFailure>) -> Vec<&'r Region> {
    let mut seen = BTreeSet::new();
    let mut kept = Vec::with_capacity(regions.len());
    for region in regions {
        if !seen.insert(&region.id) {
            failures.push(UnitFailure {
                region: region.id.clone(),
                year: None,
                message: "duplicate region id".to_string(),
            });
            continue;
        }
        match region.validate() {
            Ok(()) => kept.push(region),
            Err(e) => failures.push(UnitFailure {
                region: region.id.clone(),
                year: None,
                message: e.to_string(),
            }),
        }
    }
    kept
}

fn reduce_unit(
    composite: &CompositeImage,
    region: &Region,
    policy: FallbackPolicy,
    zonal: &ZonalParams,
) -> Result<RegionYearValue> {
    let value = match composite.usable_raster(policy) {
        Some(raster) => aggregate(raster, region, zonal)?,
        None => None,
    };
    Ok(RegionYearValue {
        value,
        status: composite.status(),
    })
}

impl RegionalTrendPlan {
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        Ok(Self {
            composite: config.composite_params()?,
            years: config.trend_years(),
            policy: config.fallback_policy,
            zonal: config.zonal_params(),
            mode: config.processing_mode(),
        })
    }

    /// Run the batch over `regions`.
    ///
    /// Only errors outside any single unit (an unreadable source, a study
    /// area off the source grid) abort the whole batch.
    pub fn evaluate(
        &self,
        source: &dyn RasterTimeSeriesSource,
        study: &StudyArea,
        regions: &[Region],
    ) -> Result<RegionalTrendReport> {
        info!(
            regions = regions.len(),
            years = self.years.len(),
            band = %self.composite.band,
            statistic = %self.zonal.statistic,
            "evaluating regional trend plan"
        );
        let mut report = RegionalTrendReport::default();
        let regions = distinct_regions(regions, &mut report.failures);

        // Phase 1: one composite per year
        let series = CompositeSeries::new(source, study, self.composite.clone(), self.years.iter().copied())?;
        let (composites, failed_years) = materialize(&series, self.mode)?;
        for failure in failed_years {
            report.failures.extend(regions.iter().map(|r| UnitFailure {
                region: r.id.clone(),
                year: Some(failure.year),
                message: failure.message.clone(),
            }));
        }

        // Phase 2: one reduction per (region, year)
        let units: Vec<(&Region, i32, &CompositeImage)> = regions
            .iter()
            .flat_map(|r| composites.iter().map(move |(y, c)| (*r, *y, c.as_ref())))
            .collect();
        let results = self
            .mode
            .par_map_items(&units, |(region, _, composite)| reduce_unit(composite, region, self.policy, &self.zonal));

        for ((region, year, _), result) in units.iter().zip(results) {
            match result {
                Ok(value) => {
                    debug!(region = %region.id, year, value = ?value.value, status = %value.status, "unit finalized");
                    report.series.insert((region.id.clone(), *year), value);
                }
                Err(e) if e.is_unit_fatal() => {
                    warn!(region = %region.id, year, error = %e, "unit failed");
                    report.failures.push(UnitFailure {
                        region: region.id.clone(),
                        year: Some(*year),
                        message: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        for region in &regions {
            let points = report.region_series(&region.id);
            if points.is_empty() {
                continue;
            }
            let trend = fit_linear_trend(&points);
            if !trend.is_defined() {
                debug!(region = %region.id, points = trend.points_used, "trend undefined");
            }
            report.trends.insert(region.id.clone(), trend);
        }

        info!(
            units = report.series.len(),
            trends = report.trends.len(),
            failures = report.failures.len(),
            "regional trend plan finished"
        );
        Ok(report)
    }
}

/// Regional reductions of one anomaly raster
#[derive(Debug, Clone, Default)]
pub struct RegionalAnomalyReport {
    pub values: BTreeMap<RegionId, Option<f64>>,
    pub failures: Vec<UnitFailure>,
}

impl RegionalAnomalyReport {
    /// `region_id, anomaly`; undefined cells are empty
    pub fn table(&self) -> Result<Table> {
        let mut table = Table::new(["region_id", "anomaly"]);
        for (id, value) in &self.values {
            table.push_row(vec![id.to_string(), format_optional(*value)])?;
        }
        Ok(table)
    }
}

/// Reduce an anomaly raster per region.
///
/// Every region of an `Undefined` anomaly is `None`.
pub fn regional_anomaly(
    anomaly: &AnomalyRaster,
    regions: &[Region],
    zonal: &ZonalParams,
    mode: ProcessingMode,
) -> Result<RegionalAnomalyReport> {
    let mut report = RegionalAnomalyReport::default();
    let regions = distinct_regions(regions, &mut report.failures);

    if !anomaly.is_valid() {
        warn!(target_year = anomaly.target_year, status = %anomaly.status, "anomaly undefined for every region");
        report.values.extend(regions.iter().map(|r| (r.id.clone(), None)));
        return Ok(report);
    }

    let results = mode.par_map_items(&regions, |region| aggregate(&anomaly.anomaly, region, zonal));
    for (region, result) in regions.iter().zip(results) {
        match result {
            Ok(value) => {
                report.values.insert(region.id.clone(), value);
            }
            Err(e) if e.is_unit_fatal() => {
                warn!(region = %region.id, error = %e, "region failed");
                report.failures.push(UnitFailure {
                    region: region.id.clone(),
                    year: Some(anomaly.target_year),
                    message: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositing::Reducer;
    use crate::imagery::AnomalyStatus;
    use chrono::NaiveDate;
    use geo_types::{polygon, MultiPolygon};
    use terratrend_core::raster::{GridSpec, Raster};
    use terratrend_core::source::{DatasetSchema, InMemorySource};
    use terratrend_core::temporal::{RasterFrame, SeasonalWindow};
    use terratrend_core::GeoTransform;

    fn grid() -> GridSpec {
        GridSpec::new(4, 4, GeoTransform::new(0.0, 4.0, 1.0, -1.0))
    }

    fn square(id: &str, x0: f64, y0: f64, side: f64) -> Region {
        Region::from_polygon(
            id,
            polygon![(x: x0, y: y0), (x: x0 + side, y: y0), (x: x0 + side, y: y0 + side), (x: x0, y: y0 + side)],
        )
    }

    fn plan(years: Vec<i32>, band: &str) -> RegionalTrendPlan {
        RegionalTrendPlan {
            composite: CompositeParams {
                band: band.into(),
                reducer: Reducer::Mean,
                window: SeasonalWindow::from_month_days((1, 1), (12, 31)).unwrap(),
                fallback_value: 0.0,
            },
            years,
            policy: FallbackPolicy::Exclude,
            zonal: ZonalParams::default(),
            mode: ProcessingMode::ParallelWith(3),
        }
    }

    /// Value `year - 2000 + col` everywhere, except 2002 which has no frames
    fn source() -> InMemorySource {
        let frames = (2000..=2004)
            .filter(|&y| y != 2002)
            .map(|y| {
                let mut r = Raster::for_grid(&grid(), 0.0);
                for ((_, col), v) in r.data_mut().indexed_iter_mut() {
                    *v = f64::from(y - 2000) + col as f64;
                }
                RasterFrame::new(NaiveDate::from_ymd_opt(y, 6, 1).unwrap()).with_band("b", r)
            })
            .collect();
        InMemorySource::new(DatasetSchema::new("ds", vec!["b".into()]), grid(), frames).unwrap()
    }

    #[test]
    fn test_batch_isolates_invalid_regions() {
        let regions = vec![
            square("west", 0.0, 0.0, 2.0),
            Region::new(RegionId::new("broken"), MultiPolygon(vec![])),
            square("east", 2.0, 0.0, 2.0),
            square("west", 1.0, 1.0, 1.0),
        ];
        let study = StudyArea::full(grid());
        let report = plan((2000..=2004).collect(), "b")
            .evaluate(&source(), &study, &regions)
            .unwrap();

        assert_eq!(report.trends.len(), 2);
        assert_eq!(report.failures.len(), 2);
        assert!(report.failures.iter().any(|f| f.region.as_str() == "broken"));

        let west = report.trends[&RegionId::new("west")];
        approx::assert_relative_eq!(west.slope.unwrap(), 1.0, epsilon = 1e-9);
        assert_eq!(west.points_used, 4);

        let gap = report.series[&(RegionId::new("east"), 2002)];
        assert_eq!(gap.value, None);
        assert_eq!(gap.status, CompositeStatus::Fallback);
        assert_eq!(report.region_series(&RegionId::new("east")).len(), 5);
    }

    #[test]
    fn test_schema_mismatch_fails_units_not_batch() {
        let regions = vec![square("a", 0.0, 0.0, 4.0)];
        let study = StudyArea::full(grid());
        let report = plan(vec![2000, 2001], "missing")
            .evaluate(&source(), &study, &regions)
            .unwrap();
        assert!(report.trends.is_empty());
        assert_eq!(report.failures.len(), 2);
        assert!(report.failures[0].message.contains("missing"));
    }

    #[test]
    fn test_one_valid_year_is_undefined() {
        let regions = vec![square("a", 0.0, 0.0, 4.0)];
        let study = StudyArea::full(grid());
        let report = plan(vec![2001, 2002], "b").evaluate(&source(), &study, &regions).unwrap();
        let trend = report.trends[&RegionId::new("a")];
        assert_eq!(trend.slope, None);
        assert_eq!(trend.points_used, 1);

        let table = report.trend_table().unwrap();
        assert_eq!(table.rows()[0], vec!["a", "", "", "1"]);
        assert_eq!(report.series_table().unwrap().len(), 2);
    }

    #[test]
    fn test_regional_anomaly() {
        let mut raster = Raster::for_grid(&grid(), 2.0);
        raster.set(0, 0, f64::NAN).unwrap();
        let anomaly = AnomalyRaster {
            target_year: 2023,
            unit_scale: 1.0,
            status: AnomalyStatus::Valid,
            anomaly: raster,
            baseline_mean: None,
            target: None,
            baseline_years_used: vec![2020],
        };
        let regions = vec![square("all", 0.0, 0.0, 4.0), square("masked", 0.0, 3.0, 1.0), square("far", 10.0, 10.0, 1.0)];
        let report = regional_anomaly(&anomaly, &regions, &ZonalParams::default(), ProcessingMode::Sequential).unwrap();
        assert_eq!(report.values[&RegionId::new("all")], Some(2.0));
        assert_eq!(report.values[&RegionId::new("masked")], None);
        assert_eq!(report.values[&RegionId::new("far")], None);

        let undefined = AnomalyRaster {
            status: AnomalyStatus::Undefined {
                reason: "no baseline".into(),
            },
            ..anomaly
        };
        let report = regional_anomaly(&undefined, &regions, &ZonalParams::default(), ProcessingMode::Sequential).unwrap();
        assert!(report.values.values().all(Option::is_none));
        assert_eq!(report.table().unwrap().len(), 3);
    }
}
