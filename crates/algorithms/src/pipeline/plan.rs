//! Year-level plans: anomalies and pixel-wise trends
//!
//! A plan only describes the work. Nothing touches the source until
//! `evaluate` pulls the composites it needs.

use crate::compositing::{CompositeImage, CompositeParams, CompositeSeries, FallbackPolicy};
use crate::imagery::{anomaly_from_composites, AnomalyParams, AnomalyRaster};
use crate::pipeline::PipelineConfig;
use crate::statistics::{fit_pixel_trend, TrendRaster};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use terratrend_core::raster::StudyArea;
use terratrend_core::source::RasterTimeSeriesSource;
use terratrend_core::Result;
use terratrend_parallel::ProcessingMode;
use tracing::{info, warn};

/// A year whose composite could not be built
#[derive(Debug, Clone, PartialEq)]
pub struct YearFailure {
    pub year: i32,
    pub message: String,
}

impl fmt::Display for YearFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.year, self.message)
    }
}

/// Plan output together with the years left out of it
#[derive(Debug, Clone)]
pub struct PlanReport<T> {
    pub output: T,
    pub failures: Vec<YearFailure>,
}

/// Pull every year of `series`.
///
/// A year failing for a reason confined to that year is logged and
/// returned as a failure; any other error aborts.
pub(crate) fn materialize(
    series: &CompositeSeries<'_>,
    mode: ProcessingMode,
) -> Result<(Vec<(i32, Arc<CompositeImage>)>, Vec<YearFailure>)> {
    let mut composites = Vec::new();
    let mut failures = Vec::new();
    for (year, result) in series.materialize_all(mode) {
        match result {
            Ok(composite) => composites.push((year, composite)),
            Err(e) if e.is_unit_fatal() => {
                warn!(year, error = %e, "composite failed, year dropped");
                failures.push(YearFailure {
                    year,
                    message: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
    }
    Ok((composites, failures))
}

/// Anomalies of each target year against one baseline period
#[derive(Debug, Clone)]
pub struct AnomalyPlan {
    pub composite: CompositeParams,
    pub baseline_years: Vec<i32>,
    pub target_years: Vec<i32>,
    pub params: AnomalyParams,
    pub mode: ProcessingMode,
}

impl AnomalyPlan {
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        Ok(Self {
            composite: config.composite_params()?,
            baseline_years: config.baseline_years(),
            target_years: config.target_years.clone(),
            params: config.anomaly_params(),
            mode: config.processing_mode(),
        })
    }

    /// Years whose composites this plan pulls
    pub fn years(&self) -> Vec<i32> {
        let mut years = self.baseline_years.clone();
        years.extend(&self.target_years);
        years.sort_unstable();
        years.dedup();
        years
    }

    /// One anomaly per target year, keyed by year.
    ///
    /// Failed baseline years are left out of the baseline mean; a failed
    /// target year has no anomaly. Both are listed in the report.
    pub fn evaluate(
        &self,
        source: &dyn RasterTimeSeriesSource,
        study: &StudyArea,
    ) -> Result<PlanReport<BTreeMap<i32, AnomalyRaster>>> {
        info!(
            band = %self.composite.band,
            reducer = %self.composite.reducer,
            window = %self.composite.window,
            baseline = self.baseline_years.len(),
            targets = self.target_years.len(),
            "evaluating anomaly plan"
        );
        let series = CompositeSeries::new(source, study, self.composite.clone(), self.years())?;
        let (composites, failures) = materialize(&series, self.mode)?;
        let composites: BTreeMap<i32, Arc<CompositeImage>> = composites.into_iter().collect();

        let baseline: Vec<Arc<CompositeImage>> = self
            .baseline_years
            .iter()
            .filter_map(|y| composites.get(y).cloned())
            .collect();
        let mut output = BTreeMap::new();
        for year in &self.target_years {
            if let Some(target) = composites.get(year) {
                output.insert(*year, anomaly_from_composites(&baseline, target, self.params)?);
            }
        }
        Ok(PlanReport { output, failures })
    }
}

/// Pixel-wise trend over consecutive years
#[derive(Debug, Clone)]
pub struct TrendPlan {
    pub composite: CompositeParams,
    pub years: Vec<i32>,
    pub policy: FallbackPolicy,
    pub mode: ProcessingMode,
}

impl TrendPlan {
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        Ok(Self {
            composite: config.composite_params()?,
            years: config.trend_years(),
            policy: config.fallback_policy,
            mode: config.processing_mode(),
        })
    }

    /// Trend over every year whose composite could be built
    pub fn evaluate(&self, source: &dyn RasterTimeSeriesSource, study: &StudyArea) -> Result<PlanReport<TrendRaster>> {
        info!(band = %self.composite.band, years = self.years.len(), "evaluating trend plan");
        let series = CompositeSeries::new(source, study, self.composite.clone(), self.years.iter().copied())?;
        let (composites, failures) = materialize(&series, self.mode)?;
        let fallbacks = composites.iter().filter(|(_, c)| c.is_fallback()).count();
        if fallbacks > 0 {
            info!(fallbacks, policy = ?self.policy, "trend series contains fallback years");
        }
        let output = fit_pixel_trend(&composites, self.policy)?;
        Ok(PlanReport { output, failures })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositing::Reducer;
    use approx::assert_relative_eq;
    use chrono::{Datelike, NaiveDate};
    use terratrend_core::raster::{GridSpec, Raster};
    use geo_types::MultiPolygon;
    use terratrend_core::source::{DatasetSchema, InMemorySource};
    use terratrend_core::temporal::DateRange;
    use terratrend_core::temporal::{RasterFrame, SeasonalWindow};
    use terratrend_core::GeoTransform;

    fn grid() -> GridSpec {
        GridSpec::new(2, 2, GeoTransform::new(0.0, 2.0, 1.0, -1.0))
    }

    /// Two frames a year inside the window, each `value(year) / 2`
    fn source(value: impl Fn(i32) -> f64, years: std::ops::RangeInclusive<i32>) -> InMemorySource {
        let frames = years
            .flat_map(|y| {
                let v = value(y) / 2.0;
                [(4, 1), (8, 1)].map(|(m, d)| {
                    RasterFrame::new(NaiveDate::from_ymd_opt(y, m, d).unwrap())
                        .with_band("b", Raster::for_grid(&grid(), v))
                })
            })
            .collect();
        InMemorySource::new(DatasetSchema::new("ds", vec!["b".into()]), grid(), frames).unwrap()
    }

    fn composite() -> CompositeParams {
        CompositeParams {
            band: "b".into(),
            reducer: Reducer::Sum,
            window: SeasonalWindow::from_month_days((3, 1), (9, 30)).unwrap(),
            fallback_value: 0.0,
        }
    }

    #[test]
    fn test_anomaly_plan() {
        let src = source(|y| f64::from(y - 2000), 2000..=2005);
        let plan = AnomalyPlan {
            composite: composite(),
            baseline_years: (2000..=2004).collect(),
            target_years: vec![2005],
            params: AnomalyParams {
                unit_scale: 10.0,
                policy: FallbackPolicy::Exclude,
            },
            mode: ProcessingMode::ParallelWith(2),
        };
        let study = StudyArea::full(grid());
        let report = plan.evaluate(&src, &study).unwrap();
        assert!(report.failures.is_empty());
        // Baseline mean 2, target 5, both scaled by 10
        assert_relative_eq!(report.output[&2005].anomaly.get(0, 0).unwrap(), 30.0, epsilon = 1e-9);
    }

    #[test]
    fn test_trend_plan() {
        let src = source(|y| 3.0 + 0.5 * f64::from(y - 2000), 2000..=2009);
        let plan = TrendPlan {
            composite: composite(),
            years: (2000..=2009).collect(),
            policy: FallbackPolicy::Exclude,
            mode: ProcessingMode::Sequential,
        };
        let trend = plan.evaluate(&src, &StudyArea::full(grid())).unwrap().output;
        assert_relative_eq!(trend.slope.get(1, 1).unwrap(), 0.5, epsilon = 1e-9);
        assert_eq!(trend.points_used.get(1, 1).unwrap(), 10);
    }

    #[test]
    fn test_plan_years_are_merged() {
        let plan = AnomalyPlan {
            composite: composite(),
            baseline_years: vec![2001, 2000],
            target_years: vec![2000, 2003],
            params: AnomalyParams::default(),
            mode: ProcessingMode::Sequential,
        };
        assert_eq!(plan.years(), vec![2000, 2001, 2003]);
    }

    /// Frames of `source`, except that `bad_year` arrives on a 2x2 grid
    struct MisshapenYear {
        inner: InMemorySource,
        bad_year: i32,
    }

    impl RasterTimeSeriesSource for MisshapenYear {
        fn schema(&self) -> Result<DatasetSchema> {
            self.inner.schema()
        }

        fn grid(&self) -> Result<GridSpec> {
            self.inner.grid()
        }

        fn query(&self, geometry: Option<&MultiPolygon<f64>>, range: &DateRange, bands: &[&str]) -> Result<Vec<RasterFrame>> {
            let frames = self.inner.query(geometry, range, bands)?;
            Ok(frames
                .into_iter()
                .map(|f| {
                    if f.date().year() == self.bad_year {
                        RasterFrame::new(f.date()).with_band("b", Raster::filled(2, 2, 1.0))
                    } else {
                        f
                    }
                })
                .collect())
        }
    }

    fn grid3() -> GridSpec {
        GridSpec::new(3, 3, GeoTransform::new(0.0, 3.0, 1.0, -1.0))
    }

    fn misshapen(value: impl Fn(i32) -> f64, years: std::ops::RangeInclusive<i32>, bad_year: i32) -> MisshapenYear {
        let frames = years
            .flat_map(|y| {
                let v = value(y) / 2.0;
                [(4, 1), (8, 1)].map(|(m, d)| {
                    RasterFrame::new(NaiveDate::from_ymd_opt(y, m, d).unwrap())
                        .with_band("b", Raster::for_grid(&grid3(), v))
                })
            })
            .collect();
        let inner = InMemorySource::new(DatasetSchema::new("ds", vec!["b".into()]), grid3(), frames).unwrap();
        MisshapenYear { inner, bad_year }
    }

    #[test]
    fn test_trend_plan_drops_failed_year() {
        let src = misshapen(|y| 3.0 + 0.5 * f64::from(y - 2000), 2000..=2009, 2003);
        let plan = TrendPlan {
            composite: composite(),
            years: (2000..=2009).collect(),
            policy: FallbackPolicy::Exclude,
            mode: ProcessingMode::ParallelWith(2),
        };
        let report = plan.evaluate(&src, &StudyArea::full(grid3())).unwrap();

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].year, 2003);
        assert_eq!(report.output.points_used.get(2, 2).unwrap(), 9);
        assert_relative_eq!(report.output.slope.get(2, 2).unwrap(), 0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_anomaly_plan_skips_failed_years() {
        let src = misshapen(|y| f64::from(y - 2000), 2000..=2005, 2001);
        let plan = AnomalyPlan {
            composite: composite(),
            baseline_years: (2000..=2003).collect(),
            target_years: vec![2001, 2005],
            params: AnomalyParams {
                unit_scale: 1.0,
                policy: FallbackPolicy::Exclude,
            },
            mode: ProcessingMode::Sequential,
        };
        let report = plan.evaluate(&src, &StudyArea::full(grid3())).unwrap();

        assert_eq!(report.failures.iter().map(|f| f.year).collect::<Vec<_>>(), vec![2001]);
        assert!(!report.output.contains_key(&2001));
        // Baseline {0, 2, 3} has mean 5/3
        assert_relative_eq!(report.output[&2005].anomaly.get(1, 1).unwrap(), 5.0 - 5.0 / 3.0, epsilon = 1e-9);
    }
}
