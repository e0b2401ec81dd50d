//! Pipeline configuration file support.
//!
//! A run is described by one TOML document:
//!
//! ```toml
//! dataset_id = "CHIRPS/DAILY"
//! band_name = "precipitation"
//! aggregation_op = "sum"
//! baseline_start = 1981
//! baseline_end = 2022
//! target_years = [2023]
//! season_start = { month = 3, day = 1 }
//! season_end = { month = 9, day = 30 }
//! unit_scale = 1000.0
//!
//! [zonal]
//! statistic = "mean"
//! tile_factor = 4
//! ```

use crate::compositing::{CompositeParams, FallbackPolicy, Reducer, DEFAULT_FALLBACK_VALUE};
use crate::imagery::AnomalyParams;
use crate::statistics::{AreaWeighting, ZonalParams, ZonalStatistic};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use terratrend_core::temporal::{MonthDay, SeasonalWindow};
use terratrend_core::{Error, Result};
use terratrend_parallel::ProcessingMode;

/// Everything a pipeline run needs besides its data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub dataset_id: String,
    pub band_name: String,
    #[serde(default = "default_aggregation_op")]
    pub aggregation_op: Reducer,
    /// First baseline year, inclusive
    pub baseline_start: i32,
    /// Last baseline year, inclusive
    pub baseline_end: i32,
    pub target_years: Vec<i32>,
    pub season_start: MonthDay,
    pub season_end: MonthDay,
    /// Multiplier to output units, applied to both anomaly operands
    #[serde(default = "default_unit_scale")]
    pub unit_scale: f64,
    /// Written in place of masked pixels on export
    #[serde(default = "default_no_data_sentinel")]
    pub no_data_sentinel: f64,
    /// Nominal resolution of regional reductions, in map units
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_scale: Option<f64>,
    #[serde(default = "default_fallback_value")]
    pub fallback_value: f64,
    #[serde(default)]
    pub fallback_policy: FallbackPolicy,
    /// First trend year; defaults to `baseline_start`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trend_start: Option<i32>,
    /// Last trend year; defaults to the last target year
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trend_end: Option<i32>,
    /// Concurrent units at most; all cores when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub zonal: ZonalSettings,
    #[serde(default)]
    pub regions: RegionSettings,
}

/// Regional reduction settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZonalSettings {
    #[serde(default)]
    pub statistic: ZonalStatistic,
    #[serde(default = "default_tile_factor")]
    pub tile_factor: usize,
    #[serde(default)]
    pub weighting: AreaWeighting,
}

impl Default for ZonalSettings {
    fn default() -> Self {
        Self {
            statistic: ZonalStatistic::Mean,
            tile_factor: default_tile_factor(),
            weighting: AreaWeighting::Uniform,
        }
    }
}

/// How region identifiers are resolved from GeoJSON features
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionSettings {
    #[serde(default = "default_name_property")]
    pub name_property: String,
}

impl Default for RegionSettings {
    fn default() -> Self {
        Self {
            name_property: default_name_property(),
        }
    }
}

fn default_aggregation_op() -> Reducer {
    Reducer::Sum
}

fn default_unit_scale() -> f64 {
    1.0
}

fn default_no_data_sentinel() -> f64 {
    -9999.0
}

fn default_fallback_value() -> f64 {
    DEFAULT_FALLBACK_VALUE
}

fn default_tile_factor() -> usize {
    1
}

fn default_name_property() -> String {
    "name".to_string()
}

impl PipelineConfig {
    /// Load and validate a configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: PipelineConfig =
            toml::from_str(content).map_err(|e| Error::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Reject settings no run could satisfy
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::Config(msg));

        if self.band_name.trim().is_empty() {
            return invalid("band_name must not be empty".to_string());
        }
        if self.baseline_start > self.baseline_end {
            return invalid(format!(
                "baseline_start {} is after baseline_end {}",
                self.baseline_start, self.baseline_end
            ));
        }
        if self.target_years.is_empty() {
            return invalid("target_years must list at least one year".to_string());
        }
        if !self.unit_scale.is_finite() || self.unit_scale == 0.0 {
            return invalid(format!("unit_scale must be finite and non-zero, got {}", self.unit_scale));
        }
        if !self.no_data_sentinel.is_finite() {
            return invalid("no_data_sentinel must be finite".to_string());
        }
        if let Some(scale) = self.export_scale {
            if !scale.is_finite() || scale <= 0.0 {
                return invalid(format!("export_scale must be positive, got {scale}"));
            }
        }
        if !self.fallback_value.is_finite() {
            return invalid("fallback_value must be finite".to_string());
        }
        let (first, last) = self.trend_span();
        if first > last {
            return invalid(format!("trend years {first}..={last} are inverted"));
        }
        if self.zonal.tile_factor == 0 {
            return invalid("zonal.tile_factor must be at least 1".to_string());
        }
        if self.max_concurrency == Some(0) {
            return invalid("max_concurrency must be at least 1".to_string());
        }
        self.window().map_err(|e| Error::Config(format!("invalid seasonal window: {e}")))?;
        Ok(())
    }

    /// Seasonal window with validated bounds
    pub fn window(&self) -> Result<SeasonalWindow> {
        Ok(SeasonalWindow::new(
            MonthDay::new(self.season_start.month, self.season_start.day)?,
            MonthDay::new(self.season_end.month, self.season_end.day)?,
        ))
    }

    pub fn baseline_years(&self) -> Vec<i32> {
        (self.baseline_start..=self.baseline_end).collect()
    }

    /// First and last trend year
    pub fn trend_span(&self) -> (i32, i32) {
        let first = self.trend_start.unwrap_or(self.baseline_start);
        let last = self
            .trend_end
            .or_else(|| self.target_years.iter().copied().max())
            .unwrap_or(self.baseline_end);
        (first, last)
    }

    pub fn trend_years(&self) -> Vec<i32> {
        let (first, last) = self.trend_span();
        (first..=last).collect()
    }

    /// Every year any plan of this configuration may pull, ascending
    pub fn all_years(&self) -> Vec<i32> {
        let mut years: BTreeSet<i32> = self.baseline_years().into_iter().collect();
        years.extend(self.target_years.iter().copied());
        years.extend(self.trend_years());
        years.into_iter().collect()
    }

    pub fn composite_params(&self) -> Result<CompositeParams> {
        Ok(CompositeParams {
            band: self.band_name.clone(),
            reducer: self.aggregation_op,
            window: self.window()?,
            fallback_value: self.fallback_value,
        })
    }

    pub fn anomaly_params(&self) -> AnomalyParams {
        AnomalyParams {
            unit_scale: self.unit_scale,
            policy: self.fallback_policy,
        }
    }

    /// Regional reduction at `export_scale`, on the current worker pool
    pub fn zonal_params(&self) -> ZonalParams {
        ZonalParams {
            statistic: self.zonal.statistic,
            scale: self.export_scale,
            tile_factor: self.zonal.tile_factor,
            weighting: self.zonal.weighting,
            mode: ProcessingMode::Parallel,
        }
    }

    /// Bound on concurrently processed units
    pub fn processing_mode(&self) -> ProcessingMode {
        ProcessingMode::bounded(self.max_concurrency.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
dataset_id = "CHIRPS/DAILY"
band_name = "precipitation"
baseline_start = 1981
baseline_end = 2022
target_years = [2023]
season_start = { month = 3, day = 1 }
season_end = { month = 9, day = 30 }
"#;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.aggregation_op, Reducer::Sum);
        assert_eq!(config.unit_scale, 1.0);
        assert_eq!(config.no_data_sentinel, -9999.0);
        assert_eq!(config.export_scale, None);
        assert_eq!(config.fallback_policy, FallbackPolicy::Exclude);
        assert_eq!(config.zonal.tile_factor, 1);
        assert_eq!(config.regions.name_property, "name");
        assert_eq!(config.baseline_years().len(), 42);
        assert_eq!(config.trend_span(), (1981, 2023));
        assert_eq!(config.all_years().len(), 43);
        assert_eq!(config.processing_mode(), ProcessingMode::Parallel);
    }

    #[test]
    fn test_full_document() {
        let text = format!(
            "{MINIMAL}\naggregation_op = \"p90\"\nunit_scale = 1000.0\nexport_scale = 5000.0\n\
             fallback_policy = \"as_constant\"\ntrend_start = 2000\nmax_concurrency = 4\n\
             [zonal]\nstatistic = \"median\"\ntile_factor = 8\nweighting = \"latitude\"\n\
             [regions]\nname_property = \"NAME_1\"\n"
        );
        let config = PipelineConfig::from_toml_str(&text).unwrap();
        assert_eq!(config.aggregation_op, Reducer::Percentile(90.0));
        assert_eq!(config.trend_years().first(), Some(&2000));
        assert_eq!(config.processing_mode(), ProcessingMode::ParallelWith(4));

        let zonal = config.zonal_params();
        assert_eq!(zonal.statistic, ZonalStatistic::Median);
        assert_eq!(zonal.scale, Some(5000.0));
        assert_eq!(zonal.weighting, AreaWeighting::Latitude);
        assert_eq!(config.regions.name_property, "NAME_1");

        let again = PipelineConfig::from_toml_str(&config.to_toml_string().unwrap()).unwrap();
        assert_eq!(again, config);
    }

    #[test]
    fn test_rejects_bad_settings() {
        let cases = [
            "baseline_start = 2030",
            "unit_scale = 0.0",
            "target_years = []",
            "season_end = { month = 2, day = 30 }",
            "aggregation_op = \"mode\"",
        ];
        for case in cases {
            let key = case.split(" = ").next().unwrap();
            let text: String = MINIMAL
                .lines()
                .filter(|l| !l.starts_with(&format!("{key} =")))
                .chain(std::iter::once(case))
                .collect::<Vec<_>>()
                .join("\n");
            let result = PipelineConfig::from_toml_str(&text);
            assert!(matches!(result, Err(Error::Config(_))), "accepted: {case}");
        }
    }

    #[test]
    fn test_missing_file() {
        let result = PipelineConfig::from_file("/nonexistent/terratrend.toml");
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
