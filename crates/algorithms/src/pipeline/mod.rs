//! Pipeline orchestration
//!
//! Plans built from a [`PipelineConfig`] pull composites lazily and run
//! their independent units with bounded concurrency.

mod config;
mod plan;
mod regional;

pub use config::{PipelineConfig, RegionSettings, ZonalSettings};
pub use plan::{AnomalyPlan, PlanReport, TrendPlan, YearFailure};
pub use regional::{
    regional_anomaly, RegionYearValue, RegionalAnomalyReport, RegionalTrendPlan, RegionalTrendReport,
    UnitFailure,
};
