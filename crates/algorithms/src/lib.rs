//! # terratrend algorithms
//!
//! Seasonal anomaly and trend analysis over raster time series.
//!
//! ## Available Algorithm Categories
//!
//! - **compositing**: seasonal composites with a flagged fallback
//! - **imagery**: baseline anomalies
//! - **statistics**: linear trends, regional aggregation
//! - **pipeline**: configuration, plans and region × year batches

pub mod compositing;
pub mod imagery;
pub mod pipeline;
pub mod statistics;

mod maybe_rayon;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::compositing::{
        seasonal_composite, CompositeImage, CompositeParams, CompositeSeries, CompositeStatus,
        FallbackPolicy, FallbackReason, Reducer, SeasonalCompositor,
    };
    pub use crate::imagery::{
        anomaly_from_composites, baseline_anomaly, AnomalyParams, AnomalyRaster, AnomalyStatus,
        BaselineAnomaly,
    };
    pub use crate::pipeline::{
        regional_anomaly, AnomalyPlan, PipelineConfig, RegionalTrendPlan, RegionalTrendReport,
        TrendPlan,
    };
    pub use crate::statistics::{
        aggregate, aggregate_stack, fit_linear_trend, fit_pixel_trend, AreaWeighting, LinearTrend,
        PixelTrend, TrendRaster, TrendResult, ZonalParams, ZonalStatistic,
    };
    pub use terratrend_core::prelude::*;
    pub use terratrend_parallel::ProcessingMode;
}
