//! Seasonal compositing
//!
//! - [`Reducer`]: per-pixel aggregation operator
//! - [`seasonal_composite`]: one flagged composite per (year, band)
//! - [`CompositeSeries`]: lazily materialized composites over many years

mod reducer;
mod seasonal;
mod series;

pub use reducer::Reducer;
pub use seasonal::{
    seasonal_composite, CompositeContent, CompositeImage, CompositeInput, CompositeParams,
    CompositeStatus, FallbackPolicy, FallbackReason, SeasonalCompositor, UnitStage,
    DEFAULT_FALLBACK_VALUE,
};
pub use series::CompositeSeries;
