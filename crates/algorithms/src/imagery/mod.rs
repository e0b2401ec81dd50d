//! Per-pixel comparisons between composites
//!
//! - Baseline anomaly: target year against a multi-year mean

mod anomaly;

pub use anomaly::{
    anomaly_from_composites, baseline_anomaly, AnomalyInput, AnomalyParams, AnomalyRaster,
    AnomalyStatus, BaselineAnomaly,
};
