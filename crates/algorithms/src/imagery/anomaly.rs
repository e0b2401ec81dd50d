//! Baseline anomaly
//!
//! `anomaly = target × scale − mean(baseline) × scale`, per pixel.
//!
//! The unit conversion is applied to both operands before subtracting. An
//! anomaly whose baseline or target carries no data is `Undefined`: fully
//! masked, with the reason attached, never rendered as zero.

use crate::compositing::{CompositeImage, CompositeSeries, FallbackPolicy};
use crate::maybe_rayon::*;
use std::fmt;
use std::sync::Arc;
use terratrend_core::raster::{GridSpec, Raster};
use terratrend_core::{Algorithm, Error, Result};
use tracing::{info, warn};

/// Whether an anomaly raster carries data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnomalyStatus {
    Valid,
    Undefined { reason: String },
}

impl AnomalyStatus {
    pub fn is_valid(&self) -> bool {
        matches!(self, AnomalyStatus::Valid)
    }
}

impl fmt::Display for AnomalyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnomalyStatus::Valid => f.write_str("VALID"),
            AnomalyStatus::Undefined { reason } => write!(f, "UNDEFINED ({reason})"),
        }
    }
}

/// Per-pixel difference between a target year and a baseline mean
#[derive(Debug, Clone)]
pub struct AnomalyRaster {
    pub target_year: i32,
    pub unit_scale: f64,
    pub status: AnomalyStatus,
    /// Scaled target minus scaled baseline mean; all NaN when undefined
    pub anomaly: Raster<f64>,
    /// Scaled baseline mean, when at least one baseline year carried data
    pub baseline_mean: Option<Raster<f64>>,
    /// Scaled target composite, when it carried data
    pub target: Option<Raster<f64>>,
    /// Baseline years that entered the mean
    pub baseline_years_used: Vec<i32>,
}

impl AnomalyRaster {
    /// Key/value description stored next to the pixels on export
    pub fn metadata(&self) -> Vec<(String, String)> {
        let years: Vec<String> = self.baseline_years_used.iter().map(i32::to_string).collect();
        vec![
            ("STATUS".to_string(), self.status.to_string()),
            ("TARGET_YEAR".to_string(), self.target_year.to_string()),
            ("UNIT_SCALE".to_string(), self.unit_scale.to_string()),
            ("BASELINE_YEARS".to_string(), years.join(",")),
        ]
    }

    pub fn is_valid(&self) -> bool {
        self.status.is_valid()
    }
}

/// Parameters for the baseline anomaly
#[derive(Debug, Clone, Copy)]
pub struct AnomalyParams {
    /// Multiplier converting composite values to output units
    pub unit_scale: f64,
    pub policy: FallbackPolicy,
}

impl Default for AnomalyParams {
    fn default() -> Self {
        Self {
            unit_scale: 1.0,
            policy: FallbackPolicy::Exclude,
        }
    }
}

/// Input of [`BaselineAnomaly`]
#[derive(Debug, Clone)]
pub struct AnomalyInput {
    pub baseline: Vec<Arc<CompositeImage>>,
    pub target: Arc<CompositeImage>,
}

/// Baseline anomaly engine
#[derive(Debug, Clone, Default)]
pub struct BaselineAnomaly;

impl Algorithm for BaselineAnomaly {
    type Input = AnomalyInput;
    type Output = AnomalyRaster;
    type Params = AnomalyParams;
    type Error = Error;

    fn name(&self) -> &'static str {
        "BaselineAnomaly"
    }

    fn description(&self) -> &'static str {
        "Difference between a target seasonal composite and the mean of baseline composites"
    }

    fn execute(&self, input: Self::Input, params: Self::Params) -> Result<Self::Output> {
        anomaly_from_composites(&input.baseline, &input.target, params)
    }
}

fn check_scale(unit_scale: f64) -> Result<()> {
    if !unit_scale.is_finite() || unit_scale == 0.0 {
        return Err(Error::InvalidParameter {
            name: "unit_scale",
            value: unit_scale.to_string(),
            reason: "must be finite and non-zero".to_string(),
        });
    }
    Ok(())
}

/// Anomaly of `target_year` against `baseline_years`, pulling composites
/// from `series`.
///
/// Every year must belong to the series. Source and schema errors
/// propagate; absence of data yields an `Undefined` anomaly.
pub fn baseline_anomaly(
    series: &CompositeSeries<'_>,
    baseline_years: &[i32],
    target_year: i32,
    params: AnomalyParams,
) -> Result<AnomalyRaster> {
    check_scale(params.unit_scale)?;
    let baseline = baseline_years
        .iter()
        .map(|&y| series.get(y))
        .collect::<Result<Vec<_>>>()?;
    let target = series.get(target_year)?;
    anomaly_from_composites(&baseline, &target, params)
}

/// Anomaly from already materialized composites.
///
/// A `FALLBACK` target is always undefined. Baseline composites enter the
/// mean according to `params.policy`, but at least one of them must carry
/// data for the anomaly to be defined.
pub fn anomaly_from_composites(
    baseline: &[Arc<CompositeImage>],
    target: &CompositeImage,
    params: AnomalyParams,
) -> Result<AnomalyRaster> {
    check_scale(params.unit_scale)?;
    let grid = target.extent();
    let scale = params.unit_scale;

    let usable: Vec<(i32, &Raster<f64>)> = baseline
        .iter()
        .filter_map(|c| c.usable_raster(params.policy).map(|r| (c.year, r)))
        .collect();
    for (_, raster) in &usable {
        raster.ensure_shape(grid.rows, grid.cols)?;
    }
    let baseline_years_used: Vec<i32> = usable.iter().map(|(y, _)| *y).collect();
    let baseline_has_data = baseline.iter().any(|c| !c.is_fallback());

    let baseline_mean = if baseline_has_data {
        Some(scaled_mean(&usable, grid, scale)?)
    } else {
        None
    };
    let target_scaled = (!target.is_fallback()).then(|| scaled(target.raster(), scale));

    let undefined = |reason: String| {
        warn!(target_year = target.year, %reason, "anomaly undefined");
        let mut anomaly = Raster::for_grid(&grid, f64::NAN);
        anomaly.set_nodata(Some(f64::NAN));
        AnomalyRaster {
            target_year: target.year,
            unit_scale: scale,
            status: AnomalyStatus::Undefined { reason },
            anomaly,
            baseline_mean: baseline_mean.clone(),
            target: target_scaled.clone(),
            baseline_years_used: baseline_years_used.clone(),
        }
    };

    if baseline.is_empty() {
        return Ok(undefined("no baseline years requested".to_string()));
    }
    if !baseline_has_data {
        return Ok(undefined(format!(
            "none of the {} baseline composites carries data",
            baseline.len()
        )));
    }
    let (Some(mean), Some(target_raster)) = (&baseline_mean, &target_scaled) else {
        let reason = target
            .fallback_reason()
            .map(|r| format!("target year {}: {r}", target.year))
            .unwrap_or_else(|| format!("target year {} has no data", target.year));
        return Ok(undefined(reason));
    };

    let anomaly = target_raster.zip_valid(mean, |t, m| t - m)?;
    info!(
        target_year = target.year,
        baseline_years = baseline_years_used.len(),
        valid_pixels = anomaly.valid_count(),
        "anomaly computed"
    );

    Ok(AnomalyRaster {
        target_year: target.year,
        unit_scale: scale,
        status: AnomalyStatus::Valid,
        anomaly,
        baseline_mean,
        target: target_scaled,
        baseline_years_used,
    })
}

fn scaled(raster: &Raster<f64>, scale: f64) -> Raster<f64> {
    let mut out = raster.map_valid(|v| v * scale);
    out.set_nodata(Some(f64::NAN));
    out
}

/// Per-pixel mean of the valid values across `layers`, then scaled
fn scaled_mean(layers: &[(i32, &Raster<f64>)], grid: GridSpec, scale: f64) -> Result<Raster<f64>> {
    let (rows, cols) = (grid.rows, grid.cols);
    let data: Vec<f64> = (0..rows)
        .into_par_iter()
        .flat_map(|row| {
            let mut out = Vec::with_capacity(cols);
            for col in 0..cols {
                let mut sum = 0.0;
                let mut n = 0usize;
                for (_, layer) in layers {
                    let v = unsafe { layer.get_unchecked(row, col) };
                    if v.is_finite() {
                        sum += v;
                        n += 1;
                    }
                }
                out.push(if n > 0 { sum / n as f64 * scale } else { f64::NAN });
            }
            out
        })
        .collect();

    let mut raster = Raster::from_vec(data, rows, cols)?;
    raster.set_transform(grid.transform);
    raster.set_nodata(Some(f64::NAN));
    Ok(raster)
}
