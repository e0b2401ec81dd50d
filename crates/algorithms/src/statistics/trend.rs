//! Linear trend estimation
//!
//! Ordinary least squares of value against year, either for one scalar
//! series or independently for every pixel of a stack of yearly composites.
//!
//! Null points are dropped before fitting. With fewer than two remaining
//! points (or all points in the same year) slope and intercept are
//! undefined; the number of points used is reported either way.

use crate::compositing::{CompositeImage, FallbackPolicy};
use crate::maybe_rayon::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use terratrend_core::raster::Raster;
use terratrend_core::{Algorithm, Error, Result};
use tracing::debug;

/// Slope and intercept of `value = intercept + slope × year`.
///
/// `None` marks an undefined coefficient.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrendResult {
    pub slope: Option<f64>,
    pub intercept: Option<f64>,
    pub points_used: usize,
}

impl TrendResult {
    pub fn undefined(points_used: usize) -> Self {
        Self {
            slope: None,
            intercept: None,
            points_used,
        }
    }

    pub fn is_defined(&self) -> bool {
        self.slope.is_some()
    }

    /// Fitted value at `year`
    pub fn predict(&self, year: i32) -> Option<f64> {
        Some(self.intercept? + self.slope? * f64::from(year))
    }
}

impl fmt::Display for TrendResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.slope, self.intercept) {
            (Some(s), Some(i)) => write!(f, "slope={s:.6} intercept={i:.6} n={}", self.points_used),
            _ => write!(f, "UNDEFINED n={}", self.points_used),
        }
    }
}

/// Fit a trend to `(year, value)` points, ignoring null and non-finite values
pub fn fit_linear_trend(points: &[(i32, Option<f64>)]) -> TrendResult {
    let mut xs = Vec::with_capacity(points.len());
    let mut ys = Vec::with_capacity(points.len());
    for &(year, value) in points {
        if let Some(v) = value.filter(|v| v.is_finite()) {
            xs.push(f64::from(year));
            ys.push(v);
        }
    }
    ols(&xs, &ys)
}

/// Centred least squares over paired samples
fn ols(xs: &[f64], ys: &[f64]) -> TrendResult {
    let n = xs.len();
    if n < 2 {
        return TrendResult::undefined(n);
    }
    let nf = n as f64;
    let x_mean = xs.iter().sum::<f64>() / nf;
    let y_mean = ys.iter().sum::<f64>() / nf;

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        let dx = x - x_mean;
        sxx += dx * dx;
        sxy += dx * (y - y_mean);
    }
    if sxx == 0.0 {
        return TrendResult::undefined(n);
    }

    let slope = sxy / sxx;
    TrendResult {
        slope: Some(slope),
        intercept: Some(y_mean - slope * x_mean),
        points_used: n,
    }
}

/// Pixel-wise trend over yearly composites
#[derive(Debug, Clone)]
pub struct TrendRaster {
    /// NaN where undefined
    pub slope: Raster<f64>,
    /// NaN where undefined
    pub intercept: Raster<f64>,
    /// Valid yearly points per pixel
    pub points_used: Raster<u32>,
    /// Years whose composites entered the fit
    pub years: Vec<i32>,
}

impl TrendRaster {
    /// Trend of a single pixel
    pub fn at(&self, row: usize, col: usize) -> Result<TrendResult> {
        let points_used = self.points_used.get(row, col)? as usize;
        let slope = self.slope.get(row, col)?;
        let intercept = self.intercept.get(row, col)?;
        if slope.is_nan() {
            return Ok(TrendResult::undefined(points_used));
        }
        Ok(TrendResult {
            slope: Some(slope),
            intercept: Some(intercept),
            points_used,
        })
    }

    /// `points_used` as a float band, for export next to slope and intercept
    pub fn points_used_f64(&self) -> Raster<f64> {
        self.points_used.map_valid(f64::from)
    }
}

/// Fit a trend independently for every pixel of `series`.
///
/// `FALLBACK` composites are handled according to `policy`. All composites
/// must share one grid.
pub fn fit_pixel_trend(series: &[(i32, Arc<CompositeImage>)], policy: FallbackPolicy) -> Result<TrendRaster> {
    let first = series.first().ok_or_else(|| Error::InvalidParameter {
        name: "series",
        value: "[]".to_string(),
        reason: "pixel trend needs at least one composite".to_string(),
    })?;
    let grid = first.1.extent();

    let layers: Vec<(f64, &Raster<f64>)> = series
        .iter()
        .filter_map(|(y, c)| c.usable_raster(policy).map(|r| (f64::from(*y), r)))
        .collect();
    for (_, layer) in &layers {
        layer.ensure_shape(grid.rows, grid.cols)?;
    }
    let years: Vec<i32> = series
        .iter()
        .filter(|(_, c)| c.usable_raster(policy).is_some())
        .map(|(y, _)| *y)
        .collect();
    debug!(years = layers.len(), requested = series.len(), "fitting pixel trend");

    let (rows, cols) = (grid.rows, grid.cols);
    let fits: Vec<TrendResult> = (0..rows)
        .into_par_iter()
        .flat_map(|row| {
            let mut xs = Vec::with_capacity(layers.len());
            let mut ys = Vec::with_capacity(layers.len());
            let mut out = Vec::with_capacity(cols);
            for col in 0..cols {
                xs.clear();
                ys.clear();
                for (x, layer) in &layers {
                    let v = unsafe { layer.get_unchecked(row, col) };
                    if v.is_finite() {
                        xs.push(*x);
                        ys.push(v);
                    }
                }
                out.push(ols(&xs, &ys));
            }
            out
        })
        .collect();

    let band = |f: fn(&TrendResult) -> f64| -> Result<Raster<f64>> {
        let mut raster = Raster::from_vec(fits.iter().map(f).collect(), rows, cols)?;
        raster.set_transform(grid.transform);
        raster.set_nodata(Some(f64::NAN));
        Ok(raster)
    };
    let slope = band(|t| t.slope.unwrap_or(f64::NAN))?;
    let intercept = band(|t| t.intercept.unwrap_or(f64::NAN))?;
    let mut points_used = Raster::from_vec(fits.iter().map(|t| t.points_used as u32).collect(), rows, cols)?;
    points_used.set_transform(grid.transform);

    Ok(TrendRaster {
        slope,
        intercept,
        points_used,
        years,
    })
}

/// Scalar linear trend
#[derive(Debug, Clone, Default)]
pub struct LinearTrend;

impl Algorithm for LinearTrend {
    type Input = Vec<(i32, Option<f64>)>;
    type Output = TrendResult;
    type Params = ();
    type Error = Error;

    fn name(&self) -> &'static str {
        "LinearTrend"
    }

    fn description(&self) -> &'static str {
        "Ordinary least-squares slope and intercept of value against year"
    }

    fn execute(&self, input: Self::Input, _params: Self::Params) -> Result<Self::Output> {
        Ok(fit_linear_trend(&input))
    }
}

/// Pixel-wise linear trend
#[derive(Debug, Clone, Default)]
pub struct PixelTrend;

impl Algorithm for PixelTrend {
    type Input = Vec<(i32, Arc<CompositeImage>)>;
    type Output = TrendRaster;
    type Params = FallbackPolicy;
    type Error = Error;

    fn name(&self) -> &'static str {
        "PixelTrend"
    }

    fn description(&self) -> &'static str {
        "Per-pixel least-squares trend across yearly composites"
    }

    fn execute(&self, input: Self::Input, params: Self::Params) -> Result<Self::Output> {
        fit_pixel_trend(&input, params)
    }
}
