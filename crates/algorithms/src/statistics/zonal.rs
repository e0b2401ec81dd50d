//! Regional aggregation
//!
//! Reduces a raster to one scalar per region polygon.
//!
//! The region is sampled on a lattice of cells at the nominal scale: the
//! raster's own pixels when the scale matches the raster, otherwise square
//! cells of that size centred on the region's bounding box, each taking the
//! value of the pixel under the part of the cell the region covers. Every
//! cell carries the fraction of its area inside the region, so cells on the
//! boundary weigh less and a region smaller than one cell still sees the
//! pixel beneath it. Only boundary cells pay for a polygon intersection;
//! the rest are wholly in or out and are decided by their centre.
//!
//! Mean and standard deviation are weighted by coverage (and latitude when
//! asked), sum and count by coverage alone. Min, max, range and median
//! take every touched cell as is.
//!
//! The lattice is reduced tile by tile so that large regions never hold
//! more than one tile of samples per worker. A region without a valid
//! pixel under it yields `None`.

use geo::{Area, BooleanOps, BoundingRect, Centroid, Contains};
use geo_types::{Coord, MultiPolygon, Point, Rect};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use terratrend_core::raster::{GeoTransform, GridSpec, Raster};
use terratrend_core::region::Region;
use terratrend_core::{Error, Result};
use terratrend_parallel::{ProcessingMode, Tile, TiledReducer};
use tracing::trace;

/// Available regional statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZonalStatistic {
    /// Area-weighted mean
    #[default]
    Mean,
    /// Coverage-weighted sum
    Sum,
    /// Covered cells, fractional at the boundary
    Count,
    Min,
    Max,
    Range,
    Median,
    /// Area-weighted population standard deviation
    StdDev,
}

impl FromStr for ZonalStatistic {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "mean" => Ok(ZonalStatistic::Mean),
            "sum" => Ok(ZonalStatistic::Sum),
            "count" => Ok(ZonalStatistic::Count),
            "min" => Ok(ZonalStatistic::Min),
            "max" => Ok(ZonalStatistic::Max),
            "range" => Ok(ZonalStatistic::Range),
            "median" => Ok(ZonalStatistic::Median),
            "std_dev" | "stddev" | "std" => Ok(ZonalStatistic::StdDev),
            _ => Err(Error::InvalidParameter {
                name: "statistic",
                value: s.to_string(),
                reason: "expected mean, sum, count, min, max, range, median or std_dev".to_string(),
            }),
        }
    }
}

impl fmt::Display for ZonalStatistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ZonalStatistic::Mean => "mean",
            ZonalStatistic::Sum => "sum",
            ZonalStatistic::Count => "count",
            ZonalStatistic::Min => "min",
            ZonalStatistic::Max => "max",
            ZonalStatistic::Range => "range",
            ZonalStatistic::Median => "median",
            ZonalStatistic::StdDev => "std_dev",
        };
        f.write_str(name)
    }
}

/// Sample weights for weighted statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AreaWeighting {
    /// Every sample weighs the same (projected grids)
    #[default]
    Uniform,
    /// Samples weigh `cos(latitude)` (geographic grids in degrees)
    Latitude,
}

impl AreaWeighting {
    fn weight(self, y: f64) -> f64 {
        match self {
            AreaWeighting::Uniform => 1.0,
            AreaWeighting::Latitude => y.to_radians().cos().max(0.0),
        }
    }
}

/// Parameters for regional aggregation
#[derive(Debug, Clone, Copy)]
pub struct ZonalParams {
    pub statistic: ZonalStatistic,
    /// Nominal sampling resolution in map units; `None` is the native cell size
    pub scale: Option<f64>,
    /// Larger factors mean smaller tiles
    pub tile_factor: usize,
    pub weighting: AreaWeighting,
    pub mode: ProcessingMode,
}

impl Default for ZonalParams {
    fn default() -> Self {
        Self {
            statistic: ZonalStatistic::Mean,
            scale: None,
            tile_factor: 1,
            weighting: AreaWeighting::Uniform,
            mode: ProcessingMode::Parallel,
        }
    }
}

/// Coverage below this fraction of a cell counts as no overlap
const MIN_COVERAGE: f64 = 1e-9;

/// Slack when deciding which cells a boundary segment touches
const EDGE_SLACK: f64 = 1e-9;

/// Regular grid of sample cells, `(x0, y0)` at its upper-left corner
#[derive(Debug, Clone, Copy)]
struct Lattice {
    x0: f64,
    y0: f64,
    dx: f64,
    dy: f64,
    rows: usize,
    cols: usize,
    /// Raster pixel of cell (0, 0) when the cells are the raster's own pixels
    native: Option<(usize, usize)>,
}

impl Lattice {
    /// Native pixels of the window covering `rect`
    fn native(grid: &GridSpec, rect: Rect<f64>) -> Self {
        let window = grid.window(rect);
        let t = &grid.transform;
        Self {
            x0: t.origin_x + window.col_lo as f64 * t.pixel_width,
            y0: t.origin_y + window.row_lo as f64 * t.pixel_height,
            dx: t.pixel_width,
            dy: t.pixel_height,
            rows: window.rows(),
            cols: window.cols(),
            native: Some((window.row_lo, window.col_lo)),
        }
    }

    /// Cells of side `step` centred on `rect`
    fn regular(rect: Rect<f64>, step: f64) -> Self {
        let count = |extent: f64| ((extent / step).ceil() as usize).max(1);
        let (rows, cols) = (count(rect.height()), count(rect.width()));
        let centre = rect.center();
        Self {
            x0: centre.x - cols as f64 * step / 2.0,
            y0: centre.y + rows as f64 * step / 2.0,
            dx: step,
            dy: -step,
            rows,
            cols,
            native: None,
        }
    }

    fn centre(&self, row: usize, col: usize) -> (f64, f64) {
        (
            self.x0 + (col as f64 + 0.5) * self.dx,
            self.y0 + (row as f64 + 0.5) * self.dy,
        )
    }

    fn cell(&self, row: usize, col: usize) -> Rect<f64> {
        Rect::new(
            (self.x0 + col as f64 * self.dx, self.y0 + row as f64 * self.dy),
            (self.x0 + (col + 1) as f64 * self.dx, self.y0 + (row + 1) as f64 * self.dy),
        )
    }

    /// Closed range of cell indices in `0..n` touched by `[lo, hi]`
    fn span(lo: f64, hi: f64, n: usize) -> Option<(usize, usize)> {
        let (lo, hi) = ((lo - EDGE_SLACK).floor(), (hi + EDGE_SLACK).floor());
        if n == 0 || !lo.is_finite() || !hi.is_finite() || hi < 0.0 || lo >= n as f64 {
            return None;
        }
        Some((lo.max(0.0) as usize, (hi as usize).min(n - 1)))
    }

    /// Row-major flags of the cells the boundary of `geometry` passes
    /// through. Unflagged cells lie wholly inside or wholly outside.
    fn boundary_cells(&self, geometry: &MultiPolygon<f64>) -> Vec<bool> {
        let mut flags = vec![false; self.rows * self.cols];
        if flags.is_empty() {
            return flags;
        }
        let to_cell = |c: Coord<f64>| ((c.x - self.x0) / self.dx, (c.y - self.y0) / self.dy);

        for polygon in &geometry.0 {
            for ring in std::iter::once(polygon.exterior()).chain(polygon.interiors()) {
                for line in ring.lines() {
                    let (u1, v1) = to_cell(line.start);
                    let (u2, v2) = to_cell(line.end);
                    let Some((c_lo, c_hi)) = Self::span(u1.min(u2), u1.max(u2), self.cols) else {
                        continue;
                    };
                    for c in c_lo..=c_hi {
                        // Part of the segment inside column strip [c, c + 1]
                        let (s0, s1) = if (u2 - u1).abs() < EDGE_SLACK {
                            (v1, v2)
                        } else {
                            let t = |u: f64| ((u - u1) / (u2 - u1)).clamp(0.0, 1.0);
                            let (ta, tb) = (t(c as f64), t(c as f64 + 1.0));
                            (v1 + ta * (v2 - v1), v1 + tb * (v2 - v1))
                        };
                        if let Some((r_lo, r_hi)) = Self::span(s0.min(s1), s0.max(s1), self.rows) {
                            for r in r_lo..=r_hi {
                                flags[r * self.cols + c] = true;
                            }
                        }
                    }
                }
            }
        }
        flags
    }

    /// Fraction of cell (row, col) covered by `geometry`, and the point
    /// whose pixel supplies the cell's value
    fn coverage(&self, geometry: &MultiPolygon<f64>, on_boundary: bool, row: usize, col: usize) -> Option<(f64, (f64, f64))> {
        let centre = self.centre(row, col);
        if !on_boundary {
            let inside = geometry.contains(&Point::new(centre.0, centre.1));
            return inside.then_some((1.0, centre));
        }

        let cell = self.cell(row, col);
        let cell_area = cell.width() * cell.height();
        let overlap = geometry.intersection(&MultiPolygon(vec![cell.to_polygon()]));
        let fraction = (overlap.unsigned_area() / cell_area).min(1.0);
        if fraction.is_nan() || fraction <= MIN_COVERAGE {
            return None;
        }
        if fraction >= 1.0 - MIN_COVERAGE {
            return Some((1.0, centre));
        }
        let point = overlap.centroid().map(|p| p.x_y()).unwrap_or(centre);
        Some((fraction, point))
    }
}

/// Partial statistics of a set of samples; mergeable across tiles
#[derive(Debug, Clone)]
struct Accumulator {
    samples: usize,
    /// Covered cells, fractional at the region boundary
    coverage: f64,
    /// Coverage-weighted sum
    sum: f64,
    min: f64,
    max: f64,
    weight: f64,
    /// Weighted running mean and sum of squared deviations
    mean: f64,
    m2: f64,
    values: Option<Vec<f64>>,
}

impl Accumulator {
    fn new(keep_values: bool) -> Self {
        Self {
            samples: 0,
            coverage: 0.0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            weight: 0.0,
            mean: 0.0,
            m2: 0.0,
            values: keep_values.then(Vec::new),
        }
    }

    fn push(&mut self, value: f64, coverage: f64, area_weight: f64) {
        self.samples += 1;
        self.coverage += coverage;
        self.sum += coverage * value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        let w = coverage * area_weight;
        if w > 0.0 {
            self.weight += w;
            let delta = value - self.mean;
            self.mean += delta * w / self.weight;
            self.m2 += w * delta * (value - self.mean);
        }
        if let Some(values) = self.values.as_mut() {
            values.push(value);
        }
    }

    fn merge(mut self, other: Self) -> Self {
        if other.samples == 0 {
            return self;
        }
        if self.samples == 0 {
            return other;
        }
        self.samples += other.samples;
        self.coverage += other.coverage;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        let weight = self.weight + other.weight;
        if weight > 0.0 {
            let delta = other.mean - self.mean;
            self.mean += delta * other.weight / weight;
            self.m2 += other.m2 + delta * delta * self.weight * other.weight / weight;
            self.weight = weight;
        }
        if let (Some(a), Some(b)) = (self.values.as_mut(), other.values) {
            a.extend(b);
        }
        self
    }

    fn finish(self, statistic: ZonalStatistic) -> Option<f64> {
        if self.samples == 0 {
            return None;
        }
        let weighted = |v: f64| (self.weight > 0.0).then_some(v);
        match statistic {
            ZonalStatistic::Mean => weighted(self.mean),
            ZonalStatistic::StdDev => weighted((self.m2 / self.weight).max(0.0).sqrt()),
            ZonalStatistic::Sum => Some(self.sum),
            ZonalStatistic::Count => Some(self.coverage),
            ZonalStatistic::Min => Some(self.min),
            ZonalStatistic::Max => Some(self.max),
            ZonalStatistic::Range => Some(self.max - self.min),
            ZonalStatistic::Median => {
                let mut values = self.values?;
                values.sort_by(|a, b| a.total_cmp(b));
                let n = values.len();
                Some(if n % 2 == 0 {
                    (values[n / 2 - 1] + values[n / 2]) / 2.0
                } else {
                    values[n / 2]
                })
            }
        }
    }
}

fn check_params(params: &ZonalParams) -> Result<()> {
    if let Some(scale) = params.scale {
        if !scale.is_finite() || scale <= 0.0 {
            return Err(Error::InvalidParameter {
                name: "scale",
                value: scale.to_string(),
                reason: "must be a positive distance".to_string(),
            });
        }
    }
    Ok(())
}

fn is_native(transform: &GeoTransform, scale: Option<f64>) -> bool {
    let (w, h) = (transform.pixel_width.abs(), transform.pixel_height.abs());
    match scale {
        None => true,
        Some(s) => (s - w).abs() <= 1e-9 * w && (s - h).abs() <= 1e-9 * h,
    }
}

/// Reduce `raster` over `region`.
///
/// Fails with `InvalidGeometry` for empty or degenerate regions. A region
/// with no valid pixel under it, including one outside the raster, yields
/// `Ok(None)`.
pub fn aggregate(raster: &Raster<f64>, region: &Region, params: &ZonalParams) -> Result<Option<f64>> {
    region.validate()?;
    check_params(params)?;
    let Some(rect) = region.geometry.bounding_rect() else {
        return Ok(None);
    };

    let grid = raster.grid();
    let transform = grid.transform;
    let (rows, cols) = (grid.rows, grid.cols);
    let lattice = match params.scale {
        Some(step) if !is_native(&transform, Some(step)) => Lattice::regular(rect, step),
        _ => Lattice::native(&grid, rect),
    };
    let boundary = lattice.boundary_cells(&region.geometry);

    let keep_values = params.statistic == ZonalStatistic::Median;
    let sample_tile = |tile: &Tile| {
        let mut acc = Accumulator::new(keep_values);
        for (r, c) in tile.cells() {
            let on_boundary = boundary[r * lattice.cols + c];
            let Some((fraction, (x, y))) = lattice.coverage(&region.geometry, on_boundary, r, c) else {
                continue;
            };
            let pixel = match lattice.native {
                Some((row0, col0)) => Some((row0 + r, col0 + c)),
                None => transform.pixel_containing(x, y, rows, cols),
            };
            let Some((row, col)) = pixel else {
                continue;
            };
            let v = unsafe { raster.get_unchecked(row, col) };
            if v.is_finite() && !raster.is_nodata(v) {
                let (_, cy) = lattice.centre(r, c);
                acc.push(v, fraction, params.weighting.weight(cy));
            }
        }
        acc
    };

    let acc = TiledReducer::new(params.tile_factor, params.mode).reduce(
        lattice.rows,
        lattice.cols,
        Accumulator::new(keep_values),
        sample_tile,
        Accumulator::merge,
    );
    trace!(
        region = %region.id,
        samples = acc.samples,
        coverage = acc.coverage,
        statistic = %params.statistic,
        "region reduced"
    );
    Ok(acc.finish(params.statistic))
}

/// Reduce each raster of a stack over `region`, in stack order
pub fn aggregate_stack(rasters: &[&Raster<f64>], region: &Region, params: &ZonalParams) -> Result<Vec<Option<f64>>> {
    rasters.iter().map(|r| aggregate(r, region, params)).collect()
}
