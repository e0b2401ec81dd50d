//! Grid extents and study-area masks

use crate::error::{Error, Result};
use crate::raster::GeoTransform;
use geo::{BoundingRect, Contains};
use geo_types::{MultiPolygon, Point, Rect};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Shape and georeferencing of a fixed raster grid
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub rows: usize,
    pub cols: usize,
    pub transform: GeoTransform,
}

impl GridSpec {
    pub fn new(rows: usize, cols: usize, transform: GeoTransform) -> Self {
        Self { rows, cols, transform }
    }

    /// Bounding box `(min_x, min_y, max_x, max_y)`
    pub fn bounds(&self) -> (f64, f64, f64, f64) {
        self.transform.bounds(self.cols, self.rows)
    }

    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pixels whose cells intersect `rect`, clamped to the grid
    pub fn window(&self, rect: Rect<f64>) -> PixelWindow {
        let (c0, r0) = self.transform.geo_to_pixel(rect.min().x, rect.max().y);
        let (c1, r1) = self.transform.geo_to_pixel(rect.max().x, rect.min().y);
        let clamp = |v: f64, hi: usize| -> usize {
            if v.is_nan() || v <= 0.0 {
                0
            } else {
                (v as usize).min(hi)
            }
        };
        PixelWindow {
            row_lo: clamp(r0.min(r1).floor(), self.rows),
            row_hi: clamp(r0.max(r1).ceil(), self.rows),
            col_lo: clamp(c0.min(c1).floor(), self.cols),
            col_hi: clamp(c0.max(c1).ceil(), self.cols),
        }
    }
}

/// Half-open block of pixels `row_lo..row_hi × col_lo..col_hi`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelWindow {
    pub row_lo: usize,
    pub row_hi: usize,
    pub col_lo: usize,
    pub col_hi: usize,
}

impl PixelWindow {
    pub fn rows(&self) -> usize {
        self.row_hi - self.row_lo
    }

    pub fn cols(&self) -> usize {
        self.col_hi - self.col_lo
    }

    pub fn is_empty(&self) -> bool {
        self.rows() == 0 || self.cols() == 0
    }
}

/// Pixel-centre membership mask of a geometry over a grid.
///
/// Only the pixel window covering the geometry's bounding box is tested.
pub fn rasterize_membership(grid: &GridSpec, geometry: &MultiPolygon<f64>) -> Array2<bool> {
    let mut mask = Array2::from_elem((grid.rows, grid.cols), false);
    let Some(rect) = geometry.bounding_rect() else {
        return mask;
    };

    let window = grid.window(rect);
    for row in window.row_lo..window.row_hi {
        for col in window.col_lo..window.col_hi {
            let (x, y) = grid.transform.pixel_to_geo(col, row);
            if geometry.0.iter().any(|p| p.contains(&Point::new(x, y))) {
                mask[(row, col)] = true;
            }
        }
    }
    mask
}

/// The study geometry laid onto the dataset grid.
///
/// Composites are restricted to pixels inside the study area; without a
/// geometry the whole grid is inside.
#[derive(Debug, Clone)]
pub struct StudyArea {
    grid: GridSpec,
    geometry: Option<MultiPolygon<f64>>,
    mask: Array2<bool>,
}

impl StudyArea {
    /// Study area covering the whole grid
    pub fn full(grid: GridSpec) -> Self {
        Self {
            grid,
            geometry: None,
            mask: Array2::from_elem((grid.rows, grid.cols), true),
        }
    }

    /// Study area restricted to a geometry.
    ///
    /// Fails when the geometry does not cover a single pixel centre of the grid.
    pub fn with_geometry(grid: GridSpec, geometry: MultiPolygon<f64>) -> Result<Self> {
        let mask = rasterize_membership(&grid, &geometry);
        if !mask.iter().any(|&inside| inside) {
            return Err(Error::InvalidGeometry {
                region: "study area".to_string(),
                reason: "geometry covers no pixel of the dataset grid".to_string(),
            });
        }
        Ok(Self {
            grid,
            geometry: Some(geometry),
            mask,
        })
    }

    pub fn grid(&self) -> &GridSpec {
        &self.grid
    }

    pub fn geometry(&self) -> Option<&MultiPolygon<f64>> {
        self.geometry.as_ref()
    }

    pub fn mask(&self) -> &Array2<bool> {
        &self.mask
    }

    /// Whether pixel (row, col) lies inside the study area
    pub fn contains(&self, row: usize, col: usize) -> bool {
        self.mask.get((row, col)).copied().unwrap_or(false)
    }

    /// Number of pixels inside the study area
    pub fn pixel_count(&self) -> usize {
        self.mask.iter().filter(|&&inside| inside).count()
    }
}
