//! Main Raster type

use crate::error::{Error, Result};
use crate::raster::{GeoTransform, GridSpec, RasterElement};
use ndarray::{Array2, Zip};

/// A georeferenced 2D raster grid.
///
/// Values are stored row-major as `(row, col)`. Rasters are treated as
/// immutable artifacts once handed to a pipeline stage: every transformation
/// returns a new raster.
///
/// # Example
///
/// ```ignore
/// use terratrend_core::Raster;
///
/// let mut raster: Raster<f64> = Raster::filled(4, 4, 0.0);
/// raster.set(1, 2, 42.0)?;
/// assert_eq!(raster.valid_count(), 16);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Raster<T: RasterElement> {
    data: Array2<T>,
    transform: GeoTransform,
    nodata: Option<T>,
}

impl<T: RasterElement> Raster<T> {
    /// Create a new raster filled with zeros
    pub fn new(rows: usize, cols: usize) -> Self {
        Self::from_array(Array2::zeros((rows, cols)))
    }

    /// Create a new raster filled with a specific value
    pub fn filled(rows: usize, cols: usize, value: T) -> Self {
        Self::from_array(Array2::from_elem((rows, cols), value))
    }

    /// Create a raster covering a grid, filled with a value
    pub fn for_grid(grid: &GridSpec, value: T) -> Self {
        let mut raster = Self::filled(grid.rows, grid.cols, value);
        raster.transform = grid.transform;
        raster
    }

    /// Create a raster from row-major data
    pub fn from_vec(data: Vec<T>, rows: usize, cols: usize) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(Error::InvalidDimensions {
                width: cols,
                height: rows,
            });
        }

        let array = Array2::from_shape_vec((rows, cols), data)
            .map_err(|e| Error::Other(e.to_string()))?;
        Ok(Self::from_array(array))
    }

    /// Create a raster from an ndarray
    pub fn from_array(data: Array2<T>) -> Self {
        Self {
            data,
            transform: GeoTransform::default(),
            nodata: None,
        }
    }

    // Dimensions

    pub fn rows(&self) -> usize {
        self.data.nrows()
    }

    pub fn cols(&self) -> usize {
        self.data.ncols()
    }

    /// Dimensions as (rows, cols)
    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    /// Total number of cells
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Grid description of this raster
    pub fn grid(&self) -> GridSpec {
        GridSpec::new(self.rows(), self.cols(), self.transform)
    }

    /// Fails with `SizeMismatch` unless `self` covers `grid`
    pub fn ensure_shape(&self, rows: usize, cols: usize) -> Result<()> {
        if self.shape() != (rows, cols) {
            return Err(Error::SizeMismatch {
                er: rows,
                ec: cols,
                ar: self.rows(),
                ac: self.cols(),
            });
        }
        Ok(())
    }

    // Data access

    /// Get value at (row, col)
    pub fn get(&self, row: usize, col: usize) -> Result<T> {
        self.data
            .get((row, col))
            .copied()
            .ok_or(Error::IndexOutOfBounds {
                row,
                col,
                rows: self.rows(),
                cols: self.cols(),
            })
    }

    /// Get value at (row, col) without bounds checking
    ///
    /// # Safety
    /// Caller must ensure row < self.rows() and col < self.cols()
    pub unsafe fn get_unchecked(&self, row: usize, col: usize) -> T {
        unsafe { *self.data.uget((row, col)) }
    }

    /// Set value at (row, col)
    pub fn set(&mut self, row: usize, col: usize, value: T) -> Result<()> {
        let (rows, cols) = self.shape();
        match self.data.get_mut((row, col)) {
            Some(cell) => {
                *cell = value;
                Ok(())
            }
            None => Err(Error::IndexOutOfBounds { row, col, rows, cols }),
        }
    }

    pub fn data(&self) -> &Array2<T> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Array2<T> {
        &mut self.data
    }

    // Metadata

    pub fn transform(&self) -> &GeoTransform {
        &self.transform
    }

    pub fn set_transform(&mut self, transform: GeoTransform) {
        self.transform = transform;
    }

    pub fn nodata(&self) -> Option<T> {
        self.nodata
    }

    pub fn set_nodata(&mut self, nodata: Option<T>) {
        self.nodata = nodata;
    }

    pub fn cell_size(&self) -> f64 {
        self.transform.cell_size()
    }

    /// Geographic bounds (min_x, min_y, max_x, max_y)
    pub fn bounds(&self) -> (f64, f64, f64, f64) {
        self.transform.bounds(self.cols(), self.rows())
    }

    // Masking

    pub fn is_nodata(&self, value: T) -> bool {
        value.is_masked(self.nodata)
    }

    /// Number of unmasked cells
    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|v| !self.is_nodata(**v)).count()
    }

    /// Apply `f` to every unmasked cell; masked cells become the type's mask value
    pub fn map_valid<U, F>(&self, f: F) -> Raster<U>
    where
        U: RasterElement,
        F: Fn(T) -> U,
    {
        let data = self.data.mapv(|v| if self.is_nodata(v) { U::mask_value() } else { f(v) });
        Raster {
            data,
            transform: self.transform,
            nodata: None,
        }
    }

    /// Combine two rasters of the same shape cell by cell.
    ///
    /// The result is masked wherever either operand is masked.
    pub fn zip_valid<F>(&self, other: &Raster<T>, f: F) -> Result<Raster<T>>
    where
        F: Fn(T, T) -> T,
    {
        other.ensure_shape(self.rows(), self.cols())?;
        let mut data = Array2::from_elem(self.shape(), T::mask_value());
        Zip::from(&mut data)
            .and(&self.data)
            .and(&other.data)
            .for_each(|out, &a, &b| {
                if !self.is_nodata(a) && !other.is_nodata(b) {
                    *out = f(a, b);
                }
            });
        Ok(Raster {
            data,
            transform: self.transform,
            nodata: None,
        })
    }

    /// Basic statistics over unmasked cells
    pub fn statistics(&self) -> RasterStatistics {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        let mut count = 0usize;

        for v in self.data.iter().filter(|v| !self.is_nodata(**v)) {
            if let Some(v) = v.to_f64() {
                min = min.min(v);
                max = max.max(v);
                sum += v;
                count += 1;
            }
        }

        RasterStatistics {
            min: (count > 0).then_some(min),
            max: (count > 0).then_some(max),
            mean: (count > 0).then(|| sum / count as f64),
            valid_count: count,
            nodata_count: self.len() - count,
        }
    }
}

/// Basic statistics for a raster
#[derive(Debug, Clone, PartialEq)]
pub struct RasterStatistics {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    pub valid_count: usize,
    pub nodata_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raster_creation() {
        let raster: Raster<f64> = Raster::new(10, 20);
        assert_eq!(raster.rows(), 10);
        assert_eq!(raster.cols(), 20);
        assert_eq!(raster.shape(), (10, 20));
    }

    #[test]
    fn test_raster_access() {
        let mut raster: Raster<f64> = Raster::new(3, 3);
        raster.set(1, 2, 42.0).unwrap();
        assert_eq!(raster.get(1, 2).unwrap(), 42.0);
        assert!(raster.set(3, 0, 1.0).is_err());
        assert!(raster.get(0, 3).is_err());
    }

    #[test]
    fn test_valid_count_ignores_nan() {
        let mut raster = Raster::filled(4, 4, 1.0_f64);
        raster.set(0, 0, f64::NAN).unwrap();
        raster.set(3, 3, f64::NAN).unwrap();
        assert_eq!(raster.valid_count(), 14);
    }

    #[test]
    fn test_zip_valid_propagates_mask() {
        let mut a = Raster::filled(2, 2, 5.0_f64);
        let b = Raster::filled(2, 2, 2.0_f64);
        a.set(0, 1, f64::NAN).unwrap();

        let diff = a.zip_valid(&b, |x, y| x - y).unwrap();
        assert_eq!(diff.get(0, 0).unwrap(), 3.0);
        assert!(diff.get(0, 1).unwrap().is_nan());
    }

    #[test]
    fn test_zip_valid_shape_mismatch() {
        let a = Raster::filled(2, 2, 1.0_f64);
        let b = Raster::filled(3, 2, 1.0_f64);
        assert!(matches!(a.zip_valid(&b, |x, y| x + y), Err(Error::SizeMismatch { .. })));
    }

    #[test]
    fn test_raster_statistics() {
        let mut raster: Raster<f64> = Raster::new(10, 10);
        for i in 0..10 {
            for j in 0..10 {
                raster.set(i, j, (i * 10 + j) as f64).unwrap();
            }
        }
        raster.set(5, 5, f64::NAN).unwrap();

        let stats = raster.statistics();
        assert_eq!(stats.min, Some(0.0));
        assert_eq!(stats.max, Some(99.0));
        assert_eq!(stats.valid_count, 99);
        assert_eq!(stats.nodata_count, 1);
    }

    #[test]
    fn test_statistics_all_masked() {
        let raster = Raster::filled(2, 2, f64::NAN);
        let stats = raster.statistics();
        assert_eq!(stats.mean, None);
        assert_eq!(stats.valid_count, 0);
    }
}
