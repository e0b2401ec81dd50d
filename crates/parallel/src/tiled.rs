//! Tiling of large pixel windows
//!
//! Reductions over large regions are split into tiles so that per-call
//! working memory stays bounded. Tiling never changes which pixels are
//! visited, only how many are held at once.

use crate::strategy::{ParallelStrategy, ProcessingMode};

/// Largest tile side, reached with a tile factor of 1
pub const BASE_TILE_SIZE: usize = 256;
/// Smallest tile side, whatever the factor
pub const MIN_TILE_SIZE: usize = 16;

/// A rectangular subset of a window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    /// Row offset in the window
    pub row_offset: usize,
    /// Column offset in the window
    pub col_offset: usize,
    pub rows: usize,
    pub cols: usize,
}

impl Tile {
    /// Number of cells in this tile
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate window coordinates `(row, col)` of every cell, row-major
    pub fn cells(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (self.row_offset..self.row_offset + self.rows)
            .flat_map(move |r| (self.col_offset..self.col_offset + self.cols).map(move |c| (r, c)))
    }
}

/// Iterator over non-overlapping tiles covering a window, row-major
pub struct TileIterator {
    total_rows: usize,
    total_cols: usize,
    tile_size: usize,
    current_row: usize,
    current_col: usize,
}

impl TileIterator {
    pub fn new(total_rows: usize, total_cols: usize, tile_size: usize) -> Self {
        Self {
            total_rows,
            total_cols,
            tile_size: tile_size.max(1),
            current_row: 0,
            current_col: 0,
        }
    }

    /// Tiles whose side shrinks as `tile_factor` grows
    pub fn with_factor(total_rows: usize, total_cols: usize, tile_factor: usize) -> Self {
        Self::new(total_rows, total_cols, tile_size_for_factor(tile_factor))
    }
}

/// Tile side for a tile factor (`0` is treated as `1`)
pub fn tile_size_for_factor(tile_factor: usize) -> usize {
    (BASE_TILE_SIZE / tile_factor.max(1)).max(MIN_TILE_SIZE)
}

impl Iterator for TileIterator {
    type Item = Tile;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_row >= self.total_rows || self.total_cols == 0 {
            return None;
        }

        let tile = Tile {
            row_offset: self.current_row,
            col_offset: self.current_col,
            rows: self.tile_size.min(self.total_rows - self.current_row),
            cols: self.tile_size.min(self.total_cols - self.current_col),
        };

        self.current_col += self.tile_size;
        if self.current_col >= self.total_cols {
            self.current_col = 0;
            self.current_row += self.tile_size;
        }

        Some(tile)
    }
}

/// Map-reduce over the tiles of a window.
///
/// Tiles are mapped concurrently according to `mode`; partial results are
/// merged sequentially in tile order so the outcome does not depend on
/// completion order.
pub struct TiledReducer {
    tile_factor: usize,
    mode: ProcessingMode,
}

impl TiledReducer {
    pub fn new(tile_factor: usize, mode: ProcessingMode) -> Self {
        Self { tile_factor, mode }
    }

    pub fn reduce<A, F, M>(&self, rows: usize, cols: usize, init: A, map: F, merge: M) -> A
    where
        A: Send,
        F: Fn(&Tile) -> A + Sync + Send,
        M: Fn(A, A) -> A,
    {
        let tiles: Vec<Tile> = TileIterator::with_factor(rows, cols, self.tile_factor).collect();
        tracing::trace!(tiles = tiles.len(), rows, cols, "reducing tiled window");
        self.mode
            .par_map_items(&tiles, |tile| map(tile))
            .into_iter()
            .fold(init, merge)
    }
}
