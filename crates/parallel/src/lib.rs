//! # terratrend parallel
//!
//! Execution strategies for the pipeline's independent units of work.
//!
//! This crate provides:
//! - Processing modes: sequential, all cores, or a bounded worker pool
//! - Tiling of large pixel windows with ordered map-reduce
//!
//! Without the `parallel` feature every mode runs sequentially.

pub mod strategy;
pub mod tiled;

pub use strategy::{ParallelStrategy, ProcessingMode};
pub use tiled::{tile_size_for_factor, Tile, TileIterator, TiledReducer};
