//! Shared data contracts for paired views: crop rectangles, flips, and their overlap.

pub mod geometry;

pub use geometry::{CropRect, GeometryError, PairGeometry, ViewGeometry};
