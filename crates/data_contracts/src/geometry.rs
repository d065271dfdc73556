use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Axis-aligned pixel rectangle in the shared source frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GeometryError {
    #[error("crop has zero area: {0:?}")]
    EmptyCrop(CropRect),
    #[error("crop {crop:?} exceeds source bounds {width}x{height}")]
    OutOfBounds {
        crop: CropRect,
        width: u32,
        height: u32,
    },
    #[error("region {region:?} is not inside crop {crop:?}")]
    RegionOutsideCrop { region: CropRect, crop: CropRect },
}

impl CropRect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.width)
    }

    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.height)
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Intersection of two rectangles; `None` when the shared area is zero.
    pub fn intersect(&self, other: &CropRect) -> Option<CropRect> {
        if self.is_empty() || other.is_empty() {
            return None;
        }
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(CropRect::new(x0, y0, x1 - x0, y1 - y0))
    }

    pub fn contains(&self, other: &CropRect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }
}

/// One view of a pair: where it was cut from the source and whether it was mirrored afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewGeometry {
    pub crop: CropRect,
    /// Horizontal flip applied after cropping.
    pub flipped: bool,
}

impl ViewGeometry {
    pub const fn new(crop: CropRect, flipped: bool) -> Self {
        Self { crop, flipped }
    }

    /// `region` (source coordinates) relative to the crop origin, ignoring the flip.
    pub fn crop_local(&self, region: &CropRect) -> Result<CropRect, GeometryError> {
        if !self.crop.contains(region) {
            return Err(GeometryError::RegionOutsideCrop {
                region: *region,
                crop: self.crop,
            });
        }
        Ok(CropRect::new(
            region.x - self.crop.x,
            region.y - self.crop.y,
            region.width,
            region.height,
        ))
    }

    /// `region` (source coordinates) in the view's pixel frame, mirrored when the view is flipped.
    pub fn local_region(&self, region: &CropRect) -> Result<CropRect, GeometryError> {
        let mut local = self.crop_local(region)?;
        if self.flipped {
            local.x = self.crop.width - local.x - local.width;
        }
        Ok(local)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairGeometry {
    pub first: ViewGeometry,
    pub second: ViewGeometry,
}

impl PairGeometry {
    pub const fn new(first: ViewGeometry, second: ViewGeometry) -> Self {
        Self { first, second }
    }

    /// Shared source area of both crops. Degenerate crops never overlap.
    pub fn overlap(&self) -> Option<CropRect> {
        self.first.crop.intersect(&self.second.crop)
    }

    pub fn flips(&self) -> (bool, bool) {
        (self.first.flipped, self.second.flipped)
    }

    pub fn validate(&self, source_width: u32, source_height: u32) -> Result<(), GeometryError> {
        let bounds = CropRect::new(0, 0, source_width, source_height);
        for view in [&self.first, &self.second] {
            if view.crop.is_empty() {
                return Err(GeometryError::EmptyCrop(view.crop));
            }
            if !bounds.contains(&view.crop) {
                return Err(GeometryError::OutOfBounds {
                    crop: view.crop,
                    width: source_width,
                    height: source_height,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intersect_partial() {
        let a = CropRect::new(0, 0, 10, 10);
        let b = CropRect::new(4, 6, 10, 10);
        assert_eq!(a.intersect(&b), Some(CropRect::new(4, 6, 6, 4)));
        assert_eq!(b.intersect(&a), a.intersect(&b));
    }

    #[test]
    fn touching_edges_do_not_overlap() {
        let a = CropRect::new(0, 0, 10, 10);
        let b = CropRect::new(10, 0, 10, 10);
        assert_eq!(a.intersect(&b), None);
    }

    #[test]
    fn flipped_local_region_is_mirrored() {
        let view = ViewGeometry::new(CropRect::new(10, 0, 8, 8), true);
        let region = CropRect::new(12, 2, 3, 4);
        let local = view.local_region(&region).unwrap();
        // unflipped x = 2, mirrored = 8 - 2 - 3
        assert_eq!(local, CropRect::new(3, 2, 3, 4));
    }
}
