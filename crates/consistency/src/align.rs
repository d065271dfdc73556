//! Mapping the overlap of two crops onto each view's output maps.
//!
//! Output maps can be smaller than the crop they were computed from (encoder stride), and
//! the two views of a pair may come back at different resolutions. Regions are located in
//! the unflipped map frame first and mirrored afterwards, so a flipped view selects exactly
//! the mirrored cells of its unflipped twin.

use burn::tensor::{backend::Backend, Int, Tensor, TensorData};
use data_contracts::{CropRect, PairGeometry, ViewGeometry};

/// Cell span of the overlap inside one view's output map, `[y0, y1) x [x0, x1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignedRegion {
    pub y0: usize,
    pub y1: usize,
    pub x0: usize,
    pub x1: usize,
    /// Cells must be mirrored back to source orientation after slicing.
    pub flipped: bool,
}

impl AlignedRegion {
    /// Returns `None` if the overlap is not inside the view's crop or the map is empty.
    pub fn locate(
        view: &ViewGeometry,
        overlap: &CropRect,
        map_height: usize,
        map_width: usize,
    ) -> Option<Self> {
        if map_height == 0 || map_width == 0 || view.crop.is_empty() || overlap.is_empty() {
            return None;
        }
        let local = view.crop_local(overlap).ok()?;
        let sx = map_width as f64 / view.crop.width as f64;
        let sy = map_height as f64 / view.crop.height as f64;
        let (x0, x1) = scale_span(local.x, local.width, sx, map_width);
        let (y0, y1) = scale_span(local.y, local.height, sy, map_height);
        let (x0, x1) = if view.flipped {
            (map_width - x1, map_width - x0)
        } else {
            (x0, x1)
        };
        Some(Self {
            y0,
            y1,
            x0,
            x1,
            flipped: view.flipped,
        })
    }

    pub fn height(&self) -> usize {
        self.y1 - self.y0
    }

    pub fn width(&self) -> usize {
        self.x1 - self.x0
    }
}

// floor(start), ceil(end), clamped to the map and never empty.
fn scale_span(start: u32, len: u32, scale: f64, limit: usize) -> (usize, usize) {
    let lo = ((start as f64 * scale).floor() as usize).min(limit - 1);
    let hi = (((start as u64 + len as u64) as f64 * scale).ceil() as usize).clamp(lo + 1, limit);
    (lo, hi)
}

/// Slice one sample's region out of `map` (`[N, C, H, W]`) as `[1, C, h, w]` in source orientation.
pub fn extract<B: Backend>(map: Tensor<B, 4>, sample: usize, region: &AlignedRegion) -> Tensor<B, 4> {
    let [batch, channels, height, width] = map.dims();
    assert!(
        sample < batch,
        "sample index {sample} out of range for batch of {batch}"
    );
    assert!(
        region.y1 <= height && region.x1 <= width,
        "region {region:?} exceeds map {height}x{width}"
    );
    let patch = map.slice([
        sample..sample + 1,
        0..channels,
        region.y0..region.y1,
        region.x0..region.x1,
    ]);
    if region.flipped {
        patch.flip([3])
    } else {
        patch
    }
}

/// Nearest-neighbour resize of the two spatial axes, built from index selects so it
/// differentiates on every backend.
pub fn resize_nearest<B: Backend>(map: Tensor<B, 4>, size: [usize; 2]) -> Tensor<B, 4> {
    let [_, _, height, width] = map.dims();
    if [height, width] == size {
        return map;
    }
    assert!(
        size[0] > 0 && size[1] > 0,
        "cannot resize to empty size {size:?}"
    );
    let device = map.device();
    let rows = Tensor::<B, 1, Int>::from_data(
        TensorData::new(nearest_indices(height, size[0]), [size[0]]),
        &device,
    );
    let cols = Tensor::<B, 1, Int>::from_data(
        TensorData::new(nearest_indices(width, size[1]), [size[1]]),
        &device,
    );
    map.select(2, rows).select(3, cols)
}

fn nearest_indices(src: usize, dst: usize) -> Vec<i64> {
    let scale = src as f64 / dst as f64;
    (0..dst)
        .map(|i| (((i as f64 + 0.5) * scale).floor() as i64).min(src as i64 - 1))
        .collect()
}

/// Align one sample of two paired maps to a common `[1, C, h, w]` grid over `overlap`.
///
/// Panics if batch or channel counts differ between the views.
pub fn align_pair<B: Backend>(
    first: &Tensor<B, 4>,
    second: &Tensor<B, 4>,
    sample: usize,
    geometry: &PairGeometry,
    overlap: &CropRect,
) -> Option<(Tensor<B, 4>, Tensor<B, 4>)> {
    let [b1, c1, h1, w1] = first.dims();
    let [b2, c2, h2, w2] = second.dims();
    assert_eq!(b1, b2, "batch mismatch between views: {b1} vs {b2}");
    assert_eq!(c1, c2, "channel mismatch between views: {c1} vs {c2}");

    let r1 = AlignedRegion::locate(&geometry.first, overlap, h1, w1)?;
    let r2 = AlignedRegion::locate(&geometry.second, overlap, h2, w2)?;
    let a = extract(first.clone(), sample, &r1);
    let b = extract(second.clone(), sample, &r2);
    let common = [r1.height().min(r2.height()), r1.width().min(r2.width())];
    Some((resize_nearest(a, common), resize_nearest(b, common)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    fn ramp(h: usize, w: usize) -> Tensor<B, 4> {
        let values: Vec<f32> = (0..h * w).map(|v| v as f32).collect();
        Tensor::<B, 1>::from_floats(values.as_slice(), &Default::default()).reshape([1, 1, h, w])
    }

    #[test]
    fn locate_scales_to_output_stride() {
        let view = ViewGeometry::new(CropRect::new(0, 0, 16, 16), false);
        let overlap = CropRect::new(4, 8, 8, 8);
        let region = AlignedRegion::locate(&view, &overlap, 4, 4).unwrap();
        assert_eq!((region.y0, region.y1, region.x0, region.x1), (2, 4, 1, 3));
    }

    #[test]
    fn locate_mirrors_flipped_views() {
        let plain = ViewGeometry::new(CropRect::new(0, 0, 8, 8), false);
        let flipped = ViewGeometry::new(CropRect::new(0, 0, 8, 8), true);
        let overlap = CropRect::new(0, 0, 3, 8);
        let a = AlignedRegion::locate(&plain, &overlap, 8, 8).unwrap();
        let b = AlignedRegion::locate(&flipped, &overlap, 8, 8).unwrap();
        assert_eq!((a.x0, a.x1), (0, 3));
        assert_eq!((b.x0, b.x1), (5, 8));
    }

    #[test]
    fn tiny_overlap_keeps_one_cell() {
        let view = ViewGeometry::new(CropRect::new(0, 0, 64, 64), false);
        let overlap = CropRect::new(63, 63, 1, 1);
        let region = AlignedRegion::locate(&view, &overlap, 4, 4).unwrap();
        assert_eq!((region.height(), region.width()), (1, 1));
        assert_eq!((region.y0, region.x0), (3, 3));
    }

    #[test]
    fn extract_unflips_patch() {
        let map = ramp(2, 4);
        let flipped_map = map.clone().flip([3]);
        let region = AlignedRegion {
            y0: 0,
            y1: 2,
            x0: 1,
            x1: 3,
            flipped: true,
        };
        let mirrored_region = AlignedRegion {
            flipped: false,
            ..region
        };
        let a = extract(flipped_map, 0, &region);
        // Cells 1..3 of the flipped map are cells 1..3 of the unflipped map, reversed.
        let b = extract(map, 0, &mirrored_region);
        let a: Vec<f32> = a.into_data().to_vec().unwrap();
        let b: Vec<f32> = b.into_data().to_vec().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn resize_nearest_picks_centres() {
        let map = ramp(1, 4);
        let out = resize_nearest(map, [1, 2]);
        let values: Vec<f32> = out.into_data().to_vec().unwrap();
        assert_eq!(values, vec![1.0, 3.0]);
    }
}
