//! Paired-crop sampling: random scale, pad, two overlapping crops, independent flips.

use crate::types::{PairResult, ViewPair, ViewSample, IGNORE_INDEX};
use data_contracts::{CropRect, PairGeometry, ViewGeometry};
use image::imageops::FilterType;
use image::{GrayImage, Luma, Rgb, RgbImage};
use rand::{Rng, SeedableRng};
use std::cmp::max;

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

#[derive(Debug, Clone)]
pub struct PairSamplerConfig {
    /// Crop (width, height) of each view.
    pub crop_size: (u32, u32),
    /// Range of the random rescale applied to the source before cropping.
    pub scale_min: f32,
    pub scale_max: f32,
    /// Probability of mirroring each view, drawn independently per view.
    pub flip_prob: f32,
    /// Max offset of the second crop relative to the first, as a fraction of the crop size.
    pub max_shift: f32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    /// Seed for reproducible sampling (mixed with the sample id).
    pub seed: Option<u64>,
    /// Validation views are resized (short side to the crop) and centre-cropped instead of
    /// kept at native resolution.
    pub crop_val: bool,
}

impl Default for PairSamplerConfig {
    fn default() -> Self {
        Self {
            crop_size: (513, 513),
            scale_min: 0.5,
            scale_max: 2.0,
            flip_prob: 0.5,
            max_shift: 0.5,
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
            seed: None,
            crop_val: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PairSampler {
    cfg: PairSamplerConfig,
}

impl PairSampler {
    pub fn new(cfg: PairSamplerConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &PairSamplerConfig {
        &self.cfg
    }

    pub fn describe(&self) -> String {
        format!(
            "crop={}x{} scale=[{:.2},{:.2}] flip_p={:.2} max_shift={:.2} crop_val={} seed={}",
            self.cfg.crop_size.0,
            self.cfg.crop_size.1,
            self.cfg.scale_min,
            self.cfg.scale_max,
            self.cfg.flip_prob,
            self.cfg.max_shift,
            self.cfg.crop_val,
            self.cfg
                .seed
                .map(|s| s.to_string())
                .unwrap_or_else(|| "none".to_string())
        )
    }

    /// Cut two views from `img`/`label`. `sample_id` keys the seeded RNG, so the same id
    /// and seed always give the same pair.
    pub fn sample(&self, img: &RgbImage, label: &GrayImage, sample_id: u64) -> PairResult<ViewPair> {
        let mut rng_local;
        let mut seeded_rng;
        let rng: &mut dyn rand::RngCore = if let Some(seed) = self.cfg.seed {
            seeded_rng = rand::rngs::StdRng::seed_from_u64(seed ^ sample_id);
            &mut seeded_rng
        } else {
            rng_local = rand::rng();
            &mut rng_local
        };

        let (img, label) = random_scale(img, label, self.cfg.scale_min, self.cfg.scale_max, rng);
        let (crop_w, crop_h) = (max(1, self.cfg.crop_size.0), max(1, self.cfg.crop_size.1));
        let (img, label) = pad_to(&img, &label, crop_w, crop_h);
        let (src_w, src_h) = img.dimensions();

        let x1 = rng.random_range(0..=src_w - crop_w);
        let y1 = rng.random_range(0..=src_h - crop_h);
        let x2 = shifted(x1, crop_w, src_w - crop_w, self.cfg.max_shift, rng);
        let y2 = shifted(y1, crop_h, src_h - crop_h, self.cfg.max_shift, rng);

        let geometry = PairGeometry::new(
            ViewGeometry::new(
                CropRect::new(x1, y1, crop_w, crop_h),
                flip_coin(self.cfg.flip_prob, rng),
            ),
            ViewGeometry::new(
                CropRect::new(x2, y2, crop_w, crop_h),
                flip_coin(self.cfg.flip_prob, rng),
            ),
        );
        geometry.validate(src_w, src_h)?;

        Ok(ViewPair {
            sample_id,
            first: self.cut_view(&img, &label, &geometry.first),
            second: self.cut_view(&img, &label, &geometry.second),
            geometry,
            source_size: (src_w, src_h),
        })
    }

    /// Unaugmented validation view: the whole image, or a centre crop when `crop_val` is set.
    pub fn eval_view(&self, img: &RgbImage, label: &GrayImage) -> ViewSample {
        if !self.cfg.crop_val {
            return to_view_sample(img, label, &self.cfg.mean, &self.cfg.std);
        }
        let (crop_w, crop_h) = (max(1, self.cfg.crop_size.0), max(1, self.cfg.crop_size.1));
        let (img, label) = resize_short_side(img, label, crop_w.min(crop_h));
        let (img, label) = pad_to(&img, &label, crop_w, crop_h);
        let (w, h) = img.dimensions();
        let (x, y) = ((w - crop_w) / 2, (h - crop_h) / 2);
        let img = image::imageops::crop_imm(&img, x, y, crop_w, crop_h).to_image();
        let label = image::imageops::crop_imm(&label, x, y, crop_w, crop_h).to_image();
        to_view_sample(&img, &label, &self.cfg.mean, &self.cfg.std)
    }

    fn cut_view(&self, img: &RgbImage, label: &GrayImage, view: &ViewGeometry) -> ViewSample {
        let CropRect {
            x,
            y,
            width,
            height,
        } = view.crop;
        let mut img = image::imageops::crop_imm(img, x, y, width, height).to_image();
        let mut label = image::imageops::crop_imm(label, x, y, width, height).to_image();
        if view.flipped {
            image::imageops::flip_horizontal_in_place(&mut img);
            image::imageops::flip_horizontal_in_place(&mut label);
        }
        to_view_sample(&img, &label, &self.cfg.mean, &self.cfg.std)
    }
}

#[derive(Debug, Clone)]
pub struct PairSamplerBuilder {
    inner: PairSamplerConfig,
}

impl Default for PairSamplerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PairSamplerBuilder {
    pub fn new() -> Self {
        Self {
            inner: PairSamplerConfig::default(),
        }
    }
    pub fn crop_size(mut self, width: u32, height: u32) -> Self {
        self.inner.crop_size = (width, height);
        self
    }
    pub fn scale_range(mut self, min: f32, max: f32) -> Self {
        self.inner.scale_min = min;
        self.inner.scale_max = max;
        self
    }
    pub fn flip_prob(mut self, p: f32) -> Self {
        self.inner.flip_prob = p;
        self
    }
    pub fn max_shift(mut self, fraction: f32) -> Self {
        self.inner.max_shift = fraction;
        self
    }
    pub fn normalization(mut self, mean: [f32; 3], std: [f32; 3]) -> Self {
        self.inner.mean = mean;
        self.inner.std = std;
        self
    }
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.inner.seed = seed;
        self
    }
    pub fn crop_val(mut self, enabled: bool) -> Self {
        self.inner.crop_val = enabled;
        self
    }
    pub fn build(self) -> PairSampler {
        PairSampler::new(self.inner)
    }
}

fn flip_coin(prob: f32, rng: &mut dyn rand::RngCore) -> bool {
    prob > 0.0 && rng.random_range(0.0..1.0) < prob
}

fn shifted(start: u32, crop: u32, limit: u32, fraction: f32, rng: &mut dyn rand::RngCore) -> u32 {
    let reach = ((crop as f32 * fraction.max(0.0)).round() as i64).min(limit as i64);
    let offset = rng.random_range(-reach..=reach);
    (start as i64 + offset).clamp(0, limit as i64) as u32
}

fn random_scale(
    img: &RgbImage,
    label: &GrayImage,
    min_scale: f32,
    max_scale: f32,
    rng: &mut dyn rand::RngCore,
) -> (RgbImage, GrayImage) {
    let scale = if max_scale > min_scale {
        rng.random_range(min_scale..max_scale)
    } else {
        min_scale
    };
    if scale <= 0.0 || (scale - 1.0).abs() < f32::EPSILON {
        return (img.clone(), label.clone());
    }
    let (w, h) = img.dimensions();
    let new_w = max(1, (w as f32 * scale).round() as u32);
    let new_h = max(1, (h as f32 * scale).round() as u32);
    (
        image::imageops::resize(img, new_w, new_h, FilterType::Triangle),
        // Class ids must never be blended.
        image::imageops::resize(label, new_w, new_h, FilterType::Nearest),
    )
}

/// Scale so the shorter side equals `target`, keeping the aspect ratio.
fn resize_short_side(img: &RgbImage, label: &GrayImage, target: u32) -> (RgbImage, GrayImage) {
    let (w, h) = img.dimensions();
    let short = w.min(h).max(1);
    if short == target {
        return (img.clone(), label.clone());
    }
    let (new_w, new_h) = if w <= h {
        (target, max(1, (h as u64 * target as u64 / short as u64) as u32))
    } else {
        (max(1, (w as u64 * target as u64 / short as u64) as u32), target)
    };
    (
        image::imageops::resize(img, new_w, new_h, FilterType::Triangle),
        image::imageops::resize(label, new_w, new_h, FilterType::Nearest),
    )
}

/// Pad right/bottom so both sides reach the crop size; labels pad with the ignore id.
fn pad_to(img: &RgbImage, label: &GrayImage, min_w: u32, min_h: u32) -> (RgbImage, GrayImage) {
    let (w, h) = img.dimensions();
    if w >= min_w && h >= min_h {
        return (img.clone(), label.clone());
    }
    let (pw, ph) = (max(w, min_w), max(h, min_h));
    let mut img_canvas = RgbImage::from_pixel(pw, ph, Rgb([0, 0, 0]));
    let mut label_canvas = GrayImage::from_pixel(pw, ph, Luma([IGNORE_INDEX]));
    image::imageops::replace(&mut img_canvas, img, 0, 0);
    image::imageops::replace(&mut label_canvas, label, 0, 0);
    (img_canvas, label_canvas)
}

pub(crate) fn to_view_sample(
    img: &RgbImage,
    label: &GrayImage,
    mean: &[f32; 3],
    std: &[f32; 3],
) -> ViewSample {
    let (width, height) = img.dimensions();
    let plane = (width * height) as usize;
    let mut image_chw = vec![0.0f32; plane * 3];
    for (x, y, pixel) in img.enumerate_pixels() {
        let base = (y * width + x) as usize;
        for c in 0..3 {
            image_chw[c * plane + base] = (pixel[c] as f32 / 255.0 - mean[c]) / std[c];
        }
    }
    let label = label.as_raw().iter().map(|&v| v as i64).collect();
    ViewSample {
        image_chw,
        label,
        width,
        height,
    }
}
