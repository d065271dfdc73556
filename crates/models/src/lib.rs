//! Burn segmentation networks for paired-view training.
//!
//! `SegNet` is a compact DeepLab-style encoder/decoder:
//! - a strided convolutional encoder (stride 2, 4, 8),
//! - an atrous pyramid over the deepest map (dilations 1, 2, 4) fused by a 1x1 projection,
//! - a decoder that upsamples the pyramid to stride 4 and mixes in the low-level map.
//!
//! `forward` returns the intermediate maps alongside the logits so the consistency loss can
//! align every level. Logits stay at stride 4; callers resize them to label resolution.

use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::PaddingConfig2d;
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use consistency::{resize_nearest, ViewOutputs};

#[derive(Debug, Clone)]
pub struct SegNetConfig {
    pub num_classes: usize,
    pub in_channels: usize,
    /// Channel widths of the three encoder stages.
    pub widths: [usize; 3],
    pub aspp_channels: usize,
    pub dilations: [usize; 3],
    pub low_level_channels: usize,
}

impl Default for SegNetConfig {
    fn default() -> Self {
        Self {
            num_classes: 21,
            in_channels: 3,
            widths: [16, 32, 64],
            aspp_channels: 64,
            dilations: [1, 2, 4],
            low_level_channels: 16,
        }
    }
}

impl SegNetConfig {
    pub fn with_num_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = num_classes;
        self
    }
}

fn conv3x3<B: Backend>(
    channels: [usize; 2],
    stride: usize,
    dilation: usize,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new(channels, [3, 3])
        .with_stride([stride, stride])
        .with_dilation([dilation, dilation])
        .with_padding(PaddingConfig2d::Explicit(dilation, dilation))
        .init(device)
}

fn conv1x1<B: Backend>(channels: [usize; 2], device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new(channels, [1, 1]).init(device)
}

#[derive(Debug, Module)]
pub struct SegNet<B: Backend> {
    stem: Conv2d<B>,
    stage1: Conv2d<B>,
    stage2: Conv2d<B>,
    aspp: Vec<Conv2d<B>>,
    aspp_project: Conv2d<B>,
    low_level: Conv2d<B>,
    fuse: Conv2d<B>,
    classifier: Conv2d<B>,
    num_classes: usize,
}

impl<B: Backend> SegNet<B> {
    pub fn new(cfg: SegNetConfig, device: &B::Device) -> Self {
        let [w0, w1, w2] = cfg.widths;
        let stem = conv3x3([cfg.in_channels, w0], 2, 1, device);
        let stage1 = conv3x3([w0, w1], 2, 1, device);
        let stage2 = conv3x3([w1, w2], 2, 1, device);
        let aspp = cfg
            .dilations
            .iter()
            .map(|&d| conv3x3([w2, cfg.aspp_channels], 1, d, device))
            .collect::<Vec<_>>();
        let aspp_project = conv1x1([cfg.aspp_channels * aspp.len(), cfg.aspp_channels], device);
        let low_level = conv1x1([w1, cfg.low_level_channels], device);
        let fuse = conv3x3(
            [cfg.aspp_channels + cfg.low_level_channels, cfg.aspp_channels],
            1,
            1,
            device,
        );
        let classifier = conv1x1([cfg.aspp_channels, cfg.num_classes.max(1)], device);
        Self {
            stem,
            stage1,
            stage2,
            aspp,
            aspp_project,
            low_level,
            fuse,
            classifier,
            num_classes: cfg.num_classes.max(1),
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Features: `[stage1 (stride 4), stage2 (stride 8), pyramid (stride 8)]`; logits at stride 4.
    pub fn forward(&self, images: Tensor<B, 4>) -> ViewOutputs<B> {
        let x = relu(self.stem.forward(images));
        let low = relu(self.stage1.forward(x));
        let deep = relu(self.stage2.forward(low.clone()));

        let branches = self
            .aspp
            .iter()
            .map(|conv| relu(conv.forward(deep.clone())))
            .collect::<Vec<_>>();
        let pyramid = relu(self.aspp_project.forward(Tensor::cat(branches, 1)));

        let [_, _, low_h, low_w] = low.dims();
        let up = resize_nearest(pyramid.clone(), [low_h, low_w]);
        let skip = relu(self.low_level.forward(low.clone()));
        let fused = relu(self.fuse.forward(Tensor::cat(vec![up, skip], 1)));
        let logits = self.classifier.forward(fused);

        ViewOutputs::new(vec![low, deep, pyramid], logits)
    }

    /// Logits resized to `size` (nearest), for evaluation against full-resolution labels.
    pub fn predict(&self, images: Tensor<B, 4>, size: [usize; 2]) -> Tensor<B, 4> {
        resize_nearest(self.forward(images).logits, size)
    }
}

pub mod prelude {
    pub use super::{SegNet, SegNetConfig};
}
