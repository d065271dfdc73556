//! Primitive loss terms over aligned maps.

use burn::{
    prelude::*,
    tensor::activation::{log_softmax, softmax},
};

use serde::{Deserialize, Serialize};

use crate::align::resize_nearest;

/// Mean squared difference between two aligned maps.
pub fn mse<B: Backend>(a: Tensor<B, 4>, b: Tensor<B, 4>) -> Tensor<B, 1> {
    assert_eq!(a.dims(), b.dims(), "mse operands must share a shape");
    let diff = a - b;
    (diff.clone() * diff).mean()
}

/// Mean absolute difference between two aligned maps.
pub fn l1<B: Backend>(a: Tensor<B, 4>, b: Tensor<B, 4>) -> Tensor<B, 1> {
    assert_eq!(a.dims(), b.dims(), "l1 operands must share a shape");
    (a - b).abs().mean()
}

/// KL(p_a‖p_b) + KL(p_b‖p_a) of the channel softmax, averaged over pixels.
///
/// Probabilities are clamped to `[epsilon, 1]` before the log.
pub fn symmetric_kl<B: Backend>(a: Tensor<B, 4>, b: Tensor<B, 4>, epsilon: f32) -> Tensor<B, 1> {
    assert_eq!(a.dims(), b.dims(), "symmetric_kl operands must share a shape");
    let [batch, _, height, width] = a.dims();
    let pa = softmax(a, 1).clamp(epsilon, 1.0);
    let pb = softmax(b, 1).clamp(epsilon, 1.0);
    let log_ratio = pa.clone().log() - pb.clone().log();
    ((pa - pb) * log_ratio)
        .sum()
        .div_scalar((batch * height * width) as f32)
}

/// Supervised per-pixel objective.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LabelLoss {
    CrossEntropy,
    /// `(1 - p)^gamma * -ln p`, where `p` is the probability of the labelled class.
    Focal { gamma: f32 },
}

/// Pixel-wise label loss against class labels, skipping `ignore_index`.
#[derive(Debug, Clone, Copy)]
pub struct LabelCriterion {
    pub ignore_index: i64,
    pub kind: LabelLoss,
}

impl Default for LabelCriterion {
    fn default() -> Self {
        Self::cross_entropy(255)
    }
}

impl LabelCriterion {
    pub fn new(ignore_index: i64, kind: LabelLoss) -> Self {
        if let LabelLoss::Focal { gamma } = kind {
            assert!(gamma >= 0.0, "focal gamma must be non-negative, got {gamma}");
        }
        Self { ignore_index, kind }
    }

    pub fn cross_entropy(ignore_index: i64) -> Self {
        Self::new(ignore_index, LabelLoss::CrossEntropy)
    }

    pub fn focal(ignore_index: i64, gamma: f32) -> Self {
        Self::new(ignore_index, LabelLoss::Focal { gamma })
    }

    /// Mean over non-ignored pixels; exactly zero when every pixel is ignored.
    ///
    /// # Shapes
    ///
    /// - logits: `[batch, classes, h, w]` (resized to the label grid when it differs)
    /// - labels: `[batch, height, width]`
    pub fn forward<B: Backend>(&self, logits: Tensor<B, 4>, labels: Tensor<B, 3, Int>) -> Tensor<B, 1> {
        let (sum, count) = self.sum_and_count(logits, labels);
        sum / count.clamp_min(1.0)
    }

    /// Summed per-pixel loss and the number of pixels it covers.
    pub fn sum_and_count<B: Backend>(
        &self,
        logits: Tensor<B, 4>,
        labels: Tensor<B, 3, Int>,
    ) -> (Tensor<B, 1>, Tensor<B, 1>) {
        let [batch, classes, _, _] = logits.dims();
        let [label_batch, height, width] = labels.dims();
        assert_eq!(
            batch, label_batch,
            "batch size mismatch: logits ({batch}) vs labels ({label_batch})"
        );

        let logits = resize_nearest(logits, [height, width]);
        let pixels = batch * height * width;
        // [N, K, H, W] -> [N, H, W, K] -> [N*H*W, K]
        let log_probs = log_softmax(logits, 1)
            .swap_dims(1, 2)
            .swap_dims(2, 3)
            .reshape([pixels, classes]);

        let targets = labels.reshape([pixels]);
        let ignored = targets.clone().equal_elem(self.ignore_index);
        let safe_targets = targets.mask_fill(ignored.clone(), 0);

        let picked = log_probs
            .gather(1, safe_targets.reshape([pixels, 1]))
            .reshape([pixels]);
        let per_pixel = match self.kind {
            LabelLoss::CrossEntropy => picked.neg(),
            LabelLoss::Focal { gamma } => {
                let weight = picked
                    .clone()
                    .exp()
                    .neg()
                    .add_scalar(1.0)
                    .clamp_min(0.0)
                    .powf_scalar(gamma);
                weight * picked.neg()
            }
        };
        let per_pixel = per_pixel.mask_fill(ignored.clone(), 0.0);
        let count = ignored.bool_not().float().sum();
        (per_pixel.sum(), count)
    }
}
