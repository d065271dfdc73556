//! Consistency losses for two crops of the same image.
//!
//! A training pair is two views cut from one source image, each optionally mirrored.
//! The network runs on both views independently; this crate maps their overlap onto
//! every output map, compares the aligned cells, and adds the supervised label term:
//! - `align`: overlap → output-map regions, un-flipping, resolution normalisation.
//! - `loss`: MSE, L1, symmetric KL, and ignore-aware label cross-entropy or focal loss.
//! - `pgc`: the combined per-batch engine and its configuration.

pub mod align;
pub mod loss;
pub mod pgc;

use burn::tensor::{backend::Backend, Tensor};
use serde::{Deserialize, Serialize};

pub use align::{align_pair, extract, resize_nearest, AlignedRegion};
pub use loss::{l1, mse, symmetric_kl, LabelCriterion, LabelLoss};
pub use pgc::{LossReadError, PgcLoss, PgcLossConfig, PgcMode, PgcTerms};

/// Network outputs for one view.
#[derive(Debug, Clone)]
pub struct ViewOutputs<B: Backend> {
    /// Intermediate embedding maps `[N, C_l, H_l, W_l]`, shallow to deep.
    pub features: Vec<Tensor<B, 4>>,
    /// Segmentation logits `[N, classes, H, W]`.
    pub logits: Tensor<B, 4>,
}

impl<B: Backend> ViewOutputs<B> {
    pub fn new(features: Vec<Tensor<B, 4>>, logits: Tensor<B, 4>) -> Self {
        Self { features, logits }
    }
}

/// Detached loss values of one step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LossSnapshot {
    pub total: f32,
    pub mse: f32,
    pub symmetric_ce: f32,
    pub pgc: f32,
    pub aux_l1: f32,
    pub ce: f32,
}
