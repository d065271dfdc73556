//! Paired-view consistency loss over logits and intermediate feature levels.

use burn::prelude::*;
use data_contracts::PairGeometry;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::align::align_pair;
use crate::loss::{l1, mse, symmetric_kl, LabelCriterion, LabelLoss};
use crate::{LossSnapshot, ViewOutputs};

/// Which feature levels contribute auxiliary terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PgcMode {
    All,
    Level0,
    Level1,
    Level2,
}

impl PgcMode {
    /// CLI encoding: 1, 2, 3 select a single level, anything else selects all of them.
    pub fn from_index(mode: i32) -> Self {
        match mode {
            1 => PgcMode::Level0,
            2 => PgcMode::Level1,
            3 => PgcMode::Level2,
            _ => PgcMode::All,
        }
    }

    pub fn levels(&self) -> &'static [usize] {
        match self {
            PgcMode::All => &[0, 1, 2],
            PgcMode::Level0 => &[0],
            PgcMode::Level1 => &[1],
            PgcMode::Level2 => &[2],
        }
    }
}

#[derive(Config, Debug)]
pub struct PgcLossConfig {
    #[config(default = "PgcMode::All")]
    pub mode: PgcMode,
    #[config(default = 255)]
    pub ignore_index: i64,
    #[config(default = 1e-8)]
    pub epsilon: f32,
    /// Weight of the summed auxiliary feature MSE.
    #[config(default = 0.2)]
    pub alpha: f32,
    /// Weight of the symmetric cross-entropy between views.
    #[config(default = 0.9)]
    pub beta: f32,
    /// Supervised term applied to both views.
    #[config(default = "LabelLoss::CrossEntropy")]
    pub label_loss: LabelLoss,
}

impl PgcLossConfig {
    pub fn init(&self) -> PgcLoss {
        assert!(
            self.epsilon > 0.0 && self.epsilon < 1.0,
            "epsilon must be in (0, 1), got {}",
            self.epsilon
        );
        assert!(
            self.alpha >= 0.0 && self.beta >= 0.0,
            "loss weights must be non-negative (alpha={}, beta={})",
            self.alpha,
            self.beta
        );
        PgcLoss {
            mode: self.mode,
            epsilon: self.epsilon,
            alpha: self.alpha,
            beta: self.beta,
            label: LabelCriterion::new(self.ignore_index, self.label_loss),
            warned_missing: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgcLoss {
    pub mode: PgcMode,
    pub epsilon: f32,
    pub alpha: f32,
    pub beta: f32,
    pub label: LabelCriterion,
    /// Shared by clones of one loss; each `init()` starts unwarned.
    warned_missing: Arc<AtomicBool>,
}

#[derive(Debug, thiserror::Error)]
pub enum LossReadError {
    #[error("failed to read loss term `{term}`: {reason}")]
    Readback { term: &'static str, reason: String },
}

/// All terms of one forward pass; each is a single-element tensor.
#[derive(Debug, Clone)]
pub struct PgcTerms<B: Backend> {
    pub mse: Tensor<B, 1>,
    pub symmetric_ce: Tensor<B, 1>,
    /// One entry per active feature level, in level order.
    pub aux_mse: Vec<Tensor<B, 1>>,
    pub aux_ce: Vec<Tensor<B, 1>>,
    pub aux_l1: Tensor<B, 1>,
    pub ce: Tensor<B, 1>,
}

impl<B: Backend> PgcTerms<B> {
    /// Sum of the auxiliary feature MSE terms.
    pub fn pgc(&self) -> Tensor<B, 1> {
        let device = self.ce.device();
        self.aux_mse
            .iter()
            .cloned()
            .fold(Tensor::zeros([1], &device), |acc, t| acc + t)
    }

    /// `beta * symmetric_ce + ce + alpha * pgc`
    pub fn total(&self, alpha: f32, beta: f32) -> Tensor<B, 1> {
        self.symmetric_ce.clone().mul_scalar(beta) + self.ce.clone() + self.pgc().mul_scalar(alpha)
    }

    /// Host-side copy of every term for logging.
    pub fn snapshot(&self, alpha: f32, beta: f32) -> Result<LossSnapshot, LossReadError> {
        Ok(LossSnapshot {
            total: scalar("total", self.total(alpha, beta))?,
            mse: scalar("mse", self.mse.clone())?,
            symmetric_ce: scalar("symmetric_ce", self.symmetric_ce.clone())?,
            pgc: scalar("pgc", self.pgc())?,
            aux_l1: scalar("aux_l1", self.aux_l1.clone())?,
            ce: scalar("ce", self.ce.clone())?,
        })
    }
}

fn scalar<B: Backend>(term: &'static str, t: Tensor<B, 1>) -> Result<f32, LossReadError> {
    let values = t
        .detach()
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| LossReadError::Readback {
            term,
            reason: format!("{e:?}"),
        })?;
    match values.as_slice() {
        [value] => Ok(*value),
        other => Err(LossReadError::Readback {
            term,
            reason: format!("expected one value, found {}", other.len()),
        }),
    }
}

/// Running sum of per-sample contributions, averaged over the whole batch at the end.
struct BatchMean<B: Backend> {
    sum: Option<Tensor<B, 1>>,
}

impl<B: Backend> BatchMean<B> {
    fn new() -> Self {
        Self { sum: None }
    }

    fn add(&mut self, value: Tensor<B, 1>) {
        self.sum = Some(match self.sum.take() {
            Some(sum) => sum + value,
            None => value,
        });
    }

    fn finish(self, batch: usize, device: &B::Device) -> Tensor<B, 1> {
        match self.sum {
            Some(sum) => sum.div_scalar(batch.max(1) as f32),
            None => Tensor::zeros([1], device),
        }
    }
}

impl PgcLoss {
    pub fn total<B: Backend>(&self, terms: &PgcTerms<B>) -> Tensor<B, 1> {
        terms.total(self.alpha, self.beta)
    }

    /// Feature levels used for auxiliary terms given how many the network produced.
    pub fn active_levels(&self, available: usize) -> Vec<usize> {
        let wanted = self.mode.levels();
        let levels: Vec<usize> = wanted.iter().copied().filter(|l| *l < available).collect();
        if levels.len() < wanted.len() {
            self.warn_missing_levels(available);
        }
        levels
    }

    /// Logs the skipped levels once per loss instance; returns whether it logged.
    fn warn_missing_levels(&self, available: usize) -> bool {
        if self.warned_missing.swap(true, Ordering::Relaxed) {
            return false;
        }
        warn!(
            mode = ?self.mode,
            wanted = ?self.mode.levels(),
            available,
            "network returns fewer feature levels than requested; extra levels skipped"
        );
        true
    }

    /// Compute every term for a batch of view pairs.
    ///
    /// `geometry[i]` describes how sample `i` of `first` and `second` was cut from its
    /// source image. Samples whose crops do not overlap contribute zero to the
    /// consistency terms; they still count towards the batch mean.
    ///
    /// Panics if the views disagree on batch size, channel counts, or feature level count,
    /// or if `geometry` and `labels` do not match the batch.
    pub fn forward<B: Backend>(
        &self,
        first: &ViewOutputs<B>,
        second: &ViewOutputs<B>,
        geometry: &[PairGeometry],
        labels: [&Tensor<B, 3, Int>; 2],
    ) -> PgcTerms<B> {
        let [batch, classes, _, _] = first.logits.dims();
        let [second_batch, second_classes, _, _] = second.logits.dims();
        assert_eq!(
            batch, second_batch,
            "batch size mismatch between views: {batch} vs {second_batch}"
        );
        assert_eq!(
            classes, second_classes,
            "class count mismatch between views: {classes} vs {second_classes}"
        );
        assert_eq!(
            geometry.len(),
            batch,
            "expected one geometry per sample ({batch}), got {}",
            geometry.len()
        );
        assert_eq!(
            first.features.len(),
            second.features.len(),
            "feature level count mismatch between views"
        );

        let device = first.logits.device();
        let levels = self.active_levels(first.features.len());

        let mut mse_sum = BatchMean::new();
        let mut sym_sum = BatchMean::new();
        let mut aux_mse_sum: Vec<BatchMean<B>> = levels.iter().map(|_| BatchMean::new()).collect();
        let mut aux_ce_sum: Vec<BatchMean<B>> = levels.iter().map(|_| BatchMean::new()).collect();
        let mut l1_sum = BatchMean::new();

        for (sample, pair) in geometry.iter().enumerate() {
            let Some(overlap) = pair.overlap() else {
                debug!(sample, "views do not overlap; consistency terms are zero");
                continue;
            };

            if let Some((a, b)) = align_pair(&first.logits, &second.logits, sample, pair, &overlap) {
                mse_sum.add(mse(a.clone(), b.clone()));
                sym_sum.add(symmetric_kl(a, b, self.epsilon));
            }

            for (slot, &level) in levels.iter().enumerate() {
                let Some((a, b)) = align_pair(
                    &first.features[level],
                    &second.features[level],
                    sample,
                    pair,
                    &overlap,
                ) else {
                    continue;
                };
                aux_mse_sum[slot].add(mse(a.clone(), b.clone()));
                aux_ce_sum[slot].add(symmetric_kl(a.clone(), b.clone(), self.epsilon));
                l1_sum.add(l1(a, b).div_scalar(levels.len() as f32));
            }
        }

        let (sum_first, count_first) = self
            .label
            .sum_and_count(first.logits.clone(), labels[0].clone());
        let (sum_second, count_second) = self
            .label
            .sum_and_count(second.logits.clone(), labels[1].clone());
        let ce = (sum_first + sum_second) / (count_first + count_second).clamp_min(1.0);

        PgcTerms {
            mse: mse_sum.finish(batch, &device),
            symmetric_ce: sym_sum.finish(batch, &device),
            aux_mse: aux_mse_sum
                .into_iter()
                .map(|m| m.finish(batch, &device))
                .collect(),
            aux_ce: aux_ce_sum
                .into_iter()
                .map(|m| m.finish(batch, &device))
                .collect(),
            aux_l1: l1_sum.finish(batch, &device),
            ce,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_indices_follow_cli_encoding() {
        assert_eq!(PgcMode::from_index(0), PgcMode::All);
        assert_eq!(PgcMode::from_index(1).levels(), &[0]);
        assert_eq!(PgcMode::from_index(2).levels(), &[1]);
        assert_eq!(PgcMode::from_index(3).levels(), &[2]);
        assert_eq!(PgcMode::from_index(7).levels(), &[0, 1, 2]);
    }

    #[test]
    fn active_levels_drop_missing_maps() {
        let loss = PgcLossConfig::new().init();
        assert_eq!(loss.active_levels(3), vec![0, 1, 2]);
        assert_eq!(loss.active_levels(2), vec![0, 1]);
        let single = PgcLossConfig::new().with_mode(PgcMode::Level2).init();
        assert!(single.active_levels(2).is_empty());
    }

    #[test]
    fn missing_level_warning_is_per_instance() {
        let cfg = PgcLossConfig::new().with_mode(PgcMode::Level2);
        let first = cfg.init();
        let second = cfg.init();
        assert!(first.warn_missing_levels(1));
        assert!(!first.warn_missing_levels(1));
        assert!(!first.clone().warn_missing_levels(1));
        assert!(second.warn_missing_levels(1));
    }

    #[test]
    fn label_loss_defaults_to_cross_entropy_and_round_trips() {
        let cfg = PgcLossConfig::new();
        assert_eq!(cfg.label_loss, LabelLoss::CrossEntropy);
        let focal = cfg.with_label_loss(LabelLoss::Focal { gamma: 2.0 });
        let json = serde_json::to_string(&focal).unwrap();
        let back: PgcLossConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.label_loss, LabelLoss::Focal { gamma: 2.0 });
        assert_eq!(back.init().label.kind, LabelLoss::Focal { gamma: 2.0 });
    }

    #[test]
    fn snapshot_rejects_non_scalar_terms() {
        use burn_ndarray::NdArray;
        let device = Default::default();
        let err = scalar::<NdArray<f32>>("mse", Tensor::zeros([2], &device)).unwrap_err();
        assert!(err.to_string().contains("mse"));
        assert_eq!(scalar::<NdArray<f32>>("ce", Tensor::ones([1], &device)).unwrap(), 1.0);
    }
}
