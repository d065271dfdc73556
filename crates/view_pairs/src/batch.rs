//! Batch iteration for paired-view training and full-image validation.

use crate::aug::PairSampler;
use crate::index::{index_dataset, load_sample, split_dataset};
use crate::types::{PairDatasetError, PairResult, SampleIndex, SplitSummary, ViewPair, ViewSample};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};
use data_contracts::PairGeometry;
use rand::{seq::SliceRandom, SeedableRng};
use rayon::prelude::*;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub(crate) const DEFAULT_LOG_EVERY_SAMPLES: usize = 1000;

/// One side of a paired batch.
pub struct ViewBatch<B: Backend> {
    /// `[N, 3, H, W]`, normalized.
    pub images: Tensor<B, 4>,
    /// `[N, H, W]` class ids.
    pub labels: Tensor<B, 3, Int>,
}

pub struct PairBatch<B: Backend> {
    pub first: ViewBatch<B>,
    pub second: ViewBatch<B>,
    /// Per-sample crop geometry, in batch order.
    pub geometry: Vec<PairGeometry>,
    pub sample_ids: Vec<u64>,
}

impl<B: Backend> PairBatch<B> {
    pub fn len(&self) -> usize {
        self.geometry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.geometry.is_empty()
    }
}

/// Validation images, in iteration order.
pub struct EvalBatch<B: Backend> {
    pub stems: Vec<String>,
    pub images: Tensor<B, 4>,
    pub labels: Tensor<B, 3, Int>,
}

#[derive(Debug, Clone)]
pub struct PairIterConfig {
    pub shuffle: bool,
    pub drop_last: bool,
    /// Seeds the shuffle order. The sampler carries its own seed.
    pub seed: Option<u64>,
}

impl Default for PairIterConfig {
    fn default() -> Self {
        Self {
            shuffle: true,
            drop_last: true,
            seed: None,
        }
    }
}

/// Index `root`, split it, and build the training pair iterator plus the validation iterator.
pub fn build_pair_iters(
    root: &Path,
    val_ratio: f32,
    sampler: PairSampler,
    cfg: PairIterConfig,
) -> PairResult<(PairBatchIter, EvalIter, SplitSummary)> {
    let indices = index_dataset(root)?;
    let (train_idx, val_idx, summary) = split_dataset(root, indices, val_ratio)?;
    let eval_sampler = sampler.clone();
    let train = PairBatchIter::from_indices(train_idx, sampler, cfg)?;
    let val = EvalIter::new(val_idx, eval_sampler);
    Ok((train, val, summary))
}

fn env_log_every() -> Option<usize> {
    match std::env::var("VIEW_PAIRS_LOG_EVERY") {
        Ok(val) => {
            if val.eq_ignore_ascii_case("off") || val.trim() == "0" {
                None
            } else {
                val.parse::<usize>().ok().filter(|v| *v > 0)
            }
        }
        Err(_) => Some(DEFAULT_LOG_EVERY_SAMPLES),
    }
}

fn env_permissive() -> bool {
    std::env::var("VIEW_PAIRS_PERMISSIVE")
        .ok()
        .map(|v| v.trim().to_ascii_lowercase())
        .map(|v| v == "0" || v == "false" || v == "off")
        .map(|strict| !strict)
        .unwrap_or(true)
}

fn stack_views<B: Backend>(views: &[&ViewSample], device: &B::Device) -> ViewBatch<B> {
    let (w, h) = (views[0].width as usize, views[0].height as usize);
    let n = views.len();
    let mut images = Vec::with_capacity(n * 3 * h * w);
    let mut labels = Vec::with_capacity(n * h * w);
    for v in views {
        images.extend_from_slice(&v.image_chw);
        labels.extend_from_slice(&v.label);
    }
    ViewBatch {
        images: Tensor::from_data(TensorData::new(images, [n, 3, h, w]), device),
        labels: Tensor::from_data(TensorData::new(labels, [n, h, w]), device),
    }
}

pub struct PairBatchIter {
    indices: Vec<SampleIndex>,
    order: Vec<usize>,
    cursor: usize,
    epoch: u64,
    cfg: PairIterConfig,
    sampler: PairSampler,
    rng: rand::rngs::StdRng,
    processed_samples: usize,
    processed_batches: usize,
    skipped_errors: usize,
    started: Instant,
    total_load_time: Duration,
    last_log: Instant,
    last_logged_samples: usize,
    log_every_samples: Option<usize>,
    permissive_errors: bool,
    trace_path: Option<PathBuf>,
    trace_file: Option<std::fs::File>,
}

impl PairBatchIter {
    pub fn from_root(root: &Path, sampler: PairSampler, cfg: PairIterConfig) -> PairResult<Self> {
        Self::from_indices(index_dataset(root)?, sampler, cfg)
    }

    pub fn from_indices(
        indices: Vec<SampleIndex>,
        sampler: PairSampler,
        cfg: PairIterConfig,
    ) -> PairResult<Self> {
        if indices.is_empty() {
            return Err(PairDatasetError::Other(
                "no training samples found".to_string(),
            ));
        }
        let rng = match cfg.seed {
            Some(seed) => rand::rngs::StdRng::seed_from_u64(seed),
            None => rand::rngs::StdRng::from_rng(&mut rand::rng()),
        };
        let trace_path = std::env::var("VIEW_PAIRS_TRACE")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);
        let now = Instant::now();
        let mut iter = Self {
            order: (0..indices.len()).collect(),
            indices,
            cursor: 0,
            epoch: 0,
            cfg,
            sampler,
            rng,
            processed_samples: 0,
            processed_batches: 0,
            skipped_errors: 0,
            started: now,
            total_load_time: Duration::ZERO,
            last_log: now,
            last_logged_samples: 0,
            log_every_samples: env_log_every(),
            permissive_errors: env_permissive(),
            trace_path,
            trace_file: None,
        };
        iter.reshuffle();
        Ok(iter)
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Start the next pass over the data with a fresh order.
    pub fn next_epoch(&mut self) {
        self.epoch += 1;
        self.cursor = 0;
        self.reshuffle();
    }

    fn reshuffle(&mut self) {
        if self.cfg.shuffle {
            self.order.shuffle(&mut self.rng);
        }
    }

    fn sample_id(&self, position: usize) -> u64 {
        (self.epoch << 32) | position as u64
    }

    /// Next batch of pairs, or `None` at the end of the epoch.
    pub fn next_batch<B: Backend>(
        &mut self,
        batch_size: usize,
        device: &B::Device,
    ) -> PairResult<Option<PairBatch<B>>> {
        let batch_size = batch_size.max(1);
        loop {
            if self.cursor >= self.order.len() {
                return Ok(None);
            }
            let end = (self.cursor + batch_size).min(self.order.len());
            if self.cfg.drop_last && end - self.cursor < batch_size {
                self.cursor = self.order.len();
                return Ok(None);
            }
            let slice: Vec<usize> = self.order[self.cursor..end].to_vec();
            self.cursor = end;

            let t_load = Instant::now();
            let loaded: Vec<(usize, PairResult<ViewPair>)> = slice
                .par_iter()
                .map(|&pos| {
                    let idx = &self.indices[pos];
                    let res = load_sample(idx)
                        .and_then(|(img, label)| self.sampler.sample(&img, &label, self.sample_id(pos)));
                    (pos, res)
                })
                .collect();
            let load_elapsed = t_load.elapsed();

            let mut pairs = Vec::with_capacity(loaded.len());
            for (pos, res) in loaded {
                match res {
                    Ok(pair) => pairs.push(pair),
                    Err(e) if self.permissive_errors => {
                        warn!(
                            image = %self.indices[pos].image_path.display(),
                            error = %e,
                            "skipping sample"
                        );
                        self.skipped_errors += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
            if pairs.is_empty() || (self.cfg.drop_last && pairs.len() < batch_size) {
                continue;
            }

            let first: Vec<&ViewSample> = pairs.iter().map(|p| &p.first).collect();
            let second: Vec<&ViewSample> = pairs.iter().map(|p| &p.second).collect();
            let batch = PairBatch {
                first: stack_views(&first, device),
                second: stack_views(&second, device),
                geometry: pairs.iter().map(|p| p.geometry).collect(),
                sample_ids: pairs.iter().map(|p| p.sample_id).collect(),
            };

            self.processed_samples += batch.len();
            self.processed_batches += 1;
            self.total_load_time += load_elapsed;
            self.maybe_trace(&batch, load_elapsed);
            self.maybe_log_progress();
            return Ok(Some(batch));
        }
    }

    fn maybe_log_progress(&mut self) {
        let Some(threshold) = self.log_every_samples else {
            return;
        };
        let processed_since = self
            .processed_samples
            .saturating_sub(self.last_logged_samples);
        if processed_since < threshold && self.last_log.elapsed() < Duration::from_secs(30) {
            return;
        }
        let secs = self.started.elapsed().as_secs_f32().max(0.001);
        let avg_load_ms = if self.processed_batches > 0 {
            (self.total_load_time.as_secs_f64() * 1000.0) / self.processed_batches as f64
        } else {
            0.0
        };
        info!(
            target: "view_pairs",
            epoch = self.epoch,
            batches = self.processed_batches,
            samples = self.processed_samples,
            skipped_errors = self.skipped_errors,
            rate = format!("{:.1} pairs/s", self.processed_samples as f32 / secs),
            avg_load_ms = format!("{avg_load_ms:.2}"),
            "dataset progress"
        );
        self.last_logged_samples = self.processed_samples;
        self.last_log = Instant::now();
    }

    fn maybe_trace<B: Backend>(&mut self, batch: &PairBatch<B>, load_elapsed: Duration) {
        let Some(path) = &self.trace_path else {
            return;
        };
        if self.trace_file.is_none() {
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            match std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
            {
                Ok(f) => self.trace_file = Some(f),
                Err(e) => {
                    warn!("failed to open trace file {}: {e}", path.display());
                    self.trace_path = None;
                    return;
                }
            }
        }
        let Some(file) = self.trace_file.as_mut() else {
            return;
        };
        let overlaps: Vec<Option<u64>> = batch
            .geometry
            .iter()
            .map(|g| g.overlap().map(|r| r.area()))
            .collect();
        let record = serde_json::json!({
            "epoch": self.epoch,
            "batch": self.processed_batches,
            "samples": batch.len(),
            "overlap_areas": overlaps,
            "skipped_errors_total": self.skipped_errors,
            "load_ms": load_elapsed.as_secs_f64() * 1000.0,
            "timestamp_ms": self.started.elapsed().as_millis() as u64
        });
        if let Err(e) = writeln!(file, "{}", record) {
            warn!("failed to write trace record: {e}");
            self.trace_path = None;
            self.trace_file = None;
        }
    }
}

/// Unaugmented validation images. Native-resolution views are always yielded one at a
/// time; centre-cropped views (`crop_val`) can be batched.
pub struct EvalIter {
    indices: Vec<SampleIndex>,
    cursor: usize,
    sampler: PairSampler,
}

impl EvalIter {
    pub fn new(indices: Vec<SampleIndex>, sampler: PairSampler) -> Self {
        Self {
            indices,
            cursor: 0,
            sampler,
        }
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    pub fn next_sample<B: Backend>(&mut self, device: &B::Device) -> PairResult<Option<EvalBatch<B>>> {
        self.next_batch(1, device)
    }

    /// Batch size actually used for a requested `batch_size`.
    pub fn effective_batch_size(&self, batch_size: usize) -> usize {
        if self.sampler.config().crop_val {
            batch_size.max(1)
        } else {
            1
        }
    }

    /// Up to `batch_size` images; the last batch may be short.
    pub fn next_batch<B: Backend>(
        &mut self,
        batch_size: usize,
        device: &B::Device,
    ) -> PairResult<Option<EvalBatch<B>>> {
        let end = (self.cursor + self.effective_batch_size(batch_size)).min(self.indices.len());
        if self.cursor >= end {
            return Ok(None);
        }
        let slice = &self.indices[self.cursor..end];
        self.cursor = end;
        let views = slice
            .par_iter()
            .map(|idx| {
                load_sample(idx).map(|(img, label)| self.sampler.eval_view(&img, &label))
            })
            .collect::<PairResult<Vec<_>>>()?;
        let refs: Vec<&ViewSample> = views.iter().collect();
        let ViewBatch { images, labels } = stack_views(&refs, device);
        Ok(Some(EvalBatch {
            stems: slice.iter().map(|idx| idx.stem.clone()).collect(),
            images,
            labels,
        }))
    }
}
