use burn::backend::Autodiff;
use burn::config::Config;
use burn::module::AutodiffModule;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{GradientsParams, Optimizer, SgdConfig};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};
use consistency::{LabelLoss, PgcLossConfig, PgcMode};
use models::{SegNet, SegNetConfig};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use view_pairs::{build_pair_iters, EvalIter, PairIterConfig, PairSamplerBuilder};

use crate::accumulator::LossAccumulator;
use crate::checkpoint::{
    best_path, latest_path, load_segnet_from_checkpoint, save_segnet, TrainState,
    LOSS_CONFIG_FILE,
};
use crate::metrics::{SegScores, StreamSegMetrics};
use crate::schedule::{LrPolicy, LrSchedule};
use crate::TrainBackend;
use clap::{Parser, ValueEnum};

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum BackendKind {
    NdArray,
    Wgpu,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossType {
    CrossEntropy,
    FocalLoss,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "train",
    about = "Train SegNet on paired crops with the pixel-guided consistency loss"
)]
pub struct TrainArgs {
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    pub backend: BackendKind,
    /// Dataset root containing images/, labels/ and optionally splits/.
    #[arg(long, default_value = "assets/datasets/voc")]
    pub dataset_root: String,
    /// Dataset name used in checkpoint file names.
    #[arg(long, default_value = "voc")]
    pub dataset: String,
    #[arg(long, default_value_t = 21)]
    pub num_classes: usize,
    /// Fraction of samples held out for validation when no split lists exist.
    #[arg(long, default_value_t = 0.1)]
    pub val_ratio: f32,
    /// Square crop size of each view.
    #[arg(long, default_value_t = 513)]
    pub crop_size: u32,
    #[arg(long, default_value_t = 0.5)]
    pub scale_min: f32,
    #[arg(long, default_value_t = 2.0)]
    pub scale_max: f32,
    /// Probability of mirroring each view.
    #[arg(long, default_value_t = 0.5)]
    pub flip_prob: f32,
    /// Max offset of the second crop, as a fraction of the crop size.
    #[arg(long, default_value_t = 0.5)]
    pub max_shift: f32,
    /// Pairs per batch.
    #[arg(long, default_value_t = 16)]
    pub batch_size: usize,
    /// Validate on centre crops of `crop_size` instead of full images.
    #[arg(long, default_value_t = false)]
    pub crop_val: bool,
    /// Validation batch size; full-image validation always uses 1.
    #[arg(long, default_value_t = 4)]
    pub val_batch_size: usize,
    #[arg(long, default_value_t = 30_000)]
    pub total_itrs: usize,
    #[arg(long, default_value_t = 0.025)]
    pub lr: f64,
    #[arg(long, value_enum, default_value_t = LrPolicy::Poly)]
    pub lr_policy: LrPolicy,
    /// Iterations between step-policy decays.
    #[arg(long, default_value_t = 10_000)]
    pub step_size: usize,
    #[arg(long, default_value_t = 1e-4)]
    pub weight_decay: f32,
    /// 1, 2, 3 select a single feature level; anything else uses all three.
    #[arg(long, default_value_t = 0)]
    pub pgc_mode: i32,
    /// Weight of the auxiliary feature consistency.
    #[arg(long, default_value_t = 0.2)]
    pub alpha: f32,
    /// Weight of the symmetric cross-entropy between views.
    #[arg(long, default_value_t = 0.9)]
    pub beta: f32,
    /// Supervised loss on the labelled pixels of both views.
    #[arg(long, value_enum, default_value_t = LossType::CrossEntropy)]
    pub loss_type: LossType,
    /// Focusing exponent of the focal loss.
    #[arg(long, default_value_t = 2.0)]
    pub focal_gamma: f32,
    /// Iterations between loss reports.
    #[arg(long, default_value_t = 10)]
    pub print_interval: usize,
    /// Iterations between checkpoint + validation.
    #[arg(long, default_value_t = 100)]
    pub val_interval: usize,
    #[arg(long, default_value_t = 1)]
    pub seed: u64,
    #[arg(long, default_value = "checkpoints")]
    pub checkpoint_dir: String,
    /// Weights to start from.
    #[arg(long)]
    pub ckpt: Option<String>,
    /// Also restore iteration count and best score from `train_state.json`.
    #[arg(long, default_value_t = false)]
    pub continue_training: bool,
    /// Only run validation on the restored weights.
    #[arg(long, default_value_t = false)]
    pub test_only: bool,
}

impl TrainArgs {
    pub fn label_loss(&self) -> anyhow::Result<LabelLoss> {
        match self.loss_type {
            LossType::CrossEntropy => Ok(LabelLoss::CrossEntropy),
            LossType::FocalLoss if self.focal_gamma >= 0.0 => Ok(LabelLoss::Focal {
                gamma: self.focal_gamma,
            }),
            LossType::FocalLoss => {
                anyhow::bail!("--focal-gamma must be non-negative, got {}", self.focal_gamma)
            }
        }
    }
}

type ADBackend = Autodiff<TrainBackend>;

pub fn run_train(args: TrainArgs) -> anyhow::Result<TrainState> {
    validate_backend_choice(args.backend)?;
    let device = <ADBackend as Backend>::Device::default();

    let sampler = PairSamplerBuilder::new()
        .crop_size(args.crop_size, args.crop_size)
        .scale_range(args.scale_min, args.scale_max)
        .flip_prob(args.flip_prob)
        .max_shift(args.max_shift)
        .seed(Some(args.seed))
        .crop_val(args.crop_val)
        .build();
    info!(sampler = %sampler.describe(), "pair sampler");
    let iter_cfg = PairIterConfig {
        shuffle: true,
        drop_last: true,
        seed: Some(args.seed),
    };
    let root = Path::new(&args.dataset_root);
    let (mut train_iter, mut val_iter, split) =
        build_pair_iters(root, args.val_ratio, sampler, iter_cfg).map_err(|e| {
            anyhow::anyhow!("failed to load dataset at {}: {e}", root.display())
        })?;
    info!(
        train = split.train,
        val = split.val,
        from_lists = split.from_lists,
        "dataset split"
    );

    let ckpt_dir = PathBuf::from(&args.checkpoint_dir);
    fs::create_dir_all(&ckpt_dir)?;
    let loss_cfg = PgcLossConfig::new()
        .with_mode(PgcMode::from_index(args.pgc_mode))
        .with_alpha(args.alpha)
        .with_beta(args.beta)
        .with_label_loss(args.label_loss()?);
    loss_cfg
        .save(ckpt_dir.join(LOSS_CONFIG_FILE))
        .map_err(|e| anyhow::anyhow!("failed to write loss config: {e}"))?;
    let criterion = loss_cfg.init();
    info!(
        mode = ?criterion.mode,
        levels = ?criterion.mode.levels(),
        label_loss = ?criterion.label.kind,
        "pgc loss"
    );

    let model_cfg = SegNetConfig::default().with_num_classes(args.num_classes);
    let mut model = SegNet::<ADBackend>::new(model_cfg.clone(), &device);
    let mut state = TrainState {
        num_classes: args.num_classes,
        dataset: args.dataset.clone(),
        ..TrainState::default()
    };
    match args.ckpt.as_deref() {
        Some(ckpt) if Path::new(ckpt).is_file() => {
            model = load_segnet_from_checkpoint(ckpt, model_cfg, &device)
                .map_err(|e| anyhow::anyhow!("failed to load checkpoint {ckpt}: {e}"))?;
            if args.continue_training {
                if let Some(saved) = TrainState::load(&ckpt_dir)? {
                    state.iteration = saved.iteration;
                    state.epoch = saved.epoch;
                    state.best_score = saved.best_score;
                    info!(iteration = state.iteration, best = state.best_score, "training state restored");
                }
            }
            info!(path = ckpt, "model restored");
        }
        Some(ckpt) => warn!(path = ckpt, "checkpoint not found; training from scratch"),
        None => info!("training from scratch"),
    }

    let mut metrics = StreamSegMetrics::new(args.num_classes);
    if args.test_only {
        let scores = evaluate(
            &model.valid(),
            &mut val_iter,
            args.val_batch_size,
            &mut metrics,
            &device,
        )?;
        info!("validation\n{}", scores.to_table());
        return Ok(state);
    }

    let schedule = LrSchedule::new(args.lr_policy, args.lr, args.total_itrs, args.step_size);
    let mut optim = SgdConfig::new()
        .with_momentum(Some(
            MomentumConfig::new().with_momentum(0.9).with_dampening(0.0),
        ))
        .with_weight_decay(Some(WeightDecayConfig::new(args.weight_decay)))
        .init();
    let mut acc = LossAccumulator::new(args.print_interval);
    let batch_size = args.batch_size.max(1);
    let val_interval = args.val_interval.max(1);
    let latest = latest_path(&ckpt_dir, &args.dataset);
    let best = best_path(&ckpt_dir, &args.dataset);

    while state.iteration < args.total_itrs {
        state.epoch += 1;
        let mut stepped = false;
        while let Some(batch) = train_iter.next_batch::<ADBackend>(batch_size, &device)? {
            stepped = true;
            let lr = schedule.lr_at(state.iteration);
            state.iteration += 1;

            let first = model.forward(batch.first.images);
            let second = model.forward(batch.second.images);
            let terms = criterion.forward(
                &first,
                &second,
                &batch.geometry,
                [&batch.first.labels, &batch.second.labels],
            );
            let loss = criterion.total(&terms);
            acc.record(&terms.snapshot(criterion.alpha, criterion.beta)?);
            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(lr, model, grads);

            if acc.ready() {
                if let Some(r) = acc.drain() {
                    info!(
                        "Epoch {}, Itrs {}/{}, Loss={:.6}, pgc={:.6}, mse={:.6}, sym_ce={:.6}, ce={:.6}, lr={:.2e}",
                        state.epoch,
                        state.iteration,
                        args.total_itrs,
                        r.loss,
                        r.pgc,
                        r.mse,
                        r.symmetric_ce,
                        r.ce,
                        lr
                    );
                }
            }

            if state.iteration % val_interval == 0 || state.iteration == args.total_itrs {
                save_segnet(&model, &latest)
                    .map_err(|e| anyhow::anyhow!("failed to save checkpoint: {e}"))?;
                info!(path = %latest.display(), "model saved");
                let scores = evaluate(
            &model.valid(),
            &mut val_iter,
            args.val_batch_size,
            &mut metrics,
            &device,
        )?;
                info!("validation\n{}", scores.to_table());
                if scores.mean_iou > state.best_score {
                    state.best_score = scores.mean_iou;
                    save_segnet(&model, &best)
                        .map_err(|e| anyhow::anyhow!("failed to save checkpoint: {e}"))?;
                    info!(path = %best.display(), mean_iou = state.best_score, "new best model");
                }
                state.save(&ckpt_dir)?;
            }
            if state.iteration >= args.total_itrs {
                break;
            }
        }
        if !stepped {
            anyhow::bail!(
                "training split yields no full batch of {batch_size} pairs; lower --batch-size"
            );
        }
        train_iter.next_epoch();
    }

    Ok(state)
}

/// Run `model` over every validation image and score it against the labels.
pub fn evaluate<B: Backend>(
    model: &SegNet<B>,
    val: &mut EvalIter,
    batch_size: usize,
    metrics: &mut StreamSegMetrics,
    device: &B::Device,
) -> anyhow::Result<SegScores> {
    metrics.reset();
    val.reset();
    if val.is_empty() {
        warn!("validation split is empty; scores are zero");
    }
    while let Some(sample) = val.next_batch::<B>(batch_size, device)? {
        let [_, h, w] = sample.labels.dims();
        let preds = model.predict(sample.images, [h, w]).argmax(1);
        metrics.update(&int_values(sample.labels)?, &int_values(preds)?);
    }
    Ok(metrics.scores())
}

fn int_values<B: Backend, const D: usize>(t: Tensor<B, D, Int>) -> anyhow::Result<Vec<i64>> {
    t.into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|e| anyhow::anyhow!("failed to read tensor data: {e:?}"))
}

pub fn validate_backend_choice(kind: BackendKind) -> anyhow::Result<()> {
    let built_wgpu = cfg!(feature = "backend-wgpu");
    match (kind, built_wgpu) {
        (BackendKind::Wgpu, false) => {
            anyhow::bail!("backend-wgpu feature not enabled; rebuild with --features backend-wgpu or choose ndarray backend")
        }
        (BackendKind::NdArray, true) => {
            warn!("built with backend-wgpu; the WGPU backend is used despite --backend ndarray");
        }
        _ => {}
    }
    Ok(())
}
