use clap::Parser;
use std::path::Path;
use training::util::{evaluate, validate_backend_choice, BackendKind};
use training::{load_segnet_from_checkpoint, SegNetConfig, StreamSegMetrics, TrainBackend};
use view_pairs::{index_dataset, split_dataset, EvalIter, PairSamplerBuilder};

#[derive(Parser, Debug)]
#[command(
    name = "eval",
    about = "Evaluate a SegNet checkpoint on a segmentation dataset (accuracy / mean IoU)"
)]
struct Args {
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum, default_value_t = BackendKind::NdArray)]
    backend: BackendKind,
    /// Dataset root containing images/, labels/ and optionally splits/.
    #[arg(long, default_value = "assets/datasets/voc")]
    dataset_root: String,
    #[arg(long, default_value_t = 21)]
    num_classes: usize,
    /// Checkpoint path to load.
    #[arg(long)]
    checkpoint: String,
    /// Held-out fraction when no split lists exist (must match training).
    #[arg(long, default_value_t = 0.1)]
    val_ratio: f32,
    /// Score centre crops of this size instead of full images.
    #[arg(long)]
    crop_val: Option<u32>,
    /// Images per forward pass when `--crop-val` is set.
    #[arg(long, default_value_t = 4)]
    val_batch_size: usize,
    /// Score every indexed sample instead of the validation split.
    #[arg(long, default_value_t = false)]
    all: bool,
    /// Optional JSON report path.
    #[arg(long)]
    report: Option<String>,
}

fn main() -> anyhow::Result<()> {
    training::init_tracing();
    let args = Args::parse();
    validate_backend_choice(args.backend)?;

    let root = Path::new(&args.dataset_root);
    let indices = index_dataset(root)?;
    let samples = if args.all {
        indices
    } else {
        split_dataset(root, indices, args.val_ratio)?.1
    };
    if samples.is_empty() {
        tracing::warn!(root = %root.display(), "no samples to evaluate");
        return Ok(());
    }
    tracing::info!(samples = samples.len(), "evaluating");

    let device = <TrainBackend as burn::tensor::backend::Backend>::Device::default();
    let cfg = SegNetConfig::default().with_num_classes(args.num_classes);
    let model = load_segnet_from_checkpoint::<TrainBackend, _>(&args.checkpoint, cfg, &device)
        .map_err(|e| anyhow::anyhow!("failed to load checkpoint {}: {e}", args.checkpoint))?;

    let mut sampler = PairSamplerBuilder::new();
    if let Some(size) = args.crop_val {
        sampler = sampler.crop_size(size, size).crop_val(true);
    }
    let mut val = EvalIter::new(samples, sampler.build());
    let mut metrics = StreamSegMetrics::new(args.num_classes);
    let scores = evaluate(&model, &mut val, args.val_batch_size, &mut metrics, &device)?;
    println!("{}", scores.to_table());

    if let Some(path) = args.report {
        std::fs::write(&path, serde_json::to_vec_pretty(&scores)?)?;
        tracing::info!(path = %path, "report written");
    }
    Ok(())
}
