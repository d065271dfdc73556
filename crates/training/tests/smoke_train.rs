use burn::config::Config;
use clap::Parser;
use consistency::{LabelLoss, PgcLossConfig, PgcMode};
use image::{GrayImage, Luma, Rgb, RgbImage};
use std::fs;
use std::path::Path;
use training::checkpoint::{latest_path, TrainState, LOSS_CONFIG_FILE};
use training::{run_train, TrainArgs};

fn synthetic_dataset(root: &Path, count: usize) -> anyhow::Result<()> {
    fs::create_dir_all(root.join("images"))?;
    fs::create_dir_all(root.join("labels"))?;
    for i in 0..count {
        let img = RgbImage::from_fn(24, 20, |x, y| {
            Rgb([(x * 10) as u8, (y * 12) as u8, (i * 40) as u8])
        });
        let label = GrayImage::from_fn(24, 20, |x, y| {
            if y == 0 {
                Luma([255])
            } else {
                Luma([((x / 8) % 3) as u8])
            }
        });
        img.save(root.join("images").join(format!("img_{i:02}.png")))?;
        label.save(root.join("labels").join(format!("img_{i:02}.png")))?;
    }
    Ok(())
}

fn args(data: &Path, ckpt_dir: &Path, total_itrs: &str, extra: &[&str]) -> TrainArgs {
    let mut argv = vec![
        "train".to_string(),
        "--dataset-root".into(),
        data.display().to_string(),
        "--dataset".into(),
        "toy".into(),
        "--num-classes".into(),
        "3".into(),
        "--val-ratio".into(),
        "0.25".into(),
        "--crop-size".into(),
        "16".into(),
        "--scale-min".into(),
        "0.75".into(),
        "--scale-max".into(),
        "1.25".into(),
        "--batch-size".into(),
        "2".into(),
        "--total-itrs".into(),
        total_itrs.into(),
        "--lr".into(),
        "0.01".into(),
        "--pgc-mode".into(),
        "2".into(),
        "--print-interval".into(),
        "1".into(),
        "--val-interval".into(),
        "1".into(),
        "--checkpoint-dir".into(),
        ckpt_dir.display().to_string(),
    ];
    argv.extend(extra.iter().map(|s| s.to_string()));
    TrainArgs::parse_from(argv)
}

#[test]
fn trains_saves_and_resumes() -> anyhow::Result<()> {
    let data = tempfile::tempdir()?;
    let ckpt = tempfile::tempdir()?;
    synthetic_dataset(data.path(), 4)?;

    let state = run_train(args(data.path(), ckpt.path(), "2", &[]))?;
    assert_eq!(state.iteration, 2);
    assert!(state.best_score >= 0.0);

    let latest = latest_path(ckpt.path(), "toy");
    assert!(latest.is_file());
    let saved = TrainState::load(ckpt.path())?.expect("train state written");
    assert_eq!(saved.iteration, 2);
    assert_eq!(saved.num_classes, 3);

    let loss_cfg = PgcLossConfig::load(ckpt.path().join(LOSS_CONFIG_FILE))
        .map_err(|e| anyhow::anyhow!("{e:?}"))?;
    assert_eq!(loss_cfg.mode, PgcMode::Level1);
    assert!((loss_cfg.beta - 0.9).abs() < 1e-6);

    let latest_str = latest.display().to_string();
    let resumed = run_train(args(
        data.path(),
        ckpt.path(),
        "3",
        &["--ckpt", &latest_str, "--continue-training"],
    ))?;
    assert_eq!(resumed.iteration, 3);

    let tested = run_train(args(
        data.path(),
        ckpt.path(),
        "2",
        &["--ckpt", &latest_str, "--test-only"],
    ))?;
    assert_eq!(tested.iteration, 0);

    let cropped = run_train(args(
        data.path(),
        ckpt.path(),
        "2",
        &["--ckpt", &latest_str, "--test-only", "--crop-val", "--val-batch-size", "2"],
    ))?;
    assert_eq!(cropped.iteration, 0);
    Ok(())
}

#[test]
fn empty_dataset_is_an_error() -> anyhow::Result<()> {
    let data = tempfile::tempdir()?;
    let ckpt = tempfile::tempdir()?;
    fs::create_dir_all(data.path().join("images"))?;
    assert!(run_train(args(data.path(), ckpt.path(), "2", &[])).is_err());
    Ok(())
}

#[test]
fn focal_loss_choice_reaches_the_saved_config() -> anyhow::Result<()> {
    let data = tempfile::tempdir()?;
    let ckpt = tempfile::tempdir()?;
    synthetic_dataset(data.path(), 4)?;

    let focal = &["--loss-type", "focal-loss", "--focal-gamma", "1.5"];
    let state = run_train(args(data.path(), ckpt.path(), "1", focal))?;
    assert_eq!(state.iteration, 1);
    let loss_cfg = PgcLossConfig::load(ckpt.path().join(LOSS_CONFIG_FILE))
        .map_err(|e| anyhow::anyhow!("{e:?}"))?;
    assert_eq!(loss_cfg.label_loss, LabelLoss::Focal { gamma: 1.5 });

    let bad = args(data.path(), ckpt.path(), "1", &["--loss-type", "focal-loss", "--focal-gamma=-1"]);
    assert!(bad.label_loss().is_err());
    assert!(run_train(bad).is_err());
    Ok(())
}
