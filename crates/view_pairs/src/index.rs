//! Indexing and loading image/label pairs from a dataset root.
//!
//! Layout: `images/<stem>.{png,jpg,jpeg}`, `labels/<stem>.png` (single-channel class ids),
//! and optionally `splits/train.txt` + `splits/val.txt` with one stem per line.

use crate::types::{PairDatasetError, PairResult, SampleIndex, SplitSummary};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> PairDatasetError + '_ {
    move |source| PairDatasetError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// All samples under `root`, sorted by stem. Images without a label are skipped with a warning.
pub fn index_dataset(root: &Path) -> PairResult<Vec<SampleIndex>> {
    let images_dir = root.join("images");
    let labels_dir = root.join("labels");
    let mut indices = Vec::new();
    for entry in fs::read_dir(&images_dir).map_err(io_err(&images_dir))? {
        let path = entry.map_err(io_err(&images_dir))?.path();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        if !ext.is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.as_str())) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };
        let label_path = labels_dir.join(format!("{stem}.png"));
        if !label_path.exists() {
            warn!(
                image = %path.display(),
                label = %label_path.display(),
                "label missing; skipping sample"
            );
            continue;
        }
        indices.push(SampleIndex {
            stem,
            image_path: path,
            label_path,
        });
    }
    indices.sort_by(|a, b| a.stem.cmp(&b.stem));
    Ok(indices)
}

fn read_split_list(path: &Path) -> PairResult<Vec<String>> {
    let raw = fs::read_to_string(path).map_err(io_err(path))?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}

fn pick(
    by_stem: &HashMap<&str, &SampleIndex>,
    stems: Vec<String>,
    list: &Path,
) -> PairResult<Vec<SampleIndex>> {
    stems
        .into_iter()
        .map(|stem| match by_stem.get(stem.as_str()) {
            Some(idx) => Ok((*idx).clone()),
            None => Err(PairDatasetError::UnknownStem {
                path: list.to_path_buf(),
                stem,
            }),
        })
        .collect()
}

/// Train/val split. Uses `splits/{train,val}.txt` when both exist, otherwise holds out the
/// last `val_ratio` share of the (sorted) samples.
pub fn split_dataset(
    root: &Path,
    indices: Vec<SampleIndex>,
    val_ratio: f32,
) -> PairResult<(Vec<SampleIndex>, Vec<SampleIndex>, SplitSummary)> {
    let train_list: PathBuf = root.join("splits").join("train.txt");
    let val_list: PathBuf = root.join("splits").join("val.txt");
    if train_list.exists() && val_list.exists() {
        let by_stem: HashMap<&str, &SampleIndex> =
            indices.iter().map(|idx| (idx.stem.as_str(), idx)).collect();
        let train = pick(&by_stem, read_split_list(&train_list)?, &train_list)?;
        let val = pick(&by_stem, read_split_list(&val_list)?, &val_list)?;
        let summary = SplitSummary {
            train: train.len(),
            val: val.len(),
            from_lists: true,
        };
        return Ok((train, val, summary));
    }

    let ratio = val_ratio.clamp(0.0, 1.0);
    let n_val = ((indices.len() as f32) * ratio).round() as usize;
    let mut train = indices;
    let val = train.split_off(train.len() - n_val.min(train.len()));
    let summary = SplitSummary {
        train: train.len(),
        val: val.len(),
        from_lists: false,
    };
    Ok((train, val, summary))
}

/// Decode one sample. The label must be a single-channel 8-bit PNG of class ids with the
/// same size as the image.
pub fn load_sample(idx: &SampleIndex) -> PairResult<(image::RgbImage, image::GrayImage)> {
    let img = image::open(&idx.image_path)
        .map_err(|source| PairDatasetError::Image {
            path: idx.image_path.clone(),
            source,
        })?
        .to_rgb8();
    if !idx.label_path.exists() {
        return Err(PairDatasetError::MissingLabel {
            image: idx.image_path.clone(),
            label: idx.label_path.clone(),
        });
    }
    // Only raw 8-bit class ids; colour or palette-expanded labels are rejected.
    let label = match image::open(&idx.label_path).map_err(|source| PairDatasetError::Image {
        path: idx.label_path.clone(),
        source,
    })? {
        image::DynamicImage::ImageLuma8(label) => label,
        other => {
            return Err(PairDatasetError::LabelNotSingleChannel {
                path: idx.label_path.clone(),
                color: format!("{:?}", other.color()),
            })
        }
    };
    if img.dimensions() != label.dimensions() {
        return Err(PairDatasetError::SizeMismatch {
            image: idx.image_path.clone(),
            image_size: img.dimensions(),
            label_size: label.dimensions(),
        });
    }
    Ok((img, label))
}
