//! Core types, error definitions, and data structures for view_pairs.

use data_contracts::{GeometryError, PairGeometry};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

pub type PairResult<T> = Result<T, PairDatasetError>;

/// Class id excluded from supervision; also used to pad labels.
pub const IGNORE_INDEX: u8 = 255;

#[derive(Debug, Error)]
pub enum PairDatasetError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("label file missing for image {image}: expected {label}")]
    MissingLabel { image: PathBuf, label: PathBuf },
    #[error("label {path} must be single-channel 8-bit class ids, found {color}")]
    LabelNotSingleChannel { path: PathBuf, color: String },
    #[error("image {image} is {image_size:?} but its label is {label_size:?}")]
    SizeMismatch {
        image: PathBuf,
        image_size: (u32, u32),
        label_size: (u32, u32),
    },
    #[error("split list {path} names unknown sample {stem}")]
    UnknownStem { path: PathBuf, stem: String },
    #[error("invalid geometry: {0}")]
    Geometry(#[from] GeometryError),
    #[error("{0}")]
    Other(String),
}

/// One image/label pair on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleIndex {
    pub stem: String,
    pub image_path: PathBuf,
    pub label_path: PathBuf,
}

/// A single view ready for batching.
#[derive(Debug, Clone)]
pub struct ViewSample {
    /// Image in CHW layout, normalized with the sampler's mean/std.
    pub image_chw: Vec<f32>,
    /// Class ids in row-major order; `IGNORE_INDEX` marks unlabeled pixels.
    pub label: Vec<i64>,
    pub width: u32,
    pub height: u32,
}

/// Two views of one source image and how they were cut from it.
#[derive(Debug, Clone)]
pub struct ViewPair {
    pub sample_id: u64,
    pub first: ViewSample,
    pub second: ViewSample,
    pub geometry: PairGeometry,
    /// Size of the scaled and padded source frame the crops refer to.
    pub source_size: (u32, u32),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SplitSummary {
    pub train: usize,
    pub val: usize,
    /// True when `splits/*.txt` lists were used instead of the ratio split.
    pub from_lists: bool,
}
