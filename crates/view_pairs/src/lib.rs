//! Segmentation dataset indexing, paired-crop sampling, and Burn batching.
//!
//! This crate provides utilities for:
//! - Indexing `images/` + `labels/` dataset roots and train/val splitting
//! - Cutting two overlapping, independently flipped views per image
//! - Burn-compatible batch iteration for pairs and validation images

// Module declarations
pub mod aug;
pub mod index;
pub mod types;

#[cfg(feature = "burn-runtime")]
pub mod batch;

// Re-export public API
pub use aug::{PairSampler, PairSamplerBuilder, PairSamplerConfig, IMAGENET_MEAN, IMAGENET_STD};
pub use index::{index_dataset, load_sample, split_dataset};
pub use types::*;

#[cfg(feature = "burn-runtime")]
pub use batch::{
    build_pair_iters, EvalBatch, EvalIter, PairBatch, PairBatchIter, PairIterConfig, ViewBatch,
};
