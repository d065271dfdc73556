#![recursion_limit = "256"]

pub mod accumulator;
pub mod checkpoint;
pub mod metrics;
pub mod schedule;
pub mod util;

pub use accumulator::{IntervalReport, LossAccumulator};
pub use checkpoint::{load_segnet_from_checkpoint, TrainState};
pub use metrics::{SegScores, StreamSegMetrics};
pub use models::{SegNet, SegNetConfig};
pub use schedule::{LrPolicy, LrSchedule};
pub use util::{evaluate, run_train, TrainArgs};

/// Backend alias for training/eval (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;

/// Install the `tracing` subscriber used by the binaries (`RUST_LOG`, default `info`).
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
