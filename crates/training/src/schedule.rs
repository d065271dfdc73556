use clap::ValueEnum;
use serde::{Deserialize, Serialize};

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LrPolicy {
    Poly,
    Step,
}

/// Learning rate as a function of the iteration counter.
#[derive(Debug, Clone, Copy)]
pub enum LrSchedule {
    /// `base * (1 - iter / total) ^ power`, floored at `min_lr`.
    Poly {
        base: f64,
        total_iters: usize,
        power: f64,
        min_lr: f64,
    },
    /// `base * gamma ^ (iter / step_size)`.
    Step {
        base: f64,
        step_size: usize,
        gamma: f64,
    },
}

impl LrSchedule {
    pub fn new(policy: LrPolicy, base: f64, total_iters: usize, step_size: usize) -> Self {
        match policy {
            LrPolicy::Poly => Self::Poly {
                base,
                total_iters: total_iters.max(1),
                power: 0.9,
                min_lr: 1e-6,
            },
            LrPolicy::Step => Self::Step {
                base,
                step_size: step_size.max(1),
                gamma: 0.1,
            },
        }
    }

    pub fn lr_at(&self, iter: usize) -> f64 {
        match *self {
            Self::Poly {
                base,
                total_iters,
                power,
                min_lr,
            } => {
                let progress = (iter.min(total_iters) as f64) / total_iters as f64;
                (base * (1.0 - progress).powf(power)).max(min_lr)
            }
            Self::Step {
                base,
                step_size,
                gamma,
            } => base * gamma.powi((iter / step_size) as i32),
        }
    }
}
