//! Running loss totals between progress reports.

use consistency::LossSnapshot;
use serde::Serialize;

/// Averages of every loss term over one reporting interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IntervalReport {
    pub steps: usize,
    pub loss: f32,
    pub pgc: f32,
    pub mse: f32,
    pub symmetric_ce: f32,
    pub aux_l1: f32,
    pub ce: f32,
}

#[derive(Debug, Clone)]
pub struct LossAccumulator {
    interval: usize,
    steps: usize,
    sum: LossSnapshot,
}

impl LossAccumulator {
    pub fn new(interval: usize) -> Self {
        Self {
            interval: interval.max(1),
            steps: 0,
            sum: LossSnapshot::default(),
        }
    }

    pub fn record(&mut self, step: &LossSnapshot) {
        self.steps += 1;
        self.sum.total += step.total;
        self.sum.pgc += step.pgc;
        self.sum.mse += step.mse;
        self.sum.symmetric_ce += step.symmetric_ce;
        self.sum.aux_l1 += step.aux_l1;
        self.sum.ce += step.ce;
    }

    /// True once a full interval has been recorded.
    pub fn ready(&self) -> bool {
        self.steps >= self.interval
    }

    /// Averages since the last drain; `None` if nothing was recorded. Resets the totals.
    pub fn drain(&mut self) -> Option<IntervalReport> {
        if self.steps == 0 {
            return None;
        }
        let n = self.steps as f32;
        let report = IntervalReport {
            steps: self.steps,
            loss: self.sum.total / n,
            pgc: self.sum.pgc / n,
            mse: self.sum.mse / n,
            symmetric_ce: self.sum.symmetric_ce / n,
            aux_l1: self.sum.aux_l1 / n,
            ce: self.sum.ce / n,
        };
        self.steps = 0;
        self.sum = LossSnapshot::default();
        Some(report)
    }
}
