//! Streaming confusion-matrix metrics for semantic segmentation.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegScores {
    pub overall_acc: f64,
    pub mean_acc: f64,
    pub freq_weighted_acc: f64,
    pub mean_iou: f64,
    /// `None` for classes that never appear in labels or predictions.
    pub class_iou: Vec<Option<f64>>,
}

impl SegScores {
    pub fn to_table(&self) -> String {
        let mut out = format!(
            "Overall Acc: {:.6}\nMean Acc: {:.6}\nFreqW Acc: {:.6}\nMean IoU: {:.6}\n",
            self.overall_acc, self.mean_acc, self.freq_weighted_acc, self.mean_iou
        );
        for (class, iou) in self.class_iou.iter().enumerate() {
            match iou {
                Some(v) => out.push_str(&format!("  class {class:>3}: {v:.6}\n")),
                None => out.push_str(&format!("  class {class:>3}: n/a\n")),
            }
        }
        out
    }
}

/// Confusion matrix accumulated over any number of label/prediction pairs.
/// Rows are ground truth, columns are predictions. Labels outside `[0, classes)` are skipped.
#[derive(Debug, Clone)]
pub struct StreamSegMetrics {
    classes: usize,
    confusion: Vec<u64>,
}

impl StreamSegMetrics {
    pub fn new(classes: usize) -> Self {
        Self {
            classes,
            confusion: vec![0; classes * classes],
        }
    }

    pub fn classes(&self) -> usize {
        self.classes
    }

    pub fn reset(&mut self) {
        self.confusion.iter_mut().for_each(|c| *c = 0);
    }

    pub fn update(&mut self, labels: &[i64], preds: &[i64]) {
        assert_eq!(labels.len(), preds.len(), "label/prediction length mismatch");
        let n = self.classes as i64;
        for (&t, &p) in labels.iter().zip(preds) {
            if t < 0 || t >= n || p < 0 || p >= n {
                continue;
            }
            self.confusion[t as usize * self.classes + p as usize] += 1;
        }
    }

    pub fn confusion(&self) -> &[u64] {
        &self.confusion
    }

    pub fn scores(&self) -> SegScores {
        let k = self.classes;
        let at = |r: usize, c: usize| self.confusion[r * k + c] as f64;
        let diag: Vec<f64> = (0..k).map(|i| at(i, i)).collect();
        let row: Vec<f64> = (0..k).map(|i| (0..k).map(|j| at(i, j)).sum()).collect();
        let col: Vec<f64> = (0..k).map(|j| (0..k).map(|i| at(i, j)).sum()).collect();
        let total: f64 = row.iter().sum();

        let overall_acc = if total > 0.0 {
            diag.iter().sum::<f64>() / total
        } else {
            0.0
        };
        let class_acc: Vec<Option<f64>> = (0..k)
            .map(|i| (row[i] > 0.0).then(|| diag[i] / row[i]))
            .collect();
        let class_iou: Vec<Option<f64>> = (0..k)
            .map(|i| {
                let union = row[i] + col[i] - diag[i];
                (union > 0.0).then(|| diag[i] / union)
            })
            .collect();
        let freq_weighted_acc = if total > 0.0 {
            (0..k)
                .filter(|&i| row[i] > 0.0)
                .map(|i| row[i] / total * class_iou[i].unwrap_or(0.0))
                .sum()
        } else {
            0.0
        };

        SegScores {
            overall_acc,
            mean_acc: nan_mean(&class_acc),
            freq_weighted_acc,
            mean_iou: nan_mean(&class_iou),
            class_iou,
        }
    }
}

fn nan_mean(values: &[Option<f64>]) -> f64 {
    let present: Vec<f64> = values.iter().flatten().copied().collect();
    if present.is_empty() {
        0.0
    } else {
        present.iter().sum::<f64>() / present.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hand_computed_scores() {
        let mut m = StreamSegMetrics::new(3);
        // truth:  0 0 1 1 255
        // pred:   0 1 1 1 2
        m.update(&[0, 0, 1, 1, 255], &[0, 1, 1, 1, 2]);
        let s = m.scores();
        assert!((s.overall_acc - 0.75).abs() < 1e-12);
        // class 0: acc 1/2, class 1: acc 2/2, class 2 absent
        assert!((s.mean_acc - 0.75).abs() < 1e-12);
        // iou0 = 1/2, iou1 = 2/3, iou2 undefined
        assert_eq!(s.class_iou[2], None);
        assert!((s.mean_iou - (0.5 + 2.0 / 3.0) / 2.0).abs() < 1e-12);
        let fw = 0.5 * 0.5 + 0.5 * (2.0 / 3.0);
        assert!((s.freq_weighted_acc - fw).abs() < 1e-12);
    }

    #[test]
    fn ignore_label_is_skipped_and_reset_clears() {
        let mut m = StreamSegMetrics::new(2);
        m.update(&[255, 255], &[0, 1]);
        assert!(m.confusion().iter().all(|&c| c == 0));
        assert_eq!(m.scores().mean_iou, 0.0);
        m.update(&[1], &[1]);
        assert_eq!(m.confusion()[3], 1);
        m.reset();
        assert!(m.confusion().iter().all(|&c| c == 0));
    }

    #[test]
    fn table_lists_every_class() {
        let mut m = StreamSegMetrics::new(2);
        m.update(&[0, 1], &[0, 0]);
        let table = m.scores().to_table();
        assert!(table.contains("Mean IoU"));
        assert!(table.contains("class   1"));
    }
}
