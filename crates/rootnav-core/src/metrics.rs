//! Segmentation metrics for validation passes.
//!
//! This module provides:
//! - A confusion-matrix accumulator over flattened pixel predictions
//! - Derived scores (pixel accuracy, mean accuracy, mean IoU, frequency-weighted IoU)
//! - A running average meter for scalar losses and timings

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Aggregate scores derived from a confusion matrix
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Scores {
    /// Fraction of pixels classified correctly
    pub overall_accuracy: f64,
    /// Mean per-class recall over classes present in the ground truth
    pub mean_accuracy: f64,
    /// Mean IoU over classes with any ground-truth or predicted pixel
    pub mean_iou: f64,
    /// IoU weighted by ground-truth class frequency
    pub frequency_weighted_iou: f64,
}

impl Scores {
    /// Named entries in a stable order, for logging.
    pub fn entries(&self) -> [(&'static str, f64); 4] {
        [
            ("Overall Acc", self.overall_accuracy),
            ("Mean Acc", self.mean_accuracy),
            ("FreqW Acc", self.frequency_weighted_iou),
            ("Mean IoU", self.mean_iou),
        ]
    }
}

/// Running confusion matrix (ground truth x prediction).
///
/// Counts are integers so arbitrarily long passes accumulate exactly.
/// Class indices outside `[0, n_classes)` are clipped to the nearest valid
/// class instead of being rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningScore {
    n_classes: usize,
    confusion: Vec<u64>,
}

impl RunningScore {
    /// Creates an empty accumulator.
    pub fn new(n_classes: usize) -> Self {
        Self {
            n_classes,
            confusion: vec![0; n_classes * n_classes],
        }
    }

    /// Number of classes tracked.
    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    fn clip(&self, class: i64) -> usize {
        class.clamp(0, self.n_classes as i64 - 1) as usize
    }

    /// Accumulates one batch of flattened labels and predictions.
    pub fn update(&mut self, ground_truth: &[i64], prediction: &[i64]) -> Result<()> {
        if ground_truth.len() != prediction.len() {
            return Err(Error::ShapeMismatch(format!(
                "{} ground-truth pixels but {} predicted pixels",
                ground_truth.len(),
                prediction.len()
            )));
        }
        if self.n_classes == 0 {
            return Ok(());
        }

        for (&actual, &predicted) in ground_truth.iter().zip(prediction) {
            let row = self.clip(actual);
            let col = self.clip(predicted);
            self.confusion[row * self.n_classes + col] += 1;
        }

        Ok(())
    }

    /// Count of pixels with ground truth `actual` predicted as `predicted`.
    pub fn count(&self, actual: usize, predicted: usize) -> u64 {
        self.confusion[actual * self.n_classes + predicted]
    }

    /// Confusion matrix as rows of ground-truth classes.
    pub fn confusion_matrix(&self) -> Vec<Vec<u64>> {
        self.confusion
            .chunks(self.n_classes.max(1))
            .map(|row| row.to_vec())
            .collect()
    }

    /// Total number of pixels accumulated.
    pub fn total(&self) -> u64 {
        self.confusion.iter().sum()
    }

    /// Computes aggregate scores and per-class IoU.
    ///
    /// Per-class IoU only contains classes that appear in the ground truth or
    /// the predictions; an empty accumulator yields all-zero scores.
    pub fn get_scores(&self) -> (Scores, BTreeMap<usize, f64>) {
        let n = self.n_classes;
        let total = self.total();
        let mut class_iou = BTreeMap::new();

        if total == 0 {
            return (Scores::default(), class_iou);
        }

        let diag: Vec<u64> = (0..n).map(|i| self.count(i, i)).collect();
        let gt_counts: Vec<u64> = (0..n)
            .map(|i| (0..n).map(|j| self.count(i, j)).sum())
            .collect();
        let pred_counts: Vec<u64> = (0..n)
            .map(|j| (0..n).map(|i| self.count(i, j)).sum())
            .collect();

        let overall_accuracy = diag.iter().sum::<u64>() as f64 / total as f64;

        let recalls: Vec<f64> = (0..n)
            .filter(|&i| gt_counts[i] > 0)
            .map(|i| diag[i] as f64 / gt_counts[i] as f64)
            .collect();
        let mean_accuracy = mean(&recalls);

        let mut frequency_weighted_iou = 0.0;
        for i in 0..n {
            let union = gt_counts[i] + pred_counts[i] - diag[i];
            if union == 0 {
                continue;
            }
            let iou = diag[i] as f64 / union as f64;
            class_iou.insert(i, iou);

            let frequency = gt_counts[i] as f64 / total as f64;
            frequency_weighted_iou += frequency * iou;
        }
        let mean_iou = mean(&class_iou.values().copied().collect::<Vec<_>>());

        let scores = Scores {
            overall_accuracy,
            mean_accuracy,
            mean_iou,
            frequency_weighted_iou,
        };

        (scores, class_iou)
    }

    /// Zeroes the confusion matrix.
    pub fn reset(&mut self) {
        self.confusion.iter_mut().for_each(|count| *count = 0);
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Running average of a scalar such as a loss or a step duration
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AverageMeter {
    /// Most recent value
    pub val: f64,
    /// Weighted sum of all values
    pub sum: f64,
    /// Total weight
    pub count: u64,
    /// Current average
    pub avg: f64,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `value` with weight `n`.
    pub fn update(&mut self, value: f64, n: u64) {
        self.val = value;
        self.sum += value * n as f64;
        self.count += n;
        self.avg = if self.count > 0 {
            self.sum / self.count as f64
        } else {
            0.0
        };
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_prediction() {
        let mut score = RunningScore::new(3);
        let labels = [0, 1, 2, 2, 1, 0];
        score.update(&labels, &labels).unwrap();

        let (scores, class_iou) = score.get_scores();
        assert_eq!(scores.overall_accuracy, 1.0);
        assert_eq!(scores.mean_accuracy, 1.0);
        assert_eq!(scores.mean_iou, 1.0);
        assert!((scores.frequency_weighted_iou - 1.0).abs() < 1e-12);
        assert_eq!(class_iou.len(), 3);
    }

    #[test]
    fn test_scores_from_known_matrix() {
        let mut score = RunningScore::new(2);
        // gt:   0 0 0 1
        // pred: 0 0 1 1
        score.update(&[0, 0, 0, 1], &[0, 0, 1, 1]).unwrap();

        let (scores, class_iou) = score.get_scores();
        assert!((scores.overall_accuracy - 0.75).abs() < 1e-12);
        // recall: 2/3 and 1/1
        assert!((scores.mean_accuracy - (2.0 / 3.0 + 1.0) / 2.0).abs() < 1e-12);
        // iou: 2/3 and 1/2
        assert!((class_iou[&0] - 2.0 / 3.0).abs() < 1e-12);
        assert!((class_iou[&1] - 0.5).abs() < 1e-12);
        assert!((scores.mean_iou - (2.0 / 3.0 + 0.5) / 2.0).abs() < 1e-12);
        let fwiou = 0.75 * (2.0 / 3.0) + 0.25 * 0.5;
        assert!((scores.frequency_weighted_iou - fwiou).abs() < 1e-12);
    }

    #[test]
    fn test_mean_iou_skips_unobserved_classes() {
        let mut score = RunningScore::new(6);
        score.update(&[0, 0, 1, 1], &[0, 0, 1, 1]).unwrap();

        let (scores, class_iou) = score.get_scores();
        assert_eq!(scores.mean_iou, 1.0);
        assert_eq!(class_iou.keys().copied().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_reset_is_idempotent() {
        let fresh = RunningScore::new(4).get_scores();

        let mut score = RunningScore::new(4);
        score.update(&[0, 1, 2, 3, 3], &[1, 1, 2, 0, 3]).unwrap();
        score.update(&[2, 2], &[2, 3]).unwrap();
        score.reset();
        assert_eq!(score.get_scores(), fresh);

        score.reset();
        assert_eq!(score.get_scores(), fresh);
        assert_eq!(score, RunningScore::new(4));
    }

    #[test]
    fn test_accumulation_is_additive() {
        let a = ([0, 1, 2, 2], [0, 2, 2, 1]);
        let b = ([1, 1, 0, 2, 2], [1, 0, 0, 2, 2]);

        let mut ab = RunningScore::new(3);
        ab.update(&a.0, &a.1).unwrap();
        ab.update(&b.0, &b.1).unwrap();

        let mut ba = RunningScore::new(3);
        ba.update(&b.0, &b.1).unwrap();
        ba.update(&a.0, &a.1).unwrap();

        let mut joined = RunningScore::new(3);
        let gt: Vec<i64> = a.0.iter().chain(b.0.iter()).copied().collect();
        let pred: Vec<i64> = a.1.iter().chain(b.1.iter()).copied().collect();
        joined.update(&gt, &pred).unwrap();

        assert_eq!(ab.confusion_matrix(), ba.confusion_matrix());
        assert_eq!(ab.confusion_matrix(), joined.confusion_matrix());
        assert_eq!(ab.total(), 9);
    }

    #[test]
    fn test_out_of_range_labels_are_clipped() {
        let mut score = RunningScore::new(3);
        score.update(&[-1, 7, 255, 1], &[0, 2, 9, -4]).unwrap();

        let matrix = score.confusion_matrix();
        assert_eq!(matrix.len(), 3);
        assert!(matrix.iter().all(|row| row.len() == 3));
        assert_eq!(score.total(), 4);
        assert_eq!(score.count(0, 0), 1);
        assert_eq!(score.count(2, 2), 2);
        assert_eq!(score.count(1, 0), 1);
    }

    #[test]
    fn test_length_mismatch_is_rejected() {
        let mut score = RunningScore::new(3);
        let result = score.update(&[0, 1], &[0]);
        assert!(matches!(result, Err(Error::ShapeMismatch(_))));
        assert_eq!(score.total(), 0);
    }

    #[test]
    fn test_average_meter() {
        let mut meter = AverageMeter::new();
        meter.update(2.0, 1);
        meter.update(4.0, 3);
        assert_eq!(meter.val, 4.0);
        assert_eq!(meter.count, 4);
        assert!((meter.avg - 3.5).abs() < 1e-12);

        meter.reset();
        assert_eq!(meter, AverageMeter::default());
    }
}
