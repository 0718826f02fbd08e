//! Classification metrics computed from raw prediction scores.
//!
//! Everything here is pure: no I/O, no tensors. Rendering lives in `crate::report`.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

/// Which metrics to compute
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Detail {
    /// Accuracy and macro-F1 only
    Summary,

    /// Adds per-class accuracy and F1 for every class present in the labels
    PerClass,
}

impl From<bool> for Detail {
    fn from(detailed: bool) -> Self {
        if detailed {
            Detail::PerClass
        } else {
            Detail::Summary
        }
    }
}

/// Metrics for a single class
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ClassMetrics {
    /// Accuracy over the rows whose true label is this class
    pub accuracy: f64,

    /// F1 treating this class as positive and all others as negative
    pub f1: f64,
}

/// The metrics of one evaluation pass
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Snapshot {
    /// Fraction of rows predicted correctly
    pub accuracy: f64,

    /// Unweighted mean of the per-class F1 scores
    pub f1: f64,

    /// Per-class metrics keyed by class id, only for classes seen in the labels
    pub per_class: BTreeMap<usize, ClassMetrics>,
}

impl Snapshot {
    /// Named values in reporting order: accuracy, f1, every `f1_class_{c}`, then
    /// every `accuracy_class_{c}`
    pub fn entries(&self) -> Vec<(String, f64)> {
        let mut entries = vec![
            ("accuracy".to_string(), self.accuracy),
            ("f1".to_string(), self.f1),
        ];

        entries.extend(
            self.per_class
                .iter()
                .map(|(class, m)| (format!("f1_class_{class}"), m.f1)),
        );
        entries.extend(
            self.per_class
                .iter()
                .map(|(class, m)| (format!("accuracy_class_{class}"), m.accuracy)),
        );

        entries
    }

    /// Look a value up by its reported name
    pub fn get(&self, name: &str) -> Option<f64> {
        self.entries()
            .into_iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }
}

/// Metric Error
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum MetricError {
    /// Nothing to evaluate
    #[error("no predictions to evaluate")]
    Empty,

    /// Scores and labels disagree on the number of rows
    #[error("{scores} score rows for {labels} labels")]
    LengthMismatch {
        /// Rows of scores
        scores: usize,
        /// Number of labels
        labels: usize,
    },

    /// A score row has a different number of classes from the first one
    #[error("score row {row} has {found} classes, expected {expected}")]
    Ragged {
        /// The offending row
        row: usize,
        /// Classes in that row
        found: usize,
        /// Classes in the first row
        expected: usize,
    },
}

/// Index of the highest score, the first one on ties
pub fn argmax(scores: &[f32]) -> usize {
    scores
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, max), (i, &score)| {
            if score > max {
                (i, score)
            } else {
                (best, max)
            }
        })
        .0
}

/// Compute metrics from a `[N x C]` score matrix and `N` true class ids
pub fn compute(
    scores: &[Vec<f32>],
    labels: &[usize],
    detail: Detail,
) -> Result<Snapshot, MetricError> {
    if scores.len() != labels.len() {
        return Err(MetricError::LengthMismatch {
            scores: scores.len(),
            labels: labels.len(),
        });
    }
    if labels.is_empty() {
        return Err(MetricError::Empty);
    }

    let expected = scores[0].len();
    if let Some((row, found)) = scores
        .iter()
        .map(Vec::len)
        .enumerate()
        .find(|(_, len)| *len != expected)
    {
        return Err(MetricError::Ragged {
            row,
            found,
            expected,
        });
    }

    let predictions: Vec<usize> = scores.iter().map(|row| argmax(row)).collect();

    Ok(from_predictions(&predictions, labels, detail))
}

/// Compute metrics from predicted and true class ids of equal, non-zero length
pub fn from_predictions(predictions: &[usize], labels: &[usize], detail: Detail) -> Snapshot {
    let total = labels.len() as f64;
    let correct = predictions
        .iter()
        .zip(labels)
        .filter(|(p, l)| p == l)
        .count() as f64;

    // Macro-F1 averages over every class seen in either the labels or the predictions
    let classes: BTreeSet<usize> = labels.iter().chain(predictions).copied().collect();
    let f1_scores: BTreeMap<usize, f64> = classes
        .iter()
        .map(|&class| (class, class_f1(predictions, labels, class)))
        .collect();
    let f1 = f1_scores.values().sum::<f64>() / f1_scores.len() as f64;

    let per_class = match detail {
        Detail::Summary => BTreeMap::new(),
        Detail::PerClass => labels
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|class| {
                let metrics = ClassMetrics {
                    accuracy: class_accuracy(predictions, labels, class),
                    f1: f1_scores[&class],
                };
                (class, metrics)
            })
            .collect(),
    };

    Snapshot {
        accuracy: correct / total,
        f1,
        per_class,
    }
}

fn class_f1(predictions: &[usize], labels: &[usize], class: usize) -> f64 {
    let (mut tp, mut fp, mut fn_) = (0usize, 0usize, 0usize);

    for (&p, &l) in predictions.iter().zip(labels) {
        match (p == class, l == class) {
            (true, true) => tp += 1,
            (true, false) => fp += 1,
            (false, true) => fn_ += 1,
            (false, false) => {}
        }
    }

    // Equivalent to 2PR / (P + R), and 0 instead of 0/0
    let denominator = 2 * tp + fp + fn_;
    if tp == 0 || denominator == 0 {
        0.0
    } else {
        (2 * tp) as f64 / denominator as f64
    }
}

fn class_accuracy(predictions: &[usize], labels: &[usize], class: usize) -> f64 {
    let (hits, count) = predictions
        .iter()
        .zip(labels)
        .filter(|(_, &l)| l == class)
        .fold((0usize, 0usize), |(hits, count), (&p, &l)| {
            (hits + usize::from(p == l), count + 1)
        });

    if count == 0 {
        0.0
    } else {
        hits as f64 / count as f64
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn one_hot(classes: usize, predictions: &[usize]) -> Vec<Vec<f32>> {
        predictions
            .iter()
            .map(|&p| {
                let mut row = vec![0.0; classes];
                row[p] = 1.0;
                row
            })
            .collect()
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn accuracy_is_the_fraction_of_correct_argmax() {
        let scores = vec![
            vec![0.9, 0.1, 0.0],
            vec![0.2, 0.7, 0.1],
            vec![0.1, 0.1, 0.8],
            vec![0.6, 0.3, 0.1],
        ];
        let labels = [0, 1, 1, 2];

        let snapshot = compute(&scores, &labels, Detail::Summary).unwrap();

        assert!(close(snapshot.accuracy, 0.5));
        assert!(snapshot.per_class.is_empty());
    }

    #[test]
    fn macro_f1_matches_hand_computation() {
        // predictions: 0 1 2 0, labels: 0 1 1 2
        // class 0: tp1 fp1 fn0 -> 2/3, class 1: tp1 fp0 fn1 -> 2/3, class 2: tp0 -> 0
        let snapshot = from_predictions(&[0, 1, 2, 0], &[0, 1, 1, 2], Detail::Summary);

        assert!(close(snapshot.f1, (2.0 / 3.0 + 2.0 / 3.0) / 3.0));
    }

    #[test]
    fn macro_f1_counts_classes_only_predicted() {
        // class 3 never appears in the labels but is predicted once
        let snapshot = from_predictions(&[0, 3], &[0, 0], Detail::Summary);

        // class 0: tp1 fp0 fn1 -> 2/3, class 3: 0
        assert!(close(snapshot.f1, (2.0 / 3.0) / 2.0));
    }

    #[test]
    fn macro_f1_is_invariant_to_relabeling() {
        let predictions = [0, 1, 2, 2, 1, 0, 0];
        let labels = [0, 1, 1, 2, 2, 0, 1];
        let rename = |c: usize| [5, 3, 9][c];

        let original = from_predictions(&predictions, &labels, Detail::Summary);
        let renamed = from_predictions(
            &predictions.map(rename),
            &labels.map(rename),
            Detail::Summary,
        );

        assert!(close(original.f1, renamed.f1));
        assert!(close(original.accuracy, renamed.accuracy));
    }

    #[test]
    fn detailed_mode_only_reports_observed_labels() {
        let scores = one_hot(7, &[0, 0, 4, 4]);
        let labels = [0, 4, 4, 4];

        let snapshot = compute(&scores, &labels, Detail::PerClass).unwrap();

        assert_eq!(snapshot.per_class.keys().copied().collect::<Vec<_>>(), vec![0, 4]);
        assert!(close(snapshot.per_class[&0].accuracy, 1.0));
        assert!(close(snapshot.per_class[&4].accuracy, 2.0 / 3.0));
        assert!(snapshot.get("f1_class_1").is_none());
        assert!(snapshot.entries().iter().all(|(_, v)| v.is_finite()));
    }

    #[test]
    fn entries_follow_reporting_order() {
        let snapshot = from_predictions(&[0, 1], &[0, 1], Detail::PerClass);

        let names: Vec<String> = snapshot.entries().into_iter().map(|(k, _)| k).collect();

        assert_eq!(
            names,
            vec![
                "accuracy",
                "f1",
                "f1_class_0",
                "f1_class_1",
                "accuracy_class_0",
                "accuracy_class_1"
            ]
        );
    }

    #[test]
    fn argmax_prefers_the_first_maximum() {
        assert_eq!(argmax(&[0.1, 0.5, 0.5]), 1);
        assert_eq!(argmax(&[-3.0, -1.0, -2.0]), 1);
    }

    #[test]
    fn rejects_bad_shapes() {
        assert_eq!(
            compute(&[], &[], Detail::Summary),
            Err(MetricError::Empty)
        );
        assert_eq!(
            compute(&[vec![1.0]], &[0, 1], Detail::Summary),
            Err(MetricError::LengthMismatch {
                scores: 1,
                labels: 2
            })
        );
        assert_eq!(
            compute(&[vec![1.0, 0.0], vec![1.0]], &[0, 1], Detail::Summary),
            Err(MetricError::Ragged {
                row: 1,
                found: 1,
                expected: 2
            })
        );
    }
}
