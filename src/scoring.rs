//! Option scoring and evaluation metrics
//!
//! Each option's score is the summed loss of its rows; the prediction is
//! the option with the lowest loss. Classification tasks are scored by
//! macro-F1 over the ground-truth classes, everything else by accuracy.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{MetaIclError, Result};
use crate::tensorize::ExampleMetadata;

/// Expected answer for one test example
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Groundtruth {
    Single(String),
    /// Any of several acceptable answers
    AnyOf(Vec<String>),
}

impl Groundtruth {
    /// Whether a prediction matches, ignoring surrounding whitespace
    pub fn matches(&self, prediction: &str) -> bool {
        let prediction = prediction.trim();
        match self {
            Groundtruth::Single(answer) => answer.trim() == prediction,
            Groundtruth::AnyOf(answers) => answers.iter().any(|a| a.trim() == prediction),
        }
    }

    /// Class label used for per-class recall
    pub fn class_label(&self) -> String {
        match self {
            Groundtruth::Single(answer) => answer.trim().to_string(),
            Groundtruth::AnyOf(answers) => answers
                .iter()
                .map(|a| a.trim())
                .collect::<Vec<_>>()
                .join("|"),
        }
    }
}

impl From<&str> for Groundtruth {
    fn from(answer: &str) -> Self {
        Groundtruth::Single(answer.to_string())
    }
}

impl From<String> for Groundtruth {
    fn from(answer: String) -> Self {
        Groundtruth::Single(answer)
    }
}

/// Turns per-row losses into predictions
pub struct ScoreAggregator;

impl ScoreAggregator {
    /// Index of the lowest-loss option per test example (first one on ties)
    pub fn predict_indices(losses: &[f32], metadata: &[ExampleMetadata]) -> Result<Vec<usize>> {
        metadata
            .iter()
            .map(|example| {
                let mut best: Option<(usize, f32)> = None;
                for (option_idx, rows) in example.indices.iter().enumerate() {
                    let total = rows
                        .iter()
                        .map(|&row| {
                            losses.get(row).copied().ok_or_else(|| {
                                MetaIclError::validation(format!(
                                    "Row {row} has no loss ({} losses given)",
                                    losses.len()
                                ))
                            })
                        })
                        .sum::<Result<f32>>()?;
                    if best.map_or(true, |(_, b)| total < b) {
                        best = Some((option_idx, total));
                    }
                }
                best.map(|(idx, _)| idx)
                    .ok_or_else(|| MetaIclError::validation("Test example without options"))
            })
            .collect()
    }

    /// Predicted option text (stripped) per test example
    pub fn aggregate(losses: &[f32], metadata: &[ExampleMetadata]) -> Result<Vec<String>> {
        let indices = Self::predict_indices(losses, metadata)?;
        Ok(indices
            .into_iter()
            .zip(metadata)
            .map(|(idx, example)| example.options[idx].trim().to_string())
            .collect())
    }

    /// Predictions plus their score against the ground truths
    pub fn aggregate_and_evaluate(
        losses: &[f32],
        metadata: &[ExampleMetadata],
        groundtruths: &[Groundtruth],
        is_classification: bool,
    ) -> Result<(Vec<String>, f64)> {
        let predictions = Self::aggregate(losses, metadata)?;
        let score = evaluate(&predictions, groundtruths, is_classification)?;
        Ok((predictions, score))
    }
}

fn mean(values: &[bool]) -> f64 {
    values.iter().filter(|&&v| v).count() as f64 / values.len() as f64
}

/// Accuracy, or macro-F1 over ground-truth classes when `is_classification`.
///
/// Precision of a class that was never predicted counts as 1.0.
pub fn evaluate(predictions: &[String], groundtruths: &[Groundtruth], is_classification: bool) -> Result<f64> {
    if predictions.len() != groundtruths.len() {
        return Err(MetaIclError::validation(format!(
            "{} predictions for {} ground truths",
            predictions.len(),
            groundtruths.len()
        )));
    }
    if predictions.is_empty() {
        return Err(MetaIclError::validation("Nothing to evaluate"));
    }

    let mut accs = Vec::with_capacity(predictions.len());
    let mut precisions: BTreeMap<String, Vec<bool>> = BTreeMap::new();
    let mut recalls: BTreeMap<String, Vec<bool>> = BTreeMap::new();
    for (prediction, groundtruth) in predictions.iter().zip(groundtruths) {
        let is_correct = groundtruth.matches(prediction);
        accs.push(is_correct);
        if is_classification {
            recalls
                .entry(groundtruth.class_label())
                .or_default()
                .push(is_correct);
            precisions
                .entry(prediction.trim().to_string())
                .or_default()
                .push(is_correct);
        }
    }

    if !is_classification {
        return Ok(mean(&accs));
    }

    let f1s: Vec<f64> = recalls
        .iter()
        .map(|(class, hits)| {
            let precision = precisions.get(class).map_or(1.0, |p| mean(p));
            let recall = mean(hits);
            if precision + recall == 0.0 {
                0.0
            } else {
                2.0 * precision * recall / (precision + recall)
            }
        })
        .collect();
    Ok(f1s.iter().sum::<f64>() / f1s.len() as f64)
}

/// Subtract the losses of a null-input run from the real losses
pub fn calibrate(losses: &[f32], null_losses: &[f32]) -> Result<Vec<f32>> {
    if losses.len() != null_losses.len() {
        return Err(MetaIclError::validation(format!(
            "Calibration needs matching losses: {} vs {}",
            losses.len(),
            null_losses.len()
        )));
    }
    Ok(losses.iter().zip(null_losses).map(|(l, n)| l - n).collect())
}
