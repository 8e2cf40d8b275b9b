//! Evaluation metrics for credences
//!
//! [`evaluate_preds`] scores `(n, v, k)` logits against `(n,)` labels under a
//! [`PromptEnsembling`] strategy: accuracy with a normal-approximation CI,
//! and for binary tasks calibrated accuracy, expected calibration error and
//! AUROC with a Hanley-McNeil CI.

use anyhow::Result;
use candle_core::{DType, Tensor, D};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use std::fmt;

use crate::error::ElkError;

/// Confidence level of every reported interval
const CONFIDENCE: f64 = 0.95;
/// Bins used for the expected calibration error
const ECE_BINS: usize = 10;

/// How predictions made under several prompt templates are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptEnsembling {
    /// Every (example, template) pair is scored on its own
    None,
    /// Probabilities are averaged over templates
    Partial,
    /// Logits are averaged over templates
    Full,
}

impl PromptEnsembling {
    /// Every strategy, in reporting order
    pub fn all() -> [PromptEnsembling; 3] {
        [Self::None, Self::Partial, Self::Full]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Partial => "partial",
            Self::Full => "full",
        }
    }
}

impl fmt::Display for PromptEnsembling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point estimate with a confidence interval
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub estimate: f64,
    pub lower: f64,
    pub upper: f64,
}

/// Metrics for one (dataset, layer, ensembling) cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalResult {
    pub accuracy: Interval,
    /// Accuracy with the threshold chosen to match the true positive rate
    pub cal_accuracy: Option<f64>,
    /// Expected calibration error
    pub ece: Option<f64>,
    pub roc_auc: Option<Interval>,
}

impl EvalResult {
    /// CSV columns produced by [`EvalResult::to_csv_fields`]
    pub fn csv_columns() -> Vec<String> {
        [
            "acc_estimate",
            "acc_lower",
            "acc_upper",
            "cal_acc_estimate",
            "ece",
            "auroc_estimate",
            "auroc_lower",
            "auroc_upper",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    pub fn to_csv_fields(&self) -> Vec<String> {
        let opt = |v: Option<f64>| v.map(|x| x.to_string()).unwrap_or_default();
        vec![
            self.accuracy.estimate.to_string(),
            self.accuracy.lower.to_string(),
            self.accuracy.upper.to_string(),
            opt(self.cal_accuracy),
            opt(self.ece),
            opt(self.roc_auc.map(|a| a.estimate)),
            opt(self.roc_auc.map(|a| a.lower)),
            opt(self.roc_auc.map(|a| a.upper)),
        ]
    }
}

fn z_score() -> f64 {
    Normal::new(0.0, 1.0)
        .map(|n| n.inverse_cdf(0.5 + CONFIDENCE / 2.0))
        .unwrap_or(1.96)
}

fn argmax(scores: &[f32]) -> usize {
    scores
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &s)| {
            if s > best.1 {
                (i, s)
            } else {
                best
            }
        })
        .0
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Evaluate `(n, v, k)` logits against `(n,)` labels
pub fn evaluate_preds(
    y_true: &Tensor,
    y_logits: &Tensor,
    ensembling: PromptEnsembling,
) -> Result<EvalResult> {
    let (n, v, k) = y_logits.dims3()?;
    let labels: Vec<u32> = y_true.to_dtype(DType::U32)?.to_vec1()?;
    if labels.len() != n {
        return Err(ElkError::InvalidShape {
            what: "labels".into(),
            detail: format!("{} labels for {n} examples", labels.len()),
        }
        .into());
    }

    let logits = y_logits.to_dtype(DType::F32)?;
    let (labels, scores): (Vec<usize>, Vec<Vec<f32>>) = match ensembling {
        PromptEnsembling::None => {
            let flat: Vec<Vec<f32>> = logits.reshape((n * v, k))?.to_vec2()?;
            let repeated = labels
                .iter()
                .flat_map(|&l| std::iter::repeat(l as usize).take(v))
                .collect();
            (repeated, flat)
        }
        PromptEnsembling::Partial => {
            let scores = log_mean_probs(&logits)?.to_vec2()?;
            (labels.iter().map(|&l| l as usize).collect(), scores)
        }
        PromptEnsembling::Full => {
            let scores = logits.mean(1)?.to_vec2()?;
            (labels.iter().map(|&l| l as usize).collect(), scores)
        }
    };

    for &label in &labels {
        if label >= k {
            return Err(ElkError::InvalidLabel {
                label,
                num_classes: k,
            }
            .into());
        }
    }

    Ok(score_predictions(&labels, &scores, k))
}

/// Log of the template-averaged probabilities of `(n, v, k)` logits.
///
/// Computed as a log-sum-exp over log-softmax values, so saturated logits
/// give large finite scores instead of `ln(0)`.
fn log_mean_probs(logits: &Tensor) -> Result<Tensor> {
    let v = logits.dim(1)?;
    let log_probs = candle_nn::ops::log_softmax(&logits.contiguous()?, D::Minus1)?;
    let max = log_probs.max_keepdim(1)?;
    let summed = log_probs
        .broadcast_sub(&max)?
        .exp()?
        .sum_keepdim(1)?
        .log()?
        .add(&max)?
        .squeeze(1)?;
    Ok((summed - (v as f64).ln())?)
}

fn score_predictions(labels: &[usize], scores: &[Vec<f32>], k: usize) -> EvalResult {
    let m = labels.len();
    let correct = labels
        .iter()
        .zip(scores)
        .filter(|(&l, s)| argmax(s) == l)
        .count();
    let accuracy = proportion_interval(correct, m);

    if k != 2 {
        return EvalResult {
            accuracy,
            cal_accuracy: None,
            ece: None,
            roc_auc: None,
        };
    }

    let margins: Vec<f64> = scores
        .iter()
        .map(|s| f64::from(s[1]) - f64::from(s[0]))
        .collect();
    let positives: Vec<bool> = labels.iter().map(|&l| l == 1).collect();

    EvalResult {
        accuracy,
        cal_accuracy: calibrated_accuracy(&positives, &margins),
        ece: expected_calibration_error(&positives, &margins),
        roc_auc: roc_auc(&positives, &margins),
    }
}

fn proportion_interval(successes: usize, total: usize) -> Interval {
    if total == 0 {
        return Interval {
            estimate: f64::NAN,
            lower: f64::NAN,
            upper: f64::NAN,
        };
    }
    let p = successes as f64 / total as f64;
    let half = z_score() * (p * (1.0 - p) / total as f64).sqrt();
    Interval {
        estimate: p,
        lower: (p - half).max(0.0),
        upper: (p + half).min(1.0),
    }
}

/// Linear-interpolation quantile of unsorted data
fn quantile(values: &[f64], q: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let (a, b) = (sorted[lo], sorted[hi]);
    let frac = pos - lo as f64;
    if frac == 0.0 || a == b {
        return a;
    }
    if !a.is_finite() || !b.is_finite() {
        // No interpolation across an infinity: take the nearer end
        return if frac < 0.5 { a } else { b };
    }
    a + (b - a) * frac
}

fn calibrated_accuracy(positives: &[bool], margins: &[f64]) -> Option<f64> {
    if margins.is_empty() {
        return None;
    }
    let pos_rate = positives.iter().filter(|&&p| p).count() as f64 / positives.len() as f64;
    let threshold = quantile(margins, 1.0 - pos_rate);
    let correct = positives
        .iter()
        .zip(margins)
        .filter(|(&p, &m)| (m > threshold) == p)
        .count();
    Some(correct as f64 / margins.len() as f64)
}

fn expected_calibration_error(positives: &[bool], margins: &[f64]) -> Option<f64> {
    if margins.is_empty() {
        return None;
    }
    let mut conf_sum = [0.0f64; ECE_BINS];
    let mut hit_sum = [0.0f64; ECE_BINS];
    let mut counts = [0usize; ECE_BINS];

    for (&pos, &margin) in positives.iter().zip(margins) {
        let prob = sigmoid(margin);
        let bin = ((prob * ECE_BINS as f64) as usize).min(ECE_BINS - 1);
        conf_sum[bin] += prob;
        hit_sum[bin] += f64::from(u8::from(pos));
        counts[bin] += 1;
    }

    let total = margins.len() as f64;
    let ece = (0..ECE_BINS)
        .filter(|&b| counts[b] > 0)
        .map(|b| {
            let c = counts[b] as f64;
            (c / total) * (hit_sum[b] / c - conf_sum[b] / c).abs()
        })
        .sum();
    Some(ece)
}

/// Mann-Whitney AUROC with average ranks for ties; `None` if a class is absent
pub fn roc_auc(positives: &[bool], scores: &[f64]) -> Option<Interval> {
    let n_pos = positives.iter().filter(|&&p| p).count();
    let n_neg = positives.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut rank_sum_pos = 0.0;
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        // 1-based average rank of the tie group
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            if positives[idx] {
                rank_sum_pos += avg_rank;
            }
        }
        i = j + 1;
    }

    let (p, n) = (n_pos as f64, n_neg as f64);
    let auc = (rank_sum_pos - p * (p + 1.0) / 2.0) / (p * n);

    let q1 = auc / (2.0 - auc);
    let q2 = 2.0 * auc * auc / (1.0 + auc);
    let var = (auc * (1.0 - auc) + (p - 1.0) * (q1 - auc * auc) + (n - 1.0) * (q2 - auc * auc))
        / (p * n);
    let half = z_score() * var.max(0.0).sqrt();

    Some(Interval {
        estimate: auc,
        lower: (auc - half).max(0.0),
        upper: (auc + half).min(1.0),
    })
}

/// One-hot encode labels: one row per label, a single 1 at the label index
pub fn to_one_hot(labels: &[usize], num_classes: usize) -> Result<Array2<usize>> {
    let mut one_hot = Array2::zeros((labels.len(), num_classes));
    for (row, &label) in labels.iter().enumerate() {
        if label >= num_classes {
            return Err(ElkError::InvalidLabel { label, num_classes }.into());
        }
        one_hot[[row, label]] = 1;
    }
    Ok(one_hot)
}
