//! Linear probes with linfa
//!
//! A [`Classifier`] is a logistic regression `w·x + b` over single
//! activation vectors. It can be fit once, with a cross-validated L2
//! penalty, or as an INLP sequence where every probe is trained on the
//! null space of the directions found before it.

use anyhow::{Context, Result};
use candle_core::{DType, Tensor, D};
use linfa::prelude::*;
use linfa_logistic::LogisticRegression;
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::SupervisedOptions;
use crate::error::ElkError;

/// Exponent range of the L2 grid searched by [`Classifier::fit_cv`]
const CV_PENALTY_EXPONENTS: (f64, f64) = (-4.0, 4.0);
/// Directions shorter than this after orthogonalization are dropped
const MIN_DIRECTION_NORM: f64 = 1e-10;

/// A fitted linear probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classifier {
    weight: Vec<f64>,
    bias: f64,
    /// L2 penalty the probe was fit with
    #[serde(default)]
    l2_penalty: f64,
}

/// Output of [`Classifier::inlp`]
#[derive(Debug, Clone)]
pub struct InlpResult {
    /// Probes in training order
    pub classifiers: Vec<Classifier>,
    /// Training cross-entropy of each probe on its projected data
    pub losses: Vec<f64>,
}

impl Classifier {
    /// Build a probe from raw parameters
    pub fn new(weight: Vec<f64>, bias: f64) -> Self {
        Self {
            weight,
            bias,
            l2_penalty: 0.0,
        }
    }

    pub fn input_dim(&self) -> usize {
        self.weight.len()
    }

    pub fn weight(&self) -> &[f64] {
        &self.weight
    }

    pub fn bias(&self) -> f64 {
        self.bias
    }

    pub fn l2_penalty(&self) -> f64 {
        self.l2_penalty
    }

    /// Fit a logistic regression on `(rows, features)` data with 0/1 targets
    pub fn fit(
        x: &Array2<f64>,
        y: &Array1<usize>,
        l2_penalty: f64,
        max_iterations: u64,
    ) -> Result<Self> {
        debug!(
            "Training probe: {} samples, {} features, l2 {}",
            x.nrows(),
            x.ncols(),
            l2_penalty
        );

        let dataset = Dataset::new(x.clone(), y.clone());
        let model = LogisticRegression::default()
            .alpha(l2_penalty)
            .max_iterations(max_iterations)
            .fit(&dataset)
            .context("Failed to train logistic regression")?;

        let mut probe = Self {
            weight: model.params().to_vec(),
            bias: model.intercept(),
            l2_penalty,
        };

        // linfa picks its own positive class; flip so that w·x + b > 0 means 1
        let predictions = model.predict(x);
        let scores = probe.logits(x)?;
        let agreeing = predictions
            .iter()
            .zip(scores.iter())
            .filter(|(&p, &z)| (p == 1) == (z > 0.0))
            .count();
        if agreeing * 2 < predictions.len() {
            probe.weight.iter_mut().for_each(|w| *w = -*w);
            probe.bias = -probe.bias;
        }

        Ok(probe)
    }

    /// Fit with the L2 penalty that minimizes K-fold held-out cross-entropy
    pub fn fit_cv(
        x: &Array2<f64>,
        y: &Array1<usize>,
        opts: &SupervisedOptions,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let n = x.nrows();
        let folds = opts.cv_folds.clamp(2, n.max(2));
        anyhow::ensure!(n >= folds, "Need at least {folds} rows for CV, got {n}");

        let mut indices: Vec<usize> = (0..n).collect();
        indices.shuffle(rng);

        let penalties = log_spaced(CV_PENALTY_EXPONENTS, opts.num_penalties);
        let mut best: Option<(f64, f64)> = None;

        for &penalty in &penalties {
            let mut loss = 0.0;
            for fold in 0..folds {
                let mut train_idx = Vec::with_capacity(n);
                let mut val_idx = Vec::with_capacity(n / folds + 1);
                for (pos, &i) in indices.iter().enumerate() {
                    if pos % folds == fold {
                        val_idx.push(i);
                    } else {
                        train_idx.push(i);
                    }
                }

                let probe = Self::fit(
                    &x.select(Axis(0), &train_idx),
                    &y.select(Axis(0), &train_idx),
                    penalty,
                    opts.max_iterations,
                )?;
                loss += probe.cross_entropy(
                    &x.select(Axis(0), &val_idx),
                    &y.select(Axis(0), &val_idx),
                )?;
            }
            loss /= folds as f64;
            debug!("CV l2 {penalty:.2e}: mean held-out loss {loss:.4}");

            if best.map_or(true, |(best_loss, _)| loss < best_loss) {
                best = Some((loss, penalty));
            }
        }

        let (loss, penalty) = best.context("Empty penalty grid")?;
        info!("CV selected l2 penalty {penalty:.2e} (loss {loss:.4})");
        Self::fit(x, y, penalty, opts.max_iterations)
    }

    /// Iterative null-space projection: `opts.inlp_iterations` probes, each
    /// trained after projecting out every earlier probe's direction
    pub fn inlp(x: &Array2<f64>, y: &Array1<usize>, opts: &SupervisedOptions) -> Result<InlpResult> {
        let mut x = x.clone();
        let mut basis: Vec<Array1<f64>> = Vec::new();
        let mut classifiers = Vec::with_capacity(opts.inlp_iterations);
        let mut losses = Vec::with_capacity(opts.inlp_iterations);

        for iter in 0..opts.inlp_iterations {
            let probe = Self::fit(&x, y, opts.l2_penalty, opts.max_iterations)?;
            let loss = probe.cross_entropy(&x, y)?;
            debug!("INLP iteration {iter}: loss {loss:.4}");

            let mut direction = Array1::from(probe.weight.clone());
            for b in &basis {
                let overlap = direction.dot(b);
                direction.scaled_add(-overlap, b);
            }

            let norm = direction.dot(&direction).sqrt();
            if norm > MIN_DIRECTION_NORM {
                direction /= norm;
                let coeffs = x.dot(&direction);
                for (mut row, &c) in x.rows_mut().into_iter().zip(coeffs.iter()) {
                    row.scaled_add(-c, &direction);
                }
                basis.push(direction);
            } else {
                warn!("INLP iteration {iter}: no direction left to project out");
            }

            classifiers.push(probe);
            losses.push(loss);
        }

        Ok(InlpResult {
            classifiers,
            losses,
        })
    }

    /// Scores `w·x + b` for `(rows, features)` data
    pub fn logits(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        if x.ncols() != self.input_dim() {
            return Err(ElkError::DimensionMismatch {
                expected: self.input_dim(),
                actual: x.ncols(),
            }
            .into());
        }
        let w = Array1::from(self.weight.clone());
        Ok(x.dot(&w) + self.bias)
    }

    /// Mean binary cross-entropy of the probe on 0/1 targets
    pub fn cross_entropy(&self, x: &Array2<f64>, y: &Array1<usize>) -> Result<f64> {
        let z = self.logits(x)?;
        if z.is_empty() {
            return Ok(0.0);
        }
        let total: f64 = z
            .iter()
            .zip(y.iter())
            .map(|(&z, &t)| softplus(z) - if t == 1 { z } else { 0.0 })
            .sum();
        Ok(total / z.len() as f64)
    }

    /// Score hidden states `(n, v, k, d)`, returning logits `(n, v, k)`
    pub fn credences(&self, hiddens: &Tensor) -> Result<Tensor> {
        let d = hiddens.dim(D::Minus1)?;
        if d != self.input_dim() {
            return Err(ElkError::DimensionMismatch {
                expected: self.input_dim(),
                actual: d,
            }
            .into());
        }
        let weight: Vec<f32> = self.weight.iter().map(|&w| w as f32).collect();
        let weight = Tensor::from_vec(weight, (d,), hiddens.device())?;
        let scores = hiddens
            .to_dtype(DType::F32)?
            .broadcast_mul(&weight)?
            .sum(D::Minus1)?
            .affine(1.0, self.bias)?;
        Ok(scores)
    }
}

fn softplus(z: f64) -> f64 {
    z.max(0.0) + (-z.abs()).exp().ln_1p()
}

/// `num` values `10^e`, `e` evenly spaced over the given exponent range
fn log_spaced((lo, hi): (f64, f64), num: usize) -> Vec<f64> {
    match num {
        0 => vec![],
        1 => vec![10f64.powf((lo + hi) / 2.0)],
        _ => (0..num)
            .map(|i| 10f64.powf(lo + (hi - lo) * i as f64 / (num - 1) as f64))
            .collect(),
    }
}
