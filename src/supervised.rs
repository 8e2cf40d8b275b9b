//! Supervised baselines: training, persistence and loading
//!
//! Probes for a layer live in `lr_models/layer_{layer}.json`. Older runs
//! stored a single probe object there, newer ones a list; loading always
//! yields a list.

use anyhow::{Context, Result};
use candle_core::{DType, Tensor};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::classifier::Classifier;
use crate::config::{SupervisedMode, SupervisedOptions};
use crate::metrics::to_one_hot;
use crate::run::LayerData;

/// Path of the probe file for a layer
pub fn probe_path(lr_dir: &Path, layer: usize) -> PathBuf {
    lr_dir.join(format!("layer_{layer}.json"))
}

/// Flatten `(n, v, k, d)` hidden states into an `(n·v·k, d)` matrix
pub fn flatten_hiddens(hiddens: &Tensor) -> Result<Array2<f64>> {
    let (n, v, k, d) = hiddens.dims4()?;
    let flat: Vec<f32> = hiddens.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    let flat: Vec<f64> = flat.into_iter().map(f64::from).collect();
    Array2::from_shape_vec((n * v * k, d), flat).context("Failed to create feature matrix")
}

/// Per-row 0/1 targets matching [`flatten_hiddens`]: labels are repeated over
/// the `v` variants, one-hot encoded over `k` statements and flattened
pub fn flatten_labels(labels: &Tensor, v: usize, k: usize) -> Result<Array1<usize>> {
    let labels: Vec<u32> = labels.to_dtype(DType::U32)?.to_vec1()?;
    let repeated: Vec<usize> = labels
        .iter()
        .flat_map(|&l| std::iter::repeat(l as usize).take(v))
        .collect();
    let one_hot = to_one_hot(&repeated, k)?;
    Ok(one_hot.iter().copied().collect())
}

/// Train supervised probes on the pooled training data of every dataset.
///
/// `mode` is one of `single`, `cv` or `inlp`; `cv` and `single` return one
/// probe, `inlp` returns `opts.inlp_iterations` of them.
pub fn train_supervised(
    data: &BTreeMap<String, LayerData>,
    mode: &str,
    opts: &SupervisedOptions,
    rng: &mut StdRng,
) -> Result<Vec<Classifier>> {
    let mode: SupervisedMode = mode.parse()?;

    let mut xs = Vec::with_capacity(data.len());
    let mut ys = Vec::with_capacity(data.len());
    for (name, layer_data) in data {
        let (_, v, k, _) = layer_data.hiddens.dims4()?;
        let x = flatten_hiddens(&layer_data.hiddens)?;
        let y = flatten_labels(&layer_data.labels, v, k)?;
        debug!("{name}: {} rows of width {}", x.nrows(), x.ncols());
        xs.push(x);
        ys.push(y);
    }

    let x_views: Vec<_> = xs.iter().map(|x| x.view()).collect();
    let y_views: Vec<_> = ys.iter().map(|y| y.view()).collect();
    let x = ndarray::concatenate(ndarray::Axis(0), &x_views)
        .context("Hidden sizes differ across datasets")?;
    let y = ndarray::concatenate(ndarray::Axis(0), &y_views)?;

    info!(
        "Training {mode} supervised probe on {} rows, {} features",
        x.nrows(),
        x.ncols()
    );

    match mode {
        SupervisedMode::Cv => Ok(vec![Classifier::fit_cv(&x, &y, opts, rng)?]),
        SupervisedMode::Inlp => Ok(Classifier::inlp(&x, &y, opts)?.classifiers),
        SupervisedMode::Single => Ok(vec![Classifier::fit(
            &x,
            &y,
            opts.l2_penalty,
            opts.max_iterations,
        )?]),
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum StoredProbes {
    Many(Vec<Classifier>),
    One(Classifier),
}

/// Persist a layer's probes as a JSON list
pub fn save_probes(lr_dir: &Path, layer: usize, probes: &[Classifier]) -> Result<()> {
    std::fs::create_dir_all(lr_dir)?;
    let path = probe_path(lr_dir, layer);
    std::fs::write(&path, serde_json::to_string(probes)?)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Load a layer's probes; `None` when no probe file exists
pub fn load_probes(lr_dir: &Path, layer: usize) -> Result<Option<Vec<Classifier>>> {
    let path = probe_path(lr_dir, layer);
    if !path.exists() {
        debug!("No supervised probes at {}", path.display());
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path)?;
    let stored: StoredProbes = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse probes in {}", path.display()))?;
    let probes = match stored {
        StoredProbes::Many(probes) => probes,
        StoredProbes::One(probe) => vec![probe],
    };
    Ok(Some(probes))
}
