//! Cached hidden-state datasets
//!
//! A [`DatasetDict`] maps dataset names to [`Dataset`]s, which map split
//! names to [`Split`]s. Each split is one safetensors file holding
//! `label` `(n,)`, one `hidden_{layer}` tensor `(n, v, k, d)` per layer
//! (stored in f16/bf16) and an optional `lm_preds` tensor `(n, v, k)`.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use tracing::{debug, info};

use crate::config::DataConfig;
use crate::error::ElkError;

pub const LABEL_FIELD: &str = "label";
pub const LM_PREDS_FIELD: &str = "lm_preds";
const HIDDEN_PREFIX: &str = "hidden_";
const SPLIT_EXTENSION: &str = "safetensors";

/// Name of the hidden-state field for a layer
pub fn hidden_field(layer: usize) -> String {
    format!("{HIDDEN_PREFIX}{layer}")
}

/// One partition of a dataset with per-layer hidden states
#[derive(Debug, Clone)]
pub struct Split {
    labels: Tensor,
    hiddens: BTreeMap<usize, Tensor>,
    lm_preds: Option<Tensor>,
}

impl Split {
    /// Build a split, checking that every field agrees on the example count
    pub fn new(
        labels: Tensor,
        hiddens: BTreeMap<usize, Tensor>,
        lm_preds: Option<Tensor>,
    ) -> Result<Self> {
        let n = match labels.dims() {
            [n] => *n,
            dims => {
                return Err(ElkError::InvalidShape {
                    what: LABEL_FIELD.into(),
                    detail: format!("expected (n,), got {dims:?}"),
                }
                .into())
            }
        };

        for (layer, h) in &hiddens {
            match h.dims() {
                [hn, _, _, _] if *hn == n => {}
                dims => {
                    return Err(ElkError::InvalidShape {
                        what: hidden_field(*layer),
                        detail: format!("expected ({n}, v, k, d), got {dims:?}"),
                    }
                    .into())
                }
            }
        }

        if let Some(preds) = &lm_preds {
            match preds.dims() {
                [pn, _, _] if *pn == n => {}
                dims => {
                    return Err(ElkError::InvalidShape {
                        what: LM_PREDS_FIELD.into(),
                        detail: format!("expected ({n}, v, k), got {dims:?}"),
                    }
                    .into())
                }
            }
        }

        let labels = labels.to_dtype(DType::U32)?;
        Ok(Self {
            labels,
            hiddens,
            lm_preds,
        })
    }

    /// Load a split from a safetensors file
    pub fn load(path: &Path) -> Result<Self> {
        let tensors = candle_core::safetensors::load(path, &Device::Cpu)
            .with_context(|| format!("Failed to read split {}", path.display()))?;

        let mut labels = None;
        let mut lm_preds = None;
        let mut hiddens = BTreeMap::new();

        for (name, tensor) in tensors {
            if name == LABEL_FIELD {
                labels = Some(tensor);
            } else if name == LM_PREDS_FIELD {
                lm_preds = Some(tensor);
            } else if let Some(layer) = name.strip_prefix(HIDDEN_PREFIX) {
                let layer: usize = layer
                    .parse()
                    .with_context(|| format!("Bad hidden-state field name: {name}"))?;
                hiddens.insert(layer, tensor);
            } else {
                debug!("Ignoring unknown field {} in {}", name, path.display());
            }
        }

        let labels = labels.ok_or_else(|| ElkError::MissingField {
            dataset: path
                .parent()
                .and_then(Path::file_name)
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            split: path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            field: LABEL_FIELD.into(),
        })?;

        Self::new(labels, hiddens, lm_preds)
    }

    /// Write the split as a safetensors file
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        tensors.insert(LABEL_FIELD.to_string(), self.labels.clone());
        for (layer, h) in &self.hiddens {
            tensors.insert(hidden_field(*layer), h.clone());
        }
        if let Some(preds) = &self.lm_preds {
            tensors.insert(LM_PREDS_FIELD.to_string(), preds.clone());
        }
        candle_core::safetensors::save(&tensors, path)
            .with_context(|| format!("Failed to write split {}", path.display()))?;
        Ok(())
    }

    /// Ground-truth labels, `u32` of shape `(n,)`
    pub fn labels(&self) -> &Tensor {
        &self.labels
    }

    /// Stored hidden states for a layer, `(n, v, k, d)`
    pub fn hidden(&self, layer: usize) -> Option<&Tensor> {
        self.hiddens.get(&layer)
    }

    /// Language-model logits, `(n, v, k)`, when they were extracted
    pub fn lm_preds(&self) -> Option<&Tensor> {
        self.lm_preds.as_ref()
    }

    /// Layers present in this split, ascending
    pub fn layers(&self) -> BTreeSet<usize> {
        self.hiddens.keys().copied().collect()
    }

    pub fn num_examples(&self) -> usize {
        self.labels.dims().first().copied().unwrap_or(0)
    }

    /// `(v, k, d)` of the first stored layer
    pub fn hidden_shape(&self) -> Option<(usize, usize, usize)> {
        self.hiddens.values().next().map(|h| {
            let dims = h.dims();
            (dims[1], dims[2], dims[3])
        })
    }
}

/// The named splits of one dataset
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    splits: BTreeMap<String, Split>,
}

impl Dataset {
    pub fn new(splits: BTreeMap<String, Split>) -> Self {
        Self { splits }
    }

    /// Load every `*.safetensors` split in a directory
    pub fn load(dir: &Path) -> Result<Self> {
        let mut splits = BTreeMap::new();
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read dataset directory {}", dir.display()))?;

        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SPLIT_EXTENSION) {
                continue;
            }
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            splits.insert(name, Split::load(&path)?);
        }

        Ok(Self { splits })
    }

    /// Save every split into `dir`, creating it if needed
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        for (name, split) in &self.splits {
            split.save(&dir.join(format!("{name}.{SPLIT_EXTENSION}")))?;
        }
        Ok(())
    }

    pub fn split(&self, name: &str) -> Option<&Split> {
        self.splits.get(name)
    }

    pub fn splits(&self) -> &BTreeMap<String, Split> {
        &self.splits
    }

    pub fn split_names(&self) -> Vec<String> {
        self.splits.keys().cloned().collect()
    }
}

/// All datasets used by a run, keyed by name
pub type DatasetDict = BTreeMap<String, Dataset>;

/// Source of hidden states for a run.
///
/// Extraction from model checkpoints happens elsewhere; implementors only
/// have to hand back the cached result.
pub trait Extract {
    fn extract(&self, cfg: &DataConfig) -> Result<DatasetDict>;
}

/// Reads splits written by the extraction step from `cfg.cache_dir`
#[derive(Debug, Clone, Copy, Default)]
pub struct CachedHiddenStates;

impl Extract for CachedHiddenStates {
    fn extract(&self, cfg: &DataConfig) -> Result<DatasetDict> {
        let mut dict = DatasetDict::new();
        for name in &cfg.datasets {
            let dir = cfg.cache_dir.join(name);
            info!("Loading cached hidden states from {}", dir.display());
            dict.insert(name.clone(), Dataset::load(&dir)?);
        }
        Ok(dict)
    }
}

/// An in-memory dictionary is already extracted
impl Extract for DatasetDict {
    fn extract(&self, cfg: &DataConfig) -> Result<DatasetDict> {
        if cfg.datasets.is_empty() {
            return Ok(self.clone());
        }
        cfg.datasets
            .iter()
            .map(|name| {
                self.get(name)
                    .cloned()
                    .map(|ds| (name.clone(), ds))
                    .with_context(|| format!("Dataset {name} not in memory"))
            })
            .collect()
    }
}

/// Layers shared by every split of every dataset, ascending
pub fn get_layers(datasets: &DatasetDict) -> Result<Vec<usize>> {
    let mut reference: Option<(String, BTreeSet<usize>)> = None;

    for (ds_name, ds) in datasets {
        for (split_name, split) in ds.splits() {
            let layers = split.layers();
            match &reference {
                None => reference = Some((format!("{ds_name}/{split_name}"), layers)),
                Some((ref_name, ref_layers)) if *ref_layers != layers => {
                    return Err(ElkError::InconsistentLayers(format!(
                        "{ds_name}/{split_name} has {layers:?} but {ref_name} has {ref_layers:?}"
                    ))
                    .into());
                }
                Some(_) => {}
            }
        }
    }

    let (_, layers) = reference
        .ok_or_else(|| ElkError::InconsistentLayers("no partitions to enumerate".into()))?;
    Ok(layers.into_iter().collect())
}

fn split_priority(name: &str) -> u8 {
    match name {
        "train" => 0,
        "validation" => 1,
        "test" => 2,
        _ => 3,
    }
}

/// Pick the (train, validation) split names, preferring
/// `train` > `validation` > `test` > anything else
pub fn select_train_val_splits<'a>(ds_name: &str, ds: &'a Dataset) -> Result<(&'a str, &'a str)> {
    let mut names: Vec<&str> = ds.splits().keys().map(String::as_str).collect();
    names.sort_by_key(|n| split_priority(n));

    match names.as_slice() {
        [train, val, ..] => Ok((*train, *val)),
        _ => Err(ElkError::MissingSplits {
            dataset: ds_name.to_string(),
            found: ds.split_names(),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_split(n: usize, layers: &[usize]) -> Split {
        let device = Device::Cpu;
        let labels = Tensor::zeros((n,), DType::U32, &device).unwrap();
        let hiddens = layers
            .iter()
            .map(|&l| {
                let h = Tensor::ones((n, 2, 2, 4), DType::F16, &device).unwrap();
                (l, h)
            })
            .collect();
        Split::new(labels, hiddens, None).unwrap()
    }

    fn toy_dataset(splits: &[&str], layers: &[usize]) -> Dataset {
        Dataset::new(
            splits
                .iter()
                .map(|s| (s.to_string(), toy_split(3, layers)))
                .collect(),
        )
    }

    #[test]
    fn test_split_rejects_mismatched_examples() {
        let device = Device::Cpu;
        let labels = Tensor::zeros((3,), DType::U32, &device).unwrap();
        let h = Tensor::zeros((4, 1, 2, 8), DType::F16, &device).unwrap();
        let err = Split::new(labels, BTreeMap::from([(0, h)]), None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ElkError>(),
            Some(ElkError::InvalidShape { .. })
        ));
    }

    #[test]
    fn test_split_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.safetensors");
        let split = toy_split(3, &[0, 1]);
        split.save(&path).unwrap();

        let loaded = Split::load(&path).unwrap();
        assert_eq!(loaded.num_examples(), 3);
        assert_eq!(loaded.layers(), BTreeSet::from([0, 1]));
        assert_eq!(loaded.hidden(1).unwrap().dtype(), DType::F16);
        assert!(loaded.lm_preds().is_none());
    }

    #[test]
    fn test_get_layers_consistent() {
        let mut dict = DatasetDict::new();
        dict.insert("a".into(), toy_dataset(&["train", "test"], &[2, 0, 1]));
        dict.insert("b".into(), toy_dataset(&["train", "validation"], &[0, 1, 2]));
        assert_eq!(get_layers(&dict).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_get_layers_inconsistent() {
        let mut dict = DatasetDict::new();
        dict.insert("a".into(), toy_dataset(&["train", "test"], &[0, 1]));
        dict.insert("b".into(), toy_dataset(&["train", "test"], &[0]));
        let err = get_layers(&dict).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ElkError>(),
            Some(ElkError::InconsistentLayers(_))
        ));
    }

    #[test]
    fn test_select_train_val_splits() {
        let ds = toy_dataset(&["test", "train", "validation"], &[0]);
        assert_eq!(
            select_train_val_splits("ds", &ds).unwrap(),
            ("train", "validation")
        );

        let ds = toy_dataset(&["test", "validation"], &[0]);
        assert_eq!(
            select_train_val_splits("ds", &ds).unwrap(),
            ("validation", "test")
        );

        let ds = toy_dataset(&["train"], &[0]);
        assert!(select_train_val_splits("ds", &ds).is_err());
    }
}
