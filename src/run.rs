//! Per-layer orchestration
//!
//! A [`Run`] owns the extracted datasets, the output directory and the
//! usable devices. [`Run::apply_to_layers`] calls a function once for every
//! layer, spread over a rayon pool with one worker per device, and streams
//! the results into CSV tables through [`crate::writer`].

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use tracing::{debug, info, warn};

use crate::config::RunConfig;
use crate::dataset::{get_layers, hidden_field, select_train_val_splits, DatasetDict, Extract, Split};
use crate::error::ElkError;
use crate::files::{create_output_directory, save_config, save_meta};
use crate::metrics::{EvalResult, PromptEnsembling};
use crate::preprocessing::normalize;
use crate::writer::{write_func_to_file, CsvTable, StatResult};

pub const EVAL_TABLE: &str = "eval";
pub const LM_EVAL_TABLE: &str = "lm_eval";
pub const LR_EVAL_TABLE: &str = "lr_eval";

/// One split of one dataset at one layer, cast to f32 and on a device
#[derive(Debug, Clone)]
pub struct LayerData {
    /// `(n, v, k, d)`
    pub hiddens: Tensor,
    /// `(n,)`
    pub labels: Tensor,
    /// `(n, v, k)`
    pub lm_preds: Option<Tensor>,
}

/// Contrast pairs for one dataset: hidden states split along the statement axis
#[derive(Debug, Clone)]
pub struct PreparedData {
    /// `(n, v, d)` for the first statement of each training example
    pub x0: Tensor,
    pub x1: Tensor,
    pub val_x0: Tensor,
    pub val_x1: Tensor,
    pub train_labels: Tensor,
    pub val_labels: Tensor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitKind {
    Train,
    Val,
}

/// Ground truth and credences for one dataset at one layer
#[derive(Debug, Clone)]
pub struct LayerOutput {
    pub dataset: String,
    pub layer: usize,
    /// `(n,)`
    pub labels: Tensor,
    /// `(n, v, k)`
    pub credences: Tensor,
}

/// One line of an output table
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub dataset: String,
    pub layer: usize,
    pub prompt_ensembling: PromptEnsembling,
    /// Index of the probe within an INLP sequence (`lr_eval` only)
    pub inlp_iter: Option<usize>,
    pub eval: EvalResult,
}

impl ResultRow {
    pub fn csv_columns(with_inlp_iter: bool) -> Vec<String> {
        let mut columns: Vec<String> = ["dataset", "layer", "prompt_ensembling"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        if with_inlp_iter {
            columns.push("inlp_iter".to_string());
        }
        columns.extend(EvalResult::csv_columns());
        columns
    }

    pub fn to_csv_line(&self, with_inlp_iter: bool) -> Vec<String> {
        let mut line = vec![
            self.dataset.clone(),
            self.layer.to_string(),
            self.prompt_ensembling.to_string(),
        ];
        if with_inlp_iter {
            line.push(self.inlp_iter.map(|i| i.to_string()).unwrap_or_default());
        }
        line.extend(self.eval.to_csv_fields());
        line
    }
}

/// Everything one layer produced
#[derive(Debug, Clone)]
pub struct LayerApplied {
    pub layer: usize,
    pub outputs: Vec<LayerOutput>,
    /// Rows keyed by table name (`eval`, `lm_eval`, `lr_eval`)
    pub tables: BTreeMap<String, Vec<ResultRow>>,
}

impl LayerApplied {
    pub fn new(layer: usize) -> Self {
        Self {
            layer,
            outputs: Vec::new(),
            tables: BTreeMap::new(),
        }
    }

    pub fn push_row(&mut self, table: &str, row: ResultRow) {
        self.tables.entry(table.to_string()).or_default().push(row);
    }

    pub fn rows(&self, table: &str) -> &[ResultRow] {
        self.tables.get(table).map(Vec::as_slice).unwrap_or_default()
    }
}

impl StatResult for LayerApplied {
    fn layer(&self) -> usize {
        self.layer
    }
}

/// CSV table holding the rows a [`LayerApplied`] collected under `name`
pub fn layer_table(name: &str) -> CsvTable<'static, LayerApplied> {
    let with_inlp_iter = name == LR_EVAL_TABLE;
    let key = name.to_string();
    CsvTable::new(name, ResultRow::csv_columns(with_inlp_iter), move |applied: &LayerApplied| {
        applied
            .rows(&key)
            .iter()
            .map(|row| row.to_csv_line(with_inlp_iter))
            .collect()
    })
}

/// The device the calling worker should use.
///
/// Inside a rayon pool of `world_size` threads this is
/// `devices[index % world_size]`; outside any pool it is the first device.
pub fn get_device(devices: &[Device], world_size: usize) -> Result<Device> {
    let world_size = world_size.clamp(1, devices.len().max(1));
    let index = rayon::current_thread_index().unwrap_or(0);
    devices
        .get(index % world_size)
        .cloned()
        .context("No usable devices")
}

/// Seed accelerator RNGs and return the host RNG for `seed`
pub fn make_reproducible(seed: u64, devices: &[Device]) -> Result<StdRng> {
    for device in devices {
        // candle has no global CPU generator to seed
        if !device.is_cpu() {
            device.set_seed(seed)?;
        }
    }
    Ok(StdRng::seed_from_u64(seed))
}

/// CUDA devices when available, otherwise `cpu_workers` CPU entries.
///
/// A negative `num_gpus` takes every visible GPU.
pub fn select_usable_devices(num_gpus: i64, cpu_workers: usize) -> Result<Vec<Device>> {
    let mut devices = Vec::new();

    if num_gpus != 0 && candle_core::utils::cuda_is_available() {
        let wanted = usize::try_from(num_gpus).unwrap_or(usize::MAX);
        for ordinal in 0..wanted {
            match Device::new_cuda(ordinal) {
                Ok(device) => devices.push(device),
                Err(e) => {
                    debug!("Stopping GPU probe at ordinal {ordinal}: {e}");
                    break;
                }
            }
        }
        if num_gpus > 0 && devices.len() < wanted {
            warn!("Requested {num_gpus} GPUs but only {} are usable", devices.len());
        }
    }

    if devices.is_empty() {
        let workers = cpu_workers.max(1);
        info!("Using {workers} CPU worker(s)");
        devices = vec![Device::Cpu; workers];
    } else {
        info!("Using {} GPU(s)", devices.len());
    }
    Ok(devices)
}

/// Shared state of a training or evaluation run
pub struct Run {
    cfg: RunConfig,
    out_dir: PathBuf,
    datasets: DatasetDict,
    devices: Vec<Device>,
    interrupted: Arc<AtomicBool>,
}

impl Run {
    /// Extract the datasets, create the output directory and persist the
    /// configuration (`full_cfg`) and dataset metadata, in that order
    pub fn new<C: Serialize>(cfg: RunConfig, full_cfg: &C, extractor: &dyn Extract) -> Result<Self> {
        let datasets = extractor.extract(&cfg.data)?;
        let out_dir = create_output_directory(cfg.out_dir.as_deref())?;
        save_config(full_cfg, &out_dir)?;
        save_meta(&datasets, &out_dir)?;
        let devices = select_usable_devices(cfg.num_gpus, cfg.cpu_workers)?;

        Ok(Self {
            cfg,
            out_dir,
            datasets,
            devices,
            interrupted: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn cfg(&self) -> &RunConfig {
        &self.cfg
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn datasets(&self) -> &DatasetDict {
        &self.datasets
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Flag that stops the sweep once raised, e.g. from a Ctrl-C handler.
    ///
    /// Layers already finished are still written; the sweep then fails with
    /// [`ElkError::Interrupted`].
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupted)
    }

    /// Layers shared by every partition, ascending
    pub fn layers(&self) -> Result<Vec<usize>> {
        get_layers(&self.datasets)
    }

    fn load_layer(
        &self,
        ds_name: &str,
        split_name: &str,
        split: &Split,
        layer: usize,
        device: &Device,
    ) -> Result<LayerData> {
        let hiddens = split.hidden(layer).ok_or_else(|| ElkError::MissingField {
            dataset: ds_name.to_string(),
            split: split_name.to_string(),
            field: hidden_field(layer),
        })?;
        let hiddens = hiddens.to_device(device)?.to_dtype(DType::F32)?;
        let labels = split.labels().to_device(device)?;
        let lm_preds = split
            .lm_preds()
            .map(|p| p.to_device(device)?.to_dtype(DType::F32))
            .transpose()?;

        Ok(LayerData {
            hiddens,
            labels,
            lm_preds,
        })
    }

    /// Normalized (train, validation) data for every dataset at `layer`
    pub fn prepare_splits(
        &self,
        device: &Device,
        layer: usize,
    ) -> Result<BTreeMap<String, (LayerData, LayerData)>> {
        let mut out = BTreeMap::new();
        for (ds_name, ds) in &self.datasets {
            let (train_name, val_name) = select_train_val_splits(ds_name, ds)?;
            let (Some(train_split), Some(val_split)) = (ds.split(train_name), ds.split(val_name))
            else {
                return Err(ElkError::MissingSplits {
                    dataset: ds_name.clone(),
                    found: ds.split_names(),
                }
                .into());
            };

            let mut train = self.load_layer(ds_name, train_name, train_split, layer, device)?;
            let mut val = self.load_layer(ds_name, val_name, val_split, layer, device)?;
            let (train_h, val_h) = normalize(&train.hiddens, &val.hiddens, self.cfg.normalization)?;
            train.hiddens = train_h;
            val.hiddens = val_h;

            debug!(
                "{ds_name} layer {layer}: train={train_name} {:?}, val={val_name} {:?}",
                train.hiddens.dims(),
                val.hiddens.dims()
            );
            out.insert(ds_name.clone(), (train, val));
        }
        Ok(out)
    }

    /// One side of [`Run::prepare_splits`]
    pub fn prepare_split(
        &self,
        device: &Device,
        layer: usize,
        kind: SplitKind,
    ) -> Result<BTreeMap<String, LayerData>> {
        Ok(self
            .prepare_splits(device, layer)?
            .into_iter()
            .map(|(name, (train, val))| {
                let data = match kind {
                    SplitKind::Train => train,
                    SplitKind::Val => val,
                };
                (name, data)
            })
            .collect())
    }

    /// Contrast pairs for every dataset at `layer`; requires exactly two
    /// statements per example
    pub fn prepare_data(&self, device: &Device, layer: usize) -> Result<BTreeMap<String, PreparedData>> {
        let mut out = BTreeMap::new();
        for (name, (train, val)) in self.prepare_splits(device, layer)? {
            let (x0, x1) = contrast_pair(&name, &train.hiddens)?;
            let (val_x0, val_x1) = contrast_pair(&name, &val.hiddens)?;
            out.insert(
                name,
                PreparedData {
                    x0,
                    x1,
                    val_x0,
                    val_x1,
                    train_labels: train.labels,
                    val_labels: val.labels,
                },
            );
        }
        Ok(out)
    }

    /// [`Run::apply_to_layer_tables`] with a single `eval` table
    pub fn apply_to_layers<R, F, L>(
        &self,
        func: F,
        num_devices: usize,
        to_csv_line: L,
        csv_columns: Vec<String>,
    ) -> Result<Vec<R>>
    where
        R: StatResult,
        F: Fn(usize, &Device) -> Result<R> + Sync,
        L: Fn(&R) -> Vec<String>,
    {
        let table = CsvTable::single_row(EVAL_TABLE, csv_columns, to_csv_line);
        self.apply_to_layer_tables(func, num_devices, vec![table])
    }

    /// Call `func` once per layer on `num_devices` workers and write every
    /// result to `tables`. Results come back sorted by layer.
    pub fn apply_to_layer_tables<R, F>(
        &self,
        func: F,
        num_devices: usize,
        tables: Vec<CsvTable<'_, R>>,
    ) -> Result<Vec<R>>
    where
        R: StatResult,
        F: Fn(usize, &Device) -> Result<R> + Sync,
    {
        let layers = self.layers()?;
        let world_size = num_devices.clamp(1, self.devices.len().max(1));
        let devices = &self.devices[..world_size.min(self.devices.len())];
        let debug = self.cfg.debug.then_some(&self.datasets);

        info!(
            "Applying to {} layer(s) on {world_size} worker(s)",
            layers.len()
        );

        let interrupted = &*self.interrupted;
        if world_size <= 1 {
            let device = get_device(devices, 1)?;
            let results = layers.iter().map(|&layer| {
                if interrupted.load(Ordering::SeqCst) {
                    warn!("Interrupted before layer {layer}");
                    return Err(ElkError::Interrupted.into());
                }
                info!("Layer {layer}");
                func(layer, &device)
            });
            return write_func_to_file(results, &self.out_dir, tables, debug);
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(world_size)
            .build()
            .context("Failed to build worker pool")?;
        let cancelled = AtomicBool::new(false);
        let (tx, rx) = mpsc::channel::<Result<R>>();

        std::thread::scope(|scope| {
            let cancelled = &cancelled;
            let func = &func;
            let layers = &layers;
            let pool = &pool;
            scope.spawn(move || {
                pool.install(|| {
                    layers.par_iter().for_each_with(tx, |tx, &layer| {
                        if cancelled.load(Ordering::Relaxed) {
                            return;
                        }
                        if interrupted.load(Ordering::SeqCst) {
                            cancelled.store(true, Ordering::Relaxed);
                            warn!("Interrupted before layer {layer}");
                            let _ = tx.send(Err(ElkError::Interrupted.into()));
                            return;
                        }
                        let result = get_device(devices, world_size).and_then(|device| {
                            info!("Layer {layer} on {device:?}");
                            func(layer, &device)
                        });
                        if result.is_err() {
                            cancelled.store(true, Ordering::Relaxed);
                        }
                        // The writer hangs up after the first error
                        let _ = tx.send(result);
                    });
                });
            });

            write_func_to_file(rx, &self.out_dir, tables, debug)
        })
    }
}

fn contrast_pair(ds_name: &str, hiddens: &Tensor) -> Result<(Tensor, Tensor)> {
    let (_, _, k, _) = hiddens.dims4()?;
    if k != 2 {
        return Err(ElkError::InvalidShape {
            what: format!("{ds_name} statements"),
            detail: format!("contrast pairs need 2 statements per example, got {k}"),
        }
        .into());
    }
    Ok((
        hiddens.narrow(2, 0, 1)?.squeeze(2)?,
        hiddens.narrow(2, 1, 1)?.squeeze(2)?,
    ))
}
