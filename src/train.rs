//! Training run for the supervised baselines
//!
//! For every layer the probes are fit on the pooled training splits, saved
//! under `lr_models/` and scored on the validation splits. The output
//! directory can later be used as the `source` of an [`crate::evaluate::Eval`].

use anyhow::Result;
use candle_core::Device;
use std::collections::BTreeMap;
use tracing::info;

use crate::config::ElicitConfig;
use crate::dataset::Extract;
use crate::files::LR_MODELS_DIR;
use crate::metrics::{evaluate_preds, PromptEnsembling};
use crate::run::{
    layer_table, make_reproducible, LayerApplied, LayerData, LayerOutput, ResultRow, Run,
    LR_EVAL_TABLE,
};
use crate::supervised::{save_probes, train_supervised};

pub struct Elicit {
    cfg: ElicitConfig,
    run: Run,
}

impl Elicit {
    pub fn new(cfg: ElicitConfig, extractor: &dyn Extract) -> Result<Self> {
        let run = Run::new(cfg.run.clone(), &cfg, extractor)?;
        Ok(Self { cfg, run })
    }

    pub fn run(&self) -> &Run {
        &self.run
    }

    pub fn apply_to_layer(&self, layer: usize, device: &Device) -> Result<LayerApplied> {
        let seed = self.run.cfg().seed.wrapping_add(layer as u64);
        let mut rng = make_reproducible(seed, std::slice::from_ref(device))?;
        let mut applied = LayerApplied::new(layer);

        let Some(mode) = self.cfg.supervised else {
            return Ok(applied);
        };

        let (train, val): (BTreeMap<String, LayerData>, BTreeMap<String, LayerData>) = self
            .run
            .prepare_splits(device, layer)?
            .into_iter()
            .map(|(name, (train, val))| ((name.clone(), train), (name, val)))
            .unzip();

        let probes = train_supervised(
            &train,
            &mode.to_string(),
            &self.cfg.supervised_options,
            &mut rng,
        )?;
        save_probes(&self.run.out_dir().join(LR_MODELS_DIR), layer, &probes)?;

        for (ds_name, data) in val {
            let mut first_credences = None;
            for (i, probe) in probes.iter().enumerate() {
                let logits = probe.credences(&data.hiddens)?;
                for ensembling in PromptEnsembling::all() {
                    applied.push_row(
                        LR_EVAL_TABLE,
                        ResultRow {
                            dataset: ds_name.clone(),
                            layer,
                            prompt_ensembling: ensembling,
                            inlp_iter: Some(i),
                            eval: evaluate_preds(&data.labels, &logits, ensembling)?,
                        },
                    );
                }
                first_credences.get_or_insert(logits);
            }

            if let Some(credences) = first_credences {
                applied.outputs.push(LayerOutput {
                    dataset: ds_name,
                    layer,
                    labels: data.labels,
                    credences,
                });
            }
        }

        info!("Layer {layer}: trained {} {mode} probe(s)", probes.len());
        Ok(applied)
    }

    /// Train every layer and write `lr_eval.csv`
    pub fn execute(&self) -> Result<Vec<LayerApplied>> {
        if self.cfg.supervised.is_none() {
            info!("No supervised mode selected; only the header will be written");
        }
        self.run.apply_to_layer_tables(
            |layer, device| self.apply_to_layer(layer, device),
            self.run.devices().len(),
            vec![layer_table(LR_EVAL_TABLE)],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DataConfig, Normalization, RunConfig, SupervisedMode};
    use crate::dataset::{Dataset, DatasetDict, Split};
    use crate::supervised::load_probes;
    use candle_core::{DType, Tensor};

    /// Two statements per example; the true one carries a positive first feature
    fn separable_split(n: usize) -> Split {
        let device = Device::Cpu;
        let mut flat = Vec::new();
        let mut labels = Vec::new();
        for i in 0..n {
            let label = (i % 2) as u32;
            labels.push(label);
            for statement in 0..2u32 {
                let sign = if statement == label { 1.0f32 } else { -1.0 };
                flat.extend([sign * 2.0, (i as f32 * 0.7).cos(), 0.5]);
            }
        }
        let h = Tensor::from_vec(flat, (n, 1, 2, 3), &device)
            .unwrap()
            .to_dtype(DType::F16)
            .unwrap();
        let labels = Tensor::from_vec(labels, (n,), &device).unwrap();
        Split::new(labels, BTreeMap::from([(0, h.clone()), (1, h)]), None).unwrap()
    }

    fn elicit(dir: &std::path::Path, mode: Option<SupervisedMode>) -> Elicit {
        elicit_seeded(dir, mode, RunConfig::default().seed)
    }

    fn elicit_seeded(dir: &std::path::Path, mode: Option<SupervisedMode>, seed: u64) -> Elicit {
        let dict: DatasetDict = BTreeMap::from([(
            "toy".to_string(),
            Dataset::new(BTreeMap::from([
                ("train".to_string(), separable_split(16)),
                ("validation".to_string(), separable_split(8)),
            ])),
        )]);
        let cfg = ElicitConfig {
            run: RunConfig {
                data: DataConfig::default(),
                normalization: Normalization::None,
                num_gpus: 0,
                seed,
                out_dir: Some(dir.to_path_buf()),
                ..Default::default()
            },
            supervised: mode,
            ..Default::default()
        };
        Elicit::new(cfg, &dict).unwrap()
    }

    #[test]
    fn test_elicit_saves_and_scores_probes() {
        let dir = tempfile::tempdir().unwrap();
        let results = elicit(dir.path(), Some(SupervisedMode::Single)).execute().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].rows(LR_EVAL_TABLE).len(), 3);

        let probes = load_probes(&dir.path().join(LR_MODELS_DIR), 1).unwrap().unwrap();
        assert_eq!(probes.len(), 1);

        let best = results[0]
            .rows(LR_EVAL_TABLE)
            .iter()
            .map(|r| r.eval.accuracy.estimate)
            .fold(0.0, f64::max);
        assert!(best > 0.9, "accuracy {best}");

        let csv = std::fs::read_to_string(dir.path().join("lr_eval.csv")).unwrap();
        assert_eq!(csv.lines().count(), 1 + 2 * 3);
    }

    #[test]
    fn test_largest_seed_wraps_per_layer() {
        let dir = tempfile::tempdir().unwrap();
        let results = elicit_seeded(dir.path(), Some(SupervisedMode::Single), u64::MAX)
            .execute()
            .unwrap();
        assert_eq!(results.iter().map(|r| r.layer).collect::<Vec<_>>(), vec![0, 1]);
        assert!(results.iter().all(|r| r.rows(LR_EVAL_TABLE).len() == 3));
    }

    #[test]
    fn test_elicit_without_mode_writes_header_only() {
        let dir = tempfile::tempdir().unwrap();
        let results = elicit(dir.path(), None).execute().unwrap();
        assert!(results.iter().all(|r| r.rows(LR_EVAL_TABLE).is_empty()));
        assert!(!dir.path().join(LR_MODELS_DIR).exists());

        let csv = std::fs::read_to_string(dir.path().join("lr_eval.csv")).unwrap();
        assert_eq!(csv.lines().count(), 1);
    }
}
