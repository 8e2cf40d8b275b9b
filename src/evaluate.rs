//! Evaluation of trained reporters and supervised probes on every layer

use anyhow::Result;
use candle_core::Device;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::EvalConfig;
use crate::dataset::Extract;
use crate::files::{elk_reporter_dir, LR_MODELS_DIR, REPORTERS_DIR};
use crate::metrics::{evaluate_preds, PromptEnsembling};
use crate::reporter::{load_reporter, CredenceOptions};
use crate::run::{
    layer_table, make_reproducible, LayerApplied, LayerOutput, ResultRow, Run, SplitKind,
    EVAL_TABLE, LM_EVAL_TABLE, LR_EVAL_TABLE,
};
use crate::supervised::load_probes;

/// Experiment directory for `source`: absolute paths are used as given,
/// relative ones live under the reporter root
pub fn resolve_source(source: &Path) -> PathBuf {
    if source.is_absolute() {
        source.to_path_buf()
    } else {
        elk_reporter_dir().join(source)
    }
}

/// `<source>/transfer/<ds1+ds2+...>`
pub fn default_out_dir(source_dir: &Path, datasets: &[String]) -> PathBuf {
    source_dir.join("transfer").join(datasets.join("+"))
}

/// Evaluates the reporters (and supervised probes) of a finished run
pub struct Eval {
    cfg: EvalConfig,
    source_dir: PathBuf,
    run: Run,
}

impl Eval {
    pub fn new(mut cfg: EvalConfig, extractor: &dyn Extract) -> Result<Self> {
        let source_dir = resolve_source(&cfg.source);
        if !source_dir.is_dir() {
            warn!("Source directory {} does not exist", source_dir.display());
        }
        if cfg.run.out_dir.is_none() {
            cfg.run.out_dir = Some(default_out_dir(&source_dir, &cfg.run.data.datasets));
        }

        let run = Run::new(cfg.run.clone(), &cfg, extractor)?;
        Ok(Self {
            cfg,
            source_dir,
            run,
        })
    }

    pub fn run(&self) -> &Run {
        &self.run
    }

    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    /// Score every dataset's validation split at `layer`.
    ///
    /// A missing reporter fails the layer; missing lm predictions or probe
    /// files only leave their tables empty.
    pub fn apply_to_layer(
        &self,
        layer: usize,
        device: &Device,
        probe_per_prompt: bool,
    ) -> Result<LayerApplied> {
        let seed = self.run.cfg().seed.wrapping_add(layer as u64);
        make_reproducible(seed, std::slice::from_ref(device))?;

        let val = self.run.prepare_split(device, layer, SplitKind::Val)?;
        let reporter = load_reporter(&self.source_dir.join(REPORTERS_DIR), layer, device)?;
        let probes = if self.cfg.skip_supervised {
            None
        } else {
            load_probes(&self.source_dir.join(LR_MODELS_DIR), layer)?
        };

        let opts = CredenceOptions {
            super_full: true,
            per_prompt: probe_per_prompt,
        };

        let mut applied = LayerApplied::new(layer);
        for (ds_name, data) in val {
            let credences = reporter.credences(&data.hiddens, opts)?;
            let probe_logits = probes
                .iter()
                .flatten()
                .map(|probe| probe.credences(&data.hiddens))
                .collect::<Result<Vec<_>>>()?;
            if data.lm_preds.is_none() {
                debug!("{ds_name} has no lm predictions");
            }

            for ensembling in PromptEnsembling::all() {
                let row = |inlp_iter, eval| ResultRow {
                    dataset: ds_name.clone(),
                    layer,
                    prompt_ensembling: ensembling,
                    inlp_iter,
                    eval,
                };

                let eval = evaluate_preds(&data.labels, &credences, ensembling)?;
                applied.push_row(EVAL_TABLE, row(None, eval));

                if let Some(lm_preds) = &data.lm_preds {
                    let eval = evaluate_preds(&data.labels, lm_preds, ensembling)?;
                    applied.push_row(LM_EVAL_TABLE, row(None, eval));
                }

                for (i, logits) in probe_logits.iter().enumerate() {
                    let eval = evaluate_preds(&data.labels, logits, ensembling)?;
                    applied.push_row(LR_EVAL_TABLE, row(Some(i), eval));
                }
            }

            applied.outputs.push(LayerOutput {
                dataset: ds_name,
                layer,
                labels: data.labels,
                credences,
            });
        }

        info!(
            "Layer {layer}: {} eval, {} lm_eval, {} lr_eval rows",
            applied.rows(EVAL_TABLE).len(),
            applied.rows(LM_EVAL_TABLE).len(),
            applied.rows(LR_EVAL_TABLE).len()
        );
        Ok(applied)
    }

    /// Evaluate every layer and write `eval.csv`, `lm_eval.csv` and `lr_eval.csv`
    pub fn execute(&self) -> Result<Vec<LayerApplied>> {
        let tables = vec![
            layer_table(EVAL_TABLE),
            layer_table(LM_EVAL_TABLE),
            layer_table(LR_EVAL_TABLE),
        ];
        let probe_per_prompt = self.cfg.probe_per_prompt;
        self.run.apply_to_layer_tables(
            |layer, device| self.apply_to_layer(layer, device, probe_per_prompt),
            self.run.devices().len(),
            tables,
        )
    }
}
