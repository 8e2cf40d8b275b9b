//! Output-directory layout and run artifacts

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::dataset::DatasetDict;

pub const CONFIG_FILE: &str = "cfg.json";
pub const META_FILE: &str = "metadata.json";
pub const DEBUG_LOG_FILE: &str = "debug.log";
pub const REPORTERS_DIR: &str = "reporters";
pub const LR_MODELS_DIR: &str = "lr_models";

const ADJECTIVES: &[&str] = &[
    "amber", "brave", "calm", "dusty", "eager", "fuzzy", "gentle", "hidden", "icy", "jolly",
    "keen", "lucid", "misty", "nimble", "quiet", "rapid", "silent", "tidy", "vivid", "witty",
];
const NOUNS: &[&str] = &[
    "badger", "comet", "delta", "ember", "falcon", "glacier", "harbor", "island", "jasper",
    "kepler", "lagoon", "meadow", "nebula", "orchid", "pebble", "quartz", "raven", "summit",
    "thistle", "willow",
];

/// Root under which experiment directories are created.
///
/// `$ELK_DIR` when set, otherwise `~/elk-reporters`.
pub fn elk_reporter_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("ELK_DIR") {
        return PathBuf::from(dir);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join("elk-reporters")
}

/// A fresh `adjective-noun` directory path under `parent` that does not exist yet
pub fn memorably_named_dir(parent: &Path) -> PathBuf {
    let mut rng = rand::thread_rng();
    loop {
        let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("plain");
        let noun = NOUNS.choose(&mut rng).copied().unwrap_or("run");
        let candidate = parent.join(format!("{adjective}-{noun}"));
        if !candidate.exists() {
            return candidate;
        }
        let suffixed = parent.join(format!("{adjective}-{noun}-{}", rng.gen_range(0..10_000)));
        if !suffixed.exists() {
            return suffixed;
        }
    }
}

/// Create the run's output directory, inventing a name when none is given
pub fn create_output_directory(out_dir: Option<&Path>) -> Result<PathBuf> {
    let out_dir = match out_dir {
        Some(dir) => dir.to_path_buf(),
        None => memorably_named_dir(&elk_reporter_dir()),
    };
    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("Failed to create output directory {}", out_dir.display()))?;
    info!("Output directory at {}", out_dir.display());
    Ok(out_dir)
}

/// Persist the run configuration as `cfg.json`
pub fn save_config<C: Serialize>(cfg: &C, out_dir: &Path) -> Result<()> {
    let path = out_dir.join(CONFIG_FILE);
    std::fs::write(&path, serde_json::to_string_pretty(cfg)?)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct SplitMeta {
    num_examples: usize,
    num_variants: Option<usize>,
    num_classes: Option<usize>,
    hidden_size: Option<usize>,
    layers: Vec<usize>,
    has_lm_preds: bool,
}

/// Persist a summary of the datasets as `metadata.json`
pub fn save_meta(datasets: &DatasetDict, out_dir: &Path) -> Result<()> {
    let meta: BTreeMap<&str, BTreeMap<&str, SplitMeta>> = datasets
        .iter()
        .map(|(ds_name, ds)| {
            let splits = ds
                .splits()
                .iter()
                .map(|(split_name, split)| {
                    let shape = split.hidden_shape();
                    let meta = SplitMeta {
                        num_examples: split.num_examples(),
                        num_variants: shape.map(|(v, _, _)| v),
                        num_classes: shape.map(|(_, k, _)| k),
                        hidden_size: shape.map(|(_, _, d)| d),
                        layers: split.layers().into_iter().collect(),
                        has_lm_preds: split.lm_preds().is_some(),
                    };
                    (split_name.as_str(), meta)
                })
                .collect();
            (ds_name.as_str(), splits)
        })
        .collect();

    let path = out_dir.join(META_FILE);
    std::fs::write(&path, serde_json::to_string_pretty(&meta)?)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Write `debug.log`: dataset shapes plus a listing of the output directory
pub fn save_debug_log(datasets: &DatasetDict, out_dir: &Path) -> Result<()> {
    let mut log = String::new();

    writeln!(log, "== datasets ==")?;
    for (ds_name, ds) in datasets {
        for (split_name, split) in ds.splits() {
            writeln!(
                log,
                "{ds_name}/{split_name}: {} examples, (v, k, d) = {:?}, layers = {:?}, lm_preds = {}",
                split.num_examples(),
                split.hidden_shape(),
                split.layers(),
                split.lm_preds().is_some()
            )?;
        }
    }

    writeln!(log, "== {} ==", out_dir.display())?;
    let mut entries: Vec<_> = std::fs::read_dir(out_dir)?
        .filter_map(|e| e.ok())
        .collect();
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        writeln!(log, "{} ({size} bytes)", entry.file_name().to_string_lossy())?;
    }

    let path = out_dir.join(DEBUG_LOG_FILE);
    std::fs::write(&path, log).with_context(|| format!("Failed to write {}", path.display()))?;
    info!("Debug log written to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memorable_name_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let first = memorably_named_dir(dir.path());
        std::fs::create_dir_all(&first).unwrap();
        let second = memorably_named_dir(dir.path());
        assert_ne!(first, second);
        assert!(!second.exists());
    }

    #[test]
    fn test_create_output_directory_explicit() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("run");
        let out = create_output_directory(Some(&target)).unwrap();
        assert_eq!(out, target);
        assert!(target.is_dir());
    }

    #[test]
    fn test_save_config_writes_json() {
        let dir = tempfile::tempdir().unwrap();
        save_config(&serde_json::json!({"seed": 7}), dir.path()).unwrap();
        let text = std::fs::read_to_string(dir.path().join(CONFIG_FILE)).unwrap();
        assert!(text.contains("\"seed\": 7"));
    }
}
