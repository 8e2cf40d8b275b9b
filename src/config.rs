//! Run configuration
//!
//! Plain serde structs with sensible defaults. The CLI fills them in and
//! every run persists its own copy as `cfg.json` in the output directory.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ElkError;

/// Where the cached hidden states live and which datasets to use
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Dataset names; each is a sub-directory of `cache_dir`
    pub datasets: Vec<String>,
    /// Root of the extracted hidden-state cache
    pub cache_dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            datasets: vec![],
            cache_dir: PathBuf::from("hidden_states"),
        }
    }
}

/// How hidden states are normalized before probing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Normalization {
    #[default]
    None,
    /// Subtract the train mean and divide by the train std, per feature
    Elementwise,
    /// Subtract the train mean only
    MeanOnly,
}

impl FromStr for Normalization {
    type Err = ElkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "elementwise" => Ok(Self::Elementwise),
            "meanonly" => Ok(Self::MeanOnly),
            other => Err(ElkError::InvalidNormalization(other.to_string())),
        }
    }
}

impl fmt::Display for Normalization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Elementwise => "elementwise",
            Self::MeanOnly => "meanonly",
        };
        f.write_str(s)
    }
}

/// Supervised probe training mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisedMode {
    /// One probe with the default penalty
    Single,
    /// One probe with a cross-validated penalty
    Cv,
    /// A sequence of iteratively null-space-projected probes
    Inlp,
}

impl FromStr for SupervisedMode {
    type Err = ElkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "single" => Ok(Self::Single),
            "cv" => Ok(Self::Cv),
            "inlp" => Ok(Self::Inlp),
            other => Err(ElkError::InvalidMode(other.to_string())),
        }
    }
}

impl fmt::Display for SupervisedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Single => "single",
            Self::Cv => "cv",
            Self::Inlp => "inlp",
        };
        f.write_str(s)
    }
}

/// Hyperparameters for supervised probes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisedOptions {
    /// L2 penalty used by `single` mode and by each INLP round
    pub l2_penalty: f64,
    /// Number of penalties tried by `cv`, log-spaced over [1e-4, 1e4]
    pub num_penalties: usize,
    /// Folds used by `cv`
    pub cv_folds: usize,
    /// Number of probes produced by `inlp`
    pub inlp_iterations: usize,
    /// Optimizer iterations per logistic regression fit
    pub max_iterations: u64,
}

impl Default for SupervisedOptions {
    fn default() -> Self {
        Self {
            l2_penalty: 0.001,
            num_penalties: 10,
            cv_folds: 5,
            inlp_iterations: 4,
            max_iterations: 100,
        }
    }
}

/// Settings shared by every kind of run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub data: DataConfig,
    pub normalization: Normalization,
    /// Number of GPUs to use; negative means all available
    pub num_gpus: i64,
    /// Worker count when no GPU is usable
    pub cpu_workers: usize,
    /// Base seed; each layer is seeded with `seed + layer` (wrapping)
    pub seed: u64,
    /// Write `debug.log` next to the results
    pub debug: bool,
    /// Output directory; a fresh one is created under the reporter root when unset
    pub out_dir: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            data: DataConfig::default(),
            normalization: Normalization::default(),
            num_gpus: -1,
            cpu_workers: 1,
            seed: 42,
            debug: false,
            out_dir: None,
        }
    }
}

/// Evaluation of previously trained reporters on (possibly new) datasets
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvalConfig {
    pub run: RunConfig,
    /// Experiment directory holding `reporters/` and optionally `lr_models/`,
    /// relative to the reporter root unless absolute
    pub source: PathBuf,
    /// Do not evaluate supervised probes even if they exist
    pub skip_supervised: bool,
    /// Reporters were trained one per prompt template
    pub probe_per_prompt: bool,
}

/// Training of supervised baselines on every layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElicitConfig {
    pub run: RunConfig,
    /// `None` trains no supervised probes
    pub supervised: Option<SupervisedMode>,
    pub supervised_options: SupervisedOptions,
}

impl Default for ElicitConfig {
    fn default() -> Self {
        Self {
            run: RunConfig::default(),
            supervised: Some(SupervisedMode::Single),
            supervised_options: SupervisedOptions::default(),
        }
    }
}
