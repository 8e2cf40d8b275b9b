// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // f64→f32 weights, usize→u32 labels
#![allow(clippy::cast_possible_wrap)] // usize→i64 in tensor ops
#![allow(clippy::many_single_char_names)] // x, y, n, v, k, d standard in math
#![allow(clippy::similar_names)] // related variables like `x0`/`x1`
#![allow(clippy::module_name_repetitions)] // ElkError in error.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive

//! elk-rs: Eliciting Latent Knowledge from cached hidden states
//!
//! Trains and evaluates linear reporters that read truth values off the
//! hidden activations of a language model, layer by layer, and aggregates
//! the statistics into CSV tables.
//!
//! ## Architecture
//!
//! - `config`: Run, data, eval and elicit configuration
//! - `dataset`: Cached hidden-state splits stored as safetensors
//! - `files`: Output-directory layout, config and metadata persistence
//! - `preprocessing`: Train-statistics normalization of hidden states
//! - `metrics`: Accuracy, calibration and AUROC under prompt ensembling
//! - `classifier`: Logistic-regression probes with linfa (single, CV, INLP)
//! - `supervised`: Probe training on flattened activations and probe storage
//! - `reporter`: Single and ensemble reporters loaded per layer
//! - `writer`: Crash-safe, layer-ordered CSV output
//! - `run`: Per-layer orchestration over a device-bound worker pool
//! - `evaluate`: Evaluation of a finished run on (new) datasets
//! - `train`: Supervised baseline training run

pub mod classifier;
pub mod config;
pub mod dataset;
pub mod error;
pub mod evaluate;
pub mod files;
pub mod metrics;
pub mod preprocessing;
pub mod reporter;
pub mod run;
pub mod supervised;
pub mod train;
pub mod writer;

pub use classifier::{Classifier, InlpResult};
pub use config::{
    DataConfig, ElicitConfig, EvalConfig, Normalization, RunConfig, SupervisedMode,
    SupervisedOptions,
};
pub use dataset::{get_layers, CachedHiddenStates, Dataset, DatasetDict, Extract, Split};
pub use error::ElkError;
pub use evaluate::Eval;
pub use metrics::{evaluate_preds, EvalResult, Interval, PromptEnsembling};
pub use reporter::{load_reporter, CredenceOptions, MultiReporter, Reporter, SingleReporter};
pub use run::{
    get_device, make_reproducible, select_usable_devices, LayerApplied, LayerData, LayerOutput,
    PreparedData, ResultRow, Run, SplitKind,
};
pub use supervised::{load_probes, save_probes, train_supervised};
pub use train::Elicit;
pub use writer::{write_func_to_file, CsvTable, ResultWriter, StatResult};
