//! Error taxonomy for ELK runs
//!
//! Module functions return `anyhow::Result`; the variants below are the
//! failures callers are expected to tell apart (via `downcast_ref`).

use std::path::PathBuf;

/// Errors raised by the orchestration and probing code.
#[derive(Debug, thiserror::Error)]
pub enum ElkError {
    /// A required tensor field is absent from a split.
    #[error("missing field `{field}` in split `{split}` of dataset `{dataset}`")]
    MissingField {
        dataset: String,
        split: String,
        field: String,
    },

    /// No reporter could be found for a layer.
    #[error("no reporter for layer {layer} under {}", path.display())]
    ReporterNotFound { layer: usize, path: PathBuf },

    /// Unknown supervised training mode.
    #[error("unknown supervised mode: {0} (expected one of: single, cv, inlp)")]
    InvalidMode(String),

    /// Unknown normalization method.
    #[error("unknown normalization method: {0} (expected one of: none, elementwise, meanonly)")]
    InvalidNormalization(String),

    /// The run was interrupted before every layer finished.
    #[error("interrupted")]
    Interrupted,

    /// A probe or reporter was applied to hidden states of another width.
    #[error("dimension mismatch: expected {expected} features, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Partitions disagree on which layers they carry.
    #[error("inconsistent layers: {0}")]
    InconsistentLayers(String),

    /// A dataset lacks the partitions needed for a train/val run.
    #[error("dataset `{dataset}` needs at least two splits, found: {found:?}")]
    MissingSplits { dataset: String, found: Vec<String> },

    /// A tensor has an unexpected rank or size.
    #[error("invalid shape for {what}: {detail}")]
    InvalidShape { what: String, detail: String },

    /// A label is outside the class range.
    #[error("label {label} out of range for {num_classes} classes")]
    InvalidLabel { label: usize, num_classes: usize },
}
