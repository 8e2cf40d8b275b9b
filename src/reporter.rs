//! Trained reporters and their on-disk layout
//!
//! A reporter maps hidden states `(n, v, k, d)` to credences `(n, v, k)`.
//! How it was trained is not this crate's concern; only the persisted
//! linear head is. Storage under `reporters/` is either one file per layer
//! (`layer_{layer}.safetensors`) or one sub-directory per ensemble member
//! with the same per-layer files inside.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor, D};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::ElkError;

const WEIGHT_FIELD: &str = "weight";
const BIAS_FIELD: &str = "bias";
const REPORTER_EXTENSION: &str = "safetensors";

/// Path of a single reporter file for a layer
pub fn reporter_path(dir: &Path, layer: usize) -> PathBuf {
    dir.join(format!("layer_{layer}.{REPORTER_EXTENSION}"))
}

/// Options for [`Reporter::credences`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CredenceOptions {
    /// Keep one credence per prompt variant instead of averaging them
    pub super_full: bool,
    /// Ensemble member `i` scores only prompt variant `i`
    pub per_prompt: bool,
}

/// Anything that turns hidden states into credences
pub trait Reporter: Send + Sync {
    /// Credences `(n, v', k)` for hidden states `(n, v, k, d)`; `v' = v`
    /// unless an ensemble is asked to average over variants
    fn credences(&self, hiddens: &Tensor, opts: CredenceOptions) -> Result<Tensor>;

    /// Number of underlying linear heads
    fn num_members(&self) -> usize {
        1
    }
}

/// A single linear reporter `w·h + b`
#[derive(Debug, Clone)]
pub struct SingleReporter {
    weight: Tensor,
    bias: f64,
}

impl SingleReporter {
    pub fn new(weight: Tensor, bias: f64) -> Result<Self> {
        if weight.rank() != 1 {
            return Err(ElkError::InvalidShape {
                what: WEIGHT_FIELD.into(),
                detail: format!("expected (d,), got {:?}", weight.dims()),
            }
            .into());
        }
        Ok(Self {
            weight: weight.to_dtype(DType::F32)?,
            bias,
        })
    }

    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        let tensors = candle_core::safetensors::load(path, device)
            .with_context(|| format!("Failed to read reporter {}", path.display()))?;
        let weight = tensors
            .get(WEIGHT_FIELD)
            .with_context(|| format!("No `{WEIGHT_FIELD}` in {}", path.display()))?;
        let bias = match tensors.get(BIAS_FIELD) {
            Some(b) => b
                .to_dtype(DType::F64)?
                .flatten_all()?
                .to_vec1::<f64>()?
                .first()
                .copied()
                .unwrap_or(0.0),
            None => 0.0,
        };
        Self::new(weight.clone(), bias)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let bias = Tensor::new(&[self.bias as f32], self.weight.device())?;
        let tensors = HashMap::from([
            (WEIGHT_FIELD.to_string(), self.weight.clone()),
            (BIAS_FIELD.to_string(), bias),
        ]);
        candle_core::safetensors::save(&tensors, path)
            .with_context(|| format!("Failed to write reporter {}", path.display()))?;
        Ok(())
    }

    pub fn hidden_size(&self) -> usize {
        self.weight.dims()[0]
    }
}

impl Reporter for SingleReporter {
    fn credences(&self, hiddens: &Tensor, _opts: CredenceOptions) -> Result<Tensor> {
        let d = hiddens.dim(D::Minus1)?;
        if d != self.hidden_size() {
            return Err(ElkError::DimensionMismatch {
                expected: self.hidden_size(),
                actual: d,
            }
            .into());
        }
        let weight = self.weight.to_device(hiddens.device())?;
        Ok(hiddens
            .to_dtype(DType::F32)?
            .broadcast_mul(&weight)?
            .sum(D::Minus1)?
            .affine(1.0, self.bias)?)
    }
}

/// An ensemble of single reporters
#[derive(Debug, Clone)]
pub struct MultiReporter {
    members: Vec<SingleReporter>,
}

impl MultiReporter {
    pub fn new(members: Vec<SingleReporter>) -> Result<Self> {
        anyhow::ensure!(!members.is_empty(), "A multi-reporter needs at least one member");
        Ok(Self { members })
    }

    /// Load the layer's file from every member sub-directory of `dir`
    pub fn load(dir: &Path, layer: usize, device: &Device) -> Result<Self> {
        let mut members = Vec::new();
        for member_dir in sorted_entries(dir)? {
            if !member_dir.is_dir() {
                continue;
            }
            let path = reporter_path(&member_dir, layer);
            if path.exists() {
                members.push(SingleReporter::load(&path, device)?);
            } else {
                debug!("Member {} has no layer {layer}", member_dir.display());
            }
        }

        if members.is_empty() {
            return Err(ElkError::ReporterNotFound {
                layer,
                path: dir.to_path_buf(),
            }
            .into());
        }
        Self::new(members)
    }
}

impl Reporter for MultiReporter {
    fn credences(&self, hiddens: &Tensor, opts: CredenceOptions) -> Result<Tensor> {
        if opts.per_prompt {
            let (_, v, _, _) = hiddens.dims4()?;
            if v != self.members.len() {
                return Err(ElkError::InvalidShape {
                    what: "prompt variants".into(),
                    detail: format!("{v} variants for {} per-prompt reporters", self.members.len()),
                }
                .into());
            }
            let per_variant = self
                .members
                .iter()
                .enumerate()
                .map(|(i, member)| member.credences(&hiddens.narrow(1, i, 1)?, opts))
                .collect::<Result<Vec<_>>>()?;
            return Ok(Tensor::cat(&per_variant, 1)?);
        }

        let all = self
            .members
            .iter()
            .map(|member| member.credences(hiddens, opts))
            .collect::<Result<Vec<_>>>()?;
        let mean = Tensor::stack(&all, 0)?.mean(0)?;
        if opts.super_full {
            Ok(mean)
        } else {
            Ok(mean.mean_keepdim(1)?)
        }
    }

    fn num_members(&self) -> usize {
        self.members.len()
    }
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = std::fs::read_dir(dir)?
        .map(|e| e.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort();
    Ok(entries)
}

/// Load the reporter for `layer` from a `reporters/` directory.
///
/// A directory whose first entry is a reporter file holds single reporters;
/// anything else is read as an ensemble. Missing or empty storage is an
/// [`ElkError::ReporterNotFound`].
pub fn load_reporter(dir: &Path, layer: usize, device: &Device) -> Result<Box<dyn Reporter>> {
    let not_found = || ElkError::ReporterNotFound {
        layer,
        path: dir.to_path_buf(),
    };

    if !dir.is_dir() {
        return Err(not_found().into());
    }
    let entries = sorted_entries(dir)?;
    let first = entries.first().ok_or_else(not_found)?;

    let is_single = first.is_file()
        && first.extension().and_then(|e| e.to_str()) == Some(REPORTER_EXTENSION);
    if !is_single {
        return Ok(Box::new(MultiReporter::load(dir, layer, device)?));
    }

    let path = reporter_path(dir, layer);
    if !path.exists() {
        return Err(not_found().into());
    }
    Ok(Box::new(SingleReporter::load(&path, device)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reporter(weight: &[f32], bias: f64) -> SingleReporter {
        let w = Tensor::from_slice(weight, (weight.len(),), &Device::Cpu).unwrap();
        SingleReporter::new(w, bias).unwrap()
    }

    fn hiddens() -> Tensor {
        // (n=1, v=2, k=2, d=2)
        Tensor::from_slice(
            &[1f32, 0.0, 0.0, 1.0, 2.0, 0.0, 0.0, 2.0],
            (1, 2, 2, 2),
            &Device::Cpu,
        )
        .unwrap()
    }

    fn values(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn test_single_reporter_credences() {
        let r = reporter(&[1.0, -1.0], 0.5);
        let c = r.credences(&hiddens(), CredenceOptions::default()).unwrap();
        assert_eq!(c.dims(), &[1, 2, 2]);
        assert_eq!(values(&c), vec![1.5, -0.5, 2.5, -1.5]);
    }

    #[test]
    fn test_multi_reporter_super_full() {
        let multi = MultiReporter::new(vec![reporter(&[1.0, 0.0], 0.0), reporter(&[0.0, 1.0], 0.0)])
            .unwrap();
        let full = multi
            .credences(
                &hiddens(),
                CredenceOptions {
                    super_full: true,
                    per_prompt: false,
                },
            )
            .unwrap();
        assert_eq!(full.dims(), &[1, 2, 2]);
        assert_eq!(values(&full), vec![0.5, 0.5, 1.0, 1.0]);

        let collapsed = multi.credences(&hiddens(), CredenceOptions::default()).unwrap();
        assert_eq!(collapsed.dims(), &[1, 1, 2]);
    }

    #[test]
    fn test_multi_reporter_per_prompt() {
        let multi = MultiReporter::new(vec![reporter(&[1.0, 0.0], 0.0), reporter(&[0.0, 1.0], 0.0)])
            .unwrap();
        let opts = CredenceOptions {
            super_full: true,
            per_prompt: true,
        };
        let c = multi.credences(&hiddens(), opts).unwrap();
        // Variant 0 scored by member 0, variant 1 by member 1
        assert_eq!(values(&c), vec![1.0, 0.0, 0.0, 2.0]);
    }

    #[test]
    fn test_load_single_and_multi() {
        let dir = tempfile::tempdir().unwrap();
        let single_dir = dir.path().join("single");
        std::fs::create_dir_all(&single_dir).unwrap();
        reporter(&[1.0, 2.0], 0.25)
            .save(&reporter_path(&single_dir, 0))
            .unwrap();

        let loaded = load_reporter(&single_dir, 0, &Device::Cpu).unwrap();
        assert_eq!(loaded.num_members(), 1);
        assert!(load_reporter(&single_dir, 1, &Device::Cpu).is_err());

        let multi_dir = dir.path().join("multi");
        for member in ["a", "b", "c"] {
            let member_dir = multi_dir.join(member);
            std::fs::create_dir_all(&member_dir).unwrap();
            reporter(&[1.0, 2.0], 0.0)
                .save(&reporter_path(&member_dir, 0))
                .unwrap();
        }
        let loaded = load_reporter(&multi_dir, 0, &Device::Cpu).unwrap();
        assert_eq!(loaded.num_members(), 3);
    }

    #[test]
    fn test_empty_storage_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_reporter(dir.path(), 4, &Device::Cpu).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<ElkError>(),
            Some(ElkError::ReporterNotFound { layer: 4, .. })
        ));

        let missing = dir.path().join("nope");
        assert!(load_reporter(&missing, 0, &Device::Cpu).is_err());
    }
}
