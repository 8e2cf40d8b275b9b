//! Joint normalization of train and validation hidden states

use anyhow::Result;
use candle_core::Tensor;

use crate::config::Normalization;

/// Smallest per-feature scale divided by in elementwise mode
const MIN_SCALE: f32 = 1e-8;

/// Normalize train and validation hidden states with statistics taken from
/// the training set only. Both tensors are `(n, ...)`; statistics are
/// computed over the example axis.
pub fn normalize(train: &Tensor, val: &Tensor, method: Normalization) -> Result<(Tensor, Tensor)> {
    match method {
        Normalization::None => Ok((train.clone(), val.clone())),
        Normalization::MeanOnly => {
            let means = train.mean_keepdim(0)?;
            Ok((train.broadcast_sub(&means)?, val.broadcast_sub(&means)?))
        }
        Normalization::Elementwise => {
            let means = train.mean_keepdim(0)?;
            let train = train.broadcast_sub(&means)?;
            let val = val.broadcast_sub(&means)?;

            // The unbiased variance of a single example is undefined
            if train.dim(0)? < 2 {
                return Ok((train, val));
            }
            let scale = train.var_keepdim(0)?.sqrt()?.clamp(MIN_SCALE, f32::MAX)?;
            Ok((train.broadcast_div(&scale)?, val.broadcast_div(&scale)?))
        }
    }
}
