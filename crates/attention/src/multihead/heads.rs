//! Moving between `[batch, seq, d_model]` and per-head `[batch * heads, seq, head_dim]`.
//!
//! The split goes `[b, s, d] -> [b, s, h, d/h] -> [b, h, s, d/h] -> [b*h, s, d/h]`.
//! The transpose in the middle is what keeps each head's features together;
//! reshaping straight to `[b*h, s, d/h]` would interleave positions of
//! different heads without any error.

use candle_core::Tensor;

use crate::core::{AttentionError, Result};

/// Splits the last axis into `num_heads` slices and folds heads into the batch.
pub fn split_heads(tensor: &Tensor, num_heads: usize) -> Result<Tensor> {
    if num_heads == 0 {
        return Err(AttentionError::config("num_heads must be greater than zero"));
    }
    let (batch, seq, width) = tensor.dims3().map_err(|_| {
        AttentionError::shape(format!(
            "split_heads expects [batch, seq, d_model], got {:?}",
            tensor.dims()
        ))
    })?;
    if width % num_heads != 0 {
        return Err(AttentionError::config(format!(
            "d_model ({width}) must be divisible by num_heads ({num_heads})"
        )));
    }
    let head_dim = width / num_heads;
    Ok(tensor
        .reshape((batch, seq, num_heads, head_dim))?
        .transpose(1, 2)?
        .contiguous()?
        .reshape((batch * num_heads, seq, head_dim))?)
}

/// Inverse of [`split_heads`].
pub fn merge_heads(tensor: &Tensor, num_heads: usize) -> Result<Tensor> {
    if num_heads == 0 {
        return Err(AttentionError::config("num_heads must be greater than zero"));
    }
    let (rows, seq, head_dim) = tensor.dims3().map_err(|_| {
        AttentionError::shape(format!(
            "merge_heads expects [batch * heads, seq, head_dim], got {:?}",
            tensor.dims()
        ))
    })?;
    if rows % num_heads != 0 {
        return Err(AttentionError::shape(format!(
            "leading dimension {rows} is not a multiple of num_heads ({num_heads})"
        )));
    }
    let batch = rows / num_heads;
    Ok(tensor
        .reshape((batch, num_heads, seq, head_dim))?
        .transpose(1, 2)?
        .contiguous()?
        .reshape((batch, seq, num_heads * head_dim))?)
}
