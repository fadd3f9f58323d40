//! Additive window masks for local attention.
//!
//! A window mask holds one `[q_len, k_len]` slab per window, with `0.0` where
//! attention is permitted and a large negative value where it is not. The
//! leading axis of the score tensor is read as `[groups, windows, heads]`, so
//! consecutive batch rows cycle through windows and, within a window, through
//! heads.

use candle_core::{DType, Tensor};

use crate::core::{AttentionError, Result};

/// Window mask shaped `[num_windows, q_len, k_len]` plus its head grouping.
#[derive(Debug, Clone)]
pub struct WindowMask {
    mask: Tensor,
    heads: usize,
}

impl WindowMask {
    /// Wraps a rank-3 additive mask; the head grouping starts at one.
    pub fn new(mask: Tensor) -> Result<Self> {
        if mask.rank() != 3 {
            return Err(AttentionError::config(format!(
                "window mask must be [num_windows, q_len, k_len], got {:?}",
                mask.dims()
            )));
        }
        if mask.dims()[0] == 0 {
            return Err(AttentionError::config("window mask has no windows"));
        }
        Ok(Self { mask, heads: 1 })
    }

    /// Records how many heads share each window row.
    pub fn with_heads(mut self, heads: usize) -> Self {
        self.heads = heads.max(1);
        self
    }

    pub fn num_windows(&self) -> usize {
        self.mask.dims()[0]
    }

    pub fn heads(&self) -> usize {
        self.heads
    }

    pub fn tensor(&self) -> &Tensor {
        &self.mask
    }
}

/// Adds `window` to `scores` (`[n, q_len, k_len]`, `f32`), broadcasting each
/// window slab across its heads and groups.
///
/// Fails when `n` is not a multiple of `num_windows * heads` or the slab shape
/// differs from the score shape.
pub fn apply_window_mask(scores: &Tensor, window: &WindowMask) -> Result<Tensor> {
    let (n, q_len, k_len) = scores.dims3()?;
    let (num_windows, mq, mk) = window.mask.dims3()?;
    if mq != q_len || mk != k_len {
        return Err(AttentionError::config(format!(
            "window mask slab [{mq}, {mk}] does not match scores [{q_len}, {k_len}]"
        )));
    }
    let group = num_windows * window.heads;
    if n % group != 0 {
        return Err(AttentionError::config(format!(
            "batch dimension {n} is not divisible by num_windows ({num_windows}) * heads ({})",
            window.heads
        )));
    }

    let mask = window
        .mask
        .to_dtype(DType::F32)?
        .unsqueeze(1)?
        .unsqueeze(0)?;
    let masked = scores
        .reshape((n / group, num_windows, window.heads, q_len, k_len))?
        .broadcast_add(&mask)?
        .reshape((n, q_len, k_len))?;
    Ok(masked)
}
