//! Masking policies applied to attention scores before normalisation.
//!
//! Causal, padding, and valid-length policies each produce a `u8` "disallow"
//! tensor shaped `[n, q_len, k_len]`. These are OR-ed together and applied
//! once, replacing disallowed scores with [`MASK_VALUE`]. Window masks are
//! additive and are summed into the scores as they are encountered. Because
//! the sentinel is finite, a row with every key disallowed normalises to a
//! uniform distribution instead of NaN.

pub mod causal;
pub mod padding;
pub mod window;

use candle_core::{Device, Tensor};

use crate::core::{AttentionError, Result};

/// Score written into disallowed positions.
pub const MASK_VALUE: f32 = -1e6;

pub use causal::causal_disallow_mask;
pub use padding::{padding_disallow_mask, valid_length_disallow_mask, ValidLengths};
pub use window::{apply_window_mask, WindowMask};

/// One masking rule. Several may be combined in a slice.
#[derive(Debug, Clone)]
pub enum MaskPolicy {
    /// No-op.
    None,
    /// Hide keys after the query position.
    Causal,
    /// Padding indicators shaped `[n, seq_kv]`; non-zero marks a padded key.
    Padding(Tensor),
    /// Hide keys at or beyond each valid length.
    ValidLength(ValidLengths),
    /// Additive local-attention mask.
    Window(WindowMask),
}

impl MaskPolicy {
    /// Rewrites the policy for a batch whose rows were expanded to
    /// `batch * num_heads`, each source row repeated `num_heads` times.
    pub fn expand_for_heads(&self, num_heads: usize) -> Result<Self> {
        Ok(match self {
            MaskPolicy::None => MaskPolicy::None,
            MaskPolicy::Causal => MaskPolicy::Causal,
            MaskPolicy::Padding(indicators) => {
                MaskPolicy::Padding(repeat_interleave_batch(indicators, num_heads)?)
            }
            MaskPolicy::ValidLength(lengths) => {
                MaskPolicy::ValidLength(lengths.repeat_interleave(num_heads)?)
            }
            MaskPolicy::Window(window) => {
                MaskPolicy::Window(window.clone().with_heads(num_heads))
            }
        })
    }

    fn name(&self) -> &'static str {
        match self {
            MaskPolicy::None => "none",
            MaskPolicy::Causal => "causal",
            MaskPolicy::Padding(_) => "padding",
            MaskPolicy::ValidLength(_) => "valid_length",
            MaskPolicy::Window(_) => "window",
        }
    }
}

/// Applies `masks` in order to `scores` shaped `[n, q_len, k_len]`.
pub fn apply_masks(scores: &Tensor, masks: &[MaskPolicy]) -> Result<Tensor> {
    let (n, q_len, k_len) = scores.dims3()?;
    let device = scores.device();

    let mut scores = scores.clone();
    let mut disallowed: Option<Tensor> = None;
    for policy in masks {
        log::trace!("applying {} mask to scores [{n}, {q_len}, {k_len}]", policy.name());
        let next = match policy {
            MaskPolicy::None => continue,
            MaskPolicy::Window(window) => {
                scores = apply_window_mask(&scores, window)?;
                continue;
            }
            MaskPolicy::Causal => causal_disallow_mask(device, q_len, k_len)?
                .unsqueeze(0)?
                .broadcast_as((n, q_len, k_len))?
                .contiguous()?,
            MaskPolicy::Padding(indicators) => {
                ensure_same_device(device, indicators.device(), "padding")?;
                padding_disallow_mask(indicators, n, q_len, k_len)?
            }
            MaskPolicy::ValidLength(lengths) => {
                ensure_same_device(device, lengths.tensor().device(), "valid_length")?;
                valid_length_disallow_mask(lengths, n, q_len, k_len)?
            }
        };
        disallowed = Some(match disallowed {
            Some(acc) => acc.maximum(&next)?,
            None => next,
        });
    }

    match disallowed {
        Some(mask) => {
            let fill = Tensor::new(MASK_VALUE, device)?
                .to_dtype(scores.dtype())?
                .broadcast_as((n, q_len, k_len))?;
            Ok(mask.where_cond(&fill, &scores)?)
        }
        None => Ok(scores),
    }
}

/// Repeats every row of `tensor` `repeats` times along axis 0, keeping copies
/// of the same row adjacent: `[a, b] -> [a, a, b, b]`.
pub fn repeat_interleave_batch(tensor: &Tensor, repeats: usize) -> Result<Tensor> {
    if repeats == 0 {
        return Err(AttentionError::config("repeat count must be non-zero"));
    }
    let dims = tensor.dims();
    let (&rows, rest) = dims
        .split_first()
        .ok_or_else(|| AttentionError::shape("cannot repeat a scalar along the batch axis"))?;
    let mut expanded = vec![rows, repeats];
    expanded.extend_from_slice(rest);
    let mut merged = vec![rows * repeats];
    merged.extend_from_slice(rest);
    Ok(tensor
        .unsqueeze(1)?
        .broadcast_as(expanded)?
        .contiguous()?
        .reshape(merged)?)
}

fn ensure_same_device(expected: &Device, actual: &Device, what: &str) -> Result<()> {
    if expected.same_device(actual) {
        Ok(())
    } else {
        Err(AttentionError::shape(format!(
            "{what} mask must reside on the same device as the scores"
        )))
    }
}
