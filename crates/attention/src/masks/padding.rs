//! Valid-length and padding-indicator masks.
//!
//! Both builders return `u8` disallow tensors shaped `[n, q_len, k_len]`.

use candle_core::{DType, Device, Tensor};

use crate::core::{AttentionError, Result};

/// Number of usable keys per sequence, or per query.
#[derive(Debug, Clone)]
pub enum ValidLengths {
    /// Shape `[n]`; the same length applies to every query of a sequence.
    PerSequence(Tensor),
    /// Shape `[n, seq_q]`; each query row carries its own length.
    PerQuery(Tensor),
}

impl ValidLengths {
    /// Picks the variant from the tensor rank (1 or 2).
    pub fn from_tensor(lengths: Tensor) -> Result<Self> {
        match lengths.rank() {
            1 => Ok(Self::PerSequence(lengths)),
            2 => Ok(Self::PerQuery(lengths)),
            rank => Err(AttentionError::shape(format!(
                "valid lengths must be rank 1 or 2, got rank {rank} ({:?})",
                lengths.dims()
            ))),
        }
    }

    /// Builds per-sequence lengths from a slice.
    pub fn per_sequence(lengths: &[u32], device: &Device) -> Result<Self> {
        Ok(Self::PerSequence(Tensor::new(lengths, device)?))
    }

    pub fn tensor(&self) -> &Tensor {
        match self {
            Self::PerSequence(t) | Self::PerQuery(t) => t,
        }
    }

    /// Repeats each row `repeats` times along the leading axis.
    pub fn repeat_interleave(&self, repeats: usize) -> Result<Self> {
        let tensor = super::repeat_interleave_batch(self.tensor(), repeats)?;
        Ok(match self {
            Self::PerSequence(_) => Self::PerSequence(tensor),
            Self::PerQuery(_) => Self::PerQuery(tensor),
        })
    }
}

/// Construct the disallow mask hiding keys at or beyond each valid length.
///
/// Lengths must lie in `[0, k_len]`; a length of zero masks the whole row.
pub fn valid_length_disallow_mask(
    lengths: &ValidLengths,
    n: usize,
    q_len: usize,
    k_len: usize,
) -> Result<Tensor> {
    let tensor = lengths.tensor();
    let device = tensor.device();
    let lens = match lengths {
        ValidLengths::PerSequence(t) => {
            if t.dims() != [n] {
                return Err(AttentionError::shape(format!(
                    "valid lengths expected [{n}] got {:?}",
                    t.dims()
                )));
            }
            t.to_dtype(DType::F32)?.reshape((n, 1, 1))?
        }
        ValidLengths::PerQuery(t) => {
            if t.dims() != [n, q_len] {
                return Err(AttentionError::shape(format!(
                    "valid lengths expected [{n}, {q_len}] got {:?}",
                    t.dims()
                )));
            }
            t.to_dtype(DType::F32)?.reshape((n, q_len, 1))?
        }
    };

    let values = lens.flatten_all()?.to_vec1::<f32>()?;
    if let Some(bad) = values
        .iter()
        .find(|&&v| v < 0.0 || v > k_len as f32 || v.fract() != 0.0)
    {
        return Err(AttentionError::shape(format!(
            "valid length {bad} outside [0, {k_len}]"
        )));
    }

    let columns = Tensor::arange(0u32, k_len as u32, device)?
        .to_dtype(DType::F32)?
        .reshape((1, 1, k_len))?;
    let mask = columns
        .broadcast_ge(&lens)?
        .broadcast_as((n, q_len, k_len))?
        .contiguous()?;
    Ok(mask)
}

/// Construct the disallow mask from padding indicators shaped `[n, k_len]`.
///
/// Any non-zero indicator marks that key as padding for every query.
pub fn padding_disallow_mask(
    indicators: &Tensor,
    n: usize,
    q_len: usize,
    k_len: usize,
) -> Result<Tensor> {
    if indicators.dims() != [n, k_len] {
        return Err(AttentionError::shape(format!(
            "padding indicators expected [{n}, {k_len}] got {:?}",
            indicators.dims()
        )));
    }
    let flags = indicators.to_dtype(DType::F32)?;
    let mask = flags
        .ne(&flags.zeros_like()?)?
        .reshape((n, 1, k_len))?
        .broadcast_as((n, q_len, k_len))?
        .contiguous()?;
    Ok(mask)
}
