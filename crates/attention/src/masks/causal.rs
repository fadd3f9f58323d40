//! Look-ahead (causal) masks.
//!
//! The mask is a `u8` tensor shaped `[q_len, k_len]` with `1` wherever query
//! `i` would see a later key `j > i`. It is broadcast across the batch by
//! [`apply_masks`](super::apply_masks).

use candle_core::{Device, Result, Tensor};

/// Construct the disallow mask for look-ahead positions.
///
/// Queries and keys are aligned at position zero, so when `k_len > q_len`
/// the trailing keys are hidden from every query.
pub fn causal_disallow_mask(device: &Device, q_len: usize, k_len: usize) -> Result<Tensor> {
    let data: Vec<u8> = (0..q_len)
        .flat_map(|i| (0..k_len).map(move |j| u8::from(j > i)))
        .collect();
    Tensor::from_vec(data, (q_len, k_len), device)
}
