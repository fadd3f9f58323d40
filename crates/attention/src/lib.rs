//! Scaled dot-product attention and a multi-head wrapper for the transformer project.
//!
//! [`DotProductAttention`] works on tensors laid out as `[N, seq, d]`, where
//! `N` is the batch or the batch multiplied by the head count. It scores
//! queries against keys, applies any [`MaskPolicy`] values in order,
//! normalises each row with a numerically stable softmax, and returns the
//! weighted sum of values together with the weights.
//!
//! [`MultiHeadAttention`] projects `[batch, seq, d_model]` inputs, folds the
//! heads into the batch axis, runs the core once, and merges the heads back
//! before the output projection.
//!
//! Reductions run in `f32`; outputs keep the dtype of the queries (bf16, f16,
//! or f32). Dropout on the weights only runs in [`ForwardMode::Training`].

pub mod core;
pub mod dot_product;
pub mod masks;
pub mod multihead;

pub use core::{
    Attention, AttentionConfig, AttentionError, AttentionOutput, MultiHeadConfig, Projection,
    ProjectionFn, Regularizer,
};
pub use dot_product::DotProductAttention;
pub use layers::ForwardMode;
pub use masks::{MaskPolicy, ValidLengths, WindowMask, MASK_VALUE};
pub use multihead::MultiHeadAttention;
