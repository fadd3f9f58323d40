//! Core traits and types shared across attention implementations.
//!
//! The dot-product core operates on tensors with layout `[N, seq, d]` where
//! `N` is either the batch or the batch multiplied by the head count; it has
//! no notion of heads. Trainable projections and dropout are collaborators
//! injected through [`Projection`] and [`Regularizer`], so the core itself
//! holds no parameters.

pub mod config;
pub mod errors;

use candle_core::Tensor;
use layers::{Dropout, ForwardMode, Linear};

use crate::masks::MaskPolicy;

pub use config::{AttentionConfig, MultiHeadConfig};
pub use errors::{AttentionError, Result};

/// Output tensor plus the normalised weights that produced it.
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    /// `[N, seq_q, d_v]` (or `[batch, seq_q, d_model]` after the multi-head wrapper).
    pub output: Tensor,
    /// `[N, seq_q, seq_kv]`, rows summing to one.
    pub weights: Tensor,
}

/// Unified interface for attention kernels.
///
/// * `q` is `[N, seq_q, d_k]`, `k` is `[N, seq_kv, d_k]`, `v` is `[N, seq_kv, d_v]`.
/// * `masks` are applied in order before normalisation; an empty slice means
///   no masking.
/// * `mode` decides whether the regulariser runs.
pub trait Attention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        masks: &[MaskPolicy],
        mode: ForwardMode,
    ) -> Result<AttentionOutput>;
}

/// A learned map `tensor -> tensor`, such as the query/key/value/output projections.
pub trait Projection: Send + Sync {
    fn project(&self, input: &Tensor) -> candle_core::Result<Tensor>;
}

/// Adapts a plain function or closure into a [`Projection`].
pub struct ProjectionFn<F>(pub F);

impl<F> Projection for ProjectionFn<F>
where
    F: Fn(&Tensor) -> candle_core::Result<Tensor> + Send + Sync,
{
    fn project(&self, input: &Tensor) -> candle_core::Result<Tensor> {
        (self.0)(input)
    }
}

impl Projection for Linear {
    fn project(&self, input: &Tensor) -> candle_core::Result<Tensor> {
        self.forward(input)
    }
}

/// A stochastic regulariser applied to attention weights.
///
/// Implementations must be the identity in [`ForwardMode::Inference`].
pub trait Regularizer: Send + Sync {
    fn regularize(&self, weights: &Tensor, mode: ForwardMode) -> candle_core::Result<Tensor>;
}

impl Regularizer for Dropout {
    fn regularize(&self, weights: &Tensor, mode: ForwardMode) -> candle_core::Result<Tensor> {
        self.apply(weights, mode)
    }
}
