//! Scaled dot-product attention over a flat batch axis.
//!
//! Scores are computed as `q kᵀ` (divided by `sqrt(d_k)` when scaling is on),
//! masked according to the supplied [`MaskPolicy`] list, normalised with a
//! max-subtracted softmax along the key axis, optionally regularised, and used
//! to weight `v`. All arithmetic runs in `f32`; the output and the weights
//! are cast back to the query dtype.

use std::sync::{Arc, Mutex, OnceLock};

use candle_core::{DType, Tensor};
use candle_nn::ops::softmax_last_dim;
use layers::{checks, Dropout, ForwardMode};

use crate::core::{
    Attention, AttentionConfig, AttentionError, AttentionOutput, Regularizer, Result,
};
use crate::masks::{apply_masks, MaskPolicy};

/// Attention core with no trainable state.
///
/// The only mutable state is a copy of the most recent weight tensor, kept for
/// inspection through [`DotProductAttention::last_weights`].
pub struct DotProductAttention {
    config: AttentionConfig,
    regularizer: Arc<dyn Regularizer>,
    last_weights: Mutex<Option<Tensor>>,
    first_call: OnceLock<()>,
}

impl std::fmt::Debug for DotProductAttention {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DotProductAttention")
            .field("config", &self.config)
            .finish()
    }
}

impl DotProductAttention {
    /// Builds the core with a seeded [`Dropout`] derived from `config`.
    pub fn new(config: AttentionConfig) -> Result<Self> {
        config.validate()?;
        let dropout = Dropout::from_probability(config.dropout_p, config.dropout_seed)?;
        Ok(Self::with_regularizer(config, Arc::new(dropout)))
    }

    /// Builds the core around an externally supplied regulariser.
    ///
    /// `config.dropout_p` is ignored in favour of `regularizer`.
    pub fn with_regularizer(config: AttentionConfig, regularizer: Arc<dyn Regularizer>) -> Self {
        Self {
            config,
            regularizer,
            last_weights: Mutex::new(None),
            first_call: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    /// Weights produced by the most recent call, if any.
    pub fn last_weights(&self) -> Option<Tensor> {
        self.last_weights
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Scores, masks, normalises, and aggregates one batch.
    ///
    /// `q` is `[n, seq_q, d_k]`, `k` is `[n, seq_kv, d_k]`, and `v` is
    /// `[n, seq_kv, d_v]`. Returns the `[n, seq_q, d_v]` output together with
    /// the `[n, seq_q, seq_kv]` weights. The weights are taken before the
    /// regulariser runs.
    pub fn score_and_aggregate(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        masks: &[MaskPolicy],
        mode: ForwardMode,
    ) -> Result<AttentionOutput> {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::dot_product init scaled={} dropout_p={:?} trace_shapes={}",
                self.config.scaled,
                self.config.dropout_p,
                self.config.trace_shapes
            );
        }

        let (n, q_len, d_k) = validate_inputs(q, k, v)?;
        let (_, k_len, _) = k.dims3()?;
        if self.config.trace_shapes {
            log::trace!(
                "dot_product q={:?} k={:?} v={:?} masks={} mode={:?}",
                q.dims(),
                k.dims(),
                v.dims(),
                masks.len(),
                mode
            );
        }

        let dtype = q.dtype();
        let scores = self.compatibility(q, k, d_k)?;
        let scores = apply_masks(&scores, masks)?;
        let v_work = v.to_dtype(DType::F32)?;

        let weights = softmax_last_dim(&scores)?;
        let regularized = self.regularizer.regularize(&weights, mode)?;
        let output = regularized.matmul(&v_work)?;

        if self.config.trace_shapes {
            log::trace!(
                "dot_product scores=[{n}, {q_len}, {k_len}] output={:?}",
                output.dims()
            );
        }

        let output = output.to_dtype(dtype)?;
        let weights = weights.to_dtype(dtype)?;
        self.store_weights(&weights);
        Ok(AttentionOutput { output, weights })
    }

    /// Raw `f32` compatibility scores `[n, seq_q, seq_kv]`, scaled by
    /// `1 / sqrt(d_k)` when the config asks for it. No masking is applied.
    pub fn scores(&self, q: &Tensor, k: &Tensor) -> Result<Tensor> {
        let (_, _, d_k) = validate_inputs(q, k, k)?;
        self.compatibility(q, k, d_k)
    }

    fn compatibility(&self, q: &Tensor, k: &Tensor, d_k: usize) -> Result<Tensor> {
        let q_work = q.to_dtype(DType::F32)?;
        let k_t = k.to_dtype(DType::F32)?.transpose(1, 2)?.contiguous()?;
        let scores = q_work.matmul(&k_t)?;
        if self.config.scaled {
            Ok((scores / (d_k as f64).sqrt())?)
        } else {
            Ok(scores)
        }
    }

    fn store_weights(&self, weights: &Tensor) {
        match self.last_weights.lock() {
            Ok(mut guard) => *guard = Some(weights.clone()),
            Err(poisoned) => *poisoned.into_inner() = Some(weights.clone()),
        }
    }
}

impl Attention for DotProductAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        masks: &[MaskPolicy],
        mode: ForwardMode,
    ) -> Result<AttentionOutput> {
        self.score_and_aggregate(q, k, v, masks, mode)
    }
}

/// Checks device, dtype, and shape agreement; returns `(n, seq_q, d_k)`.
fn validate_inputs(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<(usize, usize, usize)> {
    let device = q.device();
    if !device.same_device(k.device()) || !device.same_device(v.device()) {
        return Err(AttentionError::shape("q, k, v must reside on the same device"));
    }

    let dtype = q.dtype();
    if dtype != k.dtype() || dtype != v.dtype() {
        return Err(AttentionError::shape("q, k, v must share the same dtype"));
    }
    if checks::expect_dtype_in("attention.q", q, &checks::FLOAT_DTYPES).is_err() {
        return Err(AttentionError::UnsupportedDType {
            requested: format!("{dtype:?}"),
        });
    }

    let (n, q_len, d_k) = q
        .dims3()
        .map_err(|_| AttentionError::shape(format!("q must be [n, seq_q, d_k], got {:?}", q.dims())))?;
    let (kn, k_len, kd) = k
        .dims3()
        .map_err(|_| AttentionError::shape(format!("k must be [n, seq_kv, d_k], got {:?}", k.dims())))?;
    let (vn, vk, _) = v
        .dims3()
        .map_err(|_| AttentionError::shape(format!("v must be [n, seq_kv, d_v], got {:?}", v.dims())))?;

    if d_k == 0 {
        return Err(AttentionError::config("d_k must be greater than zero"));
    }
    if kn != n || kd != d_k {
        return Err(AttentionError::shape(format!(
            "k shape mismatch: expected [{n}, ?, {d_k}] got [{kn}, {k_len}, {kd}]"
        )));
    }
    if vn != n || vk != k_len {
        return Err(AttentionError::shape(format!(
            "v shape mismatch: expected [{n}, {k_len}, ?] got {:?}",
            v.dims()
        )));
    }
    Ok((n, q_len, d_k))
}

#[cfg(test)]
mod tests;
