//! Multi-head attention built on [`DotProductAttention`].
//!
//! Inputs are `[batch, seq, d_model]`. Each of queries, keys, and values is
//! projected, split into `num_heads` slices of width `d_model / num_heads`,
//! and folded into the batch axis so the dot-product core sees
//! `[batch * num_heads, seq, head_dim]`. The per-head outputs are merged back
//! and passed through the output projection.

pub mod heads;

use std::{fmt, sync::Arc};

use candle_core::{DType, Device, Tensor};
use layers::{ForwardMode, Linear, LinearConfig, LinearInit};

use crate::core::{
    Attention, AttentionError, AttentionOutput, MultiHeadConfig, Projection, Regularizer, Result,
};
use crate::dot_product::DotProductAttention;
use crate::masks::MaskPolicy;

pub use heads::{merge_heads, split_heads};

/// Multi-head attention with injected projections.
pub struct MultiHeadAttention {
    config: MultiHeadConfig,
    w_q: Box<dyn Projection>,
    w_k: Box<dyn Projection>,
    w_v: Box<dyn Projection>,
    w_o: Box<dyn Projection>,
    attention: DotProductAttention,
}

impl fmt::Debug for MultiHeadAttention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiHeadAttention")
            .field("d_model", &self.config.d_model)
            .field("num_heads", &self.config.num_heads)
            .field("scaled", &self.config.scaled)
            .finish()
    }
}

impl MultiHeadAttention {
    /// Wires the supplied projections around a dot-product core.
    ///
    /// Every projection must map width `d_model` to width `d_model`; this is
    /// checked on each call since the projections are opaque.
    pub fn new(
        config: MultiHeadConfig,
        w_q: Box<dyn Projection>,
        w_k: Box<dyn Projection>,
        w_v: Box<dyn Projection>,
        w_o: Box<dyn Projection>,
    ) -> Result<Self> {
        config.validate()?;
        let attention = DotProductAttention::new(config.attention_config())?;
        Ok(Self {
            config,
            w_q,
            w_k,
            w_v,
            w_o,
            attention,
        })
    }

    /// Builds the four projections as [`Linear`] layers drawn from `init`.
    ///
    /// The query, key, value, and output layers use seeds `seed`, `seed + 1`,
    /// `seed + 2`, and `seed + 3`.
    pub fn with_init(
        config: MultiHeadConfig,
        init: &LinearInit,
        seed: u64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        config.validate()?;
        let linear_config = LinearConfig::new(config.d_model, config.d_model).with_bias(config.use_bias);
        let build = |offset: u64| -> Result<Box<dyn Projection>> {
            let layer = Linear::with_init(
                linear_config.clone(),
                init,
                seed.wrapping_add(offset),
                device,
                dtype,
            )?;
            Ok(Box::new(layer))
        };
        let (w_q, w_k, w_v, w_o) = (build(0)?, build(1)?, build(2)?, build(3)?);
        Self::new(config, w_q, w_k, w_v, w_o)
    }

    /// Replaces the dropout derived from the config with `regularizer`.
    pub fn with_regularizer(mut self, regularizer: Arc<dyn Regularizer>) -> Self {
        self.attention =
            DotProductAttention::with_regularizer(self.config.attention_config(), regularizer);
        self
    }

    pub fn config(&self) -> &MultiHeadConfig {
        &self.config
    }

    /// Weights of the most recent call, shaped `[batch * num_heads, seq_q, seq_kv]`.
    pub fn last_weights(&self) -> Option<Tensor> {
        self.attention.last_weights()
    }

    /// Splits `[batch, seq, d_model]` into `[batch * num_heads, seq, head_dim]`.
    pub fn split_heads(&self, tensor: &Tensor) -> Result<Tensor> {
        split_heads(tensor, self.config.num_heads)
    }

    /// Inverse of [`MultiHeadAttention::split_heads`].
    pub fn merge_heads(&self, tensor: &Tensor) -> Result<Tensor> {
        merge_heads(tensor, self.config.num_heads)
    }

    /// Runs the full projection, split, attend, merge, and output pipeline.
    ///
    /// `masks` are written for the unsplit batch: padding indicators and
    /// valid lengths have `batch` rows and are replicated once per head.
    /// The returned output is `[batch, seq_q, d_model]`; the weights stay in
    /// per-head form, `[batch * num_heads, seq_q, seq_kv]`.
    pub fn multi_head_attention(
        &self,
        queries: &Tensor,
        keys: &Tensor,
        values: &Tensor,
        masks: &[MaskPolicy],
        mode: ForwardMode,
    ) -> Result<AttentionOutput> {
        let batch = self.validate_inputs(queries, keys, values)?;
        let heads = self.config.num_heads;
        self.validate_window_grouping(batch, masks)?;

        let q = self.split_heads(&self.project("w_q", &*self.w_q, queries)?)?;
        let k = self.split_heads(&self.project("w_k", &*self.w_k, keys)?)?;
        let v = self.split_heads(&self.project("w_v", &*self.w_v, values)?)?;
        if self.config.trace_shapes {
            log::trace!("multihead split q={:?} k={:?} v={:?}", q.dims(), k.dims(), v.dims());
        }

        let head_masks = masks
            .iter()
            .map(|policy| policy.expand_for_heads(heads))
            .collect::<Result<Vec<_>>>()?;

        let AttentionOutput { output, weights } =
            self.attention.score_and_aggregate(&q, &k, &v, &head_masks, mode)?;

        let merged = self.merge_heads(&output)?;
        let output = self.project("w_o", &*self.w_o, &merged)?;
        Ok(AttentionOutput { output, weights })
    }

    fn project(&self, name: &str, projection: &dyn Projection, input: &Tensor) -> Result<Tensor> {
        let projected = projection.project(input)?;
        let (batch, seq, _) = input.dims3()?;
        if projected.dims() != [batch, seq, self.config.d_model] {
            return Err(AttentionError::shape(format!(
                "{name} produced {:?}, expected [{batch}, {seq}, {}]",
                projected.dims(),
                self.config.d_model
            )));
        }
        Ok(projected)
    }

    fn validate_inputs(&self, queries: &Tensor, keys: &Tensor, values: &Tensor) -> Result<usize> {
        let d_model = self.config.d_model;
        let mut shapes = Vec::with_capacity(3);
        for (name, tensor) in [("queries", queries), ("keys", keys), ("values", values)] {
            match tensor.dims() {
                &[batch, seq, width] if width == d_model => shapes.push((batch, seq)),
                dims => {
                    return Err(AttentionError::shape(format!(
                        "{name} expected [batch, seq, {d_model}], got {dims:?}"
                    )))
                }
            }
        }
        let (batch, _) = shapes[0];
        if shapes.iter().any(|&(b, _)| b != batch) {
            return Err(AttentionError::shape(format!(
                "queries, keys, and values disagree on batch size: {shapes:?}"
            )));
        }
        if shapes[1].1 != shapes[2].1 {
            return Err(AttentionError::shape(format!(
                "keys ({}) and values ({}) disagree on sequence length",
                shapes[1].1, shapes[2].1
            )));
        }
        Ok(batch)
    }

    fn validate_window_grouping(&self, batch: usize, masks: &[MaskPolicy]) -> Result<()> {
        let heads = self.config.num_heads;
        for policy in masks {
            if let MaskPolicy::Window(window) = policy {
                let group = window.num_windows() * heads;
                if (batch * heads) % group != 0 {
                    return Err(AttentionError::config(format!(
                        "window mask with {} windows does not evenly divide batch * heads ({})",
                        window.num_windows(),
                        batch * heads
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Attention for MultiHeadAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        masks: &[MaskPolicy],
        mode: ForwardMode,
    ) -> Result<AttentionOutput> {
        self.multi_head_attention(q, k, v, masks, mode)
    }
}
