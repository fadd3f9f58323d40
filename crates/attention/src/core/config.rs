//! Configuration options shared by attention implementations.
//!
//! [`AttentionConfig`] captures run-time knobs of the dot-product core, and
//! [`MultiHeadConfig`] adds the head layout used by the multi-head wrapper.
//! Both deserialize from TOML or JSON with every field optional except the
//! model width, and both accept a small set of environment overrides.

use std::{env, fs, path::Path};

use serde::{Deserialize, Serialize};

use super::errors::{AttentionError, Result};

pub const ENV_DROPOUT_P: &str = "ATTENTION_DROPOUT_P";
pub const ENV_SCALED: &str = "ATTENTION_SCALED";
pub const ENV_TRACE_SHAPES: &str = "ATTENTION_TRACE_SHAPES";

/// Configuration driving the dot-product attention core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttentionConfig {
    /// Divide scores by `sqrt(d_k)` before normalisation.
    pub scaled: bool,
    /// Probability for dropout applied to attention weights during training.
    ///
    /// When `None`, dropout is disabled and the computation is deterministic.
    pub dropout_p: Option<f32>,
    /// Seed for the dropout mask generator.
    pub dropout_seed: u64,
    /// Emit per-call shape traces at `trace` level.
    pub trace_shapes: bool,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            scaled: true,
            dropout_p: None,
            dropout_seed: 0,
            trace_shapes: false,
        }
    }
}

impl AttentionConfig {
    pub fn validate(&self) -> Result<()> {
        validate_dropout(self.dropout_p)
    }

    /// Overrides fields from `ATTENTION_*` environment variables when present.
    pub fn apply_env_overrides(&mut self) {
        apply_overrides(
            &mut self.scaled,
            &mut self.dropout_p,
            &mut self.trace_shapes,
        );
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|err| AttentionError::config(format!("attention config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = load_path(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }
}

/// Head layout and core settings for [`MultiHeadAttention`](crate::multihead::MultiHeadAttention).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiHeadConfig {
    /// Width of the inputs, of every projection, and of the output.
    pub d_model: usize,
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,
    /// Whether the projections built by `with_init` carry a bias vector.
    #[serde(default)]
    pub use_bias: bool,
    #[serde(default = "default_scaled")]
    pub scaled: bool,
    #[serde(default)]
    pub dropout_p: Option<f32>,
    #[serde(default)]
    pub dropout_seed: u64,
    #[serde(default)]
    pub trace_shapes: bool,
}

fn default_num_heads() -> usize {
    8
}

fn default_scaled() -> bool {
    true
}

impl MultiHeadConfig {
    pub fn new(d_model: usize, num_heads: usize) -> Self {
        Self {
            d_model,
            num_heads,
            use_bias: false,
            scaled: true,
            dropout_p: None,
            dropout_seed: 0,
            trace_shapes: false,
        }
    }

    /// Per-head width `d_model / num_heads`.
    pub fn head_dim(&self) -> usize {
        self.d_model / self.num_heads.max(1)
    }

    /// Checks the head layout; `d_model` must split evenly across heads.
    pub fn validate(&self) -> Result<()> {
        if self.d_model == 0 {
            return Err(AttentionError::config("d_model must be greater than zero"));
        }
        if self.num_heads == 0 {
            return Err(AttentionError::config("num_heads must be greater than zero"));
        }
        if self.d_model % self.num_heads != 0 {
            return Err(AttentionError::config(format!(
                "d_model ({}) must be divisible by num_heads ({})",
                self.d_model, self.num_heads
            )));
        }
        validate_dropout(self.dropout_p)
    }

    /// Settings handed to the dot-product core.
    pub fn attention_config(&self) -> AttentionConfig {
        AttentionConfig {
            scaled: self.scaled,
            dropout_p: self.dropout_p,
            dropout_seed: self.dropout_seed,
            trace_shapes: self.trace_shapes,
        }
    }

    pub fn apply_env_overrides(&mut self) {
        apply_overrides(
            &mut self.scaled,
            &mut self.dropout_p,
            &mut self.trace_shapes,
        );
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|err| AttentionError::config(format!("multi-head config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = load_path(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }
}

fn validate_dropout(dropout_p: Option<f32>) -> Result<()> {
    match dropout_p {
        Some(p) if !(0.0..1.0).contains(&p) => Err(AttentionError::config(format!(
            "dropout probability must be in [0, 1), got {p}"
        ))),
        _ => Ok(()),
    }
}

fn load_path<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path).map_err(|err| {
        AttentionError::config(format!("failed to read {}: {err}", path.display()))
    })?;
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => serde_json::from_str(&contents)
            .map_err(|err| AttentionError::config(format!("{}: {err}", path.display()))),
        Some("toml") | None => toml::from_str(&contents)
            .map_err(|err| AttentionError::config(format!("{}: {err}", path.display()))),
        Some(other) => Err(AttentionError::config(format!(
            "unsupported configuration extension '{other}'"
        ))),
    }
}

fn apply_overrides(scaled: &mut bool, dropout_p: &mut Option<f32>, trace_shapes: &mut bool) {
    if let Some(value) = read_env::<f32>(ENV_DROPOUT_P) {
        if (0.0..1.0).contains(&value) {
            *dropout_p = (value > 0.0).then_some(value);
        } else {
            log::warn!("ignoring {ENV_DROPOUT_P}={value}: must be in [0, 1)");
        }
    }
    if let Some(value) = read_env::<bool>(ENV_SCALED) {
        *scaled = value;
    }
    if let Some(value) = read_env::<bool>(ENV_TRACE_SHAPES) {
        *trace_shapes = value;
    }
}

fn read_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("ignoring unparseable {key}={raw}");
            None
        }
    }
}
