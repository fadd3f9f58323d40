//! Error types emitted by attention implementations.

use thiserror::Error;

/// Attention-specific error category.
///
/// Structural errors are reported before any computation starts and are never
/// coerced into a "best effort" reshape.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// Batch, sequence, or feature dimensions do not line up.
    #[error("shape mismatch: {context}")]
    ShapeMismatch { context: String },
    /// Head configuration or mask grouping is not realisable.
    #[error("invalid configuration: {context}")]
    Configuration { context: String },
    /// The kernel does not support the requested data type.
    #[error("unsupported dtype {requested}")]
    UnsupportedDType { requested: String },
    /// A tensor-engine failure propagated to the caller.
    #[error("backend failure: {0}")]
    Backend(#[from] candle_core::Error),
}

impl AttentionError {
    pub(crate) fn shape(context: impl Into<String>) -> Self {
        AttentionError::ShapeMismatch {
            context: context.into(),
        }
    }

    pub(crate) fn config(context: impl Into<String>) -> Self {
        AttentionError::Configuration {
            context: context.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AttentionError>;
