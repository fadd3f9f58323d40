//! Building blocks consumed by the attention crate.
//!
//! The crate hosts the dense projections that map `(batch, seq, d_model)`
//! activations between widths, the seeded dropout regulariser applied to
//! attention weights, and a handful of shape checks shared by both crates.
//! Everything here operates on Candle tensors and reports failures through
//! `candle_core::Result`.

pub mod checks;
pub mod dropout;
pub mod linear;

pub use dropout::{Dropout, ForwardMode};
pub use linear::{Linear, LinearConfig, LinearInit};
