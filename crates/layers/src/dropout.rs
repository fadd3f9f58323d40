//! Seeded dropout for attention weights.
//!
//! Dropout is the one stochastic step in an attention forward pass. The mode is
//! passed explicitly on every call through [`ForwardMode`]; there is no ambient
//! training flag. In [`ForwardMode::Inference`] the input is returned unchanged.
//! Masks are sampled from a deterministic 64-bit LCG so that a given seed
//! reproduces the same sequence of masks across runs.

use std::{fmt, sync::Mutex};

use candle_core::{DType, Error, Result, Tensor};

use crate::checks;

/// Whether a forward pass runs with stochastic regularisation enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForwardMode {
    /// Dropout is active.
    Training,
    /// Dropout is the identity.
    #[default]
    Inference,
}

impl ForwardMode {
    pub fn is_training(self) -> bool {
        matches!(self, ForwardMode::Training)
    }
}

/// Inverted dropout with a seeded mask generator.
pub struct Dropout {
    probability: f32,
    rng: Mutex<Lcg64>,
}

impl fmt::Debug for Dropout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dropout")
            .field("probability", &self.probability)
            .finish()
    }
}

impl Clone for Dropout {
    fn clone(&self) -> Self {
        let state = match self.rng.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        Self {
            probability: self.probability,
            rng: Mutex::new(state),
        }
    }
}

impl Dropout {
    /// Builds a dropout layer dropping each element with `probability`.
    ///
    /// `probability` must lie in `[0, 1)`; `0.0` yields a layer that never
    /// drops anything even in training mode.
    pub fn new(probability: f32, seed: u64) -> Result<Self> {
        if !(0.0..1.0).contains(&probability) {
            return Err(Error::Msg(format!(
                "dropout probability must be in [0, 1), got {probability}"
            )));
        }
        log::debug!("dropout configured p={probability} seed={seed}");
        Ok(Self {
            probability,
            rng: Mutex::new(Lcg64::new(seed)),
        })
    }

    /// Builds a layer from an optional probability; `None` disables dropout.
    pub fn from_probability(probability: Option<f32>, seed: u64) -> Result<Self> {
        Self::new(probability.unwrap_or(0.0), seed)
    }

    /// Dropout probability.
    pub fn probability(&self) -> f32 {
        self.probability
    }

    /// Applies dropout when `mode` is training, scaling kept entries by `1 / (1 - p)`.
    pub fn apply(&self, tensor: &Tensor, mode: ForwardMode) -> Result<Tensor> {
        if !mode.is_training() || self.probability == 0.0 {
            return Ok(tensor.clone());
        }
        checks::expect_dtype_in("dropout.input", tensor, &checks::FLOAT_DTYPES)?;

        let keep_prob = 1.0 - self.probability;
        let total = tensor.elem_count();
        let mask_data = {
            let mut rng = self
                .rng
                .lock()
                .map_err(|_| Error::Msg("dropout RNG mutex poisoned".into()))?;
            let mut data = Vec::with_capacity(total);
            for _ in 0..total {
                data.push(if rng.next_f32() < keep_prob { 1.0f32 } else { 0.0f32 });
            }
            data
        };

        let device = tensor.device();
        let mask = Tensor::from_vec(mask_data, tensor.dims(), device)?;
        let scale = Tensor::new(1.0f32 / keep_prob, device)?;
        let dropped = tensor
            .to_dtype(DType::F32)?
            .mul(&mask)?
            .broadcast_mul(&scale)?;
        dropped.to_dtype(tensor.dtype())
    }
}

/// Simple 64-bit linear congruential generator for deterministic dropout masks.
#[derive(Debug, Clone)]
struct Lcg64 {
    state: u64,
}

impl Lcg64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        // Parameters from Numerical Recipes.
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.state
    }

    fn next_f32(&mut self) -> f32 {
        const SCALE: f64 = 1.0 / ((1u64 << 53) as f64);
        let bits = self.next_u64() >> 11;
        (bits as f64 * SCALE) as f32
    }
}
