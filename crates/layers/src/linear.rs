//! Linear and affine projection helpers.
//!
//! Linear layers expect inputs shaped `(batch, seq, in_dim)` and return tensors
//! with `(batch, seq, out_dim)`. Matmuls run in the weight dtype; inputs are
//! cast to it when needed and the result is cast back to the input dtype.
//! Initialisation policies mirror common transformer recipes (Glorot, Kaiming,
//! scaled variants) and draw from a seeded generator so that two layers built
//! with the same seed are identical.

use candle_core::{DType, Device, Error, Result, Tensor};

use crate::checks;

/// Configuration shared by dense projection layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    /// Incoming feature dimension.
    pub input_dim: usize,
    /// Outgoing feature dimension.
    pub output_dim: usize,
    /// Whether a bias vector is added after the matmul.
    pub bias: bool,
}

impl LinearConfig {
    /// Creates a bias-free configuration.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: false,
        }
    }

    /// Enables or disables the bias term.
    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }
}

/// Supported weight initialisation policies for transformer projections.
#[derive(Debug, Clone)]
pub enum LinearInit {
    /// Xavier/Glorot uniform initialisation.
    XavierUniform,
    /// Xavier/Glorot normal initialisation.
    XavierNormal,
    /// Kaiming/He uniform initialisation.
    KaimingUniform { negative_slope: f64 },
    /// Kaiming/He normal initialisation.
    KaimingNormal { negative_slope: f64 },
    /// Every weight set to the same value (handy for hand-checked tests).
    Constant(f64),
    /// Scales another policy to support deep network stabilisation.
    Scaled { base: Box<LinearInit>, scale: f64 },
}

impl LinearInit {
    /// Convenience helper to scale an existing policy.
    pub fn scaled(base: LinearInit, scale: f64) -> Self {
        Self::Scaled {
            base: Box::new(base),
            scale,
        }
    }

    fn sample(&self, shape: (usize, usize), rng: &mut SplitMix64) -> Vec<f32> {
        let (out_dim, in_dim) = shape;
        let (fan_in, fan_out) = (in_dim as f64, out_dim as f64);
        let count = out_dim * in_dim;
        match self {
            LinearInit::XavierUniform => {
                let bound = (6.0f64 / (fan_in + fan_out)).sqrt();
                (0..count).map(|_| rng.uniform(-bound, bound) as f32).collect()
            }
            LinearInit::XavierNormal => {
                let std = (2.0f64 / (fan_in + fan_out)).sqrt();
                (0..count).map(|_| (rng.normal() * std) as f32).collect()
            }
            LinearInit::KaimingUniform { negative_slope } => {
                let gain = (2.0f64 / (1.0 + negative_slope.powi(2))).sqrt();
                let bound = (3.0f64).sqrt() * gain / fan_in.sqrt();
                (0..count).map(|_| rng.uniform(-bound, bound) as f32).collect()
            }
            LinearInit::KaimingNormal { negative_slope } => {
                let gain = (2.0f64 / (1.0 + negative_slope.powi(2))).sqrt();
                let std = gain / fan_in.sqrt();
                (0..count).map(|_| (rng.normal() * std) as f32).collect()
            }
            LinearInit::Constant(value) => vec![*value as f32; count],
            LinearInit::Scaled { base, scale } => base
                .sample(shape, rng)
                .into_iter()
                .map(|w| w * *scale as f32)
                .collect(),
        }
    }
}

/// Dense affine projection `y = x W^T (+ b)`.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    /// Constructs a linear layer from pre-existing parameters.
    ///
    /// `weight` is shaped `(output_dim, input_dim)`; `bias`, when the config
    /// enables it, is shaped `(output_dim,)`.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        Self::validate_weight(&config, &weight)?;
        Self::validate_bias(&config, bias.as_ref())?;
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Builds a linear layer with weights drawn from `init` using `seed`.
    pub fn with_init(
        config: LinearConfig,
        init: &LinearInit,
        seed: u64,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        checks::expect_float_dtype("linear.init", dtype)?;
        if config.input_dim == 0 || config.output_dim == 0 {
            return Err(Error::Msg(format!(
                "linear dimensions must be non-zero, got {}x{}",
                config.output_dim, config.input_dim
            )));
        }
        let shape = (config.output_dim, config.input_dim);
        let mut rng = SplitMix64::new(seed);
        let weight = Tensor::from_vec(init.sample(shape, &mut rng), shape, device)?
            .to_dtype(dtype)?;
        let bias = if config.bias {
            Some(Tensor::zeros(config.output_dim, dtype, device)?)
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// Projects `(batch, seq, input_dim)` or `(rows, input_dim)` inputs.
    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        self.validate_input(hidden)?;

        let input_dtype = hidden.dtype();
        let input = hidden.to_dtype(self.weight.dtype())?;
        let weight_t = self.weight.t()?;

        let mut output = match input.dims() {
            &[batch, seq, _] => input
                .reshape((batch * seq, self.config.input_dim))?
                .matmul(&weight_t)?
                .reshape((batch, seq, self.config.output_dim))?,
            &[_, _] => input.matmul(&weight_t)?,
            _ => unreachable!("validated above"),
        };

        if let Some(bias) = &self.bias {
            output = output.broadcast_add(bias)?;
        }

        output.to_dtype(input_dtype)
    }

    fn validate_weight(config: &LinearConfig, weight: &Tensor) -> Result<()> {
        checks::expect_rank("linear.weight", weight, 2)?;
        checks::expect_shape(
            "linear.weight",
            weight,
            &[config.output_dim, config.input_dim],
        )?;
        checks::expect_dtype_in("linear.weight", weight, &checks::FLOAT_DTYPES)
    }

    fn validate_bias(config: &LinearConfig, bias: Option<&Tensor>) -> Result<()> {
        match (config.bias, bias) {
            (true, Some(tensor)) => {
                checks::expect_shape("linear.bias", tensor, &[config.output_dim])?;
                checks::expect_dtype_in("linear.bias", tensor, &checks::FLOAT_DTYPES)
            }
            (false, Some(_)) => Err(Error::Msg("bias provided but config disables bias".into())),
            (true, None) => Err(Error::Msg("config expects bias but none supplied".into())),
            (false, None) => Ok(()),
        }
    }

    fn validate_input(&self, hidden: &Tensor) -> Result<()> {
        match hidden.dims() {
            [batch, seq, _] => {
                checks::expect_batch_seq_hidden("linear.input", hidden, self.config.input_dim)?;
                if *batch == 0 || *seq == 0 {
                    return Err(Error::Msg("batch/seq dimensions must be non-zero".into()));
                }
                Ok(())
            }
            [_, hidden_dim] if *hidden_dim == self.config.input_dim => Ok(()),
            [_, hidden_dim] => Err(Error::Msg(format!(
                "expected last dim {} but received {}",
                self.config.input_dim, hidden_dim
            ))),
            dims => Err(Error::Msg(format!(
                "linear expects input shaped [B, T, H_in] or [T, H_in], got {:?}",
                dims
            ))),
        }
    }
}

/// SplitMix64 generator used for reproducible weight initialisation.
///
/// Candle's CPU `rand`/`randn` cannot be seeded, so sampling happens here.
#[derive(Debug, Clone)]
struct SplitMix64 {
    state: u64,
}

impl SplitMix64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Uniform sample in `[0, 1)`.
    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    fn uniform(&mut self, low: f64, high: f64) -> f64 {
        low + (high - low) * self.next_f64()
    }

    /// Standard normal sample via Box-Muller.
    fn normal(&mut self) -> f64 {
        let u1 = self.next_f64().max(f64::MIN_POSITIVE);
        let u2 = self.next_f64();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }
}
