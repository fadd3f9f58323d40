use super::*;
use crate::masks::{ValidLengths, WindowMask, MASK_VALUE};
use candle_core::{Device, Result as CandleResult};

fn build_inputs(device: &Device) -> CandleResult<(Tensor, Tensor, Tensor)> {
    let data: Vec<f32> = (0..48).map(|i| ((i * 7 % 13) as f32) * 0.05 - 0.3).collect();
    let q = Tensor::from_vec(data.clone(), (2, 4, 6), device)?;
    let k = Tensor::from_vec(data.iter().rev().copied().collect::<Vec<_>>(), (2, 4, 6), device)?;
    let v = Tensor::from_vec(data, (2, 4, 6), device)?;
    Ok((q, k, v))
}

fn naive_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    disallow: Option<&[u8]>,
    scaled: bool,
) -> CandleResult<Tensor> {
    let (n, q_len, d_k) = q.dims3()?;
    let (_, k_len, _) = k.dims3()?;
    let (_, _, d_v) = v.dims3()?;
    let q_vec = q.flatten_all()?.to_vec1::<f32>()?;
    let k_vec = k.flatten_all()?.to_vec1::<f32>()?;
    let v_vec = v.flatten_all()?.to_vec1::<f32>()?;
    let scale = if scaled { 1.0 / (d_k as f32).sqrt() } else { 1.0 };
    let mut output = vec![0f32; n * q_len * d_v];

    for b in 0..n {
        for i in 0..q_len {
            let mut row = vec![0f32; k_len];
            for j in 0..k_len {
                let mut dot = 0f32;
                for d in 0..d_k {
                    dot += q_vec[(b * q_len + i) * d_k + d] * k_vec[(b * k_len + j) * d_k + d];
                }
                row[j] = dot * scale;
                if let Some(mask) = disallow {
                    if mask[(b * q_len + i) * k_len + j] != 0 {
                        row[j] = MASK_VALUE;
                    }
                }
            }
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let exps: Vec<f32> = row.iter().map(|s| (s - max).exp()).collect();
            let denom: f32 = exps.iter().sum();
            for d in 0..d_v {
                let mut acc = 0f32;
                for j in 0..k_len {
                    acc += exps[j] / denom * v_vec[(b * k_len + j) * d_v + d];
                }
                output[(b * q_len + i) * d_v + d] = acc;
            }
        }
    }
    Tensor::from_vec(output, (n, q_len, d_v), q.device())
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> CandleResult<f32> {
    a.to_dtype(DType::F32)?
        .sub(&b.to_dtype(DType::F32)?)?
        .abs()?
        .max_all()?
        .to_vec0::<f32>()
}

fn row_sums(weights: &Tensor) -> CandleResult<Vec<f32>> {
    weights
        .to_dtype(DType::F32)?
        .sum(2)?
        .flatten_all()?
        .to_vec1::<f32>()
}

fn core() -> DotProductAttention {
    DotProductAttention::new(AttentionConfig::default()).unwrap()
}

#[test]
fn matches_naive_reference_with_causal_mask() -> Result<()> {
    let device = Device::Cpu;
    let (q, k, v) = build_inputs(&device)?;
    let out = core().score_and_aggregate(&q, &k, &v, &[MaskPolicy::Causal], ForwardMode::Inference)?;

    let causal: Vec<u8> = (0..2)
        .flat_map(|_| (0..4).flat_map(|i| (0..4).map(move |j| u8::from(j > i))))
        .collect();
    let expected = naive_attention(&q, &k, &v, Some(&causal), true)?;
    assert!(max_abs_diff(&out.output, &expected)? < 1e-5);
    assert_eq!(out.weights.dims(), &[2, 4, 4]);
    Ok(())
}

#[test]
fn unscaled_scoring_matches_naive_reference() -> Result<()> {
    let device = Device::Cpu;
    let (q, k, v) = build_inputs(&device)?;
    let config = AttentionConfig {
        scaled: false,
        ..AttentionConfig::default()
    };
    let out = DotProductAttention::new(config)?.score_and_aggregate(
        &q,
        &k,
        &v,
        &[],
        ForwardMode::Inference,
    )?;
    let expected = naive_attention(&q, &k, &v, None, false)?;
    assert!(max_abs_diff(&out.output, &expected)? < 1e-5);
    Ok(())
}

#[test]
fn hand_computed_self_attention() -> Result<()> {
    let device = Device::Cpu;
    let x = Tensor::new(&[[[1f32, 0.0], [0.0, 1.0], [1.0, 1.0]]], &device)?;
    let out = core().score_and_aggregate(&x, &x, &x, &[], ForwardMode::Inference)?;

    let expected_weights = Tensor::new(
        &[[
            [0.401112f32, 0.197776, 0.401112],
            [0.197776, 0.401112, 0.401112],
            [0.248255, 0.248255, 0.503490],
        ]],
        &device,
    )?;
    let expected_output = Tensor::new(
        &[[[0.802224f32, 0.598888], [0.598888, 0.802224], [0.751745, 0.751745]]],
        &device,
    )?;
    assert!(max_abs_diff(&out.weights, &expected_weights)? < 1e-5);
    assert!(max_abs_diff(&out.output, &expected_output)? < 1e-5);
    Ok(())
}

#[test]
fn scaled_scores_are_unscaled_over_sqrt_dk() -> Result<()> {
    let device = Device::Cpu;
    let (q, k, _) = build_inputs(&device)?;
    let scaled = core().scores(&q, &k)?;
    let unscaled = DotProductAttention::new(AttentionConfig {
        scaled: false,
        ..AttentionConfig::default()
    })?
    .scores(&q, &k)?;

    let expected = (unscaled / 6f64.sqrt())?;
    assert!(max_abs_diff(&scaled, &expected)? < 1e-6);
    Ok(())
}

#[test]
fn weights_rows_sum_to_one() -> Result<()> {
    let device = Device::Cpu;
    let (q, k, v) = build_inputs(&device)?;
    let out = core().score_and_aggregate(&q, &k, &v, &[], ForwardMode::Inference)?;
    assert!(row_sums(&out.weights)?.iter().all(|s| (s - 1.0).abs() < 1e-5));
    Ok(())
}

#[test]
fn valid_length_two_silences_last_column() -> Result<()> {
    let device = Device::Cpu;
    let x = Tensor::new(&[[[0.3f32, 0.1, 0.9], [0.5, 0.2, 0.4], [0.7, 0.8, 0.6]]], &device)?;
    let masks = [MaskPolicy::ValidLength(ValidLengths::per_sequence(&[2], &device)?)];
    let out = core().score_and_aggregate(&x, &x, &x, &masks, ForwardMode::Inference)?;

    let weights = out.weights.to_vec3::<f32>()?;
    for row in &weights[0] {
        assert!(row[2] < 1e-6, "masked column carries weight {}", row[2]);
        assert!((row[0] + row[1] - 1.0).abs() < 1e-5);
    }
    Ok(())
}

#[test]
fn causal_mask_over_uniform_scores_is_lower_triangular() -> Result<()> {
    let device = Device::Cpu;
    let q = Tensor::zeros((1, 4, 2), DType::F32, &device)?;
    let v = Tensor::ones((1, 4, 2), DType::F32, &device)?;
    let out = core().score_and_aggregate(&q, &q, &v, &[MaskPolicy::Causal], ForwardMode::Inference)?;

    let weights = out.weights.to_vec3::<f32>()?;
    for (i, row) in weights[0].iter().enumerate() {
        for (j, &w) in row.iter().enumerate() {
            if j > i {
                assert!(w < 1e-6, "({i}, {j}) leaked {w}");
            } else {
                assert!((w - 1.0 / (i + 1) as f32).abs() < 1e-5);
            }
        }
    }
    assert!(row_sums(&out.weights)?.iter().all(|s| (s - 1.0).abs() < 1e-5));
    Ok(())
}

#[test]
fn fully_masked_rows_stay_finite_and_uniform() -> Result<()> {
    let device = Device::Cpu;
    let (q, k, v) = build_inputs(&device)?;
    let masks = [MaskPolicy::ValidLength(ValidLengths::per_sequence(&[0, 4], &device)?)];
    let out = core().score_and_aggregate(&q, &k, &v, &masks, ForwardMode::Inference)?;

    let weights = out.weights.to_vec3::<f32>()?;
    for row in &weights[0] {
        // Every key replaced by the same sentinel: no information, not zero.
        assert!(row.iter().all(|w| w.is_finite() && (w - 0.25).abs() < 1e-6));
    }
    let output = out.output.flatten_all()?.to_vec1::<f32>()?;
    assert!(output.iter().all(|value| value.is_finite()));
    Ok(())
}

#[test]
fn window_mask_is_applied_per_window() -> Result<()> {
    let device = Device::Cpu;
    let q = Tensor::zeros((2, 1, 2), DType::F32, &device)?;
    let v = Tensor::new(&[[[1f32], [2.0]], [[1.0], [2.0]]], &device)?;
    let window = Tensor::new(&[[[0f32, MASK_VALUE]], [[MASK_VALUE, 0.0]]], &device)?;
    let masks = [MaskPolicy::Window(WindowMask::new(window)?)];

    let out = core().score_and_aggregate(&q, &q, &v, &masks, ForwardMode::Inference)?;
    let values = out.output.flatten_all()?.to_vec1::<f32>()?;
    assert!((values[0] - 1.0).abs() < 1e-5);
    assert!((values[1] - 2.0).abs() < 1e-5);
    Ok(())
}

#[test]
fn inference_is_deterministic_even_with_dropout_configured() -> Result<()> {
    let device = Device::Cpu;
    let (q, k, v) = build_inputs(&device)?;
    let attention = DotProductAttention::new(AttentionConfig {
        dropout_p: Some(0.5),
        dropout_seed: 3,
        ..AttentionConfig::default()
    })?;
    let a = attention.score_and_aggregate(&q, &k, &v, &[], ForwardMode::Inference)?;
    let b = attention.score_and_aggregate(&q, &k, &v, &[], ForwardMode::Inference)?;
    assert_eq!(
        a.output.flatten_all()?.to_vec1::<f32>()?,
        b.output.flatten_all()?.to_vec1::<f32>()?
    );
    Ok(())
}

#[test]
fn training_mode_regularizes_output_but_not_reported_weights() -> Result<()> {
    let device = Device::Cpu;
    let (q, k, v) = build_inputs(&device)?;
    let attention = DotProductAttention::new(AttentionConfig {
        dropout_p: Some(0.5),
        dropout_seed: 3,
        ..AttentionConfig::default()
    })?;
    let eval = attention.score_and_aggregate(&q, &k, &v, &[], ForwardMode::Inference)?;
    let train = attention.score_and_aggregate(&q, &k, &v, &[], ForwardMode::Training)?;

    assert!(max_abs_diff(&eval.weights, &train.weights)? < 1e-6);
    assert!(max_abs_diff(&eval.output, &train.output)? > 1e-4);
    Ok(())
}

#[test]
fn last_weights_tracks_most_recent_call() -> Result<()> {
    let device = Device::Cpu;
    let (q, k, v) = build_inputs(&device)?;
    let attention = core();
    assert!(attention.last_weights().is_none());

    let out = attention.score_and_aggregate(&q, &k, &v, &[MaskPolicy::Causal], ForwardMode::Inference)?;
    let cached = attention.last_weights().expect("weights cached");
    assert!(max_abs_diff(&cached, &out.weights)? == 0.0);
    Ok(())
}

#[test]
fn half_precision_inputs_round_trip_dtype() -> Result<()> {
    let device = Device::Cpu;
    let (q, k, v) = build_inputs(&device)?;
    let reference = core().score_and_aggregate(&q, &k, &v, &[], ForwardMode::Inference)?;
    for dtype in [DType::BF16, DType::F16] {
        let out = core().score_and_aggregate(
            &q.to_dtype(dtype)?,
            &k.to_dtype(dtype)?,
            &v.to_dtype(dtype)?,
            &[],
            ForwardMode::Inference,
        )?;
        assert_eq!(out.output.dtype(), dtype);
        assert_eq!(out.weights.dtype(), dtype);
        let diff = max_abs_diff(&out.output, &reference.output)?;
        assert!(diff < 5e-2, "dtype {dtype:?} diverged by {diff}");
    }
    Ok(())
}

#[test]
fn numerical_stability_with_large_scores() -> Result<()> {
    let device = Device::Cpu;
    let q = Tensor::full(10_000.0f32, (1, 4, 4), &device)?;
    let k = Tensor::full(-10_000.0f32, (1, 4, 4), &device)?;
    let v = Tensor::ones((1, 4, 4), DType::F32, &device)?;
    let out = core().score_and_aggregate(&q, &k, &v, &[], ForwardMode::Inference)?;
    let values = out.output.flatten_all()?.to_vec1::<f32>()?;
    assert!(values.iter().all(|value| value.is_finite()));
    Ok(())
}

#[test]
fn mismatched_shapes_error() -> Result<()> {
    let device = Device::Cpu;
    let q = Tensor::zeros((1, 4, 8), DType::F32, &device)?;
    let k_wrong_width = Tensor::zeros((1, 5, 6), DType::F32, &device)?;
    let v = Tensor::zeros((1, 5, 3), DType::F32, &device)?;
    let attention = core();

    let err = attention
        .score_and_aggregate(&q, &k_wrong_width, &v, &[], ForwardMode::Inference)
        .unwrap_err();
    assert!(matches!(err, AttentionError::ShapeMismatch { .. }));

    let k = Tensor::zeros((1, 5, 8), DType::F32, &device)?;
    let v_short = Tensor::zeros((1, 4, 3), DType::F32, &device)?;
    let err = attention
        .score_and_aggregate(&q, &k, &v_short, &[], ForwardMode::Inference)
        .unwrap_err();
    assert!(matches!(err, AttentionError::ShapeMismatch { .. }));

    let k_batch = Tensor::zeros((2, 5, 8), DType::F32, &device)?;
    assert!(attention
        .score_and_aggregate(&q, &k_batch, &v, &[], ForwardMode::Inference)
        .is_err());

    // Cross attention with seq_q != seq_kv is fine.
    let out = attention.score_and_aggregate(&q, &k, &v, &[], ForwardMode::Inference)?;
    assert_eq!(out.output.dims(), &[1, 4, 3]);
    assert_eq!(out.weights.dims(), &[1, 4, 5]);
    Ok(())
}

#[test]
fn degenerate_inputs_fail_fast() -> Result<()> {
    let device = Device::Cpu;
    let empty = Tensor::zeros((1, 3, 0), DType::F32, &device)?;
    let err = core()
        .score_and_aggregate(&empty, &empty, &empty, &[], ForwardMode::Inference)
        .unwrap_err();
    assert!(matches!(err, AttentionError::Configuration { .. }));

    let ints = Tensor::zeros((1, 3, 2), DType::U32, &device)?;
    let err = core()
        .score_and_aggregate(&ints, &ints, &ints, &[], ForwardMode::Inference)
        .unwrap_err();
    assert!(matches!(err, AttentionError::UnsupportedDType { .. }));

    let rank4 = Tensor::zeros((1, 1, 3, 2), DType::F32, &device)?;
    let err = core()
        .score_and_aggregate(&rank4, &rank4, &rank4, &[], ForwardMode::Inference)
        .unwrap_err();
    assert!(matches!(err, AttentionError::ShapeMismatch { .. }));
    Ok(())
}

#[test]
fn injected_regularizer_only_runs_in_training() -> Result<()> {
    struct Zeroing;
    impl Regularizer for Zeroing {
        fn regularize(&self, weights: &Tensor, mode: ForwardMode) -> CandleResult<Tensor> {
            if mode.is_training() {
                weights.zeros_like()
            } else {
                Ok(weights.clone())
            }
        }
    }

    let device = Device::Cpu;
    let (q, k, v) = build_inputs(&device)?;
    let attention = DotProductAttention::with_regularizer(AttentionConfig::default(), Arc::new(Zeroing));
    let train = attention.score_and_aggregate(&q, &k, &v, &[], ForwardMode::Training)?;
    assert_eq!(train.output.abs()?.max_all()?.to_vec0::<f32>()?, 0.0);
    let eval = attention.score_and_aggregate(&q, &k, &v, &[], ForwardMode::Inference)?;
    assert!(eval.output.abs()?.max_all()?.to_vec0::<f32>()? > 0.0);
    Ok(())
}
