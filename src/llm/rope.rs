//! Rotary position embeddings, including the frequency rescaling that
//! long-context Llama checkpoints declare under `rope_scaling`.

use std::f32::consts::PI;

use candle_core::{DType, Device, Result as CandleResult, Tensor, D};

use crate::config::{ModelConfig, RopeScaling};

/// Per-dimension inverse frequencies, built once per model.
pub struct RotaryEmbedding {
    inv_freq: Tensor,
    dtype: DType,
    device: Device,
}

/// cos/sin tables for one contiguous run of absolute positions.
pub struct RotaryTables {
    cos: Tensor,
    sin: Tensor,
}

fn base_inv_freq(head_dim: usize, rope_theta: f32) -> Vec<f32> {
    (0..head_dim / 2)
        .map(|i| 1.0f32 / rope_theta.powf(2.0 * i as f32 / head_dim as f32))
        .collect()
}

fn scale_inv_freq(inv_freq: Vec<f32>, scaling: &RopeScaling) -> CandleResult<Vec<f32>> {
    match scaling.kind() {
        "default" => Ok(inv_freq),
        "linear" => Ok(inv_freq.into_iter().map(|f| f / scaling.factor).collect()),
        "llama3" => {
            let low = scaling.low_freq_factor.unwrap_or(1.0);
            let high = scaling.high_freq_factor.unwrap_or(4.0);
            let original = scaling.original_max_position_embeddings.unwrap_or(8192) as f32;
            if high <= low {
                return Err(candle_core::Error::msg(format!(
                    "llama3 rope_scaling: high_freq_factor {high} must exceed {low}"
                )));
            }

            let low_freq_wavelen = original / low;
            let high_freq_wavelen = original / high;

            Ok(inv_freq
                .into_iter()
                .map(|freq| {
                    let wavelen = 2.0 * PI / freq;
                    if wavelen < high_freq_wavelen {
                        freq
                    } else if wavelen > low_freq_wavelen {
                        freq / scaling.factor
                    } else {
                        let smooth = (original / wavelen - low) / (high - low);
                        (1.0 - smooth) * freq / scaling.factor + smooth * freq
                    }
                })
                .collect())
        }
        other => Err(candle_core::Error::msg(format!(
            "unsupported rope_scaling type {other:?}"
        ))),
    }
}

impl RotaryEmbedding {
    pub fn new(config: &ModelConfig, dtype: DType, device: &Device) -> CandleResult<Self> {
        let mut inv_freq = base_inv_freq(config.head_dim(), config.rope_theta);
        if let Some(scaling) = &config.rope_scaling {
            inv_freq = scale_inv_freq(inv_freq, scaling)?;
        }

        Ok(Self {
            inv_freq: Tensor::new(inv_freq.as_slice(), device)?,
            dtype,
            device: device.clone(),
        })
    }

    /// Tables for absolute positions `position..position + seq_len`.
    pub fn tables(&self, position: usize, seq_len: usize) -> CandleResult<RotaryTables> {
        let t = Tensor::arange(position as u32, (position + seq_len) as u32, &self.device)?
            .to_dtype(DType::F32)?; // (seq_len,)

        let freqs = t
            .unsqueeze(1)? // (seq_len, 1)
            .broadcast_mul(&self.inv_freq.unsqueeze(0)?)?; // (seq_len, head_dim / 2)

        let emb = Tensor::cat(&[&freqs, &freqs], 1)?; // (seq_len, head_dim)

        Ok(RotaryTables {
            cos: emb.cos()?.to_dtype(self.dtype)?,
            sin: emb.sin()?.to_dtype(self.dtype)?,
        })
    }
}

impl RotaryTables {
    fn rotate_half(x: &Tensor) -> CandleResult<Tensor> {
        let last_dim = x.dim(D::Minus1)?;

        let xs1 = x.narrow(D::Minus1, 0, last_dim / 2)?;
        let xs2 = x.narrow(D::Minus1, last_dim / 2, last_dim - last_dim / 2)?;

        Tensor::cat(&[&xs2.neg()?, &xs1], D::Minus1)
    }

    /// `x' = x * cos + rotate_half(x) * sin` for `x` of shape
    /// `(batch, heads, seq_len, head_dim)`.
    pub fn apply(&self, x: &Tensor) -> CandleResult<Tensor> {
        x.broadcast_mul(&self.cos)? + Self::rotate_half(x)?.broadcast_mul(&self.sin)?
    }
}
