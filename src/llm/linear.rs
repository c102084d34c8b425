use candle_core::safetensors::MmapedSafetensors;
use candle_core::{DType, Device, Result as CandleResult, Tensor};
use candle_nn::var_builder::SimpleBackend;

use crate::llm::layer::Layer;

/// `y = x W^T (+ b)` with weights laid out as `(out_features, in_features)`.
pub struct LinearLayer {
    weights: Tensor,
    bias: Option<Tensor>,
    device: Device,
}

impl LinearLayer {
    pub fn new(
        weights_map: &MmapedSafetensors,
        prefix: &str,
        device: &Device,
        dtype: DType,
    ) -> CandleResult<Self> {
        let weights = weights_map
            .load(&format!("{}.weight", prefix), device)?
            .to_dtype(dtype)?;

        let bias_name = format!("{}.bias", prefix);
        let bias = if weights_map.contains_tensor(&bias_name) {
            Some(weights_map.load(&bias_name, device)?.to_dtype(dtype)?)
        } else {
            None
        };

        Ok(Self {
            weights,
            bias,
            device: device.clone(),
        })
    }
}

impl Layer for LinearLayer {
    fn forward(&self, input: &Tensor) -> CandleResult<Tensor> {
        let input = input.to_device(&self.device)?;
        let mut output = input.broadcast_matmul(&self.weights.t()?)?;
        if let Some(bias) = &self.bias {
            output = output.broadcast_add(bias)?
        }
        Ok(output)
    }
}
