use candle_core::safetensors::MmapedSafetensors;
use candle_core::{DType, Device, Result as CandleResult, Tensor};

use crate::llm::layer::Layer;

/// Projects hidden states to vocabulary logits. With tied embeddings the
/// prefix points at the embedding table instead of `lm_head`.
pub struct LMHeadLayer {
    weights: Tensor,
    device: Device,
}

impl LMHeadLayer {
    pub fn new(
        weights: &MmapedSafetensors,
        prefix: &str,
        device: &Device,
        dtype: DType,
    ) -> CandleResult<Self> {
        let weights = weights
            .load(&format!("{}.weight", prefix), device)?
            .to_dtype(dtype)?;
        Ok(Self {
            weights,
            device: device.clone(),
        })
    }
}

impl Layer for LMHeadLayer {
    fn forward(&self, input: &Tensor) -> CandleResult<Tensor> {
        let input = input.to_device(&self.device)?;
        input.broadcast_matmul(&self.weights.t()?)
    }
}
