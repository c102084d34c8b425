use candle_core::safetensors::MmapedSafetensors;
use candle_core::{DType, Device, Result as CandleResult, Tensor};

use crate::config::ModelConfig;
use crate::llm::causal_self_attention::KVCache;
use crate::llm::decoder::DecoderLayer;
use crate::llm::embedding::EmbeddingLayer;
use crate::llm::layer::Layer;
use crate::llm::lm_head::LMHeadLayer;
use crate::llm::rms_norm::RMSNormLayer;
use crate::llm::rope::RotaryEmbedding;

/// A causal language model that maps `(batch, seq)` token ids to
/// `(batch, seq, vocab)` logits.
pub trait Model {
    fn forward(&self, input_ids: &Tensor) -> CandleResult<Tensor> {
        let mut kv_caches = vec![KVCache::new(); self.num_layers()];
        self.forward_with_cache(input_ids, &mut kv_caches, 0)
    }

    /// `position` is the absolute index of the first token in `input_ids` and
    /// must equal the length already cached;
    /// `kv_caches` holds one entry per layer and is extended in place.
    fn forward_with_cache(
        &self,
        input_ids: &Tensor,
        kv_caches: &mut [KVCache],
        position: usize,
    ) -> CandleResult<Tensor>;

    fn num_layers(&self) -> usize;

    fn device(&self) -> &Device;
}

pub struct LlamaModel {
    device: Device,
    pub embed_layer: EmbeddingLayer,
    pub decoder_layers: Vec<DecoderLayer>,
    pub norm_layer: RMSNormLayer,
    pub lm_head: LMHeadLayer,
    rotary: RotaryEmbedding,
}

impl LlamaModel {
    pub fn new(
        weights: &MmapedSafetensors,
        config: &ModelConfig,
        device: &Device,
        dtype: DType,
    ) -> CandleResult<Self> {
        let embed_layer = EmbeddingLayer::new(weights, device, "model.embed_tokens", dtype)?;
        let rotary = RotaryEmbedding::new(config, dtype, device)?;

        let decoder_layers = (0..config.num_hidden_layers)
            .map(|layer_idx| {
                DecoderLayer::new(
                    weights,
                    &format!("model.layers.{}", layer_idx),
                    config,
                    device,
                    dtype,
                )
            })
            .collect::<CandleResult<Vec<_>>>()?;

        let norm_layer =
            RMSNormLayer::new(weights, "model.norm", device, config.rms_norm_eps, dtype)?;

        let lm_head_prefix = if config.tie_word_embeddings {
            "model.embed_tokens"
        } else {
            "lm_head"
        };
        let lm_head = LMHeadLayer::new(weights, lm_head_prefix, device, dtype)?;

        Ok(Self {
            device: device.clone(),
            embed_layer,
            decoder_layers,
            norm_layer,
            lm_head,
            rotary,
        })
    }
}

impl Model for LlamaModel {
    fn forward_with_cache(
        &self,
        input_ids: &Tensor,
        kv_caches: &mut [KVCache],
        position: usize,
    ) -> CandleResult<Tensor> {
        if kv_caches.len() != self.decoder_layers.len() {
            return Err(candle_core::Error::msg(format!(
                "expected {} kv caches, got {}",
                self.decoder_layers.len(),
                kv_caches.len()
            )));
        }

        for (idx, cache) in kv_caches.iter().enumerate() {
            let cached = cache.seq_len()?;
            if cached != position {
                return Err(candle_core::Error::msg(format!(
                    "layer {idx} cache holds {cached} positions but the step starts at {position}"
                )));
            }
        }

        let input_ids = input_ids.to_device(&self.device)?;
        let mut hidden_states = self.embed_layer.forward(&input_ids)?;

        // Shared by every layer for this step.
        let rope = self.rotary.tables(position, input_ids.dim(1)?)?;

        for (layer, cache) in self.decoder_layers.iter().zip(kv_caches.iter_mut()) {
            hidden_states = layer.forward_with_cache(&hidden_states, cache, &rope)?;
        }

        let normed_output = self.norm_layer.forward(&hidden_states)?;
        self.lm_head.forward(&normed_output)
    }

    fn num_layers(&self) -> usize {
        self.decoder_layers.len()
    }

    fn device(&self) -> &Device {
        &self.device
    }
}
