use candle_core::safetensors::MmapedSafetensors;
use candle_core::Result as CandleResult;
use candle_core::{DType, Device, Tensor};

use crate::llm::layer::Layer;
use crate::llm::linear::LinearLayer;
use crate::llm::rope::RotaryTables;

/// KV cache for storing key and value tensors across generation steps
#[derive(Clone, Default)]
pub struct KVCache {
    pub k_cache: Option<Tensor>,
    pub v_cache: Option<Tensor>,
}

impl KVCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of positions already stored.
    pub fn seq_len(&self) -> CandleResult<usize> {
        match &self.k_cache {
            Some(k) => k.dim(2),
            None => Ok(0),
        }
    }
}

pub struct CausalSelfAttentionLayer {
    q_proj: LinearLayer,
    k_proj: LinearLayer,
    v_proj: LinearLayer,
    o_proj: LinearLayer,
    n_heads: usize,
    n_kv_heads: usize,
    hidden_size: usize,
    dtype: DType,
    device: Device,
}

impl CausalSelfAttentionLayer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        weights: &MmapedSafetensors,
        prefix: &str,
        n_heads: usize,
        n_kv_heads: usize,
        hidden_size: usize,
        device: &Device,
        dtype: DType,
    ) -> CandleResult<Self> {
        if n_heads == 0 || n_kv_heads == 0 || n_heads % n_kv_heads != 0 {
            return Err(candle_core::Error::msg(format!(
                "{prefix}: {n_heads} attention heads cannot be grouped over {n_kv_heads} kv heads"
            )));
        }

        let q_proj = LinearLayer::new(weights, &format!("{}.q_proj", prefix), device, dtype)?;
        let k_proj = LinearLayer::new(weights, &format!("{}.k_proj", prefix), device, dtype)?;
        let v_proj = LinearLayer::new(weights, &format!("{}.v_proj", prefix), device, dtype)?;
        let o_proj = LinearLayer::new(weights, &format!("{}.o_proj", prefix), device, dtype)?;

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            n_heads,
            n_kv_heads,
            hidden_size,
            dtype,
            device: device.clone(),
        })
    }

    fn repeat_kv(x: Tensor, n_rep: usize) -> CandleResult<Tensor> {
        if n_rep == 1 {
            return Ok(x);
        }

        let (b_sz, n_kv_heads, seq_len, head_dim) = x.dims4()?;
        x.unsqueeze(2)? // (b_sz, n_kv_heads, 1, seq_len, head_dim)
            .expand(&[b_sz, n_kv_heads, n_rep, seq_len, head_dim])?
            .reshape(&[b_sz, n_kv_heads * n_rep, seq_len, head_dim])
    }

    /// Mask rows for the `seq_len` newest queries against `total_len` keys.
    fn create_causal_mask(
        seq_len: usize,
        total_len: usize,
        dtype: DType,
        device: &Device,
    ) -> CandleResult<Tensor> {
        let offset = total_len - seq_len;
        let mask = (0..seq_len)
            .flat_map(|i| {
                (0..total_len).map(move |j| if j > i + offset { f32::NEG_INFINITY } else { 0.0 })
            })
            .collect::<Vec<f32>>();

        Tensor::from_vec(mask, (seq_len, total_len), device)?
            .to_dtype(dtype)?
            .unsqueeze(0)?
            .unsqueeze(0) // (1, 1, seq_len, total_len)
    }

    /// Forward pass that appends this step's keys/values to `kv_cache`.
    /// `rope` covers the absolute positions of the tokens in `input`.
    pub fn forward_with_cache(
        &self,
        input: &Tensor,
        kv_cache: &mut KVCache,
        rope: &RotaryTables,
    ) -> CandleResult<Tensor> {
        let input = input.to_device(&self.device)?;
        let q = self.q_proj.forward(&input)?;
        let k = self.k_proj.forward(&input)?;
        let v = self.v_proj.forward(&input)?;

        let head_dim = self.hidden_size / self.n_heads;
        let n_rep = self.n_heads / self.n_kv_heads;

        let (b_sz, seq_len, _) = input.dims3()?;

        let q = q
            .reshape((b_sz, seq_len, self.n_heads, head_dim))?
            .transpose(1, 2)?
            .contiguous()?; // (b_sz, n_heads, seq_len, head_dim)
        let k = k
            .reshape((b_sz, seq_len, self.n_kv_heads, head_dim))?
            .transpose(1, 2)?
            .contiguous()?; // (b_sz, n_kv_heads, seq_len, head_dim)
        let v = v
            .reshape((b_sz, seq_len, self.n_kv_heads, head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        // Only the new keys are rotated, cached ones already carry their positions.
        let q = rope.apply(&q)?;
        let k = rope.apply(&k)?;

        let k = match &kv_cache.k_cache {
            Some(k_cached) => Tensor::cat(&[k_cached, &k], 2)?,
            None => k,
        };
        let v = match &kv_cache.v_cache {
            Some(v_cached) => Tensor::cat(&[v_cached, &v], 2)?,
            None => v,
        };
        let total_len = k.dim(2)?;

        kv_cache.k_cache = Some(k.clone());
        kv_cache.v_cache = Some(v.clone());

        let k = Self::repeat_kv(k, n_rep)?.contiguous()?;
        let v = Self::repeat_kv(v, n_rep)?.contiguous()?;

        let scaling = 1.0 / (head_dim as f64).sqrt();
        let attn_scores = q
            .matmul(&k.t()?.contiguous()?)?
            .affine(scaling, 0.0)?; // (b_sz, n_heads, seq_len, total_len)

        let mask = Self::create_causal_mask(seq_len, total_len, self.dtype, &self.device)?;
        let attn_scores = attn_scores.broadcast_add(&mask)?;

        let attn_probs = candle_nn::ops::softmax_last_dim(&attn_scores)?;

        let context = attn_probs
            .matmul(&v)?
            .transpose(1, 2)? // (b_sz, seq_len, n_heads, head_dim)
            .reshape((b_sz, seq_len, self.hidden_size))?;

        self.o_proj.forward(&context)
    }
}
