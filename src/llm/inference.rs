use candle_core::{DType, IndexOp, Tensor};
use candle_nn::ops::softmax;
use rand::distr::{weighted::WeightedIndex, Distribution};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::llm::causal_self_attention::KVCache;
use crate::llm::error::GenerationError;
use crate::llm::models::Model;

/// One text-generation call as the backend sees it.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub prompt: String,
    /// Upper bound on prompt + generated tokens.
    pub max_length: usize,
    pub temperature: f64,
    /// Fixed seed for reproducible sampling; a random one is drawn when unset.
    pub seed: Option<u64>,
}

/// How many tokens to sample for a prompt of `prompt_len` tokens.
///
/// `max_length` counts the prompt too. At least one token is always
/// produced, so a prompt already at or over the limit still gets a reply.
pub fn new_token_budget(prompt_len: usize, max_length: usize, max_positions: usize) -> usize {
    max_length
        .min(max_positions)
        .saturating_sub(prompt_len)
        .max(1)
}

pub fn validate_temperature(temperature: f64) -> Result<(), GenerationError> {
    if temperature.is_finite() && temperature > 0.0 {
        Ok(())
    } else {
        Err(GenerationError::InvalidTemperature(temperature))
    }
}

/// Draws one token id from `logits` (shape `(vocab,)`) scaled by `temperature`.
pub fn sample_token(
    logits: &Tensor,
    temperature: f64,
    rng: &mut StdRng,
) -> Result<u32, GenerationError> {
    let scaled = (logits.to_dtype(DType::F32)? / temperature)?;
    let probs = softmax(&scaled, 0)?.to_vec1::<f32>()?;

    let dist = WeightedIndex::new(&probs).map_err(|e| GenerationError::Sampling(e.to_string()))?;
    Ok(dist.sample(rng) as u32)
}

/// Autoregressive sampling from `prompt_ids`. Returns the prompt followed by
/// the sampled tokens; any of `stop_ids` ends the loop and is not included.
pub fn generate(
    prompt_ids: &[u32],
    params: &GenerationParams,
    model: &dyn Model,
    stop_ids: &[u32],
    max_positions: usize,
) -> Result<Vec<u32>, GenerationError> {
    validate_temperature(params.temperature)?;
    if prompt_ids.is_empty() {
        return Err(GenerationError::EmptyPrompt);
    }

    let seed = params.seed.unwrap_or_else(rand::random);
    let mut rng = StdRng::seed_from_u64(seed);

    let budget = new_token_budget(prompt_ids.len(), params.max_length, max_positions);
    let device = model.device();

    let mut kv_caches = vec![KVCache::new(); model.num_layers()];
    let mut output_ids = prompt_ids.to_vec();

    // First step feeds the whole prompt, every later one a single token.
    let mut input = Tensor::from_slice(prompt_ids, (1, prompt_ids.len()), device)?;
    let mut position = 0;

    for _ in 0..budget {
        let logits = model.forward_with_cache(&input, &mut kv_caches, position)?;
        let last = logits.dim(1)? - 1;
        let next_token = sample_token(&logits.i((0, last))?, params.temperature, &mut rng)?;

        if stop_ids.contains(&next_token) {
            break;
        }

        position += input.dim(1)?;
        output_ids.push(next_token);
        input = Tensor::from_slice(&[next_token], (1, 1), device)?;
    }

    tracing::debug!(
        prompt_tokens = prompt_ids.len(),
        new_tokens = output_ids.len() - prompt_ids.len(),
        seed,
        "sampling finished"
    );

    Ok(output_ids)
}
