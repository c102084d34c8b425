use tokenizers::Tokenizer;

use crate::llm::error::GenerationError;
use crate::llm::inference::{self, GenerationParams};
use crate::llm::models::Model;

/// Turns a prompt into text. Implementations only need to be `Send`: the
/// service serialises calls, so no thread-safety is assumed of the backend.
pub trait TextGenerator: Send {
    fn generate(&self, params: &GenerationParams) -> Result<String, GenerationError>;
}

/// Tokenizer plus candle model, loaded once and reused for every request.
pub struct CandleGenerator {
    model: Box<dyn Model + Send>,
    tokenizer: Tokenizer,
    stop_token_ids: Vec<u32>,
    max_positions: usize,
}

impl std::fmt::Debug for CandleGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandleGenerator")
            .field("stop_token_ids", &self.stop_token_ids)
            .field("max_positions", &self.max_positions)
            .finish_non_exhaustive()
    }
}

impl CandleGenerator {
    pub fn new(
        model: Box<dyn Model + Send>,
        tokenizer: Tokenizer,
        stop_token_ids: Vec<u32>,
        max_positions: usize,
    ) -> Self {
        Self {
            model,
            tokenizer,
            stop_token_ids,
            max_positions,
        }
    }

    pub fn stop_token_ids(&self) -> &[u32] {
        &self.stop_token_ids
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>, GenerationError> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| GenerationError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    pub fn decode(&self, ids: &[u32]) -> Result<String, GenerationError> {
        self.tokenizer
            .decode(ids, true)
            .map_err(|e| GenerationError::Tokenizer(e.to_string()))
    }
}

impl TextGenerator for CandleGenerator {
    fn generate(&self, params: &GenerationParams) -> Result<String, GenerationError> {
        let prompt_ids = self.encode(&params.prompt)?;

        let output_ids = inference::generate(
            &prompt_ids,
            params,
            &*self.model,
            &self.stop_token_ids,
            self.max_positions,
        )?;

        tracing::info!(
            prompt_tokens = prompt_ids.len(),
            new_tokens = output_ids.len() - prompt_ids.len(),
            "generation complete"
        );

        // The prompt is part of the returned text.
        self.decode(&output_ids)
    }
}
