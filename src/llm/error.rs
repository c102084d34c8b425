use thiserror::Error;

/// Failures raised while turning a prompt into generated text.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Tokenization failed: {0}")]
    Tokenizer(String),

    #[error("Prompt encoded to zero tokens")]
    EmptyPrompt,

    #[error("`temperature` (={0}) has to be a strictly positive float")]
    InvalidTemperature(f64),

    #[error("Sampling failed: {0}")]
    Sampling(String),

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}
