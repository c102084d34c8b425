pub mod activation;
pub mod causal_self_attention;
pub mod decoder;
pub mod device;
pub mod embedding;
pub mod error;
pub mod generator;
pub mod inference;
pub mod layer;
pub mod linear;
pub mod lm_head;
pub mod loader;
pub mod mlp;
pub mod models;
pub mod rms_norm;
pub mod rope;

pub use device::DeviceKind;
pub use error::GenerationError;
pub use generator::{CandleGenerator, TextGenerator};
pub use inference::GenerationParams;
