use std::sync::{Mutex, MutexGuard};

use crate::llm::{DeviceKind, TextGenerator};

/// Everything the handlers need, built once at startup and shared read-only.
pub struct AppState {
    generator: Mutex<Box<dyn TextGenerator>>,
    pub model_name: String,
    pub device: DeviceKind,
    pub cuda_available: bool,
}

impl AppState {
    pub fn new(
        generator: Box<dyn TextGenerator>,
        model_name: impl Into<String>,
        device: DeviceKind,
        cuda_available: bool,
    ) -> Self {
        Self {
            generator: Mutex::new(generator),
            model_name: model_name.into(),
            device,
            cuda_available,
        }
    }

    /// Exclusive access to the generator. Blocks while another request is
    /// generating; call it from a blocking thread only.
    pub fn generator(&self) -> MutexGuard<'_, Box<dyn TextGenerator>> {
        // The generator holds no state a panicked call could leave half-written.
        self.generator
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
