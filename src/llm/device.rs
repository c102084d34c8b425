use std::fmt;

use candle_core::{DType, Device};
use serde::Serialize;

/// Which kind of compute target the model weights live on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cuda,
    Cpu,
}

impl DeviceKind {
    pub fn of(device: &Device) -> Self {
        if device.is_cuda() {
            DeviceKind::Cuda
        } else {
            DeviceKind::Cpu
        }
    }

    /// Half precision on the accelerator, full precision on the CPU.
    pub fn dtype(self) -> DType {
        match self {
            DeviceKind::Cuda => DType::F16,
            DeviceKind::Cpu => DType::F32,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceKind::Cuda => "cuda",
            DeviceKind::Cpu => "cpu",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Picks the first CUDA device when one is usable, the CPU otherwise.
pub fn select_device() -> candle_core::Result<Device> {
    Device::cuda_if_available(0)
}

pub fn cuda_available() -> bool {
    candle_core::utils::cuda_is_available()
}
