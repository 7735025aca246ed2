//! Runtime backend selection. The backend is picked here, once, and carried as a tag
//! through plans and buffers.

use std::{env, str::FromStr};

use crate::error::ConfigError;

/// Environment variable selecting the backend: `host` or `cuda`.
pub const BACKEND_VAR: &str = "PW_FFT_BACKEND";
/// Environment variable selecting the GPU ordinal.
pub const DEVICE_VAR: &str = "PW_FFT_DEVICE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// rustfft on the host; buffers live in host memory.
    #[default]
    Host,
    /// cuFFT; buffers and packing kernels live on the device.
    Cuda,
}

impl BackendKind {
    /// Whether this build can run the backend at all. Device presence is checked later,
    /// when the context is created.
    pub fn compiled_in(self) -> bool {
        match self {
            Self::Host => true,
            Self::Cuda => cfg!(feature = "cuda"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "host" | "cpu" => Ok(Self::Host),
            "cuda" | "gpu" => Ok(Self::Cuda),
            other => Err(ConfigError::UnknownBackend(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FftConfig {
    pub backend: BackendKind,
    /// GPU ordinal; ignored by the host backend.
    pub device: usize,
}

impl FftConfig {
    pub fn host() -> Self {
        Self::default()
    }

    pub fn cuda(device: usize) -> Self {
        Self {
            backend: BackendKind::Cuda,
            device,
        }
    }

    /// Read `PW_FFT_BACKEND` and `PW_FFT_DEVICE`, falling back to the host backend on
    /// device 0 when unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| env::var(k).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let backend = match get(BACKEND_VAR) {
            Some(v) => v.parse()?,
            None => BackendKind::Host,
        };

        let device = match get(DEVICE_VAR) {
            Some(v) => v.trim().parse().map_err(|_| {
                ConfigError::InvalidDimensions(format!("{DEVICE_VAR}={v} is not a device ordinal"))
            })?,
            None => 0,
        };

        Ok(Self { backend, device })
    }

    /// Fail early if the selected backend is not compiled in.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.backend.compiled_in() {
            return Err(ConfigError::BackendUnavailable(self.backend));
        }
        Ok(())
    }
}
