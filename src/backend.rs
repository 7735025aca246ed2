//! The FFT backend as a runtime value. A `BackendContext` is chosen once from the
//! configuration; plans and buffers created through it carry the same tag, so call sites
//! never branch on build features.

#[cfg(feature = "cuda")]
use std::sync::Arc;

#[cfg(feature = "cuda")]
use cudarc::driver::{CudaContext, CudaStream};
use rustfft::FftPlanner;

#[cfg(feature = "cuda")]
use crate::cufft::CufftPlan;
use crate::{
    Complex64,
    config::{BackendKind, FftConfig},
    error::{BackendFailure, ConfigError},
    fft::{FftSign, HostBatchPlan, PlanShape},
    kernels::mixed_spaces,
    memory::{Allocator, Buffer},
};

/// Transform direction of the 3D driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Reciprocal to real space, e^{+iG·r}, unnormalized.
    Forward,
    /// Real to reciprocal space, e^{-iG·r}, scaled by 1/N.
    Backward,
}

impl Direction {
    /// Exponent sign of the underlying plan execution.
    pub fn sign(self) -> FftSign {
        match self {
            Self::Forward => FftSign::Backward,
            Self::Backward => FftSign::Forward,
        }
    }
}

#[derive(Debug, Clone)]
pub enum BackendContext {
    Host,
    #[cfg(feature = "cuda")]
    Cuda(Arc<CudaStream>),
}

impl BackendContext {
    /// Host backend, or a fresh stream on the configured GPU.
    pub fn new(config: &FftConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        match config.backend {
            BackendKind::Host => Ok(Self::Host),
            #[cfg(feature = "cuda")]
            BackendKind::Cuda => {
                let unavailable = |e: cudarc::driver::DriverError| {
                    log::warn!("CUDA device {} unavailable: {e:?}", config.device);
                    ConfigError::BackendUnavailable(BackendKind::Cuda)
                };
                let ctx = CudaContext::new(config.device).map_err(unavailable)?;
                let stream = ctx.new_stream().map_err(unavailable)?;
                log::info!("using CUDA device {}", config.device);
                Ok(Self::Cuda(stream))
            }
            #[cfg(not(feature = "cuda"))]
            BackendKind::Cuda => Err(ConfigError::BackendUnavailable(BackendKind::Cuda)),
        }
    }

    pub fn host() -> Self {
        Self::Host
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Host => BackendKind::Host,
            #[cfg(feature = "cuda")]
            Self::Cuda(_) => BackendKind::Cuda,
        }
    }

    /// New allocator in this backend's memory space, with its own live count.
    pub fn allocator(&self) -> Allocator {
        match self {
            Self::Host => Allocator::host(),
            #[cfg(feature = "cuda")]
            Self::Cuda(stream) => Allocator::device(Arc::clone(stream)),
        }
    }

    /// Wait for all queued work. A no-op on the host, where everything is synchronous.
    pub fn synchronize(&self) -> Result<(), BackendFailure> {
        match self {
            Self::Host => Ok(()),
            #[cfg(feature = "cuda")]
            Self::Cuda(stream) => stream.synchronize().map_err(|e| {
                crate::backend_failure!(
                    BackendKind::Cuda,
                    "cuStreamSynchronize",
                    crate::error::FailureKind::ExecFailed,
                    e.0 as i32
                )
            }),
        }
    }
}

/// A batched complex FFT plan on one of the backends. Both directions share the plan's
/// workspace.
#[derive(Debug)]
pub enum PlanHandle {
    Host(HostBatchPlan),
    #[cfg(feature = "cuda")]
    Cuda(CufftPlan),
}

impl PlanHandle {
    /// With `auto_alloc` false, bind a workspace of `work_size()` elements from `alloc`
    /// before executing.
    pub fn create(
        ctx: &BackendContext,
        alloc: &Allocator,
        shape: PlanShape,
        auto_alloc: bool,
    ) -> Result<Self, BackendFailure> {
        let plan = match ctx {
            BackendContext::Host => {
                let mut planner = FftPlanner::new();
                Self::Host(HostBatchPlan::new(&mut planner, alloc, shape, auto_alloc)?)
            }
            #[cfg(feature = "cuda")]
            BackendContext::Cuda(stream) => Self::Cuda(CufftPlan::new(stream, shape, auto_alloc)?),
        };

        log::debug!(
            "{:?} plan {:?} x {}, workspace {} elements",
            ctx.kind(),
            plan.shape().lengths,
            plan.shape().batch,
            plan.work_size()
        );
        Ok(plan)
    }

    pub fn shape(&self) -> &PlanShape {
        match self {
            Self::Host(p) => p.shape(),
            #[cfg(feature = "cuda")]
            Self::Cuda(p) => p.shape(),
        }
    }

    pub fn work_size(&self) -> usize {
        match self {
            Self::Host(p) => p.work_size(),
            #[cfg(feature = "cuda")]
            Self::Cuda(p) => p.work_size(),
        }
    }

    pub fn set_workspace(&mut self, workspace: Buffer<Complex64>) -> Result<(), BackendFailure> {
        match self {
            Self::Host(p) => p.set_workspace(workspace),
            #[cfg(feature = "cuda")]
            Self::Cuda(p) => p.set_workspace(workspace),
        }
    }

    pub fn take_workspace(&mut self) -> Option<Buffer<Complex64>> {
        match self {
            Self::Host(p) => p.take_workspace(),
            #[cfg(feature = "cuda")]
            Self::Cuda(p) => p.take_workspace(),
        }
    }

    /// In place on the plan's span of `buf`, starting at element `offset`.
    pub fn execute(&mut self, sign: FftSign, buf: &mut Buffer<Complex64>, offset: usize) -> Result<(), BackendFailure> {
        match self {
            Self::Host(p) => {
                let Some(data) = buf.host_mut() else {
                    return Err(mixed_spaces("exec"));
                };
                p.execute(sign, &mut data[offset..])
            }
            #[cfg(feature = "cuda")]
            Self::Cuda(p) => p.execute(sign, buf, offset),
        }
    }
}
