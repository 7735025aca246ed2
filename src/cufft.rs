//! Batched double-complex cuFFT plans. One plan serves both directions; the direction is
//! chosen per execution. The plan handle is destroyed exactly once, on drop.

use std::{ffi::c_void, sync::Arc};

use cudarc::driver::CudaStream;

use crate::{
    Complex64, backend_failure,
    config::BackendKind,
    cuda_ffi,
    error::{BackendFailure, FailureKind},
    fft::{FftSign, PlanShape},
    kernels::mixed_spaces,
    memory::Buffer,
};

const CUFFT_FORWARD: i32 = -1;
const CUFFT_INVERSE: i32 = 1;

fn kind_of(code: i32) -> FailureKind {
    match code {
        1 => FailureKind::InvalidPlan,
        2 => FailureKind::AllocFailed,
        4 => FailureKind::InvalidValue,
        6 => FailureKind::ExecFailed,
        13 => FailureKind::NoWorkspace,
        _ => FailureKind::Other,
    }
}

fn check(call: &'static str, code: i32) -> Result<(), BackendFailure> {
    if code == 0 {
        return Ok(());
    }
    let err = backend_failure!(BackendKind::Cuda, call, kind_of(code), code);
    log::error!("{err}");
    Err(err)
}

pub struct CufftPlan {
    handle: i32,
    shape: PlanShape,
    /// Bytes of work area the plan needs.
    work_bytes: usize,
    workspace: Option<Buffer<Complex64>>,
    /// cuFFT owns the work area; `workspace` stays empty.
    auto_alloc: bool,
    /// Kept alive for as long as the plan is bound to it.
    _stream: Arc<CudaStream>,
}

// Plans are only driven from the thread that owns the driver.
unsafe impl Send for CufftPlan {}

impl std::fmt::Debug for CufftPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CufftPlan")
            .field("handle", &self.handle)
            .field("shape", &self.shape)
            .field("work_bytes", &self.work_bytes)
            .finish()
    }
}

impl CufftPlan {
    /// With `auto_alloc`, cuFFT allocates and owns the work area; otherwise one must be
    /// bound with `set_workspace` before the first execution.
    pub fn new(stream: &Arc<CudaStream>, shape: PlanShape, auto_alloc: bool) -> Result<Self, BackendFailure> {
        let n: Vec<i32> = shape.lengths.iter().map(|&l| l as i32).collect();
        let mut handle = 0;
        let mut work_bytes = 0;

        let code = unsafe {
            cuda_ffi::pw_cufft_plan_many(
                &mut handle,
                n.len() as i32,
                n.as_ptr(),
                shape.dist as i32,
                shape.batch as i32,
                i32::from(auto_alloc),
                &mut work_bytes,
            )
        };
        check("cufftMakePlanMany", code)?;

        // Owned from here on, so a failing stream bind still destroys the handle.
        let plan = Self {
            handle,
            shape,
            work_bytes,
            workspace: None,
            auto_alloc,
            _stream: Arc::clone(stream),
        };
        let code = unsafe { cuda_ffi::pw_cufft_set_stream(handle, stream.cu_stream() as *mut c_void) };
        check("cufftSetStream", code)?;

        log::debug!(
            "cuFFT plan {:?} x {}: {} bytes of work area",
            plan.shape.lengths,
            plan.shape.batch,
            work_bytes
        );
        Ok(plan)
    }

    pub fn shape(&self) -> &PlanShape {
        &self.shape
    }

    /// Work area in complex elements.
    pub fn work_size(&self) -> usize {
        self.work_bytes.div_ceil(size_of::<Complex64>())
    }

    pub fn set_workspace(&mut self, workspace: Buffer<Complex64>) -> Result<(), BackendFailure> {
        if !workspace.is_device() {
            return Err(mixed_spaces("cufftSetWorkArea"));
        }
        if workspace.len() < self.work_size() {
            return Err(backend_failure!(
                BackendKind::Cuda,
                "cufftSetWorkArea",
                FailureKind::NoWorkspace,
                workspace.len() as i32
            ));
        }
        let code = unsafe { cuda_ffi::pw_cufft_set_work_area(self.handle, workspace.device_ptr(0)) };
        check("cufftSetWorkArea", code)?;
        self.workspace = Some(workspace);
        Ok(())
    }

    /// Returns a caller-supplied work area. cuFFT keeps the stale pointer, so `execute`
    /// refuses to run until another one is bound.
    pub fn take_workspace(&mut self) -> Option<Buffer<Complex64>> {
        self.workspace.take()
    }

    /// In place on `buf[offset..offset + span]`.
    pub fn execute(
        &mut self,
        sign: FftSign,
        buf: &mut Buffer<Complex64>,
        offset: usize,
    ) -> Result<(), BackendFailure> {
        if !buf.is_device() || buf.len() < offset + self.shape.span() {
            return Err(mixed_spaces("cufftExecZ2Z"));
        }
        if !self.auto_alloc && self.workspace.is_none() {
            return Err(backend_failure!(
                BackendKind::Cuda,
                "cufftExecZ2Z",
                FailureKind::NoWorkspace,
                0
            ));
        }
        let direction = match sign {
            FftSign::Forward => CUFFT_FORWARD,
            FftSign::Backward => CUFFT_INVERSE,
        };
        let code = unsafe { cuda_ffi::pw_cufft_exec(self.handle, buf.device_ptr(offset), direction) };
        check("cufftExecZ2Z", code)
    }
}

impl Drop for CufftPlan {
    fn drop(&mut self) {
        let code = unsafe { cuda_ffi::pw_cufft_destroy(self.handle) };
        if code != 0 {
            log::warn!("cufftDestroy returned {code}");
        }
    }
}
