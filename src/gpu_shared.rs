//! Device side of the packing and transpose kernels: pull raw pointers and the stream out
//! of the buffers, call the launcher, and turn its status into a `BackendFailure`.
//! Launches are asynchronous on the buffers' stream.

use std::ffi::c_void;

use crate::{
    Complex64, backend_failure,
    config::BackendKind,
    cuda_ffi,
    error::{BackendFailure, FailureKind},
    kernels::{StickLayout, mixed_spaces},
    memory::{Buffer, Element},
    transpose::RepackDir,
};

fn status(call: &'static str, code: i32) -> Result<(), BackendFailure> {
    if code == 0 {
        return Ok(());
    }
    let err = backend_failure!(BackendKind::Cuda, call, FailureKind::ExecFailed, code);
    log::error!("{err}");
    Err(err)
}

/// Device address of a buffer's first element; host buffers can't be mixed in.
fn dev_ptr<T: Element>(buf: &Buffer<T>, call: &'static str) -> Result<*mut c_void, BackendFailure> {
    if !buf.is_device() {
        return Err(mixed_spaces(call));
    }
    Ok(buf.device_ptr(0))
}

fn cu_stream<T: Element>(buf: &Buffer<T>, call: &'static str) -> Result<*mut c_void, BackendFailure> {
    buf.stream()
        .map(|s| s.cu_stream() as *mut c_void)
        .ok_or_else(|| mixed_spaces(call))
}

pub(crate) fn batch_load(
    nb: usize,
    fft_size: usize,
    map: &Buffer<i32>,
    data: &Buffer<Complex64>,
    buf: &mut Buffer<Complex64>,
) -> Result<(), BackendFailure> {
    const CALL: &str = "pw_batch_load";
    let stream = cu_stream(buf, CALL)?;

    let code = unsafe {
        cuda_ffi::pw_batch_load(
            nb as i32,
            fft_size as i32,
            map.len() as i32,
            dev_ptr(map, CALL)?,
            dev_ptr(data, CALL)?,
            dev_ptr(buf, CALL)?,
            stream,
        )
    };
    status(CALL, code)
}

pub(crate) fn batch_unload(
    nb: usize,
    fft_size: usize,
    map: &Buffer<i32>,
    buf: &Buffer<Complex64>,
    data: &mut Buffer<Complex64>,
    alpha: f64,
    beta: f64,
) -> Result<(), BackendFailure> {
    const CALL: &str = "pw_batch_unload";
    let stream = cu_stream(data, CALL)?;

    let code = unsafe {
        cuda_ffi::pw_batch_unload(
            nb as i32,
            fft_size as i32,
            map.len() as i32,
            dev_ptr(map, CALL)?,
            dev_ptr(buf, CALL)?,
            dev_ptr(data, CALL)?,
            alpha,
            beta,
            stream,
        )
    };
    status(CALL, code)
}

pub(crate) fn load_x0y0(
    nb: usize,
    fft_size: usize,
    npw: usize,
    offset: usize,
    map: &Buffer<i32>,
    data: &Buffer<Complex64>,
    buf: &mut Buffer<Complex64>,
) -> Result<(), BackendFailure> {
    const CALL: &str = "pw_load_x0y0";
    let stream = cu_stream(buf, CALL)?;

    let code = unsafe {
        cuda_ffi::pw_load_x0y0(
            nb as i32,
            fft_size as i32,
            npw as i32,
            offset as i32,
            map.len() as i32,
            dev_ptr(map, CALL)?,
            dev_ptr(data, CALL)?,
            dev_ptr(buf, CALL)?,
            stream,
        )
    };
    status(CALL, code)
}

pub(crate) fn unpack_columns(
    nb: usize,
    layout: StickLayout,
    col_pos: &Buffer<i32>,
    sticks: &Buffer<Complex64>,
    slab: &mut Buffer<Complex64>,
    use_reduction: bool,
) -> Result<(), BackendFailure> {
    const CALL: &str = "pw_unpack_columns";
    let stream = cu_stream(slab, CALL)?;

    let code = unsafe {
        cuda_ffi::pw_unpack_columns(
            nb as i32,
            layout.size_xy as i32,
            layout.size_z as i32,
            layout.num_cols as i32,
            dev_ptr(col_pos, CALL)?,
            dev_ptr(sticks, CALL)?,
            dev_ptr(slab, CALL)?,
            i32::from(use_reduction),
            stream,
        )
    };
    status(CALL, code)
}

pub(crate) fn pack_columns(
    nb: usize,
    layout: StickLayout,
    col_pos: &Buffer<i32>,
    slab: &Buffer<Complex64>,
    sticks: &mut Buffer<Complex64>,
) -> Result<(), BackendFailure> {
    const CALL: &str = "pw_pack_columns";
    let stream = cu_stream(sticks, CALL)?;

    let code = unsafe {
        cuda_ffi::pw_pack_columns(
            nb as i32,
            layout.size_xy as i32,
            layout.size_z as i32,
            layout.num_cols as i32,
            dev_ptr(col_pos, CALL)?,
            dev_ptr(slab, CALL)?,
            dev_ptr(sticks, CALL)?,
            stream,
        )
    };
    status(CALL, code)
}

pub(crate) fn unpack_two_columns(
    layout: StickLayout,
    col_pos: &Buffer<i32>,
    sticks: &Buffer<Complex64>,
    slab: &mut Buffer<Complex64>,
) -> Result<(), BackendFailure> {
    const CALL: &str = "pw_unpack_two_columns";
    let stream = cu_stream(slab, CALL)?;

    let code = unsafe {
        cuda_ffi::pw_unpack_two_columns(
            layout.size_xy as i32,
            layout.size_z as i32,
            layout.num_cols as i32,
            dev_ptr(col_pos, CALL)?,
            dev_ptr(sticks, CALL)?,
            dev_ptr(slab, CALL)?,
            stream,
        )
    };
    status(CALL, code)
}

pub(crate) fn pack_two_columns(
    layout: StickLayout,
    col_pos: &Buffer<i32>,
    slab: &Buffer<Complex64>,
    sticks: &mut Buffer<Complex64>,
) -> Result<(), BackendFailure> {
    const CALL: &str = "pw_pack_two_columns";
    let stream = cu_stream(sticks, CALL)?;

    let code = unsafe {
        cuda_ffi::pw_pack_two_columns(
            layout.size_xy as i32,
            layout.size_z as i32,
            layout.num_cols as i32,
            dev_ptr(col_pos, CALL)?,
            dev_ptr(slab, CALL)?,
            dev_ptr(sticks, CALL)?,
            stream,
        )
    };
    status(CALL, code)
}

pub(crate) fn repack_columns(
    dir: RepackDir,
    nb: usize,
    size_z: usize,
    ncol: usize,
    max_zsize: usize,
    z_sizes: &Buffer<i32>,
    z_offsets: &Buffer<i32>,
    src: &Buffer<Complex64>,
    dst: &mut Buffer<Complex64>,
) -> Result<(), BackendFailure> {
    const CALL: &str = "pw_repack_columns";
    let stream = cu_stream(dst, CALL)?;

    let code = unsafe {
        cuda_ffi::pw_repack_columns(
            dir.code(),
            nb as i32,
            size_z as i32,
            ncol as i32,
            z_sizes.len() as i32,
            max_zsize as i32,
            dev_ptr(z_sizes, CALL)?,
            dev_ptr(z_offsets, CALL)?,
            dev_ptr(src, CALL)?,
            dev_ptr(dst, CALL)?,
            stream,
        )
    };
    status(CALL, code)
}

pub(crate) fn repack_sticks(
    dir: RepackDir,
    nb: usize,
    zl: usize,
    ntot: usize,
    col_owner: &Buffer<i32>,
    col_offsets: &Buffer<i32>,
    col_counts: &Buffer<i32>,
    src: &Buffer<Complex64>,
    dst: &mut Buffer<Complex64>,
) -> Result<(), BackendFailure> {
    const CALL: &str = "pw_repack_sticks";
    let stream = cu_stream(dst, CALL)?;

    let code = unsafe {
        cuda_ffi::pw_repack_sticks(
            dir.code(),
            nb as i32,
            zl as i32,
            ntot as i32,
            dev_ptr(col_owner, CALL)?,
            dev_ptr(col_offsets, CALL)?,
            dev_ptr(col_counts, CALL)?,
            dev_ptr(src, CALL)?,
            dev_ptr(dst, CALL)?,
            stream,
        )
    };
    status(CALL, code)
}
