//! Bindings to the host-side launchers in `src/cuda/`. Device pointers and streams cross
//! as `void*`; every call returns the CUDA or cuFFT status code, 0 on success.

use std::ffi::c_void;

unsafe extern "C" {
    pub(crate) fn pw_cufft_plan_many(
        plan: *mut i32,
        rank: i32,
        n: *const i32,
        dist: i32,
        batch: i32,
        auto_alloc: i32,
        work_size: *mut usize,
    ) -> i32;

    pub(crate) fn pw_cufft_set_work_area(plan: i32, area: *mut c_void) -> i32;

    pub(crate) fn pw_cufft_set_stream(plan: i32, cu_stream: *mut c_void) -> i32;

    pub(crate) fn pw_cufft_exec(plan: i32, data: *mut c_void, direction: i32) -> i32;

    pub(crate) fn pw_cufft_destroy(plan: i32) -> i32;

    pub(crate) fn pw_batch_load(
        nb: i32,
        fft_size: i32,
        npw: i32,
        map: *const c_void,
        data: *const c_void,
        buf: *mut c_void,
        cu_stream: *mut c_void,
    ) -> i32;

    pub(crate) fn pw_batch_unload(
        nb: i32,
        fft_size: i32,
        npw: i32,
        map: *const c_void,
        buf: *const c_void,
        data: *mut c_void,
        alpha: f64,
        beta: f64,
        cu_stream: *mut c_void,
    ) -> i32;

    pub(crate) fn pw_load_x0y0(
        nb: i32,
        fft_size: i32,
        npw: i32,
        offset: i32,
        nmap: i32,
        map: *const c_void,
        data: *const c_void,
        buf: *mut c_void,
        cu_stream: *mut c_void,
    ) -> i32;

    pub(crate) fn pw_unpack_columns(
        nb: i32,
        size_xy: i32,
        size_z: i32,
        ncol: i32,
        col_pos: *const c_void,
        sticks: *const c_void,
        slab: *mut c_void,
        use_reduction: i32,
        cu_stream: *mut c_void,
    ) -> i32;

    pub(crate) fn pw_pack_columns(
        nb: i32,
        size_xy: i32,
        size_z: i32,
        ncol: i32,
        col_pos: *const c_void,
        slab: *const c_void,
        sticks: *mut c_void,
        cu_stream: *mut c_void,
    ) -> i32;

    pub(crate) fn pw_unpack_two_columns(
        size_xy: i32,
        size_z: i32,
        ncol: i32,
        col_pos: *const c_void,
        sticks: *const c_void,
        slab: *mut c_void,
        cu_stream: *mut c_void,
    ) -> i32;

    pub(crate) fn pw_pack_two_columns(
        size_xy: i32,
        size_z: i32,
        ncol: i32,
        col_pos: *const c_void,
        slab: *const c_void,
        sticks: *mut c_void,
        cu_stream: *mut c_void,
    ) -> i32;

    pub(crate) fn pw_repack_columns(
        dir: i32,
        nb: i32,
        size_z: i32,
        ncol: i32,
        n_ranks: i32,
        max_zsize: i32,
        z_sizes: *const c_void,
        z_offsets: *const c_void,
        src: *const c_void,
        dst: *mut c_void,
        cu_stream: *mut c_void,
    ) -> i32;

    pub(crate) fn pw_repack_sticks(
        dir: i32,
        nb: i32,
        zl: i32,
        ntot: i32,
        col_owner: *const c_void,
        col_offsets: *const c_void,
        col_counts: *const c_void,
        src: *const c_void,
        dst: *mut c_void,
        cu_stream: *mut c_void,
    ) -> i32;
}
