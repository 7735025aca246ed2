//! Packing kernels: move sparse coefficients and z-columns in and out of the dense
//! working buffers.
//!
//! Buffers hold `nb` batches back to back, batch outermost. Column buffers are
//! `iz + icol · size_z`; plane (slab) buffers are `x + size_x · (y + iz · size_y)`. Index
//! maps are `i32` so the same maps serve the device kernels.
//!
//! The functions at the top level take `Buffer`s and run wherever the buffers live; the
//! `host` module has the slice implementations.

use crate::{
    Complex64,
    config::BackendKind,
    error::{BackendFailure, FailureKind},
    memory::Buffer,
};

#[cfg(feature = "cuda")]
pub(crate) use crate::gpu_shared as device;

/// Shape of the stick (compact column) side of a column pack/unpack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StickLayout {
    /// Points per xy-plane of the slab.
    pub size_xy: usize,
    /// z-entries per stick; the local slab thickness after the transpose.
    pub size_z: usize,
    /// Sticks per batch.
    pub num_cols: usize,
}

impl StickLayout {
    pub fn stick_len(&self) -> usize {
        self.size_z * self.num_cols
    }

    pub fn slab_len(&self) -> usize {
        self.size_z * self.size_xy
    }
}

pub(crate) fn mixed_spaces(call: &'static str) -> BackendFailure {
    crate::backend_failure!(BackendKind::Host, call, FailureKind::BufferMismatch, 0)
}

/// Stand-ins for the device launchers in builds without CUDA, where every buffer is a
/// host buffer and these can only be reached with mismatched arguments.
#[cfg(not(feature = "cuda"))]
pub(crate) mod device {
    use super::*;
    use crate::transpose::RepackDir;

    macro_rules! no_device {
        ($($name:ident($($arg:ty),*);)*) => {
            $(
                pub(crate) fn $name($(_: $arg),*) -> Result<(), BackendFailure> {
                    Err(mixed_spaces(stringify!($name)))
                }
            )*
        };
    }

    no_device! {
        batch_load(usize, usize, &Buffer<i32>, &Buffer<Complex64>, &mut Buffer<Complex64>);
        batch_unload(usize, usize, &Buffer<i32>, &Buffer<Complex64>, &mut Buffer<Complex64>, f64, f64);
        load_x0y0(usize, usize, usize, usize, &Buffer<i32>, &Buffer<Complex64>, &mut Buffer<Complex64>);
        unpack_columns(usize, StickLayout, &Buffer<i32>, &Buffer<Complex64>, &mut Buffer<Complex64>, bool);
        pack_columns(usize, StickLayout, &Buffer<i32>, &Buffer<Complex64>, &mut Buffer<Complex64>);
        unpack_two_columns(StickLayout, &Buffer<i32>, &Buffer<Complex64>, &mut Buffer<Complex64>);
        pack_two_columns(StickLayout, &Buffer<i32>, &Buffer<Complex64>, &mut Buffer<Complex64>);
        repack_columns(RepackDir, usize, usize, usize, usize, &Buffer<i32>, &Buffer<i32>, &Buffer<Complex64>, &mut Buffer<Complex64>);
        repack_sticks(RepackDir, usize, usize, usize, &Buffer<i32>, &Buffer<i32>, &Buffer<i32>, &Buffer<Complex64>, &mut Buffer<Complex64>);
    }
}

/// Zero `nb` batches of `buf` (each `fft_size` long) and scatter `data` into them.
pub fn batch_load(
    nb: usize,
    fft_size: usize,
    map: &Buffer<i32>,
    data: &Buffer<Complex64>,
    buf: &mut Buffer<Complex64>,
) -> Result<(), BackendFailure> {
    if let (Some(m), Some(d), Some(b)) = (map.host(), data.host(), buf.host_mut()) {
        host::batch_load(nb, fft_size, m, d, b);
        return Ok(());
    }
    device::batch_load(nb, fft_size, map, data, buf)
}

/// `data[ig] = alpha · data[ig] + beta · buf[map[ig]]` for every batch.
pub fn batch_unload(
    nb: usize,
    fft_size: usize,
    map: &Buffer<i32>,
    buf: &Buffer<Complex64>,
    data: &mut Buffer<Complex64>,
    alpha: f64,
    beta: f64,
) -> Result<(), BackendFailure> {
    if let (Some(m), Some(b), Some(d)) = (map.host(), buf.host(), data.host_mut()) {
        host::batch_unload(nb, fft_size, m, b, d, alpha, beta);
        return Ok(());
    }
    device::batch_unload(nb, fft_size, map, buf, data, alpha, beta)
}

/// Rebuild the negative half of the (0, 0) column by conjugation. The column's stored
/// coefficients start at `offset` in each batch of `data` (`npw` per batch); `map` gives
/// the buffer position of each one's inverse, or -1 to skip it.
pub fn load_x0y0(
    nb: usize,
    fft_size: usize,
    npw: usize,
    offset: usize,
    map: &Buffer<i32>,
    data: &Buffer<Complex64>,
    buf: &mut Buffer<Complex64>,
) -> Result<(), BackendFailure> {
    if let (Some(m), Some(d), Some(b)) = (map.host(), data.host(), buf.host_mut()) {
        host::load_x0y0(nb, fft_size, npw, offset, m, d, b);
        return Ok(());
    }
    device::load_x0y0(nb, fft_size, npw, offset, map, data, buf)
}

/// Sticks into planes: zero the slab, then place each stick at its xy position. With
/// `use_reduction`, also write the conjugate at the mirrored position.
pub fn unpack_columns(
    nb: usize,
    layout: StickLayout,
    col_pos: &Buffer<i32>,
    sticks: &Buffer<Complex64>,
    slab: &mut Buffer<Complex64>,
    use_reduction: bool,
) -> Result<(), BackendFailure> {
    if let (Some(p), Some(s), Some(b)) = (col_pos.host(), sticks.host(), slab.host_mut()) {
        host::unpack_columns(nb, layout, p, s, b, use_reduction);
        return Ok(());
    }
    device::unpack_columns(nb, layout, col_pos, sticks, slab, use_reduction)
}

/// Planes into sticks: read each stick back from its xy position.
pub fn pack_columns(
    nb: usize,
    layout: StickLayout,
    col_pos: &Buffer<i32>,
    slab: &Buffer<Complex64>,
    sticks: &mut Buffer<Complex64>,
) -> Result<(), BackendFailure> {
    if let (Some(p), Some(b), Some(s)) = (col_pos.host(), slab.host(), sticks.host_mut()) {
        host::pack_columns(nb, layout, p, b, s);
        return Ok(());
    }
    device::pack_columns(nb, layout, col_pos, slab, sticks)
}

/// Two batches of sticks from a reduced set into one plane batch, as `z1 + i·z2`.
pub fn unpack_two_columns(
    layout: StickLayout,
    col_pos: &Buffer<i32>,
    sticks: &Buffer<Complex64>,
    slab: &mut Buffer<Complex64>,
) -> Result<(), BackendFailure> {
    if let (Some(p), Some(s), Some(b)) = (col_pos.host(), sticks.host(), slab.host_mut()) {
        host::unpack_two_columns(layout, p, s, b);
        return Ok(());
    }
    device::unpack_two_columns(layout, col_pos, sticks, slab)
}

/// Inverse of `unpack_two_columns` after the planes went through a transform: split one
/// plane batch back into two batches of sticks.
pub fn pack_two_columns(
    layout: StickLayout,
    col_pos: &Buffer<i32>,
    slab: &Buffer<Complex64>,
    sticks: &mut Buffer<Complex64>,
) -> Result<(), BackendFailure> {
    if let (Some(p), Some(b), Some(s)) = (col_pos.host(), slab.host(), sticks.host_mut()) {
        host::pack_two_columns(layout, p, b, s);
        return Ok(());
    }
    device::pack_two_columns(layout, col_pos, slab, sticks)
}

/// Slice implementations, parallel over batches and planes.
pub mod host {
    use rayon::prelude::*;

    use super::StickLayout;
    use crate::{Complex64, FieldElement};

    pub fn batch_load<T: FieldElement>(nb: usize, fft_size: usize, map: &[i32], data: &[T], buf: &mut [T]) {
        if nb == 0 || fft_size == 0 {
            return;
        }
        let npw = map.len();

        buf[..nb * fft_size]
            .par_chunks_mut(fft_size)
            .enumerate()
            .for_each(|(ib, dst)| {
                dst.fill(T::default());
                let src = &data[ib * npw..(ib + 1) * npw];
                for (&m, &v) in map.iter().zip(src) {
                    dst[m as usize] = v;
                }
            });
    }

    pub fn batch_unload<T: FieldElement>(
        nb: usize,
        fft_size: usize,
        map: &[i32],
        buf: &[T],
        data: &mut [T],
        alpha: f64,
        beta: f64,
    ) {
        let npw = map.len();
        if nb == 0 || npw == 0 {
            return;
        }

        data[..nb * npw]
            .par_chunks_mut(npw)
            .enumerate()
            .for_each(|(ib, dst)| {
                let src = &buf[ib * fft_size..(ib + 1) * fft_size];
                for (d, &m) in dst.iter_mut().zip(map) {
                    let v = src[m as usize] * beta;
                    // alpha = 0 overwrites, even if `data` held NaNs.
                    *d = if alpha == 0. { v } else { *d * alpha + v };
                }
            });
    }

    pub fn load_x0y0<T: FieldElement>(
        nb: usize,
        fft_size: usize,
        npw: usize,
        offset: usize,
        map: &[i32],
        data: &[T],
        buf: &mut [T],
    ) {
        if nb == 0 || fft_size == 0 {
            return;
        }

        buf[..nb * fft_size]
            .par_chunks_mut(fft_size)
            .enumerate()
            .for_each(|(ib, dst)| {
                let src = &data[ib * npw + offset..];
                for (i, &m) in map.iter().enumerate() {
                    if m >= 0 {
                        dst[m as usize] = src[i].conj();
                    }
                }
            });
    }

    pub fn unpack_columns<T: FieldElement>(
        nb: usize,
        layout: StickLayout,
        col_pos: &[i32],
        sticks: &[T],
        slab: &mut [T],
        use_reduction: bool,
    ) {
        let StickLayout {
            size_xy,
            size_z,
            num_cols,
        } = layout;
        if nb == 0 || size_z == 0 || size_xy == 0 {
            return;
        }
        let (pos, mirror) = col_pos.split_at(num_cols);

        slab[..nb * size_z * size_xy]
            .par_chunks_mut(size_xy)
            .enumerate()
            .for_each(|(iplane, plane)| {
                let (ib, iz) = (iplane / size_z, iplane % size_z);
                let sticks = &sticks[ib * layout.stick_len()..];

                plane.fill(T::default());
                for icol in 0..num_cols {
                    let v = sticks[iz + icol * size_z];
                    plane[pos[icol] as usize] = v;
                    if use_reduction && mirror[icol] >= 0 {
                        plane[mirror[icol] as usize] = v.conj();
                    }
                }
            });
    }

    pub fn pack_columns<T: FieldElement>(
        nb: usize,
        layout: StickLayout,
        col_pos: &[i32],
        slab: &[T],
        sticks: &mut [T],
    ) {
        let StickLayout {
            size_xy,
            size_z,
            num_cols,
        } = layout;
        if nb == 0 || size_z == 0 || num_cols == 0 {
            return;
        }

        sticks[..nb * layout.stick_len()]
            .par_chunks_mut(size_z)
            .enumerate()
            .for_each(|(j, stick)| {
                let (ib, icol) = (j / num_cols, j % num_cols);
                let slab = &slab[ib * layout.slab_len()..];
                let ipos = col_pos[icol] as usize;
                for (iz, v) in stick.iter_mut().enumerate() {
                    *v = slab[ipos + iz * size_xy];
                }
            });
    }

    /// Sticks of field 1 are batch 0 of `sticks`, field 2 batch 1. Writes
    /// `z1 + i·z2` at each column and `conj(z1) + i·conj(z2)` at its mirror; the (0, 0)
    /// column has no mirror entry.
    pub fn unpack_two_columns(layout: StickLayout, col_pos: &[i32], sticks: &[Complex64], slab: &mut [Complex64]) {
        let StickLayout {
            size_xy,
            size_z,
            num_cols,
        } = layout;
        if size_z == 0 || size_xy == 0 {
            return;
        }
        let (pos, mirror) = col_pos.split_at(num_cols);
        let (s1, s2) = sticks.split_at(layout.stick_len());

        slab[..layout.slab_len()]
            .par_chunks_mut(size_xy)
            .enumerate()
            .for_each(|(iz, plane)| {
                plane.fill(Complex64::default());
                for icol in 0..num_cols {
                    let z1 = s1[iz + icol * size_z];
                    let z2 = s2[iz + icol * size_z];
                    plane[pos[icol] as usize] = Complex64::new(z1.re - z2.im, z1.im + z2.re);
                    if mirror[icol] >= 0 {
                        plane[mirror[icol] as usize] = Complex64::new(z1.re + z2.im, z2.re - z1.im);
                    }
                }
            });
    }

    /// With `Z = F1 + i·F2` and both fields real in the other domain,
    /// `F1(q) = (Z(q) + conj Z(-q)) / 2` and `F2(q) = -i (Z(q) - conj Z(-q)) / 2`. For the
    /// (0, 0) column, -q is q itself.
    pub fn pack_two_columns(layout: StickLayout, col_pos: &[i32], slab: &[Complex64], sticks: &mut [Complex64]) {
        let StickLayout {
            size_xy,
            size_z,
            num_cols,
        } = layout;
        if size_z == 0 || num_cols == 0 {
            return;
        }
        let (pos, mirror) = col_pos.split_at(num_cols);
        let (s1, s2) = sticks[..2 * layout.stick_len()].split_at_mut(layout.stick_len());

        s1.par_chunks_mut(size_z)
            .zip(s2.par_chunks_mut(size_z))
            .enumerate()
            .for_each(|(icol, (f1, f2))| {
                let ipos1 = pos[icol] as usize;
                let ipos2 = if mirror[icol] >= 0 { mirror[icol] as usize } else { ipos1 };
                for iz in 0..size_z {
                    let z1 = slab[ipos1 + iz * size_xy];
                    let z2 = slab[ipos2 + iz * size_xy];
                    f1[iz] = Complex64::new(0.5 * (z1.re + z2.re), 0.5 * (z1.im - z2.im));
                    f2[iz] = Complex64::new(0.5 * (z1.im + z2.im), 0.5 * (z2.re - z1.re));
                }
            });
    }
}
