//! The transpose between column-local and slab-local layouts.
//!
//! Column side: each FFT rank holds whole z-columns, `[batch][icol][iz]` with `size_z`
//! entries per column. Slab side: each rank holds every column of the FFT, but only for
//! its own z-range, `[batch][gcol][iz_local]`; global column ids run over the FFT ranks
//! in order. In between sits the exchange buffer of the all-to-all, one contiguous block
//! per peer rank, `[batch][icol][iz]` inside the block. Every element moves exactly once.

use rayon::prelude::*;

use crate::{
    Complex64,
    comm::Communicator,
    error::{BackendFailure, FftError},
    grid::ZSplit,
    kernels::device,
    memory::{Allocator, Buffer},
};

/// Which way a repack copies, relative to the exchange buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepackDir {
    /// Local layout into the exchange buffer, before the all-to-all.
    ToExchange,
    /// Exchange buffer into the local layout, after the all-to-all.
    FromExchange,
}

impl RepackDir {
    /// Direction code of the device launchers.
    #[cfg_attr(not(feature = "cuda"), allow(dead_code))]
    pub(crate) fn code(self) -> i32 {
        match self {
            Self::ToExchange => 1,
            Self::FromExchange => -1,
        }
    }
}

fn to_i32(v: &[usize]) -> Vec<i32> {
    v.iter().map(|&x| x as i32).collect()
}

/// Index tables the repacks need, in the allocator's memory space.
#[derive(Debug)]
struct Tables {
    z_sizes: Buffer<i32>,
    z_offsets: Buffer<i32>,
    col_counts: Buffer<i32>,
    col_offsets: Buffer<i32>,
    col_owner: Buffer<i32>,
}

#[derive(Debug)]
pub struct Transpose {
    comm: Communicator,
    size_z: usize,
    zsplit: ZSplit,
    side: host::StickSide,
    tables: Tables,
    send: Buffer<Complex64>,
    recv: Buffer<Complex64>,
    max_batches: usize,
}

impl Transpose {
    /// `col_counts[r]` is the number of columns FFT rank `r` holds. Exchange buffers are
    /// sized for up to `max_batches` batches.
    pub fn new(
        alloc: &Allocator,
        comm: Communicator,
        size_z: usize,
        col_counts: Vec<usize>,
        max_batches: usize,
    ) -> Result<Self, BackendFailure> {
        let n_ranks = comm.size();
        assert_eq!(col_counts.len(), n_ranks);

        let zsplit = ZSplit::new(size_z, n_ranks);
        let mut col_offsets = Vec::with_capacity(n_ranks);
        let mut col_owner = Vec::new();
        let mut acc = 0;
        for (r, &n) in col_counts.iter().enumerate() {
            col_offsets.push(acc);
            col_owner.extend(std::iter::repeat_n(r, n));
            acc += n;
        }

        let tables = Tables {
            z_sizes: alloc.upload(&to_i32(zsplit.sizes()))?,
            z_offsets: alloc.upload(&to_i32(zsplit.offsets()))?,
            col_counts: alloc.upload(&to_i32(&col_counts))?,
            col_offsets: alloc.upload(&to_i32(&col_offsets))?,
            col_owner: alloc.upload(&to_i32(&col_owner))?,
        };

        let me = comm.rank();
        let len = max_batches * (col_counts[me] * size_z).max(acc * zsplit.size(me));

        Ok(Self {
            send: alloc.alloc(len)?,
            recv: alloc.alloc(len)?,
            side: host::StickSide {
                size_z: zsplit.size(me),
                col_counts,
                col_offsets,
                col_owner,
            },
            comm,
            size_z,
            zsplit,
            tables,
            max_batches,
        })
    }

    pub fn zsplit(&self) -> &ZSplit {
        &self.zsplit
    }

    pub fn local_cols(&self) -> usize {
        self.side.col_counts[self.comm.rank()]
    }

    pub fn total_cols(&self) -> usize {
        self.side.total_cols()
    }

    pub fn local_z(&self) -> usize {
        self.zsplit.size(self.comm.rank())
    }

    /// Column-local `cols` into slab-local `sticks`.
    pub fn columns_to_slabs(
        &mut self,
        nb: usize,
        cols: &Buffer<Complex64>,
        sticks: &mut Buffer<Complex64>,
    ) -> Result<(), FftError> {
        assert!(nb <= self.max_batches);
        let me = self.comm.rank();
        let ncol = self.local_cols();
        let zl = self.local_z();

        let send_counts: Vec<usize> = self.zsplit.sizes().iter().map(|&zs| nb * ncol * zs).collect();
        let recv_counts: Vec<usize> = self.side.col_counts.iter().map(|&nc| nb * nc * zl).collect();

        self.pack_columns_for_send(nb, cols)?;
        self.exchange(&send_counts, &recv_counts)?;
        self.unpack_received_sticks(nb, sticks)?;

        log::trace!("rank {me}: columns to slabs, {nb} batches");
        Ok(())
    }

    /// Slab-local `sticks` back into column-local `cols`.
    pub fn slabs_to_columns(
        &mut self,
        nb: usize,
        sticks: &Buffer<Complex64>,
        cols: &mut Buffer<Complex64>,
    ) -> Result<(), FftError> {
        assert!(nb <= self.max_batches);
        let me = self.comm.rank();
        let ncol = self.local_cols();
        let zl = self.local_z();

        let send_counts: Vec<usize> = self.side.col_counts.iter().map(|&nc| nb * nc * zl).collect();
        let recv_counts: Vec<usize> = self.zsplit.sizes().iter().map(|&zs| nb * ncol * zs).collect();

        self.pack_sticks_for_send(nb, sticks)?;
        self.exchange(&send_counts, &recv_counts)?;
        self.unpack_received_columns(nb, cols)?;

        log::trace!("rank {me}: slabs to columns, {nb} batches");
        Ok(())
    }

    /// The all-to-all itself. Device buffers go through host staging.
    fn exchange(&mut self, send_counts: &[usize], recv_counts: &[usize]) -> Result<(), FftError> {
        let ns: usize = send_counts.iter().sum();
        let nr: usize = recv_counts.iter().sum();

        if let (Some(s), Some(r)) = (self.send.host(), self.recv.host_mut()) {
            self.comm
                .all_to_all_v(&s[..ns], send_counts, &mut r[..nr], recv_counts)?;
            return Ok(());
        }

        let mut staged_send = vec![Complex64::default(); ns];
        let mut staged_recv = vec![Complex64::default(); nr];
        self.send.copy_to_host(&mut staged_send)?;
        self.comm
            .all_to_all_v(&staged_send, send_counts, &mut staged_recv, recv_counts)?;
        self.recv.copy_from_host(&staged_recv)?;
        Ok(())
    }

    fn pack_columns_for_send(&mut self, nb: usize, cols: &Buffer<Complex64>) -> Result<(), BackendFailure> {
        let ncol = self.local_cols();

        if let (Some(c), Some(a)) = (cols.host(), self.send.host_mut()) {
            host::columns_to_exchange(nb, self.size_z, ncol, &self.zsplit, c, a);
            return Ok(());
        }
        device::repack_columns(
            RepackDir::ToExchange,
            nb,
            self.size_z,
            ncol,
            max_of(self.zsplit.sizes()),
            &self.tables.z_sizes,
            &self.tables.z_offsets,
            cols,
            &mut self.send,
        )
    }

    fn unpack_received_columns(&mut self, nb: usize, cols: &mut Buffer<Complex64>) -> Result<(), BackendFailure> {
        let ncol = self.local_cols();

        if let (Some(a), Some(c)) = (self.recv.host(), cols.host_mut()) {
            host::exchange_to_columns(nb, self.size_z, ncol, &self.zsplit, a, c);
            return Ok(());
        }
        device::repack_columns(
            RepackDir::FromExchange,
            nb,
            self.size_z,
            ncol,
            max_of(self.zsplit.sizes()),
            &self.tables.z_sizes,
            &self.tables.z_offsets,
            &self.recv,
            cols,
        )
    }

    fn pack_sticks_for_send(&mut self, nb: usize, sticks: &Buffer<Complex64>) -> Result<(), BackendFailure> {
        if let (Some(s), Some(a)) = (sticks.host(), self.send.host_mut()) {
            host::sticks_to_exchange(nb, &self.side, s, a);
            return Ok(());
        }
        device::repack_sticks(
            RepackDir::ToExchange,
            nb,
            self.local_z(),
            self.side.total_cols(),
            &self.tables.col_owner,
            &self.tables.col_offsets,
            &self.tables.col_counts,
            sticks,
            &mut self.send,
        )
    }

    fn unpack_received_sticks(&mut self, nb: usize, sticks: &mut Buffer<Complex64>) -> Result<(), BackendFailure> {
        if let (Some(a), Some(s)) = (self.recv.host(), sticks.host_mut()) {
            host::exchange_to_sticks(nb, &self.side, a, s);
            return Ok(());
        }
        device::repack_sticks(
            RepackDir::FromExchange,
            nb,
            self.local_z(),
            self.side.total_cols(),
            &self.tables.col_owner,
            &self.tables.col_offsets,
            &self.tables.col_counts,
            &self.recv,
            sticks,
        )
    }
}

fn max_of(v: &[usize]) -> usize {
    v.iter().copied().max().unwrap_or(0)
}

/// Slice implementations of the repacks.
pub mod host {
    use super::*;

    /// Slab-side description: local z-range length and the column split over ranks.
    #[derive(Debug, Clone)]
    pub struct StickSide {
        pub size_z: usize,
        pub col_counts: Vec<usize>,
        pub col_offsets: Vec<usize>,
        /// Owning rank of each global column.
        pub col_owner: Vec<usize>,
    }

    impl StickSide {
        pub(super) fn total_cols(&self) -> usize {
            self.col_owner.len()
        }
    }

    /// `cols` is `[b][icol][size_z]`; block `r` of `a2a` gets `[b][icol][z-range of r]`.
    pub fn columns_to_exchange(
        nb: usize,
        size_z: usize,
        ncol: usize,
        zsplit: &ZSplit,
        cols: &[Complex64],
        a2a: &mut [Complex64],
    ) {
        let mut rest = a2a;
        for r in 0..zsplit.num_ranks() {
            let (zs, zo) = (zsplit.size(r), zsplit.offset(r));
            let (block, tail) = rest.split_at_mut(nb * ncol * zs);
            rest = tail;
            if zs == 0 {
                continue;
            }
            block.par_chunks_mut(zs).enumerate().for_each(|(j, dst)| {
                let src = (j / ncol) * ncol * size_z + (j % ncol) * size_z + zo;
                dst.copy_from_slice(&cols[src..src + zs]);
            });
        }
    }

    pub fn exchange_to_columns(
        nb: usize,
        size_z: usize,
        ncol: usize,
        zsplit: &ZSplit,
        a2a: &[Complex64],
        cols: &mut [Complex64],
    ) {
        if ncol == 0 {
            return;
        }
        cols[..nb * ncol * size_z]
            .par_chunks_mut(size_z)
            .enumerate()
            .for_each(|(j, col)| {
                let (ib, icol) = (j / ncol, j % ncol);
                for r in 0..zsplit.num_ranks() {
                    let (zs, zo) = (zsplit.size(r), zsplit.offset(r));
                    let src = nb * ncol * zo + ib * ncol * zs + icol * zs;
                    col[zo..zo + zs].copy_from_slice(&a2a[src..src + zs]);
                }
            });
    }

    /// `sticks` is `[b][gcol][size_z]`; block `s` of `a2a` gets `[b][icol_s][size_z]` for
    /// the columns of rank `s`.
    pub fn sticks_to_exchange(nb: usize, side: &StickSide, sticks: &[Complex64], a2a: &mut [Complex64]) {
        let zl = side.size_z;
        if zl == 0 {
            return;
        }
        let ntot = side.total_cols();
        let mut rest = a2a;
        for (s, &nc) in side.col_counts.iter().enumerate() {
            let (block, tail) = rest.split_at_mut(nb * nc * zl);
            rest = tail;
            let co = side.col_offsets[s];
            block.par_chunks_mut(zl).enumerate().for_each(|(j, dst)| {
                let (ib, icol) = (j / nc, j % nc);
                let src = (ib * ntot + co + icol) * zl;
                dst.copy_from_slice(&sticks[src..src + zl]);
            });
        }
    }

    pub fn exchange_to_sticks(nb: usize, side: &StickSide, a2a: &[Complex64], sticks: &mut [Complex64]) {
        let zl = side.size_z;
        let ntot = side.total_cols();
        if zl == 0 || ntot == 0 {
            return;
        }
        sticks[..nb * ntot * zl]
            .par_chunks_mut(zl)
            .enumerate()
            .for_each(|(j, dst)| {
                let (ib, gcol) = (j / ntot, j % ntot);
                let s = side.col_owner[gcol];
                let (nc, co) = (side.col_counts[s], side.col_offsets[s]);
                let src = nb * zl * co + (ib * nc + gcol - co) * zl;
                dst.copy_from_slice(&a2a[src..src + zl]);
            });
    }
}
