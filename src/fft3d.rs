//! The 3D transform driver.
//!
//! Forward (G → r): load the sparse coefficients into this rank's z-columns, transform
//! along z, transpose to xy-slabs, unpack the columns into full planes and transform
//! along x and y. Backward (r → G) runs the same stages in reverse and scales by 1/N.
//! The dense real-space field stays in the driver's slab buffer; see `slab_to_host` and
//! `slab_from_host`.
//!
//! A driver is created for one grid, FFT communicator and batch count. `prepare` binds
//! it to a G-vector distribution and allocates everything sized by it; `dismiss` gives
//! those buffers back. The xy plan lives as long as the driver, and the z plan survives
//! a dismiss and is reused by the next prepare with the same column count.

use std::sync::Arc;

use crate::{
    Complex64,
    backend::{BackendContext, Direction, PlanHandle},
    comm::Communicator,
    config::FftConfig,
    error::{ConfigError, FftError},
    fft::{FftSign, PlanShape},
    grid::{FftGrid, ZSplit},
    kernels::{self, StickLayout},
    memory::{Allocator, Buffer},
    partition::GvecDistribution,
    transpose::Transpose,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Prepared,
    Dismissed,
    /// A transform failed part way; the buffers can't be trusted until re-prepared.
    Faulted,
}

/// z transforms of `batch · ncol` columns.
#[derive(Debug)]
struct ColumnPlan {
    ncol: usize,
    plan: PlanHandle,
}

/// Everything sized by the bound distribution.
#[derive(Debug)]
struct Prepared {
    dist: Arc<GvecDistribution>,
    reduced: bool,
    /// G-vectors of this FFT rank.
    npw: usize,
    /// Columns of this FFT rank.
    ncol: usize,
    size_z: usize,
    /// Batches the column side is sized for: at least 2 on a reduced set, for pairs.
    col_batches: usize,
    /// Position of each local G-vector in a column batch, `iz + icol · size_z`.
    gvec_map: Buffer<i32>,
    /// Position of -G for each stored G of the (0, 0) column, or -1 for G = 0. Empty
    /// unless the set is reduced and the column is ours.
    x0y0_map: Buffer<i32>,
    /// Where the (0, 0) column starts in the local coefficients.
    x0y0_offset: usize,
    /// xy position of every column of the FFT, then of its mirror (-1 if none).
    col_pos: Buffer<i32>,
    layout: StickLayout,
    data: Buffer<Complex64>,
    cols: Buffer<Complex64>,
    sticks: Buffer<Complex64>,
    slab: Buffer<Complex64>,
    transpose: Transpose,
}

#[derive(Debug)]
pub struct Fft3d {
    grid: FftGrid,
    comm: Communicator,
    ctx: BackendContext,
    alloc: Allocator,
    batch: usize,
    zsplit: ZSplit,
    xy_plan: Option<PlanHandle>,
    z_plan: Option<ColumnPlan>,
    prepared: Option<Prepared>,
    state: DriverState,
}

fn to_i32(v: usize) -> i32 {
    v as i32
}

impl Fft3d {
    /// `comm` is the FFT communicator: the ranks that share the z-slabs of the grid.
    pub fn new(grid: FftGrid, comm: Communicator, ctx: BackendContext, batch: usize) -> Result<Self, FftError> {
        if batch == 0 {
            return Err(ConfigError::InvalidDimensions("batch count must be at least 1".into()).into());
        }
        let alloc = ctx.allocator();
        let zsplit = ZSplit::new(grid.size(2), comm.size());
        let zl = zsplit.size(comm.rank());

        // The xy plan's workspace is bound in `prepare` and handed back in `dismiss`.
        let xy_plan = if zl > 0 {
            let shape = PlanShape::new(&[grid.size(1), grid.size(0)], batch * zl);
            Some(PlanHandle::create(&ctx, &alloc, shape, false)?)
        } else {
            None
        };

        log::debug!(
            "FFT driver: grid {:?}, {} ranks, z-planes {}..{} here, batch {batch}, {:?} backend",
            grid.dims(),
            comm.size(),
            zsplit.offset(comm.rank()),
            zsplit.offset(comm.rank()) + zl,
            ctx.kind()
        );

        Ok(Self {
            grid,
            comm,
            ctx,
            alloc,
            batch,
            zsplit,
            xy_plan,
            z_plan: None,
            prepared: None,
            state: DriverState::Idle,
        })
    }

    /// Driver on the backend named by `config`.
    pub fn with_config(grid: FftGrid, comm: Communicator, config: &FftConfig, batch: usize) -> Result<Self, FftError> {
        let ctx = BackendContext::new(config)?;
        Self::new(grid, comm, ctx, batch)
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn grid(&self) -> &FftGrid {
        &self.grid
    }

    pub fn size(&self, axis: usize) -> usize {
        self.grid.size(axis)
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn backend(&self) -> &BackendContext {
        &self.ctx
    }

    /// The allocator every buffer of this driver comes from.
    pub fn allocator(&self) -> &Allocator {
        &self.alloc
    }

    /// z-planes of the slab on this rank.
    pub fn local_size_z(&self) -> usize {
        self.zsplit.size(self.comm.rank())
    }

    pub fn offset_z(&self) -> usize {
        self.zsplit.offset(self.comm.rank())
    }

    /// Position of grid point (x, y, local z) in one batch of the slab.
    pub fn index_by_coord(&self, x: usize, y: usize, z_local: usize) -> usize {
        x + self.grid.size(0) * (y + z_local * self.grid.size(1))
    }

    /// Elements of the whole slab buffer, all batches.
    pub fn slab_len(&self) -> usize {
        self.batch * self.grid.size_xy() * self.local_size_z()
    }

    /// The distribution the driver is bound to.
    pub fn distribution(&self) -> Option<&Arc<GvecDistribution>> {
        self.prepared.as_ref().map(|p| &p.dist)
    }

    /// Bind to a distribution. Preparing again with the same one is a no-op; with another
    /// one the buffers are replaced.
    pub fn prepare(&mut self, dist: Arc<GvecDistribution>) -> Result<(), FftError> {
        if self.state == DriverState::Prepared
            && let Some(p) = &self.prepared
            && Arc::ptr_eq(&p.dist, &dist)
        {
            return Ok(());
        }

        let fft = dist.comm_fft();
        // Any two single-rank communicators are interchangeable.
        let same = fft.same_group(&self.comm) || (fft.size() == 1 && self.comm.size() == 1);
        if !same || fft.rank() != self.comm.rank() {
            return Err(ConfigError::InvalidCommunicator {
                fft: fft.size(),
                ortho: dist.comm_ortho().size(),
                total: self.comm.size(),
            }
            .into());
        }
        self.grid.check_fits(dist.gvec().limits())?;

        // Old buffers go before new ones are allocated.
        self.prepared = None;
        self.release_xy_workspace();
        if self.state == DriverState::Prepared {
            self.state = DriverState::Dismissed;
        }

        if let Some(plan) = &mut self.xy_plan {
            plan.set_workspace(self.alloc.alloc(plan.work_size())?)?;
        }

        let ncol = dist.zcol_count_fft();
        if self.z_plan.as_ref().is_some_and(|z| z.ncol != ncol) {
            self.z_plan = None;
        }
        if self.z_plan.is_none() && ncol > 0 {
            let shape = PlanShape::new(&[self.grid.size(2)], self.batch * ncol);
            let plan = PlanHandle::create(&self.ctx, &self.alloc, shape, true)?;
            self.z_plan = Some(ColumnPlan { ncol, plan });
        }

        self.prepared = Some(self.build(dist)?);
        self.state = DriverState::Prepared;
        Ok(())
    }

    fn build(&self, dist: Arc<GvecDistribution>) -> Result<Prepared, FftError> {
        let gvec = dist.gvec();
        let reduced = gvec.reduced();
        let nz = self.grid.size(2);
        let zl = self.local_size_z();
        let n_fft = self.comm.size();

        let local_cols = dist.fft_columns();
        let ncol = local_cols.len();
        let npw = dist.gvec_count_fft();

        let mut gvec_map = Vec::with_capacity(npw);
        let mut x0y0_map = Vec::new();
        let mut x0y0_offset = 0;
        for (icol, &c) in local_cols.iter().enumerate() {
            let col = &gvec.columns()[c];
            if reduced && col.is_origin() {
                x0y0_offset = gvec_map.len();
                x0y0_map = col
                    .z
                    .iter()
                    .map(|&z| if z == 0 { -1 } else { to_i32(self.grid.wrap(2, -z) + icol * nz) })
                    .collect();
            }
            gvec_map.extend(col.z.iter().map(|&z| to_i32(self.grid.wrap(2, z) + icol * nz)));
        }
        debug_assert_eq!(gvec_map.len(), npw);

        // Global column order of the slab side: FFT rank by FFT rank.
        let col_counts: Vec<usize> = (0..n_fft).map(|f| dist.zcol_count_fft_of(f)).collect();
        let all_cols: Vec<usize> = (0..n_fft).flat_map(|f| dist.fft_columns_of(f)).collect();
        let ntot = all_cols.len();
        let mut col_pos = vec![-1; 2 * ntot];
        for (gcol, &c) in all_cols.iter().enumerate() {
            let col = &gvec.columns()[c];
            col_pos[gcol] = to_i32(self.grid.xy_pos(col.x, col.y));
            if reduced && !col.is_origin() {
                col_pos[ntot + gcol] = to_i32(self.grid.xy_pos(-col.x, -col.y));
            }
        }

        let col_batches = if reduced { self.batch.max(2) } else { self.batch };
        let col_span = col_batches.div_ceil(self.batch) * self.batch;
        let layout = StickLayout {
            size_xy: self.grid.size_xy(),
            size_z: zl,
            num_cols: ntot,
        };

        let alloc = &self.alloc;
        let prepared = Prepared {
            reduced,
            npw,
            ncol,
            size_z: nz,
            col_batches,
            gvec_map: alloc.upload(&gvec_map)?,
            x0y0_map: alloc.upload(&x0y0_map)?,
            x0y0_offset,
            col_pos: alloc.upload(&col_pos)?,
            layout,
            data: alloc.alloc(col_batches * npw)?,
            cols: alloc.alloc(col_span * ncol * nz)?,
            sticks: alloc.alloc(col_batches * layout.stick_len())?,
            slab: alloc.alloc(self.batch * layout.slab_len())?,
            transpose: Transpose::new(alloc, self.comm.clone(), nz, col_counts, col_batches)?,
            dist,
        };

        log::info!(
            "FFT driver prepared: rank {} of {}, {npw} G-vectors in {ncol} of {ntot} columns, \
             {zl} z-planes, {} live buffers",
            self.comm.rank(),
            n_fft,
            alloc.live()
        );
        Ok(prepared)
    }

    /// Release the buffers of the bound distribution. Calling it again does nothing.
    pub fn dismiss(&mut self) {
        let had_buffers = self.prepared.take().is_some();
        self.release_xy_workspace();
        if had_buffers {
            log::debug!("FFT driver dismissed, {} live buffers", self.alloc.live());
        }
        if self.state != DriverState::Idle {
            self.state = DriverState::Dismissed;
        }
    }

    /// Unbind the workspace this driver supplied to the xy plan and return it to the
    /// allocator.
    fn release_xy_workspace(&mut self) {
        if let Some(ws) = self.xy_plan.as_mut().and_then(|p| p.take_workspace()) {
            log::trace!("xy plan workspace of {} elements released", ws.len());
        }
    }

    fn check_ready(&self) -> Result<(), FftError> {
        match self.state {
            DriverState::Prepared => Ok(()),
            DriverState::Faulted => Err(FftError::Faulted),
            other => panic!("FFT driver used while {other:?}; call prepare first"),
        }
    }

    /// Record a failure so the driver refuses to continue on half-finished buffers.
    fn guard(&mut self, result: Result<(), FftError>) -> Result<(), FftError> {
        if let Err(e) = &result {
            log::error!("FFT transform failed on rank {}: {e}", self.comm.rank());
            self.state = DriverState::Faulted;
        }
        result
    }

    /// Transform `batch` fields. Forward reads `data` (`batch · gvec_count_fft()`
    /// coefficients, batch outermost) and leaves the real-space fields in the slab.
    /// Backward transforms the slab and overwrites `data`.
    pub fn transform(&mut self, dir: Direction, data: &mut [Complex64]) -> Result<(), FftError> {
        match dir {
            Direction::Forward => self.forward(data),
            Direction::Backward => self.backward(data),
        }
    }

    pub fn forward(&mut self, data: &[Complex64]) -> Result<(), FftError> {
        self.check_ready()?;
        let result = self.run_forward(data);
        self.guard(result)
    }

    pub fn backward(&mut self, data: &mut [Complex64]) -> Result<(), FftError> {
        self.backward_accumulate(data, 0.)
    }

    /// Backward transform into `data = alpha · data + result`.
    pub fn backward_accumulate(&mut self, data: &mut [Complex64], alpha: f64) -> Result<(), FftError> {
        self.check_ready()?;
        let result = self.run_backward(data, alpha);
        self.guard(result)
    }

    /// Two real fields of a reduced set through one complex transform. Forward leaves
    /// `f1(r) + i·f2(r)` in the first slab batch; backward expects such a slab and writes
    /// the coefficients of both fields.
    pub fn transform_pair(&mut self, dir: Direction, f1: &mut [Complex64], f2: &mut [Complex64]) -> Result<(), FftError> {
        self.check_ready()?;
        let result = match dir {
            Direction::Forward => self.run_pair_forward(f1, f2),
            Direction::Backward => self.run_pair_backward(f1, f2),
        };
        self.guard(result)
    }

    fn run_forward(&mut self, data: &[Complex64]) -> Result<(), FftError> {
        let Some(p) = self.prepared.as_mut() else {
            return Err(FftError::Faulted);
        };
        let nb = self.batch;
        assert_eq!(data.len(), nb * p.npw, "coefficient array has the wrong length");

        p.data.copy_from_host(data)?;
        p.load_columns(nb)?;
        column_fft(self.z_plan.as_mut(), Direction::Forward.sign(), &mut p.cols, nb, self.batch, p.ncol)?;
        p.transpose.columns_to_slabs(nb, &p.cols, &mut p.sticks)?;
        kernels::unpack_columns(nb, p.layout, &p.col_pos, &p.sticks, &mut p.slab, p.reduced)?;
        slab_fft(self.xy_plan.as_mut(), Direction::Forward.sign(), &mut p.slab)?;

        log::trace!("forward transform of {nb} fields");
        Ok(())
    }

    fn run_backward(&mut self, data: &mut [Complex64], alpha: f64) -> Result<(), FftError> {
        let Some(p) = self.prepared.as_mut() else {
            return Err(FftError::Faulted);
        };
        let nb = self.batch;
        assert_eq!(data.len(), nb * p.npw, "coefficient array has the wrong length");
        let norm = 1. / self.grid.num_points() as f64;

        slab_fft(self.xy_plan.as_mut(), Direction::Backward.sign(), &mut p.slab)?;
        kernels::pack_columns(nb, p.layout, &p.col_pos, &p.slab, &mut p.sticks)?;
        p.transpose.slabs_to_columns(nb, &p.sticks, &mut p.cols)?;
        column_fft(self.z_plan.as_mut(), Direction::Backward.sign(), &mut p.cols, nb, self.batch, p.ncol)?;

        if alpha != 0. {
            p.data.copy_from_host(data)?;
        }
        let fft_size = p.ncol * self.grid.size(2);
        kernels::batch_unload(nb, fft_size, &p.gvec_map, &p.cols, &mut p.data, alpha, norm)?;
        p.data.copy_to_host(data)?;

        log::trace!("backward transform of {nb} fields");
        Ok(())
    }

    fn run_pair_forward(&mut self, f1: &[Complex64], f2: &[Complex64]) -> Result<(), FftError> {
        let Some(p) = self.prepared.as_mut() else {
            return Err(FftError::Faulted);
        };
        assert!(p.reduced, "pair transforms need a reduced G-vector set");
        assert!(f1.len() == p.npw && f2.len() == p.npw, "coefficient array has the wrong length");

        let both: Vec<Complex64> = f1.iter().chain(f2).copied().collect();
        p.data.copy_from_host(&both)?;
        p.load_columns(2)?;
        column_fft(self.z_plan.as_mut(), Direction::Forward.sign(), &mut p.cols, 2, self.batch, p.ncol)?;
        p.transpose.columns_to_slabs(2, &p.cols, &mut p.sticks)?;
        kernels::unpack_two_columns(p.layout, &p.col_pos, &p.sticks, &mut p.slab)?;
        slab_fft(self.xy_plan.as_mut(), Direction::Forward.sign(), &mut p.slab)?;
        Ok(())
    }

    fn run_pair_backward(&mut self, f1: &mut [Complex64], f2: &mut [Complex64]) -> Result<(), FftError> {
        let Some(p) = self.prepared.as_mut() else {
            return Err(FftError::Faulted);
        };
        assert!(p.reduced, "pair transforms need a reduced G-vector set");
        assert!(f1.len() == p.npw && f2.len() == p.npw, "coefficient array has the wrong length");
        let norm = 1. / self.grid.num_points() as f64;

        slab_fft(self.xy_plan.as_mut(), Direction::Backward.sign(), &mut p.slab)?;
        kernels::pack_two_columns(p.layout, &p.col_pos, &p.slab, &mut p.sticks)?;
        p.transpose.slabs_to_columns(2, &p.sticks, &mut p.cols)?;
        column_fft(self.z_plan.as_mut(), Direction::Backward.sign(), &mut p.cols, 2, self.batch, p.ncol)?;

        let fft_size = p.ncol * self.grid.size(2);
        kernels::batch_unload(2, fft_size, &p.gvec_map, &p.cols, &mut p.data, 0., norm)?;
        let both = p.data.to_vec()?;
        f1.copy_from_slice(&both[..p.npw]);
        f2.copy_from_slice(&both[p.npw..2 * p.npw]);
        Ok(())
    }

    fn prepared(&self) -> &Prepared {
        match &self.prepared {
            Some(p) => p,
            None => panic!("FFT driver has no buffers while {:?}; call prepare first", self.state),
        }
    }

    /// Copy the real-space slab (all batches, `slab_len()` elements) to host memory.
    pub fn slab_to_host(&self, out: &mut [Complex64]) -> Result<(), FftError> {
        assert_eq!(out.len(), self.slab_len());
        self.prepared().slab.copy_to_host(out)?;
        Ok(())
    }

    /// Overwrite the real-space slab before a backward transform.
    pub fn slab_from_host(&mut self, src: &[Complex64]) -> Result<(), FftError> {
        assert_eq!(src.len(), self.slab_len());
        let Some(p) = self.prepared.as_mut() else {
            panic!("FFT driver has no buffers while {:?}; call prepare first", self.state);
        };
        p.slab.copy_from_host(src)?;
        Ok(())
    }
}

impl Drop for Fft3d {
    fn drop(&mut self) {
        self.release_xy_workspace();
    }
}

impl Prepared {
    /// Scatter the staged coefficients of `nb` fields into the column batches.
    fn load_columns(&mut self, nb: usize) -> Result<(), FftError> {
        assert!(nb <= self.col_batches);
        let fft_size = self.ncol * self.size_z;
        kernels::batch_load(nb, fft_size, &self.gvec_map, &self.data, &mut self.cols)?;
        if self.reduced {
            kernels::load_x0y0(
                nb,
                fft_size,
                self.npw,
                self.x0y0_offset,
                &self.x0y0_map,
                &self.data,
                &mut self.cols,
            )?;
        }
        Ok(())
    }
}

/// z transforms of `nb` column batches, in chunks of the plan's batch count.
fn column_fft(
    plan: Option<&mut ColumnPlan>,
    sign: FftSign,
    cols: &mut Buffer<Complex64>,
    nb: usize,
    batch: usize,
    ncol: usize,
) -> Result<(), FftError> {
    let Some(z) = plan else {
        return Ok(());
    };
    debug_assert_eq!(z.ncol, ncol);
    let chunk = z.plan.shape().span();
    for k in 0..nb.div_ceil(batch) {
        z.plan.execute(sign, cols, k * chunk)?;
    }
    Ok(())
}

fn slab_fft(plan: Option<&mut PlanHandle>, sign: FftSign, slab: &mut Buffer<Complex64>) -> Result<(), FftError> {
    if let Some(plan) = plan {
        plan.execute(sign, slab, 0)?;
    }
    Ok(())
}
