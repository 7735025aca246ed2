//! Distribution of a G-vector set over a 2D rank grid.
//!
//! Columns are dealt out over all ranks of the world communicator (the fine-grained
//! distribution) with a longest-processing-time pass: biggest column first, always to the
//! rank with the least G-vectors so far. The ranks are laid out as `fft × ortho`, world
//! rank `f · P_ortho + o`. FFT rank `f` works on the union of the fine-grained parts of
//! world ranks `f · P_ortho .. (f + 1) · P_ortho`, which its ortho communicator gathers.
//!
//! The distributed order of G-vectors is rank 0's G-vectors, then rank 1's, and so on;
//! within a rank, column by column (by column id), z ascending inside a column.

use std::{cmp::Reverse, collections::BinaryHeap, sync::Arc};

use crate::{
    FieldElement,
    comm::{Communicator, RankComms},
    error::{CommError, ConfigError},
    gvec::GvecSet,
};

#[derive(Debug)]
pub struct GvecDistribution {
    gvec: Arc<GvecSet>,
    world: Communicator,
    fft: Communicator,
    ortho: Communicator,
    /// Fine-grained rank owning each column.
    rank_of_column: Vec<usize>,
    /// Column ids held by each fine-grained rank, ascending.
    columns_of_rank: Vec<Vec<usize>>,
    gvec_count: Vec<usize>,
    gvec_offset: Vec<usize>,
    zcol_count: Vec<usize>,
    zcol_offset: Vec<usize>,
    /// Canonical G-vector index at each position of the distributed order.
    order: Vec<usize>,
}

fn exclusive_scan(counts: &[usize]) -> Vec<usize> {
    counts
        .iter()
        .scan(0, |acc, &n| {
            let offset = *acc;
            *acc += n;
            Some(offset)
        })
        .collect()
}

/// Longest-processing-time assignment of items (by size) to `n_bins` bins. Ties go to
/// the lower item id and the lower bin id, so every rank computes the same answer.
pub(crate) fn lpt_assign(sizes: &[usize], n_bins: usize) -> Vec<usize> {
    let mut items: Vec<usize> = (0..sizes.len()).collect();
    items.sort_by_key(|&i| (Reverse(sizes[i]), i));

    let mut heap: BinaryHeap<Reverse<(usize, usize)>> = (0..n_bins).map(|b| Reverse((0, b))).collect();
    let mut bin_of = vec![0; sizes.len()];

    for i in items {
        if let Some(Reverse((load, bin))) = heap.pop() {
            bin_of[i] = bin;
            heap.push(Reverse((load + sizes[i], bin)));
        }
    }
    bin_of
}

impl GvecDistribution {
    /// `world` must be the `fft × ortho` grid: world rank = fft rank · ortho size + ortho
    /// rank.
    pub fn new(
        gvec: Arc<GvecSet>,
        world: Communicator,
        fft: Communicator,
        ortho: Communicator,
    ) -> Result<Self, ConfigError> {
        let shape_err = ConfigError::InvalidCommunicator {
            fft: fft.size(),
            ortho: ortho.size(),
            total: world.size(),
        };
        if fft.size() * ortho.size() != world.size() {
            return Err(shape_err);
        }
        if world.rank() != fft.rank() * ortho.size() + ortho.rank() {
            return Err(shape_err);
        }

        let n_ranks = world.size();
        let sizes: Vec<usize> = gvec.columns().iter().map(|c| c.len()).collect();
        let rank_of_column = lpt_assign(&sizes, n_ranks);

        let mut columns_of_rank = vec![Vec::new(); n_ranks];
        for (icol, &r) in rank_of_column.iter().enumerate() {
            columns_of_rank[r].push(icol);
        }

        let gvec_count: Vec<usize> = columns_of_rank
            .iter()
            .map(|cols| cols.iter().map(|&c| sizes[c]).sum())
            .collect();
        let zcol_count: Vec<usize> = columns_of_rank.iter().map(|c| c.len()).collect();
        let gvec_offset = exclusive_scan(&gvec_count);
        let zcol_offset = exclusive_scan(&zcol_count);

        let order: Vec<usize> = columns_of_rank
            .iter()
            .flatten()
            .flat_map(|&c| gvec.columns()[c].gvec.iter().copied())
            .collect();

        let max_col = sizes.iter().copied().max().unwrap_or(0);
        let (lo, hi) = (
            gvec_count.iter().copied().min().unwrap_or(0),
            gvec_count.iter().copied().max().unwrap_or(0),
        );
        log::info!(
            "G-vector distribution: {} columns, {} G-vectors over {} ranks ({} fft x {} ortho); \
             G-vectors per rank {lo}..{hi}, largest column {max_col}",
            sizes.len(),
            gvec.num_gvec(),
            n_ranks,
            fft.size(),
            ortho.size()
        );

        Ok(Self {
            gvec,
            world,
            fft,
            ortho,
            rank_of_column,
            columns_of_rank,
            gvec_count,
            gvec_offset,
            zcol_count,
            zcol_offset,
            order,
        })
    }

    /// Distribute over a rank grid built by `Communicator::grid`.
    pub fn from_rank_comms(gvec: Arc<GvecSet>, comms: &RankComms) -> Result<Self, ConfigError> {
        Self::new(
            gvec,
            comms.world.clone(),
            comms.fft.clone(),
            comms.ortho.clone(),
        )
    }

    /// Everything on one rank.
    pub fn serial(gvec: Arc<GvecSet>) -> Self {
        let sizes: Vec<usize> = gvec.columns().iter().map(|c| c.len()).collect();
        let n = gvec.num_gvec();
        let order = gvec
            .columns()
            .iter()
            .flat_map(|c| c.gvec.iter().copied())
            .collect();

        Self {
            world: Communicator::solo(),
            fft: Communicator::solo(),
            ortho: Communicator::solo(),
            rank_of_column: vec![0; sizes.len()],
            columns_of_rank: vec![(0..sizes.len()).collect()],
            gvec_count: vec![n],
            gvec_offset: vec![0],
            zcol_count: vec![sizes.len()],
            zcol_offset: vec![0],
            order,
            gvec,
        }
    }

    pub fn gvec(&self) -> &GvecSet {
        &self.gvec
    }

    pub fn gvec_arc(&self) -> &Arc<GvecSet> {
        &self.gvec
    }

    pub fn comm_world(&self) -> &Communicator {
        &self.world
    }

    pub fn comm_fft(&self) -> &Communicator {
        &self.fft
    }

    pub fn comm_ortho(&self) -> &Communicator {
        &self.ortho
    }

    pub fn num_ranks(&self) -> usize {
        self.world.size()
    }

    pub fn rank_of_column(&self, icol: usize) -> usize {
        self.rank_of_column[icol]
    }

    /// Number of G-vectors on a rank of the fine-grained distribution.
    pub fn gvec_count(&self, rank: usize) -> usize {
        self.gvec_count[rank]
    }

    /// Offset of a rank's G-vectors in the distributed order.
    pub fn gvec_offset(&self, rank: usize) -> usize {
        self.gvec_offset[rank]
    }

    pub fn zcol_count(&self, rank: usize) -> usize {
        self.zcol_count[rank]
    }

    pub fn zcol_offset(&self, rank: usize) -> usize {
        self.zcol_offset[rank]
    }

    /// Column ids held by a fine-grained rank.
    pub fn columns_of_rank(&self, rank: usize) -> &[usize] {
        &self.columns_of_rank[rank]
    }

    /// G-vectors held by this rank in the fine-grained distribution.
    pub fn local_gvec_count(&self) -> usize {
        self.gvec_count[self.world.rank()]
    }

    /// Canonical index of the `igloc`-th local G-vector of this rank (fine-grained).
    pub fn idx_gvec_local(&self, igloc: usize) -> usize {
        self.order[self.gvec_offset[self.world.rank()] + igloc]
    }

    fn fine_ranks_of_fft(&self, fft_rank: usize) -> std::ops::Range<usize> {
        let po = self.ortho.size();
        fft_rank * po..(fft_rank + 1) * po
    }

    /// G-vectors on an FFT rank: all of its ortho group.
    pub fn gvec_count_fft_of(&self, fft_rank: usize) -> usize {
        self.fine_ranks_of_fft(fft_rank)
            .map(|r| self.gvec_count[r])
            .sum()
    }

    pub fn gvec_count_fft(&self) -> usize {
        self.gvec_count_fft_of(self.fft.rank())
    }

    pub fn gvec_offset_fft(&self) -> usize {
        self.gvec_offset[self.fine_ranks_of_fft(self.fft.rank()).start]
    }

    /// Canonical index of the `igloc`-th G-vector of this FFT rank.
    pub fn idx_gvec(&self, igloc: usize) -> usize {
        self.order[self.gvec_offset_fft() + igloc]
    }

    pub fn zcol_count_fft_of(&self, fft_rank: usize) -> usize {
        self.fine_ranks_of_fft(fft_rank)
            .map(|r| self.zcol_count[r])
            .sum()
    }

    pub fn zcol_count_fft(&self) -> usize {
        self.zcol_count_fft_of(self.fft.rank())
    }

    /// Column ids handled by an FFT rank, in the order its G-vectors are stored.
    pub fn fft_columns_of(&self, fft_rank: usize) -> Vec<usize> {
        self.fine_ranks_of_fft(fft_rank)
            .flat_map(|r| self.columns_of_rank[r].iter().copied())
            .collect()
    }

    pub fn fft_columns(&self) -> Vec<usize> {
        self.fft_columns_of(self.fft.rank())
    }

    /// Collect this rank's fine-grained coefficients into the FFT distribution, over the
    /// ortho communicator. `out` has `gvec_count_fft()` elements.
    pub fn gather_pw_fft<T: FieldElement>(&self, local: &[T], out: &mut [T]) -> Result<(), CommError> {
        let counts: Vec<usize> = self
            .fine_ranks_of_fft(self.fft.rank())
            .map(|r| self.gvec_count[r])
            .collect();
        self.ortho.all_gather_v(local, out, &counts)
    }

    /// Collect every rank's coefficients into `out`, in canonical G-vector order.
    pub fn gather_pw_global<T: FieldElement>(&self, local: &[T], out: &mut [T]) -> Result<(), CommError> {
        assert_eq!(out.len(), self.gvec.num_gvec());

        let mut distributed = vec![T::default(); out.len()];
        self.world
            .all_gather_v(local, &mut distributed, &self.gvec_count)?;

        for (pos, v) in distributed.into_iter().enumerate() {
            out[self.order[pos]] = v;
        }
        Ok(())
    }
}
