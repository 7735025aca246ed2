//! Host batched FFT plans on rustfft.
//!
//! A plan covers `batch` transforms of the same shape, `dist` elements apart. 2D
//! transforms are `[n_slow, n_fast]`, with the fast axis contiguous (the same convention
//! as cuFFT's `n` array). The fast axis runs as a batch of rows; the slow axis is done a
//! column at a time through a small gather buffer.

use std::sync::Arc;

use rayon::prelude::*;
use rustfft::{Fft, FftPlanner};

use crate::{
    Complex64, backend_failure,
    config::BackendKind,
    error::{BackendFailure, FailureKind},
    memory::{Allocator, Buffer},
};

/// Sign of the exponent, vendor naming: `Forward` is e^{-i…}, `Backward` is e^{+i…}.
/// Neither direction normalizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FftSign {
    Forward,
    Backward,
}

/// Shape of a batched transform over contiguous data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanShape {
    /// Slowest axis first.
    pub lengths: Vec<usize>,
    /// Distance between consecutive transforms, in elements.
    pub dist: usize,
    pub batch: usize,
}

impl PlanShape {
    pub fn new(lengths: &[usize], batch: usize) -> Self {
        Self {
            lengths: lengths.to_vec(),
            dist: lengths.iter().product(),
            batch,
        }
    }

    /// Points in one transform.
    pub fn len(&self) -> usize {
        self.lengths.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Elements covered by the whole batch.
    pub fn span(&self) -> usize {
        self.batch * self.dist
    }
}

struct Axes {
    /// One plan per axis, slowest first.
    plans: Vec<Arc<dyn Fft<f64>>>,
}

pub struct HostBatchPlan {
    shape: PlanShape,
    forward: Axes,
    backward: Axes,
    /// Scratch for one worker: the largest in-place scratch of any axis, plus the gather
    /// buffer for the slow axis of a 2D transform.
    scratch_len: usize,
    workers: usize,
    workspace: Option<Buffer<Complex64>>,
    /// The workspace was bound by the caller rather than allocated here.
    supplied: bool,
}

impl std::fmt::Debug for HostBatchPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBatchPlan")
            .field("shape", &self.shape)
            .field("workers", &self.workers)
            .field("work_size", &self.work_size())
            .field("has_workspace", &self.workspace.is_some())
            .finish()
    }
}

fn host_failure(call: &'static str, kind: FailureKind, code: usize) -> BackendFailure {
    backend_failure!(BackendKind::Host, call, kind, code as i32)
}

impl HostBatchPlan {
    /// With `auto_alloc`, the plan allocates its own workspace from `alloc`; otherwise one
    /// must be bound with `set_workspace` before the first execution.
    pub fn new(
        planner: &mut FftPlanner<f64>,
        alloc: &Allocator,
        shape: PlanShape,
        auto_alloc: bool,
    ) -> Result<Self, BackendFailure> {
        let rank = shape.lengths.len();
        if !(1..=2).contains(&rank) {
            return Err(host_failure("plan_many", FailureKind::InvalidPlan, rank));
        }
        if shape.lengths.contains(&0) || shape.dist < shape.len() {
            return Err(host_failure("plan_many", FailureKind::InvalidValue, shape.dist));
        }

        let forward = Axes {
            plans: shape.lengths.iter().map(|&n| planner.plan_fft_forward(n)).collect(),
        };
        let backward = Axes {
            plans: shape.lengths.iter().map(|&n| planner.plan_fft_inverse(n)).collect(),
        };

        let fft_scratch = forward
            .plans
            .iter()
            .chain(&backward.plans)
            .map(|p| p.get_inplace_scratch_len())
            .max()
            .unwrap_or(0);
        let gather = if rank == 2 { shape.lengths[0] } else { 0 };
        let scratch_len = (fft_scratch + gather).max(1);
        let workers = rayon::current_num_threads().min(shape.batch).max(1);

        let mut plan = Self {
            shape,
            forward,
            backward,
            scratch_len,
            workers,
            workspace: None,
            supplied: false,
        };
        if auto_alloc {
            plan.workspace = Some(alloc.alloc_host(plan.work_size()));
        }
        Ok(plan)
    }

    pub fn shape(&self) -> &PlanShape {
        &self.shape
    }

    /// Workspace needed by both directions, in elements.
    pub fn work_size(&self) -> usize {
        self.scratch_len * self.workers
    }

    /// Bind a caller-owned host workspace of at least `work_size()` elements. A workspace
    /// the plan allocated itself is released.
    pub fn set_workspace(&mut self, workspace: Buffer<Complex64>) -> Result<(), BackendFailure> {
        if workspace.host().is_none() {
            return Err(host_failure("set_work_area", FailureKind::BufferMismatch, 0));
        }
        if workspace.len() < self.work_size() {
            return Err(host_failure("set_work_area", FailureKind::NoWorkspace, workspace.len()));
        }
        self.workspace = Some(workspace);
        self.supplied = true;
        Ok(())
    }

    /// Hand a caller-supplied workspace back. A workspace the plan allocated itself stays
    /// with the plan and is released when the plan is dropped.
    pub fn take_workspace(&mut self) -> Option<Buffer<Complex64>> {
        if !self.supplied {
            return None;
        }
        self.supplied = false;
        self.workspace.take()
    }

    /// Run the whole batch in place on `data[..span]`.
    pub fn execute(&mut self, sign: FftSign, data: &mut [Complex64]) -> Result<(), BackendFailure> {
        let span = self.shape.span();
        if data.len() < span {
            return Err(host_failure("exec", FailureKind::BufferMismatch, data.len()));
        }
        let (work, scratch_len) = (self.work_size(), self.scratch_len);
        let Some(workspace) = self.workspace.as_mut().and_then(|w| w.host_mut()) else {
            return Err(host_failure("exec", FailureKind::NoWorkspace, 0));
        };
        if span == 0 {
            return Ok(());
        }

        let axes = match sign {
            FftSign::Forward => &self.forward,
            FftSign::Backward => &self.backward,
        };
        let dist = self.shape.dist;
        let lengths = &self.shape.lengths;
        let group = self.shape.batch.div_ceil(self.workers) * dist;

        data[..span]
            .par_chunks_mut(group)
            .zip(workspace[..work].par_chunks_mut(scratch_len))
            .for_each(|(chunk, scratch)| {
                for item in chunk.chunks_mut(dist) {
                    transform_one(axes, lengths, item, scratch);
                }
            });
        Ok(())
    }
}

fn transform_one(axes: &Axes, lengths: &[usize], item: &mut [Complex64], scratch: &mut [Complex64]) {
    match (axes.plans.as_slice(), lengths) {
        ([fft], [n]) => {
            let s = fft.get_inplace_scratch_len();
            fft.process_with_scratch(&mut item[..*n], &mut scratch[..s]);
        }
        ([fft_slow, fft_fast], [n_slow, n_fast]) => {
            let (n_slow, n_fast) = (*n_slow, *n_fast);
            let (tmp, rest) = scratch.split_at_mut(n_slow);

            // Fast axis: contiguous rows.
            let s = fft_fast.get_inplace_scratch_len();
            fft_fast.process_with_scratch(&mut item[..n_slow * n_fast], &mut rest[..s]);

            // Slow axis: strided columns.
            let s = fft_slow.get_inplace_scratch_len();
            for i_fast in 0..n_fast {
                for (j, t) in tmp.iter_mut().enumerate() {
                    *t = item[i_fast + j * n_fast];
                }
                fft_slow.process_with_scratch(tmp, &mut rest[..s]);
                for (j, t) in tmp.iter().enumerate() {
                    item[i_fast + j * n_fast] = *t;
                }
            }
        }
        _ => unreachable!("plan rank is checked at creation"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TWO_PI;

    fn dft(x: &[Complex64], sign: f64) -> Vec<Complex64> {
        let n = x.len();
        (0..n)
            .map(|k| {
                x.iter()
                    .enumerate()
                    .map(|(j, &v)| v * Complex64::from_polar(1., sign * TWO_PI * (j * k) as f64 / n as f64))
                    .sum()
            })
            .collect()
    }

    fn max_diff(a: &[Complex64], b: &[Complex64]) -> f64 {
        a.iter().zip(b).map(|(x, y)| (x - y).norm()).fold(0., f64::max)
    }

    #[test]
    fn batched_1d_matches_dft() {
        let mut planner = FftPlanner::new();
        let mut plan = HostBatchPlan::new(&mut planner, &Allocator::host(), PlanShape::new(&[6], 5), true).unwrap();

        let data: Vec<Complex64> = (0..30)
            .map(|i| Complex64::new((i as f64 * 0.37).sin(), (i as f64 * 0.11).cos()))
            .collect();
        let mut out = data.clone();
        plan.execute(FftSign::Backward, &mut out).unwrap();

        for (src, got) in data.chunks(6).zip(out.chunks(6)) {
            assert!(max_diff(&dft(src, 1.), got) < 1e-12);
        }
    }

    #[test]
    fn plane_matches_separable_dft() {
        // A single plane wave along the slow axis and one along the fast axis.
        let (n_slow, n_fast) = (4, 6);
        let mut planner = FftPlanner::new();
        let mut plan = HostBatchPlan::new(&mut planner, &Allocator::host(), PlanShape::new(&[n_slow, n_fast], 2), true).unwrap();

        let mut data = vec![Complex64::default(); 2 * n_slow * n_fast];
        data[1 + 2 * n_fast] = Complex64::new(1., 0.);
        plan.execute(FftSign::Backward, &mut data).unwrap();

        for j in 0..n_slow {
            for i in 0..n_fast {
                let phase = TWO_PI * (i as f64 / n_fast as f64 + 2. * j as f64 / n_slow as f64);
                let expected = Complex64::from_polar(1., phase);
                assert!((data[i + j * n_fast] - expected).norm() < 1e-12);
            }
        }
        // Second batch untouched by the first.
        assert!(data[n_slow * n_fast..].iter().all(|z| z.norm() == 0.));
    }

    #[test]
    fn forward_then_backward_scales_by_n() {
        let mut planner = FftPlanner::new();
        let mut plan = HostBatchPlan::new(&mut planner, &Allocator::host(), PlanShape::new(&[3, 5], 3), true).unwrap();
        let data: Vec<Complex64> = (0..45).map(|i| Complex64::new(i as f64, -(i as f64) / 2.)).collect();

        let mut work = data.clone();
        plan.execute(FftSign::Forward, &mut work).unwrap();
        plan.execute(FftSign::Backward, &mut work).unwrap();
        for (a, b) in work.iter().zip(&data) {
            assert!((*a / 15. - *b).norm() < 1e-12);
        }
    }

    #[test]
    fn workspace_must_be_bound() {
        let alloc = Allocator::host();
        let mut planner = FftPlanner::new();
        let mut plan = HostBatchPlan::new(&mut planner, &alloc, PlanShape::new(&[8], 4), false).unwrap();
        let mut data = vec![Complex64::default(); 32];
        assert_eq!(alloc.live(), 0);

        let err = plan.execute(FftSign::Forward, &mut data).unwrap_err();
        assert_eq!(err.kind, FailureKind::NoWorkspace);

        assert!(plan.set_workspace(alloc.alloc_host(0)).is_err());
        plan.set_workspace(alloc.alloc_host(plan.work_size())).unwrap();
        plan.execute(FftSign::Forward, &mut data).unwrap();

        let ws = plan.take_workspace().unwrap();
        assert_eq!(ws.len(), plan.work_size());
        assert!(plan.take_workspace().is_none());
        drop(ws);
        assert_eq!(alloc.live(), 0);
    }

    #[test]
    fn own_workspace_is_released_with_the_plan() {
        let alloc = Allocator::host();
        let mut planner = FftPlanner::new();
        let mut plan = HostBatchPlan::new(&mut planner, &alloc, PlanShape::new(&[4, 4], 2), true).unwrap();
        assert_eq!(alloc.live(), 1);
        assert!(plan.take_workspace().is_none());
        drop(plan);
        assert_eq!(alloc.live(), 0);
    }

    #[test]
    fn rank_three_is_rejected() {
        let mut planner = FftPlanner::new();
        let err = HostBatchPlan::new(&mut planner, &Allocator::host(), PlanShape::new(&[2, 2, 2], 1), true).unwrap_err();
        assert_eq!(err.kind, FailureKind::InvalidPlan);
    }
}
