//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use pw_fft::{Complex64, FftGrid, GvecDistribution, GvecSet, RankComms, ReciprocalLattice, TWO_PI, grid::next_fft_size};
use rand::{Rng, SeedableRng, rngs::SmallRng};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A triclinic basis, so nothing depends on the axes being orthogonal.
pub fn skewed_lattice() -> ReciprocalLattice {
    ReciprocalLattice::from_arrays([1., 0., 0.], [0.3, 1.1, 0.], [0.1, -0.2, 0.9]).unwrap()
}

pub fn gvec_set(cutoff: f64, reduce: bool) -> Arc<GvecSet> {
    Arc::new(GvecSet::new(skewed_lattice(), cutoff, reduce).unwrap())
}

/// Smallest fast grid holding the set's actual index range, G+k sets included.
pub fn grid_for(gvec: &GvecSet) -> FftGrid {
    FftGrid::new(gvec.limits().map(|l| next_fft_size(2 * l as usize + 1))).unwrap()
}

pub fn rng(seed: u64) -> SmallRng {
    SmallRng::seed_from_u64(seed)
}

pub fn random_coeffs(rng: &mut SmallRng, n: usize) -> Vec<Complex64> {
    (0..n)
        .map(|_| Complex64::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)))
        .collect()
}

/// Root mean square of the elementwise difference.
pub fn rms(a: &[Complex64], b: &[Complex64]) -> f64 {
    assert_eq!(a.len(), b.len());
    if a.is_empty() {
        return 0.;
    }
    let sum: f64 = a.iter().zip(b).map(|(x, y)| (x - y).norm_sqr()).sum();
    (sum / a.len() as f64).sqrt()
}

pub fn max_abs(a: &[Complex64]) -> f64 {
    a.iter().map(|z| z.norm()).fold(0., f64::max)
}

/// Position of canonical G-vector `ig` among this FFT rank's coefficients.
pub fn fft_position(dist: &GvecDistribution, ig: usize) -> Option<usize> {
    (0..dist.gvec_count_fft()).find(|&i| dist.idx_gvec(i) == ig)
}

/// Random coefficients of `nb` real fields on this FFT rank: G = 0 is made real. The
/// seed is shared by the FFT group so every rank draws the same global field.
pub fn random_real_fields(dist: &GvecDistribution, nb: usize, seed: u64) -> Vec<Complex64> {
    let n = dist.gvec().num_gvec();
    let mut rng = rng(seed);
    let global: Vec<Vec<Complex64>> = (0..nb).map(|_| random_coeffs(&mut rng, n)).collect();
    let ig0 = dist.gvec().index_by_gvec([0, 0, 0]);

    let npw = dist.gvec_count_fft();
    let mut out = Vec::with_capacity(nb * npw);
    for field in &global {
        for i in 0..npw {
            let ig = dist.idx_gvec(i);
            let mut v = field[ig];
            if Some(ig) == ig0 {
                v.im = 0.;
            }
            out.push(v);
        }
    }
    out
}

/// e^{2πi (h·x/Nx + k·y/Ny + l·z/Nz)}
pub fn plane_wave(g: [i32; 3], dims: [usize; 3], x: usize, y: usize, z: usize) -> Complex64 {
    let phase = TWO_PI
        * (g[0] as f64 * x as f64 / dims[0] as f64
            + g[1] as f64 * y as f64 / dims[1] as f64
            + g[2] as f64 * z as f64 / dims[2] as f64);
    Complex64::from_polar(1., phase)
}

/// Run `f` on every rank of an `n_fft × n_ortho` grid, one thread per rank, and collect
/// the results by world rank.
pub fn run_grid<R, F>(n_fft: usize, n_ortho: usize, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(RankComms) -> R + Sync,
{
    let comms = pw_fft::Communicator::grid(n_fft, n_ortho);
    std::thread::scope(|s| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|c| {
                let f = &f;
                s.spawn(move || f(c))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| match h.join() {
                Ok(r) => r,
                Err(e) => std::panic::resume_unwind(e),
            })
            .collect()
    })
}
