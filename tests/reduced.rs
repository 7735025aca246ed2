//! Centrosymmetric (half-sphere) sets: rebuilding the dropped half, and two real fields
//! sharing one complex transform.

mod common;

use std::sync::Arc;

use common::*;
use pw_fft::{
    BackendContext, Communicator, Complex64, Direction, Fft3d, GvecDistribution, GvecSet,
    kernels::{StickLayout, host},
};
use realfft::RealFftPlanner;
use rustfft::FftPlanner;

#[test]
fn mirrored_columns_are_exact_conjugates() {
    let mut rng = rng(1);
    let layout = StickLayout {
        size_xy: 20,
        size_z: 3,
        num_cols: 4,
    };
    // Three ordinary columns and the (0, 0) column, which has no mirror.
    let col_pos = [1, 7, 12, 0, 19, 13, 8, -1];
    let sticks = random_coeffs(&mut rng, layout.stick_len());
    let mut slab = vec![Complex64::new(f64::NAN, 0.); layout.slab_len()];

    host::unpack_columns(1, layout, &col_pos, &sticks, &mut slab, true);

    for icol in 0..3 {
        for iz in 0..3 {
            let v = sticks[iz + icol * 3];
            assert_eq!(slab[col_pos[icol] as usize + iz * 20], v);
            assert_eq!(slab[col_pos[4 + icol] as usize + iz * 20], v.conj());
        }
    }
    // Points outside any column are cleared.
    assert_eq!(slab[2], Complex64::default());
}

#[test]
fn origin_column_rebuilds_negative_l_exactly() {
    let gvec = gvec_set(3., true);
    let col = gvec.columns().iter().find(|c| c.is_origin()).unwrap();
    assert!(col.z.iter().all(|&l| l >= 0));

    let nz = 9;
    let map: Vec<i32> = col.z.iter().map(|&l| if l == 0 { -1 } else { (-l).rem_euclid(nz) }).collect();
    let pos: Vec<i32> = col.z.iter().map(|&l| l.rem_euclid(nz)).collect();
    let data = random_coeffs(&mut rng(2), col.len());

    let mut buf = vec![Complex64::default(); nz as usize];
    host::batch_load(1, nz as usize, &pos, &data, &mut buf);
    host::load_x0y0(1, nz as usize, col.len(), 0, &map, &data, &mut buf);

    for (i, &l) in col.z.iter().enumerate() {
        assert_eq!(buf[l.rem_euclid(nz) as usize], data[i]);
        assert_eq!(buf[(-l).rem_euclid(nz) as usize], if l == 0 { data[i] } else { data[i].conj() });
    }
}

/// Driver on one rank with a host backend.
fn serial_fft(gvec: &Arc<GvecSet>, batch: usize) -> (Fft3d, Arc<GvecDistribution>) {
    let dist = Arc::new(GvecDistribution::serial(Arc::clone(gvec)));
    let mut fft = Fft3d::new(grid_for(gvec), Communicator::solo(), BackendContext::host(), batch).unwrap();
    fft.prepare(Arc::clone(&dist)).unwrap();
    (fft, dist)
}

fn slab_of(fft: &Fft3d) -> Vec<Complex64> {
    let mut out = vec![Complex64::default(); fft.slab_len()];
    fft.slab_to_host(&mut out).unwrap();
    out
}

#[test]
fn half_sphere_matches_the_full_sphere() {
    init_logging();
    let half = gvec_set(3.4, true);
    let full = gvec_set(3.4, false);
    let (mut fft_half, dist_half) = serial_fft(&half, 1);
    let (mut fft_full, dist_full) = serial_fft(&full, 1);
    assert_eq!(fft_half.grid(), fft_full.grid());

    let coeffs = random_real_fields(&dist_half, 1, 5);
    let mut full_coeffs = vec![Complex64::default(); dist_full.gvec_count_fft()];
    for (i, slot) in full_coeffs.iter_mut().enumerate() {
        let g = full.gvec(dist_full.idx_gvec(i));
        let (stored, conj) = match half.index_by_gvec(g) {
            Some(ig) => (ig, false),
            None => (half.index_by_gvec([-g[0], -g[1], -g[2]]).unwrap(), true),
        };
        let v = coeffs[fft_position(&dist_half, stored).unwrap()];
        *slot = if conj { v.conj() } else { v };
    }

    fft_half.forward(&coeffs).unwrap();
    fft_full.forward(&full_coeffs).unwrap();
    let (a, b) = (slab_of(&fft_half), slab_of(&fft_full));

    assert!(rms(&a, &b) < 1e-10);
    // A real field.
    assert!(a.iter().all(|z| z.im.abs() < 1e-10));
}

#[test]
fn two_column_packing_matches_real_transforms() {
    let n = 12;
    let mut rng = rng(3);
    let f1: Vec<f64> = random_coeffs(&mut rng, n).iter().map(|z| z.re).collect();
    let f2: Vec<f64> = random_coeffs(&mut rng, n).iter().map(|z| z.im).collect();

    let mut z: Vec<Complex64> = f1.iter().zip(&f2).map(|(&a, &b)| Complex64::new(a, b)).collect();
    FftPlanner::new().plan_fft_forward(n).process(&mut z);

    // One "column" per frequency 0..=n/2, at position k, mirrored at n - k.
    let half = n / 2 + 1;
    let layout = StickLayout {
        size_xy: n,
        size_z: 1,
        num_cols: half,
    };
    let mut col_pos: Vec<i32> = (0..half as i32).collect();
    col_pos.extend((0..half).map(|k| if k == 0 { -1 } else { (n - k) as i32 }));

    let mut sticks = vec![Complex64::default(); 2 * half];
    host::pack_two_columns(layout, &col_pos, &z, &mut sticks);

    let mut planner = RealFftPlanner::<f64>::new();
    let r2c = planner.plan_fft_forward(n);
    for (field, got) in [(&f1, &sticks[..half]), (&f2, &sticks[half..])] {
        let mut input = field.clone();
        let mut spectrum = r2c.make_output_vec();
        r2c.process(&mut input, &mut spectrum).unwrap();
        for (a, b) in got.iter().zip(&spectrum) {
            assert!((a - b).norm() < 1e-12, "{a} vs {b}");
        }
    }

    // And back: the unpacked spectrum is the transform of f1 + i·f2 again.
    let mut slab = vec![Complex64::default(); n];
    host::unpack_two_columns(layout, &col_pos, &sticks, &mut slab);
    assert!(rms(&slab, &z) < 1e-12);
}

#[test]
fn pair_transform_matches_two_single_transforms() {
    init_logging();
    let gvec = gvec_set(3., true);

    run_grid(2, 1, |comms| {
        let dist = Arc::new(GvecDistribution::from_rank_comms(Arc::clone(&gvec), &comms).unwrap());
        let mut fft = Fft3d::new(grid_for(&gvec), comms.fft.clone(), BackendContext::host(), 1).unwrap();
        fft.prepare(Arc::clone(&dist)).unwrap();

        let f1 = random_real_fields(&dist, 1, 21);
        let f2 = random_real_fields(&dist, 1, 22);

        fft.forward(&f1).unwrap();
        let s1 = slab_of(&fft);
        fft.forward(&f2).unwrap();
        let s2 = slab_of(&fft);

        let (mut p1, mut p2) = (f1.clone(), f2.clone());
        fft.transform_pair(Direction::Forward, &mut p1, &mut p2).unwrap();
        let psi = slab_of(&fft);
        let want: Vec<Complex64> = s1.iter().zip(&s2).map(|(a, b)| a + Complex64::i() * b).collect();
        assert!(rms(&psi, &want) < 1e-10);

        let (mut g1, mut g2) = (vec![Complex64::default(); f1.len()], vec![Complex64::default(); f2.len()]);
        fft.transform_pair(Direction::Backward, &mut g1, &mut g2).unwrap();
        assert!(rms(&g1, &f1) < 1e-10);
        assert!(rms(&g2, &f2) < 1e-10);
    });
}

#[test]
fn pair_transform_with_wider_batch() {
    let gvec = gvec_set(2.6, true);
    let (mut fft, dist) = serial_fft(&gvec, 3);
    let f1 = random_real_fields(&dist, 1, 31);
    let f2 = random_real_fields(&dist, 1, 32);

    let (mut a, mut b) = (f1.clone(), f2.clone());
    fft.transform_pair(Direction::Forward, &mut a, &mut b).unwrap();
    fft.transform_pair(Direction::Backward, &mut a, &mut b).unwrap();
    assert!(rms(&a, &f1) < 1e-10);
    assert!(rms(&b, &f2) < 1e-10);
}

#[test]
#[should_panic(expected = "reduced")]
fn pair_transform_needs_a_reduced_set() {
    let gvec = gvec_set(2., false);
    let (mut fft, dist) = serial_fft(&gvec, 1);
    let mut f = vec![Complex64::default(); dist.gvec_count_fft()];
    let mut g = f.clone();
    let _ = fft.transform_pair(Direction::Forward, &mut f, &mut g);
}
