//! Distribution of G-vectors over rank grids, and the driver's buffer lifecycle.

mod common;

use std::sync::Arc;

use common::*;
use pw_fft::{
    BackendContext, Communicator, Complex64, Direction, Fft3d, FftConfig, GvecDistribution,
    comm::{register_comm, unregister_comm},
    fft3d::DriverState,
    registry,
};

#[test]
fn load_is_balanced_within_one_column() {
    init_logging();
    for (cutoff, reduce) in [(2.5, false), (4., true), (5., false)] {
        let gvec = gvec_set(cutoff, reduce);
        let max_col = gvec.columns().iter().map(|c| c.len()).max().unwrap();

        for (n_fft, n_ortho) in [(2, 1), (3, 2), (7, 1)] {
            let counts = run_grid(n_fft, n_ortho, |comms| {
                GvecDistribution::from_rank_comms(Arc::clone(&gvec), &comms)
                    .unwrap()
                    .local_gvec_count()
            });
            let (lo, hi) = (counts.iter().min().unwrap(), counts.iter().max().unwrap());
            assert!(hi - lo <= max_col, "{counts:?} with largest column {max_col}");
            assert_eq!(counts.iter().sum::<usize>(), gvec.num_gvec());
        }
    }
}

#[test]
fn every_rank_computes_the_same_layout() {
    let gvec = gvec_set(3.5, true);
    let layouts = run_grid(2, 2, |comms| {
        let dist = GvecDistribution::from_rank_comms(Arc::clone(&gvec), &comms).unwrap();
        let n = dist.num_ranks();
        let offsets: Vec<usize> = (0..n).map(|r| dist.gvec_offset(r)).collect();
        let counts: Vec<usize> = (0..n).map(|r| dist.gvec_count(r)).collect();
        (offsets, counts)
    });
    assert!(layouts.windows(2).all(|w| w[0] == w[1]));

    let (offsets, counts) = &layouts[0];
    for r in 1..offsets.len() {
        assert_eq!(offsets[r], offsets[r - 1] + counts[r - 1]);
    }
}

#[test]
fn gathers_rebuild_fft_and_global_order() {
    let gvec = gvec_set(3., false);
    run_grid(2, 3, |comms| {
        let dist = GvecDistribution::from_rank_comms(Arc::clone(&gvec), &comms).unwrap();
        // Tag every coefficient with its canonical index.
        let tag = |ig: usize| Complex64::new(ig as f64, -(ig as f64));
        let local: Vec<Complex64> = (0..dist.local_gvec_count())
            .map(|i| tag(dist.idx_gvec_local(i)))
            .collect();

        let mut fft_side = vec![Complex64::default(); dist.gvec_count_fft()];
        dist.gather_pw_fft(&local, &mut fft_side).unwrap();
        for (i, v) in fft_side.iter().enumerate() {
            assert_eq!(*v, tag(dist.idx_gvec(i)));
        }

        let mut global = vec![Complex64::default(); gvec.num_gvec()];
        dist.gather_pw_global(&local, &mut global).unwrap();
        for (ig, v) in global.iter().enumerate() {
            assert_eq!(*v, tag(ig));
        }
    });
}

#[test]
fn prepare_and_dismiss_do_not_leak() {
    init_logging();
    let gvec = gvec_set(3., true);
    let other = Arc::new(GvecDistribution::serial(gvec_set(2.5, true)));
    let dist = Arc::new(GvecDistribution::serial(Arc::clone(&gvec)));
    let mut fft = Fft3d::new(grid_for(&gvec), Communicator::solo(), BackendContext::host(), 2).unwrap();
    let idle = fft.allocator().live();

    fft.prepare(Arc::clone(&dist)).unwrap();
    let prepared = fft.allocator().live();
    assert!(prepared > idle);
    fft.prepare(Arc::clone(&dist)).unwrap();
    assert_eq!(fft.allocator().live(), prepared);

    // Rebinding replaces the buffers rather than adding to them.
    fft.prepare(Arc::clone(&other)).unwrap();
    fft.prepare(Arc::clone(&dist)).unwrap();
    assert_eq!(fft.allocator().live(), prepared);

    fft.dismiss();
    let dismissed = fft.allocator().live();
    fft.dismiss();
    assert_eq!(fft.allocator().live(), dismissed);
    assert_eq!(fft.state(), DriverState::Dismissed);

    // Everything still works after a fresh prepare.
    fft.prepare(Arc::clone(&dist)).unwrap();
    assert_eq!(fft.allocator().live(), prepared);
    let orig = random_real_fields(&dist, 2, 4);
    let mut data = orig.clone();
    fft.transform(Direction::Forward, &mut data).unwrap();
    fft.transform(Direction::Backward, &mut data).unwrap();
    assert!(rms(&data, &orig) < 1e-10);

    drop(fft);
}

#[test]
fn registry_drives_a_rank_grid() {
    init_logging();
    let b = [[1., 0., 0.], [0.3, 1.1, 0.], [0.1, -0.2, 0.9]];

    run_grid(2, 2, |comms| {
        let world = register_comm(comms.world.clone());
        let fft_id = register_comm(comms.fft.clone());
        let ortho = register_comm(comms.ortho.clone());

        let g = registry::create_gvec(b[0], b[1], b[2], 3., true).unwrap();
        let d = registry::create_distribution(g, world, fft_id, ortho).unwrap();
        let dims = grid_for(&gvec_set(3., true)).dims();
        let f = registry::create_fft(dims, fft_id, &FftConfig::host(), 1).unwrap();
        registry::fft_prepare(f, d).unwrap();

        let n: usize = (0..4).map(|r| registry::gvec_count(d, r).unwrap()).sum();
        assert_eq!(n, registry::num_gvec(g).unwrap());
        assert_eq!(
            registry::gvec_offset(d, 3).unwrap() + registry::gvec_count(d, 3).unwrap(),
            n
        );

        // A lone G = 0 coefficient of 1 is the constant field 1.
        let dist = GvecDistribution::from_rank_comms(gvec_set(3., true), &comms).unwrap();
        let mut data = vec![Complex64::default(); dist.gvec_count_fft()];
        if let Some(pos) = fft_position(&dist, 0) {
            data[pos] = Complex64::new(1., 0.);
        }
        registry::fft_transform(f, Direction::Forward, &mut data).unwrap();
        let slab = registry::fft_slab(f).unwrap();
        assert!(slab.iter().all(|z| (z - Complex64::new(1., 0.)).norm() < 1e-12));

        registry::fft_dismiss(f).unwrap();
        for h in [f, d, g] {
            registry::delete_object(h).unwrap();
        }
        for id in [world, fft_id, ortho] {
            unregister_comm(id);
        }
    });
}
