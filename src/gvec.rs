//! The set of reciprocal lattice points inside a cutoff sphere, and its grouping into
//! z-columns (all G sharing the same (x, y) index).
//!
//! A set is enumerated once and never changes afterward. Ordering is canonical and
//! independent of how the set is later distributed: G-vectors by length (G = 0 first),
//! then by Miller index; columns by (x, y).

use std::collections::{BTreeMap, HashMap};

use lin_alg::f64::Vec3;

use crate::{error::ConfigError, lattice::ReciprocalLattice};

/// Lengths closer than this are treated as equal when sorting.
const LEN_TOL: f64 = 1e-10;

/// Miller index triple (h, k, l).
pub type Miller = [i32; 3];

fn neg(g: Miller) -> Miller {
    [-g[0], -g[1], -g[2]]
}

/// All G-vectors with the same (x, y), ordered by z.
#[derive(Debug, Clone, PartialEq)]
pub struct ZColumn {
    pub x: i32,
    pub y: i32,
    /// z index of each G-vector in the column.
    pub z: Vec<i32>,
    /// Global index of each G-vector, parallel to `z`.
    pub gvec: Vec<usize>,
    /// Set when the (-x, -y) partner of this column is rebuilt by conjugation instead of
    /// being stored. Never set on the origin column, whose negative half is rebuilt from
    /// its own l >= 0 part.
    pub reduced: bool,
}

impl ZColumn {
    pub fn len(&self) -> usize {
        self.z.len()
    }

    pub fn is_empty(&self) -> bool {
        self.z.is_empty()
    }

    /// The (0, 0) column is its own mirror.
    pub fn is_origin(&self) -> bool {
        self.x == 0 && self.y == 0
    }
}

#[derive(Debug, Clone)]
pub struct GvecSet {
    lattice: ReciprocalLattice,
    cutoff: f64,
    /// Fractional k-point shift; zero for plain G-vectors.
    vk: [f64; 3],
    reduced: bool,
    gvec: Vec<Miller>,
    len: Vec<f64>,
    column_of: Vec<usize>,
    columns: Vec<ZColumn>,
    index: HashMap<Miller, usize>,
    limits: [i32; 3],
}

impl GvecSet {
    /// Enumerate all G with |G| ≤ `cutoff`. With `reduce`, only one of each {G, -G} is
    /// kept: the one that is lexicographically larger in (h, k, l). That rule keeps
    /// whole columns, except the (0, 0) column, which keeps l ≥ 0.
    pub fn new(lattice: ReciprocalLattice, cutoff: f64, reduce: bool) -> Result<Self, ConfigError> {
        Self::build(lattice, cutoff, [0.; 3], reduce)
    }

    /// Enumerate G+k vectors with |G + k| ≤ `cutoff`, for a k-point in fractional
    /// coordinates. The set is never reduced: G+k and -(G+k) aren't both in it.
    pub fn with_k_point(
        vk: [f64; 3],
        lattice: ReciprocalLattice,
        cutoff: f64,
        reduce: bool,
    ) -> Result<Self, ConfigError> {
        if reduce && vk.iter().any(|&v| v != 0.) {
            return Err(ConfigError::ReductionWithKPoint);
        }
        Self::build(lattice, cutoff, vk, reduce)
    }

    fn build(
        lattice: ReciprocalLattice,
        cutoff: f64,
        vk: [f64; 3],
        reduce: bool,
    ) -> Result<Self, ConfigError> {
        if !cutoff.is_finite() || cutoff <= 0. {
            return Err(ConfigError::InvalidCutoff(cutoff));
        }

        let base = lattice.index_limits(cutoff);
        let lim: [i32; 3] = std::array::from_fn(|i| base[i] + vk[i].abs().ceil() as i32);

        let mut found: Vec<(Miller, f64)> = Vec::new();
        for h in -lim[0]..=lim[0] {
            for k in -lim[1]..=lim[1] {
                for l in -lim[2]..=lim[2] {
                    let g = [h, k, l];
                    if reduce && g < neg(g) {
                        continue;
                    }
                    let cart = lattice.to_cartesian([
                        h as f64 + vk[0],
                        k as f64 + vk[1],
                        l as f64 + vk[2],
                    ]);
                    let len = cart.magnitude();
                    if len <= cutoff {
                        found.push((g, len));
                    }
                }
            }
        }

        found.sort_by(|(ga, la), (gb, lb)| {
            let ka = (la / LEN_TOL).round() as i64;
            let kb = (lb / LEN_TOL).round() as i64;
            ka.cmp(&kb).then(ga.cmp(gb))
        });

        let (gvec, len): (Vec<Miller>, Vec<f64>) = found.into_iter().unzip();

        let mut by_xy: BTreeMap<(i32, i32), Vec<usize>> = BTreeMap::new();
        for (ig, g) in gvec.iter().enumerate() {
            by_xy.entry((g[0], g[1])).or_default().push(ig);
        }

        let mut column_of = vec![0; gvec.len()];
        let columns: Vec<ZColumn> = by_xy
            .into_iter()
            .enumerate()
            .map(|(icol, ((x, y), mut members))| {
                members.sort_by_key(|&ig| gvec[ig][2]);
                for &ig in &members {
                    column_of[ig] = icol;
                }
                ZColumn {
                    x,
                    y,
                    z: members.iter().map(|&ig| gvec[ig][2]).collect(),
                    gvec: members,
                    reduced: reduce && (x, y) != (0, 0),
                }
            })
            .collect();

        let index = gvec.iter().enumerate().map(|(i, g)| (*g, i)).collect();

        let mut limits = [0; 3];
        for g in &gvec {
            for i in 0..3 {
                limits[i] = limits[i].max(g[i].abs());
            }
        }

        log::debug!(
            "G-vector set: cutoff {cutoff}, {} vectors in {} columns, reduced: {reduce}, limits {limits:?}",
            gvec.len(),
            columns.len()
        );

        Ok(Self {
            lattice,
            cutoff,
            vk,
            reduced: reduce,
            gvec,
            len,
            column_of,
            columns,
            index,
            limits,
        })
    }

    pub fn num_gvec(&self) -> usize {
        self.gvec.len()
    }

    pub fn gvec(&self, ig: usize) -> Miller {
        self.gvec[ig]
    }

    /// Cartesian G (+k) vector.
    pub fn gvec_cart(&self, ig: usize) -> Vec3 {
        let g = self.gvec[ig];
        self.lattice.to_cartesian([
            g[0] as f64 + self.vk[0],
            g[1] as f64 + self.vk[1],
            g[2] as f64 + self.vk[2],
        ])
    }

    pub fn gvec_len(&self, ig: usize) -> f64 {
        self.len[ig]
    }

    pub fn index_by_gvec(&self, g: Miller) -> Option<usize> {
        self.index.get(&g).copied()
    }

    /// True if `g` lies in the half dropped by the reduction (so it's stored as -g).
    pub fn is_dropped(&self, g: Miller) -> bool {
        self.reduced && g < neg(g)
    }

    pub fn columns(&self) -> &[ZColumn] {
        &self.columns
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn column_of(&self, ig: usize) -> usize {
        self.column_of[ig]
    }

    pub fn reduced(&self) -> bool {
        self.reduced
    }

    pub fn lattice(&self) -> &ReciprocalLattice {
        &self.lattice
    }

    pub fn cutoff(&self) -> f64 {
        self.cutoff
    }

    pub fn vk(&self) -> [f64; 3] {
        self.vk
    }

    /// Largest |h|, |k|, |l| present in the set.
    pub fn limits(&self) -> [i32; 3] {
        self.limits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cubic(cutoff: f64, reduce: bool) -> GvecSet {
        GvecSet::new(ReciprocalLattice::identity(), cutoff, reduce).unwrap()
    }

    #[test]
    fn small_sphere_counts() {
        // 1 + 6 (|G| = 1) + 12 (|G| = √2)
        assert_eq!(cubic(1.5, false).num_gvec(), 19);
        // G = 0, plus one of each ± pair
        assert_eq!(cubic(1.5, true).num_gvec(), 10);
    }

    #[test]
    fn origin_comes_first() {
        let set = cubic(3., false);
        assert_eq!(set.gvec(0), [0, 0, 0]);
        assert_eq!(set.gvec_len(0), 0.);
        for ig in 1..set.num_gvec() {
            assert!(set.gvec_len(ig) + LEN_TOL >= set.gvec_len(ig - 1));
        }
    }

    #[test]
    fn every_vector_in_exactly_one_column() {
        let set = cubic(4.2, false);
        let mut seen = vec![0; set.num_gvec()];
        for (icol, col) in set.columns().iter().enumerate() {
            for (&ig, &z) in col.gvec.iter().zip(&col.z) {
                seen[ig] += 1;
                assert_eq!(set.gvec(ig), [col.x, col.y, z]);
                assert_eq!(set.column_of(ig), icol);
            }
            assert!(col.z.windows(2).all(|w| w[0] < w[1]));
        }
        assert!(seen.iter().all(|&n| n == 1));
    }

    #[test]
    fn reduction_keeps_one_of_each_pair() {
        let full = cubic(3.3, false);
        let half = cubic(3.3, true);

        for ig in 0..full.num_gvec() {
            let g = full.gvec(ig);
            let kept = half.index_by_gvec(g).is_some();
            let mirror_kept = half.index_by_gvec(neg(g)).is_some();
            if g == [0, 0, 0] {
                assert!(kept);
            } else {
                assert!(kept ^ mirror_kept, "{g:?}");
                assert_eq!(half.is_dropped(g), !kept);
            }
        }
    }

    #[test]
    fn reduction_keeps_whole_columns_off_origin() {
        let full = cubic(3.3, false);
        let half = cubic(3.3, true);

        for col in half.columns() {
            let full_col = full
                .columns()
                .iter()
                .find(|c| c.x == col.x && c.y == col.y)
                .unwrap();
            if col.is_origin() {
                assert!(col.z.iter().all(|&z| z >= 0));
                assert_eq!(col.len(), full_col.len() / 2 + 1);
                assert!(!col.reduced);
            } else {
                assert_eq!(col.z, full_col.z);
                assert!(col.reduced);
            }
        }
    }

    #[test]
    fn k_point_shifts_the_sphere() {
        let set = GvecSet::with_k_point([0.5, 0., 0.], ReciprocalLattice::identity(), 1., false)
            .unwrap();
        // With k = (½, 0, 0) the sphere is centred at h = -½.
        for ig in 0..set.num_gvec() {
            assert!(set.gvec_cart(ig).magnitude() <= 1. + 1e-12);
        }
        assert!(set.index_by_gvec([-1, 0, 0]).is_some());
        assert!(set.index_by_gvec([1, 0, 0]).is_none());
    }

    #[test]
    fn reduction_requires_gamma_point() {
        let res = GvecSet::with_k_point([0.1, 0., 0.], ReciprocalLattice::identity(), 2., true);
        assert_eq!(res.unwrap_err(), ConfigError::ReductionWithKPoint);
    }

    #[test]
    fn invalid_cutoff() {
        assert!(GvecSet::new(ReciprocalLattice::identity(), 0., false).is_err());
        assert!(GvecSet::new(ReciprocalLattice::identity(), f64::NAN, false).is_err());
    }
}
