//! Dense FFT grid dimensions and the split of its z-planes over ranks.

use crate::{error::ConfigError, lattice::ReciprocalLattice};

/// Smallest `n' ≥ n` whose only prime factors are 2, 3, 5 and 7; these sizes run fast in
/// both rustfft and cuFFT.
pub fn next_fft_size(mut n: usize) -> usize {
    fn good(mut x: usize) -> bool {
        for p in [2, 3, 5, 7] {
            while x.is_multiple_of(p) {
                x /= p;
            }
        }
        x == 1
    }
    if n < 1 {
        n = 1;
    }
    while !good(n) {
        n += 1;
    }
    n
}

/// Global extents of the dense grid. x is the fastest axis in slab layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FftGrid {
    dims: [usize; 3],
}

impl FftGrid {
    pub fn new(dims: [usize; 3]) -> Result<Self, ConfigError> {
        if dims.contains(&0) {
            return Err(ConfigError::InvalidDimensions(format!(
                "FFT grid dimensions must be positive, got {dims:?}"
            )));
        }
        Ok(Self { dims })
    }

    /// Smallest fast grid holding every G-vector within `cutoff` together with its
    /// inverse: 2·n_max + 1 points per axis, rounded up to a 2·3·5·7-smooth size.
    pub fn for_cutoff(lattice: &ReciprocalLattice, cutoff: f64) -> Result<Self, ConfigError> {
        if !cutoff.is_finite() || cutoff <= 0. {
            return Err(ConfigError::InvalidCutoff(cutoff));
        }
        let lim = lattice.index_limits(cutoff);
        let dims = lim.map(|n| next_fft_size(2 * n as usize + 1));

        log::debug!("FFT grid for cutoff {cutoff}: index limits {lim:?}, dims {dims:?}");
        Self::new(dims)
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    pub fn size(&self, axis: usize) -> usize {
        self.dims[axis]
    }

    pub fn size_xy(&self) -> usize {
        self.dims[0] * self.dims[1]
    }

    pub fn num_points(&self) -> usize {
        self.dims.iter().product()
    }

    /// A G-vector set fits if no index and its negative land on the same grid point.
    pub fn check_fits(&self, limits: [i32; 3]) -> Result<(), ConfigError> {
        let fits = (0..3).all(|i| 2 * (limits[i].unsigned_abs() as usize) < self.dims[i]);
        if !fits {
            return Err(ConfigError::GridTooSmall {
                grid: (self.dims[0], self.dims[1], self.dims[2]),
                limits: (limits[0], limits[1], limits[2]),
            });
        }
        Ok(())
    }

    /// Grid coordinate of a signed index along an axis.
    pub fn wrap(&self, axis: usize, i: i32) -> usize {
        i.rem_euclid(self.dims[axis] as i32) as usize
    }

    /// Position of column (x, y) within an xy-plane.
    pub fn xy_pos(&self, x: i32, y: i32) -> usize {
        self.wrap(0, x) + self.dims[0] * self.wrap(1, y)
    }
}

/// Contiguous split of the z-planes over the ranks of the FFT communicator. The first
/// `size_z % n` ranks get one extra plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZSplit {
    sizes: Vec<usize>,
    offsets: Vec<usize>,
}

impl ZSplit {
    pub fn new(size_z: usize, n_ranks: usize) -> Self {
        let (base, extra) = (size_z / n_ranks, size_z % n_ranks);
        let sizes: Vec<usize> = (0..n_ranks)
            .map(|r| base + usize::from(r < extra))
            .collect();
        let mut offsets = Vec::with_capacity(n_ranks);
        let mut acc = 0;
        for &s in &sizes {
            offsets.push(acc);
            acc += s;
        }
        Self { sizes, offsets }
    }

    pub fn size(&self, rank: usize) -> usize {
        self.sizes[rank]
    }

    pub fn offset(&self, rank: usize) -> usize {
        self.offsets[rank]
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn num_ranks(&self) -> usize {
        self.sizes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fft_sizes_are_smooth() {
        assert_eq!(next_fft_size(11), 12);
        assert_eq!(next_fft_size(13), 14);
        assert_eq!(next_fft_size(17), 18);
        assert_eq!(next_fft_size(22), 24);
        assert_eq!(next_fft_size(121), 125);
        assert_eq!(next_fft_size(1), 1);
    }

    #[test]
    fn grid_for_cutoff_holds_the_sphere() {
        let lat = ReciprocalLattice::identity();
        let grid = FftGrid::for_cutoff(&lat, 10.).unwrap();
        // n_max = 10 → 21 points → 21 = 3 · 7
        assert_eq!(grid.dims(), [21, 21, 21]);
        assert!(grid.check_fits(lat.index_limits(10.)).is_ok());
    }

    #[test]
    fn too_small_grid_is_rejected() {
        let grid = FftGrid::new([8, 8, 8]).unwrap();
        assert!(grid.check_fits([3, 3, 3]).is_ok());
        assert!(matches!(
            grid.check_fits([4, 1, 1]),
            Err(ConfigError::GridTooSmall { .. })
        ));
    }

    #[test]
    fn zero_dimension_is_rejected() {
        assert!(matches!(
            FftGrid::new([4, 0, 4]),
            Err(ConfigError::InvalidDimensions(_))
        ));
    }

    #[test]
    fn negative_indices_wrap() {
        let grid = FftGrid::new([6, 5, 4]).unwrap();
        assert_eq!(grid.wrap(0, -1), 5);
        assert_eq!(grid.wrap(2, -4), 0);
        assert_eq!(grid.xy_pos(-1, -1), 5 + 6 * 4);
    }

    #[test]
    fn z_split_covers_all_planes() {
        for (nz, n) in [(10, 3), (4, 4), (3, 5), (27, 1)] {
            let split = ZSplit::new(nz, n);
            assert_eq!(split.sizes().iter().sum::<usize>(), nz);
            for r in 1..n {
                assert_eq!(split.offset(r), split.offset(r - 1) + split.size(r - 1));
            }
        }
        assert_eq!(ZSplit::new(10, 3).sizes(), &[4, 3, 3]);
    }
}
