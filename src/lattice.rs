//! Reciprocal lattice basis. G-vectors are integer combinations of `b1`, `b2`, `b3`.

use lin_alg::f64::Vec3;

use crate::error::ConfigError;

/// Below this |b1 · (b2 × b3)| we treat the basis as degenerate.
const MIN_VOLUME: f64 = 1e-12;

#[derive(Debug, Clone, Copy)]
pub struct ReciprocalLattice {
    pub b1: Vec3,
    pub b2: Vec3,
    pub b3: Vec3,
    /// Volume of the reciprocal cell, always positive.
    volume: f64,
}

impl ReciprocalLattice {
    pub fn new(b1: Vec3, b2: Vec3, b3: Vec3) -> Result<Self, ConfigError> {
        let volume = b1.dot(b2.cross(b3));
        if !volume.is_finite() || volume.abs() < MIN_VOLUME {
            return Err(ConfigError::InvalidLattice { volume });
        }

        Ok(Self {
            b1,
            b2,
            b3,
            volume: volume.abs(),
        })
    }

    /// Build from three basis vectors given as columns, the way the procedural API
    /// passes them.
    pub fn from_arrays(b1: [f64; 3], b2: [f64; 3], b3: [f64; 3]) -> Result<Self, ConfigError> {
        Self::new(
            Vec3::new(b1[0], b1[1], b1[2]),
            Vec3::new(b2[0], b2[1], b2[2]),
            Vec3::new(b3[0], b3[1], b3[2]),
        )
    }

    pub fn identity() -> Self {
        Self {
            b1: Vec3::new(1., 0., 0.),
            b2: Vec3::new(0., 1., 0.),
            b3: Vec3::new(0., 0., 1.),
            volume: 1.,
        }
    }

    pub fn volume(&self) -> f64 {
        self.volume
    }

    /// Cartesian coordinates of h·b1 + k·b2 + l·b3, with fractional indices so this also
    /// serves G+k.
    pub fn to_cartesian(&self, frac: [f64; 3]) -> Vec3 {
        self.b1 * frac[0] + self.b2 * frac[1] + self.b3 * frac[2]
    }

    /// Largest |index| along each axis that a vector of length `cutoff` can reach. The
    /// distance between lattice planes perpendicular to b_i is V / |b_j × b_k|.
    pub fn index_limits(&self, cutoff: f64) -> [i32; 3] {
        let reach = |a: Vec3, b: Vec3| (a.cross(b).magnitude() / self.volume * cutoff).floor() as i32;

        [
            reach(self.b2, self.b3),
            reach(self.b3, self.b1),
            reach(self.b1, self.b2),
        ]
    }
}
