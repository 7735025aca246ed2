#![allow(clippy::too_many_arguments)]
#![allow(clippy::needless_range_loop)]

//! Distributed 3D FFTs over a sparse reciprocal-space grid, for plane-wave codes.
//!
//! Only the G-vectors inside a cutoff sphere are stored. They are grouped into z-columns,
//! the columns are balanced across the ranks of a 2D rank grid, and each transform runs
//! as a pencil decomposition: a batched 1D FFT along z on the columns a rank owns, an
//! all-to-all transpose to z-slabs, then a batched 2D FFT over the xy-planes of the slab.
//! For real fields, a centrosymmetric G-vector set stores only half the sphere; the other
//! half is rebuilt by conjugation while loading, and two real fields can share one
//! complex transform.
//!
//! The FFT work runs either on the host with rustfft, or on the GPU with cuFFT and our
//! own packing kernels (the `cuda` feature). The backend is chosen at runtime through
//! `FftConfig`.
//!
//! Typical use, one call sequence per rank:
//! - Build a `GvecSet` from the reciprocal lattice and a cutoff.
//! - Distribute it with `GvecDistribution::new`.
//! - Create an `Fft3d` for an `FftGrid`, `prepare` it with the distribution, then call
//!   `transform` as often as needed.

use std::{
    fmt::Debug,
    ops::{Add, Mul},
};

pub use rustfft::num_complex::Complex;

pub mod backend;
pub mod comm;
pub mod config;
#[cfg(feature = "cuda")]
mod cuda_ffi;
#[cfg(feature = "cuda")]
pub mod cufft;
pub mod error;
pub mod fft;
pub mod fft3d;
#[cfg(feature = "cuda")]
mod gpu_shared;
pub mod grid;
pub mod gvec;
pub mod kernels;
pub mod lattice;
pub mod memory;
pub mod partition;
pub mod registry;
pub mod transpose;

pub use crate::{
    backend::{BackendContext, Direction},
    comm::{Communicator, RankComms},
    config::{BackendKind, FftConfig},
    error::{BackendFailure, CommError, ConfigError, FftError},
    fft3d::Fft3d,
    grid::FftGrid,
    gvec::{GvecSet, Miller},
    lattice::ReciprocalLattice,
    partition::GvecDistribution,
};

pub type Complex64 = Complex<f64>;

pub const TWO_PI: f64 = std::f64::consts::TAU;

/// The scalar types coefficients can be stored as: real or complex doubles. Gathers and
/// the sparse load/unload kernels are generic over this.
pub trait FieldElement:
    Copy + Default + Debug + PartialEq + Send + Sync + Add<Output = Self> + Mul<f64, Output = Self> + 'static
{
    fn conj(self) -> Self;
    fn abs(self) -> f64;
}

impl FieldElement for f64 {
    fn conj(self) -> Self {
        self
    }

    fn abs(self) -> f64 {
        f64::abs(self)
    }
}

impl FieldElement for Complex64 {
    fn conj(self) -> Self {
        Complex::conj(&self)
    }

    fn abs(self) -> f64 {
        self.norm()
    }
}
