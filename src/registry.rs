//! Process-wide handle registry for the procedural API. Objects are created and destroyed
//! explicitly; nothing is cleaned up implicitly. Communicators are passed as ids from
//! `comm::register_comm`.
//!
//! A driver sits behind its own lock, and the registry lock is released before a transform
//! starts: ranks running as threads of one process meet inside the transpose, and must
//! not wait on each other for the table.

use std::{
    collections::HashMap,
    sync::{Arc, LazyLock, Mutex, MutexGuard},
};

use crate::{
    Complex64,
    backend::{BackendContext, Direction},
    comm::map_comm,
    config::FftConfig,
    error::{ConfigError, FftError},
    fft3d::Fft3d,
    grid::FftGrid,
    gvec::GvecSet,
    lattice::ReciprocalLattice,
    partition::GvecDistribution,
};

pub type Handle = i32;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no object with handle {0}")]
    UnknownHandle(Handle),

    #[error("handle {handle} is a {found}, expected a {expected}")]
    WrongKind {
        handle: Handle,
        expected: &'static str,
        found: &'static str,
    },

    #[error("no communicator with id {0} on this rank")]
    UnknownComm(i32),

    #[error("registry lock poisoned by a panicking thread")]
    Poisoned,

    #[error(transparent)]
    Fft(#[from] FftError),
}

impl From<ConfigError> for RegistryError {
    fn from(e: ConfigError) -> Self {
        Self::Fft(e.into())
    }
}

#[derive(Debug, Clone)]
enum Object {
    Gvec(Arc<GvecSet>),
    Distribution(Arc<GvecDistribution>),
    Fft(Arc<Mutex<Fft3d>>),
}

impl Object {
    fn kind(&self) -> &'static str {
        match self {
            Self::Gvec(_) => "G-vector set",
            Self::Distribution(_) => "distribution",
            Self::Fft(_) => "FFT driver",
        }
    }
}

#[derive(Debug, Default)]
struct Registry {
    next: Handle,
    objects: HashMap<Handle, Object>,
}

static REGISTRY: LazyLock<Mutex<Registry>> = LazyLock::new(|| Mutex::new(Registry::default()));

fn table() -> Result<MutexGuard<'static, Registry>, RegistryError> {
    REGISTRY.lock().map_err(|_| RegistryError::Poisoned)
}

fn insert(obj: Object) -> Result<Handle, RegistryError> {
    let mut reg = table()?;
    let h = reg.next;
    reg.next += 1;
    log::debug!("registry: new {} with handle {h}", obj.kind());
    reg.objects.insert(h, obj);
    Ok(h)
}

fn get(h: Handle) -> Result<Object, RegistryError> {
    table()?.objects.get(&h).cloned().ok_or(RegistryError::UnknownHandle(h))
}

fn wrong(h: Handle, expected: &'static str, found: &Object) -> RegistryError {
    RegistryError::WrongKind {
        handle: h,
        expected,
        found: found.kind(),
    }
}

fn get_gvec(h: Handle) -> Result<Arc<GvecSet>, RegistryError> {
    match get(h)? {
        Object::Gvec(g) => Ok(g),
        other => Err(wrong(h, "G-vector set", &other)),
    }
}

fn get_distribution(h: Handle) -> Result<Arc<GvecDistribution>, RegistryError> {
    match get(h)? {
        Object::Distribution(d) => Ok(d),
        other => Err(wrong(h, "distribution", &other)),
    }
}

fn get_fft(h: Handle) -> Result<Arc<Mutex<Fft3d>>, RegistryError> {
    match get(h)? {
        Object::Fft(f) => Ok(f),
        other => Err(wrong(h, "FFT driver", &other)),
    }
}

fn with_fft<R>(h: Handle, f: impl FnOnce(&mut Fft3d) -> Result<R, FftError>) -> Result<R, RegistryError> {
    let fft = get_fft(h)?;
    let mut guard = fft.lock().map_err(|_| RegistryError::Poisoned)?;
    Ok(f(&mut guard)?)
}

/// G-vectors within `cutoff` of the lattice with basis `b1`, `b2`, `b3`.
pub fn create_gvec(b1: [f64; 3], b2: [f64; 3], b3: [f64; 3], cutoff: f64, reduce: bool) -> Result<Handle, RegistryError> {
    let lattice = ReciprocalLattice::from_arrays(b1, b2, b3)?;
    insert(Object::Gvec(Arc::new(GvecSet::new(lattice, cutoff, reduce)?)))
}

/// G+k vectors for the k-point `vk`, in fractional coordinates.
pub fn create_gkvec(
    vk: [f64; 3],
    b1: [f64; 3],
    b2: [f64; 3],
    b3: [f64; 3],
    cutoff: f64,
    reduce: bool,
) -> Result<Handle, RegistryError> {
    let lattice = ReciprocalLattice::from_arrays(b1, b2, b3)?;
    insert(Object::Gvec(Arc::new(GvecSet::with_k_point(vk, lattice, cutoff, reduce)?)))
}

/// Distribute a G-vector set over the rank grid given by three communicator ids.
pub fn create_distribution(gvec: Handle, world_id: i32, fft_id: i32, ortho_id: i32) -> Result<Handle, RegistryError> {
    let gvec = get_gvec(gvec)?;
    let comm = |id| map_comm(id).ok_or(RegistryError::UnknownComm(id));
    let dist = GvecDistribution::new(gvec, comm(world_id)?, comm(fft_id)?, comm(ortho_id)?)?;
    insert(Object::Distribution(Arc::new(dist)))
}

pub fn create_fft(dims: [usize; 3], fft_id: i32, config: &FftConfig, batch: usize) -> Result<Handle, RegistryError> {
    let comm = map_comm(fft_id).ok_or(RegistryError::UnknownComm(fft_id))?;
    let grid = FftGrid::new(dims)?;
    let fft = Fft3d::new(grid, comm, BackendContext::new(config)?, batch)?;
    insert(Object::Fft(Arc::new(Mutex::new(fft))))
}

pub fn fft_prepare(fft: Handle, dist: Handle) -> Result<(), RegistryError> {
    let dist = get_distribution(dist)?;
    with_fft(fft, |f| f.prepare(dist))
}

pub fn fft_transform(fft: Handle, dir: Direction, data: &mut [Complex64]) -> Result<(), RegistryError> {
    with_fft(fft, |f| f.transform(dir, data))
}

pub fn fft_dismiss(fft: Handle) -> Result<(), RegistryError> {
    with_fft(fft, |f| {
        f.dismiss();
        Ok(())
    })
}

/// Copy the real-space slab of a driver out, all batches.
pub fn fft_slab(fft: Handle) -> Result<Vec<Complex64>, RegistryError> {
    with_fft(fft, |f| {
        let mut out = vec![Complex64::default(); f.slab_len()];
        f.slab_to_host(&mut out)?;
        Ok(out)
    })
}

pub fn num_gvec(gvec: Handle) -> Result<usize, RegistryError> {
    Ok(get_gvec(gvec)?.num_gvec())
}

/// G-vectors of a fine-grained rank.
pub fn gvec_count(dist: Handle, rank: usize) -> Result<usize, RegistryError> {
    Ok(get_distribution(dist)?.gvec_count(rank))
}

pub fn gvec_offset(dist: Handle, rank: usize) -> Result<usize, RegistryError> {
    Ok(get_distribution(dist)?.gvec_offset(rank))
}

/// Drop the registry's reference. Objects that hold on to it (a distribution holds its
/// G-vector set, a driver its distribution) keep it alive.
pub fn delete_object(h: Handle) -> Result<(), RegistryError> {
    let obj = table()?.objects.remove(&h).ok_or(RegistryError::UnknownHandle(h))?;
    log::debug!("registry: deleted {} {h}", obj.kind());
    Ok(())
}
