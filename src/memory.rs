//! Working buffers tagged with the memory space they live in. Every buffer is created by
//! an `Allocator`, which counts how many of its buffers are alive; that count is how we
//! check that prepare/dismiss cycles neither leak nor double-free.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

#[cfg(feature = "cuda")]
use std::ffi::c_void;

#[cfg(feature = "cuda")]
use cudarc::driver::{CudaSlice, CudaStream, DevicePtr, DeviceRepr, ValidAsZeroBits};

use crate::Complex64;
#[cfg(feature = "cuda")]
use crate::{
    backend_failure,
    config::BackendKind,
    error::{BackendFailure, FailureKind},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemorySpace {
    Host,
    Device,
}

/// Something we can keep in a buffer. On the device, complex values are stored as
/// interleaved (re, im) pairs of `f64`.
pub trait Element: Copy + Default + Send + Sync + 'static {
    #[cfg(feature = "cuda")]
    type Raw: DeviceRepr + ValidAsZeroBits + Copy + Default + Unpin + Send + Sync + 'static;
    /// Number of `Raw` values per element.
    #[cfg(feature = "cuda")]
    const LANES: usize;

    #[cfg(feature = "cuda")]
    fn to_raw(src: &[Self]) -> Vec<Self::Raw>;
    #[cfg(feature = "cuda")]
    fn from_raw(raw: &[Self::Raw], dst: &mut [Self]);
}

impl Element for Complex64 {
    #[cfg(feature = "cuda")]
    type Raw = f64;
    #[cfg(feature = "cuda")]
    const LANES: usize = 2;

    #[cfg(feature = "cuda")]
    fn to_raw(src: &[Self]) -> Vec<f64> {
        let mut result = Vec::with_capacity(src.len() * 2);
        for v in src {
            result.push(v.re);
            result.push(v.im);
        }
        result
    }

    #[cfg(feature = "cuda")]
    fn from_raw(raw: &[f64], dst: &mut [Self]) {
        for (d, pair) in dst.iter_mut().zip(raw.chunks_exact(2)) {
            *d = Complex64::new(pair[0], pair[1]);
        }
    }
}

macro_rules! plain_element {
    ($t:ty) => {
        impl Element for $t {
            #[cfg(feature = "cuda")]
            type Raw = $t;
            #[cfg(feature = "cuda")]
            const LANES: usize = 1;

            #[cfg(feature = "cuda")]
            fn to_raw(src: &[Self]) -> Vec<$t> {
                src.to_vec()
            }

            #[cfg(feature = "cuda")]
            fn from_raw(raw: &[$t], dst: &mut [Self]) {
                dst.copy_from_slice(raw);
            }
        }
    };
}

plain_element!(f64);
plain_element!(i32);

/// Decrements the allocator's live count when the buffer goes away.
#[derive(Debug)]
struct LiveToken(Arc<AtomicUsize>);

impl LiveToken {
    fn new(live: &Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(live))
    }
}

impl Drop for LiveToken {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

enum Store<T: Element> {
    Host(Vec<T>),
    #[cfg(feature = "cuda")]
    Device {
        data: CudaSlice<T::Raw>,
        stream: Arc<CudaStream>,
    },
}

pub struct Buffer<T: Element> {
    store: Store<T>,
    len: usize,
    _token: LiveToken,
}

impl<T: Element> std::fmt::Debug for Buffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("space", &self.space())
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(feature = "cuda")]
fn driver_failure(call: &'static str, kind: FailureKind, e: cudarc::driver::DriverError) -> BackendFailure {
    backend_failure!(BackendKind::Cuda, call, kind, e.0 as i32)
}

impl<T: Element> Buffer<T> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn space(&self) -> MemorySpace {
        match self.store {
            Store::Host(_) => MemorySpace::Host,
            #[cfg(feature = "cuda")]
            Store::Device { .. } => MemorySpace::Device,
        }
    }

    /// Host view; `None` for device buffers.
    pub fn host(&self) -> Option<&[T]> {
        match &self.store {
            Store::Host(v) => Some(v),
            #[cfg(feature = "cuda")]
            Store::Device { .. } => None,
        }
    }

    pub fn host_mut(&mut self) -> Option<&mut [T]> {
        match &mut self.store {
            Store::Host(v) => Some(v),
            #[cfg(feature = "cuda")]
            Store::Device { .. } => None,
        }
    }

    #[cfg(feature = "cuda")]
    pub(crate) fn is_device(&self) -> bool {
        matches!(self.store, Store::Device { .. })
    }

    /// Fill with zeros. Asynchronous on the device.
    pub fn zero(&mut self) -> Result<(), crate::error::BackendFailure> {
        match &mut self.store {
            Store::Host(v) => {
                v.fill(T::default());
                Ok(())
            }
            #[cfg(feature = "cuda")]
            Store::Device { data, stream } => stream
                .memset_zeros(data)
                .map_err(|e| driver_failure("cuMemsetD8Async", FailureKind::ExecFailed, e)),
        }
    }

    /// Overwrite the first `src.len()` elements from host memory.
    pub fn copy_from_host(&mut self, src: &[T]) -> Result<(), crate::error::BackendFailure> {
        assert!(src.len() <= self.len, "source longer than buffer");

        match &mut self.store {
            Store::Host(v) => {
                v[..src.len()].copy_from_slice(src);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            Store::Device { data, stream } => {
                let raw = T::to_raw(src);
                let mut dst = data.slice_mut(0..raw.len());
                stream
                    .memcpy_htod(&raw, &mut dst)
                    .map_err(|e| driver_failure("cuMemcpyHtoDAsync", FailureKind::ExecFailed, e))
            }
        }
    }

    /// Copy the first `dst.len()` elements to host memory. Synchronizes the stream.
    pub fn copy_to_host(&self, dst: &mut [T]) -> Result<(), crate::error::BackendFailure> {
        assert!(dst.len() <= self.len, "destination longer than buffer");

        match &self.store {
            Store::Host(v) => {
                dst.copy_from_slice(&v[..dst.len()]);
                Ok(())
            }
            #[cfg(feature = "cuda")]
            Store::Device { data, stream } => {
                let mut raw = vec![T::Raw::default(); dst.len() * T::LANES];
                let src = data.slice(0..raw.len());
                stream
                    .memcpy_dtoh(&src, &mut raw)
                    .map_err(|e| driver_failure("cuMemcpyDtoHAsync", FailureKind::ExecFailed, e))?;
                stream
                    .synchronize()
                    .map_err(|e| driver_failure("cuStreamSynchronize", FailureKind::ExecFailed, e))?;
                T::from_raw(&raw, dst);
                Ok(())
            }
        }
    }

    pub fn to_vec(&self) -> Result<Vec<T>, crate::error::BackendFailure> {
        let mut out = vec![T::default(); self.len];
        self.copy_to_host(&mut out)?;
        Ok(out)
    }

    /// Stream the device buffer is ordered on.
    #[cfg(feature = "cuda")]
    pub(crate) fn stream(&self) -> Option<&Arc<CudaStream>> {
        match &self.store {
            Store::Device { stream, .. } => Some(stream),
            Store::Host(_) => None,
        }
    }

    /// Raw device address of element `offset`, for kernel launchers.
    #[cfg(feature = "cuda")]
    pub(crate) fn device_ptr(&self, offset: usize) -> *mut c_void {
        match &self.store {
            Store::Device { data, stream } => {
                let (p, _) = data.device_ptr(stream);
                let bytes = offset * T::LANES * size_of::<T::Raw>();
                (p as usize + bytes) as *mut c_void
            }
            Store::Host(v) => v[offset..].as_ptr() as *mut c_void,
        }
    }
}

/// Hands out buffers in one memory space and keeps count of the live ones.
#[derive(Debug, Clone)]
pub struct Allocator {
    space: MemorySpace,
    #[cfg(feature = "cuda")]
    stream: Option<Arc<CudaStream>>,
    live: Arc<AtomicUsize>,
}

impl Allocator {
    pub fn host() -> Self {
        Self {
            space: MemorySpace::Host,
            #[cfg(feature = "cuda")]
            stream: None,
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[cfg(feature = "cuda")]
    pub fn device(stream: Arc<CudaStream>) -> Self {
        Self {
            space: MemorySpace::Device,
            stream: Some(stream),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn space(&self) -> MemorySpace {
        self.space
    }

    /// Number of buffers from this allocator that haven't been dropped.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Zero-filled buffer in this allocator's memory space.
    pub fn alloc<T: Element>(&self, len: usize) -> Result<Buffer<T>, crate::error::BackendFailure> {
        let store = match self.space {
            MemorySpace::Host => Store::Host(vec![T::default(); len]),
            #[cfg(feature = "cuda")]
            MemorySpace::Device => {
                let Some(stream) = &self.stream else {
                    return Err(backend_failure!(
                        BackendKind::Cuda,
                        "cuMemAllocAsync",
                        FailureKind::InvalidValue,
                        0
                    ));
                };
                // Never allocate zero bytes on the device.
                let data = stream
                    .alloc_zeros::<T::Raw>((len * T::LANES).max(1))
                    .map_err(|e| driver_failure("cuMemAllocAsync", FailureKind::AllocFailed, e))?;
                Store::Device {
                    data,
                    stream: Arc::clone(stream),
                }
            }
            #[cfg(not(feature = "cuda"))]
            MemorySpace::Device => unreachable!("device allocator without the cuda feature"),
        };

        Ok(Buffer {
            store,
            len,
            _token: LiveToken::new(&self.live),
        })
    }

    /// Host buffer, counted against this allocator regardless of its space. Used for
    /// index maps and staging areas that must stay host-side.
    pub fn alloc_host<T: Element>(&self, len: usize) -> Buffer<T> {
        Buffer {
            store: Store::Host(vec![T::default(); len]),
            len,
            _token: LiveToken::new(&self.live),
        }
    }

    /// Buffer in this allocator's space holding a copy of `src`.
    pub fn upload<T: Element>(&self, src: &[T]) -> Result<Buffer<T>, crate::error::BackendFailure> {
        let mut buf = self.alloc(src.len())?;
        buf.copy_from_host(src)?;
        Ok(buf)
    }
}
