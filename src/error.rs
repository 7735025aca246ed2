//! Error types. Configuration problems are caught at construction time, before any
//! collective work starts. Backend problems are always fatal for the transform that hit
//! them; we surface them as a typed `BackendFailure` and let the caller decide whether
//! to propagate or abort.

use crate::config::BackendKind;

/// Detected while building G-vector sets, distributions, grids or drivers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("reciprocal lattice vectors are degenerate (cell volume {volume:e})")]
    InvalidLattice { volume: f64 },

    #[error(
        "communicator shape mismatch: fft ({fft}) x ortho ({ortho}) does not match {total} ranks"
    )]
    InvalidCommunicator { fft: usize, ortho: usize, total: usize },

    #[error("invalid dimensions: {0}")]
    InvalidDimensions(String),

    #[error("cutoff must be positive and finite, got {0}")]
    InvalidCutoff(f64),

    #[error(
        "FFT grid {grid:?} is too small for G-vector index limits {limits:?}; need 2·limit < size"
    )]
    GridTooSmall {
        grid: (usize, usize, usize),
        limits: (i32, i32, i32),
    },

    #[error("centrosymmetric reduction requires k = 0")]
    ReductionWithKPoint,

    #[error("unknown FFT backend '{0}'")]
    UnknownBackend(String),

    #[error("backend {0:?} is not available in this build or on this machine")]
    BackendUnavailable(BackendKind),
}

/// A collective exchange that could not complete consistently.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommError {
    #[error("count mismatch in {op}: rank {src} sends {sent} values to rank {dst}, which expects {expected}")]
    CountMismatch {
        op: &'static str,
        src: usize,
        dst: usize,
        sent: usize,
        expected: usize,
    },

    #[error("buffer length mismatch in {op}: {got} given, {expected} required")]
    BufferLength {
        op: &'static str,
        got: usize,
        expected: usize,
    },

    #[error("rank {src} failed locally during {op} and posted nothing")]
    PeerFailed { op: &'static str, src: usize },

    #[error("a peer rank panicked during {0}")]
    Poisoned(&'static str),
}

/// Status codes we report from either backend. The numeric values of the cuFFT codes
/// are kept in `code` for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    InvalidPlan,
    AllocFailed,
    InvalidValue,
    ExecFailed,
    NoWorkspace,
    BufferMismatch,
    Other,
}

/// A non-success status from the FFT backend or the device runtime, with its call site.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{backend:?} backend call {call} failed with {kind:?} (code {code}) at {file}:{line}")]
pub struct BackendFailure {
    pub backend: BackendKind,
    pub call: &'static str,
    pub kind: FailureKind,
    pub code: i32,
    pub file: &'static str,
    pub line: u32,
}

/// Builds a `BackendFailure` stamped with the caller's file and line.
#[macro_export]
macro_rules! backend_failure {
    ($backend:expr, $call:expr, $kind:expr, $code:expr) => {
        $crate::error::BackendFailure {
            backend: $backend,
            call: $call,
            kind: $kind,
            code: $code,
            file: file!(),
            line: line!(),
        }
    };
}

/// Everything the driver can return.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FftError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Backend(#[from] BackendFailure),

    #[error(transparent)]
    Comm(#[from] CommError),

    #[error("driver is faulted after an earlier backend or exchange failure; re-prepare it")]
    Faulted,
}

/// Log the failure and take the whole process down. Other ranks blocked in the same
/// collective can't be recovered, so this is what a top-level driver normally does with
/// a `Backend` or `Comm` error.
pub fn abort_on(err: &FftError) -> ! {
    match err {
        FftError::Backend(b) => log::error!(
            "fatal backend failure: {} failed at {}:{} (code {})",
            b.call,
            b.file,
            b.line,
            b.code
        ),
        other => log::error!("fatal error: {other}"),
    }
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_failure_records_call_site() {
        let f = backend_failure!(BackendKind::Host, "plan_many", FailureKind::InvalidValue, 4);
        assert_eq!(f.file, file!());
        assert!(f.line > 0);

        let msg = f.to_string();
        assert!(msg.contains("plan_many"));
        assert!(msg.contains("error.rs"));
    }

    #[test]
    fn config_errors_convert_into_fft_error() {
        let e: FftError = ConfigError::InvalidCutoff(-1.).into();
        assert!(matches!(e, FftError::Config(ConfigError::InvalidCutoff(_))));
    }
}
