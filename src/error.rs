//! Error taxonomy shared by every backend, the registry and the driver.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The file header is not one this backend (or any backend) understands.
    #[error("format mismatch: {0}")]
    FormatMismatch(String),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("out of memory: failed to allocate {requested} bytes")]
    OutOfMemory { requested: u64 },

    #[error("context overflow: {n_past} evaluated + {requested} requested exceeds context length {n_ctx}")]
    ContextOverflow {
        n_past: usize,
        requested: usize,
        n_ctx: usize,
    },

    #[error("no model loaded")]
    NotLoaded,

    #[error("no logits available: evaluate at least one token first")]
    NotReady,

    #[error("corrupt state snapshot: {0}")]
    CorruptState(String),

    #[error("unsupported model format: {}", .0.display())]
    NoMatch(PathBuf),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Failures a caller can recover from without fixing its own code.
    pub fn is_recoverable(&self) -> bool {
        !self.is_contract_violation()
    }

    /// Calls made before their precondition holds.
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Error::NotLoaded | Error::NotReady)
    }

    pub(crate) fn format(msg: impl Into<String>) -> Self {
        Error::FormatMismatch(msg.into())
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Error::CorruptState(msg.into())
    }
}

impl From<std::collections::TryReserveError> for Error {
    fn from(_: std::collections::TryReserveError) -> Self {
        Error::OutOfMemory { requested: 0 }
    }
}

/// Allocate a zeroed `f32` buffer, surfacing allocation failure instead of aborting.
pub(crate) fn try_alloc_f32(len: usize) -> Result<Vec<f32>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| Error::OutOfMemory {
        requested: (len as u64).saturating_mul(4),
    })?;
    buf.resize(len, 0.0);
    Ok(buf)
}
