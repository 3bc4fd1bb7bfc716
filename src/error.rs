//! Crate-wide error type.
//!
//! One `thiserror`-derived enum covering the two error classes named in the
//! design: parameter errors detected at the API boundary (always fatal to
//! the caller) and the internal condition that is retried transparently
//! and, on retry exhaustion, surfaced as [`CacheError::OutOfMemory`].

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("vpid {0} is out of range for this cache")]
    InvalidVpid(u64),

    #[error("address {0:#x} is not aligned to the requested access width")]
    Misaligned(u64),

    #[error("access spans a page boundary: offset {offset} + len {len} > page size")]
    CrossPageAccess { offset: usize, len: usize },

    #[error("virt_size ({virt_size}) must be >= phy_size ({phy_size})")]
    VirtSmallerThanPhy { virt_size: u64, phy_size: u64 },

    #[error("no free frame available after bounded retry")]
    OutOfMemory,

    #[error("server cannot support more clients")]
    TooManyClients,

    #[error("backend I/O error on shard {shard}: {source}")]
    BackendIo {
        shard: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open backend for shard {shard} at {path:?}: {source}")]
    BackendOpen {
        shard: usize,
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported backend descriptor: {0}")]
    UnsupportedBackend(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;
