//! TriCache: a user-space, multi-tier page cache for addressing virtual
//! byte ranges much larger than DRAM over async block I/O.
//!
//! The crate is organized shard-first, matching the algorithm's own
//! decomposition (§4 of the design): [`chpt`] is the per-shard page table,
//! [`replacement`] the eviction policy, [`shard`] the single-threaded
//! replacement engine that owns both, [`server`] the multi-shard partition
//! server that runs one `shard` per pinned OS thread, and [`client`] the
//! per-thread protocol client that talks to it over [`mailbox`]. The
//! [`private_cache`] and [`direct_cache`] tiers sit in front of a client,
//! and [`cache`] is the public entry point tying all of it together.

pub mod cache;
pub mod chpt;
pub mod client;
pub mod config;
pub mod direct_cache;
pub mod error;
pub mod frame_pool;
pub mod io_backend;
pub mod mailbox;
pub mod private_cache;
pub mod replacement;
pub mod server;
pub mod shard;
pub mod stats;
pub mod types;

pub use cache::{CacheHandle, ClientHandle};
pub use config::CacheConfig;
pub use error::{CacheError, Result};
