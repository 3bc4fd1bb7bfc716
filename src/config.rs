//! Construction parameters (§6) and environment overrides.

use crate::error::{CacheError, Result};
use crate::types::PAGE_SIZE;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// The bounded retry budget for a pin that finds no free frame.
///
/// The original implementation uses `1 << 20` in the shared cache and
/// `1 << 30` in the private cache; the design notes flag that discrepancy as
/// accidental, so this crate uses one constant everywhere.
pub const OOM_RETRY_SPINS: usize = 1 << 20;

/// Threshold (in spin iterations) after which a client-side wait loop yields
/// the OS thread instead of spinning, matching `HYBRID_SPIN_THRESHOLD`.
pub const HYBRID_SPIN_THRESHOLD: usize = 1 << 10;

/// Backend descriptor for one shard, per §6: either a plain file path or a
/// `addr,nsid,byte_offset` raw-device descriptor. This rewrite's one
/// reference backend (`FileBackend`, §4.9) only understands the file-path
/// form; the raw-device form is accepted and parsed so a future driver can
/// consume it without changing `CacheConfig`.
#[derive(Debug, Clone)]
pub enum BackendPath {
    File(PathBuf),
    RawDevice {
        addr: String,
        nsid: u32,
        byte_offset: u64,
    },
}

impl BackendPath {
    pub fn parse(s: &str) -> Result<Self> {
        if let Some((addr, rest)) = s.split_once(',') {
            let (nsid, byte_offset) = rest
                .split_once(',')
                .ok_or_else(|| CacheError::UnsupportedBackend(s.to_string()))?;
            let nsid: u32 = nsid
                .parse()
                .map_err(|_| CacheError::UnsupportedBackend(s.to_string()))?;
            let byte_offset: u64 = byte_offset
                .parse()
                .map_err(|_| CacheError::UnsupportedBackend(s.to_string()))?;
            Ok(BackendPath::RawDevice {
                addr: addr.to_string(),
                nsid,
                byte_offset,
            })
        } else {
            Ok(BackendPath::File(PathBuf::from(s)))
        }
    }
}

/// Environment overrides read at construction time, mirroring the flags the
/// instrumentation layer (out of scope) consults at process start. The core
/// reads the equivalent settings directly so a library caller gets the same
/// behavior without going through that layer.
/// Recorded on [`CacheConfig`] purely for the external instrumentation
/// layer (§1, out of this crate's scope) to read back; this crate itself
/// only consults it at construction time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvOverrides {
    pub disable_cache: bool,
    pub disable_thread_bind: bool,
    pub disable_parallel_read_write: bool,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        let flag = |name: &str| std::env::var(name).map(|v| v != "0" && !v.is_empty()).unwrap_or(false);
        Self {
            disable_cache: flag("DISABLE_CACHE"),
            disable_thread_bind: flag("CACHE_DISABLE_THREAD_BIND"),
            disable_parallel_read_write: flag("CACHE_DISABLE_PARALLEL_READ_WRITE"),
        }
    }
}

/// Construction parameters for a [`crate::cache::CacheHandle`] (§6).
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Total addressable virtual size, bytes. Must be a multiple of
    /// [`PAGE_SIZE`] and `>= phy_size`.
    pub virt_size: u64,
    /// Total physical (DRAM-backed) capacity, bytes. Must be a multiple of
    /// [`PAGE_SIZE`].
    pub phy_size: u64,
    /// One CPU id per shard; `server_cpus.len()` is `N_shards`.
    pub server_cpus: Vec<usize>,
    /// One backend descriptor per shard.
    pub server_paths: Vec<String>,
    /// Maximum number of concurrently live client handles.
    pub max_num_clients: usize,
    /// Fraction of a shard's physical pages a private sub-cache may hold.
    pub occupy_ratio: f64,
    /// Whether a client's fast-path pin/unpin posts `NotifyDirectPin` /
    /// `NotifyDirectUnpin` messages (§4.3, §8 S4).
    pub enable_direct_pin: bool,
    pub enable_direct_unpin: bool,
    /// Mailbox layout: `true` shares one cacheline for request and
    /// response, `false` (default) keeps them distinct (§4.4).
    pub using_single_cacheline: bool,
    pub env: EnvOverrides,
}

impl CacheConfig {
    pub fn new(
        virt_size: u64,
        phy_size: u64,
        server_cpus: Vec<usize>,
        server_paths: Vec<String>,
        max_num_clients: usize,
    ) -> Result<Self> {
        if virt_size < phy_size {
            return Err(CacheError::VirtSmallerThanPhy { virt_size, phy_size });
        }
        if virt_size as usize % PAGE_SIZE != 0 || phy_size as usize % PAGE_SIZE != 0 {
            return Err(CacheError::UnsupportedBackend(
                "virt_size and phy_size must be page-size multiples".into(),
            ));
        }
        if server_cpus.len() != server_paths.len() {
            return Err(CacheError::UnsupportedBackend(
                "server_cpus and server_paths must have the same length".into(),
            ));
        }
        Ok(Self {
            virt_size,
            phy_size,
            server_cpus,
            server_paths,
            max_num_clients,
            occupy_ratio: 0.5,
            enable_direct_pin: true,
            enable_direct_unpin: true,
            using_single_cacheline: false,
            env: EnvOverrides::from_env(),
        })
    }

    pub fn with_occupy_ratio(mut self, ratio: f64) -> Self {
        self.occupy_ratio = ratio;
        self
    }

    pub fn with_direct_pin(mut self, pin: bool, unpin: bool) -> Self {
        self.enable_direct_pin = pin;
        self.enable_direct_unpin = unpin;
        self
    }

    pub fn with_single_cacheline(mut self, using: bool) -> Self {
        self.using_single_cacheline = using;
        self
    }

    pub fn num_shards(&self) -> usize {
        self.server_cpus.len()
    }

    pub fn num_vpages(&self) -> u64 {
        self.virt_size / PAGE_SIZE as u64
    }

    pub fn num_ppages(&self) -> u64 {
        self.phy_size / PAGE_SIZE as u64
    }

    /// vpid `v` belongs to shard `v mod num_shards`.
    pub fn shard_of(&self, vpid: u64) -> usize {
        (vpid % self.num_shards() as u64) as usize
    }

    /// Within its shard, vpid `v`'s block id is `v / num_shards`.
    pub fn block_of(&self, vpid: u64) -> u64 {
        vpid / self.num_shards() as u64
    }

    /// Physical pages owned by each shard, evenly divided.
    pub fn ppages_per_shard(&self) -> u64 {
        self.num_ppages() / self.num_shards() as u64
    }

    /// Virtual pages owned by each shard.
    pub fn vpages_per_shard(&self) -> u64 {
        (self.num_vpages() + self.num_shards() as u64 - 1) / self.num_shards() as u64
    }
}
