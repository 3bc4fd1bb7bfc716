//! Public entry points: [`CacheHandle`] owns the shared cache's server
//! threads; each client thread gets its own [`ClientHandle`] (§6).
//!
//! The original ties these together through a process-global `SharedCache`
//! singleton that client objects register against at construction and
//! deregister from at destruction. This crate resolves that as an open
//! design question (§9) in favor of explicit ownership: a `CacheHandle` is
//! a value the caller constructs and holds; `ClientHandle`s borrow its
//! `Arc`s rather than reaching through a global.

use crate::client::PartitionClient;
use crate::config::CacheConfig;
use crate::direct_cache::{DirectCache, PageSource};
use crate::error::{CacheError, Result};
use crate::io_backend::IoBackend;
use crate::mailbox::MailboxLayout;
use crate::private_cache::PrivateCache;
use crate::replacement::Policy;
use crate::server::PartitionServer;
use crate::stats::AccessCounter;
use crate::types::{Ppid, Vpid, PAGE_SIZE};

use parking_lot::Mutex;
use std::sync::Arc;

/// Owns every shard's worker thread (§4.3). Construct one per process (or
/// per isolated cache instance in a test); [`Self::new_client`] hands out
/// the per-thread handles that do the actual pinning.
pub struct CacheHandle {
    config: Arc<CacheConfig>,
    server: Arc<PartitionServer>,
    free_client_ids: Arc<Mutex<Vec<usize>>>,
    /// Shard-level snapshot counters (§2.1): every client's private-cache
    /// counters for a shard land here on flush, so a client that has since
    /// dropped still contributes to what `Self::stats` reports.
    shard_stats: Arc<Vec<AccessCounter>>,
}

impl CacheHandle {
    pub fn new(
        config: CacheConfig,
        layout: MailboxLayout,
        policy_for_shard: impl FnMut(usize) -> Policy,
        backend_for_shard: impl FnMut(usize) -> Result<Box<dyn IoBackend>>,
    ) -> Result<Self> {
        let server = PartitionServer::start(&config, layout, policy_for_shard, backend_for_shard)?;
        let free_client_ids = (0..config.max_num_clients).rev().collect();
        let shard_stats = (0..server.num_shards()).map(|_| AccessCounter::new()).collect();
        Ok(Self {
            config: Arc::new(config),
            server: Arc::new(server),
            free_client_ids: Arc::new(Mutex::new(free_client_ids)),
            shard_stats: Arc::new(shard_stats),
        })
    }

    /// Per-shard access/miss counters (§2.1, §9 "profiling counters"),
    /// aggregated from every client's private cache as of its last flush.
    /// A live client's in-flight counts since its last flush are only
    /// visible through its own [`ClientHandle::stats`].
    pub fn stats(&self) -> &[AccessCounter] {
        self.shard_stats.as_slice()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Claims a client slot and builds its private + direct cache tiers.
    /// Fails with [`CacheError::TooManyClients`] once `max_num_clients`
    /// handles are live at once.
    pub fn new_client(&self) -> Result<ClientHandle> {
        let client_id = self.free_client_ids.lock().pop().ok_or(CacheError::TooManyClients)?;

        let mailboxes = (0..self.server.num_shards()).map(|sid| self.server.mailbox(sid, client_id)).collect();
        let chpts = (0..self.server.num_shards()).map(|sid| self.server.chpt(sid)).collect();
        let client = PartitionClient::new(mailboxes, chpts, self.config.enable_direct_pin, self.config.enable_direct_unpin);

        let num_shards = self.server.num_shards() as u64;
        let local_num_ppages = ((self.config.ppages_per_shard() as f64 * self.config.occupy_ratio)
            / self.config.max_num_clients as f64)
            .floor() as Ppid;
        let private: Vec<PrivateCache> = (0..self.server.num_shards())
            .map(|sid| PrivateCache::new(sid, num_shards, self.config.vpages_per_shard(), local_num_ppages))
            .collect();
        let actual_num_ppages_per_thread = local_num_ppages * num_shards;

        let router = ClientRouter {
            server: Arc::clone(&self.server),
            config: Arc::clone(&self.config),
            client,
            private,
            shard_stats: Arc::clone(&self.shard_stats),
        };

        Ok(ClientHandle {
            client_id,
            free_client_ids: Arc::clone(&self.free_client_ids),
            direct: DirectCache::new(router, actual_num_ppages_per_thread.max(1)),
        })
    }
}

/// Routes a global vpid to its shard's [`PrivateCache`], through this
/// client's own [`PartitionClient`]. The thing a [`DirectCache`] sits in
/// front of.
struct ClientRouter {
    server: Arc<PartitionServer>,
    config: Arc<CacheConfig>,
    client: PartitionClient,
    private: Vec<PrivateCache>,
    shard_stats: Arc<Vec<AccessCounter>>,
}

impl ClientRouter {
    fn flush(&mut self) {
        for (sid, shard_private) in self.private.iter_mut().enumerate() {
            shard_private.flush(&mut self.client);
            shard_private.stats().flush_into(&self.shard_stats[sid]);
        }
    }

    /// Sums every shard's private-cache counters into one snapshot (§2.1),
    /// without resetting them (unlike [`Self::flush`], which drains into
    /// the owning [`CacheHandle`]'s shard-level totals).
    fn stats(&self) -> AccessCounter {
        let snapshot = AccessCounter::new();
        for shard_private in &self.private {
            let local = shard_private.stats();
            snapshot.add(local);
        }
        snapshot
    }

    fn validate(&self, vpid: Vpid) -> Result<()> {
        if vpid >= self.config.num_vpages() {
            return Err(CacheError::InvalidVpid(vpid));
        }
        Ok(())
    }
}

impl PageSource for ClientRouter {
    fn pin(&mut self, vpid: Vpid) -> Result<*mut u8> {
        self.validate(vpid)?;
        let shard = self.config.shard_of(vpid);
        let local_vpid = self.config.block_of(vpid);
        self.private[shard].pin(&mut self.client, &self.server, local_vpid)
    }

    fn unpin(&mut self, vpid: Vpid, dirty: bool) {
        let shard = self.config.shard_of(vpid);
        let local_vpid = self.config.block_of(vpid);
        self.private[shard].unpin(local_vpid, dirty);
    }
}

/// One client thread's view of the cache (§4.5, §4.6, §6): a direct cache
/// in front of a private cache in front of the shared cache. Not `Sync` —
/// like the original's `PartitionClient`, exactly one thread drives this.
pub struct ClientHandle {
    client_id: usize,
    free_client_ids: Arc<Mutex<Vec<usize>>>,
    direct: DirectCache<ClientRouter>,
}

impl ClientHandle {
    pub fn client_id(&self) -> usize {
        self.client_id
    }

    /// Pins `vpid` directly against the private cache, bypassing the
    /// direct-cache tier (for callers managing their own pin lifetime
    /// rather than relying on `access`'s implicit one).
    pub fn pin(&mut self, vpid: Vpid) -> Result<*mut u8> {
        self.direct.source_mut().pin(vpid)
    }

    pub fn unpin(&mut self, vpid: Vpid, is_write: bool) {
        self.direct.source_mut().unpin(vpid, is_write);
    }

    /// Drains this thread's private-cache access/miss counters into a fresh
    /// snapshot (§2.1, §9 "profiling counters"). Cheap and safe to call even
    /// with the `stats` feature off, where every count is always zero.
    pub fn stats(&self) -> crate::stats::AccessCounter {
        self.direct.source().stats()
    }

    /// Resolves `vpid` through the direct cache, pinning it there if it
    /// isn't already resident in this thread's direct-mapped slot (§4.6).
    pub fn access(&mut self, vpid: Vpid, is_write: bool) -> Result<*mut u8> {
        self.direct.access(vpid, is_write)
    }

    fn split_addr(&self, addr: u64, size: usize) -> Result<(Vpid, usize)> {
        let vpid = addr >> crate::types::PAGE_BITS;
        let offset = (addr & (PAGE_SIZE as u64 - 1)) as usize;
        if offset + size > PAGE_SIZE {
            return Err(CacheError::CrossPageAccess { offset, len: size });
        }
        Ok((vpid, offset))
    }

    /// Copies `data.len()` bytes starting at byte address `addr` out of the
    /// cache. `addr..addr+data.len()` must not cross a page boundary.
    pub fn get(&mut self, addr: u64, data: &mut [u8]) -> Result<()> {
        let (vpid, offset) = self.split_addr(addr, data.len())?;
        let ptr = self.access(vpid, false)?;
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.add(offset), data.as_mut_ptr(), data.len());
        }
        Ok(())
    }

    /// Copies `data` into the page at byte address `addr`, marking the
    /// direct-cache slot dirty. See [`Self::get`] for the alignment
    /// constraint.
    pub fn set(&mut self, addr: u64, data: &[u8]) -> Result<()> {
        let (vpid, offset) = self.split_addr(addr, data.len())?;
        let ptr = self.access(vpid, true)?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset), data.len());
        }
        Ok(())
    }

    /// Unpins every direct-cache slot and every private-cache frame back to
    /// the shared cache. Run automatically on drop; exposed for callers
    /// that want a barrier without tearing the handle down.
    pub fn flush(&mut self) {
        self.direct.flush();
        self.direct.source_mut().flush();
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        self.flush();
        self.free_client_ids.lock().push(self.client_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io_backend::MemCopyBackend;

    fn test_cache(num_shards: usize, max_clients: usize) -> CacheHandle {
        let config = CacheConfig::new(
            64 * PAGE_SIZE as u64,
            64 * PAGE_SIZE as u64,
            (0..num_shards).collect(),
            (0..num_shards).map(|i| format!("shard{i}")).collect(),
            max_clients,
        )
        .unwrap();
        CacheHandle::new(config, MailboxLayout::TwoCacheline, |_| Policy::new_clock(64 / num_shards.max(1)), |_| {
            Ok(Box::new(MemCopyBackend::new()) as Box<_>)
        })
        .unwrap()
    }

    #[test]
    fn get_and_set_round_trip_through_every_tier() {
        let cache = test_cache(2, 2);
        let mut client = cache.new_client().unwrap();
        let payload = [1u8, 2, 3, 4];
        client.set(100, &payload).unwrap();
        let mut out = [0u8; 4];
        client.get(100, &mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn cross_page_access_is_rejected() {
        let cache = test_cache(1, 1);
        let mut client = cache.new_client().unwrap();
        let payload = [0u8; PAGE_SIZE];
        let err = client.set(PAGE_SIZE as u64 - 2, &payload);
        assert!(matches!(err, Err(CacheError::CrossPageAccess { .. })));
    }

    #[test]
    fn client_pool_is_bounded() {
        let cache = test_cache(1, 1);
        let _first = cache.new_client().unwrap();
        let err = cache.new_client();
        assert!(matches!(err, Err(CacheError::TooManyClients)));
    }

    #[test]
    fn dropping_a_client_frees_its_slot_for_reuse() {
        let cache = test_cache(1, 1);
        {
            let _client = cache.new_client().unwrap();
        }
        assert!(cache.new_client().is_ok());
    }

    #[test]
    fn pin_unpin_bypasses_the_direct_cache() {
        let cache = test_cache(1, 1);
        let mut client = cache.new_client().unwrap();
        let ptr = client.pin(7).unwrap();
        assert!(!ptr.is_null());
        client.unpin(7, false);
    }

    /// S4: repeated pin/unpin on a vpid that stays locally resident between
    /// calls amortizes to a single private-cache miss, not one per call.
    #[test]
    fn repeated_pin_unpin_on_the_same_vpid_amortizes_to_one_miss() {
        let cache = test_cache(1, 1);
        let mut client = cache.new_client().unwrap();
        for _ in 0..1000 {
            client.pin(0).unwrap();
            client.unpin(0, false);
        }
        #[cfg(feature = "stats")]
        {
            let snapshot = client.stats();
            assert_eq!(snapshot.num_access(), 1000);
            assert_eq!(snapshot.num_miss(), 1);
        }
    }

    #[test]
    fn cache_stats_keeps_a_dropped_clients_counts() {
        let cache = test_cache(1, 1);
        {
            let mut client = cache.new_client().unwrap();
            client.pin(1).unwrap();
            client.unpin(1, false);
        }
        #[cfg(feature = "stats")]
        assert_eq!(cache.stats()[0].num_access(), 1);
    }
}
