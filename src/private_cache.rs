//! Per-(client, shard) private cache sitting in front of the shared cache
//! (§4.5).
//!
//! Grounded on `original_source/include/private_cache.hpp`'s `PrivateCache`:
//! a second, smaller instance of the same replacement-engine shape as
//! [`crate::shard::Shard`], except its "backend" is not disk I/O but a
//! round trip through the shared cache's [`crate::client::PartitionClient`].
//! A private-cache hit returns a pointer straight into the *shared* cache's
//! frame with no copy — the whole point of the tier is to amortize many
//! local pin/unpin cycles into one shared pin held for as long as the page
//! stays resident locally. On a local miss, `client.pin()`/`client.unpin()`
//! (`PartitionClient`) may themselves resolve inline against the shared
//! cache's page table via its CAS fast path (§4.1/§4.3) instead of a full
//! mailbox round trip — transparent to this tier either way.

use crate::chpt::Chpt;
use crate::client::PartitionClient;
use crate::config::OOM_RETRY_SPINS;
use crate::error::{CacheError, Result};
use crate::replacement::{Policy, ReplacementPolicy};
use crate::server::PartitionServer;
use crate::stats::AccessCounter;
use crate::types::{Ppid, Vpid, EMPTY_PPID, EMPTY_VPID};

/// One client's local cache of a single shard's pages. `num_shards` of
/// these make up one client's full private cache (§4.5).
pub struct PrivateCache {
    shard_id: usize,
    num_shards: u64,
    max_local_ppid: Ppid,
    chpt: Chpt,
    replacement: Policy,
    /// local ppid -> the shared cache `Ppid` currently backing it.
    shared_ppid: Vec<Ppid>,
    /// local ppid -> local vpid occupying it (for flush/eviction bookkeeping).
    occupant: Vec<Vpid>,
    pinned_size: i64,
    cur_id: Ppid,
    recycle_pool: Vec<Ppid>,
    stats: AccessCounter,
}

impl PrivateCache {
    /// `local_num_vpages` is the shard's own vpid space (`vpages_per_shard`,
    /// matching `shared_cache.partitioner.num_blocks(pid)` in the original);
    /// `local_num_ppages` is `num_ppages_per_shard * occupy_ratio /
    /// max_num_clients` (§4.5, §9 OOM_RETRY_SPINS resolution).
    pub fn new(shard_id: usize, num_shards: u64, local_num_vpages: Vpid, local_num_ppages: Ppid) -> Self {
        let local_num_ppages = local_num_ppages.max(1);
        Self {
            shard_id,
            num_shards,
            max_local_ppid: local_num_ppages,
            chpt: Chpt::new(local_num_vpages, local_num_ppages),
            replacement: Policy::new_clock(local_num_ppages as usize),
            shared_ppid: vec![EMPTY_PPID; local_num_ppages as usize],
            occupant: vec![EMPTY_VPID; local_num_ppages as usize],
            pinned_size: 0,
            cur_id: 0,
            recycle_pool: Vec::new(),
            stats: AccessCounter::new(),
        }
    }

    pub fn num_pinned(&self) -> i64 {
        self.pinned_size
    }

    /// This shard's slice of the per-client access/miss counters (§2.1).
    pub fn stats(&self) -> &AccessCounter {
        &self.stats
    }

    fn global_vpid(&self, local_vpid: Vpid) -> Vpid {
        local_vpid * self.num_shards + self.shard_id as Vpid
    }

    fn full(&self) -> bool {
        self.cur_id >= self.max_local_ppid && self.recycle_pool.is_empty()
    }

    fn alloc(&mut self) -> Ppid {
        if let Some(id) = self.recycle_pool.pop() {
            return id;
        }
        let id = self.cur_id;
        self.cur_id += 1;
        id
    }

    fn free(&mut self, ppid: Ppid) {
        self.recycle_pool.push(ppid);
    }

    /// Resolves `local_vpid` to a raw pointer into the shared cache's frame,
    /// pinning it locally (and, on a local miss, remotely via `client`)
    /// first. Bounded-retries past transient shared-cache exhaustion, same
    /// as a local miss retries past local exhaustion (§9 OOM_RETRY_SPINS).
    pub fn pin(&mut self, client: &mut PartitionClient, server: &PartitionServer, local_vpid: Vpid) -> Result<*mut u8> {
        let _access = self.stats.guard_access();
        for _ in 0..OOM_RETRY_SPINS {
            let hint = self.chpt.find_or_create_hint(local_vpid);
            let pte = self.chpt.get_pte(local_vpid, Some(hint));

            if pte.exist {
                let (ok, local_ppid, pre_ref) = self.chpt.pin(local_vpid, Some(hint));
                debug_assert!(ok);
                if pre_ref == 0 {
                    self.replacement.remove(local_ppid);
                    self.pinned_size += 1;
                }
                return Ok(server.frame_ptr(self.shard_id, self.shared_ppid[local_ppid as usize]));
            }
            let _miss = self.stats.guard_miss();

            if self.pinned_size >= self.max_local_ppid as i64 {
                std::thread::yield_now();
                continue;
            }
            self.pinned_size += 1;

            let local_ppid = if self.full() {
                match self.evict_victim(client) {
                    Some(v) => v,
                    None => {
                        self.pinned_size -= 1;
                        std::thread::yield_now();
                        continue;
                    }
                }
            } else {
                self.alloc()
            };

            let installed = self.chpt.create_mapping(local_vpid, local_ppid, 1, Some(hint));
            debug_assert!(installed);

            let shared_ppid = client.pin(self.shard_id, self.global_vpid(local_vpid));
            if shared_ppid == EMPTY_PPID {
                // Shared cache is momentarily full: undo the speculative
                // local install and retry.
                self.chpt.delete_mapping(local_vpid, Some(hint));
                self.chpt.release_mapping_lock(local_vpid, Some(hint));
                self.free(local_ppid);
                self.pinned_size -= 1;
                std::thread::yield_now();
                continue;
            }

            self.shared_ppid[local_ppid as usize] = shared_ppid;
            self.occupant[local_ppid as usize] = local_vpid;
            self.chpt.release_mapping_lock(local_vpid, Some(hint));
            return Ok(server.frame_ptr(self.shard_id, shared_ppid));
        }
        Err(CacheError::OutOfMemory)
    }

    /// Picks a victim local frame, releasing its shared-cache pin through
    /// `client`. Loops past victims that raced back to pinned between
    /// selection and the delete attempt, same as `Shard::begin_install`.
    fn evict_victim(&mut self, client: &mut PartitionClient) -> Option<Ppid> {
        loop {
            let victim = self.replacement.pop()?;
            let victim_vpid = self.occupant[victim as usize];
            let victim_hint = self.chpt.find_hint(victim_vpid).expect("evicted local ppid must have a live bucket");
            let victim_pte = self.chpt.get_pte(victim_vpid, Some(victim_hint));
            if victim_pte.ref_count != 0 || victim_pte.busy || !self.chpt.delete_mapping(victim_vpid, Some(victim_hint)) {
                continue;
            }
            client.unpin(self.shard_id, self.global_vpid(victim_vpid), victim_pte.dirty);
            self.chpt.release_mapping_lock(victim_vpid, Some(victim_hint));
            self.occupant[victim as usize] = EMPTY_VPID;
            return Some(victim);
        }
    }

    pub fn unpin(&mut self, local_vpid: Vpid, is_write: bool) {
        let Some(hint) = self.chpt.find_hint(local_vpid) else { return };
        let pte = self.chpt.get_pte(local_vpid, Some(hint));
        if !pte.exist {
            return;
        }
        let pre_ref = self.chpt.unpin(local_vpid, is_write, Some(hint));
        if pre_ref == 1 {
            self.pinned_size -= 1;
            self.replacement.push(pte.ppid);
        }
    }

    /// Evicts every resident local page back to the shared cache (§4.5:
    /// run when a client handle drops).
    pub fn flush(&mut self, client: &mut PartitionClient) {
        let mut victims = Vec::new();
        for local_ppid in 0..self.max_local_ppid {
            let local_vpid = self.occupant[local_ppid as usize];
            if local_vpid == EMPTY_VPID {
                continue;
            }
            let hint = self.chpt.find_hint(local_vpid).expect("occupied local frame must have a live bucket");
            let pte = self.chpt.get_pte(local_vpid, Some(hint));
            debug_assert_eq!(pte.ref_count, 0, "flush called with a local page still pinned");
            victims.push((local_ppid, local_vpid, hint, pte.dirty));
        }
        while self.replacement.pop().is_some() {}
        for (local_ppid, local_vpid, hint, dirty) in victims {
            client.unpin(self.shard_id, self.global_vpid(local_vpid), dirty);
            self.chpt.delete_mapping(local_vpid, Some(hint));
            self.chpt.release_mapping_lock(local_vpid, Some(hint));
            self.occupant[local_ppid as usize] = EMPTY_VPID;
            self.free(local_ppid);
        }
        self.pinned_size = 0;
    }
}
