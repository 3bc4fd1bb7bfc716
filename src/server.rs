//! Shared cache: one pinned OS thread per shard driving its replacement
//! engine against a fixed per-client mailbox array (§4.3).
//!
//! Grounded on `original_source/include/partition_server.hpp`'s
//! `PartitionServer::server_loop`, collapsed to the pure-threading case: the
//! original dispatches each request onto a fiber so a suspended pin yields
//! to the next one; here a suspended [`Context`] is simply parked in
//! `pending` and re-driven on the next loop iteration; one OS thread is
//! "one fiber" (§9). The pre-process pass (step 2 of the original's
//! six-step loop) has no counterpart here and is omitted unconditionally
//! (§9 Open Question #2).

use crate::chpt::Chpt;
use crate::config::CacheConfig;
use crate::error::Result;
use crate::frame_pool::FramePool;
use crate::io_backend::IoBackend;
use crate::mailbox::{MailboxLayout, MailboxPair, Request, RequestKind, Response};
use crate::replacement::Policy;
use crate::shard::{Context, Shard};
use crate::types::{Ppid, EMPTY_PPID};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Pins the calling thread to `cpu`. A no-op (with a logged warning) on
/// platforms where `sched_setaffinity` fails, matching
/// `env.disable_thread_bind` in the original: thread binding is an
/// optimization, not a correctness requirement.
fn pin_current_thread(shard_id: usize, cpu: usize) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        let ret = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if ret != 0 {
            tracing::warn!(shard_id, cpu, "sched_setaffinity failed, continuing unpinned");
        }
    }
}

/// A request still working its way through the replacement engine, parked
/// here while its I/O is in flight (§4.2 suspension points).
struct Pending {
    client: usize,
    slot: usize,
    ctx: Context,
}

/// One shard's mailbox set plus its replacement engine, run to completion
/// on its own thread by [`server_loop`].
struct ShardWorker {
    shard: Shard,
    mailboxes: Vec<Arc<MailboxPair>>,
    req_toggle: Vec<bool>,
    awaiting: Vec<bool>,
    remaining: Vec<usize>,
    resp_batch: Vec<Vec<Response>>,
    pending: Vec<Pending>,
}

impl ShardWorker {
    fn new(shard: Shard, mailboxes: Vec<Arc<MailboxPair>>) -> Self {
        let num_clients = mailboxes.len();
        Self {
            shard,
            mailboxes,
            req_toggle: vec![false; num_clients],
            awaiting: vec![false; num_clients],
            remaining: vec![0; num_clients],
            resp_batch: (0..num_clients).map(|_| Vec::new()).collect(),
            pending: Vec::new(),
        }
    }

    /// Step 3: drain any client mailbox with a fresh batch and dispatch
    /// every request in it to the replacement engine.
    fn process_pass(&mut self) {
        for cid in 0..self.mailboxes.len() {
            if self.awaiting[cid] {
                continue;
            }
            let Some((toggle, reqs)) = self.mailboxes[cid].poll_requests(self.req_toggle[cid]) else {
                continue;
            };
            self.req_toggle[cid] = toggle;
            self.resp_batch[cid] = vec![Response::default(); reqs.len()];
            self.remaining[cid] = reqs.len();
            self.awaiting[cid] = true;

            for (slot, req) in reqs.into_iter().enumerate() {
                self.dispatch(cid, slot, req);
            }
        }
    }

    fn dispatch(&mut self, cid: usize, slot: usize, req: Request) {
        match req.kind {
            RequestKind::Pin => {
                let ctx = self.shard.pin(req.vpid);
                if ctx.is_done() {
                    self.complete(cid, slot, &ctx);
                } else {
                    self.pending.push(Pending { client: cid, slot, ctx });
                }
            }
            RequestKind::Unpin => {
                let ctx = self.shard.unpin(req.vpid, false);
                debug_assert!(ctx.is_done(), "unpin never suspends");
                self.complete(cid, slot, &ctx);
            }
            RequestKind::DirtyUnpin => {
                let ctx = self.shard.unpin(req.vpid, true);
                debug_assert!(ctx.is_done(), "unpin never suspends");
                self.complete(cid, slot, &ctx);
            }
            RequestKind::NotifyDirectPin => {
                self.shard.notify_direct_pin_vpid(req.vpid);
                self.resp_batch[cid][slot] = Response::default();
                self.remaining[cid] -= 1;
            }
            RequestKind::NotifyDirectUnpin => {
                self.shard.notify_direct_unpin_vpid(req.vpid);
                self.resp_batch[cid][slot] = Response::default();
                self.remaining[cid] -= 1;
            }
        }
    }

    fn complete(&mut self, cid: usize, slot: usize, ctx: &Context) {
        let ppid = if ctx.is_out_of_memory() { EMPTY_PPID } else { ctx.ppid };
        self.resp_batch[cid][slot] = Response { ppid };
        self.remaining[cid] -= 1;
    }

    /// Step 4: re-drive every suspended context once.
    fn drain_pending(&mut self) {
        let mut still_pending = Vec::with_capacity(self.pending.len());
        for mut p in self.pending.drain(..) {
            self.shard.process(&mut p.ctx);
            if p.ctx.is_done() {
                let ppid = if p.ctx.is_out_of_memory() { EMPTY_PPID } else { p.ctx.ppid };
                self.resp_batch[p.client][p.slot] = Response { ppid };
                self.remaining[p.client] -= 1;
            } else {
                still_pending.push(p);
            }
        }
        self.pending = still_pending;
    }

    /// Step 5: publish the response batch for any client mailbox whose
    /// requests have all resolved.
    fn publish_complete(&mut self) {
        for cid in 0..self.mailboxes.len() {
            if self.awaiting[cid] && self.remaining[cid] == 0 {
                let items = std::mem::take(&mut self.resp_batch[cid]);
                let request_toggle = self.req_toggle[cid];
                // SAFETY: this shard's owner thread is the sole publisher of
                // every response mailbox it holds.
                unsafe {
                    self.mailboxes[cid].respond(&items, request_toggle, request_toggle);
                }
                self.awaiting[cid] = false;
            }
        }
    }
}

fn server_loop(shard_id: usize, cpu: usize, bind_threads: bool, shard: Shard, mailboxes: Vec<Arc<MailboxPair>>, stop: Arc<AtomicBool>) {
    if bind_threads {
        pin_current_thread(shard_id, cpu);
    }
    let mut worker = ShardWorker::new(shard, mailboxes);
    while !stop.load(Ordering::Relaxed) {
        // Steps 1/2 (inbound prefetch, pre-process pass) are not
        // implemented: there is no portable prefetch primitive worth
        // reaching for here, and the pre-process pass only exists in the
        // original to prime its fiber scheduler (§9).
        worker.process_pass();
        worker.drain_pending();
        worker.publish_complete();
    }
}

/// Owns every shard's worker thread and the mailbox array clients bind to
/// (§4.3, §6). Dropping a `PartitionServer` signals every shard thread to
/// stop and joins them.
pub struct PartitionServer {
    mailboxes: Vec<Vec<Arc<MailboxPair>>>,
    frames: Vec<Arc<FramePool>>,
    /// One shared page table per shard, handed out to
    /// [`crate::client::PartitionClient`]s so they can CAS it directly on
    /// the fast path (§4.1/§4.3) instead of going through this shard's
    /// worker thread.
    chpts: Vec<Arc<Chpt>>,
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl PartitionServer {
    /// Spawns one thread per shard. `policy_for_shard`/`backend_for_shard`
    /// are called once per shard on the calling thread (so they may freely
    /// open per-shard backend files) before handing the constructed `Shard`
    /// off to its worker thread.
    pub fn start(
        config: &CacheConfig,
        layout: MailboxLayout,
        mut policy_for_shard: impl FnMut(usize) -> Policy,
        mut backend_for_shard: impl FnMut(usize) -> Result<Box<dyn IoBackend>>,
    ) -> Result<Self> {
        let num_shards = config.num_shards();
        let num_clients = config.max_num_clients;
        let vpages_per_shard = config.vpages_per_shard();
        let ppages_per_shard = config.ppages_per_shard();
        let bind_threads = !config.env.disable_thread_bind;

        let mailboxes: Vec<Vec<Arc<MailboxPair>>> = (0..num_shards)
            .map(|_| (0..num_clients).map(|_| Arc::new(MailboxPair::new(layout))).collect())
            .collect();

        let stop = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::with_capacity(num_shards);
        let mut frames = Vec::with_capacity(num_shards);
        let mut chpts = Vec::with_capacity(num_shards);

        for shard_id in 0..num_shards {
            let policy = policy_for_shard(shard_id);
            let backend = backend_for_shard(shard_id)?;
            let cpu = config.server_cpus[shard_id];
            let shard_mailboxes = mailboxes[shard_id].clone();
            let stop = Arc::clone(&stop);
            let shard_frames = Arc::new(FramePool::new(ppages_per_shard));
            let shard_chpt = Arc::new(Chpt::new(vpages_per_shard, ppages_per_shard));
            let shard = Shard::new(ppages_per_shard, Arc::clone(&shard_chpt), Arc::clone(&shard_frames), policy, backend);
            frames.push(shard_frames);
            chpts.push(shard_chpt);

            threads.push(
                std::thread::Builder::new()
                    .name(format!("tricache-shard-{shard_id}"))
                    .spawn(move || server_loop(shard_id, cpu, bind_threads, shard, shard_mailboxes, stop))
                    .expect("failed to spawn shard thread"),
            );
        }

        Ok(Self {
            mailboxes,
            frames,
            chpts,
            stop,
            threads,
        })
    }

    /// The mailbox pair for `(shard, client)`. A [`crate::client::PartitionClient`]
    /// clones this to talk to that shard.
    pub fn mailbox(&self, shard: usize, client: usize) -> Arc<MailboxPair> {
        Arc::clone(&self.mailboxes[shard][client])
    }

    /// Raw pointer to the page currently occupying `ppid` in `shard`'s frame
    /// pool. Valid for `PAGE_SIZE` bytes as long as the caller holds a pin
    /// on the vpid that resolved to it.
    pub fn frame_ptr(&self, shard: usize, ppid: Ppid) -> *mut u8 {
        self.frames[shard].frame_ptr(ppid)
    }

    /// This shard's shared page table, for a [`crate::client::PartitionClient`]
    /// to CAS directly on the fast path (§4.1/§4.3).
    pub fn chpt(&self, shard: usize) -> Arc<Chpt> {
        Arc::clone(&self.chpts[shard])
    }

    pub fn num_shards(&self) -> usize {
        self.mailboxes.len()
    }

    pub fn num_clients(&self) -> usize {
        self.mailboxes.first().map_or(0, |m| m.len())
    }
}

impl Drop for PartitionServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
    }
}
