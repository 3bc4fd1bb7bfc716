//! Partition client: one per (client thread, shard) channel into a
//! [`crate::server::PartitionServer`] (§4.4).
//!
//! Grounded on `original_source/include/partition_client.hpp`'s
//! `PartitionClient`: requests accumulate into a local batch and submit
//! either when the batch fills ([`MAX_COMMS`]) or when the caller explicitly
//! waits for a response. CPU-slot/NUMA binding from the original's
//! constructor has no counterpart here — a `PartitionClient` is handed its
//! shard's [`MailboxPair`]s directly by the cache handle that already knows
//! which shard each client was assigned to (§6's explicit-ownership
//! resolution of the original's process-global client pool).
//!
//! [`Self::pin`]/[`Self::unpin`] also carry the fast path (§4.1/§4.3,
//! spec.md §2 step 3): when the shard's shared page table already has
//! `vpid` resident, the pin or unpin completes inline via a CAS on its
//! packed header (see [`crate::chpt::Chpt::pin`]/[`Chpt::unpin`], already
//! documented as callable off the shard's owning thread for exactly this
//! reason) instead of round-tripping the mailbox. Each fast path posts an
//! idempotent `NotifyDirectPin`/`NotifyDirectUnpin` only on the `0 -> 1` /
//! `1 -> 0` refcount edge, so the shard's replacement structure stays
//! consistent without a message on every call.

use crate::chpt::Chpt;
use crate::mailbox::{MailboxPair, Request, RequestKind, Response, MAX_COMMS};
use crate::types::{Ppid, Vpid};

use std::sync::Arc;

/// Per-shard client-side batching state. Mirrors the original's
/// `local_message_pool[sid]` / `toggles[sid]` / `epoches[sid]`.
struct Slot {
    mailbox: Arc<MailboxPair>,
    chpt: Arc<Chpt>,
    batch: Vec<Request>,
    /// The toggle value this client will publish on its *next* submit.
    next_toggle: bool,
    /// Set once a batch has been submitted and not yet drained by
    /// [`PartitionClient::poll`].
    awaiting: bool,
    /// The toggle last observed on the response mailbox, so `poll` can tell
    /// a fresh response from a stale one.
    last_response_toggle: bool,
    /// Number of batches actually published to the mailbox, for tests that
    /// verify the fast path keeps mailbox traffic bounded (§8 S4).
    submits: usize,
}

impl Slot {
    fn new(mailbox: Arc<MailboxPair>, chpt: Arc<Chpt>) -> Self {
        Self {
            mailbox,
            chpt,
            batch: Vec::with_capacity(MAX_COMMS),
            next_toggle: true,
            awaiting: false,
            last_response_toggle: false,
            submits: 0,
        }
    }
}

/// One client thread's view of every shard (§4.4). Not `Sync`: each
/// `PartitionClient` is driven from exactly one thread, like the original.
pub struct PartitionClient {
    slots: Vec<Slot>,
    enable_direct_pin: bool,
    enable_direct_unpin: bool,
}

impl PartitionClient {
    /// `mailboxes[sid]`/`chpts[sid]` are this client's mailbox pair and
    /// shared page table into shard `sid`, typically obtained via
    /// `PartitionServer::mailbox(sid, cid)`/`PartitionServer::chpt(sid)`.
    /// `enable_direct_pin`/`enable_direct_unpin` gate the CAS fast path
    /// (§4.3, `CacheConfig::enable_direct_pin`/`enable_direct_unpin`).
    pub fn new(mailboxes: Vec<Arc<MailboxPair>>, chpts: Vec<Arc<Chpt>>, enable_direct_pin: bool, enable_direct_unpin: bool) -> Self {
        debug_assert_eq!(mailboxes.len(), chpts.len());
        Self {
            slots: mailboxes.into_iter().zip(chpts).map(|(m, c)| Slot::new(m, c)).collect(),
            enable_direct_pin,
            enable_direct_unpin,
        }
    }

    pub fn num_shards(&self) -> usize {
        self.slots.len()
    }

    /// Batches published to shard `sid`'s mailbox so far. Exposed for tests
    /// that check the fast path actually bounds mailbox traffic.
    pub fn submit_count(&self, sid: usize) -> usize {
        self.slots[sid].submits
    }

    /// Appends `req` to shard `sid`'s local batch, auto-submitting if this
    /// fills it to [`MAX_COMMS`]. Returns the index of `req` within its
    /// submitted (or pending) batch, to correlate with [`Self::poll`]'s
    /// returned responses.
    pub fn request(&mut self, sid: usize, req: Request) -> usize {
        let slot = &mut self.slots[sid];
        debug_assert!(!slot.awaiting, "shard {sid} already has an unpolled batch in flight");
        slot.batch.push(req);
        let index = slot.batch.len() - 1;
        if slot.batch.len() == MAX_COMMS {
            self.submit(sid);
        }
        index
    }

    /// Convenience for a single pin/unpin round trip: tries the CAS fast
    /// path first (§4.3) when `enable_direct_pin`, falling back to a full
    /// mailbox round trip on a local miss or a lost race.
    pub fn pin(&mut self, sid: usize, vpid: Vpid) -> Ppid {
        if self.enable_direct_pin {
            if let Some(ppid) = self.try_fast_pin(sid, vpid) {
                return ppid;
            }
        }
        self.request(
            sid,
            Request {
                kind: RequestKind::Pin,
                vpid,
            },
        );
        self.submit(sid);
        self.wait(sid)[0].ppid
    }

    pub fn unpin(&mut self, sid: usize, vpid: Vpid, is_write: bool) {
        if self.enable_direct_unpin && self.try_fast_unpin(sid, vpid, is_write) {
            return;
        }
        self.request(
            sid,
            Request {
                kind: if is_write { RequestKind::DirtyUnpin } else { RequestKind::Unpin },
                vpid,
            },
        );
        self.submit(sid);
        self.wait(sid);
    }

    /// CASes the shard's shared page table directly when `vpid` is already
    /// resident and not mid-transition (§4.1/§4.3). Returns `None` on a
    /// local miss or a lost race, for the caller to fall back to the
    /// mailbox path.
    fn try_fast_pin(&mut self, sid: usize, vpid: Vpid) -> Option<Ppid> {
        let slot = &self.slots[sid];
        let hint = slot.chpt.find_hint(vpid)?;
        let pte = slot.chpt.get_pte(vpid, Some(hint));
        if !pte.exist || pte.busy {
            return None;
        }
        let (ok, ppid, prev_ref_count) = slot.chpt.pin(vpid, Some(hint));
        if !ok {
            return None;
        }
        if prev_ref_count == 0 {
            // 0 -> 1 edge: the shard's replacement structure still thinks
            // this frame is a candidate. Reconcile it before returning.
            self.notify(sid, RequestKind::NotifyDirectPin, vpid);
        }
        Some(ppid)
    }

    /// Mirror of [`Self::try_fast_pin`] for unpin. Returns `false` if `vpid`
    /// has no local hint or was torn down underneath us, for the caller to
    /// fall back to the mailbox path.
    fn try_fast_unpin(&mut self, sid: usize, vpid: Vpid, is_write: bool) -> bool {
        let slot = &self.slots[sid];
        let Some(hint) = slot.chpt.find_hint(vpid) else { return false };
        if !slot.chpt.get_pte(vpid, Some(hint)).exist {
            return false;
        }
        let prev_ref_count = slot.chpt.unpin(vpid, is_write, Some(hint));
        if prev_ref_count == 1 {
            // 1 -> 0 edge: reinsert into the shard's replacement structure.
            self.notify(sid, RequestKind::NotifyDirectUnpin, vpid);
        }
        true
    }

    /// Posts an idempotent `NotifyDirectPin`/`NotifyDirectUnpin` and blocks
    /// for the shard's (empty) acknowledgement. Synchronous, not fire-and-
    /// forget: `request`/`submit` only allow one outstanding batch per
    /// shard, so a background notify would collide with the caller's next
    /// real request on this same slot.
    fn notify(&mut self, sid: usize, kind: RequestKind, vpid: Vpid) {
        self.request(sid, Request { kind, vpid });
        self.submit(sid);
        self.wait(sid);
    }

    /// Flushes shard `sid`'s pending batch to the mailbox, if non-empty.
    /// Mirrors the original's `submit_message`: flips the local toggle,
    /// publishes, and (single-cacheline layout only) the mailbox pair's
    /// `submit` marks the shared slot busy so completion is later
    /// detectable as the toggle returning home.
    pub fn submit(&mut self, sid: usize) {
        let slot = &mut self.slots[sid];
        if slot.batch.is_empty() {
            return;
        }
        debug_assert!(!slot.awaiting, "cannot submit while a prior batch is unpolled");
        let toggle = slot.next_toggle;
        // SAFETY: this client is the sole publisher of its request mailbox.
        unsafe { slot.mailbox.submit(&slot.batch, toggle) };
        slot.awaiting = true;
        slot.batch.clear();
        slot.next_toggle = !toggle;
        slot.submits += 1;
    }

    /// Non-blocking: drains shard `sid`'s response batch if the server has
    /// published one since the last poll. Returns `None` if nothing new.
    pub fn poll(&mut self, sid: usize) -> Option<Vec<Response>> {
        let slot = &mut self.slots[sid];
        if !slot.awaiting {
            return None;
        }
        let (toggle, resps) = slot.mailbox.poll_response(slot.last_response_toggle)?;
        slot.last_response_toggle = toggle;
        slot.awaiting = false;
        Some(resps)
    }

    /// Blocks (spinning, then yielding past [`crate::config::HYBRID_SPIN_THRESHOLD`])
    /// until shard `sid`'s outstanding batch completes.
    pub fn wait(&mut self, sid: usize) -> Vec<Response> {
        let mut spins = 0usize;
        loop {
            if let Some(resps) = self.poll(sid) {
                return resps;
            }
            spins += 1;
            if spins > crate::config::HYBRID_SPIN_THRESHOLD {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }

    /// Submits and waits on every shard with a batch or an outstanding
    /// response, draining the client before e.g. a flush barrier.
    pub fn drain_all(&mut self) {
        for sid in 0..self.slots.len() {
            self.submit(sid);
            if self.slots[sid].awaiting {
                self.wait(sid);
            }
        }
    }
}
