//! Single-threaded replacement engine (§4.2).
//!
//! One [`Shard`] owns a [`Chpt`], a [`Policy`], a [`FramePool`] and an
//! [`IoBackend`]; it is only ever driven from one OS thread (the partition
//! server's per-shard worker, §4.3). `pin`/`unpin` build a [`Context`] and
//! run it through [`Shard::process`], a re-entrant state machine that
//! suspends (returns with `phase != End`) whenever an eviction or load is
//! waiting on the backend, and resumes exactly where it left off on the
//! next `process` call — this is what lets the server's main loop interleave
//! many in-flight pins without a thread per page.

use crate::chpt::{BucketHint, Chpt, UnpackedPte};
use crate::frame_pool::FramePool;
use crate::io_backend::{IoBackend, IoHandle};
use crate::replacement::{Policy, ReplacementPolicy};
use crate::types::{Ppid, Vpid, EMPTY_PPID, EMPTY_VPID};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Pin,
    Unpin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Begin,
    Initing,
    Evicting,
    Loading,
    End,
}

/// A pin or unpin in progress. Suspended contexts (`phase != End`) must be
/// re-driven through [`Shard::process`] until they reach `End`; they are
/// cheap enough to park in a queue while waiting on I/O (§5 suspension
/// points).
pub struct Context {
    kind: Kind,
    pub phase: Phase,
    processing: bool,
    dirty: bool,
    is_write: bool,
    pub is_unpin: bool,
    vpid: Vpid,
    pre_vpid: Vpid,
    pub ppid: Ppid,
    hint: Option<BucketHint>,
    pre_hint: Option<BucketHint>,
    pte: UnpackedPte,
    io: Option<IoHandle>,
}

impl Context {
    pub fn is_done(&self) -> bool {
        self.phase == Phase::End
    }

    /// `true` once a pin context reaches `End` without a free frame
    /// (`full_pin`, §4.2's OOM signal).
    pub fn is_out_of_memory(&self) -> bool {
        self.phase == Phase::End && self.kind == Kind::Pin && self.ppid == EMPTY_PPID
    }
}

/// Owns one shard's page table, replacement structure, frame pool and
/// backend. Not `Sync`-safe to call concurrently — the partition server
/// guarantees exactly one thread ever calls into a given `Shard`.
pub struct Shard {
    max_ppid: Ppid,
    chpt: Arc<Chpt>,
    replacement: Policy,
    frames: Arc<FramePool>,
    backend: Box<dyn IoBackend>,
    occupant: Vec<Vpid>,
    pinned_size: i64,
    cur_id: Ppid,
    recycle_pool: Vec<Ppid>,
}

impl Shard {
    /// `frames` is shared with the cache handle that owns this shard's
    /// [`crate::server::PartitionServer`] so clients can resolve a pin's
    /// `Ppid` to a raw pointer without round-tripping through this shard's
    /// owning thread (§4.5/§4.6: the private and direct cache tiers read
    /// and write page bytes directly). `chpt` is shared the same way so a
    /// [`crate::client::PartitionClient`] can CAS the shared page table
    /// directly on the fast path (§4.1/§4.3) instead of going through this
    /// shard's owning thread at all.
    pub fn new(max_ppid: Ppid, chpt: Arc<Chpt>, frames: Arc<FramePool>, policy: Policy, backend: Box<dyn IoBackend>) -> Self {
        debug_assert_eq!(frames.num_pages(), max_ppid);
        Self {
            max_ppid,
            chpt,
            replacement: policy,
            frames,
            backend,
            occupant: vec![EMPTY_VPID; max_ppid as usize],
            pinned_size: 0,
            cur_id: 0,
            recycle_pool: Vec::new(),
        }
    }

    pub fn frame_ptr(&self, ppid: Ppid) -> *mut u8 {
        self.frames.frame_ptr(ppid)
    }

    /// # Safety
    /// Caller must hold a live pin on the vpid occupying `ppid`.
    pub unsafe fn frame_slice(&self, ppid: Ppid) -> &[u8] {
        self.frames.frame_slice(ppid)
    }

    /// # Safety
    /// Caller must hold a live pin on the vpid occupying `ppid`.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn frame_slice_mut(&self, ppid: Ppid) -> &mut [u8] {
        self.frames.frame_slice_mut(ppid)
    }

    pub fn num_pinned(&self) -> i64 {
        self.pinned_size
    }

    /// Reconciles `pinned_size`/replacement membership after a client-side
    /// fast-path pin that bypassed `process` entirely (§4.3's
    /// `NotifyDirectPin`). Idempotent: recomputes from the observed CHPT
    /// state rather than trusting that exactly one transition happened,
    /// since the notify message may arrive after further pin/unpin activity
    /// on the same vpid.
    pub fn notify_direct_pin(&mut self, ppid: Ppid) {
        if self.replacement.remove(ppid) {
            self.pinned_size += 1;
        }
    }

    /// Reconciles state after a client-side fast-path unpin (§4.3's
    /// `NotifyDirectUnpin`). Idempotent for the same reason as
    /// [`Self::notify_direct_pin`].
    pub fn notify_direct_unpin(&mut self, ppid: Ppid) {
        if self.replacement.push(ppid) {
            self.pinned_size -= 1;
        }
    }

    /// Wire-facing form of [`Self::notify_direct_pin`]: the mailbox protocol
    /// carries the vpid, not the resolved frame, so the server re-derives
    /// `ppid` from its own CHPT rather than trusting a value the client
    /// could have sent stale.
    pub fn notify_direct_pin_vpid(&mut self, vpid: Vpid) {
        if let Some(hint) = self.chpt.find_hint(vpid) {
            let pte = self.chpt.get_pte(vpid, Some(hint));
            if pte.exist {
                self.notify_direct_pin(pte.ppid);
            }
        }
    }

    /// Wire-facing form of [`Self::notify_direct_unpin`]; see
    /// [`Self::notify_direct_pin_vpid`].
    pub fn notify_direct_unpin_vpid(&mut self, vpid: Vpid) {
        if let Some(hint) = self.chpt.find_hint(vpid) {
            let pte = self.chpt.get_pte(vpid, Some(hint));
            if pte.exist {
                self.notify_direct_unpin(pte.ppid);
            }
        }
    }

    fn full_pin(&self) -> bool {
        self.pinned_size >= self.max_ppid as i64
    }

    fn full(&self) -> bool {
        self.cur_id >= self.max_ppid && self.recycle_pool.is_empty()
    }

    fn alloc(&mut self) -> Ppid {
        debug_assert!(!self.full());
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

    pub fn pin(&mut self, vpid: Vpid) -> Context {
        let mut ctx = Context {
            kind: Kind::Pin,
            phase: Phase::Begin,
            processing: false,
            dirty: false,
            is_write: false,
            is_unpin: false,
            vpid,
            pre_vpid: EMPTY_VPID,
            ppid: EMPTY_PPID,
            hint: None,
            pre_hint: None,
            pte: UnpackedPte {
                exist: false,
                busy: false,
                dirty: false,
                ref_count: 0,
                ppid: EMPTY_PPID,
            },
            io: None,
        };
        self.process(&mut ctx);
        ctx
    }

    pub fn unpin(&mut self, vpid: Vpid, is_write: bool) -> Context {
        let mut ctx = Context {
            kind: Kind::Unpin,
            phase: Phase::Begin,
            processing: false,
            dirty: false,
            is_write,
            is_unpin: false,
            vpid,
            pre_vpid: EMPTY_VPID,
            ppid: EMPTY_PPID,
            hint: None,
            pre_hint: None,
            pte: UnpackedPte {
                exist: false,
                busy: false,
                dirty: false,
                ref_count: 0,
                ppid: EMPTY_PPID,
            },
            io: None,
        };
        self.process(&mut ctx);
        ctx
    }

    /// Drives a suspended or fresh context forward. Returns once the
    /// context reaches `End`, or suspends (returns early, `phase` left at
    /// `Evicting`/`Loading`) if the backend has no room for another
    /// in-flight request.
    pub fn process(&mut self, ctx: &mut Context) {
        loop {
            match ctx.phase {
                Phase::Begin => {
                    let hint = self.chpt.find_or_create_hint(ctx.vpid);
                    ctx.hint = Some(hint);
                    ctx.pte = self.chpt.get_pte(ctx.vpid, ctx.hint);
                    if ctx.pte.busy {
                        return;
                    }
                    ctx.phase = Phase::Initing;
                }
                Phase::Initing => {
                    if !self.initing(ctx) {
                        return;
                    }
                }
                Phase::Evicting => {
                    if !self.evict_step(ctx) {
                        return;
                    }
                    self.finish_evicting(ctx);
                }
                Phase::Loading => {
                    if !self.load_step(ctx) {
                        return;
                    }
                    self.finish_loading(ctx);
                    return;
                }
                Phase::End => return,
            }
        }
    }

    /// Runs the `Initing` phase. Returns `false` if the context ended here
    /// (pin/unpin resolved without touching the replacement engine).
    fn initing(&mut self, ctx: &mut Context) -> bool {
        match ctx.kind {
            Kind::Unpin => {
                ctx.is_unpin = false;
                if ctx.pte.exist {
                    let pre_ref = self.chpt.unpin(ctx.vpid, ctx.is_write, ctx.hint);
                    if pre_ref == 1 {
                        ctx.is_unpin = true;
                        self.pinned_size -= 1;
                        self.replacement.push(ctx.pte.ppid);
                    }
                }
                ctx.phase = Phase::End;
                false
            }
            Kind::Pin => {
                if ctx.pte.exist {
                    let (ok, ppid, pre_ref) = self.chpt.pin(ctx.vpid, ctx.hint);
                    debug_assert!(ok);
                    if pre_ref == 0 {
                        self.replacement.remove(ctx.pte.ppid);
                        self.pinned_size += 1;
                    }
                    ctx.ppid = ppid;
                    ctx.phase = Phase::End;
                    false
                } else {
                    self.begin_install(ctx)
                }
            }
        }
    }

    fn begin_install(&mut self, ctx: &mut Context) -> bool {
        if self.full_pin() {
            ctx.ppid = EMPTY_PPID;
            ctx.phase = Phase::End;
            return false;
        }
        self.pinned_size += 1;

        if self.full() {
            loop {
                let victim = match self.replacement.pop() {
                    Some(v) => v,
                    None => {
                        // Nothing evictable right now (everything pinned):
                        // caller must retry after some unpin frees a slot.
                        self.pinned_size -= 1;
                        ctx.ppid = EMPTY_PPID;
                        ctx.phase = Phase::End;
                        return false;
                    }
                };
                ctx.ppid = victim;
                let pre_vpid = self.occupant[victim as usize];
                let pre_hint = self
                    .chpt
                    .find_hint(pre_vpid)
                    .expect("evicted ppid's occupant must still have a live bucket");
                let pre_pte = self.chpt.get_pte(pre_vpid, Some(pre_hint));
                if pre_pte.ref_count != 0 || pre_pte.busy || !self.chpt.delete_mapping(pre_vpid, Some(pre_hint)) {
                    continue;
                }
                ctx.pre_vpid = pre_vpid;
                ctx.pre_hint = Some(pre_hint);
                ctx.dirty = pre_pte.dirty;
                break;
            }
            let installed = self.chpt.create_mapping(ctx.vpid, ctx.ppid, 1, ctx.hint);
            debug_assert!(installed);
            ctx.phase = Phase::Evicting;
            ctx.processing = true;
        } else {
            ctx.ppid = self.alloc();
            let installed = self.chpt.create_mapping(ctx.vpid, ctx.ppid, 1, ctx.hint);
            debug_assert!(installed);
            ctx.phase = Phase::Evicting;
            ctx.processing = false;
            ctx.dirty = false;
        }
        true
    }

    /// Returns `true` once the evict side-effect has completed (or there
    /// was none to perform).
    fn evict_step(&self, ctx: &mut Context) -> bool {
        if !ctx.processing {
            return true;
        }
        if !ctx.dirty {
            ctx.processing = false;
            return true;
        }
        if let Some(handle) = &ctx.io {
            if handle.is_done() {
                ctx.io = None;
                ctx.processing = false;
                return true;
            }
            self.backend.progress();
            return false;
        }
        match self.backend.submit_write(ctx.pre_vpid, self.frames.frame_ptr(ctx.ppid)) {
            Some(handle) => {
                ctx.io = Some(handle);
                false
            }
            None => {
                self.backend.progress();
                false
            }
        }
    }

    fn finish_evicting(&mut self, ctx: &mut Context) {
        if ctx.pre_hint.is_some() {
            self.chpt.release_mapping_lock(ctx.pre_vpid, ctx.pre_hint);
            self.free(ctx.ppid);
            self.occupant[ctx.ppid as usize] = EMPTY_VPID;
        }
        self.occupant[ctx.ppid as usize] = ctx.vpid;
        ctx.phase = Phase::Loading;
        ctx.processing = true;
    }

    fn load_step(&self, ctx: &mut Context) -> bool {
        if !ctx.processing {
            return true;
        }
        if let Some(handle) = &ctx.io {
            if handle.is_done() {
                ctx.io = None;
                ctx.processing = false;
                return true;
            }
            self.backend.progress();
            return false;
        }
        if !self.frames.mark_loaded(ctx.ppid) {
            // Never-before-used physical frame: nothing on the backend to
            // read back yet.
            ctx.processing = false;
            return true;
        }
        match self.backend.submit_read(ctx.vpid, self.frames.frame_ptr(ctx.ppid)) {
            Some(handle) => {
                ctx.io = Some(handle);
                false
            }
            None => {
                self.backend.progress();
                false
            }
        }
    }

    fn finish_loading(&mut self, ctx: &mut Context) {
        self.chpt.release_mapping_lock(ctx.vpid, ctx.hint);
        ctx.phase = Phase::End;
        debug_assert_eq!(self.occupant[ctx.ppid as usize], ctx.vpid);
    }

    /// Flushes every resident page to the backend and resets the shard to
    /// empty. Requires every page to already be unpinned (§4.2 `flush` is a
    /// barrier operation the server only issues with no client holding a
    /// pin). Blocks until every write completes.
    pub fn flush(&mut self) {
        let mut victims = Vec::new();
        for ppid in 0..self.max_ppid {
            let vpid = self.occupant[ppid as usize];
            if vpid == EMPTY_VPID {
                continue;
            }
            let hint = self.chpt.find_hint(vpid).expect("occupied frame must have a live bucket");
            let pte = self.chpt.get_pte(vpid, Some(hint));
            debug_assert_eq!(pte.ref_count, 0, "flush called with a page still pinned");
            victims.push((ppid, vpid, hint, pte.dirty));
        }

        while self.replacement.pop().is_some() {}

        let mut handles = Vec::new();
        for (ppid, vpid, _hint, dirty) in &victims {
            if *dirty {
                loop {
                    match self.backend.submit_write(*vpid, self.frames.frame_ptr(*ppid)) {
                        Some(h) => {
                            handles.push(Some(h));
                            break;
                        }
                        None => self.backend.progress(),
                    }
                }
            } else {
                handles.push(None);
            }
        }
        for handle in handles.iter().flatten() {
            while !handle.is_done() {
                self.backend.progress();
            }
        }

        for (ppid, vpid, hint, _) in victims {
            self.chpt.delete_mapping(vpid, Some(hint));
            self.chpt.release_mapping_lock(vpid, Some(hint));
            self.occupant[ppid as usize] = EMPTY_VPID;
            self.free(ppid);
        }
        self.pinned_size = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io_backend::MemCopyBackend;

    fn test_shard(max_vpid: Vpid, max_ppid: Ppid) -> Shard {
        Shard::new(
            max_ppid,
            Arc::new(Chpt::new(max_vpid, max_ppid)),
            Arc::new(FramePool::new(max_ppid)),
            Policy::new_clock(max_ppid as usize),
            Box::new(MemCopyBackend::new()),
        )
    }

    #[test]
    fn pin_miss_installs_a_fresh_frame() {
        let mut shard = test_shard(64, 4);
        let ctx = shard.pin(1);
        assert!(ctx.is_done());
        assert_ne!(ctx.ppid, EMPTY_PPID);
        assert_eq!(shard.num_pinned(), 1);
    }

    #[test]
    fn notify_direct_unpin_then_pin_are_idempotent() {
        // Simulates a client that unpinned/pinned via the CHPT fast path
        // directly (bypassing `process`) and posted the matching notify,
        // possibly more than once.
        let mut shard = test_shard(64, 4);
        let ctx = shard.pin(1);
        let ppid = ctx.ppid;
        assert_eq!(shard.num_pinned(), 1);

        shard.notify_direct_unpin(ppid);
        shard.notify_direct_unpin(ppid); // duplicate: already a candidate
        assert_eq!(shard.num_pinned(), 0);

        shard.notify_direct_pin(ppid);
        shard.notify_direct_pin(ppid); // duplicate: already removed
        assert_eq!(shard.num_pinned(), 1);
    }

    #[test]
    fn notify_direct_vpid_wrappers_resolve_current_ppid() {
        let mut shard = test_shard(64, 4);
        let ctx = shard.pin(1);
        let ppid = ctx.ppid;
        shard.notify_direct_unpin_vpid(1);
        assert_eq!(shard.num_pinned(), 0);
        shard.notify_direct_pin_vpid(1);
        assert_eq!(shard.num_pinned(), 1);
        let _ = ppid;
    }

    #[test]
    fn pin_hit_reuses_the_same_frame() {
        let mut shard = test_shard(64, 4);
        let a = shard.pin(1);
        let ppid = a.ppid;
        shard.unpin(1, false);
        let b = shard.pin(1);
        assert_eq!(b.ppid, ppid);
    }

    #[test]
    fn eviction_round_trips_when_full() {
        let mut shard = test_shard(64, 2);
        shard.unpin(0, false); // no-op, nothing pinned yet
        let a = shard.pin(0);
        assert!(a.is_done());
        shard.unpin(0, false);
        let b = shard.pin(1);
        assert!(b.is_done());
        shard.unpin(1, false);
        // Both frames now unpinned; a third distinct vpid forces an eviction.
        let c = shard.pin(2);
        assert!(c.is_done());
        assert_ne!(c.ppid, EMPTY_PPID);
    }

    #[test]
    fn full_pin_reports_out_of_memory() {
        let mut shard = test_shard(64, 1);
        let _a = shard.pin(0);
        let b = shard.pin(1);
        assert!(b.is_out_of_memory());
    }

    #[test]
    fn flush_drains_all_resident_pages() {
        let mut shard = test_shard(64, 2);
        shard.pin(0);
        shard.unpin(0, true);
        shard.pin(1);
        shard.unpin(1, false);
        shard.flush();
        assert_eq!(shard.num_pinned(), 0);
        let ctx = shard.pin(0);
        assert!(ctx.is_done());
    }
}
