//! Client <-> shard mailbox wire format (§4.4, §6).
//!
//! One [`Mailbox<T>`] is a cacheline-aligned slot carrying up to
//! [`MAX_COMMS`] items of `T` behind a single packed header (`toggle` bit +
//! `num_comm`). Publishing copies the body first, then stores the header
//! last behind a release fence, so any reader that observes the new
//! toggle via an acquire load is guaranteed to also observe the matching
//! body — this mirrors the original's header-last fenced `operator=`.
//!
//! [`MailboxPair`] models the two-cacheline variant (the default, §4.4): one
//! `Mailbox<Request>` and one `Mailbox<Response>` per (client, shard), each
//! side flipping its own toggle independently. The single-cacheline variant
//! collapses this to one shared toggle bit flipped exactly twice per round
//! trip (submit, then complete) — modeled here as the server echoing the
//! complement of the observed request toggle back onto the response
//! mailbox, rather than literally aliasing the two mailboxes' memory: Rust's
//! aliasing rules make that union trick both unsafe and non-idiomatic for
//! no behavioral gain within one process.

use crate::types::{Ppid, Vpid, EMPTY_PPID};
use std::cell::UnsafeCell;
use std::sync::atomic::{fence, AtomicU16, Ordering};

/// `MESSAGE_SIZE / sizeof(request) - 1` for the two-cacheline variant
/// (128-byte slot, 16-byte requests).
pub const MAX_COMMS: usize = 7;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestKind {
    Pin = 1,
    Unpin = 2,
    DirtyUnpin = 3,
    NotifyDirectPin = 4,
    NotifyDirectUnpin = 5,
}

#[derive(Clone, Copy, Debug)]
pub struct Request {
    pub kind: RequestKind,
    pub vpid: Vpid,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            kind: RequestKind::Pin,
            vpid: 0,
        }
    }
}

/// The shard's reply to one request: the resolved frame, or [`EMPTY_PPID`]
/// for a pin that found every frame pinned (the client-visible `OutOfMemory`
/// signal, §4.2).
#[derive(Clone, Copy, Debug)]
pub struct Response {
    pub ppid: Ppid,
}

impl Default for Response {
    fn default() -> Self {
        Self { ppid: EMPTY_PPID }
    }
}

#[inline]
fn pack_header(toggle: bool, num_comm: u8) -> u16 {
    (toggle as u16) | ((num_comm as u16) << 1)
}

#[inline]
fn unpack_header(word: u16) -> (bool, u8) {
    (word & 1 != 0, (word >> 1) as u8)
}

/// One cacheline-aligned mailbox slot, shared between exactly one
/// publisher and one poller.
#[repr(align(64))]
pub struct Mailbox<T> {
    header: AtomicU16,
    body: UnsafeCell<[T; MAX_COMMS]>,
}

// SAFETY: access is gated by the toggle protocol enforced by callers (one
// publisher, one poller); `T: Send` is all that crosses the thread
// boundary.
unsafe impl<T: Send> Send for Mailbox<T> {}
unsafe impl<T: Send> Sync for Mailbox<T> {}

impl<T: Copy + Default> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy + Default> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            header: AtomicU16::new(pack_header(false, 0)),
            body: UnsafeCell::new([T::default(); MAX_COMMS]),
        }
    }

    pub fn toggle(&self) -> bool {
        unpack_header(self.header.load(Ordering::Acquire)).0
    }

    /// Publishes `items` (at most [`MAX_COMMS`]) under `toggle`: body first,
    /// header last behind a release fence.
    ///
    /// # Safety
    /// The caller must be the sole publisher for this mailbox for the
    /// duration of the call (the partition client for a request mailbox,
    /// the shard's owner thread for a response mailbox).
    pub unsafe fn publish(&self, items: &[T], toggle: bool) {
        debug_assert!(items.len() <= MAX_COMMS);
        let body = &mut *self.body.get();
        body[..items.len()].copy_from_slice(items);
        fence(Ordering::Release);
        self.header.store(pack_header(toggle, items.len() as u8), Ordering::Release);
    }

    /// Reads the currently-published `(toggle, items)`. The acquire load of
    /// the header happens-before the body read, matching the publish-side
    /// fence.
    pub fn read(&self) -> (bool, Vec<T>) {
        let (toggle, num_comm) = unpack_header(self.header.load(Ordering::Acquire));
        let body = unsafe { &*self.body.get() };
        (toggle, body[..num_comm as usize].to_vec())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MailboxLayout {
    SingleCacheline,
    TwoCacheline,
}

/// One client's request/response channel into one shard.
pub struct MailboxPair {
    layout: MailboxLayout,
    requests: Mailbox<Request>,
    responses: Mailbox<Response>,
}

impl MailboxPair {
    pub fn new(layout: MailboxLayout) -> Self {
        Self {
            layout,
            requests: Mailbox::new(),
            responses: Mailbox::new(),
        }
    }

    pub fn layout(&self) -> MailboxLayout {
        self.layout
    }

    /// Client-side: publish a batch under `toggle` (the value the client
    /// will next publish, per §4.4's mailbox state).
    ///
    /// # Safety
    /// Only the owning `PartitionClient` for this mailbox may call this.
    pub unsafe fn submit(&self, items: &[Request], toggle: bool) {
        self.requests.publish(items, toggle);
        if self.layout == MailboxLayout::SingleCacheline {
            // Single physical slot: mark it busy under the toggle just
            // written so `poll_response` can detect the return flip,
            // mirroring the one shared toggle bit the original reuses for
            // both directions.
            self.responses.publish(&[], toggle);
        }
    }

    /// Server-side: drains the currently-published request batch if its
    /// toggle differs from `last_seen`, returning the new toggle value and
    /// the batch.
    pub fn poll_requests(&self, last_seen: bool) -> Option<(bool, Vec<Request>)> {
        let (toggle, items) = self.requests.read();
        if toggle == last_seen {
            None
        } else {
            Some((toggle, items))
        }
    }

    /// Server-side: publish the response batch for a request batch observed
    /// with toggle `request_toggle`.
    ///
    /// # Safety
    /// Only the shard's owner thread for this mailbox may call this.
    pub unsafe fn respond(&self, items: &[Response], request_toggle: bool, server_toggle: bool) {
        match self.layout {
            MailboxLayout::TwoCacheline => self.responses.publish(items, server_toggle),
            // One shared toggle bit: completion is the request toggle
            // flipping back to what the client will next submit.
            MailboxLayout::SingleCacheline => self.responses.publish(items, !request_toggle),
        }
    }

    /// Client-side: drains the currently-published response batch if its
    /// toggle differs from `last_seen`, returning the new toggle and the
    /// batch (§4.4: "clients observe completion when toggle returns to
    /// their local value" for the single-cacheline layout, or simply
    /// changes for the two-cacheline layout).
    pub fn poll_response(&self, last_seen: bool) -> Option<(bool, Vec<Response>)> {
        let (toggle, items) = self.responses.read();
        if toggle == last_seen {
            None
        } else {
            Some((toggle, items))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mailbox_round_trips_a_batch() {
        let mailbox: Mailbox<Request> = Mailbox::new();
        let batch = [
            Request {
                kind: RequestKind::Pin,
                vpid: 7,
            },
            Request {
                kind: RequestKind::Unpin,
                vpid: 9,
            },
        ];
        unsafe { mailbox.publish(&batch, true) };
        let (toggle, items) = mailbox.read();
        assert!(toggle);
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].vpid, 9);
    }

    #[test]
    fn two_cacheline_pair_round_trips_independently() {
        let pair = MailboxPair::new(MailboxLayout::TwoCacheline);
        let batch = [Request {
            kind: RequestKind::Pin,
            vpid: 3,
        }];
        unsafe { pair.submit(&batch, true) };

        let (req_toggle, reqs) = pair.poll_requests(false).expect("fresh batch observed");
        assert!(req_toggle);
        assert_eq!(reqs[0].vpid, 3);

        assert!(pair.poll_response(false).is_none());
        unsafe { pair.respond(&[Response { ppid: 42 }], req_toggle, true) };
        let (_, resps) = pair.poll_response(false).expect("response observed");
        assert_eq!(resps[0].ppid, 42);
    }

    #[test]
    fn single_cacheline_pair_completes_when_toggle_returns_home() {
        let pair = MailboxPair::new(MailboxLayout::SingleCacheline);
        let client_next_toggle = false; // the value the client will next publish
        let submit_toggle = !client_next_toggle;
        let batch = [Request {
            kind: RequestKind::Pin,
            vpid: 11,
        }];
        unsafe { pair.submit(&batch, submit_toggle) };

        let (req_toggle, _) = pair.poll_requests(client_next_toggle).expect("fresh batch observed");
        assert_eq!(req_toggle, submit_toggle);

        // Submit already marked the shared slot busy under `submit_toggle`;
        // no completion yet.
        assert!(pair.poll_response(submit_toggle).is_none());

        unsafe { pair.respond(&[Response { ppid: 5 }], req_toggle, false) };
        // Completion is the toggle returning to the client's pre-submit value.
        let (toggle, resps) = pair.poll_response(submit_toggle).expect("completion observed");
        assert_eq!(toggle, client_next_toggle);
        assert_eq!(resps[0].ppid, 5);
    }
}
