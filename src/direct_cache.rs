//! Per-client-thread direct cache: a flat, always-resident set of pins in
//! front of the private cache (§4.6).
//!
//! Grounded on `original_source/include/direct_cache.hpp`'s `DirectCache`:
//! a power-of-two-sized array indexed by `vpid & mask`. A slot holding the
//! wrong vpid is unpinned from the tier below and replaced; `access`
//! otherwise never touches the tier below at all. The original is templated
//! per fiber (`MAX_FIBERS_PER_THREAD`); collapsed here to one per client
//! thread since fibers are out of scope (§9).

use crate::error::Result;
use crate::types::{next_power_of_two_capped, Vpid, EMPTY_VPID};

/// Anything `DirectCache` can pin/unpin through — satisfied by
/// [`crate::cache::ClientHandle`], which routes a global vpid to the right
/// per-shard [`crate::private_cache::PrivateCache`].
pub trait PageSource {
    fn pin(&mut self, vpid: Vpid) -> Result<*mut u8>;
    fn unpin(&mut self, vpid: Vpid, dirty: bool);
}

const MAX_NUM_PINNED: u64 = 1 << 30;

/// Wraps a [`PageSource`] with a fixed, power-of-two-sized direct-mapped
/// pin cache.
pub struct DirectCache<S> {
    source: S,
    mask: u64,
    store: Vec<(Vpid, *mut u8)>,
    dirty: Vec<bool>,
}

// SAFETY: `store`'s raw pointers point into frame pools owned elsewhere
// (§4.8) and are only read through `access`'s return value, which the
// caller must treat with the same single-writer-while-pinned discipline as
// any other frame pointer in this crate.
unsafe impl<S: Send> Send for DirectCache<S> {}

impl<S: PageSource> DirectCache<S> {
    /// `actual_num_ppages_per_thread` is the client's total private-cache
    /// capacity across every shard; the direct cache is sized to a quarter
    /// of that, rounded up to a power of two (§4.6, `MAX_FIBERS_PER_THREAD`
    /// collapsed to 1 per §9).
    pub fn new(source: S, actual_num_ppages_per_thread: u64) -> Self {
        let num_pinned = next_power_of_two_capped(actual_num_ppages_per_thread / 4, MAX_NUM_PINNED) as usize;
        Self {
            source,
            mask: num_pinned as u64 - 1,
            store: vec![(EMPTY_VPID, std::ptr::null_mut()); num_pinned],
            dirty: vec![false; num_pinned],
        }
    }

    pub fn num_slots(&self) -> usize {
        self.store.len()
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Resolves `vpid` to a frame pointer, replacing whatever this slot
    /// held if it doesn't already hold `vpid`. The returned pointer is only
    /// guaranteed valid until the next `access` call on this `DirectCache`
    /// (it may evict the very slot backing it).
    pub fn access(&mut self, vpid: Vpid, is_write: bool) -> Result<*mut u8> {
        let slot = (vpid & self.mask) as usize;
        if self.store[slot].0 != vpid {
            if self.store[slot].0 != EMPTY_VPID {
                self.source.unpin(self.store[slot].0, self.dirty[slot]);
            }
            let ptr = self.source.pin(vpid)?;
            self.store[slot] = (vpid, ptr);
            self.dirty[slot] = false;
        }
        self.dirty[slot] |= is_write;
        Ok(self.store[slot].1)
    }

    /// Unpins every resident slot (§4.6: run when a client handle drops).
    pub fn flush(&mut self) {
        for slot in 0..self.store.len() {
            let (vpid, _) = self.store[slot];
            if vpid != EMPTY_VPID {
                self.source.unpin(vpid, self.dirty[slot]);
                self.store[slot] = (EMPTY_VPID, std::ptr::null_mut());
                self.dirty[slot] = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    /// A fake `PageSource` backed by a plain `HashMap<Vpid, Vec<u8>>`,
    /// tracking unpin calls for assertions.
    struct FakeSource {
        pages: Rc<RefCell<HashMap<Vpid, Box<[u8; 8]>>>>,
        unpins: Rc<RefCell<Vec<(Vpid, bool)>>>,
    }

    impl PageSource for FakeSource {
        fn pin(&mut self, vpid: Vpid) -> Result<*mut u8> {
            let mut pages = self.pages.borrow_mut();
            let page = pages.entry(vpid).or_insert_with(|| Box::new([0u8; 8]));
            Ok(page.as_mut_ptr())
        }

        fn unpin(&mut self, vpid: Vpid, dirty: bool) {
            self.unpins.borrow_mut().push((vpid, dirty));
        }
    }

    #[test]
    fn access_hits_without_unpinning() {
        let unpins = Rc::new(RefCell::new(Vec::new()));
        let source = FakeSource {
            pages: Rc::new(RefCell::new(HashMap::new())),
            unpins: Rc::clone(&unpins),
        };
        let mut cache = DirectCache::new(source, 64);
        let a = cache.access(3, false).unwrap();
        let b = cache.access(3, false).unwrap();
        assert_eq!(a, b);
        assert!(unpins.borrow().is_empty());
    }

    #[test]
    fn access_replaces_a_colliding_slot() {
        let unpins = Rc::new(RefCell::new(Vec::new()));
        let source = FakeSource {
            pages: Rc::new(RefCell::new(HashMap::new())),
            unpins: Rc::clone(&unpins),
        };
        let mut cache = DirectCache::new(source, 4); // num_slots rounds up to 1
        assert_eq!(cache.num_slots(), 1);
        cache.access(1, true).unwrap();
        cache.access(2, false).unwrap();
        assert_eq!(unpins.borrow().as_slice(), &[(1, true)]);
    }

    #[test]
    fn flush_unpins_every_resident_slot() {
        let unpins = Rc::new(RefCell::new(Vec::new()));
        let source = FakeSource {
            pages: Rc::new(RefCell::new(HashMap::new())),
            unpins: Rc::clone(&unpins),
        };
        let mut cache = DirectCache::new(source, 64);
        cache.access(5, true).unwrap();
        cache.flush();
        assert_eq!(unpins.borrow().as_slice(), &[(5, true)]);
    }
}
