//! Async I/O backend abstraction (§4.7) and reference driver (§4.9).
//!
//! Grounded on `original_source/include/io_backend.hpp`'s `DummyIO`/
//! `MemCopy` shape: `submit_read`/`submit_write` return `None` the moment
//! the backend's in-flight queue is full (the caller is expected to spin
//! the replacement engine's `process` loop and retry), and `progress`
//! drains whatever completion mechanism the backend uses. The original's
//! `bool *finish` out-parameter becomes an [`IoHandle`] the caller polls.

use crate::error::{CacheError, Result};
use crate::types::{BlockId, PAGE_SIZE};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;

/// A raw page pointer threaded across a worker-thread boundary. The shard
/// owner guarantees the pointee is valid and exclusively accessible for the
/// lifetime of the I/O (CHPT busy bit held, §4.2 Evicting/Loading phases).
struct SendPtr(*mut u8);
unsafe impl Send for SendPtr {}

/// Handle to one in-flight I/O; poll [`IoHandle::is_done`] from the
/// replacement engine's `process` loop.
#[derive(Clone)]
pub struct IoHandle(Arc<AtomicBool>);

impl IoHandle {
    pub fn is_done(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// The async storage interface the shared-cache server drives (§4.7).
pub trait IoBackend: Send + Sync {
    /// Submit a read of page `block` into `dst` (must be valid for
    /// `PAGE_SIZE` bytes). Returns `None` on backpressure.
    fn submit_read(&self, block: BlockId, dst: *mut u8) -> Option<IoHandle>;
    /// Submit a write of page `block` from `src`. Returns `None` on
    /// backpressure.
    fn submit_write(&self, block: BlockId, src: *const u8) -> Option<IoHandle>;
    /// Drive forward internal completion bookkeeping. Safe to call from any
    /// thread; backends that complete asynchronously on their own worker
    /// threads may make this a no-op.
    fn progress(&self);
    /// An optional backend-owned DMA buffer a caller could read/write
    /// directly instead of the frame pool. None for backends with no such
    /// region (§4.7's "optional DMA pointer").
    fn get_buffer(&self) -> Option<*mut u8> {
        None
    }
}

enum Job {
    Read { block: BlockId, dst: SendPtr, done: Arc<AtomicBool> },
    Write { block: BlockId, src: SendPtr, done: Arc<AtomicBool> },
}

/// Reference `IoBackend`: one regular file per shard, `pread`/`pwrite`
/// issued from a small fixed worker pool so the accept/progress/done-flag
/// protocol is exercised faithfully without a true async I/O stack
/// (`io_uring`/SPDK are out of scope, §1/§4.9).
pub struct FileBackend {
    sender: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
    in_flight: Arc<AtomicUsize>,
    depth: usize,
}

impl FileBackend {
    /// Opens (creating if absent) `path` sized to hold `num_blocks` pages
    /// and spawns `depth` worker threads.
    pub fn open(shard: usize, path: &Path, num_blocks: BlockId, depth: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|source| CacheError::BackendOpen {
                shard,
                path: path.to_path_buf(),
                source,
            })?;
        let needed = num_blocks * PAGE_SIZE as u64;
        file.set_len(needed).map_err(|source| CacheError::BackendOpen {
            shard,
            path: path.to_path_buf(),
            source,
        })?;

        let file = Arc::new(file);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(parking_lot::Mutex::new(receiver));

        let workers = (0..depth.max(1))
            .map(|_| {
                let file = Arc::clone(&file);
                let receiver = Arc::clone(&receiver);
                let in_flight = Arc::clone(&in_flight);
                std::thread::spawn(move || loop {
                    let job = {
                        let rx = receiver.lock();
                        rx.recv()
                    };
                    let job = match job {
                        Ok(job) => job,
                        Err(_) => break,
                    };
                    match job {
                        Job::Read { block, dst, done } => {
                            let offset = block * PAGE_SIZE as u64;
                            let buf = unsafe { std::slice::from_raw_parts_mut(dst.0, PAGE_SIZE) };
                            if let Err(e) = file.read_exact_at(buf, offset) {
                                tracing::error!(shard, block, error = %e, "backend read failed");
                            }
                            done.store(true, Ordering::Release);
                            in_flight.fetch_sub(1, Ordering::AcqRel);
                        }
                        Job::Write { block, src, done } => {
                            let offset = block * PAGE_SIZE as u64;
                            let buf = unsafe { std::slice::from_raw_parts(src.0, PAGE_SIZE) };
                            if let Err(e) = file.write_all_at(buf, offset) {
                                tracing::error!(shard, block, error = %e, "backend write failed");
                            }
                            done.store(true, Ordering::Release);
                            in_flight.fetch_sub(1, Ordering::AcqRel);
                        }
                    }
                })
            })
            .collect();

        Ok(Self {
            sender,
            workers,
            in_flight,
            depth: depth.max(1),
        })
    }

    fn try_submit(&self, job: Job, done: Arc<AtomicBool>) -> Option<IoHandle> {
        if self.in_flight.fetch_add(1, Ordering::AcqRel) >= self.depth {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        self.sender.send(job).expect("backend worker threads outlive the backend");
        Some(IoHandle(done))
    }
}

impl IoBackend for FileBackend {
    fn submit_read(&self, block: BlockId, dst: *mut u8) -> Option<IoHandle> {
        let done = Arc::new(AtomicBool::new(false));
        self.try_submit(
            Job::Read {
                block,
                dst: SendPtr(dst),
                done: Arc::clone(&done),
            },
            done,
        )
    }

    fn submit_write(&self, block: BlockId, src: *const u8) -> Option<IoHandle> {
        let done = Arc::new(AtomicBool::new(false));
        self.try_submit(
            Job::Write {
                block,
                src: SendPtr(src as *mut u8),
                done: Arc::clone(&done),
            },
            done,
        )
    }

    fn progress(&self) {
        // Completions happen on worker threads; nothing to drive here.
    }
}

impl Drop for FileBackend {
    fn drop(&mut self) {
        // Dropping `sender` unblocks every worker's `recv()`.
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// In-memory backend: every page is zero-filled on read and discarded on
/// write, completing synchronously inside `submit_*`. Grounded on the
/// original's `MemCopy`/`DummyIO` pair: useful for tests and for
/// benchmarking the cache independent of storage latency, with no
/// backpressure since nothing is ever actually in flight.
pub struct MemCopyBackend;

impl MemCopyBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MemCopyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl IoBackend for MemCopyBackend {
    fn submit_read(&self, _block: BlockId, dst: *mut u8) -> Option<IoHandle> {
        unsafe { std::ptr::write_bytes(dst, 0, PAGE_SIZE) };
        Some(IoHandle(Arc::new(AtomicBool::new(true))))
    }

    fn submit_write(&self, _block: BlockId, _src: *const u8) -> Option<IoHandle> {
        Some(IoHandle(Arc::new(AtomicBool::new(true))))
    }

    fn progress(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_backend_round_trips_a_page() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shard0.bin");
        let backend = FileBackend::open(0, &path, 4, 2).unwrap();

        let mut src = vec![0xABu8; PAGE_SIZE];
        let handle = backend.submit_write(1, src.as_ptr()).expect("submit_write accepted");
        while !handle.is_done() {
            std::thread::yield_now();
        }

        let mut dst = vec![0u8; PAGE_SIZE];
        let handle = backend.submit_read(1, dst.as_mut_ptr()).expect("submit_read accepted");
        while !handle.is_done() {
            std::thread::yield_now();
        }
        src.fill(0xAB);
        assert_eq!(dst, src);
    }

    #[test]
    fn file_backend_backpressures_past_depth() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shard0.bin");
        // Depth 1, no workers started draining yet: flood submissions.
        let backend = FileBackend::open(0, &path, 8, 1).unwrap();
        let buf = vec![0u8; PAGE_SIZE];
        let mut accepted = 0;
        let mut rejected = 0;
        for i in 0..8 {
            match backend.submit_write(i, buf.as_ptr()) {
                Some(_) => accepted += 1,
                None => rejected += 1,
            }
        }
        assert!(accepted >= 1);
        assert!(accepted + rejected == 8);
    }

    #[test]
    fn memcopy_backend_zero_fills_on_read() {
        let backend = MemCopyBackend::new();
        let mut buf = vec![1u8; PAGE_SIZE];
        let handle = backend.submit_read(0, buf.as_mut_ptr()).unwrap();
        assert!(handle.is_done());
        assert!(buf.iter().all(|&b| b == 0));
    }
}
