// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 dtn-storage-core contributors
//
// Disk writer pool: K worker threads, each owning exactly one backing file
// and a bounded single-producer/single-consumer command ring. The manager
// dispatches a command for `segment_id` to worker `segment_id % K`, binding
// every segment to one file and one thread for its whole lifetime. Within a
// worker's file, segment `id` lives at local slot `id / K`. An I/O error on
// a worker takes that worker offline; outstanding and future commands
// against it fail fast rather than retrying.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::error::StorageError;
use crate::ring::Ring;
use crate::storage::backing_file::BackingFile;
use crate::storage::segment::{RESERVED_PREFIX_LEN, SegmentPrefix};

const RING_CAPACITY: usize = 256;
const IDLE_POLL: Duration = Duration::from_millis(250);

enum Command {
    Write {
        segment_id: u64,
        prefix: SegmentPrefix,
        payload: Vec<u8>,
        done: Arc<Done<()>>,
    },
    Read {
        segment_id: u64,
        done: Arc<Done<(SegmentPrefix, Vec<u8>)>>,
    },
}

struct Done<T> {
    result: Mutex<Option<std::io::Result<T>>>,
    cond: Condvar,
}

impl<T> Done<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            result: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    fn complete(&self, result: std::io::Result<T>) {
        let mut guard = self.result.lock().unwrap();
        *guard = Some(result);
        self.cond.notify_all();
    }

    fn wait(&self) -> std::io::Result<T> {
        let mut guard = self.result.lock().unwrap();
        while guard.is_none() {
            guard = self.cond.wait(guard).unwrap();
        }
        guard.take().unwrap()
    }
}

/// Idle-wait signal for a worker: the manager notifies it after pushing a
/// command; absent that, the worker polls its ring every [`IDLE_POLL`] so
/// shutdown stays responsive.
struct WaitFlag {
    lock: Mutex<()>,
    cond: Condvar,
    quit: AtomicBool,
}

impl WaitFlag {
    fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
            quit: AtomicBool::new(false),
        }
    }

    fn idle_wait(&self, ring_is_empty: impl Fn() -> bool) {
        let guard = self.lock.lock().unwrap();
        if self.quit.load(Ordering::Relaxed) || !ring_is_empty() {
            return;
        }
        let _ = self.cond.wait_timeout(guard, IDLE_POLL).unwrap();
    }

    fn notify(&self) {
        let _guard = self.lock.lock().unwrap();
        self.cond.notify_one();
    }

    fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        let _guard = self.lock.lock().unwrap();
        self.cond.notify_all();
    }

    fn is_quitting(&self) -> bool {
        self.quit.load(Ordering::Relaxed)
    }
}

struct Worker {
    ring: Arc<Ring<Command, RING_CAPACITY>>,
    wait: Arc<WaitFlag>,
    offline: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

pub struct WriterPool {
    workers: Vec<Worker>,
    segment_size: u32,
}

impl WriterPool {
    pub fn new(paths: &[PathBuf], segment_size: u32, segments_per_disk: u64) -> std::io::Result<Self> {
        let num_disks = paths.len() as u64;
        let file_len = segments_per_disk * segment_size as u64;
        let mut workers = Vec::with_capacity(paths.len());
        for (idx, path) in paths.iter().enumerate() {
            let backing = BackingFile::open(path, file_len)?;
            let ring: Arc<Ring<Command, RING_CAPACITY>> = Arc::new(Ring::new());
            let wait = Arc::new(WaitFlag::new());
            let offline = Arc::new(AtomicBool::new(false));

            let thread_ring = ring.clone();
            let thread_wait = wait.clone();
            let thread_offline = offline.clone();
            let handle = std::thread::Builder::new()
                .name(format!("dtn-disk-writer-{idx}"))
                .spawn(move || {
                    worker_loop(idx, backing, segment_size, num_disks, thread_ring, thread_wait, thread_offline)
                })
                .expect("failed to spawn disk writer thread");

            workers.push(Worker {
                ring,
                wait,
                offline,
                handle: Some(handle),
            });
        }
        Ok(Self { workers, segment_size })
    }

    fn worker_for(&self, segment_id: u64) -> usize {
        (segment_id % self.workers.len() as u64) as usize
    }

    pub fn write(&self, segment_id: u64, prefix: SegmentPrefix, payload: Vec<u8>) -> Result<(), StorageError> {
        let idx = self.worker_for(segment_id);
        let worker = &self.workers[idx];
        if worker.offline.load(Ordering::Acquire) {
            return Err(offline_err(idx));
        }
        let done = Done::new();
        let mut cmd = Command::Write { segment_id, prefix, payload, done: done.clone() };
        let mut backoff = 0u32;
        loop {
            match worker.ring.push(cmd) {
                Ok(()) => break,
                Err(rejected) => {
                    cmd = rejected;
                    crate::spin_lock::adaptive_yield_pub(&mut backoff);
                }
            }
        }
        worker.wait.notify();
        done.wait().map_err(|source| StorageError::Io { worker: idx, source })
    }

    pub fn read(&self, segment_id: u64) -> Result<(SegmentPrefix, Vec<u8>), StorageError> {
        let idx = self.worker_for(segment_id);
        let worker = &self.workers[idx];
        if worker.offline.load(Ordering::Acquire) {
            return Err(offline_err(idx));
        }
        let done = Done::new();
        let mut cmd = Command::Read { segment_id, done: done.clone() };
        let mut backoff = 0u32;
        loop {
            match worker.ring.push(cmd) {
                Ok(()) => break,
                Err(rejected) => {
                    cmd = rejected;
                    crate::spin_lock::adaptive_yield_pub(&mut backoff);
                }
            }
        }
        worker.wait.notify();
        done.wait().map_err(|source| StorageError::Io { worker: idx, source })
    }

    /// Read one segment's full bytes (prefix + payload) directly against a
    /// backing file path, bypassing the command queue. Used only by the
    /// storage manager's restart scan, which runs before any worker thread
    /// is started and walks every segment of every file linearly.
    pub fn scan_read_raw(path: &Path, local_slot: u64, segment_size: u32, file_len: u64) -> std::io::Result<Vec<u8>> {
        let backing = BackingFile::open(path, file_len)?;
        let mut buf = vec![0u8; segment_size as usize];
        backing.read_at(local_slot * segment_size as u64, &mut buf)?;
        Ok(buf)
    }

    pub fn segment_size(&self) -> u32 {
        self.segment_size
    }

    pub fn num_disks(&self) -> usize {
        self.workers.len()
    }

    pub fn is_offline(&self, worker_idx: usize) -> bool {
        self.workers[worker_idx].offline.load(Ordering::Acquire)
    }

    pub fn shutdown(&mut self) {
        for worker in &self.workers {
            worker.wait.quit();
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for WriterPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn offline_err(worker: usize) -> StorageError {
    StorageError::Io {
        worker,
        source: std::io::Error::new(std::io::ErrorKind::Other, "worker offline"),
    }
}

fn worker_loop(
    idx: usize,
    backing: BackingFile,
    segment_size: u32,
    num_disks: u64,
    ring: Arc<Ring<Command, RING_CAPACITY>>,
    wait: Arc<WaitFlag>,
    offline: Arc<AtomicBool>,
) {
    info!(worker = idx, "disk writer thread started");
    loop {
        if wait.is_quitting() && ring.is_empty() {
            break;
        }
        let Some(cmd) = ring.pop() else {
            wait.idle_wait(|| ring.is_empty());
            continue;
        };
        if offline.load(Ordering::Acquire) {
            fail_offline(cmd);
            continue;
        }
        if let Err(e) = handle_command(&backing, segment_size, num_disks, cmd) {
            error!(worker = idx, error = %e, "disk I/O error, marking worker offline");
            offline.store(true, Ordering::Release);
        }
    }
    warn!(worker = idx, "disk writer thread stopped");
}

fn fail_offline(cmd: Command) {
    let err = || std::io::Error::new(std::io::ErrorKind::Other, "worker offline");
    match cmd {
        Command::Write { done, .. } => done.complete(Err(err())),
        Command::Read { done, .. } => done.complete(Err(err())),
    }
}

fn handle_command(
    backing: &BackingFile,
    segment_size: u32,
    num_disks: u64,
    cmd: Command,
) -> std::io::Result<()> {
    match cmd {
        Command::Write { segment_id, prefix, payload, done } => {
            let offset = (segment_id / num_disks) * segment_size as u64;
            let result = (|| -> std::io::Result<()> {
                let mut buf = vec![0u8; segment_size as usize];
                prefix.encode(&mut buf[..RESERVED_PREFIX_LEN]);
                let payload_cap = segment_size as usize - RESERVED_PREFIX_LEN;
                let n = payload.len().min(payload_cap);
                buf[RESERVED_PREFIX_LEN..RESERVED_PREFIX_LEN + n].copy_from_slice(&payload[..n]);
                backing.write_at(offset, &buf)
            })();
            let ok = result.is_ok();
            done.complete(result);
            if ok { Ok(()) } else { Err(std::io::Error::new(std::io::ErrorKind::Other, "write failed")) }
        }
        Command::Read { segment_id, done } => {
            let offset = (segment_id / num_disks) * segment_size as u64;
            let result = (|| -> std::io::Result<(SegmentPrefix, Vec<u8>)> {
                let mut buf = vec![0u8; segment_size as usize];
                backing.read_at(offset, &mut buf)?;
                let prefix = SegmentPrefix::decode(&buf[..RESERVED_PREFIX_LEN]);
                let payload = buf[RESERVED_PREFIX_LEN..].to_vec();
                Ok((prefix, payload))
            })();
            let ok = result.is_ok();
            done.complete(result);
            if ok { Ok(()) } else { Err(std::io::Error::new(std::io::ErrorKind::Other, "read failed")) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::segment::NO_NEXT_SEGMENT;

    fn prefix(custody_id: u64, is_head: bool, next: u32) -> SegmentPrefix {
        SegmentPrefix { next_segment_id: next, custody_id, is_chain_head: is_head }
    }

    #[test]
    fn single_disk_write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk0");
        let pool = WriterPool::new(&[path], 4096, 16).unwrap();

        let payload = vec![9u8; 100];
        pool.write(0, prefix(1, true, NO_NEXT_SEGMENT), payload.clone()).unwrap();
        let (p, data) = pool.read(0).unwrap();
        assert_eq!(p.custody_id, 1);
        assert!(p.is_chain_head);
        assert_eq!(&data[..100], &payload[..]);
    }

    #[test]
    fn multi_disk_round_robins_writes() {
        let dir = tempfile::tempdir().unwrap();
        let paths = vec![dir.path().join("d0"), dir.path().join("d1")];
        let pool = WriterPool::new(&paths, 4096, 16).unwrap();

        pool.write(0, prefix(1, true, 1), vec![1u8; 10]).unwrap();
        pool.write(1, prefix(1, false, NO_NEXT_SEGMENT), vec![2u8; 10]).unwrap();
        let (p0, d0) = pool.read(0).unwrap();
        let (p1, d1) = pool.read(1).unwrap();
        assert_eq!(p0.next_segment_id, 1);
        assert_eq!(&d0[..10], &[1u8; 10][..]);
        assert_eq!(p1.next_segment_id, NO_NEXT_SEGMENT);
        assert_eq!(&d1[..10], &[2u8; 10][..]);
    }
}
