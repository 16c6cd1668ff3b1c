// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 dtn-storage-core contributors
//
// Condition-variable + mutex + quit-flag wrapper, adapted from this
// workspace's named cross-process waiter to an in-process one built on
// `std::sync::{Mutex, Condvar}`. Used for per-destination pending-ack
// backpressure, the storage management thread's idle timed-wait, and the
// `running`-flag cancellation model shared by every long-lived thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub struct Waiter {
    cond: Condvar,
    lock: Mutex<()>,
    quit: AtomicBool,
}

impl Waiter {
    pub fn new() -> Self {
        Self {
            cond: Condvar::new(),
            lock: Mutex::new(()),
            quit: AtomicBool::new(false),
        }
    }

    /// Block while `pred` returns `true` and quit hasn't been signalled.
    /// Returns `false` on timeout, `true` if woken by `notify`/`broadcast`
    /// or because quit was signalled.
    pub fn wait_if<F>(&self, pred: F, timeout: Option<Duration>) -> bool
    where
        F: Fn() -> bool,
    {
        let mut guard = self.lock.lock().unwrap();
        while !self.quit.load(Ordering::Relaxed) && pred() {
            guard = match timeout {
                None => self.cond.wait(guard).unwrap(),
                Some(d) => {
                    let (g, result) = self.cond.wait_timeout(guard, d).unwrap();
                    if result.timed_out() {
                        return false;
                    }
                    g
                }
            };
        }
        true
    }

    pub fn notify(&self) {
        let _guard = self.lock.lock().unwrap();
        self.cond.notify_one();
    }

    pub fn broadcast(&self) {
        let _guard = self.lock.lock().unwrap();
        self.cond.notify_all();
    }

    /// Signal quit and wake every waiter; used to shut a thread down cleanly.
    pub fn quit_waiting(&self) {
        self.quit.store(true, Ordering::Release);
        self.broadcast();
    }

    pub fn is_quitting(&self) -> bool {
        self.quit.load(Ordering::Relaxed)
    }
}

impl Default for Waiter {
    fn default() -> Self {
        Self::new()
    }
}
