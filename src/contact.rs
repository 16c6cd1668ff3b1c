// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 dtn-storage-core contributors
//
// Contact-driven release controller: the only writer of the
// available-destinations set. Admission reads it to decide cut-through
// eligibility; the storage release loop reads it to decide which
// destinations it may currently pop bundles for.

use std::collections::HashSet;
use std::sync::RwLock;

use tracing::{debug, info};

use crate::primary_block::eid;
use crate::waiter::Waiter;

/// The set of final-destination endpoints for which a contact is currently
/// open, plus a waiter the release loop blocks on between link-ups.
pub struct AvailableDestinations {
    set: RwLock<HashSet<String>>,
    release_signal: Waiter,
}

impl AvailableDestinations {
    pub fn new() -> Self {
        Self {
            set: RwLock::new(HashSet::new()),
            release_signal: Waiter::new(),
        }
    }

    pub fn is_available(&self, dest_eid: &str) -> bool {
        self.set.read().unwrap().contains(dest_eid)
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.set.read().unwrap().iter().cloned().collect()
    }

    pub(crate) fn link_up(&self, dest_eid: String) {
        self.set.write().unwrap().insert(dest_eid.clone());
        info!(destination = %dest_eid, "link up");
        self.release_signal.broadcast();
    }

    pub(crate) fn link_down(&self, dest_eid: &str) {
        self.set.write().unwrap().remove(dest_eid);
        info!(destination = %dest_eid, "link down");
    }

    /// Block the storage release loop until a link-up happens or `running`
    /// goes false (polled via `is_quitting`).
    pub fn wait_for_release_signal(&self, timeout: std::time::Duration) {
        self.release_signal.wait_if(|| self.set.read().unwrap().is_empty(), Some(timeout));
    }

    pub fn shutdown(&self) {
        self.release_signal.quit_waiting();
    }
}

impl Default for AvailableDestinations {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs the contact listener loop: consumes LINK_UP/LINK_DOWN frames off the
/// bus's `link_events` broadcaster and applies them to `destinations`. A
/// node runs exactly one of these threads; ingress and storage both read
/// the same `AvailableDestinations` handle this loop maintains.
pub fn run_contact_listener(
    link_events: crossbeam_channel::Receiver<crate::bus::BusFrame>,
    destinations: &AvailableDestinations,
    running: &std::sync::atomic::AtomicBool,
) {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    const POLL: Duration = Duration::from_millis(250);

    while running.load(Ordering::Relaxed) {
        match link_events.recv_timeout(POLL) {
            Ok(frame) => apply_frame(&frame, destinations),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("contact listener stopped");
}

fn apply_frame(frame: &crate::bus::BusFrame, destinations: &AvailableDestinations) {
    let dest_eid = eid::format(frame.header.dest_node, frame.header.dest_service);
    match frame.header.kind {
        crate::bus::HeaderKind::LinkUp => destinations.link_up(dest_eid),
        crate::bus::HeaderKind::LinkDown => destinations.link_down(&dest_eid),
        other => debug!(?other, "contact listener ignoring non-link frame"),
    }
}
