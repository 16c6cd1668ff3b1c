// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 dtn-storage-core contributors
//
// Egress dispatch: for each outbound bundle, look up the outduct for its
// final destination and hand it off. Convergence-layer outducts themselves
// are out of scope (see the purpose statement); this module only owns the
// selection map and the success/failure plumbing back to storage/ingress.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{info, warn};

use crate::bus::{BusFrame, Header, HeaderKind};
use crate::primary_block::eid;

/// An outbound transport. Transmission, opportunistic-peer tracking, and
/// identity are the only things the dispatcher needs from a convergence
/// layer; everything else (connection management, retries at the wire
/// level) belongs to the outduct's own implementation.
pub trait Outduct: Send + Sync {
    fn uuid(&self) -> u64;
    fn transmit(&self, bundle: &[u8]) -> std::io::Result<()>;

    /// True if this outduct currently has an opportunistic peer link open
    /// for `dest_eid`, letting storage bypass the selection map entirely.
    fn opportunistic_peer(&self, dest_eid: &str) -> bool {
        let _ = dest_eid;
        false
    }
}

pub struct EgressDispatch {
    outducts: RwLock<HashMap<String, Arc<dyn Outduct>>>,
    to_ingress: crossbeam_channel::Sender<BusFrame>,
    to_storage: crossbeam_channel::Sender<BusFrame>,
    opportunistic_to_ingress: crossbeam_channel::Sender<BusFrame>,
    link_status: crossbeam_channel::Sender<BusFrame>,
}

impl EgressDispatch {
    pub fn new(
        to_ingress: crossbeam_channel::Sender<BusFrame>,
        to_storage: crossbeam_channel::Sender<BusFrame>,
        opportunistic_to_ingress: crossbeam_channel::Sender<BusFrame>,
        link_status: crossbeam_channel::Sender<BusFrame>,
    ) -> Self {
        Self {
            outducts: RwLock::new(HashMap::new()),
            to_ingress,
            to_storage,
            opportunistic_to_ingress,
            link_status,
        }
    }

    /// Atomically (re)assign the outduct for `final_dest`, as directed by a
    /// ROUTE_UPDATE event from the router collaborator.
    pub fn handle_route_update(&self, final_dest: String, outduct: Arc<dyn Outduct>) {
        info!(destination = %final_dest, "route updated");
        self.outducts.write().unwrap().insert(final_dest, outduct);
    }

    pub fn remove_route(&self, final_dest: &str) {
        self.outducts.write().unwrap().remove(final_dest);
    }

    /// Dispatch one bundle. `frame.header.is_cut_through()` decides where
    /// the success ack is addressed (straight back to ingress, or to
    /// storage if the bundle came off the storage release loop).
    pub fn dispatch(&self, frame: &BusFrame) {
        let dest_eid = eid::format(frame.header.dest_node, frame.header.dest_service);

        if let Some(outduct) = self.opportunistic_outduct_for(&dest_eid) {
            let _ = self.opportunistic_to_ingress.send(frame.clone());
            let _ = outduct;
            return;
        }

        let outduct = self.outducts.read().unwrap().get(&dest_eid).cloned();
        let Some(outduct) = outduct else {
            warn!(destination = %dest_eid, "no outduct assigned, returning bundle to storage");
            self.return_to_storage(frame);
            return;
        };

        match outduct.transmit(&frame.payload) {
            Ok(()) => self.ack_success(frame),
            Err(e) => {
                warn!(destination = %dest_eid, error = %e, "transmission failed, raising link-down");
                self.publish_link_status(outduct.uuid(), false);
                self.return_to_storage(frame);
            }
        }
    }

    fn opportunistic_outduct_for(&self, dest_eid: &str) -> Option<Arc<dyn Outduct>> {
        self.outducts
            .read()
            .unwrap()
            .values()
            .find(|o| o.opportunistic_peer(dest_eid))
            .cloned()
    }

    fn ack_success(&self, frame: &BusFrame) {
        let ack = Header {
            kind: if frame.header.is_cut_through() {
                HeaderKind::EgressAckToIngress
            } else {
                HeaderKind::EgressAckToStorage
            },
            // Preserve the custody flag: storage's ack handler tells
            // custodial and non-custodial sends apart by it, not by
            // custody_id (0 is a valid allocated id).
            flags: frame.header.flags & crate::bus::FLAG_HAS_CUSTODY,
            dest_node: frame.header.dest_node,
            dest_service: frame.header.dest_service,
            custody_id: frame.header.custody_id,
            ingress_unique_id: frame.header.ingress_unique_id,
            next_hop_node: 0,
            next_hop_service: 0,
            outduct_uuid: 0,
        };
        let sender = if frame.header.is_cut_through() { &self.to_ingress } else { &self.to_storage };
        let _ = sender.send(BusFrame::new(ack, Vec::new()));
    }

    fn return_to_storage(&self, frame: &BusFrame) {
        let header = Header { kind: HeaderKind::FailedBundle, ..frame.header };
        let _ = self.to_storage.send(BusFrame::new(header, frame.payload.clone()));
    }

    fn publish_link_status(&self, outduct_uuid: u64, up: bool) {
        let header = Header {
            kind: HeaderKind::LinkStatus,
            flags: if up { 0x08 } else { 0 },
            dest_node: 0,
            dest_service: 0,
            custody_id: 0,
            ingress_unique_id: 0,
            next_hop_node: 0,
            next_hop_service: 0,
            outduct_uuid,
        };
        let _ = self.link_status.send(BusFrame::new(header, Vec::new()));
    }

    /// Runs the dispatch loop, pulling from both cut-through (ingress) and
    /// stored (storage release loop) inbound queues until `running` is
    /// cleared. Uses a `Select` so neither queue starves the other.
    pub fn run(
        &self,
        ingress_to_egress: &crossbeam_channel::Receiver<BusFrame>,
        storage_to_egress: &crossbeam_channel::Receiver<BusFrame>,
        running: &AtomicBool,
    ) {
        while running.load(Ordering::Relaxed) {
            let mut sel = crossbeam_channel::Select::new();
            let ingress_idx = sel.recv(ingress_to_egress);
            let storage_idx = sel.recv(storage_to_egress);
            let Ok(op) = sel.select_timeout(Duration::from_millis(250)) else {
                continue;
            };
            let frame = if op.index() == ingress_idx {
                op.recv(ingress_to_egress)
            } else if op.index() == storage_idx {
                op.recv(storage_to_egress)
            } else {
                unreachable!()
            };
            match frame {
                Ok(frame) => self.dispatch(&frame),
                Err(_) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct RecordingOutduct {
        uuid: u64,
        transmitted: Mutex<Vec<Vec<u8>>>,
        fail_next: AtomicUsize,
    }

    impl RecordingOutduct {
        fn new(uuid: u64) -> Self {
            Self { uuid, transmitted: Mutex::new(Vec::new()), fail_next: AtomicUsize::new(0) }
        }
    }

    impl Outduct for RecordingOutduct {
        fn uuid(&self) -> u64 {
            self.uuid
        }

        fn transmit(&self, bundle: &[u8]) -> std::io::Result<()> {
            if self.fail_next.swap(0, Ordering::Relaxed) == 1 {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "simulated failure"));
            }
            self.transmitted.lock().unwrap().push(bundle.to_vec());
            Ok(())
        }
    }

    fn sample_frame(cut_through: bool) -> BusFrame {
        let header = Header {
            kind: HeaderKind::Egress,
            flags: if cut_through { 0x02 } else { 0 },
            dest_node: 2,
            dest_service: 1,
            custody_id: 0,
            ingress_unique_id: 7,
            next_hop_node: 0,
            next_hop_service: 0,
            outduct_uuid: 0,
        };
        BusFrame::new(header, vec![9, 9, 9])
    }

    #[test]
    fn dispatch_with_no_route_returns_bundle_to_storage() {
        let (to_ingress, _) = crossbeam_channel::unbounded();
        let (to_storage, storage_rx) = crossbeam_channel::unbounded();
        let (opp, _) = crossbeam_channel::unbounded();
        let (status, _) = crossbeam_channel::unbounded();
        let dispatch = EgressDispatch::new(to_ingress, to_storage, opp, status);

        dispatch.dispatch(&sample_frame(false));
        let returned = storage_rx.try_recv().unwrap();
        assert_eq!(returned.header.kind, HeaderKind::FailedBundle);
    }

    #[test]
    fn successful_cut_through_dispatch_acks_ingress() {
        let (to_ingress, ingress_rx) = crossbeam_channel::unbounded();
        let (to_storage, _) = crossbeam_channel::unbounded();
        let (opp, _) = crossbeam_channel::unbounded();
        let (status, _) = crossbeam_channel::unbounded();
        let dispatch = EgressDispatch::new(to_ingress, to_storage, opp, status);
        dispatch.handle_route_update("ipn:2.1".to_string(), Arc::new(RecordingOutduct::new(1)));

        dispatch.dispatch(&sample_frame(true));
        let ack = ingress_rx.try_recv().unwrap();
        assert_eq!(ack.header.kind, HeaderKind::EgressAckToIngress);
    }

    #[test]
    fn failed_transmission_raises_link_down_and_returns_to_storage() {
        let (to_ingress, _) = crossbeam_channel::unbounded();
        let (to_storage, storage_rx) = crossbeam_channel::unbounded();
        let (opp, _) = crossbeam_channel::unbounded();
        let (status, status_rx) = crossbeam_channel::unbounded();
        let dispatch = EgressDispatch::new(to_ingress, to_storage, opp, status);
        let outduct = Arc::new(RecordingOutduct::new(3));
        outduct.fail_next.store(1, Ordering::Relaxed);
        dispatch.handle_route_update("ipn:2.1".to_string(), outduct);

        dispatch.dispatch(&sample_frame(false));
        assert_eq!(storage_rx.try_recv().unwrap().header.kind, HeaderKind::FailedBundle);
        let status_frame = status_rx.try_recv().unwrap();
        assert_eq!(status_frame.header.outduct_uuid, 3);
        assert!(!status_frame.header.is_link_up());
    }
}
