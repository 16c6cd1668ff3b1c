// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 dtn-storage-core contributors
//
// Ingress admission: per received bundle, decide cut-through vs.
// store-and-forward and apply backpressure. One admission thread runs per
// induct; all of them share one `IngressAdmission` handle, so the
// pending-ack and storage-queue counters it guards are contended across
// inducts, not just within one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::bus::{BusFrame, Header, HeaderKind};
use crate::config::Config;
use crate::contact::AvailableDestinations;
use crate::error::{ResourceKind, StorageError};
use crate::primary_block::{self, eid, PrimaryBlock};
use crate::waiter::Waiter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitOutcome {
    CutThrough,
    Stored,
    DroppedBackpressure,
}

struct PendingAckCounter {
    count: Mutex<usize>,
    waiter: Waiter,
}

impl PendingAckCounter {
    fn new() -> Self {
        Self { count: Mutex::new(0), waiter: Waiter::new() }
    }
}

/// Tracks a handoff to egress or storage until its ack returns, so the
/// ack-reader loop can release the right backpressure counter without
/// needing custody semantics.
struct InFlightEntry {
    destination: String,
    via_storage: bool,
}

pub struct IngressAdmission {
    config: Config,
    destinations: Arc<AvailableDestinations>,
    to_egress: crossbeam_channel::Sender<BusFrame>,
    to_storage: crossbeam_channel::Sender<BusFrame>,
    pending_acks: Mutex<HashMap<String, Arc<PendingAckCounter>>>,
    storage_pending: Arc<AtomicUsize>,
    storage_waiter: Waiter,
    next_unique_id: AtomicU64,
    in_flight: Mutex<HashMap<u64, InFlightEntry>>,
    dropped_count: AtomicUsize,
}

impl IngressAdmission {
    pub fn new(
        config: Config,
        destinations: Arc<AvailableDestinations>,
        to_egress: crossbeam_channel::Sender<BusFrame>,
        to_storage: crossbeam_channel::Sender<BusFrame>,
    ) -> Self {
        Self {
            config,
            destinations,
            to_egress,
            to_storage,
            pending_acks: Mutex::new(HashMap::new()),
            storage_pending: Arc::new(AtomicUsize::new(0)),
            storage_waiter: Waiter::new(),
            next_unique_id: AtomicU64::new(1),
            in_flight: Mutex::new(HashMap::new()),
            dropped_count: AtomicUsize::new(0),
        }
    }

    pub fn dropped_count(&self) -> usize {
        self.dropped_count.load(Ordering::Relaxed)
    }

    fn pending_ack_counter(&self, dest_eid: &str) -> Arc<PendingAckCounter> {
        self.pending_acks
            .lock()
            .unwrap()
            .entry(dest_eid.to_string())
            .or_insert_with(|| Arc::new(PendingAckCounter::new()))
            .clone()
    }

    /// Decode and admit one received bundle. Returns the path it took, or
    /// an error for a malformed or oversized bundle (never retried here —
    /// the caller's induct is responsible for what happens to a rejected
    /// bundle on the wire).
    pub fn admit(&self, raw_bundle: &[u8]) -> Result<AdmitOutcome, StorageError> {
        if raw_bundle.len() as u64 > self.config.max_bundle_size_bytes {
            return Err(StorageError::MalformedBundle(format!(
                "bundle of {} bytes exceeds max_bundle_size_bytes",
                raw_bundle.len()
            )));
        }
        let block = primary_block::decode(raw_bundle)?;

        // Admin records addressed to this node's custody endpoint must go to
        // storage unconditionally, regardless of link state or cut-through
        // mode -- they signal decatalog and must not be dropped or routed
        // around storage.
        if block.is_admin_record {
            self.store(raw_bundle, &block, false);
            return Ok(AdmitOutcome::Stored);
        }

        let link_up = self.destinations.is_available(&block.dest_eid);
        if link_up && !block.custody_requested {
            match self.try_cut_through(raw_bundle, &block) {
                Some(outcome) => return Ok(outcome),
                None if self.config.cut_through_only => {
                    // Test-harness mode: no fallback path exists, so a
                    // cut-through timeout is a drop, not a store.
                    self.dropped_count.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        destination = %block.dest_eid,
                        "admission dropped bundle: cut-through-only mode has no store fallback"
                    );
                    return Ok(AdmitOutcome::DroppedBackpressure);
                }
                None => {
                    // Timed out waiting for backpressure to clear; fall back
                    // to store rather than drop, per the admission procedure.
                }
            }
        }

        if self.try_store(raw_bundle, &block) {
            Ok(AdmitOutcome::Stored)
        } else {
            self.dropped_count.fetch_add(1, Ordering::Relaxed);
            warn!(destination = %block.dest_eid, "admission dropped bundle: storage queue backpressure timed out");
            Ok(AdmitOutcome::DroppedBackpressure)
        }
    }

    fn try_cut_through(&self, raw_bundle: &[u8], block: &PrimaryBlock) -> Option<AdmitOutcome> {
        let counter = self.pending_ack_counter(&block.dest_eid);
        let max = self.config.zmq_max_messages_per_path;
        let timeout = Duration::from_millis(self.config.max_ingress_wait_on_egress_ms);

        let woke = counter.waiter.wait_if(|| *counter.count.lock().unwrap() >= max, Some(timeout));
        if !woke {
            return None;
        }

        *counter.count.lock().unwrap() += 1;
        let unique_id = self.next_unique_id.fetch_add(1, Ordering::Relaxed);
        self.in_flight.lock().unwrap().insert(
            unique_id,
            InFlightEntry { destination: block.dest_eid.clone(), via_storage: false },
        );

        let header = cut_through_header(block, unique_id);
        if self.to_egress.send(BusFrame::new(header, raw_bundle.to_vec())).is_err() {
            warn!("ingress->egress channel closed, falling back to store");
            self.release_pending_ack(unique_id);
            return None;
        }
        Some(AdmitOutcome::CutThrough)
    }

    fn try_store(&self, raw_bundle: &[u8], block: &PrimaryBlock) -> bool {
        let timeout = Duration::from_millis(self.config.max_ingress_wait_on_egress_ms);
        let woke = self
            .storage_waiter
            .wait_if(|| self.storage_pending.load(Ordering::Relaxed) >= self.config.zmq_max_messages_per_path, Some(timeout));
        if !woke {
            return false;
        }
        self.store(raw_bundle, block, true);
        true
    }

    fn store(&self, raw_bundle: &[u8], block: &PrimaryBlock, count_backpressure: bool) {
        if count_backpressure {
            self.storage_pending.fetch_add(1, Ordering::Relaxed);
        }
        let unique_id = self.next_unique_id.fetch_add(1, Ordering::Relaxed);
        self.in_flight.lock().unwrap().insert(
            unique_id,
            InFlightEntry { destination: block.dest_eid.clone(), via_storage: true },
        );
        let (dest_node, dest_service) = eid::parse(&block.dest_eid).unwrap_or((0, 0));
        let header = Header {
            kind: HeaderKind::Store,
            flags: if block.custody_requested { 0x01 } else { 0 },
            dest_node,
            dest_service,
            custody_id: 0,
            ingress_unique_id: unique_id,
            next_hop_node: 0,
            next_hop_service: 0,
            outduct_uuid: 0,
        };
        if self.to_storage.send(BusFrame::new(header, raw_bundle.to_vec())).is_err() {
            warn!("ingress->storage channel closed, bundle lost");
        }
    }

    fn release_pending_ack(&self, unique_id: u64) {
        let entry = self.in_flight.lock().unwrap().remove(&unique_id);
        if let Some(entry) = entry {
            if !entry.via_storage {
                let counter = self.pending_ack_counter(&entry.destination);
                let mut count = counter.count.lock().unwrap();
                *count = count.saturating_sub(1);
                drop(count);
                counter.waiter.notify();
            } else {
                self.storage_pending.fetch_sub(1, Ordering::Relaxed);
                self.storage_waiter.notify();
            }
        }
    }

    /// Runs until `running` goes false, popping acks off `egress_to_ingress`
    /// and `egress_to_storage`-forwarded acks and releasing the matching
    /// backpressure counter.
    pub fn run_ack_reader(
        &self,
        egress_to_ingress: crossbeam_channel::Receiver<BusFrame>,
        running: &std::sync::atomic::AtomicBool,
    ) {
        const POLL: Duration = Duration::from_millis(250);
        while running.load(Ordering::Relaxed) {
            match egress_to_ingress.recv_timeout(POLL) {
                Ok(frame) => self.release_pending_ack(frame.header.ingress_unique_id),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("ingress ack reader stopped");
    }
}

fn cut_through_header(block: &PrimaryBlock, unique_id: u64) -> Header {
    let (dest_node, dest_service) = eid::parse(&block.dest_eid).unwrap_or((0, 0));
    Header {
        kind: HeaderKind::Egress,
        flags: 0x02, // is_cut_through
        dest_node,
        dest_service,
        custody_id: 0,
        ingress_unique_id: unique_id,
        next_hop_node: 0,
        next_hop_service: 0,
        outduct_uuid: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DiskConfig, StorageConfig};
    use crate::primary_block::{Priority, WireVersion};

    fn test_config() -> Config {
        Config {
            max_bundle_size_bytes: 1024,
            max_ingress_wait_on_egress_ms: 50,
            zmq_max_messages_per_path: 2,
            storage_config: StorageConfig {
                total_capacity_bytes: 4096,
                disks: vec![DiskConfig { name: "d0".into(), path: "/tmp/unused".into() }],
            },
            segment_size_bytes: 4096,
            num_storage_threads: 1,
            cut_through_only: false,
        }
    }

    fn sample_bundle(dest: &str, custody: bool, admin: bool) -> Vec<u8> {
        let block = PrimaryBlock {
            dest_eid: dest.to_string(),
            src_eid: "ipn:1.0".into(),
            custody_requested: custody,
            is_admin_record: admin,
            creation_time: 1,
            sequence: 1,
            lifetime_secs: 60,
            fragment_offset: None,
            fragment_length: None,
            priority: Priority::Normal,
            wire_version: WireVersion::Modern,
            crc_valid: true,
        };
        primary_block::encode(&block)
    }

    #[test]
    fn link_down_destination_falls_back_to_store() {
        let destinations = Arc::new(AvailableDestinations::new());
        let (egress_tx, _egress_rx) = crossbeam_channel::unbounded();
        let (storage_tx, storage_rx) = crossbeam_channel::unbounded();
        let admission = IngressAdmission::new(test_config(), destinations, egress_tx, storage_tx);

        let bundle = sample_bundle("ipn:2.1", false, false);
        let outcome = admission.admit(&bundle).unwrap();
        assert_eq!(outcome, AdmitOutcome::Stored);
        assert!(storage_rx.try_recv().is_ok());
    }

    #[test]
    fn admin_record_always_goes_to_storage_even_when_link_is_up() {
        let destinations = Arc::new(AvailableDestinations::new());
        destinations.link_up("ipn:2.1".to_string());
        let (egress_tx, egress_rx) = crossbeam_channel::unbounded();
        let (storage_tx, storage_rx) = crossbeam_channel::unbounded();
        let admission = IngressAdmission::new(test_config(), destinations, egress_tx, storage_tx);

        let bundle = sample_bundle("ipn:2.1", false, true);
        let outcome = admission.admit(&bundle).unwrap();
        assert_eq!(outcome, AdmitOutcome::Stored);
        assert!(storage_rx.try_recv().is_ok());
        assert!(egress_rx.try_recv().is_err());
    }

    #[test]
    fn oversized_bundle_is_rejected() {
        let destinations = Arc::new(AvailableDestinations::new());
        let (egress_tx, _) = crossbeam_channel::unbounded();
        let (storage_tx, _) = crossbeam_channel::unbounded();
        let admission = IngressAdmission::new(test_config(), destinations, egress_tx, storage_tx);
        let oversized = vec![0u8; 2048];
        assert!(admission.admit(&oversized).is_err());
    }

    /// Once `zmq_max_messages_per_path` cut-through slots for a destination
    /// are full and nothing acks them back, admission must not block past
    /// `max_ingress_wait_on_egress_ms` — it falls back to storing the
    /// bundle instead of dropping or hanging indefinitely.
    #[test]
    fn cut_through_backpressure_falls_back_to_store_after_timeout() {
        let destinations = Arc::new(AvailableDestinations::new());
        destinations.link_up("ipn:2.1".to_string());
        let (egress_tx, egress_rx) = crossbeam_channel::unbounded();
        let (storage_tx, storage_rx) = crossbeam_channel::unbounded();
        let admission = IngressAdmission::new(test_config(), destinations, egress_tx, storage_tx);

        // test_config() sets zmq_max_messages_per_path = 2; fill both slots.
        for _ in 0..2 {
            let outcome = admission.admit(&sample_bundle("ipn:2.1", false, false)).unwrap();
            assert_eq!(outcome, AdmitOutcome::CutThrough);
        }
        assert_eq!(egress_rx.try_iter().count(), 2);

        // Nothing ever acks those two, so the third admit must time out on
        // the pending-ack wait (50ms, per test_config) and fall back to
        // storing rather than blocking forever or dropping.
        let outcome = admission.admit(&sample_bundle("ipn:2.1", false, false)).unwrap();
        assert_eq!(outcome, AdmitOutcome::Stored);
        assert!(storage_rx.try_recv().is_ok());
    }

    /// A zero-millisecond wait must not block at all: with no cut-through
    /// slots and no storage headroom, admission observes the backpressure
    /// immediately and reports a dropped bundle rather than stalling.
    #[test]
    fn zero_timeout_admission_drops_without_blocking() {
        let destinations = Arc::new(AvailableDestinations::new());
        destinations.link_up("ipn:2.1".to_string());
        let (egress_tx, _egress_rx) = crossbeam_channel::unbounded();
        let (storage_tx, _storage_rx) = crossbeam_channel::unbounded();
        let mut config = test_config();
        config.max_ingress_wait_on_egress_ms = 0;
        config.zmq_max_messages_per_path = 0;
        let admission = IngressAdmission::new(config, destinations, egress_tx, storage_tx);

        let started = std::time::Instant::now();
        let outcome = admission.admit(&sample_bundle("ipn:2.1", false, false)).unwrap();
        assert_eq!(outcome, AdmitOutcome::DroppedBackpressure);
        assert_eq!(admission.dropped_count(), 1);
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    /// In `cut_through_only` mode there is no store fallback: a cut-through
    /// timeout must drop the bundle rather than route it to storage.
    #[test]
    fn cut_through_only_mode_drops_instead_of_falling_back_to_store() {
        let destinations = Arc::new(AvailableDestinations::new());
        destinations.link_up("ipn:2.1".to_string());
        let (egress_tx, egress_rx) = crossbeam_channel::unbounded();
        let (storage_tx, storage_rx) = crossbeam_channel::unbounded();
        let mut config = test_config();
        config.cut_through_only = true;
        let admission = IngressAdmission::new(config, destinations, egress_tx, storage_tx);

        // Fill both cut-through slots (zmq_max_messages_per_path = 2).
        for _ in 0..2 {
            let outcome = admission.admit(&sample_bundle("ipn:2.1", false, false)).unwrap();
            assert_eq!(outcome, AdmitOutcome::CutThrough);
        }
        assert_eq!(egress_rx.try_iter().count(), 2);

        let outcome = admission.admit(&sample_bundle("ipn:2.1", false, false)).unwrap();
        assert_eq!(outcome, AdmitOutcome::DroppedBackpressure);
        assert_eq!(admission.dropped_count(), 1);
        assert!(storage_rx.try_recv().is_err());
    }
}
