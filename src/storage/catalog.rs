// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 dtn-storage-core contributors
//
// In-memory multi-index catalog. Descriptors are owned by value in a single
// `slab::Slab`; every other index (`awaiting_send`, `by_custody_id`,
// `by_uuid_no_fragment`, `by_uuid_fragment`) holds only the slab key, never
// a pointer, so the catalog has no internal cyclic references and no
// lifetime to thread through its lookup maps.

use std::collections::{BTreeMap, HashMap};

use slab::Slab;

use crate::primary_block::{BundleUuid, Priority};

pub type DescriptorKey = usize;

#[derive(Debug, Clone)]
pub struct Descriptor {
    pub uuid: BundleUuid,
    pub destination: String,
    pub priority: Priority,
    pub expiration_secs: u64,
    pub custody_id: Option<u64>,
    pub segment_ids: Vec<u64>,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    Fifo,
    Lifo,
}

#[derive(Default)]
struct ExpirationBucket {
    descriptors: Vec<DescriptorKey>,
}

type PriorityQueues = [BTreeMap<u64, ExpirationBucket>; Priority::COUNT];

#[derive(Default)]
pub struct CatalogCounters {
    pub catalogued: u64,
    pub catalogued_bytes: u64,
    pub removed: u64,
    pub removed_bytes: u64,
}

/// The catalog. All four indices are guarded together — see the
/// module-level note on why they share a single owner rather than separate
/// locks: multi-index atomicity (e.g. pop-for-send removing from
/// `awaiting_send` while leaving `by_custody_id` intact) needs one critical
/// section, not several coordinated ones.
#[derive(Default)]
pub struct Catalog {
    descriptors: Slab<Descriptor>,
    awaiting_send: HashMap<String, PriorityQueues>,
    by_custody_id: HashMap<u64, DescriptorKey>,
    by_uuid_no_fragment: HashMap<BundleUuid, DescriptorKey>,
    by_uuid_fragment: HashMap<BundleUuid, DescriptorKey>,
    counters: CatalogCounters,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self) -> &CatalogCounters {
        &self.counters
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Insert a newly admitted bundle. Returns `false` without inserting if
    /// the uuid is already catalogued and `policy` doesn't permit a
    /// duplicate send (duplicates are only disallowed for non-fragmented
    /// uuids; a bundle may legitimately appear more than once as distinct
    /// fragments).
    pub fn catalog_incoming(&mut self, descriptor: Descriptor, policy: DuplicatePolicy) -> bool {
        let is_fragment = descriptor.uuid.is_fragment();
        if !is_fragment && self.by_uuid_no_fragment.contains_key(&descriptor.uuid) {
            return false;
        }

        let uuid = descriptor.uuid.clone();
        let custody_id = descriptor.custody_id;
        let destination = descriptor.destination.clone();
        let priority = descriptor.priority;
        let expiration = descriptor.expiration_secs;
        let size_bytes = descriptor.size_bytes;

        let key = self.descriptors.insert(descriptor);

        let queues = self
            .awaiting_send
            .entry(destination)
            .or_insert_with(Priority::empty_queues);
        let bucket = queues[priority.index()].entry(expiration).or_default();
        match policy {
            DuplicatePolicy::Fifo => bucket.descriptors.push(key),
            DuplicatePolicy::Lifo => bucket.descriptors.insert(0, key),
        }

        if let Some(cid) = custody_id {
            self.by_custody_id.insert(cid, key);
        }
        if is_fragment {
            self.by_uuid_fragment.insert(uuid, key);
        } else {
            self.by_uuid_no_fragment.insert(uuid, key);
        }

        self.counters.catalogued += 1;
        self.counters.catalogued_bytes += size_bytes;
        true
    }

    /// Pop the earliest-expiring, highest-priority descriptor for the first
    /// destination in `available_destinations` that has one queued. Removes
    /// it from `awaiting_send` only; the other indices still resolve it
    /// until [`remove`] is called.
    pub fn pop_for_send(
        &mut self,
        available_destinations: &[String],
    ) -> Option<(DescriptorKey, &Descriptor)> {
        for dest in available_destinations {
            let Some(queues) = self.awaiting_send.get_mut(dest) else { continue };
            for priority_queue in queues.iter_mut().rev() {
                if let Some((&expiration, bucket)) = priority_queue.iter_mut().next() {
                    if bucket.descriptors.is_empty() {
                        continue;
                    }
                    let key = bucket.descriptors.remove(0);
                    if bucket.descriptors.is_empty() {
                        priority_queue.remove(&expiration);
                    }
                    return self.descriptors.get(key).map(|d| (key, d));
                }
            }
        }
        None
    }

    /// Reinsert a descriptor into `awaiting_send` after a failed send,
    /// placing it at the head of its expiration bucket so it is retried
    /// next.
    pub fn return_to_awaiting_send(&mut self, key: DescriptorKey) {
        let Some(descriptor) = self.descriptors.get(key) else { return };
        let (destination, priority, expiration) =
            (descriptor.destination.clone(), descriptor.priority, descriptor.expiration_secs);
        let queues = self
            .awaiting_send
            .entry(destination)
            .or_insert_with(Priority::empty_queues);
        let bucket = queues[priority.index()].entry(expiration).or_default();
        bucket.descriptors.insert(0, key);
    }

    /// Remove a custodial descriptor by its custody id. `keep_uuid` retains
    /// the uuid-map entry (used when only the storage copy, not the logical
    /// bundle identity, needs to go away — currently unused by any caller
    /// but kept symmetrical with the original remove contract).
    pub fn remove(&mut self, custody_id: u64, keep_uuid: bool) -> Option<Descriptor> {
        let key = self.by_custody_id.remove(&custody_id)?;
        let descriptor = self.descriptors.remove(key);
        if !keep_uuid {
            if descriptor.uuid.is_fragment() {
                self.by_uuid_fragment.remove(&descriptor.uuid);
            } else {
                self.by_uuid_no_fragment.remove(&descriptor.uuid);
            }
        }
        self.counters.removed += 1;
        self.counters.removed_bytes += descriptor.size_bytes;
        Some(descriptor)
    }

    /// Remove a descriptor that was popped for send and whose transmission
    /// completed successfully without custody (no custody id to key on).
    pub fn remove_by_key(&mut self, key: DescriptorKey) -> Option<Descriptor> {
        if !self.descriptors.contains(key) {
            return None;
        }
        let descriptor = self.descriptors.remove(key);
        if descriptor.uuid.is_fragment() {
            self.by_uuid_fragment.remove(&descriptor.uuid);
        } else {
            self.by_uuid_no_fragment.remove(&descriptor.uuid);
        }
        if let Some(cid) = descriptor.custody_id {
            self.by_custody_id.remove(&cid);
        }
        self.counters.removed += 1;
        self.counters.removed_bytes += descriptor.size_bytes;
        Some(descriptor)
    }

    pub fn get_by_custody_id(&self, custody_id: u64) -> Option<&Descriptor> {
        self.by_custody_id.get(&custody_id).and_then(|&key| self.descriptors.get(key))
    }

    pub fn get_by_uuid(&self, uuid: &BundleUuid) -> Option<&Descriptor> {
        let key = if uuid.is_fragment() {
            self.by_uuid_fragment.get(uuid)
        } else {
            self.by_uuid_no_fragment.get(uuid)
        };
        key.and_then(|&k| self.descriptors.get(k))
    }

    /// Sweep every destination's queues for descriptors whose expiration has
    /// passed, returning up to `max_count` custody ids in ascending
    /// expiration order. Non-custodial expired descriptors are skipped —
    /// only custody ids are returned, since the caller uses this to drive
    /// custody-timeout retransmission, not bulk eviction.
    pub fn get_expired(&self, now_secs: u64, max_count: usize) -> Vec<u64> {
        let mut candidates: Vec<(u64, u64)> = Vec::new(); // (expiration, custody_id)
        for queues in self.awaiting_send.values() {
            for priority_queue in queues.iter() {
                for (&expiration, bucket) in priority_queue.iter() {
                    if expiration > now_secs {
                        continue;
                    }
                    for &key in &bucket.descriptors {
                        if let Some(descriptor) = self.descriptors.get(key) {
                            if let Some(cid) = descriptor.custody_id {
                                candidates.push((expiration, cid));
                            }
                        }
                    }
                }
            }
        }
        candidates.sort_unstable_by_key(|&(expiration, _)| expiration);
        candidates.truncate(max_count);
        candidates.into_iter().map(|(_, cid)| cid).collect()
    }
}
