// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 dtn-storage-core contributors
//
// In-process realization of the inter-module message bus. The wire contract
// (fixed-width, natural-64-bit-aligned, little-endian headers) is kept exact
// so a later out-of-process transport can reuse `Header::encode`/`decode`
// unchanged; only the "send it" part is swapped for a channel instead of a
// socket. A `BusFrame` bundles a header with its payload into one value, so
// "recipients receive both atomically or drop both" is just message-passing
// rather than a two-frame protocol this crate has to keep in sync.

use byteorder::{ByteOrder, LittleEndian};
use crossbeam_channel::{Receiver, Sender};

pub const HEADER_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    Egress,
    Store,
    EgressAckToIngress,
    EgressAckToStorage,
    FailedBundle,
    LinkUp,
    LinkDown,
    LinkStatus,
    RouteUpdate,
}

impl HeaderKind {
    fn to_tag(self) -> u8 {
        match self {
            HeaderKind::Egress => 1,
            HeaderKind::Store => 2,
            HeaderKind::EgressAckToIngress => 3,
            HeaderKind::EgressAckToStorage => 4,
            HeaderKind::FailedBundle => 5,
            HeaderKind::LinkUp => 6,
            HeaderKind::LinkDown => 7,
            HeaderKind::LinkStatus => 8,
            HeaderKind::RouteUpdate => 9,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => HeaderKind::Egress,
            2 => HeaderKind::Store,
            3 => HeaderKind::EgressAckToIngress,
            4 => HeaderKind::EgressAckToStorage,
            5 => HeaderKind::FailedBundle,
            6 => HeaderKind::LinkUp,
            7 => HeaderKind::LinkDown,
            8 => HeaderKind::LinkStatus,
            9 => HeaderKind::RouteUpdate,
            _ => return None,
        })
    }
}

pub(crate) const FLAG_HAS_CUSTODY: u8 = 0x01;
const FLAG_IS_CUT_THROUGH: u8 = 0x02;
const FLAG_ERROR: u8 = 0x04;
const FLAG_LINK_UP: u8 = 0x08;

/// Superset header covering every endpoint in the bus table; unused fields
/// are zeroed by whichever constructor produced it. Mirrors how a real
/// wire header for a small fixed set of message kinds tends to shake out —
/// one struct, a kind tag, and fields some kinds leave at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: HeaderKind,
    pub flags: u8,
    pub dest_node: u64,
    pub dest_service: u64,
    pub custody_id: u64,
    pub ingress_unique_id: u64,
    pub next_hop_node: u64,
    pub next_hop_service: u64,
    pub outduct_uuid: u64,
}

impl Header {
    pub fn has_custody(&self) -> bool {
        self.flags & FLAG_HAS_CUSTODY != 0
    }

    pub fn is_cut_through(&self) -> bool {
        self.flags & FLAG_IS_CUT_THROUGH != 0
    }

    pub fn is_error(&self) -> bool {
        self.flags & FLAG_ERROR != 0
    }

    pub fn is_link_up(&self) -> bool {
        self.flags & FLAG_LINK_UP != 0
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = self.kind.to_tag();
        buf[1] = self.flags;
        LittleEndian::write_u64(&mut buf[8..16], self.dest_node);
        LittleEndian::write_u64(&mut buf[16..24], self.dest_service);
        LittleEndian::write_u64(&mut buf[24..32], self.custody_id);
        LittleEndian::write_u64(&mut buf[32..40], self.ingress_unique_id);
        LittleEndian::write_u64(&mut buf[40..48], self.next_hop_node);
        LittleEndian::write_u64(&mut buf[48..56], self.next_hop_service);
        LittleEndian::write_u64(&mut buf[56..64], self.outduct_uuid);
        buf
    }

    pub fn decode(buf: &[u8; HEADER_LEN]) -> Option<Self> {
        let kind = HeaderKind::from_tag(buf[0])?;
        Some(Self {
            kind,
            flags: buf[1],
            dest_node: LittleEndian::read_u64(&buf[8..16]),
            dest_service: LittleEndian::read_u64(&buf[16..24]),
            custody_id: LittleEndian::read_u64(&buf[24..32]),
            ingress_unique_id: LittleEndian::read_u64(&buf[32..40]),
            next_hop_node: LittleEndian::read_u64(&buf[40..48]),
            next_hop_service: LittleEndian::read_u64(&buf[48..56]),
            outduct_uuid: LittleEndian::read_u64(&buf[56..64]),
        })
    }
}

#[derive(Debug, Clone)]
pub struct BusFrame {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl BusFrame {
    pub fn new(header: Header, payload: Vec<u8>) -> Self {
        Self { header, payload }
    }
}

/// One-to-many fan-out for the bus's pub/sub endpoints (LINK_UP/LINK_DOWN,
/// LINK_STATUS, ROUTE_UPDATE). `crossbeam_channel` itself is strictly
/// single-consumer-wins per message, so broadcast fans a publish out to one
/// cloned sender per subscriber.
pub struct Broadcaster<T: Clone> {
    subscribers: Vec<Sender<T>>,
}

impl<T: Clone> Broadcaster<T> {
    pub fn new() -> Self {
        Self { subscribers: Vec::new() }
    }

    pub fn subscribe(&mut self) -> Receiver<T> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.subscribers.push(tx);
        rx
    }

    pub fn publish(&self, msg: T) {
        for sub in &self.subscribers {
            let _ = sub.send(msg.clone());
        }
    }
}

impl<T: Clone> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The fixed endpoint table from the external-interfaces contract: push
/// endpoints are plain MPSC channels, pub/sub endpoints are broadcasters.
pub struct Bus {
    pub ingress_to_egress: (Sender<BusFrame>, Receiver<BusFrame>),
    pub ingress_to_storage: (Sender<BusFrame>, Receiver<BusFrame>),
    pub storage_to_egress: (Sender<BusFrame>, Receiver<BusFrame>),
    pub egress_to_ingress: (Sender<BusFrame>, Receiver<BusFrame>),
    pub egress_to_storage: (Sender<BusFrame>, Receiver<BusFrame>),
    pub link_events: Broadcaster<BusFrame>,
    pub link_status: Broadcaster<BusFrame>,
    pub route_updates: Broadcaster<BusFrame>,
}

impl Bus {
    pub fn new() -> Self {
        Self {
            ingress_to_egress: crossbeam_channel::unbounded(),
            ingress_to_storage: crossbeam_channel::unbounded(),
            storage_to_egress: crossbeam_channel::unbounded(),
            egress_to_ingress: crossbeam_channel::unbounded(),
            egress_to_storage: crossbeam_channel::unbounded(),
            link_events: Broadcaster::new(),
            link_status: Broadcaster::new(),
            route_updates: Broadcaster::new(),
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header(kind: HeaderKind) -> Header {
        Header {
            kind,
            flags: FLAG_HAS_CUSTODY | FLAG_IS_CUT_THROUGH,
            dest_node: 2,
            dest_service: 1,
            custody_id: 7,
            ingress_unique_id: 99,
            next_hop_node: 0,
            next_hop_service: 0,
            outduct_uuid: 0,
        }
    }

    #[test]
    fn header_round_trips() {
        let header = sample_header(HeaderKind::Egress);
        let bytes = header.encode();
        let decoded = Header::decode(&bytes).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.has_custody());
        assert!(decoded.is_cut_through());
    }

    #[test]
    fn decode_rejects_unknown_kind_tag() {
        let mut bytes = sample_header(HeaderKind::Store).encode();
        bytes[0] = 0xFF;
        assert!(Header::decode(&bytes).is_none());
    }

    #[test]
    fn broadcaster_fans_out_to_every_subscriber() {
        let mut b: Broadcaster<u32> = Broadcaster::new();
        let a = b.subscribe();
        let c = b.subscribe();
        b.publish(42);
        assert_eq!(a.recv().unwrap(), 42);
        assert_eq!(c.recv().unwrap(), 42);
    }

    #[test]
    fn bus_push_endpoint_delivers_frame() {
        let bus = Bus::new();
        let frame = BusFrame::new(sample_header(HeaderKind::Store), vec![1, 2, 3]);
        bus.ingress_to_storage.0.send(frame).unwrap();
        let received = bus.ingress_to_storage.1.recv().unwrap();
        assert_eq!(received.payload, vec![1, 2, 3]);
    }
}
