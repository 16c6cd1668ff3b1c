// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 dtn-storage-core contributors
//
// Compact legacy primary block: a bundle-protocol-version-6-style encoding
// built from SDNV fields plus a processing-flags byte, with a CRC-16
// trailer covering everything before it. Grounded in the original bpv6
// codec; node/service pairs stand in for the full dictionary-based EID
// encoding that codec also supports, since this crate only ever sees `ipn`
// endpoints.

use super::{crc, eid, sdnv, Priority, PrimaryBlock, WireVersion};
use crate::error::StorageError;

const VERSION_BYTE: u8 = 0x06;

const FLAG_ADMIN_RECORD: u8 = 0x01;
const FLAG_CUSTODY_REQUESTED: u8 = 0x02;
const FLAG_IS_FRAGMENT: u8 = 0x04;
const PRIORITY_SHIFT: u8 = 3; // bits 3-4

pub fn encode(block: &PrimaryBlock) -> Vec<u8> {
    let mut body = Vec::new();
    let mut flags = 0u8;
    if block.is_admin_record {
        flags |= FLAG_ADMIN_RECORD;
    }
    if block.custody_requested {
        flags |= FLAG_CUSTODY_REQUESTED;
    }
    if block.fragment_offset.is_some() {
        flags |= FLAG_IS_FRAGMENT;
    }
    flags |= (block.priority.index() as u8) << PRIORITY_SHIFT;
    body.push(flags);

    let (dest_node, dest_service) = eid::parse(&block.dest_eid).unwrap_or((0, 0));
    let (src_node, src_service) = eid::parse(&block.src_eid).unwrap_or((0, 0));
    sdnv::encode(dest_node, &mut body);
    sdnv::encode(dest_service, &mut body);
    sdnv::encode(src_node, &mut body);
    sdnv::encode(src_service, &mut body);
    sdnv::encode(block.creation_time, &mut body);
    sdnv::encode(block.sequence, &mut body);
    sdnv::encode(block.lifetime_secs, &mut body);
    if let (Some(offset), Some(length)) = (block.fragment_offset, block.fragment_length) {
        sdnv::encode(offset, &mut body);
        sdnv::encode(length, &mut body);
    }

    let mut out = Vec::with_capacity(1 + body.len() + 2);
    out.push(VERSION_BYTE);
    out.extend_from_slice(&body);
    let checksum = crc::crc16(&out);
    out.extend_from_slice(&checksum.to_le_bytes());
    out
}

pub fn decode(bytes: &[u8]) -> Result<PrimaryBlock, StorageError> {
    if bytes.len() < 3 || bytes[0] != VERSION_BYTE {
        return Err(StorageError::MalformedBundle("not a legacy primary block".into()));
    }
    let (body, trailer) = bytes.split_at(bytes.len() - 2);
    let expected = u16::from_le_bytes([trailer[0], trailer[1]]);
    let crc_valid = crc::crc16(body) == expected;

    let mut pos = 1usize;
    let flags = *body
        .get(pos)
        .ok_or_else(|| StorageError::MalformedBundle("truncated flags byte".into()))?;
    pos += 1;

    let is_admin_record = flags & FLAG_ADMIN_RECORD != 0;
    let custody_requested = flags & FLAG_CUSTODY_REQUESTED != 0;
    let is_fragment = flags & FLAG_IS_FRAGMENT != 0;
    let priority = Priority::from_index(((flags >> PRIORITY_SHIFT) & 0x03) as usize)
        .ok_or_else(|| StorageError::MalformedBundle("invalid priority field".into()))?;

    let mut next = |pos: &mut usize| -> Result<u64, StorageError> {
        let (v, consumed) = sdnv::decode(body, *pos)
            .ok_or_else(|| StorageError::MalformedBundle("truncated SDNV field".into()))?;
        *pos += consumed;
        Ok(v)
    };

    let dest_node = next(&mut pos)?;
    let dest_service = next(&mut pos)?;
    let src_node = next(&mut pos)?;
    let src_service = next(&mut pos)?;
    let creation_time = next(&mut pos)?;
    let sequence = next(&mut pos)?;
    let lifetime_secs = next(&mut pos)?;

    let (fragment_offset, fragment_length) = if is_fragment {
        (Some(next(&mut pos)?), Some(next(&mut pos)?))
    } else {
        (None, None)
    };

    Ok(PrimaryBlock {
        dest_eid: eid::format(dest_node, dest_service),
        src_eid: eid::format(src_node, src_service),
        custody_requested,
        is_admin_record,
        creation_time,
        sequence,
        lifetime_secs,
        fragment_offset,
        fragment_length,
        priority,
        wire_version: WireVersion::Legacy,
        crc_valid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PrimaryBlock {
        PrimaryBlock {
            dest_eid: "ipn:2.1".into(),
            src_eid: "ipn:5.1".into(),
            custody_requested: true,
            is_admin_record: false,
            creation_time: 1_000,
            sequence: 7,
            lifetime_secs: 60,
            fragment_offset: None,
            fragment_length: None,
            priority: Priority::Expedited,
            wire_version: WireVersion::Legacy,
            crc_valid: true,
        }
    }

    #[test]
    fn round_trips_non_fragment() {
        let block = sample();
        let bytes = encode(&block);
        let decoded = decode(&bytes).unwrap();
        assert!(decoded.crc_valid);
        assert_eq!(decoded.dest_eid, block.dest_eid);
        assert_eq!(decoded.src_eid, block.src_eid);
        assert_eq!(decoded.custody_requested, block.custody_requested);
        assert_eq!(decoded.priority, block.priority);
        assert_eq!(decoded.creation_time, block.creation_time);
    }

    #[test]
    fn round_trips_fragment() {
        let mut block = sample();
        block.fragment_offset = Some(4096);
        block.fragment_length = Some(2048);
        let bytes = encode(&block);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.fragment_offset, Some(4096));
        assert_eq!(decoded.fragment_length, Some(2048));
    }

    #[test]
    fn corrupted_bytes_fail_crc_but_still_decode() {
        let block = sample();
        let mut bytes = encode(&block);
        let last = bytes.len() - 3;
        bytes[last] ^= 0xFF;
        let decoded = decode(&bytes).unwrap();
        assert!(!decoded.crc_valid);
    }
}
