// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 dtn-storage-core contributors
//
// Structured "modern" primary block: every field is length-prefixed
// (u8 tag + u64 length-or-value, little-endian) rather than SDNV-packed.
// Stands in for the CBOR-based newer bundle-protocol primary block without
// pulling in a full CBOR implementation — this crate only needs its own
// encoder to round-trip with its own decoder, and a CRC-32C trailer plays
// the same integrity role the legacy form's CRC-16 does.

use byteorder::{ByteOrder, LittleEndian};

use super::{crc, eid, Priority, PrimaryBlock, WireVersion};
use crate::error::StorageError;

const VERSION_TAG: u8 = 0x07;
const FLAG_ADMIN_RECORD: u8 = 0x01;
const FLAG_CUSTODY_REQUESTED: u8 = 0x02;
const FLAG_IS_FRAGMENT: u8 = 0x04;

fn put_u64(out: &mut Vec<u8>, v: u64) {
    let mut buf = [0u8; 8];
    LittleEndian::write_u64(&mut buf, v);
    out.extend_from_slice(&buf);
}

fn put_string(out: &mut Vec<u8>, s: &str) {
    put_u64(out, s.len() as u64);
    out.extend_from_slice(s.as_bytes());
}

fn take_u64(buf: &[u8], pos: &mut usize) -> Result<u64, StorageError> {
    let end = *pos + 8;
    let slice = buf
        .get(*pos..end)
        .ok_or_else(|| StorageError::MalformedBundle("truncated u64 field".into()))?;
    let v = LittleEndian::read_u64(slice);
    *pos = end;
    Ok(v)
}

fn take_string(buf: &[u8], pos: &mut usize) -> Result<String, StorageError> {
    let len = take_u64(buf, pos)? as usize;
    let end = *pos + len;
    let slice = buf
        .get(*pos..end)
        .ok_or_else(|| StorageError::MalformedBundle("truncated string field".into()))?;
    *pos = end;
    String::from_utf8(slice.to_vec())
        .map_err(|_| StorageError::MalformedBundle("invalid utf-8 in eid field".into()))
}

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
    body.push(flags);
    body.push(block.priority.index() as u8);
    put_string(&mut body, &block.dest_eid);
    put_string(&mut body, &block.src_eid);
    put_u64(&mut body, block.creation_time);
    put_u64(&mut body, block.sequence);
    put_u64(&mut body, block.lifetime_secs);
    put_u64(&mut body, block.fragment_offset.unwrap_or(0));
    put_u64(&mut body, block.fragment_length.unwrap_or(0));

    let mut out = Vec::with_capacity(1 + body.len() + 4);
    out.push(VERSION_TAG);
    out.extend_from_slice(&body);
    let checksum = crc::crc32c(&out);
    out.extend_from_slice(&checksum.to_le_bytes());
    out
}

pub fn decode(bytes: &[u8]) -> Result<PrimaryBlock, StorageError> {
    if bytes.len() < 5 || bytes[0] != VERSION_TAG {
        return Err(StorageError::MalformedBundle("not a modern primary block".into()));
    }
    let (body, trailer) = bytes.split_at(bytes.len() - 4);
    let expected = LittleEndian::read_u32(trailer);
    let crc_valid = crc::crc32c(body) == expected;

    let mut pos = 1usize;
    let flags = *body
        .get(pos)
        .ok_or_else(|| StorageError::MalformedBundle("truncated flags byte".into()))?;
    pos += 1;
    let priority_byte = *body
        .get(pos)
        .ok_or_else(|| StorageError::MalformedBundle("truncated priority byte".into()))?;
    pos += 1;
    let priority = Priority::from_index(priority_byte as usize)
        .ok_or_else(|| StorageError::MalformedBundle("invalid priority field".into()))?;

    let dest_eid = take_string(body, &mut pos)?;
    let src_eid = take_string(body, &mut pos)?;
    let creation_time = take_u64(body, &mut pos)?;
    let sequence = take_u64(body, &mut pos)?;
    let lifetime_secs = take_u64(body, &mut pos)?;
    let fragment_offset_raw = take_u64(body, &mut pos)?;
    let fragment_length_raw = take_u64(body, &mut pos)?;

    let is_fragment = flags & FLAG_IS_FRAGMENT != 0;
    let (fragment_offset, fragment_length) = if is_fragment {
        (Some(fragment_offset_raw), Some(fragment_length_raw))
    } else {
        (None, None)
    };

    // Validate the eid scheme eagerly so malformed bundles are caught at
    // decode time rather than surfacing later as a routing failure.
    eid::parse(&dest_eid)?;
    eid::parse(&src_eid)?;

    Ok(PrimaryBlock {
        dest_eid,
        src_eid,
        custody_requested: flags & FLAG_CUSTODY_REQUESTED != 0,
        is_admin_record: flags & FLAG_ADMIN_RECORD != 0,
        creation_time,
        sequence,
        lifetime_secs,
        fragment_offset,
        fragment_length,
        priority,
        wire_version: WireVersion::Modern,
        crc_valid,
    })
}
