// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 dtn-storage-core contributors
//
// `ipn:<node>.<service>` endpoint-id parsing, shared by both primary-block
// codecs. Neither codec needs a full URI scheme — every endpoint this crate
// handles is the DTN "ipn" scheme used throughout the spec's examples.

use crate::error::StorageError;

pub fn parse(eid: &str) -> Result<(u64, u64), StorageError> {
    let rest = eid
        .strip_prefix("ipn:")
        .ok_or_else(|| StorageError::MalformedBundle(format!("unsupported eid scheme: {eid}")))?;
    let (node, service) = rest
        .split_once('.')
        .ok_or_else(|| StorageError::MalformedBundle(format!("malformed ipn eid: {eid}")))?;
    let node: u64 = node
        .parse()
        .map_err(|_| StorageError::MalformedBundle(format!("malformed ipn node: {eid}")))?;
    let service: u64 = service
        .parse()
        .map_err(|_| StorageError::MalformedBundle(format!("malformed ipn service: {eid}")))?;
    Ok((node, service))
}

pub fn format(node: u64, service: u64) -> String {
    format!("ipn:{node}.{service}")
}
