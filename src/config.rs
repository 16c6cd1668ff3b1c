// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 dtn-storage-core contributors
//
// Typed configuration record. This crate never reads a config file itself —
// callers parse JSON (or build this by hand) and hand it in. `validate`
// checks the invariants the rest of the crate assumes hold.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{ResourceKind, StorageError};

/// Minimum segment size: reserved prefix (12 bytes) plus at least one
/// payload byte, rounded up to the 16-byte alignment `validate` requires.
const MIN_SEGMENT_SIZE: u32 = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub max_bundle_size_bytes: u64,
    pub max_ingress_wait_on_egress_ms: u64,
    pub zmq_max_messages_per_path: usize,
    pub storage_config: StorageConfig,
    pub segment_size_bytes: u32,
    pub num_storage_threads: usize,
    /// Test-harness-only admission mode: when a cut-through attempt times
    /// out waiting for egress to drain, drop the bundle instead of falling
    /// back to storage. Not a recognized option in the external-interfaces
    /// contract's config record; defaults to `false` so production
    /// admission always has storage as the fallback path.
    pub cut_through_only: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_bundle_size_bytes: 64 * 1024 * 1024,
            max_ingress_wait_on_egress_ms: 2000,
            zmq_max_messages_per_path: 5,
            storage_config: StorageConfig::default(),
            segment_size_bytes: 4096,
            num_storage_threads: 4,
            cut_through_only: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    pub total_capacity_bytes: u64,
    pub disks: Vec<DiskConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskConfig {
    pub name: String,
    pub path: PathBuf,
}

impl Config {
    /// Checks the invariants the storage manager and disk writer pool rely
    /// on. Does not touch the filesystem — `disks[].path` existing is the
    /// manager's concern at construction time.
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.storage_config.disks.is_empty() {
            return Err(StorageError::MalformedBundle(
                "storage_config.disks must contain at least one disk".into(),
            ));
        }
        if self.segment_size_bytes < MIN_SEGMENT_SIZE || self.segment_size_bytes % 16 != 0 {
            return Err(StorageError::MalformedBundle(format!(
                "segment_size_bytes must be a multiple of 16 and at least {MIN_SEGMENT_SIZE}"
            )));
        }
        let k = self.storage_config.disks.len() as u64;
        if self.storage_config.total_capacity_bytes % k != 0 {
            return Err(StorageError::MalformedBundle(
                "total_capacity_bytes must divide evenly across disks".into(),
            ));
        }
        if self.num_storage_threads == 0 {
            return Err(StorageError::ResourceExhausted(ResourceKind::Segments));
        }
        Ok(())
    }

    /// Payload bytes available per segment after the 12-byte reserved prefix.
    pub fn payload_per_segment(&self) -> u32 {
        self.segment_size_bytes - crate::storage::segment::RESERVED_PREFIX_LEN as u32
    }

    /// Number of segments each backing file must hold.
    pub fn segments_per_disk(&self) -> u64 {
        let k = self.storage_config.disks.len() as u64;
        let total_segments =
            self.storage_config.total_capacity_bytes / self.segment_size_bytes as u64;
        (total_segments + k - 1) / k
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config {
            storage_config: StorageConfig {
                total_capacity_bytes: 4096 * 1024,
                disks: vec![DiskConfig {
                    name: "a".into(),
                    path: "/tmp/a".into(),
                }],
            },
            ..Config::default()
        }
    }

    #[test]
    fn default_config_is_valid_once_a_disk_is_added() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn rejects_empty_disk_list() {
        let mut c = sample();
        c.storage_config.disks.clear();
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_misaligned_segment_size() {
        let mut c = sample();
        c.segment_size_bytes = 4097;
        assert!(c.validate().is_err());
    }
}
