// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 dtn-storage-core contributors
//
// Crate-wide error taxonomy. Variants line up with the error kinds handled
// by admission, storage, and the custody engine: malformed input and
// resource exhaustion are locally recovered by callers (cut-through falls
// back to store, store falls back to drop); `InvariantViolation` is not —
// it marks a programmer bug, not a runtime condition, and is never silently
// corrected.

use std::fmt;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("malformed bundle: {0}")]
    MalformedBundle(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(ResourceKind),

    #[error("disk I/O error on worker {worker}: {source}")]
    Io {
        worker: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("invariant violation: {0}")]
    InvariantViolation(&'static str),

    #[error("duplicate bundle: {0}")]
    DuplicateBundle(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Segments,
    PendingAcks,
    StorageQueue,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Segments => "segment pool",
            ResourceKind::PendingAcks => "pending-ack queue",
            ResourceKind::StorageQueue => "storage queue",
        };
        write!(f, "{s}")
    }
}

impl StorageError {
    /// True for errors that a caller should treat as "fall back to the next
    /// cheaper path" rather than abort the operation outright.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, StorageError::InvariantViolation(_))
    }
}
