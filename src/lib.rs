// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 dtn-storage-core contributors
//
// Persistent bundle storage engine and admission/dispatch machinery for a
// DTN node. The storage engine (`allocator` + `storage`) is the load-bearing
// part of this crate; `ingress`, `egress`, `custody`, and `contact` are the
// threads of control that keep it fed and drained, wired together over the
// in-process `bus`.

pub mod allocator;
pub mod bus;
pub mod config;
pub mod contact;
pub mod custody;
pub mod egress;
pub mod error;
pub mod ingress;
pub mod primary_block;
mod ring;
mod spin_lock;
pub mod storage;
pub mod waiter;

pub use allocator::SegmentAllocator;
pub use config::Config;
pub use custody::CustodyEngine;
pub use egress::EgressDispatch;
pub use error::{Result, StorageError};
pub use ingress::IngressAdmission;
pub use storage::{RestartStats, StorageManager};
pub use waiter::Waiter;
