// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 dtn-storage-core contributors
//
// Allocator throughput under the allocate/free churn the storage manager's
// put/remove path drives it with.

use criterion::{criterion_group, criterion_main, Criterion};
use dtn_storage_core::SegmentAllocator;

fn allocate_free_single(c: &mut Criterion) {
    let allocator = SegmentAllocator::new(1 << 20);
    c.bench_function("allocate_then_free_single_segment", |b| {
        b.iter(|| {
            let id = allocator.allocate().unwrap();
            allocator.free(id);
        })
    });
}

fn allocate_free_bulk(c: &mut Criterion) {
    let allocator = SegmentAllocator::new(1 << 20);
    c.bench_function("allocate_then_free_bulk_64_segments", |b| {
        b.iter(|| {
            let ids = allocator.allocate_bulk(64).unwrap();
            allocator.free_bulk(&ids);
        })
    });
}

fn allocate_to_exhaustion_then_drain(c: &mut Criterion) {
    c.bench_function("allocate_16384_segments_sequentially", |b| {
        b.iter(|| {
            let allocator = SegmentAllocator::new(16 * 1024);
            let mut ids = Vec::with_capacity(16 * 1024);
            while let Some(id) = allocator.allocate() {
                ids.push(id);
            }
            ids
        })
    });
}

criterion_group!(benches, allocate_free_single, allocate_free_bulk, allocate_to_exhaustion_then_drain);
criterion_main!(benches);
