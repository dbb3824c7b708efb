// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Benchmarks for the spool.
//!
//! Measures:
//! - Single push latency per flush mode
//! - Push, get and ack throughput at different event sizes
//! - Recovery time over a populated directory

use std::{hint::black_box, time::Duration};

use bytes::Bytes;
use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use spool::{CheckpointPolicy, FlushMode, Spool, SpoolBuilder};
use tempfile::TempDir;

/// Event sizes to benchmark (bytes)
const EVENT_SIZES: &[usize] = &[64, 256, 1024, 4096];

/// Number of events per throughput iteration
const EVENT_COUNT: usize = 10_000;

/// Events requested per get in the round-trip benchmark
const GET_BATCH: usize = 256;

fn create_spool(temp_dir: &TempDir, flush_mode: FlushMode) -> Spool {
    SpoolBuilder::new(temp_dir.path())
        .segment_size(64 * 1024 * 1024)
        .max_events(EVENT_COUNT * 2)
        .max_bytes(1024 * 1024 * 1024)
        .flush_mode(flush_mode)
        .checkpoint_policy(CheckpointPolicy::Interval(Duration::from_millis(100)))
        .build()
        .expect("Failed to open spool")
}

fn generate_event(size: usize) -> Bytes { Bytes::from(vec![0xABu8; size]) }

/// Pushes and acknowledges everything so the spool stays below its bound.
fn drain(spool: &Spool) {
    let consumer = spool.consumer();
    while let Some(batch) = consumer.try_get(GET_BATCH).unwrap() {
        batch.ack().unwrap();
    }
}

// =============================================================================
// Push Latency
// =============================================================================

fn bench_push_latency(c: &mut Criterion) {
    let modes = [
        ("async", FlushMode::Async),
        (
            "batch",
            FlushMode::Batch {
                bytes:    64 * 1024,
                interval: Duration::from_millis(10),
            },
        ),
        ("sync", FlushMode::Sync),
    ];

    for (name, mode) in modes {
        let mut group = c.benchmark_group(format!("push_latency_{name}"));
        if matches!(mode, FlushMode::Sync) {
            group.sample_size(20);
        }

        for &size in EVENT_SIZES {
            group.throughput(Throughput::Bytes(size as u64));
            group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
                let temp_dir = TempDir::new().unwrap();
                let spool = create_spool(&temp_dir, mode.clone());
                let producer = spool.producer().unwrap();
                let event = generate_event(size);
                let mut pushed = 0usize;

                b.iter(|| {
                    producer.push(black_box(event.clone())).unwrap();
                    pushed += 1;
                    if pushed % EVENT_COUNT == 0 {
                        drain(&spool);
                    }
                });

                drop(producer);
                spool.shutdown().unwrap();
            });
        }

        group.finish();
    }
}

// =============================================================================
// Round Trip Throughput
// =============================================================================

/// Push `EVENT_COUNT` events, then get and ack all of them.
fn bench_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("round_trip_async");
    group.sample_size(10);

    for &size in EVENT_SIZES {
        group.throughput(Throughput::Elements(EVENT_COUNT as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let temp_dir = TempDir::new().unwrap();
                    let spool = create_spool(&temp_dir, FlushMode::Async);
                    (temp_dir, spool, generate_event(size))
                },
                |(temp_dir, spool, event)| {
                    let producer = spool.producer().unwrap();
                    let consumer = spool.consumer();
                    for _ in 0..EVENT_COUNT {
                        producer.push(event.clone()).unwrap();
                    }
                    let mut received = 0;
                    while received < EVENT_COUNT {
                        let batch = consumer.get(GET_BATCH).unwrap();
                        received += batch.len();
                        black_box(batch.ack().unwrap());
                    }
                    drop(producer);
                    spool.shutdown().unwrap();
                    drop(temp_dir);
                },
                BatchSize::PerIteration,
            );
        });
    }

    group.finish();
}

// =============================================================================
// Recovery
// =============================================================================

/// Reopen a directory holding `EVENT_COUNT` unacknowledged events.
fn bench_recovery(c: &mut Criterion) {
    let mut group = c.benchmark_group("recovery");
    group.sample_size(10);
    group.throughput(Throughput::Elements(EVENT_COUNT as u64));

    let temp_dir = TempDir::new().unwrap();
    {
        let spool = create_spool(&temp_dir, FlushMode::Async);
        let producer = spool.producer().unwrap();
        let event = generate_event(256);
        for _ in 0..EVENT_COUNT {
            producer.push(event.clone()).unwrap();
        }
        drop(producer);
        spool.shutdown().unwrap();
    }

    group.bench_function("reopen_10k", |b| {
        b.iter(|| {
            let spool = create_spool(&temp_dir, FlushMode::Async);
            assert_eq!(spool.recovery_report().replayed, EVENT_COUNT);
            spool.shutdown().unwrap();
        });
    });

    group.finish();
}

criterion_group!(benches, bench_push_latency, bench_round_trip, bench_recovery);
criterion_main!(benches);
