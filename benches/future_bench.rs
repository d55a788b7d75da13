//! Future Registry Performance Benchmarks
//!
//! Measures latency of future allocation, completion and awaiting, and of
//! database transactions built on top of them, under various concurrency
//! levels. Everything runs against the in-process backend, so the numbers
//! isolate SDK overhead from network time.
//!
//! ## Benchmark Structure
//! 1. Future operations (alloc + complete + await, cross-task completion)
//! 2. Transaction operations (disjoint locations, one contended location)
//!
//! ## Concurrency Levels
//! Tests with 1, 2, 4, 8, 16, 32, 64 concurrent operations
//!
//! ## Running Benchmarks
//! ```bash
//! cargo bench --bench future_bench
//!
//! # Specific benchmark
//! cargo bench --bench future_bench -- transactions/contended/8
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use futures::future::join_all;
use nimbus_sdk::database::{Database, TransactionOptions, TransactionResult};
use nimbus_sdk::{App, AppOptions, FutureRegistry};
use once_cell::sync::Lazy;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

/// Shared runtime for all benchmarks
static RUNTIME: Lazy<Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to create runtime")
});

/// Database over the in-process backend, shared by the transaction benchmarks
static DATABASE: Lazy<Database> = Lazy::new(|| {
    RUNTIME.block_on(async {
        let app = App::create(AppOptions {
            api_key: "bench-api-key".to_string(),
            project_id: "bench".to_string(),
            app_name: Some("bench".to_string()),
            ..AppOptions::default()
        })
        .await
        .expect("Failed to create app");

        Database::get_instance(&app)
            .await
            .expect("Failed to get database")
    })
});

/// Concurrency levels to test
const CONCURRENCY_LEVELS: &[usize] = &[1, 2, 4, 8, 16, 32, 64];

// ============================================================================
// Future Benchmarks
// ============================================================================

fn bench_future_roundtrip(c: &mut Criterion) {
    let registry = Arc::new(FutureRegistry::new());

    let mut group = c.benchmark_group("futures");
    for &concurrency in CONCURRENCY_LEVELS {
        group.throughput(Throughput::Elements(concurrency as u64));
        group.bench_with_input(
            BenchmarkId::new("roundtrip", concurrency),
            &concurrency,
            |b, &concurrency| {
                b.to_async(&*RUNTIME).iter(|| {
                    let registry = Arc::clone(&registry);
                    async move {
                        let futures: Vec<_> = (0..concurrency)
                            .map(|i| {
                                let future = registry.alloc::<usize>();
                                registry.complete(future.handle(), i);
                                future
                            })
                            .collect();

                        for future in futures {
                            black_box(future.await.expect("future failed"));
                        }
                    }
                });
            },
        );
    }

    group.finish();
}

fn bench_future_cross_task_completion(c: &mut Criterion) {
    let registry = Arc::new(FutureRegistry::new());

    let mut group = c.benchmark_group("futures");
    for &concurrency in CONCURRENCY_LEVELS {
        group.throughput(Throughput::Elements(concurrency as u64));
        group.bench_with_input(
            BenchmarkId::new("cross_task", concurrency),
            &concurrency,
            |b, &concurrency| {
                b.to_async(&*RUNTIME).iter(|| {
                    let registry = Arc::clone(&registry);
                    async move {
                        let futures: Vec<_> = (0..concurrency)
                            .map(|i| {
                                let future = registry.alloc::<usize>();
                                let handle = future.handle();
                                let completer = Arc::clone(&registry);
                                tokio::spawn(async move {
                                    completer.complete(handle, i);
                                });
                                async move { future.await.expect("future failed") }
                            })
                            .collect();

                        black_box(join_all(futures).await)
                    }
                });
            },
        );
    }

    group.finish();
}

// ============================================================================
// Transaction Benchmarks
// ============================================================================

fn bench_transaction_disjoint(c: &mut Criterion) {
    Lazy::force(&DATABASE);

    let mut group = c.benchmark_group("transactions");
    group.measurement_time(Duration::from_secs(10));

    for &concurrency in CONCURRENCY_LEVELS {
        group.throughput(Throughput::Elements(concurrency as u64));
        group.bench_with_input(
            BenchmarkId::new("disjoint", concurrency),
            &concurrency,
            |b, &concurrency| {
                b.to_async(&*RUNTIME).iter(|| async move {
                    let futures: Vec<_> = (0..concurrency)
                        .map(|i| {
                            DATABASE
                                .reference()
                                .child(&format!("disjoint/slot{}", i))
                                .run_transaction(|data| {
                                    let next = data.value().as_i64().unwrap_or(0) + 1;
                                    data.set_value(next);
                                    TransactionResult::Success
                                })
                        })
                        .collect();

                    for future in futures {
                        black_box(future.await.expect("transaction failed"));
                    }
                });
            },
        );
    }

    group.finish();
}

fn bench_transaction_contended(c: &mut Criterion) {
    Lazy::force(&DATABASE);

    let mut group = c.benchmark_group("transactions");
    group.measurement_time(Duration::from_secs(10));

    for &concurrency in CONCURRENCY_LEVELS {
        group.throughput(Throughput::Elements(concurrency as u64));
        group.bench_with_input(
            BenchmarkId::new("contended", concurrency),
            &concurrency,
            |b, &concurrency| {
                b.to_async(&*RUNTIME).iter(|| async move {
                    let counter = DATABASE.reference().child("contended/counter");
                    let options = TransactionOptions {
                        // Conflicts are the point here; never give up.
                        max_attempts: usize::MAX,
                        retry_jitter: Duration::ZERO,
                    };

                    let futures: Vec<_> = (0..concurrency)
                        .map(|_| {
                            counter.run_transaction_with_options(
                                |data| {
                                    let next = data.value().as_i64().unwrap_or(0) + 1;
                                    data.set_value(next);
                                    TransactionResult::Success
                                },
                                options.clone(),
                            )
                        })
                        .collect();

                    for future in futures {
                        black_box(future.await.expect("transaction failed"));
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    future_benches,
    bench_future_roundtrip,
    bench_future_cross_task_completion
);
criterion_group!(
    transaction_benches,
    bench_transaction_disjoint,
    bench_transaction_contended
);
criterion_main!(future_benches, transaction_benches);
