//! Dispatch throughput benchmark
//!
//! Benchmarks the critical path: submit -> route -> execute -> complete.
//! This is the core scheduling performance metric for the dispatcher.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

use taskforge::handler::{Handler, HandlerContext};
use taskforge::ledger::InMemoryLedger;
use taskforge::model::{TriggerSource, WorkKind, WorkSpec};
use taskforge::registry::HandlerRegistry;
use taskforge::{Dispatcher, DispatcherConfig};

struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn handle(&self, _ctx: &HandlerContext, params: serde_json::Value) -> Result<serde_json::Value, taskforge::TaskforgeError> {
        Ok(params)
    }
}

fn build_dispatcher() -> Arc<Dispatcher> {
    let mut registry = HandlerRegistry::new();
    registry.register(WorkKind::Task, "echo", Arc::new(EchoHandler)).unwrap();
    let registry = Arc::new(registry);
    let ledger: Arc<dyn taskforge::ledger::ExecutionLedger> = Arc::new(InMemoryLedger::new());
    let executor = Arc::new(taskforge::executor::MemoryExecutor::new("memory", registry.clone(), ledger.clone()));
    Arc::new(Dispatcher::new(ledger, registry, DispatcherConfig::new("memory")).with_executor(executor))
}

/// Benchmark single-threaded submit-to-completion latency.
fn bench_submit_single(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("dispatch_throughput/single");
    group.throughput(Throughput::Elements(1));

    for batch_size in [1, 5, 10] {
        group.bench_with_input(BenchmarkId::new("batch", batch_size), &batch_size, |b, &batch_size| {
            b.to_async(&rt).iter_custom(|iters| async move {
                let dispatcher = build_dispatcher();
                let run_count = (iters * batch_size as u64).max(100);

                let start = Instant::now();
                for i in 0..run_count {
                    let spec = WorkSpec::new(WorkKind::Task, "echo", TriggerSource::Api).with_params(serde_json::json!({"i": i}));
                    let run_id = dispatcher.submit(spec).await.unwrap();
                    dispatcher.wait(&run_id, Duration::from_secs(5)).await.unwrap();
                }
                start.elapsed()
            });
        });
    }

    group.finish();
}

/// Benchmark concurrent submission contention.
fn bench_submit_concurrent(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("dispatch_throughput/concurrent");
    group.sample_size(20);

    for submitters in [2, 4, 8] {
        let run_count = 2000u64;
        group.throughput(Throughput::Elements(run_count));
        group.bench_with_input(BenchmarkId::new("submitters", submitters), &submitters, |b, &submitters| {
            b.to_async(&rt).iter(|| async {
                let dispatcher = build_dispatcher();
                let completed = Arc::new(AtomicU64::new(0));
                let per_submitter = run_count / submitters as u64;

                let mut handles = Vec::new();
                for _ in 0..submitters {
                    let dispatcher = dispatcher.clone();
                    let completed = completed.clone();
                    handles.push(tokio::spawn(async move {
                        for i in 0..per_submitter {
                            let spec = WorkSpec::new(WorkKind::Task, "echo", TriggerSource::Api).with_params(serde_json::json!({"i": i}));
                            let run_id = dispatcher.submit(spec).await.unwrap();
                            dispatcher.wait(&run_id, Duration::from_secs(5)).await.unwrap();
                            completed.fetch_add(1, Ordering::Relaxed);
                        }
                    }));
                }

                for handle in handles {
                    handle.await.unwrap();
                }
            });
        });
    }

    group.finish();
}

/// Benchmark submit (enqueue) latency alone, without waiting for completion.
fn bench_submit_latency(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("dispatch_throughput/submit");
    group.throughput(Throughput::Elements(1));

    group.bench_function("single", |b| {
        b.to_async(&rt).iter_custom(|iters| async move {
            let dispatcher = build_dispatcher();

            let start = Instant::now();
            for i in 0..iters {
                let spec = WorkSpec::new(WorkKind::Task, "echo", TriggerSource::Api).with_params(serde_json::json!({"i": i}));
                dispatcher.submit(spec).await.unwrap();
            }
            start.elapsed()
        });
    });

    group.finish();
}

criterion_group!(benches, bench_submit_single, bench_submit_concurrent, bench_submit_latency);
criterion_main!(benches);
