//! Concurrent workers load test
//!
//! Exercises the dispatcher under realistic load with many concurrent
//! submitters, reporting schedule-to-start and end-to-end latency
//! percentiles the way a load-testing tool would.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tokio::sync::Semaphore;

use taskforge::handler::{Handler, HandlerContext};
use taskforge::ledger::InMemoryLedger;
use taskforge::model::{TriggerSource, WorkKind, WorkSpec};
use taskforge::registry::HandlerRegistry;
use taskforge::{Dispatcher, DispatcherConfig};

/// Handler that optionally sleeps to simulate real work, capped so the
/// benchmark stays fast.
struct SimulatedHandler {
    simulate_execution: bool,
}

#[async_trait]
impl Handler for SimulatedHandler {
    async fn handle(&self, _ctx: &HandlerContext, params: serde_json::Value) -> Result<serde_json::Value, taskforge::TaskforgeError> {
        if self.simulate_execution {
            let micros = 500 + (rand::random::<u64>() % 4_500);
            tokio::time::sleep(Duration::from_micros(micros)).await;
        }
        Ok(params)
    }
}

/// Latency samples collected during a run, reported as percentiles.
#[derive(Default)]
struct LatencyRecorder {
    samples: Mutex<Vec<Duration>>,
}

impl LatencyRecorder {
    fn record(&self, d: Duration) {
        self.samples.lock().push(d);
    }

    fn percentile(&self, p: f64) -> Duration {
        let mut samples = self.samples.lock().clone();
        if samples.is_empty() {
            return Duration::ZERO;
        }
        samples.sort();
        let idx = ((samples.len() as f64 - 1.0) * p).round() as usize;
        samples[idx]
    }
}

async fn run_scenario(name: &str, run_count: u64, submitters: usize, simulate_execution: bool) {
    println!("\nRunning: {name}");
    println!("   Runs: {run_count}, Submitters: {submitters}, Simulate execution: {simulate_execution}");

    let mut registry = HandlerRegistry::new();
    registry.register(WorkKind::Task, "benchmark_task", Arc::new(SimulatedHandler { simulate_execution })).unwrap();
    let registry = Arc::new(registry);
    let ledger: Arc<dyn taskforge::ledger::ExecutionLedger> = Arc::new(InMemoryLedger::new());
    let executor = Arc::new(taskforge::executor::MemoryExecutor::new("memory", registry.clone(), ledger.clone()));
    let dispatcher = Arc::new(Dispatcher::new(ledger, registry, DispatcherConfig::new("memory")).with_executor(executor));

    let schedule_to_start = Arc::new(LatencyRecorder::default());
    let end_to_end = Arc::new(LatencyRecorder::default());
    let completed = Arc::new(AtomicU64::new(0));
    let semaphore = Arc::new(Semaphore::new(submitters));

    let run_start = Instant::now();
    let per_submitter = run_count / submitters as u64;
    let mut handles = Vec::new();

    for _ in 0..submitters {
        let dispatcher = dispatcher.clone();
        let schedule_to_start = schedule_to_start.clone();
        let end_to_end = end_to_end.clone();
        let completed = completed.clone();
        let semaphore = semaphore.clone();

        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire().await.unwrap();
            for i in 0..per_submitter {
                let enqueue_time = Instant::now();
                let spec = WorkSpec::new(WorkKind::Task, "benchmark_task", TriggerSource::Api).with_params(serde_json::json!({"i": i}));
                let run_id = dispatcher.submit(spec).await.unwrap();
                schedule_to_start.record(enqueue_time.elapsed());

                dispatcher.wait(&run_id, Duration::from_secs(10)).await.unwrap();
                end_to_end.record(enqueue_time.elapsed());
                completed.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }
    let run_time = run_start.elapsed();

    let throughput = completed.load(Ordering::Relaxed) as f64 / run_time.as_secs_f64();
    println!("Completed in {:.2}s", run_time.as_secs_f64());
    println!("   Throughput:        {throughput:.1} runs/sec");
    println!(
        "   Schedule-to-Start: P50={:.2}ms P99={:.2}ms",
        schedule_to_start.percentile(0.50).as_secs_f64() * 1000.0,
        schedule_to_start.percentile(0.99).as_secs_f64() * 1000.0
    );
    println!(
        "   End-to-End:        P50={:.2}ms P99={:.2}ms",
        end_to_end.percentile(0.50).as_secs_f64() * 1000.0,
        end_to_end.percentile(0.99).as_secs_f64() * 1000.0
    );
}

fn main() {
    let rt = Runtime::new().unwrap();

    println!("===============================================");
    println!("       Dispatcher Concurrent Load Test");
    println!("===============================================");

    rt.block_on(run_scenario("baseline_1_submitter", 2_000, 1, false));
    rt.block_on(run_scenario("scale_10_submitters", 2_000, 10, false));
    rt.block_on(run_scenario("scale_50_submitters", 2_000, 50, false));
    rt.block_on(run_scenario("realistic_10_submitters", 500, 10, true));
    rt.block_on(run_scenario("realistic_50_submitters", 500, 50, true));

    println!("\n===============================================");
    println!("Done.");
}
