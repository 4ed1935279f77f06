//! Workflow throughput benchmark
//!
//! Tests the target scenario: thousands of parallel workflow runs, each
//! walking a chain of many sequential lambda steps.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tokio::sync::Semaphore;

use taskforge::ledger::InMemoryLedger;
use taskforge::registry::HandlerRegistry;
use taskforge::workflow::{Step, WorkflowCallbacks, WorkflowContext, WorkflowDefinition, WorkflowRunner};
use taskforge::{Dispatcher, DispatcherConfig};

/// Build a linear chain of `steps` lambda steps, each copying the
/// previous step's output forward.
fn build_definition(steps: u64) -> WorkflowDefinition {
    let chain: Vec<Step> = (0..steps).map(|i| Step::lambda(format!("step-{i}"), "advance")).collect();
    WorkflowDefinition::new("benchmark_workflow", 1, chain)
}

fn build_callbacks() -> Arc<WorkflowCallbacks> {
    let mut callbacks = WorkflowCallbacks::new();
    callbacks.register_lambda("advance", Arc::new(|ctx: &WorkflowContext| Ok(ctx.variable("seed").cloned().unwrap_or(serde_json::json!(0)))));
    Arc::new(callbacks)
}

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

async fn run_workflow_test(name: &str, workflow_count: usize, steps_per_workflow: u64, concurrency: usize, simulate_execution: bool) {
    let total_steps = workflow_count as u64 * steps_per_workflow;
    println!("\nRunning: {name}");
    println!("   Workflows: {workflow_count}, Steps/workflow: {steps_per_workflow}, Concurrency: {concurrency}");
    println!("   Total steps: {total_steps}");

    let definition = Arc::new(build_definition(steps_per_workflow));
    let callbacks = build_callbacks();

    let registry = Arc::new(HandlerRegistry::new());
    let ledger: Arc<dyn taskforge::ledger::ExecutionLedger> = Arc::new(InMemoryLedger::new());
    let dispatcher = Arc::new(Dispatcher::new(ledger, registry, DispatcherConfig::new("memory")));
    let runner = Arc::new(WorkflowRunner::new(dispatcher, callbacks));

    let end_to_end = Arc::new(LatencyRecorder::default());
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let completed = Arc::new(AtomicU64::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();

    for i in 0..workflow_count {
        let runner = runner.clone();
        let definition = definition.clone();
        let semaphore = semaphore.clone();
        let end_to_end = end_to_end.clone();
        let completed = completed.clone();

        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire().await.unwrap();
            let enqueue_time = Instant::now();

            let mut ctx = WorkflowContext::new(format!("wf-{i}"), serde_json::json!({}));
            ctx.set_variable("seed", serde_json::json!(i));

            if simulate_execution {
                let micros = 1000 + (rand::random::<u64>() % 9000);
                tokio::time::sleep(Duration::from_micros(micros)).await;
            }

            runner.run(&definition, &mut ctx).await.unwrap();
            end_to_end.record(enqueue_time.elapsed());
            completed.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }
    let elapsed = start.elapsed();

    let wf_throughput = workflow_count as f64 / elapsed.as_secs_f64();
    let step_throughput = total_steps as f64 / elapsed.as_secs_f64();

    println!("Completed {workflow_count} workflows in {:.2}s", elapsed.as_secs_f64());
    println!("   Step throughput:     {step_throughput:.1} steps/sec");
    println!("   Workflow throughput: {wf_throughput:.1} workflows/sec");
    println!(
        "   End-to-End:          P50={:.2}ms P99={:.2}ms",
        end_to_end.percentile(0.50).as_secs_f64() * 1000.0,
        end_to_end.percentile(0.99).as_secs_f64() * 1000.0
    );
}

fn main() {
    let rt = Runtime::new().unwrap();

    println!("===============================================================");
    println!("         Workflow Throughput Benchmark");
    println!("===============================================================");
    println!("\nThis benchmark simulates the target scenario:");
    println!("  - Thousands of parallel workflow runs");
    println!("  - Each workflow runs a chain of many sequential lambda steps");

    rt.block_on(run_workflow_test("small_10wf_10steps", 10, 10, 10, false));
    rt.block_on(run_workflow_test("medium_100wf_50steps", 100, 50, 50, false));
    rt.block_on(run_workflow_test("target_1000wf_100steps", 1000, 100, 100, false));
    rt.block_on(run_workflow_test("target_1000wf_100steps_exec", 1000, 100, 100, true));
    rt.block_on(run_workflow_test("parallel_5000wf_20steps", 5000, 20, 200, false));
    rt.block_on(run_workflow_test("deep_100wf_500steps", 100, 500, 50, false));

    println!("\n===============================================================");
    println!("Done.");
}
