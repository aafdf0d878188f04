// Cold-start benchmark for the execution engine
// Measures end-to-end latency of small requests: worker spawn, source run,
// test evaluation and reap.
// Target: p50 < 50ms, p95 < 100ms for trivial submissions

use snakebox::{Engine, ExecutionRequest, SandboxConfig, TestCase};
use std::path::PathBuf;
use std::time::{Duration, Instant};

const ITERATIONS: usize = 100;
const WARMUP_ITERATIONS: usize = 10;

/// Latency percentiles
struct LatencyStats {
    p50: Duration,
    p95: Duration,
    p99: Duration,
    min: Duration,
    max: Duration,
    mean: Duration,
}

impl LatencyStats {
    fn from_samples(mut samples: Vec<Duration>) -> Self {
        samples.sort();
        let len = samples.len();

        let p50_idx = (len as f64 * 0.50) as usize;
        let p95_idx = (len as f64 * 0.95) as usize;
        let p99_idx = (len as f64 * 0.99) as usize;

        let sum: Duration = samples.iter().sum();
        let mean = sum / len as u32;

        Self {
            p50: samples[p50_idx],
            p95: samples[p95_idx],
            p99: samples[p99_idx],
            min: samples[0],
            max: samples[len - 1],
            mean,
        }
    }

    fn print(&self, label: &str) {
        println!("\n{}", label);
        println!("  p50: {:?}", self.p50);
        println!("  p95: {:?}", self.p95);
        println!("  p99: {:?}", self.p99);
        println!("  min: {:?}", self.min);
        println!("  max: {:?}", self.max);
        println!("  mean: {:?}", self.mean);
    }
}

struct BenchmarkResult {
    scenario: String,
    stats: LatencyStats,
    passed: bool,
    reason: Option<String>,
}

impl BenchmarkResult {
    fn print(&self) {
        println!("\n=== {} ===", self.scenario);
        self.stats.print("Latency");

        match &self.reason {
            None => println!("PASS"),
            Some(reason) => println!("FAIL: {}", reason),
        }
    }
}

fn measure(
    engine: &Engine,
    scenario: &str,
    request: &ExecutionRequest,
    p50_budget: Duration,
    p95_budget: Duration,
) -> BenchmarkResult {
    for _ in 0..WARMUP_ITERATIONS {
        let _ = engine.execute(request);
    }

    let mut samples = Vec::with_capacity(ITERATIONS);
    for _ in 0..ITERATIONS {
        let start = Instant::now();
        let _ = engine.execute(request);
        samples.push(start.elapsed());
    }

    let stats = LatencyStats::from_samples(samples);
    let passed = stats.p50 < p50_budget && stats.p95 < p95_budget;
    let reason = if !passed {
        Some(format!(
            "p50={:?} (target <{:?}), p95={:?} (target <{:?})",
            stats.p50, p50_budget, stats.p95, p95_budget
        ))
    } else {
        None
    };

    BenchmarkResult {
        scenario: scenario.to_string(),
        stats,
        passed,
        reason,
    }
}

fn main() {
    println!("=== snakebox Cold-Start Benchmark ===");
    println!("Iterations: {} (after {} warmup)", ITERATIONS, WARMUP_ITERATIONS);

    let config = SandboxConfig {
        worker_program: Some(PathBuf::from(env!("CARGO_BIN_EXE_snakebox"))),
        ..SandboxConfig::default()
    };
    let engine = match Engine::new(config) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("cannot build engine: {}", e);
            std::process::exit(1);
        }
    };

    let hello = ExecutionRequest::new("print('Hello, World!')", vec![]);
    let graded = ExecutionRequest::new(
        "def fibonacci(n):\n    seq = [0, 1]\n    while len(seq) < n:\n        seq.append(seq[-1] + seq[-2])\n    return seq[:n]\n",
        vec![
            TestCase::new("fibonacci(5)", "[0, 1, 1, 2, 3]"),
            TestCase::new("fibonacci(10)[-1]", "34"),
            TestCase::new("len(fibonacci(30))", "30"),
        ],
    );

    let results = vec![
        measure(
            &engine,
            "Hello World",
            &hello,
            Duration::from_millis(50),
            Duration::from_millis(100),
        ),
        measure(
            &engine,
            "Graded Fibonacci",
            &graded,
            Duration::from_millis(60),
            Duration::from_millis(120),
        ),
    ];

    for result in &results {
        result.print();
    }

    let passed_count = results.iter().filter(|r| r.passed).count();
    let total_count = results.len();

    println!("\n=== Summary ===");
    println!("{}/{} scenarios passed", passed_count, total_count);

    if passed_count == total_count {
        println!("All cold-start budgets met");
        std::process::exit(0);
    } else {
        println!("Some cold-start budgets exceeded");
        std::process::exit(1);
    }
}
