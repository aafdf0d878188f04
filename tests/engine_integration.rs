//! Integration tests for the execution engine
//!
//! Every test here goes through a real worker process: the crate's own
//! binary re-executed in worker mode under rlimits.

use snakebox::{
    Engine, ExecutionRequest, ExecutionResult, ExecutionStatus, ResourceBudget, SandboxConfig,
    TestCase, TestStatus,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn config() -> SandboxConfig {
    SandboxConfig {
        worker_program: Some(PathBuf::from(env!("CARGO_BIN_EXE_snakebox"))),
        ..SandboxConfig::default()
    }
}

fn engine() -> Engine {
    Engine::new(config()).expect("engine")
}

fn run(source: &str, tests: &[(&str, &str)]) -> ExecutionResult {
    let tests = tests
        .iter()
        .map(|(expr, expected)| TestCase::new(*expr, *expected))
        .collect();
    engine().execute(&ExecutionRequest::new(source, tests))
}

fn statuses(result: &ExecutionResult) -> Vec<TestStatus> {
    result.tests.iter().map(|t| t.status).collect()
}

#[test]
fn scenario_a_passing_assignment() {
    let result = run("x = 2 + 2", &[("x", "4")]);
    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(statuses(&result), vec![TestStatus::Pass]);
    assert_eq!(result.feedback, "All tests passed!");
    assert_eq!(result.stdout, "");
}

#[test]
fn scenario_b_wrong_answer() {
    let result = run("def f(n):\n    return n * 2\n", &[("f(3)", "7")]);
    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(statuses(&result), vec![TestStatus::Fail]);
    let message = result.tests[0].message.clone().unwrap();
    assert!(message.contains('7'), "{message}");
    assert!(message.contains('6'), "{message}");
    assert_eq!(result.feedback, "Review the failing tests.");
}

#[test]
fn scenario_c_runtime_error() {
    let result = run("1/0", &[("1", "1")]);
    assert_eq!(result.status, ExecutionStatus::Error);
    assert!(result.tests.is_empty());
    assert!(result.feedback.contains("division by zero"), "{}", result.feedback);
}

#[test]
fn scenario_d_spin_forever_times_out() {
    let budget = ResourceBudget {
        cpu_time_limit_ms: 500,
        wall_time_limit_ms: 1_000,
        memory_limit_bytes: 128 * 1024 * 1024,
    };
    let started = Instant::now();
    let result = engine().execute_with_budget(
        &ExecutionRequest::new("while True:\n    pass\n", vec![]),
        &budget,
    );
    let elapsed = started.elapsed();
    assert_eq!(result.status, ExecutionStatus::Error);
    assert!(result.feedback.contains("Timeout"), "{}", result.feedback);
    assert_eq!(result.stdout, "");
    assert!(elapsed < Duration::from_secs(4), "took {elapsed:?}");
}

#[test]
fn printed_output_is_captured() {
    let result = run(
        "for i in range(3):\n    print(i, 'x')\nprint('done', end='!')\n",
        &[],
    );
    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(result.stdout, "0 x\n1 x\n2 x\ndone!");
    assert!(result.tests.is_empty());
    assert_eq!(result.feedback, "All tests passed!");
}

#[test]
fn partial_stdout_survives_a_runtime_error() {
    let result = run("print('before')\nraise ValueError('bad input')\n", &[]);
    assert_eq!(result.status, ExecutionStatus::Error);
    assert_eq!(result.stdout, "before\n");
    assert!(result.feedback.contains("ValueError: bad input"), "{}", result.feedback);
}

#[test]
fn syntax_errors_are_execution_failures() {
    let result = run("def f(:\n    pass\n", &[("f()", "None")]);
    assert_eq!(result.status, ExecutionStatus::Error);
    assert!(result.feedback.starts_with("Execution failed: SyntaxError"), "{}", result.feedback);
}

#[test]
fn results_keep_test_order_and_length() {
    let result = run(
        "def square(n):\n    return n * n\n",
        &[
            ("square(2)", "4"),
            ("square(3)", "10"),
            ("square('a')", "x"),
            ("square(-4)", "16"),
        ],
    );
    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(
        statuses(&result),
        vec![
            TestStatus::Pass,
            TestStatus::Fail,
            TestStatus::Error,
            TestStatus::Pass
        ]
    );
    let inputs: Vec<&str> = result.tests.iter().map(|t| t.expression.as_str()).collect();
    assert_eq!(inputs, vec!["square(2)", "square(3)", "square('a')", "square(-4)"]);
    assert!(result.tests[2]
        .message
        .as_deref()
        .unwrap()
        .starts_with("TypeError"));
}

#[test]
fn execution_is_idempotent() {
    let source = "data = [3, 1, 2]\ndata.sort()\nprint(data)\n";
    let first = run(source, &[("data", "[1, 2, 3]")]);
    let second = run(source, &[("data", "[1, 2, 3]")]);
    assert_eq!(first, second);
    assert_eq!(first.stdout, "[1, 2, 3]\n");
}

#[test]
fn tests_see_the_namespace_left_by_the_source() {
    let result = run(
        "def fibonacci(n: int) -> list:\n    seq = [0, 1]\n    while len(seq) < n:\n        seq.append(seq[-1] + seq[-2])\n    return seq[:n]\n",
        &[("fibonacci(5)", "[0, 1, 1, 2, 3]"), ("fibonacci(1)", "[0]")],
    );
    assert_eq!(statuses(&result), vec![TestStatus::Pass, TestStatus::Pass]);
}

#[test]
fn string_results_compare_by_str() {
    let result = run("greeting = 'hello ' + 'world'", &[("greeting", "hello world")]);
    assert_eq!(statuses(&result), vec![TestStatus::Pass]);
}

#[test]
fn withheld_builtins_are_capability_violations() {
    let result = run("data = open('/etc/passwd').read()\n", &[]);
    assert_eq!(result.status, ExecutionStatus::Error);
    assert!(result.feedback.contains("open"), "{}", result.feedback);

    let result = run("import os\n", &[]);
    assert_eq!(result.status, ExecutionStatus::Error);
}

#[test]
fn dunder_attribute_access_is_refused() {
    let result = run("x = (1).__class__\n", &[]);
    assert_eq!(result.status, ExecutionStatus::Error);
}

#[test]
fn capability_violation_inside_a_test_is_a_test_error() {
    let result = run("x = 1", &[("eval('1')", "1"), ("x", "1")]);
    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(statuses(&result), vec![TestStatus::Error, TestStatus::Pass]);
}

#[test]
fn minimal_capability_set_hides_the_rest() {
    let config = SandboxConfig {
        capabilities: Some(vec!["print".into(), "len".into()]),
        ..config()
    };
    let engine = Engine::new(config).unwrap();
    let result = engine.execute(&ExecutionRequest::new(
        "n = len([1, 2])\nm = sorted([2, 1])\n",
        vec![],
    ));
    assert_eq!(result.status, ExecutionStatus::Error);
    assert!(result.feedback.contains("sorted"), "{}", result.feedback);
}

#[test]
fn oversized_allocation_is_resource_exceeded() {
    let result = run("x = [0] * (10 ** 10)\n", &[]);
    assert_eq!(result.status, ExecutionStatus::Error);
    assert!(result.feedback.contains("ResourceExceeded"), "{}", result.feedback);
    assert!(result.feedback.contains("memory"), "{}", result.feedback);
    assert_eq!(result.stdout, "");
}

#[test]
fn flooding_stdout_is_resource_exceeded() {
    let result = run("while True:\n    print('x' * 1000)\n", &[]);
    assert_eq!(result.status, ExecutionStatus::Error);
    assert!(result.feedback.contains("ResourceExceeded"), "{}", result.feedback);
    assert!(result.feedback.contains("output"), "{}", result.feedback);
    assert_eq!(result.stdout, "");
}

#[test]
fn runaway_test_does_not_take_the_others_down() {
    let result = run(
        "def spin():\n    while True:\n        pass\n\nx = 5\n",
        &[("x", "5"), ("spin()", "0"), ("x + 1", "6")],
    );
    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(
        statuses(&result),
        vec![TestStatus::Pass, TestStatus::Error, TestStatus::Pass]
    );
    assert!(result.tests[1].message.as_deref().unwrap().contains("Timeout"));
    assert_eq!(result.feedback, "Review the failing tests.");
}

#[test]
fn memory_breach_in_a_test_recovers_for_the_next_one() {
    let result = run(
        "base = 10\n",
        &[
            ("len('x' * 40000000 + 'y' * 40000000)", "80000000"),
            ("base * 2", "20"),
        ],
    );
    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(statuses(&result), vec![TestStatus::Error, TestStatus::Pass]);
    let message = result.tests[0].message.as_deref().unwrap();
    assert!(message.contains("memory limit of 64 MiB exceeded"), "{message}");
    assert!(message.starts_with("ResourceExceeded"), "{message}");
}

#[test]
fn mutations_in_one_test_do_not_reach_the_next() {
    let source = "lst = [1]\nseen = {}\n";
    let result = run(
        source,
        &[
            ("lst.append(2)", "None"),
            ("lst", "[1]"),
            ("[lst.append(3), seen.update({'k': 1}), 1 / 0]", "0"),
            ("(lst, seen)", "([1], {})"),
        ],
    );
    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(
        statuses(&result),
        vec![
            TestStatus::Pass,
            TestStatus::Pass,
            TestStatus::Error,
            TestStatus::Pass
        ]
    );
}

#[test]
fn mutation_before_a_killed_test_is_not_seen_after_restart() {
    let source = "\
lst = [1]
def grow_then_spin():
    lst.append(2)
    while True:
        pass
";
    let result = run(
        source,
        &[("grow_then_spin()", "0"), ("lst", "[1]"), ("len(lst)", "1")],
    );
    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(
        statuses(&result),
        vec![TestStatus::Error, TestStatus::Pass, TestStatus::Pass]
    );
    assert!(result.tests[0].message.as_deref().unwrap().contains("Timeout"));
}

#[test]
fn extreme_slices_and_ranges() {
    let result = run(
        "M = 9223372036854775807\nwide = range(-M - 1, M)\n",
        &[
            ("[1, 2, 3][1:M:M]", "[2]"),
            ("[1, 2, 3][::-M - 1]", "[3]"),
            ("wide[5]", "-9223372036854775803"),
            ("wide[-1]", "9223372036854775806"),
            ("len(wide)", "0"),
        ],
    );
    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(
        statuses(&result),
        vec![
            TestStatus::Pass,
            TestStatus::Pass,
            TestStatus::Pass,
            TestStatus::Pass,
            TestStatus::Error
        ]
    );
    let message = result.tests[4].message.as_deref().unwrap();
    assert!(message.starts_with("OverflowError"), "{message}");
}

#[test]
fn reductions_over_large_ranges_stream() {
    let slow_tests = SandboxConfig {
        test_budget: ResourceBudget {
            cpu_time_limit_ms: 20_000,
            wall_time_limit_ms: 40_000,
            memory_limit_bytes: 64 * 1024 * 1024,
        },
        ..config()
    };
    let tests = [
        ("sum(range(10 ** 7))", "49999995000000"),
        ("any(i > 5 for i in range(10 ** 8))", "True"),
        ("all(i < 5 for i in range(10 ** 8))", "False"),
        ("max(i % 1000 for i in range(10 ** 6))", "999"),
    ]
    .iter()
    .map(|(expr, expected)| TestCase::new(*expr, *expected))
    .collect();
    let result = Engine::new(slow_tests)
        .expect("engine")
        .execute(&ExecutionRequest::new("", tests));
    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(result.feedback, "All tests passed!", "{:?}", result.tests);
}

#[test]
fn recursion_is_bounded() {
    let result = run("def f(n):\n    return f(n + 1)\n\nf(0)\n", &[]);
    assert_eq!(result.status, ExecutionStatus::Error);
    assert!(result.feedback.contains("RecursionError"), "{}", result.feedback);
}

#[test]
fn limit_breaches_cannot_be_caught() {
    let result = run(
        "try:\n    while True:\n        pass\nexcept Exception:\n    print('caught')\n",
        &[],
    );
    assert_eq!(result.status, ExecutionStatus::Error);
    assert!(result.feedback.contains("Timeout"), "{}", result.feedback);
    assert_eq!(result.stdout, "");
}

#[test]
fn concurrent_executions_are_isolated() {
    let engine = Arc::new(engine());
    let handles: Vec<_> = (0..6)
        .map(|i| {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                let source = format!("value = {i} * 10\nprint(value)\n");
                let expected = (i * 10).to_string();
                let result = engine.execute(&ExecutionRequest::new(
                    source,
                    vec![TestCase::new("value", expected.clone())],
                ));
                (i, expected, result)
            })
        })
        .collect();

    for handle in handles {
        let (i, expected, result) = handle.join().unwrap();
        assert_eq!(result.status, ExecutionStatus::Success, "request {i}");
        assert_eq!(result.stdout, format!("{expected}\n"));
        assert_eq!(statuses(&result), vec![TestStatus::Pass]);
    }
}

#[test]
fn result_json_has_the_documented_shape() {
    let result = run("x = 1", &[("x", "1"), ("x", "2")]);
    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["status"], "success");
    assert_eq!(json["tests"][0]["input"], "x");
    assert_eq!(json["tests"][0]["status"], "pass");
    assert!(json["tests"][0].get("message").is_none());
    assert_eq!(json["tests"][1]["status"], "fail");
    assert_eq!(json["tests"][1]["message"], "Expected '2' but received 1");
}
