//! Integration tests for the snakebox binary

use std::io::Write;
use std::process::{Command, Output, Stdio};

fn snakebox() -> Command {
    Command::new(env!("CARGO_BIN_EXE_snakebox"))
}

fn json(output: &Output) -> serde_json::Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(stdout.trim()).unwrap_or_else(|e| panic!("bad JSON {stdout:?}: {e}"))
}

#[test]
fn execute_with_source_file_and_test_flags() {
    let mut source = tempfile::NamedTempFile::new().unwrap();
    writeln!(source, "def double(n):\n    return n * 2\nprint('loaded')").unwrap();

    let output = snakebox()
        .args(["execute", "--source"])
        .arg(source.path())
        .args(["--test", "double(2)=4", "--test", "double(5)=11"])
        .output()
        .unwrap();

    assert!(output.status.success(), "{:?}", output);
    let result = json(&output);
    assert_eq!(result["status"], "success");
    assert_eq!(result["stdout"], "loaded\n");
    assert_eq!(result["tests"][0]["status"], "pass");
    assert_eq!(result["tests"][1]["status"], "fail");
    assert_eq!(result["feedback"], "Review the failing tests.");
}

#[test]
fn execute_reads_a_request_from_stdin() {
    let mut child = snakebox()
        .args(["execute", "--request", "-"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    child
        .stdin
        .take()
        .unwrap()
        .write_all(br#"{"source": "x = 2 + 2", "tests": [{"input": "x", "expected": 4}]}"#)
        .unwrap();
    let output = child.wait_with_output().unwrap();

    assert!(output.status.success());
    let result = json(&output);
    assert_eq!(result["tests"][0]["status"], "pass");
    assert_eq!(result["feedback"], "All tests passed!");
}

#[test]
fn failing_execution_exits_with_status_one() {
    let mut source = tempfile::NamedTempFile::new().unwrap();
    write!(source, "1/0").unwrap();

    let output = snakebox()
        .args(["execute", "--source"])
        .arg(source.path())
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let result = json(&output);
    assert_eq!(result["status"], "error");
    assert!(result["feedback"]
        .as_str()
        .unwrap()
        .contains("division by zero"));
}

#[test]
fn cpu_flag_tightens_the_budget() {
    let mut source = tempfile::NamedTempFile::new().unwrap();
    write!(source, "while True:\n    pass\n").unwrap();

    let output = snakebox()
        .args(["execute", "--cpu-ms", "200", "--wall-ms", "1000", "--source"])
        .arg(source.path())
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let feedback = json(&output)["feedback"].as_str().unwrap().to_string();
    assert!(feedback.contains("Timeout"), "{feedback}");
}

#[test]
fn minimal_flag_withholds_the_wider_catalog() {
    let mut source = tempfile::NamedTempFile::new().unwrap();
    write!(source, "print(sorted([2, 1]))").unwrap();

    let output = snakebox()
        .args(["execute", "--minimal", "--source"])
        .arg(source.path())
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    assert_eq!(json(&output)["status"], "error");
}

#[test]
fn execute_without_input_is_a_usage_error() {
    let output = snakebox().arg("execute").output().unwrap();
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
}

#[test]
fn capabilities_lists_granted_and_withheld_names() {
    let output = snakebox().arg("capabilities").output().unwrap();
    assert!(output.status.success());
    let listing = String::from_utf8_lossy(&output.stdout);
    assert!(listing.lines().any(|l| l.starts_with("granted") && l.ends_with(" print")));
    assert!(listing.lines().any(|l| l.starts_with("withheld") && l.ends_with(" open")));
}

#[test]
fn check_runs_a_smoke_test_through_a_worker() {
    let output = snakebox()
        .arg("check")
        .env("SNAKEBOX_WORKER", env!("CARGO_BIN_EXE_snakebox"))
        .output()
        .unwrap();
    let report = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "{report}");
    assert!(report.contains("configuration: ok"));
    assert!(report.contains("smoke: ok"));
}

#[test]
fn check_rejects_an_invalid_config() {
    let mut config = tempfile::NamedTempFile::new().unwrap();
    write!(config, r#"{{"capabilities": ["open"]}}"#).unwrap();

    let output = snakebox()
        .arg("check")
        .arg("--config")
        .arg(config.path())
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stdout).contains("configuration: invalid"));
}
