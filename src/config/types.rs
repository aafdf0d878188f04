use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Infrastructure errors raised inside the crate.
///
/// Learner-facing failures never use this type; they are folded into an
/// [`ExecutionResult`] instead.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Resource limit error: {0}")]
    ResourceLimit(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Capability error: {0}")]
    Capability(String),
}

pub type Result<T> = std::result::Result<T, SandboxError>;

const MIB: u64 = 1024 * 1024;

/// CPU, wall-clock and memory ceilings for one execution phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceBudget {
    pub cpu_time_limit_ms: u64,
    pub wall_time_limit_ms: u64,
    pub memory_limit_bytes: u64,
}

impl ResourceBudget {
    /// Budget for running learner source.
    pub fn source_default() -> Self {
        Self {
            cpu_time_limit_ms: 2_000,
            wall_time_limit_ms: 5_000,
            memory_limit_bytes: 256 * MIB,
        }
    }

    /// Budget for a single test expression. Memory is headroom above the
    /// footprint left behind by the source run.
    pub fn test_default() -> Self {
        Self {
            cpu_time_limit_ms: 1_000,
            wall_time_limit_ms: 2_000,
            memory_limit_bytes: 64 * MIB,
        }
    }

    pub fn memory_limit_mb(&self) -> u64 {
        self.memory_limit_bytes / MIB
    }
}

impl Default for ResourceBudget {
    fn default() -> Self {
        Self::source_default()
    }
}

/// One assertion: an expression evaluated after the source ran, and the
/// text its `str()` rendering must equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(rename = "input", alias = "expression")]
    pub expression: String,
    #[serde(deserialize_with = "expected_text")]
    pub expected: String,
}

impl TestCase {
    pub fn new(expression: impl Into<String>, expected: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            expected: expected.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub source: String,
    #[serde(default)]
    pub tests: Vec<TestCase>,
}

impl ExecutionRequest {
    pub fn new(source: impl Into<String>, tests: Vec<TestCase>) -> Self {
        Self {
            source: source.into(),
            tests,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Pass,
    Fail,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcome {
    #[serde(rename = "input")]
    pub expression: String,
    pub status: TestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Error,
}

/// Terminal answer for one request. Built once by the reporter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub stdout: String,
    pub feedback: String,
    pub tests: Vec<TestOutcome>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

/// Which ceiling a limit breach refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    CpuTime,
    WallTime,
    Memory,
    Output,
    Stack,
}

/// Engine-level failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    CompileOrRuntimeError,
    Timeout,
    ResourceExceeded,
    UndefinedSymbol,
    TestEvaluationError,
    WorkerUnavailable,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::CompileOrRuntimeError => "compile_or_runtime_error",
            FailureKind::Timeout => "timeout",
            FailureKind::ResourceExceeded => "resource_exceeded",
            FailureKind::UndefinedSymbol => "undefined_symbol",
            FailureKind::TestEvaluationError => "test_evaluation_error",
            FailureKind::WorkerUnavailable => "worker_unavailable",
        };
        f.write_str(name)
    }
}

/// Engine configuration, loadable from a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Binary re-executed as the worker. Resolved from `SNAKEBOX_WORKER`
    /// or the current executable when unset.
    pub worker_program: Option<PathBuf>,
    pub budget: ResourceBudget,
    pub test_budget: ResourceBudget,
    /// Granted built-in names; `None` grants the standard set.
    pub capabilities: Option<Vec<String>>,
    pub max_recursion_depth: usize,
    pub max_nesting_depth: usize,
    pub output_limit_bytes: usize,
    pub stack_limit_bytes: u64,
    pub kill_grace_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            worker_program: None,
            budget: ResourceBudget::source_default(),
            test_budget: ResourceBudget::test_default(),
            capabilities: None,
            max_recursion_depth: 400,
            max_nesting_depth: 100,
            output_limit_bytes: 64 * 1024,
            stack_limit_bytes: 64 * MIB,
            kill_grace_ms: 250,
        }
    }
}

fn expected_text<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(text) => text,
        other => python_text(&other),
    })
}

/// Renders a JSON value the way `str()` would render the equivalent
/// Python literal.
fn python_text(value: &serde_json::Value) -> String {
    use serde_json::Value;
    match value {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => python_quote(s),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(python_text).collect();
            format!("[{}]", parts.join(", "))
        }
        Value::Object(map) => {
            let parts: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", python_quote(k), python_text(v)))
                .collect();
            format!("{{{}}}", parts.join(", "))
        }
    }
}

fn python_quote(text: &str) -> String {
    crate::lang::format::repr_str(text)
}
