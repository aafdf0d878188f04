//! Execution engine
//!
//! [`Engine`] is the library entry point. Each call builds a
//! [`lifecycle::Execution`], runs the source in a fresh worker, evaluates
//! the tests against the worker's namespace and reports. Failures never
//! escape as errors; they are folded into the [`ExecutionResult`].

pub mod evaluator;
pub mod lifecycle;
pub mod reporter;

use crate::capability::CapabilitySet;
use crate::config::types::{
    ExecutionRequest, ExecutionResult, FailureKind, LimitKind, ResourceBudget, Result,
    SandboxConfig,
};
use crate::config::validator::ensure_valid;
use crate::lang::{ErrorKind, Limits, ScriptError};
use crate::limiter::verdict::describe_limit;
use crate::limiter::{Breach, Launcher, ProcessLauncher};
use crate::observability::audit::ExecutionAudit;
use lifecycle::{Context, Execution};
use std::sync::Arc;
use std::time::Duration;

/// Why an execution stopped before its tests could run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub limit: Option<LimitKind>,
    /// `Kind: detail`, used verbatim in feedback and test messages.
    pub description: String,
}

impl Failure {
    /// A program error reported by the worker.
    pub fn from_script(error: &ScriptError) -> Self {
        let (kind, limit) = match error.kind {
            ErrorKind::Timeout => {
                let limit = if error.message.starts_with("CPU") {
                    LimitKind::CpuTime
                } else {
                    LimitKind::WallTime
                };
                (FailureKind::Timeout, Some(limit))
            }
            ErrorKind::Memory => (FailureKind::ResourceExceeded, Some(LimitKind::Memory)),
            ErrorKind::OutputLimit => (FailureKind::ResourceExceeded, Some(LimitKind::Output)),
            ErrorKind::Name | ErrorKind::Capability => (FailureKind::UndefinedSymbol, None),
            _ => (FailureKind::CompileOrRuntimeError, None),
        };
        let description = match limit {
            Some(_) => format!("{}: {}", label(kind), error.message),
            None => error.describe(),
        };
        Self {
            kind,
            limit,
            description,
        }
    }

    /// A worker that died or was killed.
    pub fn from_breach(breach: &Breach, budget: &ResourceBudget, output_limit_bytes: usize) -> Self {
        match breach {
            Breach::Limit(limit) => {
                let kind = match limit {
                    LimitKind::CpuTime | LimitKind::WallTime => FailureKind::Timeout,
                    LimitKind::Memory | LimitKind::Output | LimitKind::Stack => {
                        FailureKind::ResourceExceeded
                    }
                };
                Self {
                    kind,
                    limit: Some(*limit),
                    description: format!(
                        "{}: {}",
                        label(kind),
                        describe_limit(*limit, budget, output_limit_bytes)
                    ),
                }
            }
            Breach::Crash(detail) => Self::worker_unavailable(format!("worker crashed: {detail}")),
        }
    }

    pub fn worker_unavailable(detail: impl AsRef<str>) -> Self {
        Self {
            kind: FailureKind::WorkerUnavailable,
            limit: None,
            description: format!("{}: {}", label(FailureKind::WorkerUnavailable), detail.as_ref()),
        }
    }

    pub fn feedback(&self) -> String {
        format!("Execution failed: {}", self.description)
    }

    /// Partial output does not cross a termination boundary.
    pub fn keeps_stdout(&self) -> bool {
        !matches!(
            self.kind,
            FailureKind::Timeout | FailureKind::ResourceExceeded
        )
    }
}

fn label(kind: FailureKind) -> &'static str {
    match kind {
        FailureKind::Timeout => "Timeout",
        FailureKind::ResourceExceeded => "ResourceExceeded",
        FailureKind::WorkerUnavailable => "WorkerUnavailable",
        FailureKind::UndefinedSymbol => "UndefinedSymbol",
        FailureKind::TestEvaluationError => "TestEvaluationError",
        FailureKind::CompileOrRuntimeError => "Error",
    }
}

/// Runs submissions. Cheap to share; holds no per-execution state.
pub struct Engine {
    config: SandboxConfig,
    capabilities: CapabilitySet,
    limits: Limits,
    launcher: Arc<dyn Launcher>,
}

impl Engine {
    /// Engine backed by hardened worker processes.
    pub fn new(config: SandboxConfig) -> Result<Self> {
        ensure_valid(&config)?;
        let program = config.resolve_worker_program()?;
        let launcher = ProcessLauncher::new(
            program,
            config.stack_limit_bytes,
            Duration::from_millis(config.kill_grace_ms),
        );
        Self::with_launcher(config, Arc::new(launcher))
    }

    /// Engine backed by a caller-supplied launcher.
    pub fn with_launcher(config: SandboxConfig, launcher: Arc<dyn Launcher>) -> Result<Self> {
        ensure_valid(&config)?;
        let capabilities = CapabilitySet::from_config(config.capabilities.as_deref())?;
        let limits = Limits::from_config(&config);
        Ok(Self {
            config,
            capabilities,
            limits,
            launcher,
        })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        self.execute_with_budget(request, &self.config.budget)
    }

    /// Execute with `budget` in place of the configured source budget.
    pub fn execute_with_budget(
        &self,
        request: &ExecutionRequest,
        budget: &ResourceBudget,
    ) -> ExecutionResult {
        let audit = ExecutionAudit::start(request, budget);
        let ctx = Context {
            launcher: self.launcher.as_ref(),
            capabilities: &self.capabilities,
            limits: self.limits,
            request,
            budget: *budget,
            test_budget: self.config.test_budget,
            audit: &audit,
        };

        let result = match Execution::new(ctx).run() {
            Ok(evaluating) => evaluating.evaluate().into_result(),
            Err(failed) => {
                log::debug!("execution {} failed: {:?}", audit.run_id(), failed.failure());
                failed.into_result()
            }
        };
        audit.finish(&result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{ExecutionStatus, SandboxError, TestCase, TestStatus};
    use crate::limiter::{ExitEvidence, Interruption, KillReport, Observation, WorkerFrame, WorkerJob, WorkerSession};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    enum Step {
        Frame(WorkerFrame),
        Interrupt(Interruption),
    }

    struct Script {
        steps: Vec<Step>,
        evidence: ExitEvidence,
    }

    struct ScriptedLauncher {
        scripts: Mutex<VecDeque<Option<Script>>>,
        jobs: Mutex<Vec<WorkerJob>>,
    }

    impl ScriptedLauncher {
        fn with(scripts: Vec<Option<Script>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                jobs: Mutex::new(Vec::new()),
            })
        }

        fn start_indices(&self) -> Vec<usize> {
            self.jobs.lock().unwrap().iter().map(|j| j.start_index).collect()
        }
    }

    impl Launcher for ScriptedLauncher {
        fn launch(&self, job: &WorkerJob) -> Result<Box<dyn WorkerSession>> {
            self.jobs.lock().unwrap().push(job.clone());
            match self.scripts.lock().unwrap().pop_front().flatten() {
                Some(script) => Ok(Box::new(ScriptedSession {
                    steps: script.steps.into(),
                    evidence: script.evidence,
                })),
                None => Err(SandboxError::Process("no worker binary".into())),
            }
        }
    }

    struct ScriptedSession {
        steps: VecDeque<Step>,
        evidence: ExitEvidence,
    }

    impl WorkerSession for ScriptedSession {
        fn next_frame(&mut self, _limit: Duration) -> std::result::Result<WorkerFrame, Interruption> {
            match self.steps.pop_front() {
                Some(Step::Frame(frame)) => Ok(frame),
                Some(Step::Interrupt(i)) => Err(i),
                None => Err(Interruption::Exited),
            }
        }

        fn terminate(self: Box<Self>) -> ExitEvidence {
            ExitEvidence {
                signal: Some(libc::SIGKILL),
                kill: Some(KillReport {
                    kill_sent: true,
                    reaped: true,
                    ..KillReport::default()
                }),
                ..self.evidence
            }
        }

        fn finish(self: Box<Self>) -> ExitEvidence {
            self.evidence
        }
    }

    fn executed(stdout: &str) -> Step {
        Step::Frame(WorkerFrame::Executed {
            stdout: stdout.into(),
        })
    }

    fn observed(index: usize, text: &str) -> Step {
        Step::Frame(WorkerFrame::Observed {
            index,
            observation: Observation::Value {
                text: text.into(),
                repr: text.into(),
                truncated: false,
            },
        })
    }

    fn finished() -> Step {
        Step::Frame(WorkerFrame::Finished)
    }

    fn script(steps: Vec<Step>) -> Option<Script> {
        Some(Script {
            steps,
            evidence: ExitEvidence {
                exit_code: Some(0),
                ..ExitEvidence::default()
            },
        })
    }

    fn engine(launcher: Arc<ScriptedLauncher>) -> Engine {
        Engine::with_launcher(SandboxConfig::default(), launcher).unwrap()
    }

    #[test]
    fn engine_is_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Engine>();
    }

    #[test]
    fn passing_test_reports_success() {
        let launcher = ScriptedLauncher::with(vec![script(vec![
            executed(""),
            observed(0, "4"),
            finished(),
        ])]);
        let result = engine(launcher).execute(&ExecutionRequest::new(
            "x = 2 + 2",
            vec![TestCase::new("x", "4")],
        ));
        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.tests[0].status, TestStatus::Pass);
        assert_eq!(result.feedback, "All tests passed!");
    }

    #[test]
    fn zero_tests_is_vacuously_passed() {
        let launcher = ScriptedLauncher::with(vec![script(vec![executed("hi\n"), finished()])]);
        let result = engine(launcher).execute(&ExecutionRequest::new("print('hi')", vec![]));
        assert!(result.is_success());
        assert_eq!(result.stdout, "hi\n");
        assert!(result.tests.is_empty());
        assert_eq!(result.feedback, "All tests passed!");
    }

    #[test]
    fn source_error_keeps_partial_stdout() {
        let launcher = ScriptedLauncher::with(vec![script(vec![Step::Frame(WorkerFrame::Failed {
            failure: ScriptError::new(ErrorKind::ZeroDivision, "division by zero").at_line(2),
            stdout: "before\n".into(),
        })])]);
        let result = engine(launcher).execute(&ExecutionRequest::new(
            "print('before')\n1/0",
            vec![TestCase::new("x", "1")],
        ));
        assert_eq!(result.status, ExecutionStatus::Error);
        assert_eq!(result.stdout, "before\n");
        assert!(result.tests.is_empty());
        assert_eq!(
            result.feedback,
            "Execution failed: ZeroDivisionError: division by zero (line 2)"
        );
    }

    #[test]
    fn metered_timeout_drops_stdout() {
        let launcher = ScriptedLauncher::with(vec![script(vec![Step::Frame(WorkerFrame::Failed {
            failure: ScriptError::new(ErrorKind::Timeout, "CPU time limit of 2000 ms exceeded"),
            stdout: "spam\n".into(),
        })])]);
        let result = engine(launcher).execute(&ExecutionRequest::new("while True: pass", vec![]));
        assert_eq!(result.status, ExecutionStatus::Error);
        assert_eq!(result.stdout, "");
        assert_eq!(
            result.feedback,
            "Execution failed: Timeout: CPU time limit of 2000 ms exceeded"
        );
    }

    #[test]
    fn source_deadline_kills_the_worker() {
        let launcher = ScriptedLauncher::with(vec![script(vec![Step::Interrupt(
            Interruption::Deadline,
        )])]);
        let result = engine(launcher).execute(&ExecutionRequest::new("while True: pass", vec![]));
        assert_eq!(result.status, ExecutionStatus::Error);
        assert!(result.feedback.contains("Timeout"));
        assert!(result.feedback.contains("wall-clock limit of 5000 ms"));
    }

    #[test]
    fn allocation_abort_is_resource_exceeded() {
        let launcher = ScriptedLauncher::with(vec![Some(Script {
            steps: vec![],
            evidence: ExitEvidence {
                signal: Some(libc::SIGABRT),
                stderr: "memory allocation of 4294967296 bytes failed\n".into(),
                ..ExitEvidence::default()
            },
        })]);
        let result = engine(launcher).execute(&ExecutionRequest::new("x = [0] * 10", vec![]));
        assert_eq!(
            result.feedback,
            "Execution failed: ResourceExceeded: memory limit of 256 MiB exceeded"
        );
        assert_eq!(result.stdout, "");
    }

    #[test]
    fn launch_failure_is_worker_unavailable() {
        let launcher = ScriptedLauncher::with(vec![None]);
        let result = engine(launcher).execute(&ExecutionRequest::new("x = 1", vec![]));
        assert_eq!(result.status, ExecutionStatus::Error);
        assert!(result
            .feedback
            .starts_with("Execution failed: WorkerUnavailable: Process error: no worker binary"));
    }

    #[test]
    fn unexplained_exit_is_a_crash() {
        let launcher = ScriptedLauncher::with(vec![Some(Script {
            steps: vec![],
            evidence: ExitEvidence {
                exit_code: Some(101),
                ..ExitEvidence::default()
            },
        })]);
        let result = engine(launcher).execute(&ExecutionRequest::new("x = 1", vec![]));
        assert_eq!(
            result.feedback,
            "Execution failed: WorkerUnavailable: worker crashed: worker exited with status 101"
        );
    }

    #[test]
    fn test_breach_restarts_and_resumes_at_the_next_test() {
        let launcher = ScriptedLauncher::with(vec![
            script(vec![
                executed("once\n"),
                observed(0, "1"),
                Step::Interrupt(Interruption::Deadline),
            ]),
            script(vec![executed("once\n"), observed(2, "3"), finished()]),
        ]);
        let result = engine(launcher.clone()).execute(&ExecutionRequest::new(
            "print('once')",
            vec![
                TestCase::new("a", "1"),
                TestCase::new("spin()", "2"),
                TestCase::new("c", "3"),
            ],
        ));
        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.stdout, "once\n");
        let statuses: Vec<TestStatus> = result.tests.iter().map(|t| t.status).collect();
        assert_eq!(
            statuses,
            vec![TestStatus::Pass, TestStatus::Error, TestStatus::Pass]
        );
        assert!(result.tests[1]
            .message
            .as_deref()
            .unwrap()
            .starts_with("Timeout: wall-clock limit of 2000 ms"));
        assert_eq!(result.feedback, "Review the failing tests.");
        assert_eq!(launcher.start_indices(), vec![0, 2]);
    }

    #[test]
    fn failed_restart_errors_the_remaining_tests() {
        let launcher = ScriptedLauncher::with(vec![
            script(vec![executed(""), Step::Interrupt(Interruption::Deadline)]),
            None,
        ]);
        let result = engine(launcher).execute(&ExecutionRequest::new(
            "x = 1",
            vec![
                TestCase::new("spin()", "1"),
                TestCase::new("x", "1"),
                TestCase::new("x + 1", "2"),
            ],
        ));
        assert_eq!(result.tests.len(), 3);
        assert!(result.tests.iter().all(|t| t.status == TestStatus::Error));
        assert!(result.tests[2]
            .message
            .as_deref()
            .unwrap()
            .contains("replacement worker could not re-run the source"));
    }

    #[test]
    fn out_of_order_frame_is_a_protocol_error() {
        let launcher = ScriptedLauncher::with(vec![script(vec![executed(""), observed(1, "2")])]);
        let result = engine(launcher).execute(&ExecutionRequest::new(
            "x = 1",
            vec![TestCase::new("x", "1"), TestCase::new("x", "1")],
        ));
        assert_eq!(result.tests.len(), 2);
        assert!(result.tests.iter().all(|t| t.status == TestStatus::Error));
        assert!(result.tests[0]
            .message
            .as_deref()
            .unwrap()
            .contains("protocol error"));
    }

    #[test]
    fn failure_mapping_follows_error_kind() {
        let f = Failure::from_script(&ScriptError::withheld("open"));
        assert_eq!(f.kind, FailureKind::UndefinedSymbol);
        let f = Failure::from_script(&ScriptError::undefined_name("foo"));
        assert_eq!(f.kind, FailureKind::UndefinedSymbol);
        let f = Failure::from_script(&ScriptError::new(
            ErrorKind::OutputLimit,
            "output limit of 10 bytes exceeded",
        ));
        assert_eq!(f.kind, FailureKind::ResourceExceeded);
        assert_eq!(f.limit, Some(LimitKind::Output));
        let f = Failure::from_script(&ScriptError::syntax("invalid syntax", 1));
        assert_eq!(f.kind, FailureKind::CompileOrRuntimeError);
        assert_eq!(f.description, "SyntaxError: invalid syntax (line 1)");
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = SandboxConfig {
            capabilities: Some(vec!["open".into()]),
            ..SandboxConfig::default()
        };
        assert!(Engine::with_launcher(config, ScriptedLauncher::with(vec![])).is_err());
    }
}
