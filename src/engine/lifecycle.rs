//! Execution lifecycle as a type-state machine.
//!
//! Pending -> run -> Evaluating | Failed
//! Evaluating -> evaluate -> Reported
//!
//! Each step consumes the prior state. Only `Failed` and `Reported` can be
//! turned into an [`ExecutionResult`].

use crate::capability::CapabilitySet;
use crate::config::types::{ExecutionRequest, ExecutionResult, ResourceBudget, TestOutcome};
use crate::engine::{evaluator, reporter, Failure};
use crate::lang::{ErrorKind, Limits, ScriptError};
use crate::limiter::{
    classify, Interruption, Launcher, Observation, WorkerFrame, WorkerJob, WorkerSession,
};
use crate::observability::audit::ExecutionAudit;
use std::time::Duration;

/// Type-state: nothing has run yet.
pub struct Pending;

/// Type-state: the source ran and a live worker holds its namespace.
pub struct Evaluating {
    session: Box<dyn WorkerSession>,
    stdout: String,
}

/// Type-state: the source did not complete.
pub struct Failed {
    failure: Failure,
    stdout: String,
}

/// Type-state: every test has an outcome.
pub struct Reported {
    stdout: String,
    outcomes: Vec<TestOutcome>,
}

/// Borrowed inputs shared by every state of one execution.
pub struct Context<'a> {
    pub launcher: &'a dyn Launcher,
    pub capabilities: &'a CapabilitySet,
    pub limits: Limits,
    pub request: &'a ExecutionRequest,
    pub budget: ResourceBudget,
    pub test_budget: ResourceBudget,
    pub audit: &'a ExecutionAudit,
}

impl Context<'_> {
    fn job(&self, start_index: usize) -> WorkerJob {
        WorkerJob {
            source: self.request.source.clone(),
            expressions: self
                .request
                .tests
                .iter()
                .map(|t| t.expression.clone())
                .collect(),
            start_index,
            budget: self.budget,
            test_budget: self.test_budget,
            capabilities: self.capabilities.clone(),
            limits: self.limits,
        }
    }

    fn deadline(budget: &ResourceBudget) -> Duration {
        Duration::from_millis(budget.wall_time_limit_ms)
    }

    /// Record a failure in the audit trail.
    fn note(&self, phase: &str, failure: &Failure, cause: Option<&ScriptError>) {
        if let Some(limit) = failure.limit {
            self.audit.limit_breach(phase, limit, &failure.description);
        }
        if cause.is_some_and(|e| e.kind == ErrorKind::Capability) {
            self.audit.capability_violation(phase, &failure.description);
        }
    }

    /// Stop a session that did not deliver the expected frame and explain
    /// why.
    fn interrupted(
        &self,
        phase: &str,
        session: Box<dyn WorkerSession>,
        interruption: Interruption,
        budget: &ResourceBudget,
    ) -> Failure {
        let evidence = match &interruption {
            Interruption::Exited => session.finish(),
            Interruption::Deadline | Interruption::Protocol(_) => session.terminate(),
        };
        if let Some(report) = &evidence.kill {
            self.audit.worker_killed(phase, report);
        }
        let failure = match interruption {
            Interruption::Protocol(reason) => {
                Failure::worker_unavailable(format!("protocol error: {reason}"))
            }
            Interruption::Deadline | Interruption::Exited => {
                let breach = classify(&evidence, budget);
                log::debug!("{phase} phase ended by {:?}: {:?}", breach, evidence);
                Failure::from_breach(&breach, budget, self.limits.output_limit_bytes)
            }
        };
        self.note(phase, &failure, None);
        failure
    }

    /// Launch a worker for tests from `start_index` onwards and wait for
    /// its source phase.
    fn start_worker(
        &self,
        start_index: usize,
    ) -> std::result::Result<(Box<dyn WorkerSession>, String), (Failure, String)> {
        let job = self.job(start_index);
        let mut session = match self.launcher.launch(&job) {
            Ok(session) => session,
            Err(e) => {
                log::error!("worker launch failed: {}", e);
                return Err((Failure::worker_unavailable(e.to_string()), String::new()));
            }
        };

        match session.next_frame(Self::deadline(&self.budget)) {
            Ok(WorkerFrame::Executed { stdout }) => Ok((session, stdout)),
            Ok(WorkerFrame::Failed { failure, stdout }) => {
                let _ = session.finish();
                let reported = Failure::from_script(&failure);
                self.note("source", &reported, Some(&failure));
                let stdout = if reported.keeps_stdout() {
                    stdout
                } else {
                    String::new()
                };
                Err((reported, stdout))
            }
            Ok(other) => {
                let reason = format!("unexpected frame before the source finished: {other:?}");
                let failure =
                    self.interrupted("source", session, Interruption::Protocol(reason), &self.budget);
                Err((failure, String::new()))
            }
            Err(interruption) => {
                let failure = self.interrupted("source", session, interruption, &self.budget);
                Err((failure, String::new()))
            }
        }
    }
}

/// One execution moving through its lifecycle.
pub struct Execution<'a, S> {
    ctx: Context<'a>,
    state: S,
}

impl<'a> Execution<'a, Pending> {
    pub fn new(ctx: Context<'a>) -> Self {
        Self {
            ctx,
            state: Pending,
        }
    }

    /// Run the source in a fresh worker.
    #[allow(clippy::result_large_err)]
    pub fn run(self) -> std::result::Result<Execution<'a, Evaluating>, Execution<'a, Failed>> {
        match self.ctx.start_worker(0) {
            Ok((session, stdout)) => Ok(Execution {
                ctx: self.ctx,
                state: Evaluating { session, stdout },
            }),
            Err((failure, stdout)) => Err(Execution {
                ctx: self.ctx,
                state: Failed { failure, stdout },
            }),
        }
    }
}

impl<'a> Execution<'a, Evaluating> {
    pub fn stdout(&self) -> &str {
        &self.state.stdout
    }

    /// Evaluate every test in order. A test that takes the worker down is
    /// an error; a replacement worker re-runs the source and resumes at the
    /// next test. When no replacement can be started the remaining tests
    /// are errors.
    pub fn evaluate(self) -> Execution<'a, Reported> {
        let Execution { ctx, state } = self;
        let tests = &ctx.request.tests;
        let mut outcomes = Vec::with_capacity(tests.len());
        let mut session = Some(state.session);
        let mut lost: Option<String> = None;
        let deadline = Context::deadline(&ctx.test_budget);

        while outcomes.len() < tests.len() {
            let index = outcomes.len();
            let test = &tests[index];
            let Some(mut current) = session.take() else {
                let reason = lost.clone().unwrap_or_else(|| "worker unavailable".to_string());
                outcomes.push(evaluator::errored(test, reason));
                continue;
            };

            let failure = match current.next_frame(deadline) {
                Ok(WorkerFrame::Observed {
                    index: observed,
                    observation,
                }) if observed == index => {
                    if let Observation::Raised { error } = &observation {
                        if error.kind == ErrorKind::Capability {
                            ctx.audit.capability_violation("test", &error.to_string());
                        }
                    }
                    outcomes.push(evaluator::judge(test, &observation));
                    session = Some(current);
                    continue;
                }
                Ok(other) => {
                    let reason = format!("unexpected frame for test {index}: {other:?}");
                    let failure = ctx.interrupted(
                        "test",
                        current,
                        Interruption::Protocol(reason),
                        &ctx.test_budget,
                    );
                    lost = Some(failure.description.clone());
                    failure
                }
                Err(interruption) => ctx.interrupted("test", current, interruption, &ctx.test_budget),
            };
            outcomes.push(evaluator::errored(test, failure.description.clone()));

            let next = outcomes.len();
            if lost.is_none() && next < tests.len() {
                ctx.audit.worker_restarted(next);
                match ctx.start_worker(next) {
                    Ok((replacement, _)) => session = Some(replacement),
                    Err((failure, _)) => {
                        lost = Some(format!(
                            "{} (replacement worker could not re-run the source)",
                            failure.description
                        ));
                    }
                }
            }
        }

        if let Some(mut current) = session {
            match current.next_frame(deadline) {
                Ok(WorkerFrame::Finished) => {
                    let _ = current.finish();
                }
                other => {
                    log::warn!("worker did not finish cleanly: {:?}", other);
                    let evidence = current.terminate();
                    if let Some(report) = &evidence.kill {
                        ctx.audit.worker_killed("finish", report);
                    }
                }
            }
        }

        Execution {
            ctx,
            state: Reported {
                stdout: state.stdout,
                outcomes,
            },
        }
    }
}

impl Execution<'_, Failed> {
    pub fn failure(&self) -> &Failure {
        &self.state.failure
    }

    pub fn into_result(self) -> ExecutionResult {
        reporter::report_failure(&self.state.failure, self.state.stdout)
    }
}

impl Execution<'_, Reported> {
    pub fn outcomes(&self) -> &[TestOutcome] {
        &self.state.outcomes
    }

    pub fn into_result(self) -> ExecutionResult {
        reporter::report(self.state.stdout, self.state.outcomes)
    }
}
