//! Turns the remains of a dead worker into a breach.

use crate::config::types::{LimitKind, ResourceBudget};
use crate::limiter::ExitEvidence;
use serde::{Deserialize, Serialize};

/// Runtime abort message for a failed allocation.
const ALLOCATION_FAILURE: &str = "memory allocation of";
/// Runtime abort message for a guard-page hit.
const STACK_OVERFLOW: &str = "has overflowed its stack";

/// Why a worker stopped before reporting every frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "breach", content = "detail", rename_all = "snake_case")]
pub enum Breach {
    Limit(LimitKind),
    /// Anything that is not a recognisable limit. Carries a description.
    Crash(String),
}

impl Breach {
    pub fn limit(&self) -> Option<LimitKind> {
        match self {
            Breach::Limit(kind) => Some(*kind),
            Breach::Crash(_) => None,
        }
    }
}

/// Classify a worker that died or was killed during a phase run under
/// `budget`.
///
/// Engine kills take precedence over the exit status, since a killed
/// worker always reports SIGKILL regardless of what it was doing.
pub fn classify(evidence: &ExitEvidence, budget: &ResourceBudget) -> Breach {
    if evidence.killed_by_engine() {
        return if evidence.cpu_time_ms >= budget.cpu_time_limit_ms {
            Breach::Limit(LimitKind::CpuTime)
        } else {
            Breach::Limit(LimitKind::WallTime)
        };
    }

    if evidence.signal == Some(libc::SIGXCPU) {
        return Breach::Limit(LimitKind::CpuTime);
    }
    // The hard CPU limit is delivered as SIGKILL by the kernel.
    if evidence.signal == Some(libc::SIGKILL)
        && evidence.cpu_time_ms >= budget.cpu_time_limit_ms
    {
        return Breach::Limit(LimitKind::CpuTime);
    }

    if evidence.stderr.contains(ALLOCATION_FAILURE) {
        return Breach::Limit(LimitKind::Memory);
    }
    if evidence.stderr.contains(STACK_OVERFLOW) {
        return Breach::Limit(LimitKind::Stack);
    }

    Breach::Crash(describe_exit(evidence))
}

fn describe_exit(evidence: &ExitEvidence) -> String {
    match (evidence.signal, evidence.exit_code) {
        (Some(signal), _) => format!("worker terminated by signal {}", signal_name(signal)),
        (None, Some(code)) => format!("worker exited with status {code}"),
        (None, None) => "worker vanished without an exit status".to_string(),
    }
}

pub fn signal_name(signal: i32) -> String {
    nix::sys::signal::Signal::try_from(signal)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("{signal}"))
}

/// Human description of a breached ceiling.
pub fn describe_limit(kind: LimitKind, budget: &ResourceBudget, output_limit_bytes: usize) -> String {
    match kind {
        LimitKind::CpuTime => format!("CPU time limit of {} ms exceeded", budget.cpu_time_limit_ms),
        LimitKind::WallTime => {
            format!("wall-clock limit of {} ms exceeded", budget.wall_time_limit_ms)
        }
        LimitKind::Memory => format!("memory limit of {} MiB exceeded", budget.memory_limit_mb()),
        LimitKind::Output => format!("output limit of {output_limit_bytes} bytes exceeded"),
        LimitKind::Stack => "stack limit exceeded".to_string(),
    }
}
