//! Resource limiter
//!
//! Every submission runs inside a worker process that re-executes this
//! crate's binary. The parent hardens the worker before `exec`
//! ([`hardening`]), feeds it a [`WorkerJob`], reads its [`WorkerFrame`]s
//! under per-phase deadlines ([`supervisor`]), kills the whole worker group
//! when a deadline passes and turns exit evidence into a limit breach
//! ([`verdict`]).

pub mod hardening;
pub mod protocol;
pub mod supervisor;
pub mod verdict;

use crate::config::types::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use protocol::{Observation, WorkerFrame, WorkerJob};
pub use supervisor::ProcessLauncher;
pub use verdict::{classify, Breach};

/// Starts workers. The engine only talks to workers through this seam.
pub trait Launcher: Send + Sync {
    fn launch(&self, job: &WorkerJob) -> Result<Box<dyn WorkerSession>>;
}

/// One live worker.
pub trait WorkerSession: Send {
    /// Next frame, waiting at most `limit` plus the launcher's grace.
    fn next_frame(&mut self, limit: Duration) -> std::result::Result<WorkerFrame, Interruption>;

    /// Kill the worker group and collect what is left of it.
    fn terminate(self: Box<Self>) -> ExitEvidence;

    /// Wait for a worker that reported its last frame to exit.
    fn finish(self: Box<Self>) -> ExitEvidence;
}

/// Why no frame arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interruption {
    /// The phase deadline passed while the worker was still running.
    Deadline,
    /// The worker closed stdout without a frame.
    Exited,
    /// The worker wrote something that is not a frame.
    Protocol(String),
}

/// Signal escalation report for a forced termination.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillReport {
    pub kill_sent: bool,
    pub reaped: bool,
    pub waited_ms: u64,
    pub notes: Vec<String>,
}

/// What is known about a worker after it is gone.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitEvidence {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub cpu_time_ms: u64,
    pub wall_time_ms: u64,
    pub max_rss_kb: u64,
    /// Worker stderr, bounded.
    pub stderr: String,
    pub kill: Option<KillReport>,
}

impl ExitEvidence {
    pub fn killed_by_engine(&self) -> bool {
        self.kill.as_ref().is_some_and(|k| k.kill_sent)
    }

    pub fn exited_cleanly(&self) -> bool {
        self.exit_code == Some(0) && self.signal.is_none()
    }
}
