//! Worker side of the process boundary.
//!
//! Reads one [`WorkerJob`] from stdin, runs the source, evaluates each test
//! expression against a fresh copy of the resulting namespace and writes
//! one frame per step to stdout. Nothing else is ever written to stdout; program output
//! travels inside the frames.

use crate::config::types::{Result, SandboxError};
use crate::lang::format::{repr, to_str};
use crate::lang::{Interpreter, Value};
use crate::limiter::hardening;
use crate::limiter::protocol::{Observation, WorkerFrame, WorkerJob};
use std::io::{self, Read, Write};

pub const EXIT_OK: i32 = 0;
pub const EXIT_BAD_JOB: i32 = 2;
pub const EXIT_FAILED: i32 = 3;

/// Entry point for `--internal-role worker`. Returns the exit status.
pub fn run() -> i32 {
    let mut input = String::new();
    if let Err(e) = io::stdin().read_to_string(&mut input) {
        eprintln!("snakebox worker: cannot read job: {e}");
        return EXIT_BAD_JOB;
    }
    let job: WorkerJob = match serde_json::from_str(&input) {
        Ok(job) => job,
        Err(e) => {
            eprintln!("snakebox worker: malformed job: {e}");
            return EXIT_BAD_JOB;
        }
    };
    drop(input);

    let mut interp = Interpreter::new(job.capabilities.clone(), job.limits);
    let stdout = io::stdout();
    let mut frames = FrameWriter::new(stdout.lock());
    let status = match serve(&job, &mut interp, &mut frames, true) {
        Ok(()) => EXIT_OK,
        Err(e) => {
            eprintln!("snakebox worker: {e}");
            EXIT_FAILED
        }
    };
    // Deeply nested learner values can overflow the stack while dropping;
    // the process is about to exit anyway.
    std::mem::forget(interp);
    status
}

/// Writes newline-delimited frames, flushing after each one.
pub struct FrameWriter<W: Write> {
    out: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn send(&mut self, frame: &WorkerFrame) -> Result<()> {
        serde_json::to_writer(&mut self.out, frame)
            .map_err(|e| SandboxError::Protocol(format!("cannot write frame: {e}")))?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Run `job` on `interp`. With `adjust_limits` the process rlimits are
/// moved to each phase's allowance before it starts.
pub fn serve<W: Write>(
    job: &WorkerJob,
    interp: &mut Interpreter,
    frames: &mut FrameWriter<W>,
    adjust_limits: bool,
) -> Result<()> {
    let outcome = interp
        .run_program(&job.source, &job.budget)
        .and_then(|()| interp.snapshot());
    let stdout = interp.take_output();
    let snapshot = match outcome {
        Ok(snapshot) => {
            frames.send(&WorkerFrame::Executed { stdout })?;
            snapshot
        }
        Err(failure) => return frames.send(&WorkerFrame::Failed { failure, stdout }),
    };

    if adjust_limits && job.remaining_tests() > 0 {
        hardening::phase_memory_limit(job.test_budget.memory_limit_bytes)?;
    }

    let limit = job.limits.output_limit_bytes;
    for (index, expression) in job.expressions.iter().enumerate().skip(job.start_index) {
        if adjust_limits {
            hardening::phase_cpu_limit(&job.test_budget)?;
        }
        let result = interp
            .restore(&snapshot)
            .and_then(|()| interp.evaluate(expression, &job.test_budget));
        // Output printed while a test runs is not part of the result.
        interp.take_output();
        let observation = match result {
            Ok(value) => observe(&value, limit),
            Err(error) => Observation::Raised { error },
        };
        frames.send(&WorkerFrame::Observed { index, observation })?;
    }

    frames.send(&WorkerFrame::Finished)
}

fn observe(value: &Value, limit: usize) -> Observation {
    let mut text = to_str(value);
    let mut rendered = repr(value);
    let truncated = truncate(&mut text, limit);
    truncate(&mut rendered, limit);
    Observation::Value {
        text,
        repr: rendered,
        truncated,
    }
}

/// Cut `text` to at most `limit` bytes on a character boundary.
fn truncate(text: &mut String, limit: usize) -> bool {
    if text.len() <= limit {
        return false;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilitySet;
    use crate::config::types::ResourceBudget;
    use crate::lang::{ErrorKind, Limits};

    fn job(source: &str, expressions: &[&str]) -> WorkerJob {
        WorkerJob {
            source: source.to_string(),
            expressions: expressions.iter().map(|e| e.to_string()).collect(),
            start_index: 0,
            budget: ResourceBudget::source_default(),
            test_budget: ResourceBudget::test_default(),
            capabilities: CapabilitySet::standard(),
            limits: Limits::default(),
        }
    }

    fn frames_for(job: &WorkerJob) -> Vec<WorkerFrame> {
        let mut interp = Interpreter::new(job.capabilities.clone(), job.limits);
        let mut writer = FrameWriter::new(Vec::new());
        serve(job, &mut interp, &mut writer, false).unwrap();
        let bytes = writer.into_inner();
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn source_then_each_test_then_finished() {
        let frames = frames_for(&job(
            "def add(a, b):\n    return a + b\nprint('ready')\n",
            &["add(2, 2)", "add('a', 'b')"],
        ));
        assert_eq!(frames.len(), 4);
        assert_eq!(
            frames[0],
            WorkerFrame::Executed {
                stdout: "ready\n".into()
            }
        );
        assert_eq!(
            frames[1],
            WorkerFrame::Observed {
                index: 0,
                observation: Observation::Value {
                    text: "4".into(),
                    repr: "4".into(),
                    truncated: false
                }
            }
        );
        assert_eq!(
            frames[2],
            WorkerFrame::Observed {
                index: 1,
                observation: Observation::Value {
                    text: "ab".into(),
                    repr: "'ab'".into(),
                    truncated: false
                }
            }
        );
        assert_eq!(frames[3], WorkerFrame::Finished);
    }

    #[test]
    fn failing_source_stops_after_the_failed_frame() {
        let frames = frames_for(&job("print('a')\nx = 1 / 0\n", &["x"]));
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            WorkerFrame::Failed { failure, stdout } => {
                assert_eq!(failure.kind, ErrorKind::ZeroDivision);
                assert_eq!(stdout, "a\n");
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_errors_are_observed_not_fatal() {
        let frames = frames_for(&job("x = [1]", &["x[5]", "len(x)"]));
        match &frames[1] {
            WorkerFrame::Observed {
                observation: Observation::Raised { error },
                ..
            } => assert_eq!(error.kind, ErrorKind::Index),
            other => panic!("unexpected frame {:?}", other),
        }
        assert!(matches!(
            &frames[2],
            WorkerFrame::Observed {
                index: 1,
                observation: Observation::Value { .. }
            }
        ));
    }

    #[test]
    fn resumed_job_skips_earlier_tests() {
        let mut resumed = job("y = 3", &["y", "y * 2", "y * 3"]);
        resumed.start_index = 2;
        let frames = frames_for(&resumed);
        assert_eq!(frames.len(), 3);
        assert!(matches!(frames[1], WorkerFrame::Observed { index: 2, .. }));
    }

    #[test]
    fn each_test_starts_from_the_loaded_namespace() {
        let frames = frames_for(&job(
            "lst = [1]\ntotal = {'n': 0}\n",
            &["lst.append(2)", "[lst.append(3), 1 / 0]", "lst", "total"],
        ));
        let rendered = |frame: &WorkerFrame| match frame {
            WorkerFrame::Observed {
                observation: Observation::Value { repr, .. },
                ..
            } => repr.clone(),
            other => panic!("unexpected frame {:?}", other),
        };
        assert_eq!(rendered(&frames[1]), "None");
        assert!(matches!(
            &frames[2],
            WorkerFrame::Observed {
                observation: Observation::Raised { .. },
                ..
            }
        ));
        assert_eq!(rendered(&frames[3]), "[1]");
        assert_eq!(rendered(&frames[4]), "{'n': 0}");
    }

    #[test]
    fn long_renderings_are_truncated_and_flagged() {
        let mut text = "é".repeat(10);
        assert!(truncate(&mut text, 5));
        assert_eq!(text, "éé");
        let mut short = "abc".to_string();
        assert!(!truncate(&mut short, 5));
    }
}
