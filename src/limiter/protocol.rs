//! Parent/worker wire format.
//!
//! The parent writes one [`WorkerJob`] as JSON on the worker's stdin and
//! closes it. The worker answers with newline-delimited [`WorkerFrame`]s on
//! stdout: one `executed` or `failed` frame for the source, then one
//! `observed` frame per test expression, then `finished`.

use crate::capability::CapabilitySet;
use crate::config::types::ResourceBudget;
use crate::lang::{Limits, ScriptError};
use serde::{Deserialize, Serialize};

/// Everything a worker needs to run one submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerJob {
    pub source: String,
    pub expressions: Vec<String>,
    /// First expression to evaluate. Non-zero when a replacement worker
    /// resumes after a predecessor was killed.
    #[serde(default)]
    pub start_index: usize,
    pub budget: ResourceBudget,
    pub test_budget: ResourceBudget,
    pub capabilities: CapabilitySet,
    pub limits: Limits,
}

impl WorkerJob {
    pub fn remaining_tests(&self) -> usize {
        self.expressions.len().saturating_sub(self.start_index)
    }
}

/// What a test expression produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Observation {
    Value {
        /// `str()` rendering, cut short when `truncated` is set.
        text: String,
        repr: String,
        #[serde(default)]
        truncated: bool,
    },
    Raised {
        error: ScriptError,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum WorkerFrame {
    Executed {
        stdout: String,
    },
    Failed {
        failure: ScriptError,
        stdout: String,
    },
    Observed {
        index: usize,
        observation: Observation,
    },
    Finished,
}

/// Upper bound on a single frame line for a given output limit. Leaves
/// room for JSON escaping of the captured text and the framing itself.
pub fn max_frame_bytes(limits: &Limits) -> usize {
    limits.output_limit_bytes.saturating_mul(6).saturating_add(64 * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::ErrorKind;

    #[test]
    fn frames_are_tagged_on_the_wire() {
        let frame = WorkerFrame::Observed {
            index: 2,
            observation: Observation::Value {
                text: "4".into(),
                repr: "4".into(),
                truncated: false,
            },
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.starts_with(r#"{"frame":"observed","index":2"#));
        assert_eq!(serde_json::from_str::<WorkerFrame>(&json).unwrap(), frame);

        let finished = serde_json::to_string(&WorkerFrame::Finished).unwrap();
        assert_eq!(finished, r#"{"frame":"finished"}"#);
    }

    #[test]
    fn failed_frame_carries_the_script_error() {
        let json = r#"{"frame":"failed","failure":{"kind":"ZeroDivision","message":"division by zero","line":3},"stdout":"hi\n"}"#;
        let frame: WorkerFrame = serde_json::from_str(json).unwrap();
        match frame {
            WorkerFrame::Failed { failure, stdout } => {
                assert_eq!(failure.kind, ErrorKind::ZeroDivision);
                assert_eq!(failure.line, Some(3));
                assert_eq!(stdout, "hi\n");
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn remaining_tests_counts_from_start_index() {
        let job = WorkerJob {
            source: String::new(),
            expressions: vec!["a".into(), "b".into(), "c".into()],
            start_index: 2,
            budget: ResourceBudget::source_default(),
            test_budget: ResourceBudget::test_default(),
            capabilities: CapabilitySet::minimal(),
            limits: Limits::default(),
        };
        assert_eq!(job.remaining_tests(), 1);
        let json = serde_json::to_string(&job).unwrap();
        assert_eq!(serde_json::from_str::<WorkerJob>(&json).unwrap(), job);
    }
}
