//! Judges one test observation against its expected text.

use crate::config::types::{TestCase, TestOutcome, TestStatus};
use crate::engine::Failure;
use crate::lang::format::repr_str;
use crate::lang::{ErrorKind, ScriptError};
use crate::limiter::Observation;

/// `pass` when the `str()` rendering equals the expected text, `fail` with
/// a comparison message otherwise, `error` when evaluation raised.
pub fn judge(test: &TestCase, observation: &Observation) -> TestOutcome {
    match observation {
        Observation::Value {
            text,
            repr,
            truncated,
        } => {
            if !truncated && *text == test.expected {
                passed(test)
            } else {
                let received = if *truncated {
                    format!("{repr}...")
                } else {
                    repr.clone()
                };
                TestOutcome {
                    expression: test.expression.clone(),
                    status: TestStatus::Fail,
                    message: Some(mismatch_message(&test.expected, &received)),
                }
            }
        }
        Observation::Raised { error } => errored(test, raised_message(error)),
    }
}

/// Limit breaches caught by the worker read the same as the ones the
/// supervisor enforces by killing it.
fn raised_message(error: &ScriptError) -> String {
    match error.kind {
        ErrorKind::Timeout | ErrorKind::Memory | ErrorKind::OutputLimit => {
            Failure::from_script(error).description
        }
        _ => error.to_string(),
    }
}

pub fn passed(test: &TestCase) -> TestOutcome {
    TestOutcome {
        expression: test.expression.clone(),
        status: TestStatus::Pass,
        message: None,
    }
}

pub fn errored(test: &TestCase, description: impl Into<String>) -> TestOutcome {
    TestOutcome {
        expression: test.expression.clone(),
        status: TestStatus::Error,
        message: Some(description.into()),
    }
}

pub fn mismatch_message(expected: &str, received_repr: &str) -> String {
    format!("Expected {} but received {}", repr_str(expected), received_repr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(text: &str, repr: &str) -> Observation {
        Observation::Value {
            text: text.into(),
            repr: repr.into(),
            truncated: false,
        }
    }

    #[test]
    fn equal_rendering_passes() {
        let outcome = judge(&TestCase::new("x", "4"), &value("4", "4"));
        assert_eq!(outcome.status, TestStatus::Pass);
        assert_eq!(outcome.message, None);
    }

    #[test]
    fn strings_compare_by_str_not_repr() {
        let outcome = judge(&TestCase::new("name", "ada"), &value("ada", "'ada'"));
        assert_eq!(outcome.status, TestStatus::Pass);
    }

    #[test]
    fn mismatch_names_expected_and_received() {
        let outcome = judge(&TestCase::new("f(3)", "7"), &value("6", "6"));
        assert_eq!(outcome.status, TestStatus::Fail);
        assert_eq!(outcome.message.as_deref(), Some("Expected '7' but received 6"));
    }

    #[test]
    fn received_strings_are_quoted() {
        let outcome = judge(&TestCase::new("s", "ab"), &value("a b", "'a b'"));
        assert_eq!(
            outcome.message.as_deref(),
            Some("Expected 'ab' but received 'a b'")
        );
    }

    #[test]
    fn truncated_rendering_never_passes() {
        let observation = Observation::Value {
            text: "aaaa".into(),
            repr: "'aaaa".into(),
            truncated: true,
        };
        let outcome = judge(&TestCase::new("s", "aaaa"), &observation);
        assert_eq!(outcome.status, TestStatus::Fail);
        assert!(outcome.message.unwrap().ends_with("'aaaa..."));
    }

    #[test]
    fn raised_errors_become_error_outcomes() {
        let observation = Observation::Raised {
            error: ScriptError::new(ErrorKind::ZeroDivision, "division by zero"),
        };
        let outcome = judge(&TestCase::new("1/0", "0"), &observation);
        assert_eq!(outcome.status, TestStatus::Error);
        assert_eq!(
            outcome.message.as_deref(),
            Some("ZeroDivisionError: division by zero")
        );
    }

    #[test]
    fn memory_breaches_share_the_resource_label() {
        let observation = Observation::Raised {
            error: ScriptError::new(ErrorKind::Memory, "memory limit of 64 MiB exceeded"),
        };
        let outcome = judge(&TestCase::new("[0] * 10**9", "0"), &observation);
        assert_eq!(outcome.status, TestStatus::Error);
        assert_eq!(
            outcome.message.as_deref(),
            Some("ResourceExceeded: memory limit of 64 MiB exceeded")
        );

        let observation = Observation::Raised {
            error: ScriptError::new(ErrorKind::Timeout, "CPU time limit of 1000 ms exceeded"),
        };
        let outcome = judge(&TestCase::new("spin()", "0"), &observation);
        assert_eq!(
            outcome.message.as_deref(),
            Some("Timeout: CPU time limit of 1000 ms exceeded")
        );
    }
}
