//! Builds the terminal [`ExecutionResult`].

use crate::config::types::{ExecutionResult, ExecutionStatus, TestOutcome, TestStatus};
use crate::engine::Failure;

pub const ALL_PASSED: &str = "All tests passed!";
pub const REVIEW_FAILURES: &str = "Review the failing tests.";

/// An empty test list counts as all passed.
pub fn feedback_for(outcomes: &[TestOutcome]) -> &'static str {
    if outcomes.iter().all(|o| o.status == TestStatus::Pass) {
        ALL_PASSED
    } else {
        REVIEW_FAILURES
    }
}

pub fn report(stdout: String, outcomes: Vec<TestOutcome>) -> ExecutionResult {
    ExecutionResult {
        status: ExecutionStatus::Success,
        stdout,
        feedback: feedback_for(&outcomes).to_string(),
        tests: outcomes,
    }
}

pub fn report_failure(failure: &Failure, stdout: String) -> ExecutionResult {
    ExecutionResult {
        status: ExecutionStatus::Error,
        stdout,
        feedback: failure.feedback(),
        tests: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::FailureKind;

    fn outcome(status: TestStatus) -> TestOutcome {
        TestOutcome {
            expression: "x".into(),
            status,
            message: None,
        }
    }

    #[test]
    fn zero_tests_count_as_all_passed() {
        let result = report(String::new(), vec![]);
        assert!(result.is_success());
        assert_eq!(result.feedback, ALL_PASSED);
    }

    #[test]
    fn any_non_pass_asks_for_review() {
        for bad in [TestStatus::Fail, TestStatus::Error] {
            let result = report(
                "out\n".into(),
                vec![outcome(TestStatus::Pass), outcome(bad)],
            );
            assert_eq!(result.status, ExecutionStatus::Success);
            assert_eq!(result.feedback, REVIEW_FAILURES);
            assert_eq!(result.tests.len(), 2);
            assert_eq!(result.stdout, "out\n");
        }
    }

    #[test]
    fn failures_have_no_tests_and_prefixed_feedback() {
        let failure = Failure {
            kind: FailureKind::CompileOrRuntimeError,
            limit: None,
            description: "ZeroDivisionError: division by zero (line 1)".into(),
        };
        let result = report_failure(&failure, "partial\n".into());
        assert_eq!(result.status, ExecutionStatus::Error);
        assert!(result.tests.is_empty());
        assert_eq!(
            result.feedback,
            "Execution failed: ZeroDivisionError: division by zero (line 1)"
        );
        assert_eq!(result.stdout, "partial\n");
    }
}
