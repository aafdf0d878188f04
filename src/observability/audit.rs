/// Audit trail for executions.
///
/// Every execution gets a run id and a SHA-256 fingerprint of its source;
/// the events below are emitted as one JSON object each under the
/// `snakebox::audit` log target. Source text is never logged.
use crate::config::types::{ExecutionRequest, ExecutionResult, LimitKind, ResourceBudget};
use crate::limiter::KillReport;
use log::Level;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{Instant, SystemTime};
use uuid::Uuid;

pub const AUDIT_TARGET: &str = "snakebox::audit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditSeverity {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    ExecutionStart,
    ExecutionEnd,
    CapabilityViolation,
    LimitBreach,
    WorkerKill,
    WorkerRestart,
}

impl AuditEventType {
    pub fn default_severity(&self) -> AuditSeverity {
        match self {
            AuditEventType::ExecutionStart => AuditSeverity::Low,
            AuditEventType::ExecutionEnd => AuditSeverity::Low,
            AuditEventType::CapabilityViolation => AuditSeverity::High,
            AuditEventType::LimitBreach => AuditSeverity::Medium,
            AuditEventType::WorkerKill => AuditSeverity::Medium,
            AuditEventType::WorkerRestart => AuditSeverity::Medium,
        }
    }
}

impl AuditSeverity {
    fn level(self) -> Level {
        match self {
            AuditSeverity::High => Level::Warn,
            AuditSeverity::Medium => Level::Info,
            AuditSeverity::Low => Level::Debug,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub severity: AuditSeverity,
    pub timestamp: SystemTime,
    pub run_id: String,
    pub details: String,
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, run_id: &str, details: impl Into<String>) -> Self {
        Self {
            severity: event_type.default_severity(),
            event_type,
            timestamp: SystemTime::now(),
            run_id: run_id.to_string(),
            details: details.into(),
            fields: serde_json::Map::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
        self.fields.insert(key.to_string(), value);
        self
    }

    /// Flat JSON record written to the log.
    pub fn to_json(&self) -> serde_json::Value {
        let mut entry = serde_json::json!({
            "timestamp": self.timestamp
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            "event_type": self.event_type,
            "severity": self.severity,
            "run_id": self.run_id,
            "details": self.details,
            "process_id": std::process::id(),
        });
        if let Some(object) = entry.as_object_mut() {
            for (key, value) in &self.fields {
                object.insert(key.clone(), value.clone());
            }
        }
        entry
    }

    pub fn emit(&self) {
        log::log!(target: AUDIT_TARGET, self.severity.level(), "{}", self.to_json());
    }
}

/// SHA-256 of the submitted source, hex encoded.
pub fn fingerprint(source: &str) -> String {
    format!("{:x}", Sha256::digest(source.as_bytes()))
}

/// Audit context for one execution.
#[derive(Debug)]
pub struct ExecutionAudit {
    run_id: String,
    fingerprint: String,
    started: Instant,
}

impl ExecutionAudit {
    /// Open the trail and emit the start event.
    pub fn start(request: &ExecutionRequest, budget: &ResourceBudget) -> Self {
        let audit = Self {
            run_id: Uuid::new_v4().to_string(),
            fingerprint: fingerprint(&request.source),
            started: Instant::now(),
        };
        AuditEvent::new(AuditEventType::ExecutionStart, &audit.run_id, "execution started")
            .with_field("source_sha256", &audit.fingerprint)
            .with_field("source_bytes", request.source.len())
            .with_field("tests", request.tests.len())
            .with_field("budget", budget)
            .emit();
        audit
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn capability_violation(&self, phase: &str, description: &str) {
        AuditEvent::new(AuditEventType::CapabilityViolation, &self.run_id, description)
            .with_field("phase", phase)
            .with_field("source_sha256", &self.fingerprint)
            .emit();
    }

    pub fn limit_breach(&self, phase: &str, limit: LimitKind, description: &str) {
        AuditEvent::new(AuditEventType::LimitBreach, &self.run_id, description)
            .with_field("phase", phase)
            .with_field("limit", limit)
            .emit();
    }

    pub fn worker_killed(&self, phase: &str, report: &KillReport) {
        AuditEvent::new(AuditEventType::WorkerKill, &self.run_id, "worker group killed")
            .with_field("phase", phase)
            .with_field("kill_report", report)
            .emit();
    }

    pub fn worker_restarted(&self, resume_at: usize) {
        AuditEvent::new(
            AuditEventType::WorkerRestart,
            &self.run_id,
            format!("replacement worker resumes at test {resume_at}"),
        )
        .with_field("resume_at", resume_at)
        .emit();
    }

    /// Emit the end event. Returns the elapsed time in milliseconds.
    pub fn finish(&self, result: &ExecutionResult) -> u64 {
        let duration_ms = self.started.elapsed().as_millis() as u64;
        AuditEvent::new(AuditEventType::ExecutionEnd, &self.run_id, result.feedback.as_str())
            .with_field("status", result.status)
            .with_field("tests", result.tests.len())
            .with_field("duration_ms", duration_ms)
            .emit();
        log::info!(
            "execution {} finished in {} ms ({:?})",
            self.run_id,
            duration_ms,
            result.status
        );
        duration_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{ExecutionStatus, TestCase};

    #[test]
    fn fingerprint_is_sha256_hex() {
        assert_eq!(
            fingerprint(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(fingerprint("x = 1").len(), 64);
    }

    #[test]
    fn event_json_is_flat_and_carries_fields() {
        let event = AuditEvent::new(AuditEventType::LimitBreach, "run-1", "cpu")
            .with_field("limit", LimitKind::CpuTime)
            .with_field("phase", "source");
        let json = event.to_json();
        assert_eq!(json["event_type"], "limit_breach");
        assert_eq!(json["severity"], "Medium");
        assert_eq!(json["run_id"], "run-1");
        assert_eq!(json["limit"], "cpu_time");
        assert_eq!(json["phase"], "source");
    }

    #[test]
    fn start_fingerprints_the_source() {
        let request = ExecutionRequest::new(
            "secret_token = 'hunter2'",
            vec![TestCase::new("secret_token", "'x'")],
        );
        let audit = ExecutionAudit::start(&request, &ResourceBudget::source_default());
        assert_eq!(audit.fingerprint(), fingerprint(&request.source));
        assert_eq!(audit.run_id().len(), 36);

        let result = ExecutionResult {
            status: ExecutionStatus::Success,
            stdout: String::new(),
            feedback: "All tests passed!".into(),
            tests: vec![],
        };
        let _ = audit.finish(&result);
    }

    #[test]
    fn capability_violations_are_high_severity() {
        assert_eq!(
            AuditEventType::CapabilityViolation.default_severity(),
            AuditSeverity::High
        );
    }
}
