use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Job envelope shared with the submission API.
///
/// The API gateway writes this structure verbatim onto the work queue; the
/// analysis worker reads the same field names from the broadcast channel.
/// The four fields are a cross-service contract - renames are pinned to the
/// JSON schema and must not drift.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: String,
    pub language: String,
    pub code: String,
    pub submitted_at: String,
}

/// Terminal state of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Completed,
    Failed,
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal tuple produced by the executor for every job.
///
/// `exit_code` 124 is reserved for wall-clock timeouts; a normal exit never
/// produces it from the executor's side. `error` is empty unless the status
/// is not `completed`.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub output: String,
    pub exit_code: i64,
    pub execution_time: Duration,
    pub error: String,
}

impl ExecutionOutcome {
    /// A `failed` outcome for jobs that never reached a container.
    pub fn failed(error: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            output: String::new(),
            exit_code: 1,
            execution_time: elapsed,
            error: error.into(),
        }
    }
}

/// Fire-and-forget message published for the analysis worker once a job
/// reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisNotification {
    pub job_id: String,
    pub language: String,
    pub code: String,
}

impl From<&Job> for AnalysisNotification {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.job_id.clone(),
            language: job.language.clone(),
            code: job.code.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_wire_field_names_match_the_shared_schema() {
        let job = Job {
            job_id: "abc-123".to_string(),
            language: "python".to_string(),
            code: "print(1)".to_string(),
            submitted_at: "2026-01-01T00:00:00Z".to_string(),
        };

        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["jobId"], "abc-123");
        assert_eq!(json["language"], "python");
        assert_eq!(json["code"], "print(1)");
        assert_eq!(json["submittedAt"], "2026-01-01T00:00:00Z");
    }

    #[test]
    fn job_parses_from_producer_payload() {
        let payload = r#"{"jobId":"j1","language":"javascript","code":"console.log(1)","submittedAt":"2026-01-01T00:00:00Z"}"#;
        let job: Job = serde_json::from_str(payload).unwrap();
        assert_eq!(job.job_id, "j1");
        assert_eq!(job.language, "javascript");
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(ExecutionStatus::Completed.to_string(), "completed");
        assert_eq!(ExecutionStatus::Failed.to_string(), "failed");
        assert_eq!(ExecutionStatus::Timeout.to_string(), "timeout");
    }

    #[test]
    fn notification_carries_the_job_fields() {
        let job = Job {
            job_id: "j2".to_string(),
            language: "python".to_string(),
            code: "1/0".to_string(),
            submitted_at: "2026-01-01T00:00:00Z".to_string(),
        };

        let note = AnalysisNotification::from(&job);
        let json = serde_json::to_value(&note).unwrap();
        assert_eq!(json["jobId"], "j2");
        assert_eq!(json["language"], "python");
        assert_eq!(json["code"], "1/0");
        assert!(json.get("submittedAt").is_none());
    }
}
