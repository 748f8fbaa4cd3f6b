use redis::{AsyncCommands, RedisResult};

use crate::types::{AnalysisNotification, ExecutionOutcome};

/// Redis naming shared by the submission API, the execution worker, and the
/// analysis worker. Names are deterministic so the services never drift.

pub const SUBMISSION_QUEUE: &str = "submission_queue";
pub const ANALYSIS_CHANNEL: &str = "analysis_queue";
pub const RECORD_PREFIX: &str = "submission";

/// Record-store key for a submission.
pub fn record_key(job_id: &str) -> String {
    format!("{}:{}", RECORD_PREFIX, job_id)
}

/// Pop one raw job payload from the head of the work queue.
///
/// Uses BLPOP with a timeout so the caller can observe shutdown between
/// polls. The payload is returned unparsed: a malformed payload is the
/// dispatcher's decision to drop, not a queue error.
pub async fn pop_job(
    conn: &mut redis::aio::ConnectionManager,
    timeout_seconds: f64,
) -> RedisResult<Option<String>> {
    let result: Option<(String, String)> = conn.blpop(SUBMISSION_QUEUE, timeout_seconds).await?;
    Ok(result.map(|(_queue, payload)| payload))
}

/// Transition a submission record `queued -> processing`.
///
/// Partial update on the record hash; fields are only ever set, never unset.
pub async fn mark_processing(
    conn: &mut redis::aio::ConnectionManager,
    job_id: &str,
) -> RedisResult<()> {
    let started_at = now_rfc3339();
    let fields: [(&str, &str); 2] = [("status", "processing"), ("startedAt", &started_at)];
    let _: () = conn.hset_multiple(record_key(job_id), &fields).await?;
    Ok(())
}

/// Write the terminal transition for a submission record.
///
/// Overwriting an already-terminal record is benign; the write is an
/// unconditional replace of the outcome fields.
pub async fn store_outcome(
    conn: &mut redis::aio::ConnectionManager,
    job_id: &str,
    outcome: &ExecutionOutcome,
) -> RedisResult<()> {
    let mut fields: Vec<(&str, String)> = vec![
        ("status", outcome.status.to_string()),
        ("completedAt", now_rfc3339()),
        ("output", outcome.output.clone()),
        (
            "executionTime",
            outcome.execution_time.as_millis().to_string(),
        ),
        ("exitCode", outcome.exit_code.to_string()),
    ];
    if !outcome.error.is_empty() {
        fields.push(("error", outcome.error.clone()));
    }

    let _: () = conn.hset_multiple(record_key(job_id), &fields).await?;
    Ok(())
}

/// Publish a terminal-state notification for the analysis worker.
/// Fire-and-forget; there is no acknowledgment.
pub async fn publish_analysis(
    conn: &mut redis::aio::ConnectionManager,
    note: &AnalysisNotification,
) -> RedisResult<()> {
    let payload = serde_json::to_string(note).map_err(|e| {
        redis::RedisError::from((
            redis::ErrorKind::TypeError,
            "serialization error",
            e.to_string(),
        ))
    })?;

    let _: () = conn.publish(ANALYSIS_CHANNEL, payload).await?;
    Ok(())
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn queue_and_channel_names_are_pinned() {
        // The API gateway pushes here and the analysis worker subscribes
        // there; renaming either breaks the deployment.
        assert_eq!(SUBMISSION_QUEUE, "submission_queue");
        assert_eq!(ANALYSIS_CHANNEL, "analysis_queue");
    }

    #[test]
    fn record_key_is_deterministic() {
        let id = Uuid::new_v4().to_string();
        assert_eq!(record_key(&id), record_key(&id));
        assert_eq!(record_key("abc"), "submission:abc");
    }

    #[test]
    fn timestamps_are_rfc3339_utc() {
        let ts = now_rfc3339();
        assert!(ts.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
    }
}
