// Dispatcher loop: the long-lived consumer that moves jobs from the work
// queue through the executor and into the record store, one at a time so
// resource pressure stays predictable.
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use redis::aio::ConnectionManager;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use rce_common::redis as wire;
use rce_common::types::{AnalysisNotification, ExecutionOutcome, Job};

use crate::executor::Executor;

/// BLPOP poll window; short enough that the shutdown flag is observed
/// promptly between jobs.
const POP_TIMEOUT_SECONDS: f64 = 5.0;
/// Backoff after a transient queue error.
const QUEUE_RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct Dispatcher {
    queue: ConnectionManager,
    store: ConnectionManager,
    executor: Arc<Executor>,
    shutdown: watch::Receiver<bool>,
}

impl Dispatcher {
    pub fn new(
        queue: ConnectionManager,
        store: ConnectionManager,
        executor: Arc<Executor>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue,
            store,
            executor,
            shutdown,
        }
    }

    /// Consume jobs until shutdown. Per-job failures never break the loop;
    /// only the shutdown signal ends it.
    pub async fn run(mut self) -> Result<()> {
        info!(queue = wire::SUBMISSION_QUEUE, "worker ready, waiting for jobs");

        while !*self.shutdown.borrow() {
            // Biased so a payload the server already popped is processed
            // rather than dropped when shutdown fires in the same instant.
            let popped = tokio::select! {
                biased;
                result = wire::pop_job(&mut self.queue, POP_TIMEOUT_SECONDS) => result,
                _ = self.shutdown.changed() => break,
            };

            match popped {
                Ok(Some(payload)) => self.process(payload).await,
                Ok(None) => continue, // poll window elapsed, re-check shutdown
                Err(e) => {
                    error!(error = %e, "queue error");
                    tokio::time::sleep(QUEUE_RETRY_DELAY).await;
                }
            }
        }

        info!("dispatcher stopped");
        Ok(())
    }

    async fn process(&mut self, payload: String) {
        debug!(payload = %truncate(&payload, 200), "dequeued job payload");

        // Malformed payloads indicate a producer bug, not user input; drop
        // rather than retry.
        let job = match parse_job(&payload) {
            Ok(job) => job,
            Err(e) => {
                error!(error = %e, "dropping malformed job payload");
                return;
            }
        };

        info!(
            job_id = %job.job_id,
            language = %job.language,
            code = %truncate(&job.code, 100),
            phase = "dequeued",
            "processing job"
        );

        if let Err(e) = wire::mark_processing(&mut self.store, &job.job_id).await {
            // The submission stays `queued` and is observable as stuck;
            // executing without the processing transition would violate the
            // record ordering readers rely on.
            error!(job_id = %job.job_id, error = %e, "failed to mark job as processing, skipping execution");
            return;
        }

        let outcome = self.execute_caught(&job).await;

        info!(
            job_id = %job.job_id,
            status = %outcome.status,
            exit_code = outcome.exit_code,
            execution_ms = outcome.execution_time.as_millis() as u64,
            phase = "executed",
            "execution finished"
        );

        if let Err(e) = wire::store_outcome(&mut self.store, &job.job_id, &outcome).await {
            // Lost to observers, but the sandbox is already cleaned up.
            // Nothing is published downstream without a terminal record.
            error!(job_id = %job.job_id, error = %e, "failed to store terminal outcome");
            return;
        }

        let note = AnalysisNotification::from(&job);
        if let Err(e) = wire::publish_analysis(&mut self.queue, &note).await {
            // Advisory only; the execution itself is already finalized.
            warn!(job_id = %job.job_id, error = %e, "failed to publish analysis notification");
        }

        info!(job_id = %job.job_id, phase = "done", "job finalized");
    }

    /// Run the executor in its own task so a panic surfaces as a `failed`
    /// outcome instead of tearing down the dispatcher.
    async fn execute_caught(&self, job: &Job) -> ExecutionOutcome {
        let executor = Arc::clone(&self.executor);
        let job = job.clone();
        let mut shutdown = self.shutdown.clone();
        let started = std::time::Instant::now();

        let handle = tokio::spawn(async move { executor.execute(&job, &mut shutdown).await });
        match handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "executor task died");
                ExecutionOutcome::failed("executor panicked", started.elapsed())
            }
        }
    }
}

fn parse_job(payload: &str) -> serde_json::Result<Job> {
    serde_json::from_str(payload)
}

/// Log-preview truncation, safe on multi-byte boundaries.
fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_payload_parses() {
        let payload = r#"{"jobId":"j1","language":"python","code":"print(1)","submittedAt":"2026-01-01T00:00:00Z"}"#;
        let job = parse_job(payload).unwrap();
        assert_eq!(job.job_id, "j1");
        assert_eq!(job.language, "python");
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        assert!(parse_job("not json").is_err());
        assert!(parse_job("{}").is_err());
        // Missing jobId.
        assert!(parse_job(
            r#"{"language":"python","code":"print(1)","submittedAt":"2026-01-01T00:00:00Z"}"#
        )
        .is_err());
    }

    #[test]
    fn truncate_is_char_boundary_safe() {
        assert_eq!(truncate("short", 200), "short");
        assert_eq!(truncate("abcdef", 3), "abc...");
        assert_eq!(truncate("héllo wörld", 4), "héll...");
    }
}
