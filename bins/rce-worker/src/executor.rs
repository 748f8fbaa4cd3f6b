// Per-job orchestration: compose registry, scratch, and sandbox runtime
// into a terminal ExecutionOutcome, enforcing the wall-clock deadline and
// the cleanup ordering (container removal, then scratch release, on every
// exit path).
use std::time::{Duration, Instant};

use bollard::container::RemoveContainerOptions;
use bollard::Docker;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, warn};

use rce_common::types::{ExecutionOutcome, ExecutionStatus, Job};

use crate::docker::{combine_streams, SandboxRuntime, WaitVerdict};
use crate::languages::{LanguageRegistry, LanguageSpec};
use crate::scratch::{ScratchManager, ScratchSlot};

/// Canned output for jobs that exceed their wall-clock budget.
const TIMEOUT_OUTPUT: &str = "Execution timed out. Your code took too long to execute.";
/// Reserved exit code for wall-clock-exceeded jobs. User code exiting 124 on
/// its own is reported as `failed`; consumers distinguish by status.
pub const TIMEOUT_EXIT_CODE: i64 = 124;
/// Budget for container removal and post-kill log draining.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(10);

const SCRIPT_BASENAME: &str = "script";

/// Failures that terminate a job before its container ran. Every variant
/// maps to a `failed` outcome; none of them are process errors.
#[derive(Debug, Error)]
enum ExecuteError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("failed to pull image: {0:#}")]
    ImageUnavailable(anyhow::Error),
    #[error("failed to create execution directory: {0}")]
    ScratchUnavailable(std::io::Error),
    #[error("failed to write code file: {0}")]
    CodeWrite(std::io::Error),
    #[error("{0:#}")]
    SandboxRuntime(anyhow::Error),
}

pub struct Executor {
    runtime: SandboxRuntime,
    scratch: ScratchManager,
    registry: LanguageRegistry,
    volume_name: String,
}

impl Executor {
    pub fn new(
        runtime: SandboxRuntime,
        scratch: ScratchManager,
        registry: LanguageRegistry,
        volume_name: String,
    ) -> Self {
        Self {
            runtime,
            scratch,
            registry,
            volume_name,
        }
    }

    /// Execute one job to a terminal outcome. Never returns an error: every
    /// per-job failure is folded into a `failed` outcome. `shutdown` is the
    /// process-wide cancellation signal; when it fires mid-execution the
    /// container is killed and the job finishes as `failed`/`cancelled`.
    pub async fn execute(
        &self,
        job: &Job,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ExecutionOutcome {
        let started = Instant::now();
        match self.try_execute(job, shutdown, started).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "job failed before execution");
                ExecutionOutcome::failed(e.to_string(), started.elapsed())
            }
        }
    }

    async fn try_execute(
        &self,
        job: &Job,
        shutdown: &mut watch::Receiver<bool>,
        started: Instant,
    ) -> Result<ExecutionOutcome, ExecuteError> {
        let spec = self
            .registry
            .lookup(&job.language)
            .ok_or_else(|| ExecuteError::UnsupportedLanguage(job.language.clone()))?;

        // The deadline covers everything from here on; image pulls and
        // container startup eat into the job's budget just like user code.
        let deadline = tokio::time::Instant::now() + spec.timeout;

        match tokio::time::timeout_at(deadline, self.runtime.ensure_image(&spec.image)).await {
            Ok(result) => result.map_err(ExecuteError::ImageUnavailable)?,
            Err(_) => {
                return Err(ExecuteError::ImageUnavailable(anyhow::anyhow!(
                    "pull did not finish within the {:?} job budget",
                    spec.timeout
                )))
            }
        }

        let slot = self
            .scratch
            .allocate(&job.job_id)
            .map_err(ExecuteError::ScratchUnavailable)?;

        let filename = format!("{}{}", SCRIPT_BASENAME, spec.extension);
        if let Err(e) = slot.write_code(&filename, job.code.as_bytes()) {
            self.scratch.release(&slot);
            return Err(ExecuteError::CodeWrite(e));
        }
        debug!(job_id = %job.job_id, path = %slot.host_path().join(&filename).display(), "code materialized");

        let script_path = slot.sandbox_script_path(&filename);
        let container_id = match self
            .runtime
            .create_sandbox(&job.job_id, spec, &script_path, &self.volume_name)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                self.scratch.release(&slot);
                return Err(ExecuteError::SandboxRuntime(e));
            }
        };
        debug!(job_id = %job.job_id, container_id = %short_id(&container_id), "container created");

        // Every exit path below runs cleanup(); the guard only exists to
        // catch panics and hard task cancellation, and is disarmed once the
        // normal cleanup has run.
        let guard = ContainerGuard::new(self.runtime.docker().clone(), container_id.clone());
        let outcome = self
            .run_sandbox(job, spec, &container_id, started, deadline, shutdown)
            .await;
        self.cleanup(&job.job_id, &container_id, &slot).await;
        guard.disarm();

        Ok(outcome)
    }

    /// Start the container and race its exit against the deadline and the
    /// shutdown signal.
    async fn run_sandbox(
        &self,
        job: &Job,
        spec: &LanguageSpec,
        container_id: &str,
        started: Instant,
        deadline: tokio::time::Instant,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ExecutionOutcome {
        if let Err(e) = self.runtime.start(container_id).await {
            return ExecutionOutcome::failed(format!("{e:#}"), started.elapsed());
        }

        let wait = self.runtime.wait(container_id);
        tokio::pin!(wait);
        let mut shutdown_open = true;
        let verdict = loop {
            tokio::select! {
                verdict = &mut wait => break verdict,
                _ = tokio::time::sleep_until(deadline) => {
                    return self.timeout_outcome(job, spec, container_id, started).await;
                }
                changed = shutdown.changed(), if shutdown_open => {
                    match changed {
                        Ok(()) if *shutdown.borrow() => {
                            return self.cancelled_outcome(job, container_id, started).await;
                        }
                        Ok(()) => {}
                        // Sender gone: cancellation can no longer fire.
                        Err(_) => shutdown_open = false,
                    }
                }
            }
        };

        let (exit_code, wait_error) = match verdict {
            Ok(WaitVerdict { exit_code, message }) => (exit_code, message.unwrap_or_default()),
            Err(e) => {
                // Tie-break: a wait error after the deadline fired is a
                // timeout, not a runtime failure.
                if tokio::time::Instant::now() >= deadline {
                    return self.timeout_outcome(job, spec, container_id, started).await;
                }
                (1, format!("container wait error: {e:#}"))
            }
        };
        debug!(job_id = %job.job_id, exit_code, "container finished");

        let (output, mut error) = match self.runtime.logs(container_id).await {
            Ok((stdout, stderr)) => (combine_streams(&stdout, &stderr), wait_error),
            Err(e) => {
                // Log retrieval failure does not downgrade the status; the
                // outcome just loses its output.
                warn!(job_id = %job.job_id, error = %e, "failed to retrieve container logs");
                let error = if wait_error.is_empty() {
                    format!("failed to retrieve output: {e:#}")
                } else {
                    wait_error
                };
                (String::new(), error)
            }
        };

        let status = if exit_code == 0 {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        };
        if status == ExecutionStatus::Failed && error.is_empty() {
            if let Some(hint) = exit_hint(exit_code) {
                error = hint.to_string();
            }
        }

        ExecutionOutcome {
            status,
            output,
            exit_code,
            execution_time: started.elapsed(),
            error,
        }
    }

    /// Deadline fired: kill the container and report the canned timeout
    /// outcome. The kill and the log drain run on their own budget so the
    /// expired deadline cannot abort them.
    async fn timeout_outcome(
        &self,
        job: &Job,
        spec: &LanguageSpec,
        container_id: &str,
        started: Instant,
    ) -> ExecutionOutcome {
        warn!(job_id = %job.job_id, timeout = ?spec.timeout, "execution timed out, killing container");
        self.runtime.kill(container_id).await;
        let execution_time = started.elapsed();

        // The canned message is what the client sees, but the captured
        // streams are still drained so the runtime's buffers are released.
        match timeout(CLEANUP_TIMEOUT, self.runtime.logs(container_id)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => debug!(job_id = %job.job_id, error = %e, "discarding logs after timeout failed"),
            Err(_) => debug!(job_id = %job.job_id, "log drain after timeout did not finish"),
        }

        ExecutionOutcome {
            status: ExecutionStatus::Timeout,
            output: TIMEOUT_OUTPUT.to_string(),
            exit_code: TIMEOUT_EXIT_CODE,
            execution_time,
            error: format!("execution exceeded {:?} limit", spec.timeout),
        }
    }

    /// Process shutdown fired mid-execution: kill the container and finish
    /// the job as failed so the record store still reaches a terminal state.
    async fn cancelled_outcome(
        &self,
        job: &Job,
        container_id: &str,
        started: Instant,
    ) -> ExecutionOutcome {
        warn!(job_id = %job.job_id, "shutdown requested, killing in-flight container");
        self.runtime.kill(container_id).await;
        let execution_time = started.elapsed();

        let output = match timeout(CLEANUP_TIMEOUT, self.runtime.logs(container_id)).await {
            Ok(Ok((stdout, stderr))) => combine_streams(&stdout, &stderr),
            _ => String::new(),
        };

        ExecutionOutcome {
            status: ExecutionStatus::Failed,
            output,
            exit_code: 1,
            execution_time,
            error: "cancelled".to_string(),
        }
    }

    /// Container removal first, then scratch release: the container's
    /// read-only mount must never be pulled out from under it. Runs under a
    /// fresh budget so an expired job deadline cannot abort cleanup.
    async fn cleanup(&self, job_id: &str, container_id: &str, slot: &ScratchSlot) {
        match timeout(CLEANUP_TIMEOUT, self.runtime.remove(container_id)).await {
            Ok(Ok(())) => debug!(job_id, container_id = %short_id(container_id), "container removed"),
            Ok(Err(e)) => warn!(job_id, error = %e, "failed to remove container"),
            Err(_) => warn!(job_id, "container removal timed out"),
        }
        self.scratch.release(slot);
    }
}

/// Diagnostic for kill-by-kernel exits when the runtime supplied no message.
fn exit_hint(exit_code: i64) -> Option<&'static str> {
    match exit_code {
        137 => Some("container killed: likely exceeded the memory limit"),
        139 => Some("container killed: segmentation fault"),
        _ => None,
    }
}

fn short_id(container_id: &str) -> &str {
    &container_id[..container_id.len().min(12)]
}

/// Removal backstop for panics and hard cancellation. The normal path
/// removes the container explicitly and disarms the guard, so this only
/// fires when the executor future was torn down mid-job.
struct ContainerGuard {
    docker: Docker,
    container_id: String,
    armed: bool,
}

impl ContainerGuard {
    fn new(docker: Docker, container_id: String) -> Self {
        Self {
            docker,
            container_id,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let docker = self.docker.clone();
        let container_id = self.container_id.clone();
        tokio::spawn(async move {
            let options = RemoveContainerOptions {
                force: true,
                v: true,
                ..Default::default()
            };
            if let Err(e) = docker.remove_container(&container_id, Some(options)).await {
                error!(container_id = %container_id, error = %e, "guard cleanup failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pre_container_failures_read_like_diagnostics() {
        let e = ExecuteError::UnsupportedLanguage("brainfuck".to_string());
        assert_eq!(e.to_string(), "unsupported language: brainfuck");

        let e = ExecuteError::ScratchUnavailable(std::io::Error::new(
            std::io::ErrorKind::Other,
            "disk full",
        ));
        assert!(e.to_string().starts_with("failed to create execution directory:"));
    }

    #[test]
    fn oom_and_segfault_exits_get_a_hint() {
        assert!(exit_hint(137).unwrap().contains("memory"));
        assert!(exit_hint(139).unwrap().contains("segmentation"));
        assert!(exit_hint(1).is_none());
        assert!(exit_hint(0).is_none());
    }

    #[test]
    fn short_id_handles_short_inputs() {
        assert_eq!(short_id("abc"), "abc");
        assert_eq!(short_id("0123456789abcdef"), "0123456789ab");
    }
}
