use std::env;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_SCRATCH_VOLUME: &str = "rce-executions";
const DEFAULT_SCRATCH_HOST_PATH: &str = "/tmp/executions";
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2000;

/// Worker configuration resolved from the environment, with the defaults the
/// deployment manifests assume.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Connection string for the work queue.
    pub queue_url: String,
    /// Connection string for the submission record store.
    pub record_store_url: String,
    /// Named volume the sandbox containers mount at /code.
    pub scratch_volume_name: String,
    /// Where the worker sees the same volume.
    pub scratch_host_path: PathBuf,
    /// Container runtime control socket; local defaults when unset.
    pub sandbox_runtime_socket: Option<String>,
    /// How long an in-flight job may keep unwinding after a termination
    /// signal before the process exits anyway.
    pub shutdown_grace: Duration,
    /// Optional languages.json overriding the built-in registry.
    pub languages_file: Option<PathBuf>,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let grace_ms = env::var("SHUTDOWN_GRACE_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_SHUTDOWN_GRACE_MS);

        Self {
            queue_url: env_or("QUEUE_URL", DEFAULT_REDIS_URL),
            record_store_url: env_or("RECORD_STORE_URL", DEFAULT_REDIS_URL),
            scratch_volume_name: env_or("SCRATCH_VOLUME_NAME", DEFAULT_SCRATCH_VOLUME),
            scratch_host_path: PathBuf::from(env_or("SCRATCH_HOST_PATH", DEFAULT_SCRATCH_HOST_PATH)),
            sandbox_runtime_socket: env::var("SANDBOX_RUNTIME_SOCKET").ok(),
            shutdown_grace: Duration::from_millis(grace_ms),
            languages_file: env::var("LANGUAGES_FILE").ok().map(PathBuf::from),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
