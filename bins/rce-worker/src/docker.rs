// Sandbox runtime adapter: a narrow surface over the Docker API.
//
// The worker runs as a container itself and spawns sibling sandboxes on the
// host daemon through the mounted socket. Code reaches the sandbox through
// the shared named volume, never through the image.
use anyhow::{bail, Context, Result};
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::Docker;
use futures_util::stream::StreamExt;
use tracing::{debug, info};

use crate::languages::LanguageSpec;
use crate::scratch::SANDBOX_MOUNT;

// Resource caps applied to every sandbox.
const MEMORY_LIMIT: i64 = 128 * 1024 * 1024;
const MEMORY_SWAP: i64 = MEMORY_LIMIT; // swap equal to memory: no swap
const CPU_QUOTA: i64 = 50_000; // 50% of one core
const CPU_PERIOD: i64 = 100_000;
const PIDS_LIMIT: i64 = 50;
const SANDBOX_USER: &str = "nobody";

const DOCKER_CONNECT_TIMEOUT_SECS: u64 = 120;

/// How a container wait resolved: the exit code the runtime reported, plus
/// any runtime-supplied diagnostic.
#[derive(Debug)]
pub struct WaitVerdict {
    pub exit_code: i64,
    pub message: Option<String>,
}

pub struct SandboxRuntime {
    docker: Docker,
}

impl SandboxRuntime {
    /// Connect to the container runtime control socket, or the environment's
    /// local defaults when no socket is configured.
    pub fn connect(socket: Option<&str>) -> Result<Self> {
        let docker = match socket {
            Some(path) => Docker::connect_with_unix(
                path,
                DOCKER_CONNECT_TIMEOUT_SECS,
                bollard::API_DEFAULT_VERSION,
            )
            .with_context(|| format!("failed to connect to Docker at {}", path))?,
            None => Docker::connect_with_local_defaults()
                .context("failed to connect to Docker daemon")?,
        };
        Ok(Self { docker })
    }

    /// Verify daemon connectivity and log the server version.
    pub async fn verify(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .context("Docker daemon did not answer ping")?;
        let version = self.docker.version().await?;
        info!(
            server_version = version.version.as_deref().unwrap_or("unknown"),
            "Docker daemon connection verified"
        );
        Ok(())
    }

    /// Pull the image if it is not present locally. Idempotent; the pull
    /// progress stream is drained and discarded.
    pub async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image, "image present locally");
            return Ok(());
        }

        info!(image, "pulling image");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            progress?;
        }
        info!(image, "image pulled");
        Ok(())
    }

    /// Create (but do not start) a sandbox for one job.
    ///
    /// The name derives from the job id, so a concurrent duplicate of the
    /// same job fails loudly right here instead of racing on the scratch
    /// slot. Applies the full security profile: no network, unprivileged
    /// user, memory/CPU/pid caps, all capabilities dropped, code mounted
    /// read-only.
    pub async fn create_sandbox(
        &self,
        job_id: &str,
        spec: &LanguageSpec,
        script_path: &str,
        volume_name: &str,
    ) -> Result<String> {
        let mut env = vec!["HOME=/tmp".to_string()];
        env.extend(spec.env.iter().cloned());

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(vec![spec.executor.clone(), script_path.to_string()]),
            env: Some(env),
            user: Some(SANDBOX_USER.to_string()),
            working_dir: Some(SANDBOX_MOUNT.to_string()),
            attach_stdin: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                memory: Some(MEMORY_LIMIT),
                memory_swap: Some(MEMORY_SWAP),
                cpu_quota: Some(CPU_QUOTA),
                cpu_period: Some(CPU_PERIOD),
                pids_limit: Some(PIDS_LIMIT),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                // Interpreters need a writable /tmp; the code mount below
                // stays read-only.
                readonly_rootfs: Some(false),
                mounts: Some(vec![Mount {
                    typ: Some(MountTypeEnum::VOLUME),
                    source: Some(volume_name.to_string()),
                    target: Some(SANDBOX_MOUNT.to_string()),
                    read_only: Some(true),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: container_name(job_id),
            platform: None,
        };
        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .context("failed to create container")?;
        Ok(created.id)
    }

    pub async fn start(&self, container_id: &str) -> Result<()> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .context("failed to start container")
    }

    /// Block until the container stops. The daemon encodes a non-zero exit
    /// as an error on the wait stream; both shapes resolve to a verdict
    /// here, and only transport-level failures surface as errors.
    pub async fn wait(&self, container_id: &str) -> Result<WaitVerdict> {
        let options = Some(WaitContainerOptions {
            condition: "not-running",
        });
        let mut stream = self.docker.wait_container(container_id, options);
        match stream.next().await {
            Some(Ok(response)) => Ok(WaitVerdict {
                exit_code: response.status_code,
                message: response.error.and_then(|e| e.message),
            }),
            Some(Err(bollard::errors::Error::DockerContainerWaitError { error, code })) => {
                Ok(WaitVerdict {
                    exit_code: code,
                    message: if error.is_empty() { None } else { Some(error) },
                })
            }
            Some(Err(e)) => Err(e).context("container wait failed"),
            None => bail!("container wait stream ended without a status"),
        }
    }

    /// Deliver SIGKILL. Already-exited containers are not an error.
    pub async fn kill(&self, container_id: &str) {
        let options = Some(KillContainerOptions { signal: "SIGKILL" });
        if let Err(e) = self.docker.kill_container(container_id, options).await {
            debug!(container_id, error = %e, "kill failed, container may have already exited");
        }
    }

    /// Fetch the container's captured streams, demultiplexing the framed
    /// log stream into separate stdout and stderr buffers.
    pub async fn logs(&self, container_id: &str) -> Result<(String, String)> {
        let options = Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            ..Default::default()
        });
        let mut stream = self.docker.logs(container_id, options);
        let mut stdout = String::new();
        let mut stderr = String::new();
        while let Some(frame) = stream.next().await {
            match frame.context("failed to read container logs")? {
                LogOutput::StdOut { message } => {
                    stdout.push_str(&String::from_utf8_lossy(&message))
                }
                LogOutput::StdErr { message } => {
                    stderr.push_str(&String::from_utf8_lossy(&message))
                }
                _ => {}
            }
        }
        Ok((stdout, stderr))
    }

    /// Force-remove the container and its anonymous volumes. Idempotent:
    /// an already-removed container is success.
    pub async fn remove(&self, container_id: &str) -> Result<()> {
        let options = Some(RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        });
        match self.docker.remove_container(container_id, options).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(e).context("failed to remove container"),
        }
    }

    pub(crate) fn docker(&self) -> &Docker {
        &self.docker
    }
}

/// Deterministic container name for a job. Doubles as the duplicate-
/// execution guard: a second create for the same job id collides here.
pub fn container_name(job_id: &str) -> String {
    format!("rce-exec-{}", job_id)
}

/// Concatenate demultiplexed streams the way clients see them: stdout first,
/// stderr appended starting on its own line, trailing whitespace trimmed.
pub fn combine_streams(stdout: &str, stderr: &str) -> String {
    let mut output = stdout.to_string();
    if !stderr.is_empty() {
        if !output.is_empty() && !output.ends_with('\n') {
            output.push('\n');
        }
        output.push_str(stderr);
    }
    output
        .trim_end_matches(|c: char| matches!(c, '\n' | '\r' | '\t' | ' '))
        .to_string()
}
