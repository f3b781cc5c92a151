/// Docker Execution Engine
///
/// **Core Responsibility:**
/// Run one skill invocation in a throwaway container and capture raw output.
///
/// **Container Rules:**
/// 1. Pulls the runtime image if not present (checked in `health_check`)
/// 2. Creates the container with the isolation profile from `container_config`:
///    - Network disabled
///    - Read-only root filesystem, package bind-mounted read-only at `/skill`
///    - Size-capped tmpfs at `/tmp` as the only writable path
///    - Unprivileged user, all capabilities dropped, no-new-privileges
///    - Memory (swap disabled), CPU and pids limits
/// 3. Streams the test input to stdin over an attach connection
/// 4. Captures stdout/stderr, capped at `MAX_OUTPUT_BYTES` per stream
/// 5. Kills the container on timeout
/// 6. Force-removes the container via `ContainerGuard`, even on panic or task abort

use crate::config::SandboxConfig;
use crate::error::{InfraError, SandboxError};
use crate::package::SkillPackage;
use crate::sandbox::{
    CappedOutput, ExecutionLimits, ExecutionOutput, ExecutionTracker, Sandbox, OOM_EXIT_CODE,
    UNKNOWN_EXIT_CODE,
};
use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    InspectContainerOptions, KillContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Where the skill package is mounted inside the container
pub const SKILL_MOUNT: &str = "/skill";

/// Container cleanup guard - guarantees container removal on drop
struct ContainerGuard<'a> {
    docker: &'a Docker,
    container_id: String,
}

impl<'a> ContainerGuard<'a> {
    fn new(docker: &'a Docker, container_id: String) -> Self {
        Self { docker, container_id }
    }
}

impl<'a> Drop for ContainerGuard<'a> {
    fn drop(&mut self) {
        // Cannot await in Drop; hand removal to the runtime
        let container_id = self.container_id.clone();
        let docker = self.docker.clone();

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(container_id = %container_id, "No runtime to remove container");
            return;
        };
        handle.spawn(async move {
            let remove_options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };

            if let Err(e) = docker.remove_container(&container_id, Some(remove_options)).await {
                warn!(container_id = %container_id, error = %e, "Failed to cleanup container");
            }
        });
    }
}

/// Container settings for one execution
///
/// Pure so the isolation profile can be checked without a daemon.
pub(crate) fn container_config(
    settings: &SandboxConfig,
    package: &SkillPackage,
    limits: &ExecutionLimits,
) -> Config<String> {
    let mut tmpfs = HashMap::new();
    tmpfs.insert(
        "/tmp".to_string(),
        format!("rw,noexec,nosuid,nodev,size={}", limits.scratch_bytes),
    );

    Config {
        image: Some(settings.image.clone()),
        cmd: Some(package.entrypoint.argv(Path::new(SKILL_MOUNT))),
        env: Some(vec![
            "HOME=/tmp".to_string(),
            "TMPDIR=/tmp".to_string(),
            "PYTHONDONTWRITEBYTECODE=1".to_string(),
        ]),
        user: Some(settings.run_as_user.clone()),
        working_dir: Some(SKILL_MOUNT.to_string()),
        attach_stdin: Some(true),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        open_stdin: Some(true),
        stdin_once: Some(true),
        tty: Some(false),
        network_disabled: Some(true),
        host_config: Some(HostConfig {
            network_mode: Some("none".to_string()),
            binds: Some(vec![format!(
                "{}:{}:ro",
                package.root.display(),
                SKILL_MOUNT
            )]),
            tmpfs: Some(tmpfs),
            readonly_rootfs: Some(true),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            memory: Some(limits.memory_bytes),
            // Equal to memory: no swap
            memory_swap: Some(limits.memory_bytes),
            nano_cpus: Some(limits.nano_cpus),
            pids_limit: Some(limits.pids_limit),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Docker-backed sandbox
pub struct DockerEngine {
    docker: Docker,
    settings: SandboxConfig,
}

impl DockerEngine {
    pub fn connect(settings: &SandboxConfig) -> Result<Self, InfraError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| InfraError::BackendUnavailable(format!("Failed to connect to Docker daemon: {}", e)))?;

        Ok(DockerEngine {
            docker,
            settings: settings.clone(),
        })
    }

    /// Ensure the runtime image is available (pull if needed)
    async fn ensure_image(&self) -> Result<(), InfraError> {
        let image = self.settings.image.as_str();
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = %image, "Image cache hit");
            return Ok(());
        }

        warn!(image = %image, "Image cache miss, pulling now");

        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| {
                InfraError::BackendUnavailable(format!("Failed to pull image '{}': {}", image, e))
            })?;
        }

        info!(image = %image, "Image pulled successfully");
        Ok(())
    }

    /// Exit code of a finished container; non-zero codes arrive as errors from bollard
    async fn wait_exit_code(&self, container_id: &str) -> Result<Option<i64>, SandboxError> {
        let wait_options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut wait_stream = self.docker.wait_container(container_id, Some(wait_options));
        match wait_stream.next().await {
            Some(Ok(response)) => Ok(Some(response.status_code)),
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(Some(code)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    async fn was_oom_killed(&self, container_id: &str) -> bool {
        match self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => info
                .state
                .and_then(|s| s.oom_killed)
                .unwrap_or(false),
            Err(e) => {
                warn!(container_id = %container_id, error = %e, "Failed to inspect container");
                false
            }
        }
    }
}

#[async_trait]
impl Sandbox for DockerEngine {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn health_check(&self) -> Result<(), InfraError> {
        self.docker
            .ping()
            .await
            .map_err(|e| InfraError::BackendUnavailable(format!("Docker daemon not reachable: {}", e)))?;
        self.ensure_image().await
    }

    async fn execute(
        &self,
        package: &SkillPackage,
        input: &str,
        limits: &ExecutionLimits,
    ) -> Result<ExecutionOutput, SandboxError> {
        let container_name = format!("skilleval-{}", uuid::Uuid::new_v4());
        let config = container_config(&self.settings, package, limits);

        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };
        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await?;
        let container_id = container.id.clone();

        // Set up immediately after creation so every exit path cleans up
        let _guard = ContainerGuard::new(&self.docker, container_id.clone());

        let AttachContainerResults {
            output: mut stream,
            input: mut stdin,
        } = self
            .docker
            .attach_container(
                &container_id,
                Some(AttachContainerOptions::<String> {
                    stdin: Some(true),
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(false),
                    detach_keys: None,
                }),
            )
            .await?;

        let mut tracker = ExecutionTracker::new();
        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await?;
        tracker.start()?;

        let payload = input.as_bytes().to_vec();
        let execution = async {
            let feed = async move {
                // Skills that never read stdin close it early; that is not an error
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!(error = %e, "Skill closed stdin early");
                }
                let _ = stdin.shutdown().await;
            };

            let collect = async {
                let mut stdout = CappedOutput::new();
                let mut stderr = CappedOutput::new();
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(LogOutput::StdOut { message }) => stdout.push(&message),
                        Ok(LogOutput::StdErr { message }) => stderr.push(&message),
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "Error reading container output");
                            break;
                        }
                    }
                }
                (stdout, stderr)
            };

            let ((), (stdout, stderr)) = tokio::join!(feed, collect);
            let exit_code = self.wait_exit_code(&container_id).await?;
            Ok::<_, SandboxError>((stdout, stderr, exit_code))
        };

        match tokio::time::timeout(limits.timeout, execution).await {
            Ok(Ok((stdout, stderr, exit_code))) => {
                if stdout.is_truncated() || stderr.is_truncated() {
                    warn!(container_id = %container_id, "Skill output truncated");
                }
                let oom_killed =
                    exit_code == Some(OOM_EXIT_CODE) && self.was_oom_killed(&container_id).await;
                match exit_code {
                    Some(code) if oom_killed => {
                        tracker.crashed(code, "Container killed: out of memory")?;
                    }
                    Some(code) if code > 128 => {
                        tracker.crashed(code, format!("Container killed by signal {}", code - 128))?;
                    }
                    Some(code) => tracker.completed(code)?,
                    None => tracker.crashed(UNKNOWN_EXIT_CODE, "No exit status from container")?,
                }
                debug!(container_id = %container_id, state = ?tracker.state(), "Container finished");
                tracker.into_output(stdout.into_string(), stderr.into_string_with_notice())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                tracker.timed_out()?;
                debug!(
                    container_id = %container_id,
                    timeout_ms = limits.timeout.as_millis() as u64,
                    "Execution timed out, killing container"
                );
                if let Err(e) = self
                    .docker
                    .kill_container(&container_id, None::<KillContainerOptions<String>>)
                    .await
                {
                    warn!(container_id = %container_id, error = %e, "Failed to kill timed-out container");
                }
                tracker.into_output(String::new(), String::new())
            }
        }
    }
}
