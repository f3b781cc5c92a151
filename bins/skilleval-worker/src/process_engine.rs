/// Local Process Engine (development only)
///
/// Runs the skill as a plain child process: cleared environment, private
/// scratch directory as cwd/HOME/TMPDIR, hard timeout with kill, output caps.
/// There is NO network, filesystem or memory isolation here.

use crate::config::SandboxConfig;
use crate::error::{InfraError, SandboxError};
use crate::package::SkillPackage;
use crate::sandbox::{
    CappedOutput, ExecutionLimits, ExecutionOutput, ExecutionTracker, Sandbox, UNKNOWN_EXIT_CODE,
};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

const SAFE_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

pub struct ProcessEngine {
    scratch_root: PathBuf,
}

impl ProcessEngine {
    pub fn new(settings: &SandboxConfig) -> Self {
        Self {
            scratch_root: settings.scratch_root.clone(),
        }
    }
}

async fn drain<R: AsyncRead + Unpin>(mut reader: R) -> CappedOutput {
    let mut out = CappedOutput::new();
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            // Keep reading past the cap so the child never blocks on a full pipe
            Ok(n) => out.push(&buf[..n]),
        }
    }
    out
}

fn finish(tracker: &mut ExecutionTracker, status: ExitStatus) -> Result<(), SandboxError> {
    if let Some(code) = status.code() {
        return tracker.completed(code as i64);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return tracker.crashed(128 + signal as i64, format!("Process killed by signal {}", signal));
        }
    }
    tracker.crashed(UNKNOWN_EXIT_CODE, "Process ended without exit status")
}

#[async_trait]
impl Sandbox for ProcessEngine {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn health_check(&self) -> Result<(), InfraError> {
        match tokio::fs::metadata(&self.scratch_root).await {
            Ok(m) if m.is_dir() => Ok(()),
            Ok(_) => Err(InfraError::BackendUnavailable(format!(
                "scratch root {} is not a directory",
                self.scratch_root.display()
            ))),
            Err(e) => Err(InfraError::BackendUnavailable(format!(
                "scratch root {} unavailable: {}",
                self.scratch_root.display(),
                e
            ))),
        }
    }

    async fn execute(
        &self,
        package: &SkillPackage,
        input: &str,
        limits: &ExecutionLimits,
    ) -> Result<ExecutionOutput, SandboxError> {
        // Removed when dropped, including on task abort
        let scratch = tempfile::Builder::new()
            .prefix("skilleval-")
            .tempdir_in(&self.scratch_root)?;

        let argv = package.entrypoint.argv(&package.root);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| SandboxError::Backend("empty command line".to_string()))?;

        let mut child = Command::new(program)
            .args(args)
            .current_dir(scratch.path())
            .env_clear()
            .env("PATH", SAFE_PATH)
            .env("HOME", scratch.path())
            .env("TMPDIR", scratch.path())
            .env("SKILL_ROOT", &package.root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut tracker = ExecutionTracker::new();
        tracker.start()?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let payload = input.as_bytes().to_vec();

        let run = async {
            let feed = async move {
                if let Some(mut pipe) = stdin {
                    if let Err(e) = pipe.write_all(&payload).await {
                        debug!(error = %e, "Skill closed stdin early");
                    }
                    // Dropping the pipe signals EOF
                }
            };
            let out = async {
                match stdout {
                    Some(pipe) => drain(pipe).await,
                    None => CappedOutput::new(),
                }
            };
            let err = async {
                match stderr {
                    Some(pipe) => drain(pipe).await,
                    None => CappedOutput::new(),
                }
            };
            let ((), out, err, status) = tokio::join!(feed, out, err, child.wait());
            (out, err, status)
        };

        match tokio::time::timeout(limits.timeout, run).await {
            Ok((out, err, status)) => {
                finish(&mut tracker, status?)?;
                tracker.into_output(out.into_string(), err.into_string_with_notice())
            }
            Err(_) => {
                tracker.timed_out()?;
                if let Err(e) = child.start_kill() {
                    debug!(error = %e, "Child already gone at timeout");
                }
                let _ = child.wait().await;
                tracker.into_output(String::new(), String::new())
            }
        }
    }
}
