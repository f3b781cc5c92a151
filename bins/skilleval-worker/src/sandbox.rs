/// Sandbox Runner - Abstraction for Isolated Skill Execution
///
/// **Core Responsibility:**
/// Run a prepared skill package once with one test input and report raw output.
///
/// **Architectural Boundary:**
/// - A sandbox knows HOW to isolate and run (Docker, local process)
/// - A sandbox does NOT know about expectations or verdicts
/// - The evaluator judges the returned `ExecutionOutput`
///
/// Every execution walks NOT_STARTED → RUNNING → {COMPLETED | TIMED_OUT | CRASHED}
/// through an `ExecutionTracker`, and each terminal state maps to exactly one
/// `(exit_code, timed_out)` pair.

use crate::config::{SandboxBackend, SandboxConfig};
use crate::engine::DockerEngine;
use crate::error::{InfraError, SandboxError};
use crate::package::SkillPackage;
use crate::process_engine::ProcessEngine;
use async_trait::async_trait;
use skilleval_common::types::TestCase;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;

/// Exit code reported for a timed-out execution (matches coreutils `timeout`)
pub const TIMEOUT_EXIT_CODE: i64 = 124;
/// Exit code reported when the backend lost track of the process
pub const UNKNOWN_EXIT_CODE: i64 = -1;
/// SIGKILL, which is also how the kernel OOM killer ends a process
pub const OOM_EXIT_CODE: i64 = 137;

pub const MAX_INPUT_BYTES: usize = 10 * 1024 * 1024; // 10MB
pub const MAX_OUTPUT_BYTES: usize = 1024 * 1024; // 1MB per stream

const TRUNCATION_NOTICE: &str = "\n[output truncated]";

/// Resource ceilings for one execution
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionLimits {
    pub timeout: Duration,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub pids_limit: i64,
    pub scratch_bytes: i64,
}

impl ExecutionLimits {
    pub fn for_test(test_case: &TestCase, config: &SandboxConfig) -> Self {
        Self {
            timeout: Duration::from_millis(test_case.effective_timeout_ms()),
            memory_bytes: config.memory_limit_bytes(),
            nano_cpus: config.nano_cpus(),
            pids_limit: config.pids_limit,
            scratch_bytes: (config.scratch_size_mb as i64) * 1024 * 1024,
        }
    }
}

/// Raw result of one execution, consumed by the evaluator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub timed_out: bool,
}

impl ExecutionOutput {
    pub fn timed_out(duration_ms: u64) -> Self {
        Self {
            exit_code: TIMEOUT_EXIT_CODE,
            stdout: String::new(),
            stderr: String::from("[Execution timed out]"),
            duration_ms,
            timed_out: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionState {
    NotStarted,
    Running,
    Completed { exit_code: i64 },
    TimedOut,
    Crashed { exit_code: i64, reason: String },
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Completed { .. } | ExecutionState::TimedOut | ExecutionState::Crashed { .. }
        )
    }

    fn name(&self) -> &'static str {
        match self {
            ExecutionState::NotStarted => "NOT_STARTED",
            ExecutionState::Running => "RUNNING",
            ExecutionState::Completed { .. } => "COMPLETED",
            ExecutionState::TimedOut => "TIMED_OUT",
            ExecutionState::Crashed { .. } => "CRASHED",
        }
    }
}

/// Drives one execution through its state machine and times it
#[derive(Debug)]
pub struct ExecutionTracker {
    state: ExecutionState,
    started: Option<Instant>,
    elapsed: Duration,
}

impl Default for ExecutionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self {
            state: ExecutionState::NotStarted,
            started: None,
            elapsed: Duration::ZERO,
        }
    }

    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    pub fn start(&mut self) -> Result<(), SandboxError> {
        if self.state != ExecutionState::NotStarted {
            return Err(self.illegal("RUNNING"));
        }
        self.state = ExecutionState::Running;
        self.started = Some(Instant::now());
        Ok(())
    }

    /// Process exited on its own, with any exit code
    pub fn completed(&mut self, exit_code: i64) -> Result<(), SandboxError> {
        self.finish(ExecutionState::Completed { exit_code })
    }

    pub fn timed_out(&mut self) -> Result<(), SandboxError> {
        self.finish(ExecutionState::TimedOut)
    }

    /// Killed (signal, OOM) or lost by the backend
    pub fn crashed(&mut self, exit_code: i64, reason: impl Into<String>) -> Result<(), SandboxError> {
        let exit_code = if exit_code == 0 { UNKNOWN_EXIT_CODE } else { exit_code };
        self.finish(ExecutionState::Crashed {
            exit_code,
            reason: reason.into(),
        })
    }

    fn finish(&mut self, next: ExecutionState) -> Result<(), SandboxError> {
        if self.state != ExecutionState::Running {
            return Err(self.illegal(next.name()));
        }
        self.elapsed = self.started.map(|s| s.elapsed()).unwrap_or_default();
        self.state = next;
        Ok(())
    }

    fn illegal(&self, to: &str) -> SandboxError {
        SandboxError::Backend(format!(
            "illegal execution transition {} -> {}",
            self.state.name(),
            to
        ))
    }

    /// Build the output for a terminal state
    pub fn into_output(self, stdout: String, mut stderr: String) -> Result<ExecutionOutput, SandboxError> {
        let duration_ms = self.elapsed.as_millis() as u64;
        match self.state {
            ExecutionState::Completed { exit_code } => Ok(ExecutionOutput {
                exit_code,
                stdout,
                stderr,
                duration_ms,
                timed_out: false,
            }),
            // Output of a timed-out run is discarded
            ExecutionState::TimedOut => Ok(ExecutionOutput::timed_out(duration_ms)),
            ExecutionState::Crashed { exit_code, reason } => {
                stderr.push_str(&format!("\n[{}]", reason));
                Ok(ExecutionOutput {
                    exit_code,
                    stdout,
                    stderr,
                    duration_ms,
                    timed_out: false,
                })
            }
            ref other => Err(SandboxError::Backend(format!(
                "execution not finished (state {})",
                other.name()
            ))),
        }
    }
}

/// Isolated execution backend
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the backend can accept executions right now
    async fn health_check(&self) -> Result<(), InfraError>;

    async fn execute(
        &self,
        package: &SkillPackage,
        input: &str,
        limits: &ExecutionLimits,
    ) -> Result<ExecutionOutput, SandboxError>;
}

/// Host-wide cap on concurrent sandbox executions
#[derive(Debug, Clone)]
pub struct SandboxPool {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl SandboxPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity.max(1))),
            capacity: capacity.max(1),
        }
    }

    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, SandboxError> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SandboxError::Backend("sandbox pool closed".to_string()))
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn in_use(&self) -> usize {
        self.capacity - self.available()
    }
}

/// Build the configured backend
pub fn create_sandbox(config: &SandboxConfig) -> Result<Arc<dyn Sandbox>, InfraError> {
    match config.backend {
        SandboxBackend::Docker => Ok(Arc::new(DockerEngine::connect(config)?)),
        SandboxBackend::Process => {
            warn!(
                "Process sandbox selected: skills run WITHOUT network or memory isolation. \
                 Use only for local development."
            );
            Ok(Arc::new(ProcessEngine::new(config)))
        }
    }
}

/// Run one execution under an outer watchdog of `limits.timeout + grace`.
///
/// Backends enforce the timeout themselves; the watchdog only fires when a
/// backend stops responding, and reports the run as timed out.
pub async fn execute_with_watchdog(
    sandbox: &dyn Sandbox,
    package: &SkillPackage,
    input: &str,
    limits: &ExecutionLimits,
    grace: Duration,
) -> Result<ExecutionOutput, SandboxError> {
    check_input(input)?;
    let started = Instant::now();
    match tokio::time::timeout(limits.timeout + grace, sandbox.execute(package, input, limits)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(
                backend = sandbox.name(),
                timeout_ms = limits.timeout.as_millis() as u64,
                "Sandbox watchdog fired; backend did not honour its timeout"
            );
            Ok(ExecutionOutput::timed_out(started.elapsed().as_millis() as u64))
        }
    }
}

pub fn check_input(input: &str) -> Result<(), SandboxError> {
    if input.len() > MAX_INPUT_BYTES {
        return Err(SandboxError::InputTooLarge {
            size: input.len(),
            limit: MAX_INPUT_BYTES,
        });
    }
    Ok(())
}

/// Stream buffer that stops growing at `MAX_OUTPUT_BYTES`
#[derive(Debug, Default)]
pub struct CappedOutput {
    buf: Vec<u8>,
    truncated: bool,
}

impl CappedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = MAX_OUTPUT_BYTES.saturating_sub(self.buf.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        self.buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn into_string(self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }

    /// Same as `into_string` but marks truncation in the text itself
    pub fn into_string_with_notice(self) -> String {
        let truncated = self.truncated;
        let mut s = self.into_string();
        if truncated {
            s.push_str(TRUNCATION_NOTICE);
        }
        s
    }
}
