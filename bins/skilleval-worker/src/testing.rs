//! Scripted sandbox shared by the worker and pool tests

use crate::error::{InfraError, SandboxError};
use crate::package::SkillPackage;
use crate::sandbox::{ExecutionLimits, ExecutionOutput, Sandbox};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub enum Step {
    Output(ExecutionOutput),
    /// Sleep, then succeed with the given stdout
    Delay(Duration, String),
    Fail(&'static str),
    Panic,
    Hang,
}

/// Backend whose behaviour is keyed on the test input
pub struct FakeSandbox {
    script: Box<dyn Fn(&str) -> Step + Send + Sync>,
    pub healthy: AtomicBool,
    pub calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FakeSandbox {
    pub fn new(script: impl Fn(&str) -> Step + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            healthy: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    /// Echoes the input back on stdout with exit code 0
    pub fn echo() -> Arc<Self> {
        Self::new(|input| Step::Output(ok(input)))
    }
}

pub fn ok(stdout: &str) -> ExecutionOutput {
    ExecutionOutput {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
        duration_ms: 3,
        timed_out: false,
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Sandbox for FakeSandbox {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn health_check(&self) -> Result<(), InfraError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(InfraError::BackendUnavailable("fake backend down".into()))
        }
    }

    async fn execute(
        &self,
        _package: &SkillPackage,
        input: &str,
        _limits: &ExecutionLimits,
    ) -> Result<ExecutionOutput, SandboxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        match (self.script)(input) {
            Step::Output(out) => Ok(out),
            Step::Delay(delay, stdout) => {
                tokio::time::sleep(delay).await;
                Ok(ok(&stdout))
            }
            Step::Fail(msg) => Err(SandboxError::Backend(msg.to_string())),
            Step::Panic => panic!("runner exploded"),
            Step::Hang => std::future::pending().await,
        }
    }
}
