use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::TransitionError;

pub type JobId = Uuid;

/// Per-test timeout applied when a test case does not declare one
pub const DEFAULT_TEST_TIMEOUT_MS: u64 = 30_000;

/// Engine-wide ceiling; larger requested timeouts are clamped to this
pub const MAX_TEST_TIMEOUT_MS: u64 = 120_000;

/// One named input plus optional assertions, as declared by the skill author
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub name: String,
    pub input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_patterns: Option<Vec<String>>,
    /// Milliseconds. `None` means [`DEFAULT_TEST_TIMEOUT_MS`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl TestCase {
    pub fn new(name: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input: input.into(),
            expected_output: None,
            expected_patterns: None,
            timeout: None,
        }
    }

    pub fn with_expected_output(mut self, expected: impl Into<String>) -> Self {
        self.expected_output = Some(expected.into());
        self
    }

    pub fn with_expected_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expected_patterns = Some(patterns.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Some(timeout_ms);
        self
    }

    /// Wall-clock budget actually granted to this test case
    pub fn effective_timeout_ms(&self) -> u64 {
        self.timeout
            .unwrap_or(DEFAULT_TEST_TIMEOUT_MS)
            .min(MAX_TEST_TIMEOUT_MS)
    }
}

/// Job lifecycle status
///
/// Transitions only move forward:
/// `Pending -> Running -> {Completed | Failed}` and `Pending -> Failed`.
/// `Running -> Running` is the full-job restart taken on re-delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Running, Running)
                | (Running, Completed)
                | (Running, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict for a single test case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultStatus {
    Passed,
    Failed,
    Error,
    Skipped,
}

impl ResultStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ResultStatus::Passed => "PASSED",
            ResultStatus::Failed => "FAILED",
            ResultStatus::Error => "ERROR",
            ResultStatus::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalResult {
    pub test_name: String,
    pub status: ResultStatus,
    pub output: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EvalResult {
    pub fn skipped(test_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            test_name: test_name.into(),
            status: ResultStatus::Skipped,
            output: String::new(),
            duration_ms: 0,
            error: Some(reason.into()),
        }
    }

    pub fn error(
        test_name: impl Into<String>,
        output: impl Into<String>,
        duration_ms: u64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            test_name: test_name.into(),
            status: ResultStatus::Error,
            output: output.into(),
            duration_ms,
            error: Some(reason.into()),
        }
    }
}

/// Snapshot handed to pollers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalJobResult {
    pub skill_version_id: String,
    pub status: JobStatus,
    pub results: Vec<EvalResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Durable unit of work
///
/// Status, timestamps, results and error are private: they only change through
/// the transition methods, which reject anything that would move the job
/// backwards or leave it in an impossible state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalJob {
    pub id: JobId,
    pub skill_version_id: String,
    pub skill_path: String,
    pub test_cases: Vec<TestCase>,
    status: JobStatus,
    created_at: DateTime<Utc>,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    results: Vec<EvalResult>,
    #[serde(default)]
    attempts: u32,
}

impl EvalJob {
    pub fn new(
        skill_version_id: impl Into<String>,
        skill_path: impl Into<String>,
        test_cases: Vec<TestCase>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            skill_version_id: skill_version_id.into(),
            skill_path: skill_path.into(),
            test_cases,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            results: Vec::new(),
            attempts: 0,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn results(&self) -> &[EvalResult] {
        &self.results
    }

    /// Number of deliveries taken by workers so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Test cases that do not have a result yet, in job order
    pub fn remaining_test_cases(&self) -> &[TestCase] {
        let done = self.results.len().min(self.test_cases.len());
        &self.test_cases[done..]
    }

    fn transition(&mut self, next: JobStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Take delivery of the job.
    ///
    /// First delivery moves PENDING to RUNNING and stamps `started_at`. A
    /// re-delivered RUNNING job restarts from scratch: earlier partial results
    /// are dropped, `started_at` keeps its first value.
    pub fn begin(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(JobStatus::Running)?;
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.results.clear();
        self.attempts += 1;
        Ok(())
    }

    /// Append the result for the next test case in order
    pub fn record(&mut self, result: EvalResult) -> Result<(), TransitionError> {
        if self.status != JobStatus::Running {
            return Err(TransitionError::NotRunning {
                status: self.status,
            });
        }
        let expected = match self.test_cases.get(self.results.len()) {
            Some(tc) => tc.name.clone(),
            None => {
                return Err(TransitionError::UnexpectedResult {
                    expected: None,
                    got: result.test_name,
                })
            }
        };
        if result.test_name != expected {
            return Err(TransitionError::UnexpectedResult {
                expected: Some(expected),
                got: result.test_name,
            });
        }
        self.results.push(result);
        Ok(())
    }

    /// Enter COMPLETED; requires exactly one result per test case
    pub fn complete(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.results.len() != self.test_cases.len() {
            return Err(TransitionError::IncompleteResults {
                expected: self.test_cases.len(),
                got: self.results.len(),
            });
        }
        self.transition(JobStatus::Completed)?;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Enter FAILED for an infrastructure failure. Partial results are discarded.
    pub fn fail(
        &mut self,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(JobStatus::Failed)?;
        self.results.clear();
        self.error = Some(reason.into());
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn snapshot(&self) -> EvalJobResult {
        EvalJobResult {
            skill_version_id: self.skill_version_id.clone(),
            status: self.status,
            results: self.results.clone(),
            error: self.error.clone(),
        }
    }
}
