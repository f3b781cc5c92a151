/// Result Evaluator - Verdict Logic
///
/// **Core Responsibility:**
/// Compare raw execution output against a test case's expectations.
///
/// **Critical Properties:**
/// - Knows nothing about Docker or processes
/// - Knows nothing about Redis
/// - Pure function: (exit code, output, expectations) → verdict
///
/// **Verdict Rules (first match wins):**
/// 1. Non-zero exit code → ERROR
/// 2. `expected_output` set → PASSED iff trimmed outputs are equal, else FAILED
/// 3. Non-empty `expected_patterns` → PASSED iff every pattern is a substring, else FAILED
/// 4. Nothing expected → PASSED (smoke test)
///
/// Timed-out executions are turned into ERROR by `evaluate_test` and never
/// reach the verdict rules.
///
/// **Normalization Rules (exact output only):**
/// - Trim leading and trailing whitespace: YES
/// - Ignore trailing newline differences (\n vs \r\n): YES (via trim)
/// - Case sensitivity: YES (exact match required)
/// - Patterns match the raw output, untrimmed

use crate::sandbox::ExecutionOutput;
use skilleval_common::types::{EvalResult, ResultStatus, TestCase};

/// Longest excerpt of expected/actual text quoted in a failure reason
const EXCERPT_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub status: ResultStatus,
    /// Why the test did not pass; `None` for PASSED
    pub reason: Option<String>,
}

impl Verdict {
    fn passed() -> Self {
        Self {
            status: ResultStatus::Passed,
            reason: None,
        }
    }

    fn failed(reason: String) -> Self {
        Self {
            status: ResultStatus::Failed,
            reason: Some(reason),
        }
    }
}

/// Normalize output string for exact comparison
fn normalize_output(output: &str) -> &str {
    output.trim()
}

fn excerpt(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(EXCERPT_CHARS).collect();
    if chars.next().is_some() {
        format!("{}…", head)
    } else {
        head
    }
}

/// Apply the verdict rules and explain any non-pass
pub fn determine_verdict(
    exit_code: i64,
    output: &str,
    expected_output: Option<&str>,
    expected_patterns: Option<&[String]>,
) -> Verdict {
    if exit_code != 0 {
        return Verdict {
            status: ResultStatus::Error,
            reason: Some(format!("Process exited with code {}", exit_code)),
        };
    }

    if let Some(expected) = expected_output {
        let actual = normalize_output(output);
        let expected = normalize_output(expected);
        return if actual == expected {
            Verdict::passed()
        } else {
            Verdict::failed(format!(
                "Output mismatch: expected \"{}\", got \"{}\"",
                excerpt(expected),
                excerpt(actual)
            ))
        };
    }

    if let Some(patterns) = expected_patterns.filter(|p| !p.is_empty()) {
        return match patterns.iter().find(|p| !output.contains(p.as_str())) {
            None => Verdict::passed(),
            Some(missing) => Verdict::failed(format!(
                "Missing expected pattern: \"{}\"",
                excerpt(missing)
            )),
        };
    }

    Verdict::passed()
}

pub fn determine_status(
    exit_code: i64,
    output: &str,
    expected_output: Option<&str>,
    expected_patterns: Option<&[String]>,
) -> ResultStatus {
    determine_verdict(exit_code, output, expected_output, expected_patterns).status
}

/// Turn one execution into the recorded result for its test case
pub fn evaluate_test(test_case: &TestCase, output: &ExecutionOutput) -> EvalResult {
    if output.timed_out {
        return EvalResult::error(
            &test_case.name,
            String::new(),
            output.duration_ms,
            format!(
                "Execution exceeded {}ms time limit (timedOut=true)",
                test_case.effective_timeout_ms()
            ),
        );
    }

    let verdict = determine_verdict(
        output.exit_code,
        &output.stdout,
        test_case.expected_output.as_deref(),
        test_case.expected_patterns.as_deref(),
    );

    // Runtime errors carry the tail of stderr to help skill authors
    let reason = match (verdict.status, verdict.reason) {
        (ResultStatus::Error, Some(reason)) if !output.stderr.trim().is_empty() => {
            Some(format!("{}: {}", reason, stderr_tail(&output.stderr)))
        }
        (_, reason) => reason,
    };

    EvalResult {
        test_name: test_case.name.clone(),
        status: verdict.status,
        output: output.stdout.clone(),
        duration_ms: output.duration_ms,
        error: reason,
    }
}

fn stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    let count = trimmed.chars().count();
    if count <= EXCERPT_CHARS {
        return trimmed.to_string();
    }
    let tail: String = trimmed.chars().skip(count - EXCERPT_CHARS).collect();
    format!("…{}", tail)
}
