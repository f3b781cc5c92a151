// CLI commands for operating the evaluation queue
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use skilleval_common::config::QueueConfig;
use skilleval_common::redis::RedisQueue;
use skilleval_common::submit::{self, CancelOutcome};
use skilleval_common::types::{EvalJobResult, TestCase};
use skilleval_common::JobQueue;
use std::fmt::Write as _;
use std::fs;
use std::time::Duration;

/// Accepted layouts of a tests file
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TestsFile {
    List(Vec<TestCase>),
    Suite {
        #[serde(rename = "testCases")]
        test_cases: Vec<TestCase>,
    },
}

pub async fn connect(redis_url: Option<&str>) -> Result<RedisQueue> {
    let mut config = QueueConfig::from_env();
    if let Some(url) = redis_url {
        config.redis_url = url.to_string();
    }
    let queue = RedisQueue::connect(&config)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", config.redis_url))?;
    queue.ping().await.context("Redis did not answer PING")?;
    Ok(queue)
}

fn parse_tests(content: &str) -> Result<Vec<TestCase>> {
    let parsed: TestsFile =
        serde_json::from_str(content).context("Tests file must be a JSON array of test cases or {\"testCases\": [...]}")?;
    Ok(match parsed {
        TestsFile::List(cases) => cases,
        TestsFile::Suite { test_cases } => test_cases,
    })
}

/// Queue a test suite read from `tests_path`
pub async fn submit(
    queue: &dyn JobQueue,
    skill_version: &str,
    skill_path: &str,
    tests_path: &str,
) -> Result<String> {
    let content = fs::read_to_string(tests_path)
        .with_context(|| format!("Failed to read {}", tests_path))?;
    let test_cases = parse_tests(&content)?;
    let count = test_cases.len();

    println!("🚀 Submitting {} test case(s) for {}", count, skill_version);
    let job_id = submit::queue_evaluation(queue, skill_version, test_cases, skill_path).await?;

    println!("✅ Queued evaluation {}", job_id);
    println!("\n📋 Follow it with: skilleval-cli status {} --wait", job_id);
    Ok(job_id.to_string())
}

fn render(job_id: &str, result: &EvalJobResult) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Evaluation {} ({})", job_id, result.skill_version_id);
    let _ = writeln!(out, "Status: {}", result.status);
    if let Some(error) = &result.error {
        let _ = writeln!(out, "Error:  {}", error);
    }
    if result.results.is_empty() {
        return out;
    }

    let _ = writeln!(out, "\n{:<24} {:<8} {:>10}  {}", "TEST", "STATUS", "DURATION", "DETAIL");
    let _ = writeln!(out, "{}", "─".repeat(72));
    for r in &result.results {
        let detail = r
            .error
            .as_deref()
            .and_then(|e| e.lines().next())
            .unwrap_or("");
        let _ = writeln!(
            out,
            "{:<24} {:<8} {:>8}ms  {}",
            r.test_name, r.status.as_str(), r.duration_ms, detail
        );
    }
    out
}

/// Print an evaluation, optionally polling until it is terminal
pub async fn status(
    queue: &dyn JobQueue,
    job_id: &str,
    wait: bool,
    interval_ms: u64,
    json: bool,
) -> Result<()> {
    let mut last_seen = None;
    loop {
        let Some(result) = submit::get_eval_results(queue, job_id).await? else {
            bail!("Evaluation '{}' not found", job_id);
        };

        if !wait || result.status.is_terminal() {
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print!("{}", render(job_id, &result));
            }
            return Ok(());
        }

        let progress = (result.status, result.results.len());
        if last_seen != Some(progress) {
            println!("⏳ {} ({} result(s) so far)", result.status, result.results.len());
            last_seen = Some(progress);
        }
        tokio::time::sleep(Duration::from_millis(interval_ms.max(50))).await;
    }
}

pub async fn cancel(queue: &dyn JobQueue, job_id: &str) -> Result<()> {
    match submit::cancel_evaluation(queue, job_id).await? {
        CancelOutcome::Requested => {
            println!("🛑 Cancellation requested for {}", job_id);
            Ok(())
        }
        CancelOutcome::AlreadyTerminal => {
            println!("Evaluation {} already finished, nothing to cancel", job_id);
            Ok(())
        }
        CancelOutcome::NotFound => bail!("Evaluation '{}' not found", job_id),
    }
}

pub async fn requeue_stale(queue: &dyn JobQueue) -> Result<usize> {
    let moved = queue.requeue_stale().await?;
    if moved == 0 {
        println!("No stale jobs found.");
    } else {
        println!("♻️  Requeued {} job(s) with expired leases", moved);
    }
    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use skilleval_common::fakes::MemoryQueue;
    use skilleval_common::types::{EvalResult, JobStatus, ResultStatus};

    #[test]
    fn test_parse_both_layouts() {
        let list = parse_tests(r#"[{"name": "t1", "input": "a"}]"#).unwrap();
        assert_eq!(list.len(), 1);

        let suite = parse_tests(
            r#"{"testCases": [{"name": "t1", "input": "a", "expectedOutput": "A"},
                              {"name": "t2", "input": "b", "timeout": 500}]}"#,
        )
        .unwrap();
        assert_eq!(suite.len(), 2);
        assert_eq!(suite[0].expected_output.as_deref(), Some("A"));
        assert_eq!(suite[1].timeout, Some(500));

        assert!(parse_tests(r#"{"cases": []}"#).is_err());
    }

    #[test]
    fn test_render_lists_results() {
        let result = EvalJobResult {
            skill_version_id: "sv-1".into(),
            status: JobStatus::Completed,
            results: vec![
                EvalResult::skipped("t1", "Evaluation cancelled"),
                EvalResult {
                    test_name: "t2".into(),
                    status: ResultStatus::Passed,
                    output: "ok".into(),
                    duration_ms: 12,
                    error: None,
                },
            ],
            error: None,
        };
        let text = render("job-1", &result);
        assert!(text.contains("Status: COMPLETED"));
        assert!(text.contains("SKIPPED"));
        assert!(text.contains("Evaluation cancelled"));
        assert!(text.contains("12ms"));
    }

    #[tokio::test]
    async fn test_submit_status_cancel_against_memory_queue() {
        let queue = MemoryQueue::new();
        let dir = std::env::temp_dir().join(format!("skilleval-cli-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let tests_path = dir.join("tests.json");
        fs::write(&tests_path, r#"[{"name": "t1", "input": "hi"}]"#).unwrap();

        let job_id = submit(&queue, "sv-1", "/skills/demo", tests_path.to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(queue.pending_len(), 1);

        status(&queue, &job_id, false, 10, true).await.unwrap();
        cancel(&queue, &job_id).await.unwrap();
        assert!(cancel(&queue, "not-a-job").await.is_err());
        assert!(status(&queue, "not-a-job", false, 10, false).await.is_err());
        assert_eq!(requeue_stale(&queue).await.unwrap(), 0);

        let _ = fs::remove_dir_all(dir);
    }
}
