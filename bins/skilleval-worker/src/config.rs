// Worker configuration for SkillEval
// Loaded from config/worker.json (optional) with SKILLEVAL_* environment overrides
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/worker.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxBackend {
    /// Container per execution via the Docker API
    Docker,
    /// Plain subprocess. Development only: no network or memory isolation.
    Process,
}

impl std::str::FromStr for SandboxBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "docker" => Ok(SandboxBackend::Docker),
            "process" => Ok(SandboxBackend::Process),
            other => bail!("Unknown sandbox backend '{}' (valid: docker, process)", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub backend: SandboxBackend,
    pub image: String,
    pub memory_limit_mb: u32,
    pub cpu_limit: f32,
    pub pids_limit: i64,
    /// Size of the writable /tmp scratch area
    pub scratch_size_mb: u32,
    /// Host-wide cap on simultaneous sandbox executions
    pub max_concurrent: usize,
    /// Extra time the worker waits past a test's timeout before giving up on the backend
    pub watchdog_grace_ms: u64,
    /// uid:gid the skill runs as inside the container
    pub run_as_user: String,
    /// Parent directory for per-execution scratch dirs (process backend)
    pub scratch_root: PathBuf,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: SandboxBackend::Docker,
            image: "skilleval-runtime:latest".to_string(),
            memory_limit_mb: 512,
            cpu_limit: 1.0,
            pids_limit: 64,
            scratch_size_mb: 64,
            max_concurrent: 4,
            watchdog_grace_ms: 5_000,
            run_as_user: "65534:65534".to_string(),
            scratch_root: std::env::temp_dir(),
        }
    }
}

impl SandboxConfig {
    pub fn memory_limit_bytes(&self) -> i64 {
        (self.memory_limit_mb as i64) * 1024 * 1024
    }

    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_limit as f64 * 1_000_000_000.0) as i64
    }

    pub fn watchdog_grace(&self) -> Duration {
        Duration::from_millis(self.watchdog_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Job loops run by this process; each holds at most one job
    pub concurrency: usize,
    /// Idle sleep between claim attempts when the queue is empty
    pub poll_interval_ms: u64,
    pub cancel_poll_interval_ms: u64,
    pub reaper_interval_ms: u64,
    /// Deliveries after which a job is failed instead of run again
    pub max_deliveries: u32,
    pub max_infra_retries: u32,
    pub retry_backoff_ms: u64,
    /// Bind address of the health/metrics server; `None` disables it
    pub metrics_addr: Option<String>,
    pub sandbox: SandboxConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            worker_id: format!("worker-{}", &suffix[..8]),
            concurrency: 2,
            poll_interval_ms: 500,
            cancel_poll_interval_ms: 250,
            reaper_interval_ms: 10_000,
            max_deliveries: 3,
            max_infra_retries: 3,
            retry_backoff_ms: 200,
            metrics_addr: Some("0.0.0.0:9100".to_string()),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Load worker configuration from a JSON file
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Worker config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))
    }

    /// Load config/worker.json if present, otherwise defaults; then apply env overrides
    pub fn load_default() -> Result<Self> {
        let path = std::env::var("SKILLEVAL_WORKER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

        let mut config = if path.exists() {
            Self::load(&path)?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(id) = lookup("SKILLEVAL_WORKER_ID").filter(|v| !v.is_empty()) {
            self.worker_id = id;
        }
        if let Some(n) = lookup("SKILLEVAL_WORKER_CONCURRENCY") {
            self.concurrency = n
                .parse()
                .context("SKILLEVAL_WORKER_CONCURRENCY must be a positive integer")?;
        }
        if let Some(backend) = lookup("SKILLEVAL_SANDBOX_BACKEND") {
            self.sandbox.backend = backend.parse()?;
        }
        if let Some(image) = lookup("SKILLEVAL_SANDBOX_IMAGE").filter(|v| !v.is_empty()) {
            self.sandbox.image = image;
        }
        if let Some(n) = lookup("SKILLEVAL_MAX_SANDBOXES") {
            self.sandbox.max_concurrent = n
                .parse()
                .context("SKILLEVAL_MAX_SANDBOXES must be a positive integer")?;
        }
        if let Some(addr) = lookup("SKILLEVAL_METRICS_ADDR") {
            self.metrics_addr = if addr.is_empty() || addr == "off" {
                None
            } else {
                Some(addr)
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        if self.sandbox.max_concurrent == 0 {
            bail!("sandbox.max_concurrent must be at least 1");
        }
        if self.sandbox.memory_limit_mb == 0 {
            bail!("sandbox.memory_limit_mb must be positive");
        }
        if self.sandbox.cpu_limit <= 0.0 {
            bail!("sandbox.cpu_limit must be positive");
        }
        if self.max_deliveries == 0 {
            bail!("max_deliveries must be at least 1");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn cancel_poll_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_poll_interval_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_reference_limits() {
        let config = WorkerConfig::default();
        assert_eq!(config.sandbox.memory_limit_bytes(), 512 * 1024 * 1024);
        assert_eq!(config.sandbox.nano_cpus(), 1_000_000_000);
        assert!(config.worker_id.starts_with("worker-"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: WorkerConfig =
            serde_json::from_str(r#"{"concurrency": 8, "sandbox": {"backend": "process"}}"#)
                .unwrap();
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.sandbox.backend, SandboxBackend::Process);
        assert_eq!(config.sandbox.memory_limit_mb, 512);
        assert_eq!(config.max_deliveries, 3);
    }

    #[test]
    fn test_shipped_config_leaves_worker_id_unique() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/worker.json");
        let first = WorkerConfig::load(&path).unwrap();
        let second = WorkerConfig::load(&path).unwrap();
        assert!(first.worker_id.starts_with("worker-"));
        assert_ne!(first.worker_id, second.worker_id);
        assert!(first.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("SKILLEVAL_WORKER_ID", "w-7"),
            ("SKILLEVAL_SANDBOX_BACKEND", "Process"),
            ("SKILLEVAL_MAX_SANDBOXES", "2"),
            ("SKILLEVAL_METRICS_ADDR", "off"),
        ]
        .into_iter()
        .collect();
        let mut config = WorkerConfig::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.worker_id, "w-7");
        assert_eq!(config.sandbox.backend, SandboxBackend::Process);
        assert_eq!(config.sandbox.max_concurrent, 2);
        assert_eq!(config.metrics_addr, None);
    }

    #[test]
    fn test_invalid_backend_is_rejected() {
        let mut config = WorkerConfig::default();
        let result = config.apply_overrides(|k| {
            (k == "SKILLEVAL_SANDBOX_BACKEND").then(|| "firecracker".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_zero_caps() {
        let mut config = WorkerConfig::default();
        config.sandbox.max_concurrent = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(WorkerConfig::load(Path::new("/definitely/not/here.json")).is_err());
    }
}
