//! Run configuration stored as `config.toml` next to the run logs.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::retry::RetryPolicy;

/// Run configuration (TOML).
///
/// Intended to be edited by humans. Missing fields default to values that work
/// with the `claude` CLI.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunConfig {
    pub engine: EngineConfig,
    pub executor: ExecutorConfig,
    pub prompt: PromptConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Command spawned for every engine call; the prompt is written to stdin.
    pub command: Vec<String>,
    /// Hard per-call timeout in seconds.
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorConfig {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub max_continuations: u32,
    /// Bound on captured engine stdout/stderr.
    pub output_limit_bytes: usize,
    /// Dependency files at most this large are inlined into prompts.
    pub inline_file_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PromptConfig {
    pub budget_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_workers: usize,
    /// Batches smaller than this run inline on the scheduling thread.
    pub parallel_threshold: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string(), "-p".to_string()],
            timeout_secs: 500,
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            max_continuations: 3,
            output_limit_bytes: 100_000,
            inline_file_limit_bytes: 10_000,
        }
    }
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 40_000,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            parallel_threshold: 2,
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.engine.command.is_empty() || self.engine.command[0].trim().is_empty() {
            return Err(anyhow!("engine.command must be a non-empty array"));
        }
        if self.engine.timeout_secs == 0 {
            return Err(anyhow!("engine.timeout_secs must be > 0"));
        }
        if self.executor.output_limit_bytes == 0 {
            return Err(anyhow!("executor.output_limit_bytes must be > 0"));
        }
        if self.executor.backoff_base_ms > self.executor.backoff_max_ms {
            return Err(anyhow!(
                "executor.backoff_base_ms must not exceed executor.backoff_max_ms"
            ));
        }
        if self.prompt.budget_bytes == 0 {
            return Err(anyhow!("prompt.budget_bytes must be > 0"));
        }
        if self.scheduler.max_workers == 0 {
            return Err(anyhow!("scheduler.max_workers must be > 0"));
        }
        Ok(())
    }

    pub fn engine_timeout(&self) -> Duration {
        Duration::from_secs(self.engine.timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.executor.max_retries,
            backoff_base: Duration::from_millis(self.executor.backoff_base_ms),
            backoff_max: Duration::from_millis(self.executor.backoff_max_ms),
            max_continuations: self.executor.max_continuations,
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunConfig> {
    if !path.exists() {
        let cfg = RunConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RunConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    crate::io::write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, RunConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = RunConfig::default();
        cfg.scheduler.max_workers = 8;
        cfg.engine.command = vec!["my-engine".to_string()];
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    /// Partial files keep defaults for everything they omit.
    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[engine]\ntimeout_secs = 60\n").expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.engine.timeout_secs, 60);
        assert_eq!(cfg.engine.command, EngineConfig::default().command);
        assert_eq!(cfg.scheduler, SchedulerConfig::default());
    }

    #[test]
    fn rejects_zero_workers() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[scheduler]\nmax_workers = 0\n").expect("write");

        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("max_workers"));
    }

    #[test]
    fn retry_policy_uses_millisecond_settings() {
        let policy = RunConfig::default().retry_policy();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.backoff_base, Duration::from_millis(1_000));
    }
}
