//! Engine configuration, read from `.claude/loom.toml` (or `$LOOM_CONFIG`).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::phase::PhaseSettings;

/// Environment variable naming an alternate config file.
pub const CONFIG_ENV: &str = "LOOM_CONFIG";

/// Config location used when `LOOM_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = ".claude/loom.toml";

/// Engine configuration (TOML). Missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Task-graph document; relative paths resolve against cwd, then git root.
    pub task_graph_path: PathBuf,

    pub specs_dir: String,

    pub plans_dir: String,

    /// Per-session subagent tracking files.
    pub subagent_dir: PathBuf,

    /// Most `NEEDS CLARIFICATION` markers a spec may carry into architecture.
    pub clarify_threshold: usize,

    pub git_timeout_secs: u64,

    /// Session-start deletes tracking files older than this.
    pub stale_subagent_minutes: u64,

    pub lock: LockConfig,

    pub transcript: TranscriptConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LockConfig {
    pub max_attempts: u32,
    pub retry_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_attempts: 50,
            retry_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TranscriptConfig {
    pub max_retries: u32,
    pub retry_ms: u64,
}

impl Default for TranscriptConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_ms: 300,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            task_graph_path: PathBuf::from(".claude/state/active_task_graph.json"),
            specs_dir: ".claude/specs".to_string(),
            plans_dir: ".claude/plans".to_string(),
            subagent_dir: PathBuf::from("/tmp/claude-subagents"),
            clarify_threshold: 3,
            git_timeout_secs: 30,
            stale_subagent_minutes: 60,
            lock: LockConfig::default(),
            transcript: TranscriptConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.task_graph_path.as_os_str().is_empty() {
            return Err(anyhow!("task_graph_path must not be empty"));
        }
        if self.specs_dir.trim().is_empty() || self.plans_dir.trim().is_empty() {
            return Err(anyhow!("specs_dir and plans_dir must not be empty"));
        }
        if self.lock.max_attempts == 0 {
            return Err(anyhow!("lock.max_attempts must be > 0"));
        }
        if self.transcript.max_retries == 0 {
            return Err(anyhow!("transcript.max_retries must be > 0"));
        }
        if self.git_timeout_secs == 0 {
            return Err(anyhow!("git_timeout_secs must be > 0"));
        }
        Ok(())
    }

    pub fn phase_settings(&self) -> PhaseSettings {
        PhaseSettings {
            specs_dir: self.specs_dir.clone(),
            plans_dir: self.plans_dir.clone(),
            clarify_threshold: self.clarify_threshold,
        }
    }

    pub fn lock_retry(&self) -> Duration {
        Duration::from_millis(self.lock.retry_ms)
    }

    pub fn transcript_retry(&self) -> Duration {
        Duration::from_millis(self.transcript.retry_ms)
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }

    pub fn stale_subagent_age(&self) -> Duration {
        Duration::from_secs(self.stale_subagent_minutes * 60)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Config file named by `LOOM_CONFIG`, else `.claude/loom.toml` under `root`.
pub fn config_path(root: &Path) -> PathBuf {
    match std::env::var_os(CONFIG_ENV) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => root.join(DEFAULT_CONFIG_PATH),
    }
}
