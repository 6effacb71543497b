//! Lifecycle hook handlers.
//!
//! Each handler reads the raw stdin payload, loads what it needs through
//! [`HookContext`], applies the pure rules from [`crate::core`], and returns a
//! [`HookOutcome`]. Handlers that touch git take a [`Repository`] so tests can
//! substitute one.
//!
//! [`Repository`]: crate::io::git::Repository

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::core::agents::strip_namespace;
use crate::core::phase::PhaseSettings;
use crate::io::artifacts::FsArtifacts;
use crate::io::config::{EngineConfig, config_path, load_config};
use crate::io::git::Git;
use crate::io::lock::Locker;
use crate::io::store::StateStore;
use crate::io::subagents::SubagentTracker;

pub use crate::core::types::HookOutcome;

pub mod helpers;
pub mod pre_tool_use;
pub mod session_start;
pub mod subagent_start;
pub mod subagent_stop;

/// Tool name the assistant uses to spawn a subagent.
pub const TASK_TOOL: &str = "Task";

/// Configuration plus the directory the hook was invoked from.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub config: EngineConfig,
    pub root: PathBuf,
}

impl HookContext {
    pub fn new(config: EngineConfig, root: impl Into<PathBuf>) -> Self {
        Self {
            config,
            root: root.into(),
        }
    }

    /// Load the config that applies to `root`.
    pub fn load(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let config = load_config(&config_path(&root))?;
        Ok(Self::new(config, root))
    }

    pub fn locker(&self) -> Locker {
        Locker::new(self.config.lock.max_attempts, self.config.lock_retry())
    }

    pub fn git(&self) -> Git {
        Git::new(&self.root, self.config.git_timeout())
    }

    pub fn subagents(&self) -> SubagentTracker {
        SubagentTracker::new(&self.config.subagent_dir, self.locker())
    }

    pub fn phase_settings(&self) -> PhaseSettings {
        self.config.phase_settings()
    }

    /// Where this checkout's document lives, whether or not it exists yet.
    pub fn graph_path(&self) -> PathBuf {
        self.root.join(&self.config.task_graph_path)
    }

    /// This checkout's document: under the invocation directory first, then
    /// under the repository root.
    pub fn local_graph(&self) -> Option<PathBuf> {
        let local = self.graph_path();
        if local.is_file() {
            return Some(local);
        }
        if self.config.task_graph_path.is_absolute() {
            return None;
        }
        let candidate = self.git().toplevel()?.join(&self.config.task_graph_path);
        candidate.is_file().then_some(candidate)
    }

    /// The document recorded for `session`, falling back to this checkout's.
    pub fn resolve_graph(&self, session: Option<&str>) -> Option<PathBuf> {
        session
            .and_then(|session| self.subagents().task_graph_for(session))
            .or_else(|| self.local_graph())
    }

    pub fn store(&self, path: impl Into<PathBuf>) -> StateStore {
        StateStore::new(path, self.locker())
    }

    pub fn local_store(&self) -> Option<StateStore> {
        self.local_graph().map(|path| self.store(path))
    }

    pub fn session_store(&self, session: Option<&str>) -> Option<StateStore> {
        self.resolve_graph(session).map(|path| self.store(path))
    }

    /// Artifact probe rooted at the project that owns `store`, so relative
    /// artifact paths resolve the same way from any checkout.
    pub fn artifacts_for(&self, store: &StateStore) -> FsArtifacts {
        FsArtifacts::new(self.project_root(store.path()))
    }

    fn project_root(&self, document: &Path) -> PathBuf {
        if self.config.task_graph_path.is_absolute() {
            return self.root.clone();
        }
        let depth = self
            .config
            .task_graph_path
            .components()
            .filter(|component| matches!(component, Component::Normal(_)))
            .count();
        document
            .ancestors()
            .nth(depth)
            .filter(|root| !root.as_os_str().is_empty())
            .map_or_else(|| self.root.clone(), Path::to_path_buf)
    }
}

/// Payload for tool-use checkpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolUseInput {
    #[serde(default)]
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Value,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl ToolUseInput {
    /// String field of `tool_input`; empty when absent.
    pub fn input_str(&self, key: &str) -> &str {
        self.tool_input
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }
}

/// Payload for subagent start/stop checkpoints.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubagentInput {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub agent_transcript_path: Option<String>,
}

impl SubagentInput {
    /// Agent type without its plugin namespace.
    pub fn agent(&self) -> &str {
        strip_namespace(self.agent_type.as_deref().unwrap_or_default())
    }

    pub fn session(&self) -> Option<&str> {
        self.session_id.as_deref().filter(|id| !id.is_empty())
    }

    pub fn agent_id(&self) -> Option<&str> {
        self.agent_id.as_deref().filter(|id| !id.is_empty())
    }

    pub fn transcript_path(&self) -> &str {
        self.agent_transcript_path.as_deref().unwrap_or_default()
    }
}

pub fn parse_input<T: DeserializeOwned>(stdin: &str) -> Result<T> {
    serde_json::from_str(stdin).context("parse hook input")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_root_strips_document_components() {
        let ctx = HookContext::new(EngineConfig::default(), "/work/app");
        let store = ctx.store("/other/repo/.claude/state/active_task_graph.json");
        assert_eq!(ctx.project_root(store.path()), PathBuf::from("/other/repo"));
    }

    #[test]
    fn subagent_input_tolerates_missing_fields() {
        let input: SubagentInput =
            parse_input(r#"{"agent_type":"loom:code-reviewer","session_id":""}"#).expect("parse");
        assert_eq!(input.agent(), "code-reviewer");
        assert_eq!(input.session(), None);
        assert_eq!(input.agent_id(), None);
        assert_eq!(input.transcript_path(), "");
    }

    #[test]
    fn tool_input_fields_default_to_empty() {
        let input: ToolUseInput = parse_input(
            r#"{"tool_name":"Task","tool_input":{"prompt":"Implement T1","subagent_type":7}}"#,
        )
        .expect("parse");
        assert_eq!(input.input_str("prompt"), "Implement T1");
        assert_eq!(input.input_str("subagent_type"), "");
        assert_eq!(input.input_str("description"), "");
    }

    #[test]
    fn missing_local_graph_resolves_to_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut config = EngineConfig::default();
        config.subagent_dir = temp.path().join("subagents");
        let ctx = HookContext::new(config, temp.path());
        assert_eq!(ctx.resolve_graph(Some("s1")), None);
    }
}
