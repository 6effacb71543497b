//! Test-only helpers for building task graphs, hook payloads and transcripts.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::json;

use crate::graph::{Phase, ReviewStatus, Task, TaskGraph, TaskStatus, build_wave_gates};
use crate::hooks::HookContext;
use crate::io::config::{EngineConfig, LockConfig, TranscriptConfig};
use crate::io::git::Repository;

/// Hook context rooted at `dir` with fast lock and transcript retries and a
/// private subagent directory.
pub fn context_in(dir: &Path) -> HookContext {
    let config = EngineConfig {
        subagent_dir: dir.join("subagents"),
        lock: LockConfig {
            max_attempts: 5,
            retry_ms: 1,
        },
        transcript: TranscriptConfig {
            max_retries: 1,
            retry_ms: 1,
        },
        ..EngineConfig::default()
    };
    HookContext::new(config, dir)
}

/// Fresh temporary workspace and a context rooted in it.
pub fn temp_context() -> (tempfile::TempDir, HookContext) {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = context_in(dir.path());
    (dir, ctx)
}

/// Execute-phase graph: T1 and T2 in wave 1, T3 in wave 2 depending on both.
pub fn two_wave_graph() -> TaskGraph {
    let mut graph = TaskGraph::new(Phase::Execute);
    let mut tasks = vec![Task::new("T1", 1), Task::new("T2", 1), Task::new("T3", 2)];
    for task in &mut tasks {
        task.description = format!("{} work", task.id);
        task.agent = "code-implementer-agent".to_string();
    }
    tasks[2].depends_on = vec!["T1".into(), "T2".into()];
    graph.wave_gates = build_wave_gates(&tasks);
    graph.tasks = tasks;
    graph.current_wave = Some(1);
    graph
}

/// Implemented task with test evidence, new tests and a passed review.
pub fn verified_task(id: &str, wave: u32) -> Task {
    let mut task = Task::new(id, wave);
    task.description = format!("{id} work");
    task.agent = "code-implementer-agent".to_string();
    task.status = TaskStatus::Implemented;
    task.tests_passed = true;
    task.test_evidence = Some("cargo: 4 passed".into());
    task.new_tests_written = true;
    task.new_test_evidence = Some("rust: 1 new test".into());
    task.review_status = ReviewStatus::Passed;
    task
}

/// Pre-tool-use payload for spawning `agent` with `prompt`.
pub fn spawn_payload(agent: &str, prompt: &str) -> String {
    json!({
        "session_id": "s1",
        "tool_name": "Task",
        "tool_input": {"subagent_type": agent, "prompt": prompt},
    })
    .to_string()
}

/// Transcript record holding one assistant text block.
pub fn assistant_text(text: &str) -> String {
    json!({"message": {"content": [{"type": "text", "text": text}]}}).to_string()
}

/// Transcript records for one Bash invocation and its result.
pub fn bash_run(command: &str, output: &str) -> Vec<String> {
    let id = format!("bash-{}", command.len());
    vec![
        json!({"message": {"content": [
            {"type": "tool_use", "id": id, "name": "Bash", "input": {"command": command}}
        ]}})
        .to_string(),
        json!({"message": {"content": [
            {"type": "tool_result", "tool_use_id": id, "content": output}
        ]}})
        .to_string(),
    ]
}

/// Write `lines` as a JSONL transcript and return its path.
pub fn write_transcript(dir: &Path, name: &str, lines: &[String]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, lines.join("\n") + "\n").expect("write transcript");
    path
}

/// In-memory repository. The default is "not a repository".
#[derive(Debug, Clone, Default)]
pub struct FakeRepo {
    pub repo: bool,
    pub head: Option<String>,
    pub diff: String,
}

impl FakeRepo {
    pub fn with_head(sha: &str) -> Self {
        Self {
            repo: true,
            head: Some(sha.to_string()),
            diff: String::new(),
        }
    }

    pub fn with_diff(diff: &str) -> Self {
        Self {
            repo: true,
            head: Some("0000000".to_string()),
            diff: diff.to_string(),
        }
    }
}

impl Repository for FakeRepo {
    fn is_repo(&self) -> bool {
        self.repo
    }

    fn head_sha(&self) -> Option<String> {
        self.head.clone()
    }

    fn collect_diff(&self, _files: &[String], _start_sha: Option<&str>) -> String {
        self.diff.clone()
    }
}
