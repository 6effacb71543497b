//! Persisted task-graph document (`.claude/state/active_task_graph.json`).
//!
//! The document is the sole unit of persistence and locking. Fields added after
//! the first schema version carry serde defaults so older documents still load;
//! unknown keys round-trip through `extra`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Workflow stage. Declaration order is the canonical phase order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Init,
    Brainstorm,
    Specify,
    Clarify,
    Architecture,
    PlanAlignment,
    Decompose,
    Execute,
}

impl Phase {
    pub const ALL: [Phase; 8] = [
        Phase::Init,
        Phase::Brainstorm,
        Phase::Specify,
        Phase::Clarify,
        Phase::Architecture,
        Phase::PlanAlignment,
        Phase::Decompose,
        Phase::Execute,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Brainstorm => "brainstorm",
            Phase::Specify => "specify",
            Phase::Clarify => "clarify",
            Phase::Architecture => "architecture",
            Phase::PlanAlignment => "plan-alignment",
            Phase::Decompose => "decompose",
            Phase::Execute => "execute",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|phase| phase.as_str() == s)
            .ok_or_else(|| {
                let valid: Vec<&str> = Phase::ALL.iter().map(|p| p.as_str()).collect();
                format!("invalid phase '{s}' (valid: {})", valid.join(", "))
            })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Implemented,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Implemented => "implemented",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    #[default]
    Pending,
    Passed,
    Blocked,
    EvidenceCaptureFailed,
}

impl ReviewStatus {
    /// `passed` and `blocked` both mean "reviewed"; approval is not required.
    pub fn is_terminal(self) -> bool {
        matches!(self, ReviewStatus::Passed | ReviewStatus::Blocked)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::Passed => "passed",
            ReviewStatus::Blocked => "blocked",
            ReviewStatus::EvidenceCaptureFailed => "evidence_capture_failed",
        }
    }
}

/// Unit of implementation work.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub agent: String,
    pub wave: u32,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_anchors: Option<Vec<String>>,
    /// `Some(false)` exempts the task from the new-test requirement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_tests_required: Option<bool>,
    #[serde(default)]
    pub tests_passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_evidence: Option<String>,
    #[serde(default)]
    pub new_tests_written: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_test_evidence: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub review_status: ReviewStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_error: Option<String>,
    #[serde(default)]
    pub critical_findings: Vec<String>,
    #[serde(default)]
    pub advisory_findings: Vec<String>,
    /// Baseline commit captured when execution begins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Task {
    pub fn new(id: impl Into<String>, wave: u32) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            agent: String::new(),
            wave,
            status: TaskStatus::Pending,
            depends_on: Vec::new(),
            spec_anchors: None,
            new_tests_required: None,
            tests_passed: false,
            test_evidence: None,
            new_tests_written: false,
            new_test_evidence: None,
            files_modified: Vec::new(),
            review_status: ReviewStatus::Pending,
            review_error: None,
            critical_findings: Vec::new(),
            advisory_findings: Vec::new(),
            start_sha: None,
            failure_reason: None,
            retry_count: None,
            extra: BTreeMap::new(),
        }
    }

    /// New tests are required unless explicitly exempted.
    pub fn requires_new_tests(&self) -> bool {
        self.new_tests_required != Some(false)
    }

    /// Critical findings with blank entries removed.
    pub fn effective_critical_findings(&self) -> Vec<&str> {
        self.critical_findings
            .iter()
            .map(|finding| finding.trim())
            .filter(|finding| !finding.is_empty())
            .collect()
    }
}

/// Recorded verification state of one wave.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WaveGate {
    #[serde(default)]
    pub impl_complete: bool,
    /// `None` until integration tests have been evaluated.
    #[serde(default)]
    pub tests_passed: Option<bool>,
    #[serde(default)]
    pub reviews_complete: bool,
    #[serde(default)]
    pub blocked: bool,
}

/// Most recent spec-alignment check. Overwritten on every run.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpecCheck {
    pub wave: u32,
    pub run_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_count: Option<u32>,
    #[serde(default)]
    pub critical_findings: Vec<String>,
    #[serde(default)]
    pub high_findings: Vec<String>,
    #[serde(default)]
    pub medium_findings: Vec<String>,
    pub verdict: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Root document.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TaskGraph {
    pub current_phase: Phase,
    pub phase_artifacts: BTreeMap<String, String>,
    #[serde(default)]
    pub skipped_phases: Vec<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_dir: Option<String>,
    #[serde(default)]
    pub spec_file: Option<String>,
    #[serde(default)]
    pub plan_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_title: Option<String>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_wave: Option<u32>,
    #[serde(default)]
    pub executing_tasks: Vec<String>,
    #[serde(default)]
    pub wave_gates: BTreeMap<String, WaveGate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_issue: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_repo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_check: Option<SpecCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl TaskGraph {
    /// Empty document at `phase` with no tasks.
    pub fn new(phase: Phase) -> Self {
        Self {
            current_phase: phase,
            phase_artifacts: BTreeMap::new(),
            skipped_phases: Vec::new(),
            spec_dir: None,
            spec_file: None,
            plan_file: None,
            plan_title: None,
            tasks: Vec::new(),
            current_wave: None,
            executing_tasks: Vec::new(),
            wave_gates: BTreeMap::new(),
            github_issue: None,
            github_repo: None,
            spec_check: None,
            updated_at: None,
            extra: BTreeMap::new(),
        }
    }

    /// Active wave; documents without one are at wave 1.
    pub fn current_wave(&self) -> u32 {
        self.current_wave.unwrap_or(1)
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|task| task.id == id)
    }

    pub fn wave_tasks(&self, wave: u32) -> Vec<&Task> {
        self.tasks.iter().filter(|task| task.wave == wave).collect()
    }

    /// Distinct wave numbers in ascending order.
    pub fn waves(&self) -> BTreeSet<u32> {
        self.tasks.iter().map(|task| task.wave).collect()
    }

    pub fn gate(&self, wave: u32) -> Option<&WaveGate> {
        self.wave_gates.get(&wave.to_string())
    }

    /// Gate for `wave`, created with defaults when missing.
    pub fn gate_mut(&mut self, wave: u32) -> &mut WaveGate {
        self.wave_gates.entry(wave.to_string()).or_default()
    }

    pub fn is_skipped(&self, phase: Phase) -> bool {
        self.skipped_phases.contains(&phase)
    }

    /// Record `phase` as skipped (idempotent).
    pub fn skip(&mut self, phase: Phase) {
        if !self.is_skipped(phase) {
            self.skipped_phases.push(phase);
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Some(chrono::Utc::now().to_rfc3339());
    }
}

/// One default gate per distinct wave number.
pub fn build_wave_gates(tasks: &[Task]) -> BTreeMap<String, WaveGate> {
    tasks
        .iter()
        .map(|task| task.wave)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(|wave| (wave.to_string(), WaveGate::default()))
        .collect()
}
