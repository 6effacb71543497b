//! Phase state machine: legal transitions, artifact preconditions, and
//! advancement when a phase agent completes.
//!
//! Artifact discovery goes through [`ArtifactProbe`] so the rules stay pure.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::agents::{is_impl_agent, is_review_agent, phase_for_agent};
use crate::graph::{Phase, TaskGraph};

/// Unresolved-question marker counted in spec documents.
pub const CLARIFY_MARKER: &str = "NEEDS CLARIFICATION";

pub const EXPLORATION_DOC: &str = "brainstorm.md";
pub const GAP_REPORT_DOC: &str = "plan-alignment.md";

/// Artifact key recorded when decomposition completes.
pub const TASK_GRAPH_ARTIFACT: &str = "task_graph";

/// Filesystem queries the phase rules depend on.
pub trait ArtifactProbe {
    fn exists(&self, path: &str) -> bool;
    /// First file named `name` under `dir`, searched recursively.
    fn find_file(&self, dir: &str, name: &str) -> Option<String>;
    /// Number of [`CLARIFY_MARKER`] occurrences in a document.
    fn count_markers(&self, path: &str) -> anyhow::Result<usize>;
}

/// Workspace layout and thresholds used by the phase rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseSettings {
    pub specs_dir: String,
    pub plans_dir: String,
    pub clarify_threshold: usize,
}

impl Default for PhaseSettings {
    fn default() -> Self {
        Self {
            specs_dir: ".claude/specs".to_string(),
            plans_dir: ".claude/plans".to_string(),
            clarify_threshold: 3,
        }
    }
}

/// Legal next phases from `from`.
pub fn allowed_transitions(from: Phase) -> &'static [Phase] {
    match from {
        Phase::Init => &[Phase::Brainstorm, Phase::Specify, Phase::Architecture],
        Phase::Brainstorm => &[Phase::Brainstorm, Phase::Specify],
        Phase::Specify => &[Phase::Specify, Phase::Clarify, Phase::Architecture],
        Phase::Clarify => &[Phase::Clarify, Phase::Architecture],
        Phase::Architecture => &[Phase::Architecture, Phase::PlanAlignment],
        Phase::PlanAlignment => &[Phase::PlanAlignment, Phase::Architecture, Phase::Decompose],
        Phase::Decompose => &[Phase::Decompose, Phase::Execute],
        Phase::Execute => &[Phase::Execute],
    }
}

pub fn is_valid_transition(from: Phase, to: Phase) -> bool {
    allowed_transitions(from).contains(&to)
}

static BRAINSTORM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)brainstorm|explore.*intent|refine.*idea").unwrap());
static SPECIFY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)specify|specification|requirements|spec\.md").unwrap());
static CLARIFY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)clarify|resolve.*markers|NEEDS CLARIFICATION").unwrap());
static ARCHITECTURE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)architecture|design|plan\.md").unwrap());

/// Target phase of a requested agent; prompt keywords are the fallback for
/// agents with no fixed phase. `None` means the request cannot be placed.
pub fn detect_phase(agent: &str, prompt: &str) -> Option<Phase> {
    if let Some(phase) = phase_for_agent(agent) {
        return Some(phase);
    }
    if is_impl_agent(agent) || is_review_agent(agent) {
        return Some(Phase::Execute);
    }
    [
        (&*BRAINSTORM_RE, Phase::Brainstorm),
        (&*SPECIFY_RE, Phase::Specify),
        (&*CLARIFY_RE, Phase::Clarify),
        (&*ARCHITECTURE_RE, Phase::Architecture),
    ]
    .into_iter()
    .find(|(re, _)| re.is_match(prompt))
    .map(|(_, phase)| phase)
}

fn spec_document(graph: &TaskGraph) -> Option<&str> {
    graph
        .phase_artifacts
        .get(Phase::Specify.as_str())
        .map(String::as_str)
        .or(graph.spec_file.as_deref())
}

fn plan_document(graph: &TaskGraph) -> Option<&str> {
    graph
        .phase_artifacts
        .get(Phase::Architecture.as_str())
        .map(String::as_str)
        .or(graph.plan_file.as_deref())
}

fn search_dir<'a>(graph: &'a TaskGraph, settings: &'a PhaseSettings) -> &'a str {
    graph.spec_dir.as_deref().unwrap_or(&settings.specs_dir)
}

/// Missing prerequisite for entering `target`, described for a block message.
pub fn check_artifacts<P: ArtifactProbe>(
    target: Phase,
    graph: &TaskGraph,
    probe: &P,
    settings: &PhaseSettings,
) -> Option<String> {
    let require_spec = || match spec_document(graph) {
        Some(spec) if probe.exists(spec) => Ok(spec),
        _ => Err("specify (no spec.md found)".to_string()),
    };
    let require_plan = || match plan_document(graph) {
        Some(plan) if probe.exists(plan) => Ok(plan),
        _ => Err("architecture (no plan.md found)".to_string()),
    };

    let result: Result<(), String> = match target {
        Phase::Specify => {
            if graph.is_skipped(Phase::Brainstorm)
                || probe
                    .find_file(&settings.specs_dir, EXPLORATION_DOC)
                    .is_some()
            {
                Ok(())
            } else {
                Err(format!(
                    "brainstorm (no {EXPLORATION_DOC} found in {}/)",
                    settings.specs_dir.trim_end_matches('/')
                ))
            }
        }
        Phase::Clarify => require_spec().map(|_| ()),
        Phase::Architecture => require_spec().and_then(|spec| {
            if graph.is_skipped(Phase::Clarify) {
                return Ok(());
            }
            let markers = markers_or_above(probe, spec, settings.clarify_threshold);
            if markers > settings.clarify_threshold {
                Err(format!(
                    "clarify ({markers} markers > {})",
                    settings.clarify_threshold
                ))
            } else {
                Ok(())
            }
        }),
        Phase::PlanAlignment => require_plan().map(|_| ()),
        Phase::Decompose | Phase::Execute => require_plan().and_then(|_| {
            if graph.is_skipped(Phase::PlanAlignment)
                || probe
                    .find_file(search_dir(graph, settings), GAP_REPORT_DOC)
                    .is_some()
            {
                Ok(())
            } else {
                Err(format!("plan-alignment (no {GAP_REPORT_DOC} found)"))
            }
        }),
        Phase::Init | Phase::Brainstorm => Ok(()),
    };
    result.err()
}

fn next_step_hint(current: Phase) -> &'static str {
    match current {
        Phase::Init => "Next: Run brainstorm-agent (or --skip-brainstorm)",
        Phase::Brainstorm => "Next: Run specify-agent",
        Phase::Specify => "Next: Run clarify-agent or architecture-agent",
        Phase::Clarify => "Next: Run architecture-agent",
        Phase::Architecture => "Next: Run plan-alignment-agent",
        Phase::PlanAlignment => "Next: Decompose tasks (or loop back to architecture)",
        Phase::Decompose => "Next: Execute tasks",
        Phase::Execute => "",
    }
}

/// Decide whether a phase agent may start. Returns the block message on denial.
pub fn validate_phase_request<P: ArtifactProbe>(
    graph: &TaskGraph,
    target: Phase,
    probe: &P,
    settings: &PhaseSettings,
) -> Result<(), String> {
    let current = graph.current_phase;
    if !is_valid_transition(current, target) {
        let flow: Vec<&str> = Phase::ALL[1..].iter().map(|phase| phase.as_str()).collect();
        return Err([
            format!("BLOCKED: Invalid phase transition: {current} → {target}"),
            String::new(),
            format!("Expected flow: {}", flow.join(" → ")),
            format!("Current phase: {current}"),
            String::new(),
            next_step_hint(current).to_string(),
        ]
        .join("\n"));
    }

    if let Some(missing) = check_artifacts(target, graph, probe, settings) {
        return Err([
            format!("BLOCKED: Missing prerequisite for {target} phase"),
            String::new(),
            format!("Required: {missing}"),
            String::new(),
            "Complete the prerequisite phase first, or use --skip-X flag.".to_string(),
        ]
        .join("\n"));
    }

    Ok(())
}

/// Phase advancement computed when a phase agent completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: Phase,
    /// Artifact recorded for the completed phase.
    pub artifact: String,
    /// `clarify` becomes skipped for the rest of the run.
    pub skip_clarify: bool,
}

impl Transition {
    fn to(next: Phase, artifact: impl Into<String>) -> Self {
        Self {
            next,
            artifact: artifact.into(),
            skip_clarify: false,
        }
    }
}

fn under(path: &str, dir: &str) -> bool {
    path.contains(&format!("{}/", dir.trim_end_matches('/')))
}

/// Marker count, with an unreadable document treated as above threshold.
fn markers_or_above<P: ArtifactProbe>(probe: &P, spec: &str, threshold: usize) -> usize {
    match probe.count_markers(spec) {
        Ok(count) => count,
        Err(err) => {
            tracing::warn!(spec, err = %err, "marker count failed, forcing clarify");
            threshold + 1
        }
    }
}

/// Next phase after `completed` finishes, or `None` when its artifacts are not
/// in place yet.
pub fn resolve_transition<P: ArtifactProbe>(
    completed: Phase,
    graph: &TaskGraph,
    probe: &P,
    settings: &PhaseSettings,
) -> Option<Transition> {
    match completed {
        Phase::Brainstorm => probe
            .find_file(search_dir(graph, settings), EXPLORATION_DOC)
            .map(|doc| Transition::to(Phase::Specify, doc)),
        Phase::Specify => {
            let spec = graph.spec_file.as_deref()?;
            if !probe.exists(spec) || !under(spec, &settings.specs_dir) {
                return None;
            }
            let threshold = settings.clarify_threshold;
            if markers_or_above(probe, spec, threshold) > threshold {
                Some(Transition::to(Phase::Clarify, spec))
            } else {
                Some(Transition {
                    skip_clarify: true,
                    ..Transition::to(Phase::Architecture, spec)
                })
            }
        }
        Phase::Clarify => {
            let spec = graph.spec_file.as_deref()?;
            if !probe.exists(spec) {
                return None;
            }
            let threshold = settings.clarify_threshold;
            (markers_or_above(probe, spec, threshold) == 0)
                .then(|| Transition::to(Phase::Architecture, spec))
        }
        Phase::Architecture => {
            let plan = graph.plan_file.as_deref()?;
            if !probe.exists(plan) || !under(plan, &settings.plans_dir) {
                return None;
            }
            let next = if graph.is_skipped(Phase::PlanAlignment) {
                Phase::Decompose
            } else {
                Phase::PlanAlignment
            };
            Some(Transition::to(next, plan))
        }
        Phase::PlanAlignment => {
            let dir = search_dir(graph, settings);
            let report = probe.find_file(dir, GAP_REPORT_DOC);
            if report.is_none() {
                tracing::warn!(dir, "plan-alignment completed without a gap report");
            }
            report.map(|doc| Transition::to(Phase::Decompose, doc))
        }
        Phase::Decompose => Some(Transition::to(Phase::Execute, TASK_GRAPH_ARTIFACT)),
        Phase::Init | Phase::Execute => None,
    }
}

/// True when the workflow has already moved beyond `completed`.
pub fn already_past(current: Phase, completed: Phase) -> bool {
    current > completed
}

/// Apply a transition for `completed` to the document.
pub fn apply_transition(graph: &mut TaskGraph, completed: Phase, transition: &Transition) {
    graph.current_phase = transition.next;
    graph
        .phase_artifacts
        .insert(completed.as_str().to_string(), transition.artifact.clone());
    if transition.skip_clarify {
        graph.skip(Phase::Clarify);
    }
    graph.touch();
}

/// Skip flags given when a workflow run starts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkipFlags {
    /// Start at architecture with an existing spec; implies skipping
    /// brainstorm, specify and clarify.
    pub specify: bool,
    pub brainstorm: bool,
    pub clarify: bool,
    pub plan_alignment: bool,
}

/// First document of a run. `spec_dir` scopes artifact discovery for the run.
pub fn initial_graph<P: ArtifactProbe>(
    flags: SkipFlags,
    spec_dir: &str,
    probe: &P,
) -> Result<TaskGraph, String> {
    let mut graph = TaskGraph::new(Phase::Init);
    graph.spec_dir = Some(spec_dir.to_string());

    if flags.specify {
        let spec = probe.find_file(spec_dir, "spec.md").ok_or_else(|| {
            format!("--skip-specify requires existing spec.md under {spec_dir}, but none found")
        })?;
        graph.skip(Phase::Brainstorm);
        graph.skip(Phase::Specify);
        graph.skip(Phase::Clarify);
        graph.current_phase = Phase::Architecture;
        graph.spec_file = Some(spec);
    } else if flags.brainstorm {
        graph.skip(Phase::Brainstorm);
        graph.current_phase = Phase::Specify;
    }
    if flags.clarify {
        graph.skip(Phase::Clarify);
    }
    if flags.plan_alignment {
        graph.skip(Phase::PlanAlignment);
    }
    graph.touch();
    Ok(graph)
}
