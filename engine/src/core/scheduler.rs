//! Wave scheduling: which planned task may start, and what an implementation
//! agent's completion records.

use crate::core::evidence::{NewTestEvidence, TestEvidence};
use crate::graph::{TaskGraph, TaskStatus};

/// Decide whether `task_id` may start. `Err` carries the block message.
///
/// Tasks unknown to the graph are not planned work and are always allowed.
pub fn check_task_execution(graph: &TaskGraph, task_id: &str) -> Result<(), String> {
    let Some(task) = graph.task(task_id) else {
        return Ok(());
    };
    let current = graph.current_wave();

    if task.wave > current {
        return Err(format!(
            "BLOCKED: Cannot execute {task_id} (wave {}) - current wave is {current}\n\
             Complete all wave {current} tasks first.",
            task.wave
        ));
    }

    for dep in &task.depends_on {
        match graph.task(dep) {
            None => {
                return Err(format!(
                    "BLOCKED: Cannot execute {task_id} - dependency {dep} not found in task graph"
                ));
            }
            Some(dep_task) if dep_task.status != TaskStatus::Completed => {
                return Err(format!(
                    "BLOCKED: Cannot execute {task_id} - dependency {dep} not complete (status: {})",
                    dep_task.status.as_str()
                ));
            }
            Some(_) => {}
        }
    }

    if task.wave == current && current > 1 {
        let prev = current - 1;
        if let Some(gate) = graph.gate(prev).filter(|gate| !gate.reviews_complete) {
            let mut lines = vec![
                format!("BLOCKED: Wave {prev} review gate not passed."),
                String::new(),
            ];
            if gate.blocked {
                lines.push(format!("Wave {prev} is BLOCKED due to:"));
                if gate.tests_passed == Some(false) {
                    lines.push("  - Integration tests failed".to_string());
                }
                let critical: usize = graph
                    .wave_tasks(prev)
                    .iter()
                    .map(|task| task.effective_critical_findings().len())
                    .sum();
                if critical > 0 {
                    lines.push(format!("  - {critical} critical review findings"));
                }
            } else {
                lines.push(format!("Wave {prev} gates not yet run."));
            }
            lines.push(String::new());
            lines.push("Run: /wave-gate".to_string());
            return Err(lines.join("\n"));
        }
    }

    Ok(())
}

/// Record that `task_id` started: baseline commit plus membership in
/// `executing_tasks` (kept free of duplicates).
pub fn record_execution_start(graph: &mut TaskGraph, task_id: &str, start_sha: Option<&str>) {
    if !graph.executing_tasks.iter().any(|id| id == task_id) {
        graph.executing_tasks.push(task_id.to_string());
    }
    if let (Some(task), Some(sha)) = (graph.task_mut(task_id), start_sha) {
        task.start_sha = Some(sha.to_string());
    }
}

/// How the completing agent's task was identified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskInference {
    /// Named in the transcript.
    Explicit(String),
    /// Sole entry of `executing_tasks`.
    Inferred(String),
    /// Zero or several tasks executing; nothing can be attributed.
    Ambiguous { executing: usize },
}

pub fn infer_task(explicit: Option<String>, executing: &[String]) -> TaskInference {
    match (explicit, executing) {
        (Some(id), _) => TaskInference::Explicit(id),
        (None, [only]) => TaskInference::Inferred(only.clone()),
        (None, many) => TaskInference::Ambiguous {
            executing: many.len(),
        },
    }
}

/// Completion events for tasks already completed, or already holding passing
/// test evidence, are ignored so earlier evidence is never overwritten.
pub fn is_reentry(graph: &TaskGraph, task_id: &str) -> bool {
    graph
        .task(task_id)
        .is_some_and(|task| task.status == TaskStatus::Completed || task.tests_passed)
}

/// True when every task of `wave` is implemented or completed.
pub fn wave_implementation_complete(graph: &TaskGraph, wave: u32) -> bool {
    graph
        .wave_tasks(wave)
        .iter()
        .all(|task| matches!(task.status, TaskStatus::Implemented | TaskStatus::Completed))
}

/// Evidence gathered for one finished implementation agent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Implementation {
    pub tests: TestEvidence,
    pub new_tests: NewTestEvidence,
    pub files_modified: Vec<String>,
}

/// Mark `task_id` implemented and drop it from `executing_tasks`. When that
/// completes the current wave, its gate is flagged `impl_complete` and the wave
/// number is returned.
pub fn record_implementation(
    graph: &mut TaskGraph,
    task_id: &str,
    implementation: Implementation,
) -> Option<u32> {
    if let Some(task) = graph.task_mut(task_id) {
        task.status = TaskStatus::Implemented;
        task.tests_passed = implementation.tests.passed;
        task.test_evidence = Some(implementation.tests.evidence);
        task.files_modified = implementation.files_modified;
        task.new_tests_written = implementation.new_tests.written;
        task.new_test_evidence = Some(implementation.new_tests.evidence);
    }
    graph.executing_tasks.retain(|id| id != task_id);

    let wave = graph.current_wave();
    if !wave_implementation_complete(graph, wave) {
        return None;
    }
    graph.gate_mut(wave).impl_complete = true;
    Some(wave)
}
