//! Semantic task-graph invariants not expressible via JSON Schema.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::LazyLock;

use regex::Regex;

use crate::core::agents::is_known_agent;
use crate::graph::Task;

/// Check semantic invariants of decomposed tasks:
/// - No duplicate ids
/// - Agents are known roles
/// - Dependencies exist, are not self-references, and sit in an earlier wave
/// - Wave numbers are contiguous starting at 1
pub fn validate_tasks(tasks: &[Task]) -> Vec<String> {
    let mut errors = Vec::new();
    errors.extend(check_unique_ids(tasks));
    errors.extend(check_agents(tasks));
    errors.extend(check_dependencies(tasks));
    errors.extend(check_wave_contiguity(tasks));
    errors
}

pub fn check_unique_ids(tasks: &[Task]) -> Vec<String> {
    let mut seen = HashSet::new();
    tasks
        .iter()
        .filter(|task| !seen.insert(task.id.as_str()))
        .map(|task| format!("duplicate task id '{}'", task.id))
        .collect()
}

pub fn check_agents(tasks: &[Task]) -> Vec<String> {
    tasks
        .iter()
        .filter(|task| !task.agent.is_empty() && !is_known_agent(&task.agent))
        .map(|task| format!("Task {}: unknown agent '{}'", task.id, task.agent))
        .collect()
}

/// One violation per offending dependency entry.
pub fn check_dependencies(tasks: &[Task]) -> Vec<String> {
    let waves: BTreeMap<&str, u32> = tasks
        .iter()
        .map(|task| (task.id.as_str(), task.wave))
        .collect();
    let mut errors = Vec::new();

    for task in tasks {
        for dep in &task.depends_on {
            if *dep == task.id {
                errors.push(format!("Task {}: self-dependency", task.id));
                continue;
            }
            match waves.get(dep.as_str()) {
                None => errors.push(format!(
                    "Task {}: depends on non-existent '{dep}'",
                    task.id
                )),
                Some(&dep_wave) if dep_wave >= task.wave => errors.push(format!(
                    "Task {} (wave {}): depends on '{dep}' (wave {dep_wave}), deps must be in earlier wave",
                    task.id, task.wave
                )),
                Some(_) => {}
            }
        }
    }
    errors
}

/// One violation per gap between consecutive wave numbers, plus one when the
/// first wave is not 1.
pub fn check_wave_contiguity(tasks: &[Task]) -> Vec<String> {
    let waves: Vec<u32> = tasks
        .iter()
        .map(|task| task.wave)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let mut errors = Vec::new();

    if let Some(&first) = waves.first().filter(|&&first| first != 1) {
        errors.push(format!("First wave is {first} (waves must start at 1)"));
    }
    for pair in waves.windows(2) {
        if pair[1] != pair[0] + 1 {
            errors.push(format!(
                "Wave gap: {} → {} (waves must be contiguous)",
                pair[0], pair[1]
            ));
        }
    }
    errors
}

static NO_TEST_KEYWORDS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)migration|config|schema|rename|bump|version|refactor|cleanup|typo|docs|interface|documentation|changelog|readme|ci|cd|pipeline|deploy|→|->|styling|css|formatting",
    )
    .unwrap()
});

/// Tasks exempted from new tests whose description does not look like
/// test-free work.
pub fn suspicious_test_exemptions(tasks: &[Task]) -> Vec<String> {
    tasks
        .iter()
        .filter(|task| task.new_tests_required == Some(false))
        .filter(|task| !task.description.is_empty() && !NO_TEST_KEYWORDS_RE.is_match(&task.description))
        .map(|task| {
            format!(
                "Task {} has new_tests_required=false but description doesn't match no-test patterns",
                task.id
            )
        })
        .collect()
}
