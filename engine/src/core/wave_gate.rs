//! Wave gate verification and advancement.
//!
//! Five checks run in fixed order; the first failure stops evaluation and
//! leaves the document untouched.

use crate::core::findings::EVIDENCE_CAPTURE_FAILED;
use crate::core::types::GateCheck;
use crate::graph::{ReviewStatus, SpecCheck, Task, TaskGraph, TaskStatus};

fn ids(tasks: &[&Task]) -> String {
    tasks
        .iter()
        .map(|task| task.id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Every task has passing test evidence.
pub fn check_test_evidence(tasks: &[&Task]) -> GateCheck {
    let missing: Vec<&Task> = tasks.iter().copied().filter(|task| !task.tests_passed).collect();
    if !missing.is_empty() {
        return GateCheck::fail(format!(
            "FAILED: Not all tasks have test evidence.\n  Missing: {}",
            ids(&missing)
        ));
    }
    let lines: Vec<String> = tasks
        .iter()
        .map(|task| {
            let evidence = task
                .test_evidence
                .as_deref()
                .filter(|evidence| !evidence.is_empty())
                .unwrap_or("evidence present");
            format!("     {}: {evidence}", task.id)
        })
        .collect();
    GateCheck::pass(format!(
        "1. Test evidence verified ({n}/{n} tasks):\n{}",
        lines.join("\n"),
        n = tasks.len()
    ))
}

/// Every task wrote new tests or is exempt from doing so.
pub fn check_new_tests(tasks: &[&Task]) -> GateCheck {
    let missing: Vec<&Task> = tasks
        .iter()
        .copied()
        .filter(|task| task.requires_new_tests() && !task.new_tests_written)
        .collect();
    if !missing.is_empty() {
        return GateCheck::fail(format!(
            "FAILED: Not all tasks satisfied new-test requirement.\n  Missing: {}",
            ids(&missing)
        ));
    }
    let lines: Vec<String> = tasks
        .iter()
        .map(|task| {
            let evidence = match task.new_test_evidence.as_deref() {
                Some(evidence) if !evidence.is_empty() => evidence,
                _ if !task.requires_new_tests() => "not required",
                _ => "new tests present",
            };
            format!("     {}: {evidence}", task.id)
        })
        .collect();
    GateCheck::pass(format!(
        "   New tests verified ({n}/{n} tasks):\n{}",
        lines.join("\n"),
        n = tasks.len()
    ))
}

/// Every task has a terminal review outcome. `blocked` counts as reviewed.
pub fn check_reviews(tasks: &[&Task]) -> GateCheck {
    if tasks.iter().all(|task| task.review_status.is_terminal()) {
        let lines: Vec<String> = tasks
            .iter()
            .map(|task| format!("     {}: {}", task.id, task.review_status.as_str()))
            .collect();
        return GateCheck::pass(format!(
            "2. Reviews verified ({n}/{n} tasks):\n{}",
            lines.join("\n"),
            n = tasks.len()
        ));
    }

    let with_status = |status: ReviewStatus| -> Vec<&Task> {
        tasks
            .iter()
            .copied()
            .filter(|task| task.review_status == status)
            .collect()
    };
    let failed = with_status(ReviewStatus::EvidenceCaptureFailed);
    let unreviewed = with_status(ReviewStatus::Pending);

    let mut parts = vec!["FAILED: Not all tasks have been reviewed.".to_string()];
    if !failed.is_empty() {
        parts.push(format!("  Evidence capture failed: {}", ids(&failed)));
    }
    if !unreviewed.is_empty() {
        parts.push(format!("  Unreviewed: {}", ids(&unreviewed)));
    }
    GateCheck::fail(parts.join("\n"))
}

/// A recorded spec check must belong to `wave` and carry a captured count of
/// zero critical findings.
pub fn check_spec_alignment(spec_check: Option<&SpecCheck>, wave: u32) -> GateCheck {
    let Some(check) = spec_check else {
        return GateCheck::pass("3. Spec alignment: skipped (no spec-check data).");
    };
    if check.wave != wave {
        return GateCheck::fail(format!(
            "FAILED: Spec alignment was run for wave {}, not {wave}. Re-run /spec-check for wave {wave}.",
            check.wave
        ));
    }
    let Some(critical) = check
        .critical_count
        .filter(|_| check.verdict != EVIDENCE_CAPTURE_FAILED)
    else {
        return GateCheck::fail(format!(
            "FAILED: Spec-check evidence capture failed for wave {wave}. Re-run /spec-check."
        ));
    };
    if critical > 0 {
        let findings: Vec<String> = check
            .critical_findings
            .iter()
            .map(|finding| format!("  - {finding}"))
            .collect();
        return GateCheck::fail(format!(
            "FAILED: Spec alignment has {critical} critical findings.\n{}",
            findings.join("\n")
        ));
    }
    GateCheck::pass(format!(
        "3. Spec alignment verified (verdict: {}).",
        check.verdict
    ))
}

/// No task carries a non-blank critical review finding.
pub fn check_critical_findings(tasks: &[&Task]) -> GateCheck {
    let offending: Vec<(&str, Vec<&str>)> = tasks
        .iter()
        .map(|task| (task.id.as_str(), task.effective_critical_findings()))
        .filter(|(_, findings)| !findings.is_empty())
        .collect();
    let total: usize = offending.iter().map(|(_, findings)| findings.len()).sum();
    if total == 0 {
        return GateCheck::pass("4. No critical code review findings.");
    }
    let details: Vec<String> = offending
        .iter()
        .map(|(id, findings)| format!("  {id}: {}", findings.join(", ")))
        .collect();
    GateCheck::fail(format!(
        "FAILED: {total} critical code review findings.\n{}",
        details.join("\n")
    ))
}

/// Smallest wave number greater than `current`. Wave numbers need not be
/// contiguous here.
pub fn compute_next_wave(tasks: &[Task], current: u32) -> Option<u32> {
    tasks
        .iter()
        .map(|task| task.wave)
        .filter(|&wave| wave > current)
        .min()
}

/// Result of a gate completion request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaveGateOutcome {
    /// The wave was already verified and the graph moved past it.
    AlreadyAdvanced { wave: u32 },
    /// A check failed; `report` holds every check message up to and including
    /// the failure, `failure` the failing message alone.
    Failed {
        wave: u32,
        report: Vec<String>,
        failure: String,
    },
    /// All checks passed; `next_wave` is `None` when the workflow is complete.
    Passed {
        wave: u32,
        report: Vec<String>,
        next_wave: Option<u32>,
    },
}

/// Run the gate for `wave` (default: current wave) and, when every check
/// passes, complete the wave and advance `current_wave`. Waves ahead of the
/// current one or without tasks are refused.
pub fn complete_wave(graph: &mut TaskGraph, wave: Option<u32>) -> WaveGateOutcome {
    let wave = wave.unwrap_or_else(|| graph.current_wave());

    let advanced = wave < graph.current_wave()
        && graph.gate(wave).is_some_and(|gate| gate.reviews_complete);
    if advanced {
        return WaveGateOutcome::AlreadyAdvanced { wave };
    }

    let current = graph.current_wave();
    if wave > current {
        let failure =
            format!("FAILED: Wave {wave} is not active yet (current wave is {current}).");
        return WaveGateOutcome::Failed {
            wave,
            report: vec![failure.clone()],
            failure,
        };
    }

    let tasks = graph.wave_tasks(wave);
    if tasks.is_empty() {
        let failure = format!("FAILED: Wave {wave} has no tasks.");
        return WaveGateOutcome::Failed {
            wave,
            report: vec![failure.clone()],
            failure,
        };
    }

    let checks = [
        check_test_evidence(&tasks),
        check_new_tests(&tasks),
        check_reviews(&tasks),
        check_spec_alignment(graph.spec_check.as_ref(), wave),
        check_critical_findings(&tasks),
    ];

    let mut report = Vec::new();
    for check in checks {
        report.push(check.message.clone());
        if !check.passed {
            return WaveGateOutcome::Failed {
                wave,
                report,
                failure: check.message,
            };
        }
    }

    for task in graph.tasks.iter_mut().filter(|task| task.wave == wave) {
        task.status = TaskStatus::Completed;
        task.review_status = ReviewStatus::Passed;
    }
    let gate = graph.gate_mut(wave);
    gate.tests_passed = Some(true);
    gate.reviews_complete = true;
    gate.blocked = false;

    let next_wave = compute_next_wave(&graph.tasks, wave);
    if let Some(next) = next_wave {
        graph.gate_mut(next);
        graph.current_wave = Some(next);
    }
    graph.touch();

    WaveGateOutcome::Passed {
        wave,
        report,
        next_wave,
    }
}

/// Markdown summary of a passed wave.
pub fn generate_wave_gate_summary(
    wave: u32,
    tasks: &[&Task],
    spec_check: Option<&SpecCheck>,
) -> String {
    let mut lines = vec![format!("## Wave {wave} — Gate Passed\n")];

    if let Some(check) = spec_check {
        lines.push(format!(
            "### Spec Alignment: {} ({} critical)",
            check.verdict,
            check.critical_count.unwrap_or(0)
        ));
        lines.extend(
            check
                .medium_findings
                .iter()
                .map(|finding| format!("- MEDIUM: {finding}")),
        );
        lines.push(String::new());
    }

    lines.push("### Code Review\n".to_string());
    for task in tasks {
        let critical = task.critical_findings.len();
        let advisory = task.advisory_findings.len();
        let description: String = task.description.chars().take(60).collect();
        lines.push(format!("#### {}: {description}", task.id));
        lines.push(format!(
            "**Status:** {} — {critical} critical, {advisory} advisory",
            task.review_status.as_str()
        ));
        if advisory > 0 {
            lines.push("<details>".to_string());
            lines.push(format!("<summary>{advisory} advisories</summary>\n"));
            lines.extend(task.advisory_findings.iter().map(|a| format!("- {a}")));
            lines.push("</details>".to_string());
        }
        lines.push(String::new());
    }

    lines.push("### Tests".to_string());
    for task in tasks {
        let evidence = task
            .test_evidence
            .as_deref()
            .filter(|evidence| !evidence.is_empty())
            .unwrap_or("no evidence");
        lines.push(format!("- {}: {evidence}", task.id));
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::findings::{parse_spec_check_output, spec_check_record};
    use crate::graph::{Phase, WaveGate, build_wave_gates};

    fn verified(id: &str, wave: u32) -> Task {
        let mut task = Task::new(id, wave);
        task.status = TaskStatus::Implemented;
        task.tests_passed = true;
        task.test_evidence = Some("cargo: 4 passed".into());
        task.new_tests_written = true;
        task.review_status = ReviewStatus::Passed;
        task
    }

    fn graph_with(tasks: Vec<Task>) -> TaskGraph {
        let mut graph = TaskGraph::new(Phase::Execute);
        graph.wave_gates = build_wave_gates(&tasks);
        graph.tasks = tasks;
        graph.current_wave = Some(1);
        graph
    }

    #[test]
    fn missing_evidence_lists_task_ids() {
        let mut t2 = verified("T2", 1);
        t2.tests_passed = false;
        let task1 = verified("T1", 1);
        let check = check_test_evidence(&[&task1, &t2]);
        assert!(!check.passed);
        assert!(check.message.ends_with("Missing: T2"));
    }

    #[test]
    fn exempt_task_passes_new_test_check() {
        let mut task = verified("T1", 1);
        task.new_tests_written = false;
        task.new_tests_required = Some(false);
        let check = check_new_tests(&[&task]);
        assert!(check.passed);
        assert!(check.message.contains("T1: not required"));
    }

    #[test]
    fn blocked_review_counts_as_reviewed() {
        let mut blocked = verified("T1", 1);
        blocked.review_status = ReviewStatus::Blocked;
        assert!(check_reviews(&[&blocked]).passed);

        let mut failed = verified("T2", 1);
        failed.review_status = ReviewStatus::EvidenceCaptureFailed;
        let pending = Task::new("T3", 1);
        let check = check_reviews(&[&blocked, &failed, &pending]);
        assert!(!check.passed);
        assert!(check.message.contains("Evidence capture failed: T2"));
        assert!(check.message.contains("Unreviewed: T3"));
    }

    #[test]
    fn spec_check_for_other_wave_fails() {
        let check = SpecCheck {
            wave: 1,
            run_at: "now".into(),
            critical_count: Some(0),
            high_count: Some(0),
            critical_findings: vec![],
            high_findings: vec![],
            medium_findings: vec![],
            verdict: "PASSED".into(),
            error: None,
        };
        assert!(check_spec_alignment(Some(&check), 1).passed);
        assert!(!check_spec_alignment(Some(&check), 2).passed);
        assert!(check_spec_alignment(None, 2).passed);
    }

    #[test]
    fn capture_failed_spec_check_fails_alignment() {
        let record = spec_check_record(
            parse_spec_check_output("SPEC_CHECK_VERDICT: PASSED"),
            1,
            "now".to_string(),
        );
        assert_eq!(record.verdict, EVIDENCE_CAPTURE_FAILED);

        let check = check_spec_alignment(Some(&record), 1);
        assert!(!check.passed);
        assert_eq!(
            check.message,
            "FAILED: Spec-check evidence capture failed for wave 1. Re-run /spec-check."
        );

        let mut graph = graph_with(vec![verified("T1", 1), Task::new("T2", 2)]);
        graph.spec_check = Some(record);
        let before = graph.clone();
        let outcome = complete_wave(&mut graph, Some(1));
        assert!(matches!(outcome, WaveGateOutcome::Failed { wave: 1, .. }));
        assert_eq!(graph, before);
    }

    #[test]
    fn spec_check_without_critical_count_fails_alignment() {
        let check = SpecCheck {
            wave: 1,
            run_at: "now".into(),
            critical_count: None,
            high_count: None,
            critical_findings: vec![],
            high_findings: vec![],
            medium_findings: vec![],
            verdict: "PASSED".into(),
            error: None,
        };
        assert!(!check_spec_alignment(Some(&check), 1).passed);
    }

    #[test]
    fn wave_without_tasks_is_rejected() {
        let mut graph = graph_with(vec![verified("T1", 1)]);
        graph.current_wave = Some(99);
        let before = graph.clone();

        let outcome = complete_wave(&mut graph, Some(99));
        let WaveGateOutcome::Failed { failure, .. } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(failure, "FAILED: Wave 99 has no tasks.");
        assert_eq!(graph, before);
        assert!(graph.gate(99).is_none());
    }

    #[test]
    fn future_wave_is_rejected() {
        let mut graph = graph_with(vec![verified("T1", 1), verified("T2", 2)]);
        let before = graph.clone();

        let outcome = complete_wave(&mut graph, Some(2));
        let WaveGateOutcome::Failed { failure, .. } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(failure.contains("Wave 2 is not active yet"));
        assert_eq!(graph, before);
    }

    #[test]
    fn blank_critical_findings_do_not_count() {
        let mut task = verified("T1", 1);
        task.critical_findings = vec!["   ".into(), String::new()];
        assert!(check_critical_findings(&[&task]).passed);

        task.critical_findings.push("SQL injection".into());
        let check = check_critical_findings(&[&task]);
        assert_eq!(
            check.message,
            "FAILED: 1 critical code review findings.\n  T1: SQL injection"
        );
    }

    #[test]
    fn next_wave_skips_gaps() {
        let tasks = vec![Task::new("T1", 1), Task::new("T2", 4), Task::new("T3", 2)];
        assert_eq!(compute_next_wave(&tasks, 1), Some(2));
        assert_eq!(compute_next_wave(&tasks, 2), Some(4));
        assert_eq!(compute_next_wave(&tasks, 4), None);
    }

    #[test]
    fn failed_gate_leaves_document_unchanged() {
        let mut t2 = verified("T2", 1);
        t2.review_status = ReviewStatus::Pending;
        let mut graph = graph_with(vec![verified("T1", 1), t2, Task::new("T3", 2)]);
        let before = graph.clone();

        let outcome = complete_wave(&mut graph, None);
        let WaveGateOutcome::Failed { report, failure, .. } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(failure.contains("Unreviewed: T2"));
        assert_eq!(report.len(), 3);
        assert_eq!(graph, before);
    }

    #[test]
    fn passing_gate_completes_wave_and_advances() {
        let mut graph = graph_with(vec![verified("T1", 1), verified("T2", 1), Task::new("T3", 2)]);
        let outcome = complete_wave(&mut graph, None);
        assert!(matches!(
            outcome,
            WaveGateOutcome::Passed { wave: 1, next_wave: Some(2), .. }
        ));
        assert_eq!(graph.current_wave(), 2);
        assert!(graph.wave_tasks(1).iter().all(|t| t.status == TaskStatus::Completed));
        assert_eq!(
            graph.gate(1),
            Some(&WaveGate {
                impl_complete: false,
                tests_passed: Some(true),
                reviews_complete: true,
                blocked: false,
            })
        );
        assert!(graph.gate(2).is_some());
    }

    #[test]
    fn second_completion_is_a_no_op() {
        let mut graph = graph_with(vec![verified("T1", 1), Task::new("T2", 2)]);
        let first = complete_wave(&mut graph, Some(1));
        assert!(matches!(first, WaveGateOutcome::Passed { .. }));
        let after_first = graph.clone();

        let second = complete_wave(&mut graph, Some(1));
        assert_eq!(second, WaveGateOutcome::AlreadyAdvanced { wave: 1 });
        assert_eq!(graph, after_first);
    }

    #[test]
    fn last_wave_reports_completion() {
        let mut graph = graph_with(vec![verified("T1", 1)]);
        let outcome = complete_wave(&mut graph, None);
        assert!(matches!(outcome, WaveGateOutcome::Passed { next_wave: None, .. }));
        assert_eq!(graph.current_wave(), 1);
    }

    #[test]
    fn summary_includes_advisories_and_evidence() {
        let mut task = verified("T1", 1);
        task.description = "Add parser".into();
        task.advisory_findings = vec!["rename helper".into()];
        let summary = generate_wave_gate_summary(1, &[&task], None);
        assert!(summary.starts_with("## Wave 1 — Gate Passed"));
        assert!(summary.contains("#### T1: Add parser"));
        assert!(summary.contains("<summary>1 advisories</summary>"));
        assert!(summary.contains("- T1: cargo: 4 passed"));
    }
}
