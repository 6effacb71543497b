//! Subagent completion: route by role, then record what the agent produced.
//!
//! Phase agents advance the workflow, implementation agents record evidence,
//! review agents record findings, and the spec-check invoker records the
//! alignment verdict. [`dispatch`] is the single entry point the assistant
//! calls; the per-role handlers are also exposed for direct invocation.

use std::sync::LazyLock;

use anyhow::Result;
use chrono::Utc;
use regex::Regex;
use tracing::{debug, error, instrument, warn};

use crate::core::agents::{
    AgentCategory, SPEC_CHECK_INVOKER, categorize, is_impl_agent, is_review_sub_agent,
    phase_for_agent,
};
use crate::core::evidence::{NewTestEvidence, analyze_new_tests, extract_test_evidence};
use crate::core::findings::{
    merge_findings, mark_review_capture_failed, parse_review_findings, parse_spec_check_output,
    spec_check_record,
};
use crate::core::phase::{ArtifactProbe, already_past, apply_transition, resolve_transition};
use crate::core::scheduler::{Implementation, TaskInference, infer_task, is_reentry, record_implementation};
use crate::core::task_id::extract_task_id;
use crate::core::transcript::{bash_test_output, files_modified, flatten_text, phase_artifacts};
use crate::core::types::Capture;
use crate::hooks::{HookContext, HookOutcome, SubagentInput, parse_input};
use crate::io::git::Repository;
use crate::io::transcript;

static REVIEW_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"CRITICAL_COUNT:\s*\d+").unwrap());
static SPEC_CHECK_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"SPEC_CHECK_CRITICAL_COUNT:\s*\d+").unwrap());

/// Route a completed subagent to the handler for its role.
///
/// Tracking cleanup always runs. A failing handler is reported but never
/// fails the hook, so one bad transcript cannot wedge the session.
#[instrument(skip_all)]
pub fn dispatch<R: Repository>(ctx: &HookContext, stdin: &str, repo: &R) -> Result<HookOutcome> {
    let input: SubagentInput = parse_input(stdin)?;
    safe_run("cleanup_subagent_flag", || cleanup(ctx, &input));

    if ctx.resolve_graph(input.session()).is_none() {
        return Ok(HookOutcome::Passthrough);
    }

    match categorize(input.agent()) {
        AgentCategory::Phase(_) => safe_run("advance_phase", || advance(ctx, &input)),
        AgentCategory::Impl => safe_run("update_task_status", || update_status(ctx, &input, repo)),
        AgentCategory::Review => safe_run("store_reviewer_findings", || store_review(ctx, &input)),
        AgentCategory::SpecCheck => {
            safe_run("store_spec_check_findings", || store_spec_check(ctx, &input));
        }
        AgentCategory::Unknown => debug!(agent = input.agent(), "no handler for agent"),
    }
    Ok(HookOutcome::Passthrough)
}

fn safe_run(name: &str, handler: impl FnOnce() -> Result<HookOutcome>) {
    if let Err(err) = handler() {
        error!(handler = name, err = %format!("{err:#}"), "subagent-stop handler failed");
        eprintln!("ERROR in {name}: {err:#}");
    }
}

pub fn advance_phase(ctx: &HookContext, stdin: &str) -> Result<HookOutcome> {
    advance(ctx, &parse_input(stdin)?)
}

pub fn update_task_status<R: Repository>(
    ctx: &HookContext,
    stdin: &str,
    repo: &R,
) -> Result<HookOutcome> {
    update_status(ctx, &parse_input(stdin)?, repo)
}

pub fn store_reviewer_findings(ctx: &HookContext, stdin: &str) -> Result<HookOutcome> {
    store_review(ctx, &parse_input(stdin)?)
}

pub fn store_spec_check_findings(ctx: &HookContext, stdin: &str) -> Result<HookOutcome> {
    store_spec_check(ctx, &parse_input(stdin)?)
}

pub fn cleanup_subagent_flag(ctx: &HookContext, stdin: &str) -> Result<HookOutcome> {
    cleanup(ctx, &parse_input(stdin)?)
}

/// Capture the phase agent's documents, then advance when the completed
/// phase's artifacts are in place.
#[instrument(skip_all, fields(agent = input.agent()))]
fn advance(ctx: &HookContext, input: &SubagentInput) -> Result<HookOutcome> {
    let Some(completed) = phase_for_agent(input.agent()) else {
        return Ok(HookOutcome::Passthrough);
    };
    let Some(store) = ctx.session_store(input.session()) else {
        return Ok(HookOutcome::Passthrough);
    };

    let current = store.load()?;
    if already_past(current.current_phase, completed) {
        eprintln!(
            "Phase {completed} already past (current: {}), skipping.",
            current.current_phase
        );
        return Ok(HookOutcome::Passthrough);
    }

    let probe = ctx.artifacts_for(&store);
    let settings = ctx.phase_settings();

    if transcript::exists(input.transcript_path()) {
        let content = transcript::read_raw(input.transcript_path());
        let found = phase_artifacts(
            &content,
            &settings.specs_dir,
            &settings.plans_dir,
            current.spec_dir.as_deref(),
        );
        store.update(|graph| {
            if let Some(spec) = found.spec_file.filter(|spec| probe.exists(spec)) {
                debug!(spec, "spec document captured");
                graph.spec_file = Some(spec);
            }
            if graph.plan_file.is_none()
                && let Some(plan) = found.plan_file.filter(|plan| probe.exists(plan))
            {
                debug!(plan, "plan document captured");
                graph.plan_file = Some(plan);
            }
            Ok(())
        })?;
    }

    let transition = store.update(|graph| {
        let Some(transition) = resolve_transition(completed, graph, &probe, &settings) else {
            return Ok(None);
        };
        apply_transition(graph, completed, &transition);
        Ok(Some(transition))
    })?;

    match transition {
        Some(transition) => {
            eprintln!("Phase advanced: {completed} → {}", transition.next);
            if transition.skip_clarify {
                eprintln!(
                    "  (clarify auto-skipped: markers ≤ {})",
                    settings.clarify_threshold
                );
            }
        }
        None => debug!(%completed, "artifacts not ready, phase unchanged"),
    }
    Ok(HookOutcome::Passthrough)
}

/// Record an implementation agent's evidence against its task.
#[instrument(skip_all, fields(agent = input.agent()))]
fn update_status<R: Repository>(
    ctx: &HookContext,
    input: &SubagentInput,
    repo: &R,
) -> Result<HookOutcome> {
    let agent = input.agent();
    if !is_impl_agent(agent) {
        return Ok(HookOutcome::Passthrough);
    }
    let Some(store) = ctx.session_store(input.session()) else {
        return Ok(HookOutcome::Passthrough);
    };

    let content = transcript::read_raw(input.transcript_path());
    let text = flatten_text(&content);
    let files = files_modified(&content);
    let test_output = bash_test_output(&content, transcript::read_side_file);

    let graph = store.load()?;
    let task_id = match infer_task(extract_task_id(&text), &graph.executing_tasks) {
        TaskInference::Explicit(id) => id,
        TaskInference::Inferred(id) => {
            warn!(agent, task_id = id, "task id inferred from executing tasks");
            eprintln!(
                "WARNING: {agent} transcript parse failed, inferred task {id} from executing_tasks"
            );
            id
        }
        TaskInference::Ambiguous { executing } => {
            // Marking every executing task failed would let later completions
            // bypass the re-entry guard, so only the executing set is cleared.
            if executing > 0 {
                warn!(agent, executing, "completion without task id is ambiguous");
                eprintln!(
                    "WARNING: {agent} completed without task ID, {executing} tasks executing (ambiguous)"
                );
            }
            store.update(|graph| {
                graph.executing_tasks.clear();
                Ok(())
            })?;
            return Ok(HookOutcome::Passthrough);
        }
    };

    let Some(task) = graph.task(&task_id) else {
        debug!(task_id, "task not in graph");
        return Ok(HookOutcome::Passthrough);
    };
    if is_reentry(&graph, &task_id) {
        debug!(task_id, "task already has evidence, skipping");
        return Ok(HookOutcome::Passthrough);
    }

    let tests = extract_test_evidence(&test_output);
    let new_tests = if repo.is_repo() {
        let diff = repo.collect_diff(&files, task.start_sha.as_deref());
        analyze_new_tests(&diff, task.new_tests_required)
    } else {
        NewTestEvidence::default()
    };
    debug!(task_id, passed = tests.passed, new_tests = new_tests.written, "evidence extracted");

    let implementation = Implementation {
        tests,
        new_tests,
        files_modified: files,
    };
    let recorded = store.update(|graph| {
        if is_reentry(graph, &task_id) {
            return Ok(None);
        }
        Ok(Some(record_implementation(graph, &task_id, implementation)))
    })?;
    let Some(wave_complete) = recorded else {
        return Ok(HookOutcome::Passthrough);
    };

    eprintln!("Task {task_id} implemented.");
    if let Some(wave) = wave_complete {
        eprintln!("\nWave {wave} implementation complete. Run: /wave-gate");
    }
    Ok(HookOutcome::Passthrough)
}

/// Merge a review sub-agent's findings into its task.
#[instrument(skip_all, fields(agent = input.agent()))]
fn store_review(ctx: &HookContext, input: &SubagentInput) -> Result<HookOutcome> {
    if !is_review_sub_agent(input.agent()) {
        return Ok(HookOutcome::Passthrough);
    }
    let Some(store) = ctx.session_store(input.session()) else {
        return Ok(HookOutcome::Passthrough);
    };

    let text = transcript::read_with_retry(
        input.transcript_path(),
        Some(&REVIEW_MARKER),
        ctx.config.transcript.max_retries,
        ctx.config.transcript_retry(),
    );
    if text.is_empty() {
        return Ok(HookOutcome::Passthrough);
    }
    let Some(task_id) = extract_task_id(&text) else {
        warn!("review transcript names no task");
        return Ok(HookOutcome::Passthrough);
    };

    match parse_review_findings(&text) {
        Capture::Missing => {
            warn!(task_id, "review evidence capture failed");
            eprintln!("WARNING: No CRITICAL_COUNT for {task_id} - marking evidence_capture_failed");
            store.update(|graph| {
                if let Some(task) = graph.task_mut(&task_id) {
                    mark_review_capture_failed(task);
                }
                Ok(())
            })?;
        }
        Capture::Found(findings) => {
            store.update(|graph| {
                if let Some(task) = graph.task_mut(&task_id) {
                    merge_findings(task, &findings);
                }
                Ok(())
            })?;
            eprintln!(
                "Task {task_id} review: {} ({} critical)",
                findings.status().as_str(),
                findings.critical_count
            );
        }
    }
    Ok(HookOutcome::Passthrough)
}

/// Record the spec-alignment verdict; critical findings block the wave.
#[instrument(skip_all, fields(agent = input.agent()))]
fn store_spec_check(ctx: &HookContext, input: &SubagentInput) -> Result<HookOutcome> {
    if input.agent() != SPEC_CHECK_INVOKER {
        return Ok(HookOutcome::Passthrough);
    }
    let Some(store) = ctx.session_store(input.session()) else {
        return Ok(HookOutcome::Passthrough);
    };

    let text = transcript::read_with_retry(
        input.transcript_path(),
        Some(&SPEC_CHECK_MARKER),
        ctx.config.transcript.max_retries,
        ctx.config.transcript_retry(),
    );
    if text.is_empty() {
        return Ok(HookOutcome::Passthrough);
    }

    let findings = parse_spec_check_output(&text);
    let run_at = Utc::now().to_rfc3339();
    let record = store.update(|graph| {
        let record = spec_check_record(findings, graph.current_wave(), run_at);
        if record.critical_count.is_some_and(|count| count > 0) {
            graph.gate_mut(record.wave).blocked = true;
        }
        graph.spec_check = Some(record.clone());
        Ok(record)
    })?;

    match record.critical_count {
        None => {
            warn!(wave = record.wave, "spec-check evidence capture failed");
            eprintln!("WARNING: No SPEC_CHECK_CRITICAL_COUNT - marking evidence_capture_failed");
        }
        Some(critical) => eprintln!(
            "Spec-check: {critical} critical, {} high",
            record.high_count.unwrap_or(0)
        ),
    }
    Ok(HookOutcome::Passthrough)
}

fn cleanup(ctx: &HookContext, input: &SubagentInput) -> Result<HookOutcome> {
    if let (Some(session), Some(agent_id)) = (input.session(), input.agent_id()) {
        ctx.subagents().remove_agent(session, agent_id)?;
    }
    Ok(HookOutcome::Passthrough)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use serde_json::json;

    use super::*;
    use crate::graph::{Phase, ReviewStatus, TaskGraph, TaskStatus};
    use crate::test_support::{
        FakeRepo, assistant_text, bash_run, context_in, two_wave_graph, write_transcript,
    };

    fn stop_payload(agent: &str, transcript: &Path) -> String {
        json!({
            "session_id": "s1",
            "agent_id": "a1",
            "agent_type": agent,
            "agent_transcript_path": transcript.display().to_string(),
        })
        .to_string()
    }

    #[test]
    fn impl_completion_records_evidence_and_flags_wave() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context_in(temp.path());
        let store = ctx.store(ctx.graph_path());
        let mut graph = two_wave_graph();
        graph.task_mut("T2").expect("T2").status = TaskStatus::Implemented;
        graph.executing_tasks = vec!["T1".into()];
        store.create(&graph).expect("create");

        let mut lines = vec![assistant_text("Working on **Task ID:** T1")];
        lines.extend(bash_run("cargo test", "test result: ok. 4 passed; 0 failed"));
        let transcript = write_transcript(temp.path(), "impl.jsonl", &lines);

        let repo = FakeRepo::with_diff("+#[test]\n+fn parses() {\n+    assert_eq!(1, 1);\n+}\n");
        update_task_status(&ctx, &stop_payload("code-implementer-agent", &transcript), &repo)
            .expect("hook");

        let graph = store.load().expect("load");
        let task = graph.task("T1").expect("T1");
        assert_eq!(task.status, TaskStatus::Implemented);
        assert!(task.tests_passed);
        assert!(task.new_tests_written);
        assert!(graph.executing_tasks.is_empty());
        assert!(graph.gate(1).is_some_and(|gate| gate.impl_complete));
    }

    #[test]
    fn narrated_test_results_are_not_evidence() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context_in(temp.path());
        let store = ctx.store(ctx.graph_path());
        store.create(&two_wave_graph()).expect("create");

        let transcript = write_transcript(
            temp.path(),
            "impl.jsonl",
            &[assistant_text("Task ID: T1\nAll tests pass: test result: ok. 9 passed")],
        );
        update_task_status(
            &ctx,
            &stop_payload("code-implementer-agent", &transcript),
            &FakeRepo::default(),
        )
        .expect("hook");

        let task = store.load().expect("load").task("T1").cloned().expect("T1");
        assert_eq!(task.status, TaskStatus::Implemented);
        assert!(!task.tests_passed);
    }

    #[test]
    fn ambiguous_completion_clears_executing_only() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context_in(temp.path());
        let store = ctx.store(ctx.graph_path());
        let mut graph = two_wave_graph();
        graph.executing_tasks = vec!["T1".into(), "T2".into()];
        store.create(&graph).expect("create");

        let transcript =
            write_transcript(temp.path(), "impl.jsonl", &[assistant_text("done, no id here")]);
        update_task_status(
            &ctx,
            &stop_payload("code-implementer-agent", &transcript),
            &FakeRepo::default(),
        )
        .expect("hook");

        let graph = store.load().expect("load");
        assert!(graph.executing_tasks.is_empty());
        assert!(graph.tasks.iter().all(|task| task.status == TaskStatus::Pending));
    }

    #[test]
    fn completed_task_is_not_overwritten() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context_in(temp.path());
        let store = ctx.store(ctx.graph_path());
        let mut graph = two_wave_graph();
        let task = graph.task_mut("T1").expect("T1");
        task.tests_passed = true;
        task.test_evidence = Some("cargo: 4 passed".into());
        store.create(&graph).expect("create");

        let transcript =
            write_transcript(temp.path(), "impl.jsonl", &[assistant_text("Task ID: T1")]);
        update_task_status(
            &ctx,
            &stop_payload("code-implementer-agent", &transcript),
            &FakeRepo::default(),
        )
        .expect("hook");

        let task = store.load().expect("load").task("T1").cloned().expect("T1");
        assert_eq!(task.test_evidence.as_deref(), Some("cargo: 4 passed"));
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn review_findings_accumulate_per_task() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context_in(temp.path());
        let store = ctx.store(ctx.graph_path());
        store.create(&two_wave_graph()).expect("create");

        let first = write_transcript(
            temp.path(),
            "r1.jsonl",
            &[assistant_text(
                "Reviewing Task ID: T1\n### Machine Summary\nCRITICAL_COUNT: 1\nCRITICAL: unchecked index\nADVISORY: rename x",
            )],
        );
        let second = write_transcript(
            temp.path(),
            "r2.jsonl",
            &[assistant_text(
                "Reviewing Task ID: T1\n### Machine Summary\nCRITICAL_COUNT: 0\nADVISORY: add docs",
            )],
        );
        store_reviewer_findings(&ctx, &stop_payload("loom:code-reviewer", &first)).expect("hook");
        store_reviewer_findings(&ctx, &stop_payload("silent-failure-hunter", &second))
            .expect("hook");

        let task = store.load().expect("load").task("T1").cloned().expect("T1");
        assert_eq!(task.review_status, ReviewStatus::Blocked);
        assert_eq!(task.critical_findings, vec!["unchecked index".to_string()]);
        assert_eq!(task.advisory_findings.len(), 2);
    }

    #[test]
    fn review_without_count_is_a_capture_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context_in(temp.path());
        let store = ctx.store(ctx.graph_path());
        store.create(&two_wave_graph()).expect("create");

        let transcript = write_transcript(
            temp.path(),
            "r.jsonl",
            &[assistant_text("Task ID: T2 looks fine to me")],
        );
        store_reviewer_findings(&ctx, &stop_payload("code-reviewer", &transcript)).expect("hook");

        let task = store.load().expect("load").task("T2").cloned().expect("T2");
        assert_eq!(task.review_status, ReviewStatus::EvidenceCaptureFailed);
        assert!(task.review_error.is_some());
    }

    #[test]
    fn critical_spec_check_blocks_the_wave() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context_in(temp.path());
        let store = ctx.store(ctx.graph_path());
        store.create(&two_wave_graph()).expect("create");

        let transcript = write_transcript(
            temp.path(),
            "spec.jsonl",
            &[assistant_text(
                "SPEC_CHECK_WAVE: 1\nSPEC_CHECK_CRITICAL_COUNT: 1\nSPEC_CHECK_HIGH_COUNT: 0\nCRITICAL: login flow missing\nSPEC_CHECK_VERDICT: BLOCKED",
            )],
        );
        store_spec_check_findings(&ctx, &stop_payload(SPEC_CHECK_INVOKER, &transcript))
            .expect("hook");

        let graph = store.load().expect("load");
        let check = graph.spec_check.as_ref().expect("spec check");
        assert_eq!(check.critical_count, Some(1));
        assert_eq!(check.verdict, "BLOCKED");
        assert!(graph.gate(1).is_some_and(|gate| gate.blocked));
    }

    #[test]
    fn phase_completion_advances_when_artifact_exists() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context_in(temp.path());
        let store = ctx.store(ctx.graph_path());
        store.create(&TaskGraph::new(Phase::Brainstorm)).expect("create");

        let doc = temp.path().join(".claude/specs/auth/brainstorm.md");
        fs::create_dir_all(doc.parent().expect("parent")).expect("mkdir");
        fs::write(&doc, "ideas").expect("write");

        let transcript = write_transcript(temp.path(), "b.jsonl", &[assistant_text("done")]);
        advance_phase(&ctx, &stop_payload("brainstorm-agent", &transcript)).expect("hook");

        let graph = store.load().expect("load");
        assert_eq!(graph.current_phase, Phase::Specify);
        assert_eq!(
            graph.phase_artifacts.get("brainstorm").map(String::as_str),
            Some(".claude/specs/auth/brainstorm.md")
        );
    }

    #[test]
    fn dispatch_survives_corrupt_state_and_cleans_up() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context_in(temp.path());
        let path = ctx.graph_path();
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, "{not json").expect("write");
        ctx.subagents().mark_active("s1", "a1").expect("mark");

        let transcript = write_transcript(temp.path(), "t.jsonl", &[assistant_text("Task ID: T1")]);
        let outcome = dispatch(
            &ctx,
            &stop_payload("code-implementer-agent", &transcript),
            &FakeRepo::default(),
        )
        .expect("dispatch");
        assert_eq!(outcome, HookOutcome::Passthrough);
        assert!(!ctx.config.subagent_dir.join("s1.active").exists());
    }
}
