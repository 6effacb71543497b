//! Orchestrator-invoked commands: start a run, populate and validate the task
//! graph, record manual evidence, run wave gates, and end a run.
//!
//! Human-facing progress goes to stderr; machine-readable output (fixed JSON,
//! extracted task ids, gate summaries) goes to stdout.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::Utc;
use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use crate::core::evidence::{NewTestEvidence, TestEvidence};
use crate::core::findings::{
    apply_manual_findings, parse_marker_lines, parse_spec_check_output, spec_check_record,
};
use crate::core::phase::{SkipFlags, initial_graph};
use crate::core::scheduler::{Implementation, record_implementation};
use crate::core::task_id;
use crate::core::wave_gate::{WaveGateOutcome, complete_wave, generate_wave_gate_summary};
use crate::graph::{Phase, TaskStatus, build_wave_gates};
use crate::hooks::{HookContext, HookOutcome};
use crate::io::store::StateStore;
use crate::validate::{
    Decompose, fix_full, fix_minimal, validate_full, validate_minimal,
};

static TEST_PASSED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?mi)^TEST_PASSED:\s*true\b").unwrap());
static TEST_EVIDENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^TEST_EVIDENCE:[ \t]*(.*)$").unwrap());
static NEW_TESTS_WRITTEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?mi)^NEW_TESTS_WRITTEN:\s*true\b").unwrap());
static NEW_TEST_EVIDENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^NEW_TEST_EVIDENCE:[ \t]*(.*)$").unwrap());

fn no_task_graph(ctx: &HookContext) -> HookOutcome {
    HookOutcome::error(format!("No task graph at {}", ctx.graph_path().display()))
}

fn require_store(ctx: &HookContext) -> Result<StateStore, HookOutcome> {
    ctx.local_store().ok_or_else(|| no_task_graph(ctx))
}

fn print_json(value: &Value) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{rendered}");
    Ok(())
}

/// Options for starting a run.
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    pub skip: SkipFlags,
    /// Directory that scopes artifact discovery; defaults to `specs_dir`.
    pub spec_dir: Option<String>,
    pub force: bool,
}

/// Create the run's document from the skip flags.
#[instrument(skip_all)]
pub fn init(ctx: &HookContext, options: &InitOptions) -> Result<HookOutcome> {
    let store = ctx.store(ctx.graph_path());
    if store.exists() && !options.force {
        return Ok(HookOutcome::error(format!(
            "Task graph already exists at {}. Use --force to start over.",
            store.path().display()
        )));
    }

    let spec_dir = options
        .spec_dir
        .clone()
        .unwrap_or_else(|| ctx.config.specs_dir.clone());
    let graph = match initial_graph(options.skip, &spec_dir, &ctx.artifacts_for(&store)) {
        Ok(graph) => graph,
        Err(message) => return Ok(HookOutcome::Error(message)),
    };

    if store.exists() {
        store.replace(&graph)?;
    } else {
        store.create(&graph)?;
    }

    let skipped: Vec<&str> = graph.skipped_phases.iter().map(|p| p.as_str()).collect();
    eprintln!(
        "Task graph initialized: phase={} skipped=[{}]",
        graph.current_phase,
        skipped.join(", ")
    );
    Ok(HookOutcome::Passthrough)
}

/// Verify a wave and advance to the next one when every check passes.
#[instrument(skip_all, fields(wave = ?wave))]
pub fn complete_wave_gate(ctx: &HookContext, wave: Option<u32>) -> Result<HookOutcome> {
    let store = match require_store(ctx) {
        Ok(store) => store,
        Err(outcome) => return Ok(outcome),
    };

    match store.update(|graph| Ok(complete_wave(graph, wave)))? {
        WaveGateOutcome::AlreadyAdvanced { wave } => {
            eprintln!("Wave {wave} gate already passed; nothing to do.");
            Ok(HookOutcome::Passthrough)
        }
        WaveGateOutcome::Failed {
            wave,
            report,
            failure,
        } => {
            eprintln!("Completing wave {wave} gate...\n");
            for message in report.iter().take(report.len().saturating_sub(1)) {
                eprintln!("{message}");
            }
            Ok(HookOutcome::Error(failure))
        }
        WaveGateOutcome::Passed {
            wave,
            report,
            next_wave,
        } => {
            eprintln!("Completing wave {wave} gate...\n");
            for message in &report {
                eprintln!("{message}");
            }
            eprintln!("\nAll checks passed. Advancing...");
            match next_wave {
                Some(next) => eprintln!("Advanced to wave {next}."),
                None => eprintln!("\n=== All waves complete! ===\nRun /loom --complete to finalize."),
            }

            let graph = store.load()?;
            println!(
                "{}",
                generate_wave_gate_summary(wave, &graph.wave_tasks(wave), graph.spec_check.as_ref())
            );
            Ok(HookOutcome::Passthrough)
        }
    }
}

/// Options for merging decompose output into the document.
#[derive(Debug, Clone, Default)]
pub struct PopulateOptions {
    pub issue: Option<u64>,
    pub repo: Option<String>,
    pub fix: bool,
    pub force: bool,
}

/// Validate decompose output from stdin and install it as the task graph.
#[instrument(skip_all)]
pub fn populate_task_graph(
    ctx: &HookContext,
    stdin: &str,
    options: &PopulateOptions,
) -> Result<HookOutcome> {
    let store = match require_store(ctx) {
        Ok(store) => store,
        Err(outcome) => return Ok(outcome),
    };

    let Ok(mut json) = serde_json::from_str::<Value>(stdin) else {
        return Ok(HookOutcome::error("Invalid JSON on stdin"));
    };
    let has_tasks = json
        .get("tasks")
        .and_then(Value::as_array)
        .is_some_and(|tasks| !tasks.is_empty());
    if !has_tasks {
        return Ok(HookOutcome::error("No tasks in decompose JSON"));
    }

    let report = validate_full(&json)?;
    for warning in &report.warnings {
        eprintln!("WARNING: {warning}");
    }
    if !report.is_valid() {
        if !options.fix {
            return Ok(HookOutcome::error(format!(
                "Decompose validation failed:\n{}",
                report.bullets()
            )));
        }
        json = fix_full(&json);
        let remaining = validate_full(&json)?;
        if !remaining.is_valid() {
            return Ok(HookOutcome::error(format!(
                "Decompose validation failed after --fix:\n{}",
                remaining.bullets()
            )));
        }
        eprintln!("Auto-fixed {} issues", report.errors.len());
    }

    let decompose = Decompose::from_value(json)?;
    let waves: Vec<String> = decompose.waves().iter().map(u32::to_string).collect();
    let task_count = decompose.tasks.len();

    let populated = store.update(|graph| {
        if !options.force
            && graph
                .tasks
                .iter()
                .any(|task| task.status != TaskStatus::Pending)
        {
            return Ok(Err(
                "Cannot overwrite task graph with non-pending tasks. Use --force to override."
                    .to_string(),
            ));
        }
        if decompose.plan_title.is_some() {
            graph.plan_title = decompose.plan_title;
        }
        if decompose.plan_file.is_some() {
            graph.plan_file = decompose.plan_file;
        }
        if decompose.spec_file.is_some() {
            graph.spec_file = decompose.spec_file;
        }
        graph.wave_gates = build_wave_gates(&decompose.tasks);
        graph.tasks = decompose.tasks;
        graph.current_wave = Some(1);
        graph.executing_tasks.clear();
        if let Some(issue) = options.issue {
            graph.github_issue = Some(issue);
        }
        if let Some(repo) = &options.repo {
            graph.github_repo = Some(repo.clone());
        }
        graph.touch();
        Ok(Ok(()))
    })?;
    if let Err(message) = populated {
        return Ok(HookOutcome::Error(message));
    }

    eprintln!(
        "Task graph populated: {task_count} tasks, waves: {}",
        waves.join(", ")
    );
    Ok(HookOutcome::Passthrough)
}

/// Options for standalone validation.
#[derive(Debug, Clone, Default)]
pub struct ValidateOptions {
    /// Validate a phase-tracking document instead of decompose output.
    pub minimal: bool,
    /// Print the document with structural defaults repaired.
    pub fix: bool,
    /// Read from this file instead of stdin (`-` means stdin).
    pub file: Option<PathBuf>,
}

#[instrument(skip_all)]
pub fn validate_task_graph(stdin: &str, options: &ValidateOptions) -> Result<HookOutcome> {
    let raw = match options.file.as_deref() {
        Some(path) if path.as_os_str() != "-" => {
            if !path.exists() {
                return Ok(HookOutcome::error(format!(
                    "File not found: {}",
                    path.display()
                )));
            }
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?
        }
        _ => stdin.to_string(),
    };

    let json: Value = match serde_json::from_str(&raw) {
        Ok(json) => json,
        Err(_) if options.fix && options.minimal => {
            print_json(&fix_minimal(&Value::Object(Map::new())))?;
            return Ok(HookOutcome::Passthrough);
        }
        Err(err) => {
            debug!(err = %err, "validation input is not json");
            return Ok(HookOutcome::error("Invalid JSON"));
        }
    };

    let report = if options.minimal {
        validate_minimal(&json)
    } else {
        validate_full(&json)?
    };
    for warning in &report.warnings {
        eprintln!("WARNING: {warning}");
    }

    if options.fix {
        let fixed = if options.minimal {
            fix_minimal(&json)
        } else {
            fix_full(&json)
        };
        print_json(&fixed)?;
        if !report.is_valid() {
            eprintln!(
                "Fixed structural defaults; {} issues remain\n{}",
                report.errors.len(),
                report.bullets()
            );
        }
        return Ok(HookOutcome::Passthrough);
    }

    if !report.is_valid() {
        return Ok(HookOutcome::error(format!(
            "Validation FAILED ({} errors):\n{}",
            report.errors.len(),
            report.bullets()
        )));
    }

    if options.minimal {
        eprintln!("Minimal graph valid");
    } else {
        let count = json
            .get("tasks")
            .and_then(Value::as_array)
            .map_or(0, Vec::len);
        eprintln!("Task graph valid: {count} tasks");
    }
    Ok(HookOutcome::Passthrough)
}

/// Replace a task's review findings with `CRITICAL:` / `ADVISORY:` lines from
/// stdin. Any critical finding blocks the task's wave.
#[instrument(skip_all, fields(task_id))]
pub fn store_review_findings(ctx: &HookContext, stdin: &str, task_id: &str) -> Result<HookOutcome> {
    let store = match require_store(ctx) {
        Ok(store) => store,
        Err(outcome) => return Ok(outcome),
    };

    let (critical, advisory) = parse_marker_lines(stdin);
    let (critical_count, advisory_count) = (critical.len(), advisory.len());

    let found = store.update(|graph| {
        let Some(task) = graph.task_mut(task_id) else {
            return Ok(false);
        };
        let wave = task.wave;
        apply_manual_findings(task, critical, advisory);
        if critical_count > 0 {
            graph.gate_mut(wave).blocked = true;
        }
        Ok(true)
    })?;
    if !found {
        return Ok(HookOutcome::error(format!(
            "Task {task_id} not found in task graph"
        )));
    }

    eprintln!(
        "Stored findings for {task_id}: {critical_count} critical, {advisory_count} advisory"
    );
    Ok(HookOutcome::Passthrough)
}

/// Record a spec-check result supplied on stdin.
#[instrument(skip_all)]
pub fn store_spec_check(ctx: &HookContext, stdin: &str) -> Result<HookOutcome> {
    let store = match require_store(ctx) {
        Ok(store) => store,
        Err(outcome) => return Ok(outcome),
    };

    let findings = parse_spec_check_output(stdin);
    let Some(critical) = findings.critical_count else {
        return Ok(HookOutcome::error("SPEC_CHECK_CRITICAL_COUNT marker required"));
    };
    if findings.verdict.is_none() {
        return Ok(HookOutcome::error("SPEC_CHECK_VERDICT marker required"));
    }

    let run_at = Utc::now().to_rfc3339();
    let record = store.update(|graph| {
        let record = spec_check_record(findings, graph.current_wave(), run_at);
        if critical > 0 {
            graph.gate_mut(record.wave).blocked = true;
        }
        graph.spec_check = Some(record.clone());
        Ok(record)
    })?;

    eprintln!(
        "Spec-check stored: wave={} critical={critical} verdict={}",
        record.wave, record.verdict
    );
    Ok(HookOutcome::Passthrough)
}

/// Record test evidence for a task from `TEST_PASSED:` / `TEST_EVIDENCE:` /
/// `NEW_TESTS_WRITTEN:` / `NEW_TEST_EVIDENCE:` lines.
#[instrument(skip_all, fields(task_id))]
pub fn store_test_evidence(ctx: &HookContext, stdin: &str, task_id: &str) -> Result<HookOutcome> {
    let store = match require_store(ctx) {
        Ok(store) => store,
        Err(outcome) => return Ok(outcome),
    };

    let capture = |re: &Regex| {
        re.captures(stdin)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default()
    };
    let tests = TestEvidence {
        passed: TEST_PASSED_RE.is_match(stdin),
        evidence: capture(&TEST_EVIDENCE_RE),
    };
    let new_tests = NewTestEvidence {
        written: NEW_TESTS_WRITTEN_RE.is_match(stdin),
        evidence: capture(&NEW_TEST_EVIDENCE_RE),
    };
    let (passed, written) = (tests.passed, new_tests.written);

    let recorded = store.update(|graph| {
        let Some(task) = graph.task(task_id) else {
            return Ok(None);
        };
        let implementation = Implementation {
            tests,
            new_tests,
            files_modified: task.files_modified.clone(),
        };
        Ok(Some(record_implementation(graph, task_id, implementation)))
    })?;
    let Some(wave_complete) = recorded else {
        return Ok(HookOutcome::error(format!(
            "Task {task_id} not found in task graph"
        )));
    };

    eprintln!("Test evidence stored for {task_id}: passed={passed} new_tests={written}");
    if let Some(wave) = wave_complete {
        eprintln!("\nWave {wave} implementation complete. Run: /wave-gate");
    }
    Ok(HookOutcome::Passthrough)
}

/// Report per-task test evidence for a wave without changing anything.
#[instrument(skip_all, fields(wave = ?wave))]
pub fn mark_tests_passed(ctx: &HookContext, wave: Option<u32>) -> Result<HookOutcome> {
    let store = match require_store(ctx) {
        Ok(store) => store,
        Err(outcome) => return Ok(outcome),
    };
    let graph = store.load()?;
    let wave = wave.unwrap_or_else(|| graph.current_wave());
    let tasks = graph.wave_tasks(wave);

    let missing: Vec<&str> = tasks
        .iter()
        .filter(|task| !task.tests_passed)
        .map(|task| task.id.as_str())
        .collect();
    let missing_new: Vec<&str> = tasks
        .iter()
        .filter(|task| task.requires_new_tests() && !task.new_tests_written)
        .map(|task| task.id.as_str())
        .collect();

    eprintln!(
        "Wave {wave} test evidence: {}/{total} passed, {}/{total} new-test OK",
        tasks.len() - missing.len(),
        tasks.len() - missing_new.len(),
        total = tasks.len()
    );
    for task in &tasks {
        let tests = if task.tests_passed { "PASS" } else { "MISSING" };
        let new = if !task.requires_new_tests() {
            "N/A".to_string()
        } else if task.new_tests_written {
            format!(
                "YES ({})",
                task.new_test_evidence.as_deref().unwrap_or_default()
            )
        } else {
            "MISSING".to_string()
        };
        eprintln!("  {}: tests={tests} new={new}", task.id);
    }

    if missing.is_empty() && missing_new.is_empty() {
        eprintln!("\nAll tasks have test evidence.");
        return Ok(HookOutcome::Passthrough);
    }

    let mut problems = Vec::new();
    if !missing.is_empty() {
        problems.push(format!("Missing test evidence: {}", missing.join(", ")));
    }
    if !missing_new.is_empty() {
        problems.push(format!(
            "Missing new-test evidence: {}",
            missing_new.join(", ")
        ));
    }
    Ok(HookOutcome::Error(problems.join("\n")))
}

/// Move the workflow to `phase`, optionally forgetting one phase's artifact
/// (used when looping back to architecture after plan alignment).
#[instrument(skip_all, fields(%phase))]
pub fn set_phase(
    ctx: &HookContext,
    phase: Phase,
    clear_artifact: Option<Phase>,
) -> Result<HookOutcome> {
    let store = match require_store(ctx) {
        Ok(store) => store,
        Err(outcome) => return Ok(outcome),
    };

    store
        .update(|graph| {
            graph.current_phase = phase;
            if let Some(cleared) = clear_artifact {
                graph.phase_artifacts.remove(cleared.as_str());
            }
            graph.touch();
            Ok(())
        })
        .with_context(|| format!("set-phase: failed to write state (phase={phase})"))?;

    eprintln!("Phase set to: {phase}");
    Ok(HookOutcome::Allow)
}

/// Delete the document, ending orchestration.
#[instrument(skip_all)]
pub fn cleanup_state(ctx: &HookContext) -> Result<HookOutcome> {
    let Some(store) = ctx.local_store() else {
        return Ok(HookOutcome::error("No active task graph found"));
    };
    store
        .remove()
        .context("cleanup-state: failed to remove state file")?;
    eprintln!("State file removed: {}", store.path().display());
    Ok(HookOutcome::Allow)
}

/// Print the task id named in stdin, if any.
pub fn extract_task_id(stdin: &str) -> Result<HookOutcome> {
    if let Some(id) = task_id::extract_task_id(stdin) {
        let mut out = std::io::stdout().lock();
        write!(out, "{id}").context("write task id")?;
        out.flush().context("flush stdout")?;
    }
    Ok(HookOutcome::Passthrough)
}
