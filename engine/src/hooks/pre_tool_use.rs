//! Checks run before the assistant spawns a subagent.

use anyhow::Result;
use tracing::{debug, instrument, warn};

use crate::core::agents::{is_utility_agent, strip_namespace};
use crate::core::phase::{detect_phase, validate_phase_request};
use crate::core::scheduler::{check_task_execution, record_execution_start};
use crate::core::task_id::{extract_task_id, is_canonical_format};
use crate::hooks::{HookContext, HookOutcome, TASK_TOOL, ToolUseInput, parse_input};
use crate::io::git::Repository;

fn unrecognized_agent(requested: &str) -> String {
    [
        "BLOCKED: Unrecognized agent type during loom orchestration.",
        "",
        &format!("Agent: {requested}"),
        "",
        "Use a recognized phase agent:",
        "  brainstorm-agent, specify-agent, clarify-agent, architecture-agent,",
        "  plan-alignment-agent, decompose-agent, code-implementer-agent, etc.",
    ]
    .join("\n")
}

/// Enforce phase order and artifact prerequisites for phase agents.
#[instrument(skip_all)]
pub fn validate_phase_order(ctx: &HookContext, stdin: &str) -> Result<HookOutcome> {
    let Some(store) = ctx.local_store() else {
        return Ok(HookOutcome::Allow);
    };
    let input: ToolUseInput = parse_input(stdin)?;
    if input.tool_name != TASK_TOOL {
        return Ok(HookOutcome::Allow);
    }

    let requested = input.input_str("subagent_type");
    let agent = strip_namespace(requested);
    if is_utility_agent(agent) {
        return Ok(HookOutcome::Allow);
    }
    let Some(target) = detect_phase(agent, input.input_str("prompt")) else {
        return Ok(HookOutcome::block(unrecognized_agent(requested)));
    };

    let graph = store.load()?;
    debug!(agent, %target, current = %graph.current_phase, "phase request");
    let probe = ctx.artifacts_for(&store);
    Ok(
        match validate_phase_request(&graph, target, &probe, &ctx.phase_settings()) {
            Ok(()) => HookOutcome::Allow,
            Err(message) => HookOutcome::Block(message),
        },
    )
}

/// Enforce wave order, dependencies and the previous wave's gate for planned
/// tasks. An allowed task is recorded as executing with its baseline commit.
#[instrument(skip_all)]
pub fn validate_task_execution<R: Repository>(
    ctx: &HookContext,
    stdin: &str,
    repo: &R,
) -> Result<HookOutcome> {
    let Some(store) = ctx.local_store() else {
        return Ok(HookOutcome::Allow);
    };
    let input: ToolUseInput = parse_input(stdin)?;
    if input.tool_name != TASK_TOOL {
        return Ok(HookOutcome::Allow);
    }

    let prompt = input.input_str("prompt");
    let Some(task_id) =
        extract_task_id(prompt).or_else(|| extract_task_id(input.input_str("description")))
    else {
        return Ok(HookOutcome::Allow);
    };

    let graph = store.load()?;
    if graph.task(&task_id).is_none() {
        debug!(task_id, "task not in graph");
        return Ok(HookOutcome::Allow);
    }
    if !is_canonical_format(prompt) {
        warn!(
            task_id,
            "planned task prompt lacks the **Task ID:** form, id found by fallback pattern"
        );
    }
    if let Err(message) = check_task_execution(&graph, &task_id) {
        return Ok(HookOutcome::Block(message));
    }

    let start_sha = if repo.is_repo() { repo.head_sha() } else { None };
    store.update(|graph| {
        record_execution_start(graph, &task_id, start_sha.as_deref());
        Ok(())
    })?;
    debug!(task_id, start_sha = ?start_sha, "task execution recorded");
    Ok(HookOutcome::Allow)
}
