//! Subagent start: remember which agents are running and where the
//! orchestrator's document lives.

use anyhow::Result;
use tracing::{debug, instrument};

use crate::hooks::{HookContext, HookOutcome, SubagentInput, parse_input};

/// Track the starting agent and map its session to the local document, so
/// the stop hook finds it even when the subagent works in another checkout.
#[instrument(skip_all)]
pub fn mark_subagent_active(ctx: &HookContext, stdin: &str) -> Result<HookOutcome> {
    let input: SubagentInput = parse_input(stdin)?;
    let Some(session) = input.session() else {
        return Ok(HookOutcome::Passthrough);
    };

    let tracker = ctx.subagents();
    if let Some(agent_id) = input.agent_id() {
        tracker.mark_active(session, agent_id)?;
        debug!(session, agent_id, "subagent active");
    }
    if let Some(graph) = ctx.local_graph() {
        tracker.record_task_graph(session, &graph)?;
    }
    Ok(HookOutcome::Passthrough)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::json;

    use super::*;
    use crate::graph::{Phase, TaskGraph};
    use crate::test_support::context_in;

    #[test]
    fn records_agent_and_document_mapping() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context_in(temp.path());
        ctx.store(ctx.graph_path())
            .create(&TaskGraph::new(Phase::Init))
            .expect("create");

        let payload = json!({"session_id": "s1", "agent_id": "a1"}).to_string();
        let outcome = mark_subagent_active(&ctx, &payload).expect("hook");
        assert_eq!(outcome, HookOutcome::Passthrough);

        let active = fs::read_to_string(ctx.config.subagent_dir.join("s1.active")).expect("read");
        assert_eq!(active, "a1\n");
        assert_eq!(ctx.resolve_graph(Some("s1")), Some(ctx.graph_path()));
    }

    #[test]
    fn without_document_only_tracks_agent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context_in(temp.path());
        let payload = json!({"session_id": "s1", "agent_id": "a1"}).to_string();
        mark_subagent_active(&ctx, &payload).expect("hook");
        assert!(!ctx.config.subagent_dir.join("s1.task_graph").exists());
        assert!(ctx.config.subagent_dir.join("s1.active").exists());
    }
}
