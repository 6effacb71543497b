//! Agent roles known to the orchestration workflow.

use crate::graph::Phase;

/// Phase agents and the phase each one drives.
pub const PHASE_AGENTS: [(&str, Phase); 6] = [
    ("brainstorm-agent", Phase::Brainstorm),
    ("specify-agent", Phase::Specify),
    ("clarify-agent", Phase::Clarify),
    ("architecture-agent", Phase::Architecture),
    ("plan-alignment-agent", Phase::PlanAlignment),
    ("decompose-agent", Phase::Decompose),
];

/// Implementation agents; all of them run in the execute phase.
pub const IMPL_AGENTS: [&str; 6] = [
    "code-implementer-agent",
    "ts-test-agent",
    "frontend-agent",
    "security-agent",
    "dotfiles-agent",
    "general-purpose",
];

/// Always allowed through phase validation.
pub const UTILITY_AGENTS: [&str; 3] = ["Explore", "Plan", "haiku"];

/// Review sub-agents that produce per-task findings.
pub const REVIEW_SUB_AGENTS: [&str; 6] = [
    "code-reviewer",
    "silent-failure-hunter",
    "pr-test-analyzer",
    "type-design-analyzer",
    "comment-analyzer",
    "code-simplifier",
];

pub const SPEC_CHECK_INVOKER: &str = "spec-check-invoker";

/// How a completed subagent is routed by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentCategory {
    Phase(Phase),
    Impl,
    Review,
    SpecCheck,
    Unknown,
}

/// Drop a plugin namespace prefix: `loom:brainstorm-agent` -> `brainstorm-agent`.
pub fn strip_namespace(agent_type: &str) -> &str {
    match agent_type.split_once(':') {
        Some((_, bare)) => bare,
        None => agent_type,
    }
}

pub fn phase_for_agent(agent: &str) -> Option<Phase> {
    PHASE_AGENTS
        .iter()
        .find(|(name, _)| *name == agent)
        .map(|(_, phase)| *phase)
}

pub fn is_impl_agent(agent: &str) -> bool {
    IMPL_AGENTS.contains(&agent)
}

pub fn is_utility_agent(agent: &str) -> bool {
    UTILITY_AGENTS.contains(&agent)
}

pub fn is_review_sub_agent(agent: &str) -> bool {
    REVIEW_SUB_AGENTS.contains(&agent)
}

/// Review sub-agents plus the spec-check invoker.
pub fn is_review_agent(agent: &str) -> bool {
    is_review_sub_agent(agent) || agent == SPEC_CHECK_INVOKER
}

/// Agents a decomposed task may be assigned to.
pub fn is_known_agent(agent: &str) -> bool {
    is_impl_agent(agent) || phase_for_agent(agent).is_some()
}

/// Categorize a bare (namespace-stripped) agent type.
pub fn categorize(agent: &str) -> AgentCategory {
    if let Some(phase) = phase_for_agent(agent) {
        return AgentCategory::Phase(phase);
    }
    if is_impl_agent(agent) {
        return AgentCategory::Impl;
    }
    if agent == SPEC_CHECK_INVOKER {
        return AgentCategory::SpecCheck;
    }
    if is_review_sub_agent(agent) {
        return AgentCategory::Review;
    }
    AgentCategory::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_namespace_keeps_text_after_first_colon() {
        assert_eq!(strip_namespace("loom:brainstorm-agent"), "brainstorm-agent");
        assert_eq!(strip_namespace("brainstorm-agent"), "brainstorm-agent");
        assert_eq!(strip_namespace("a:b:c"), "b:c");
    }

    #[test]
    fn categorize_routes_each_role() {
        assert_eq!(
            categorize("plan-alignment-agent"),
            AgentCategory::Phase(Phase::PlanAlignment)
        );
        assert_eq!(categorize("general-purpose"), AgentCategory::Impl);
        assert_eq!(categorize("code-reviewer"), AgentCategory::Review);
        assert_eq!(categorize("spec-check-invoker"), AgentCategory::SpecCheck);
        assert_eq!(categorize("Explore"), AgentCategory::Unknown);
    }

    #[test]
    fn known_agents_cover_impl_and_phase_agents_only() {
        assert!(is_known_agent("decompose-agent"));
        assert!(is_known_agent("frontend-agent"));
        assert!(!is_known_agent("code-reviewer"));
        assert!(!is_known_agent("haiku"));
    }
}
