//! Orchestration state engine for phased, wave-scheduled agent workflows.
//!
//! The engine is invoked by an external coding assistant at lifecycle
//! checkpoints (before a tool runs, when a subagent starts or stops, at session
//! start). Every invocation loads the persisted task graph, decides, and writes
//! back under a cross-process lock. The architecture keeps a strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (transcript parsing, evidence
//!   classification, phase machine, wave gates). No I/O.
//! - **[`io`]**: Side effects (lock, state store, git, transcripts on disk).
//!
//! [`hooks`] composes the two into one handler per lifecycle event, and
//! [`validate`] checks decompose output before it becomes a task graph.

pub mod core;
pub mod exit_codes;
pub mod graph;
pub mod hooks;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validate;
