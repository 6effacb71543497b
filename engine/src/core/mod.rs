//! Deterministic, pure logic shared by the hook handlers.
//!
//! Core modules must be free of I/O side effects. Anything that needs the
//! filesystem (artifact discovery, side-file resolution) is passed in as a
//! trait object or closure so tests can substitute it.

pub mod agents;
pub mod evidence;
pub mod findings;
pub mod invariants;
pub mod phase;
pub mod scheduler;
pub mod task_id;
pub mod transcript;
pub mod types;
pub mod wave_gate;
