//! Side effects: the lock, the state store, and everything else that touches
//! the filesystem or spawns processes.

pub mod artifacts;
pub mod config;
pub mod git;
pub mod lock;
pub mod process;
pub mod store;
pub mod subagents;
pub mod transcript;
