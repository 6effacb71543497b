//! Shared deterministic types for engine core logic.

use crate::exit_codes;

/// Result of one hook invocation.
///
/// `Block` is an explicit denial, `Error` means the operation itself failed.
/// The calling assistant distinguishes them by exit code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    Allow,
    Block(String),
    Error(String),
    Passthrough,
}

impl HookOutcome {
    pub fn block(message: impl Into<String>) -> Self {
        HookOutcome::Block(message.into())
    }

    pub fn error(message: impl Into<String>) -> Self {
        HookOutcome::Error(message.into())
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            HookOutcome::Allow => exit_codes::ALLOW,
            HookOutcome::Passthrough => exit_codes::PASSTHROUGH,
            HookOutcome::Error(_) => exit_codes::ERROR,
            HookOutcome::Block(_) => exit_codes::BLOCK,
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            HookOutcome::Block(message) | HookOutcome::Error(message) => Some(message),
            HookOutcome::Allow | HookOutcome::Passthrough => None,
        }
    }

    pub fn is_block(&self) -> bool {
        matches!(self, HookOutcome::Block(_))
    }
}

/// Outcome of a single verification check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateCheck {
    pub passed: bool,
    pub message: String,
}

impl GateCheck {
    pub fn pass(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
        }
    }
}

/// Tagged parser result: the expected structured markers were either found or
/// absent. `Missing` is an evidence-capture failure, never a pass or a fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capture<T> {
    Found(T),
    Missing,
}

impl<T> Capture<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Capture::Found(value) => Some(value),
            Capture::Missing => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Capture::Missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_map_to_distinct_exit_codes() {
        assert_eq!(HookOutcome::Allow.exit_code(), 0);
        assert_eq!(HookOutcome::Passthrough.exit_code(), 0);
        assert_eq!(HookOutcome::error("x").exit_code(), 1);
        assert_eq!(HookOutcome::block("x").exit_code(), 2);
    }

    #[test]
    fn only_block_and_error_carry_messages() {
        assert_eq!(HookOutcome::block("denied").message(), Some("denied"));
        assert_eq!(HookOutcome::Allow.message(), None);
    }
}
