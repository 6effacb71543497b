//! Session start housekeeping.

use anyhow::Result;
use tracing::{debug, instrument};

use crate::hooks::{HookContext, HookOutcome};

/// Delete tracking files left behind by earlier sessions. Only files older
/// than the configured age go, so parallel sessions keep theirs.
#[instrument(skip_all)]
pub fn cleanup_stale_subagents(ctx: &HookContext) -> Result<HookOutcome> {
    let removed = ctx
        .subagents()
        .cleanup_stale(ctx.config.stale_subagent_age());
    debug!(removed, "session start cleanup");
    Ok(HookOutcome::Passthrough)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::context_in;

    #[test]
    fn recent_tracking_files_survive() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ctx = context_in(temp.path());
        ctx.subagents().mark_active("s1", "a1").expect("mark");

        let outcome = cleanup_stale_subagents(&ctx).expect("hook");
        assert_eq!(outcome, HookOutcome::Passthrough);
        assert!(ctx.config.subagent_dir.join("s1.active").exists());
    }
}
