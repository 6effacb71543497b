//! Git adapter for baseline capture and new-test diffs.
//!
//! Git failures never fail a hook: callers get `None` or an empty diff and a
//! `warn!` is emitted.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::io::process::{CommandOutput, run_with_timeout};

/// Repository queries used by the hooks.
pub trait Repository {
    fn is_repo(&self) -> bool;
    /// Current HEAD commit, if any.
    fn head_sha(&self) -> Option<String>;
    /// Diff covering `files` (tracked unstaged, staged, and untracked). Falls
    /// back to `start_sha..HEAD` or the merge base with the default branch when
    /// the files produce nothing.
    fn collect_diff(&self, files: &[String], start_sha: Option<&str>) -> String;
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    timeout: Duration,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            workdir: workdir.into(),
            timeout,
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Repository root, if `workdir` is inside one.
    pub fn toplevel(&self) -> Option<PathBuf> {
        self.run_capture(&["rev-parse", "--show-toplevel"])
            .map(|out| PathBuf::from(out.trim()))
            .filter(|path| !path.as_os_str().is_empty())
    }

    pub fn is_tracked(&self, file: &str) -> bool {
        self.run(&["ls-files", "--error-unmatch", file])
            .is_ok_and(|out| out.success())
    }

    /// Branch `origin/HEAD` points at; `main` when unknown.
    pub fn default_branch(&self) -> String {
        self.run_capture(&["symbolic-ref", "refs/remotes/origin/HEAD"])
            .and_then(|out| {
                out.trim()
                    .strip_prefix("refs/remotes/origin/")
                    .map(str::to_string)
            })
            .filter(|branch| !branch.is_empty())
            .unwrap_or_else(|| "main".to_string())
    }

    pub fn merge_base(&self, branch: &str) -> Option<String> {
        let remote = format!("origin/{branch}");
        self.run_capture(&["merge-base", "HEAD", &remote])
            .map(|out| out.trim().to_string())
            .filter(|sha| !sha.is_empty())
    }

    fn diff(&self, args: &[&str]) -> String {
        let mut full = vec!["diff"];
        full.extend_from_slice(args);
        self.run_capture(&full).unwrap_or_default()
    }

    /// New-file diff for an untracked path. `--no-index` exits 1 when the
    /// inputs differ, which is always the case here.
    fn diff_untracked(&self, file: &str) -> String {
        match self.run(&["diff", "--no-index", "/dev/null", file]) {
            Ok(out) if out.status.code() == Some(1) || out.success() => out.stdout_text(),
            Ok(out) => {
                warn!(file, stderr = %out.stderr_text().trim(), "untracked diff failed");
                String::new()
            }
            Err(err) => {
                warn!(file, err = %err, "untracked diff failed");
                String::new()
            }
        }
    }

    fn run_capture(&self, args: &[&str]) -> Option<String> {
        match self.run_checked(args) {
            Ok(out) => Some(out.stdout_text()),
            Err(err) => {
                debug!(err = %err, "git command failed");
                None
            }
        }
    }

    fn run_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = self.run(args)?;
        if !output.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                output.stderr_text().trim()
            ));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        run_with_timeout(cmd, self.timeout)
    }
}

impl Repository for Git {
    fn is_repo(&self) -> bool {
        self.run(&["rev-parse", "--git-dir"])
            .is_ok_and(|out| out.success())
    }

    fn head_sha(&self) -> Option<String> {
        self.run_capture(&["rev-parse", "HEAD"])
            .map(|out| out.trim().to_string())
            .filter(|sha| !sha.is_empty())
    }

    #[instrument(skip_all, fields(files = files.len(), start_sha = ?start_sha))]
    fn collect_diff(&self, files: &[String], start_sha: Option<&str>) -> String {
        if !files.is_empty() {
            let (tracked, untracked): (Vec<&str>, Vec<&str>) = files
                .iter()
                .map(String::as_str)
                .partition(|file| self.is_tracked(file));

            let mut parts = Vec::new();
            if !tracked.is_empty() {
                let mut unstaged = vec!["--"];
                unstaged.extend(&tracked);
                parts.push(self.diff(&unstaged));
                let mut staged = vec!["--cached", "--"];
                staged.extend(&tracked);
                parts.push(self.diff(&staged));
            }
            parts.extend(
                untracked
                    .iter()
                    .filter(|file| self.workdir.join(file).exists())
                    .map(|file| self.diff_untracked(file)),
            );

            let combined = parts.join("\n");
            if !combined.trim().is_empty() {
                return combined;
            }
        }

        let committed = match start_sha {
            Some(sha) => self.diff(&[sha, "HEAD"]),
            None => {
                let branch = self.default_branch();
                match self.merge_base(&branch) {
                    Some(base) => self.diff(&[base.as_str(), "HEAD"]),
                    None => self.diff(&["HEAD~1", "HEAD"]),
                }
            }
        };
        [committed, self.diff(&[]), self.diff(&["--cached"])].join("\n")
    }
}
