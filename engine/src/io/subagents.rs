//! Per-session subagent tracking files.
//!
//! `<dir>/<session>.active` lists running agent ids, one per line.
//! `<dir>/<session>.task_graph` holds the absolute document path so stop hooks
//! running in another checkout still find the orchestrator's state.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::io::lock::Locker;

#[derive(Debug, Clone)]
pub struct SubagentTracker {
    dir: PathBuf,
    locker: Locker,
}

impl SubagentTracker {
    pub fn new(dir: impl Into<PathBuf>, locker: Locker) -> Self {
        Self {
            dir: dir.into(),
            locker,
        }
    }

    fn active_file(&self, session: &str) -> PathBuf {
        self.dir.join(format!("{session}.active"))
    }

    fn graph_file(&self, session: &str) -> PathBuf {
        self.dir.join(format!("{session}.task_graph"))
    }

    fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create subagent dir {}", self.dir.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(err) = fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700)) {
                debug!(err = %err, "could not restrict subagent dir");
            }
        }
        Ok(())
    }

    /// Append `agent_id` to the session's active list.
    pub fn mark_active(&self, session: &str, agent_id: &str) -> Result<()> {
        self.ensure_dir()?;
        let path = self.active_file(session);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        writeln!(file, "{agent_id}").with_context(|| format!("append {}", path.display()))
    }

    /// Record the session's document path unless one is already recorded.
    pub fn record_task_graph(&self, session: &str, graph_path: &Path) -> Result<()> {
        self.ensure_dir()?;
        let path = self.graph_file(session);
        if path.exists() {
            return Ok(());
        }
        let absolute = std::path::absolute(graph_path)
            .with_context(|| format!("absolutize {}", graph_path.display()))?;
        fs::write(&path, absolute.display().to_string())
            .with_context(|| format!("write {}", path.display()))
    }

    /// Document path recorded for `session`, if it still exists.
    pub fn task_graph_for(&self, session: &str) -> Option<PathBuf> {
        if session.is_empty() {
            return None;
        }
        let recorded = fs::read_to_string(self.graph_file(session)).ok()?;
        let path = PathBuf::from(recorded.trim());
        path.is_file().then_some(path)
    }

    /// Drop `agent_id` from the active list; the file goes away once empty.
    pub fn remove_agent(&self, session: &str, agent_id: &str) -> Result<()> {
        let path = self.active_file(session);
        if !path.exists() {
            return Ok(());
        }
        let lock = self.dir.join(format!("{session}.cleanup"));
        self.locker.with_lock(&lock, || {
            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
                Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
            };
            let remaining: Vec<&str> = content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && *line != agent_id)
                .collect();
            if remaining.is_empty() {
                fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))
            } else {
                fs::write(&path, remaining.join("\n") + "\n")
                    .with_context(|| format!("write {}", path.display()))
            }
        })
    }

    /// Delete tracking files last modified more than `max_age` ago. Returns how
    /// many were removed.
    pub fn cleanup_stale(&self, max_age: Duration) -> usize {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return 0;
        };
        let Some(cutoff) = SystemTime::now().checked_sub(max_age) else {
            return 0;
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let stale = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .is_ok_and(|modified| modified < cutoff);
            if !stale {
                continue;
            }
            match fs::remove_file(&path).or_else(|_| fs::remove_dir_all(&path)) {
                Ok(()) => removed += 1,
                Err(err) => warn!(path = %path.display(), err = %err, "failed to remove stale entry"),
            }
        }
        debug!(removed, "stale subagent files cleaned");
        removed
    }
}
