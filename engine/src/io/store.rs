//! Task-graph document on disk: read-only at rest, mutated only through locked
//! reload/transform/write cycles.
//!
//! Each cycle is lock, make writable, reload, transform, write `<path>.tmp`,
//! rename over the document, then restore read-only. The restore runs on every
//! path, including a failed transform or write.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::graph::TaskGraph;
use crate::io::lock::Locker;

/// Fatal store failures callers may want to match on.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("corrupt state file {}: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },
    #[error("could not acquire lock after {attempts} attempts: {}", .path.display())]
    LockTimeout { path: PathBuf, attempts: u32 },
}

/// Handle to one task-graph document.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    locker: Locker,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>, locker: Locker) -> Self {
        Self {
            path: path.into(),
            locker,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Lock name shared by every writer of this document: `<dir>/.task_graph`.
    fn lock_name(&self) -> PathBuf {
        self.path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(".task_graph")
    }

    fn corrupt(&self, reason: impl Into<String>) -> anyhow::Error {
        StoreError::Corrupt {
            path: self.path.clone(),
            reason: reason.into(),
        }
        .into()
    }

    /// Read and parse the document. Structural damage is corruption, not absence.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn load(&self) -> Result<TaskGraph> {
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("read state {}", self.path.display()))?;
        let value: Value = serde_json::from_str(&raw)
            .map_err(|err| self.corrupt(format!("invalid JSON: {err}")))?;
        let Some(object) = value.as_object() else {
            return Err(self.corrupt("not an object"));
        };
        for field in ["current_phase", "phase_artifacts"] {
            if !object.contains_key(field) {
                return Err(self.corrupt(format!("missing {field}")));
            }
        }
        let graph: TaskGraph =
            serde_json::from_value(value).map_err(|err| self.corrupt(err.to_string()))?;
        debug!(phase = %graph.current_phase, tasks = graph.tasks.len(), "state loaded");
        Ok(graph)
    }

    /// Apply `transform` to the latest on-disk document under the lock.
    ///
    /// An `Err` from `transform` leaves the document untouched. A transform that
    /// changes nothing skips the write.
    pub fn update<T>(&self, transform: impl FnOnce(&mut TaskGraph) -> Result<T>) -> Result<T> {
        self.write_cycle(|| {
            let current = self.load()?;
            let mut next = current.clone();
            let out = transform(&mut next)?;
            let changed = next != current;
            Ok((changed.then_some(next), out))
        })
    }

    /// Overwrite the document wholesale.
    pub fn replace(&self, graph: &TaskGraph) -> Result<()> {
        self.write_cycle(|| Ok((Some(graph.clone()), ())))
    }

    /// Write a new document, overwriting any existing one.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn create(&self, graph: &TaskGraph) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create state dir {}", parent.display()))?;
        }
        self.locker.with_lock(&self.lock_name(), || {
            if self.exists() {
                set_writable(&self.path, true)?;
            }
            let written = write_document(&self.path, graph);
            let restore = if self.exists() {
                set_writable(&self.path, false)
            } else {
                Ok(())
            };
            written.and(restore)
        })
    }

    /// Delete the document, ending orchestration.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn remove(&self) -> Result<()> {
        self.locker.with_lock(&self.lock_name(), || {
            set_writable(&self.path, true)?;
            fs::remove_file(&self.path)
                .with_context(|| format!("remove state {}", self.path.display()))
        })
    }

    #[instrument(skip_all, fields(path = %self.path.display()))]
    fn write_cycle<T>(
        &self,
        produce: impl FnOnce() -> Result<(Option<TaskGraph>, T)>,
    ) -> Result<T> {
        self.locker.with_lock(&self.lock_name(), || {
            set_writable(&self.path, true)?;
            let result = produce().and_then(|(next, out)| {
                match next {
                    Some(graph) => write_document(&self.path, &graph)?,
                    None => debug!("state unchanged, skipping write"),
                }
                Ok(out)
            });
            let restore = set_writable(&self.path, false);
            match (result, restore) {
                (Ok(out), Ok(())) => Ok(out),
                (Err(err), Ok(())) => Err(err),
                (Err(err), Err(restore_err)) => {
                    warn!(err = %restore_err, "failed to restore read-only mode");
                    Err(err)
                }
                (Ok(_), Err(restore_err)) => Err(restore_err),
            }
        })
    }
}

fn write_document(path: &Path, graph: &TaskGraph) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(graph).context("serialize state")?;
    buf.push('\n');

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let written = fs::write(&tmp, buf)
        .with_context(|| format!("write temp state {}", tmp.display()))
        .and_then(|()| {
            fs::rename(&tmp, path).with_context(|| format!("rename temp state {}", tmp.display()))
        });
    if written.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    written
}

#[cfg(unix)]
fn set_writable(path: &Path, writable: bool) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mode = if writable { 0o644 } else { 0o444 };
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("chmod {mode:o} {}", path.display()))
}

#[cfg(not(unix))]
fn set_writable(path: &Path, writable: bool) -> Result<()> {
    let mut perms = fs::metadata(path)
        .with_context(|| format!("stat {}", path.display()))?
        .permissions();
    perms.set_readonly(!writable);
    fs::set_permissions(path, perms).with_context(|| format!("set permissions {}", path.display()))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::anyhow;

    use super::*;
    use crate::graph::{Phase, Task};

    fn store_in(dir: &Path) -> StateStore {
        StateStore::new(
            dir.join("state/active_task_graph.json"),
            Locker::new(5, Duration::from_millis(1)),
        )
    }

    #[test]
    fn create_then_load() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(temp.path());
        store.create(&TaskGraph::new(Phase::Specify)).expect("create");
        assert_eq!(store.load().expect("load").current_phase, Phase::Specify);
        assert!(fs::metadata(store.path()).expect("meta").permissions().readonly());
    }

    #[test]
    fn update_rereads_and_writes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(temp.path());
        store.create(&TaskGraph::new(Phase::Execute)).expect("create");

        let count = store
            .update(|graph| {
                graph.tasks.push(Task::new("T1", 1));
                Ok(graph.tasks.len())
            })
            .expect("update");
        assert_eq!(count, 1);
        assert_eq!(store.load().expect("load").tasks.len(), 1);
        assert!(!PathBuf::from(format!("{}.tmp", store.path().display())).exists());
    }

    #[test]
    fn failed_transform_keeps_document_and_protection() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(temp.path());
        store.create(&TaskGraph::new(Phase::Init)).expect("create");
        let before = fs::read_to_string(store.path()).expect("read");

        let result: Result<()> = store.update(|graph| {
            graph.current_phase = Phase::Execute;
            Err(anyhow!("transform failed"))
        });

        assert!(result.is_err());
        assert_eq!(fs::read_to_string(store.path()).expect("read"), before);
        assert!(fs::metadata(store.path()).expect("meta").permissions().readonly());
    }

    #[test]
    fn missing_core_field_is_corruption() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(temp.path());
        fs::create_dir_all(store.path().parent().expect("parent")).expect("mkdir");
        fs::write(store.path(), r#"{"current_phase":"init"}"#).expect("write");

        let err = store.load().expect_err("corrupt");
        let Some(StoreError::Corrupt { reason, .. }) = err.downcast_ref::<StoreError>() else {
            panic!("expected corruption, got {err:#}");
        };
        assert_eq!(reason, "missing phase_artifacts");
    }

    #[test]
    fn non_object_and_invalid_json_are_corruption() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(temp.path());
        fs::create_dir_all(store.path().parent().expect("parent")).expect("mkdir");
        for raw in ["[1,2]", "{not json"] {
            fs::write(store.path(), raw).expect("write");
            let err = store.load().expect_err("corrupt");
            assert!(err.downcast_ref::<StoreError>().is_some(), "{err:#}");
        }
    }

    #[test]
    fn remove_deletes_read_only_document() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(temp.path());
        store.create(&TaskGraph::new(Phase::Init)).expect("create");
        store.remove().expect("remove");
        assert!(!store.exists());
    }
}
