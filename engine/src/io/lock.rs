//! Cross-process lock over atomic directory creation.
//!
//! `<name>.lock/` exists while held and contains a `pid` file naming the
//! holder. A holder that is provably dead is reclaimed on the first failed
//! attempt; a holder whose liveness cannot be determined never is.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::io::process::run_with_timeout;
use crate::io::store::StoreError;

/// Holder without a readable pid younger than this is assumed to be mid-acquire.
const PID_GRACE: Duration = Duration::from_secs(2);

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Observed state of a lock holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Dead,
    /// The probe was inconclusive (e.g. permission denied).
    Unknown,
}

/// Liveness check for a recorded process id.
pub trait LivenessProbe {
    fn probe(&self, pid: u32) -> Liveness;
}

/// `kill -0` against the live process table.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessProbe;

impl LivenessProbe for ProcessProbe {
    #[cfg(unix)]
    fn probe(&self, pid: u32) -> Liveness {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "kill -0 \"$1\"", "sh", &pid.to_string()]);
        match run_with_timeout(cmd, PROBE_TIMEOUT) {
            Ok(output) if output.success() => Liveness::Alive,
            Ok(output) if output.stderr_text().contains("No such process") => Liveness::Dead,
            Ok(output) => {
                debug!(pid, stderr = %output.stderr_text().trim(), "liveness probe inconclusive");
                Liveness::Unknown
            }
            Err(err) => {
                warn!(pid, err = %err, "liveness probe failed");
                Liveness::Unknown
            }
        }
    }

    #[cfg(not(unix))]
    fn probe(&self, pid: u32) -> Liveness {
        let _ = pid;
        Liveness::Unknown
    }
}

/// Acquires named locks with bounded, fixed-backoff retries.
#[derive(Clone)]
pub struct Locker {
    max_attempts: u32,
    retry: Duration,
    probe: Arc<dyn LivenessProbe + Send + Sync>,
}

impl std::fmt::Debug for Locker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Locker")
            .field("max_attempts", &self.max_attempts)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Default for Locker {
    fn default() -> Self {
        Self::new(50, Duration::from_millis(100))
    }
}

impl Locker {
    pub fn new(max_attempts: u32, retry: Duration) -> Self {
        Self {
            max_attempts,
            retry,
            probe: Arc::new(ProcessProbe),
        }
    }

    /// Replace the liveness probe (tests simulate dead or unobservable holders).
    pub fn with_probe(mut self, probe: impl LivenessProbe + Send + Sync + 'static) -> Self {
        self.probe = Arc::new(probe);
        self
    }

    /// Block until `<name>.lock` is created by this process.
    #[instrument(skip_all, fields(lock = %name.display()))]
    pub fn acquire(&self, name: &Path) -> Result<LockGuard> {
        let dir = lock_dir(name);
        if let Some(parent) = dir.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create lock parent {}", parent.display()))?;
        }

        for attempt in 0..self.max_attempts {
            match fs::create_dir(&dir) {
                Ok(()) => {
                    let guard = LockGuard { dir: dir.clone() };
                    fs::write(dir.join("pid"), std::process::id().to_string())
                        .with_context(|| format!("write lock owner {}", dir.display()))?;
                    debug!(attempt, "lock acquired");
                    return Ok(guard);
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if attempt == 0 && self.is_stale(&dir) {
                        match fs::remove_dir_all(&dir) {
                            Ok(()) => {
                                warn!(lock = %dir.display(), "removed stale lock");
                                continue;
                            }
                            Err(err) => warn!(err = %err, "failed to remove stale lock"),
                        }
                    }
                    thread::sleep(self.retry);
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("create lock {}", dir.display()));
                }
            }
        }

        Err(StoreError::LockTimeout {
            path: name.to_path_buf(),
            attempts: self.max_attempts,
        }
        .into())
    }

    /// Run `f` while holding the lock; released on every exit path.
    pub fn with_lock<T>(&self, name: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let _guard = self.acquire(name)?;
        f()
    }

    fn is_stale(&self, dir: &Path) -> bool {
        let recorded = fs::read_to_string(dir.join("pid"))
            .ok()
            .and_then(|raw| raw.trim().parse::<u32>().ok());
        match recorded {
            Some(pid) => self.probe.probe(pid) == Liveness::Dead,
            None => older_than(dir, PID_GRACE),
        }
    }
}

fn older_than(path: &Path, age: Duration) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|elapsed| elapsed > age)
}

/// `<name>.lock`
pub fn lock_dir(name: &Path) -> PathBuf {
    let mut dir = name.as_os_str().to_owned();
    dir.push(".lock");
    PathBuf::from(dir)
}

/// Held lock; the directory is removed on drop.
#[derive(Debug)]
pub struct LockGuard {
    dir: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.dir
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_dir_all(&self.dir)
            && err.kind() != ErrorKind::NotFound
        {
            warn!(lock = %self.dir.display(), err = %err, "failed to release lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use anyhow::anyhow;

    use super::*;

    struct Fixed(Liveness);

    impl LivenessProbe for Fixed {
        fn probe(&self, _pid: u32) -> Liveness {
            self.0
        }
    }

    fn plant_lock(name: &Path, pid: &str) {
        let dir = lock_dir(name);
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("pid"), pid).expect("pid");
    }

    #[test]
    fn guard_releases_on_drop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let name = temp.path().join(".task_graph");
        let locker = Locker::new(3, Duration::from_millis(1));
        {
            let guard = locker.acquire(&name).expect("acquire");
            assert!(guard.path().join("pid").exists());
        }
        assert!(!lock_dir(&name).exists());
    }

    #[test]
    fn with_lock_releases_after_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let name = temp.path().join("state");
        let locker = Locker::new(3, Duration::from_millis(1));
        let result: Result<()> = locker.with_lock(&name, || Err(anyhow!("boom")));
        assert!(result.is_err());
        assert!(!lock_dir(&name).exists());
    }

    #[test]
    fn dead_holder_is_reclaimed_without_backoff() {
        let temp = tempfile::tempdir().expect("tempdir");
        let name = temp.path().join("state");
        plant_lock(&name, "999999");
        let locker = Locker::new(5, Duration::from_secs(10)).with_probe(Fixed(Liveness::Dead));

        let started = Instant::now();
        let _guard = locker.acquire(&name).expect("acquire");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn unobservable_holder_is_never_reclaimed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let name = temp.path().join("state");
        plant_lock(&name, "1");
        let locker = Locker::new(3, Duration::from_millis(1)).with_probe(Fixed(Liveness::Unknown));

        let err = locker.acquire(&name).expect_err("timeout");
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::LockTimeout { attempts: 3, .. })
        ));
        assert!(lock_dir(&name).join("pid").exists());
    }

    #[test]
    fn fresh_lock_without_pid_is_not_stale() {
        let temp = tempfile::tempdir().expect("tempdir");
        let name = temp.path().join("state");
        fs::create_dir_all(lock_dir(&name)).expect("mkdir");
        let locker = Locker::new(2, Duration::from_millis(1)).with_probe(Fixed(Liveness::Dead));
        assert!(locker.acquire(&name).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn process_probe_sees_current_process() {
        assert_eq!(ProcessProbe.probe(std::process::id()), Liveness::Alive);
    }
}
