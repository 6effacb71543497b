//! Filesystem-backed artifact discovery for the phase rules.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;

use crate::core::phase::{ArtifactProbe, CLARIFY_MARKER};

/// Resolves workflow documents relative to the project root.
#[derive(Debug, Clone)]
pub struct FsArtifacts {
    root: PathBuf,
}

impl FsArtifacts {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

impl ArtifactProbe for FsArtifacts {
    fn exists(&self, path: &str) -> bool {
        self.resolve(path).exists()
    }

    fn find_file(&self, dir: &str, name: &str) -> Option<String> {
        let base = self.resolve(dir);
        find_under(&base, name).map(|found| {
            // Report paths in the same form they were asked for.
            match found.strip_prefix(&self.root) {
                Ok(relative) if Path::new(dir).is_relative() => relative.display().to_string(),
                _ => found.display().to_string(),
            }
        })
    }

    fn count_markers(&self, path: &str) -> Result<usize> {
        let full = self.resolve(path);
        let content = fs::read_to_string(&full)
            .with_context(|| format!("read {}", full.display()))?;
        Ok(content.matches(CLARIFY_MARKER).count())
    }
}

/// Depth-first search for a file named `name`; entries are visited in name
/// order so results are stable.
fn find_under(dir: &Path, name: &str) -> Option<PathBuf> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            if err.kind() != ErrorKind::NotFound {
                warn!(dir = %dir.display(), err = %err, "find_file failed");
            }
            return None;
        }
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .collect();
    paths.sort();

    for path in &paths {
        if path.is_file() && path.file_name().is_some_and(|file| file == name) {
            return Some(path.clone());
        }
    }
    paths
        .iter()
        .filter(|path| path.is_dir())
        .find_map(|path| find_under(path, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_nested_file_relative_to_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        let nested = temp.path().join(".claude/specs/auth");
        fs::create_dir_all(&nested).expect("mkdir");
        fs::write(nested.join("brainstorm.md"), "ideas").expect("write");

        let probe = FsArtifacts::new(temp.path());
        assert_eq!(
            probe.find_file(".claude/specs", "brainstorm.md").as_deref(),
            Some(".claude/specs/auth/brainstorm.md")
        );
        assert_eq!(probe.find_file(".claude/specs", "spec.md"), None);
        assert_eq!(probe.find_file(".claude/missing", "spec.md"), None);
    }

    #[test]
    fn counts_clarification_markers() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(
            temp.path().join("spec.md"),
            "[NEEDS CLARIFICATION] a\nok\n[NEEDS CLARIFICATION] b\n",
        )
        .expect("write");
        let probe = FsArtifacts::new(temp.path());
        assert_eq!(probe.count_markers("spec.md").expect("count"), 2);
        assert!(probe.count_markers("absent.md").is_err());
        assert!(probe.exists("spec.md"));
    }
}
