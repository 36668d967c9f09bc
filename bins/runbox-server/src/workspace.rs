/// Workspace Manager - Scratch Directory Ownership
///
/// **Core Responsibility:**
/// Hand out collision-free file namespaces for execution jobs and guarantee
/// every on-disk artifact is removed when the job is done, on every exit
/// path.
///
/// The cleanup invariant lives in exactly one place: the `Drop` impl of
/// `Workspace`. Runners never delete files themselves.
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use tracing::warn;

pub struct WorkspaceManager {
    scratch_dir: PathBuf,
    next_id: AtomicU64,
}

impl WorkspaceManager {
    /// Create a manager rooted at `scratch_dir`, creating the directory if
    /// it does not exist.
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Result<Self> {
        let scratch_dir = scratch_dir.into();
        std::fs::create_dir_all(&scratch_dir).with_context(|| {
            format!(
                "Failed to create scratch directory {}",
                scratch_dir.display()
            )
        })?;
        Ok(Self {
            scratch_dir,
            next_id: AtomicU64::new(1),
        })
    }

    /// Allocate a fresh workspace. The token combines a monotonic counter
    /// with a random suffix, so concurrent jobs never collide within the
    /// scratch namespace.
    pub fn allocate(&self) -> Workspace {
        let seq = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = format!("job-{}-{}", seq, uuid::Uuid::new_v4().simple());
        Workspace {
            token,
            scratch_dir: self.scratch_dir.clone(),
            paths: Vec::new(),
        }
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }
}

/// RAII guard over one job's file set. Every path derived from the token is
/// registered here and removed when the guard drops, regardless of which
/// branch the job took. Removal is best-effort: failures are logged, never
/// escalated.
pub struct Workspace {
    token: String,
    scratch_dir: PathBuf,
    paths: Vec<PathBuf>,
}

impl Workspace {
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Path for a token-scoped file, e.g. `path_for("py")` ->
    /// `{scratch}/job-3-<rand>.py`. The path is registered for cleanup
    /// whether or not the caller ends up creating it.
    pub fn path_for(&mut self, suffix: &str) -> PathBuf {
        let path = self.scratch_dir.join(format!("{}.{}", self.token, suffix));
        self.paths.push(path.clone());
        path
    }

    /// Token-scoped subdirectory, created eagerly. Used by VM languages
    /// that emit per-job build artifacts next to the source.
    pub fn dir_for(&mut self, suffix: &str) -> Result<PathBuf> {
        let path = self.scratch_dir.join(format!("{}-{}", self.token, suffix));
        std::fs::create_dir_all(&path)
            .with_context(|| format!("Failed to create job directory {}", path.display()))?;
        self.paths.push(path.clone());
        Ok(path)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        for path in &self.paths {
            let result = if path.is_dir() {
                std::fs::remove_dir_all(path)
            } else {
                std::fs::remove_file(path)
            };
            if let Err(e) = result {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(
                        token = %self.token,
                        path = %path.display(),
                        error = %e,
                        "Failed to remove workspace file"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_tokens_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path()).unwrap();
        let tokens: HashSet<String> = (0..100)
            .map(|_| manager.allocate().token().to_string())
            .collect();
        assert_eq!(tokens.len(), 100);
    }

    #[test]
    fn test_drop_removes_files_and_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path()).unwrap();

        let (source, input, job_dir) = {
            let mut ws = manager.allocate();
            let source = ws.path_for("py");
            let input = ws.path_for("in");
            std::fs::write(&source, "print(42)").unwrap();
            std::fs::write(&input, "").unwrap();
            let job_dir = ws.dir_for("classes").unwrap();
            std::fs::write(job_dir.join("Main.class"), "bytecode").unwrap();
            (source, input, job_dir)
        };

        assert!(!source.exists());
        assert!(!input.exists());
        assert!(!job_dir.exists());
    }

    #[test]
    fn test_drop_tolerates_never_created_paths() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path()).unwrap();
        let mut ws = manager.allocate();
        // Registered but never written - drop must not panic
        let _ = ws.path_for("out");
        drop(ws);
    }

    #[test]
    fn test_scratch_dir_created_if_absent() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/scratch");
        let manager = WorkspaceManager::new(&nested).unwrap();
        assert!(nested.is_dir());
        assert_eq!(manager.scratch_dir(), nested.as_path());
    }
}
