//! Git capability provider
//!
//! The orchestrator never touches git objects itself. It asks a
//! [`GitProvider`] for ref resolution, commit messages, changed paths and the
//! pipeline document at a commit.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::error::Error;

/// `before` value of a ref that did not exist yet
pub const ZERO_SHA: &str = "0000000000000000000000000000000000000000";

#[derive(Debug, Error)]
pub enum GitError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid repository id: {0}")]
    InvalidRepo(String),

    #[error("git command failed: {0}")]
    Command(String),

    #[error("git I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<GitError> for Error {
    fn from(err: GitError) -> Self {
        match err {
            GitError::NotFound(what) => Error::NotFound(what),
            GitError::InvalidRepo(repo) => Error::Validation(format!("invalid repository id {}", repo)),
            other => Error::Transient(other.to_string()),
        }
    }
}

#[async_trait]
pub trait GitProvider: Send + Sync {
    /// Commit sha a ref points at
    async fn resolve_ref(&self, repo_id: &str, ref_name: &str) -> Result<String, GitError>;

    async fn commit_message(&self, repo_id: &str, sha: &str) -> Result<String, GitError>;

    /// Paths touched between `before` and `after`; everything in `after` when
    /// there is no usable `before`
    async fn changed_paths(
        &self,
        repo_id: &str,
        before: Option<&str>,
        after: &str,
    ) -> Result<Vec<String>, GitError>;

    async fn read_file(&self, repo_id: &str, sha: &str, path: &str) -> Result<String, GitError>;
}

// =============================================================================
// Bare repositories on local disk
// =============================================================================

/// Shells out to `git` against `{root}/{repo_id}.git`
pub struct LocalGitProvider {
    root: PathBuf,
}

impl LocalGitProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn repo_path(&self, repo_id: &str) -> Result<PathBuf, GitError> {
        let relative = Path::new(repo_id);
        let safe = !repo_id.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(GitError::InvalidRepo(repo_id.to_string()));
        }
        Ok(self.root.join(format!("{}.git", repo_id)))
    }

    async fn git(&self, repo_id: &str, args: &[&str]) -> Result<String, GitError> {
        let git_dir = self.repo_path(repo_id)?;
        if !git_dir.exists() {
            return Err(GitError::NotFound(format!("repository {}", repo_id)));
        }

        debug!(repo_id, ?args, "Running git");
        let output = Command::new("git")
            .arg("--git-dir")
            .arg(&git_dir)
            .args(args)
            .output()
            .await?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if is_missing_object(&stderr) {
            Err(GitError::NotFound(format!("{} in {}", args.join(" "), repo_id)))
        } else {
            Err(GitError::Command(stderr))
        }
    }
}

fn is_missing_object(stderr: &str) -> bool {
    ["does not exist", "exists on disk, but not in", "unknown revision", "Needed a single revision", "bad object"]
        .iter()
        .any(|needle| stderr.contains(needle))
}

#[async_trait]
impl GitProvider for LocalGitProvider {
    async fn resolve_ref(&self, repo_id: &str, ref_name: &str) -> Result<String, GitError> {
        let rev = format!("{}^{{commit}}", ref_name);
        let out = self.git(repo_id, &["rev-parse", "--verify", &rev]).await?;
        Ok(out.trim().to_string())
    }

    async fn commit_message(&self, repo_id: &str, sha: &str) -> Result<String, GitError> {
        self.git(repo_id, &["log", "-1", "--format=%B", sha]).await
    }

    async fn changed_paths(
        &self,
        repo_id: &str,
        before: Option<&str>,
        after: &str,
    ) -> Result<Vec<String>, GitError> {
        let out = match before.filter(|b| *b != ZERO_SHA && !b.is_empty()) {
            Some(before) => {
                self.git(repo_id, &["diff", "--name-only", before, after])
                    .await?
            }
            None => {
                self.git(
                    repo_id,
                    &["diff-tree", "--no-commit-id", "--name-only", "-r", "--root", after],
                )
                .await?
            }
        };
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn read_file(&self, repo_id: &str, sha: &str, path: &str) -> Result<String, GitError> {
        let object = format!("{}:{}", sha, path);
        self.git(repo_id, &["show", &object]).await
    }
}

// =============================================================================
// In-memory provider
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct MemoryCommit {
    pub message: String,
    pub files: HashMap<String, String>,
    /// Paths reported as changed by this commit
    pub changed: Vec<String>,
}

#[derive(Default)]
struct MemoryRepo {
    refs: HashMap<String, String>,
    commits: HashMap<String, MemoryCommit>,
}

/// Scripted repositories for tests and development
#[derive(Default)]
pub struct MemoryGitProvider {
    repos: Mutex<HashMap<String, MemoryRepo>>,
}

impl MemoryGitProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_commit(&self, repo_id: &str, sha: &str, commit: MemoryCommit) {
        let mut repos = self.repos.lock().unwrap();
        repos
            .entry(repo_id.to_string())
            .or_default()
            .commits
            .insert(sha.to_string(), commit);
    }

    pub fn set_ref(&self, repo_id: &str, ref_name: &str, sha: &str) {
        let mut repos = self.repos.lock().unwrap();
        repos
            .entry(repo_id.to_string())
            .or_default()
            .refs
            .insert(ref_name.to_string(), sha.to_string());
    }

    fn commit(&self, repo_id: &str, sha: &str) -> Result<MemoryCommit, GitError> {
        let repos = self.repos.lock().unwrap();
        repos
            .get(repo_id)
            .and_then(|r| r.commits.get(sha))
            .cloned()
            .ok_or_else(|| GitError::NotFound(format!("commit {} in {}", sha, repo_id)))
    }
}

#[async_trait]
impl GitProvider for MemoryGitProvider {
    async fn resolve_ref(&self, repo_id: &str, ref_name: &str) -> Result<String, GitError> {
        let repos = self.repos.lock().unwrap();
        let repo = repos
            .get(repo_id)
            .ok_or_else(|| GitError::NotFound(format!("repository {}", repo_id)))?;
        let full = if ref_name.starts_with("refs/") {
            ref_name.to_string()
        } else {
            format!("refs/heads/{}", ref_name)
        };
        repo.refs
            .get(&full)
            .cloned()
            .ok_or_else(|| GitError::NotFound(format!("ref {} in {}", ref_name, repo_id)))
    }

    async fn commit_message(&self, repo_id: &str, sha: &str) -> Result<String, GitError> {
        Ok(self.commit(repo_id, sha)?.message)
    }

    async fn changed_paths(
        &self,
        repo_id: &str,
        _before: Option<&str>,
        after: &str,
    ) -> Result<Vec<String>, GitError> {
        Ok(self.commit(repo_id, after)?.changed)
    }

    async fn read_file(&self, repo_id: &str, sha: &str, path: &str) -> Result<String, GitError> {
        self.commit(repo_id, sha)?
            .files
            .remove(path)
            .ok_or_else(|| GitError::NotFound(format!("{} at {}", path, sha)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_path_stays_under_root() {
        let root = tempfile::tempdir().unwrap();
        let provider = LocalGitProvider::new(root.path());

        let path = provider.repo_path("acme/api").unwrap();
        assert_eq!(path, root.path().join("acme/api.git"));

        assert!(provider.repo_path("../etc").is_err());
        assert!(provider.repo_path("/abs").is_err());
        assert!(provider.repo_path("").is_err());
    }

    #[tokio::test]
    async fn test_missing_repository_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let provider = LocalGitProvider::new(root.path());
        let err = provider.resolve_ref("acme/api", "main").await.unwrap_err();
        assert!(matches!(err, GitError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_memory_provider_serves_files() {
        let git = MemoryGitProvider::new();
        git.add_commit(
            "acme/api",
            "abc",
            MemoryCommit {
                message: "init".to_string(),
                files: HashMap::from([(".gantry/pipeline.yaml".to_string(), "stages: []".to_string())]),
                changed: vec!["README.md".to_string()],
            },
        );
        git.set_ref("acme/api", "refs/heads/main", "abc");

        assert_eq!(git.resolve_ref("acme/api", "main").await.unwrap(), "abc");
        assert_eq!(
            git.read_file("acme/api", "abc", ".gantry/pipeline.yaml").await.unwrap(),
            "stages: []"
        );
        assert!(matches!(
            git.read_file("acme/api", "abc", "missing.yaml").await,
            Err(GitError::NotFound(_))
        ));
    }
}
