//! Worktree lifecycle (spec §3 "Worktree record", §4.1 "Worktree lifecycle",
//! §4.2 Git-isolation substrate): one branch and one working directory per
//! container, sharing object/ref storage with every other worktree of the
//! same repository.

use crate::error::{ContainerError, Result};
use crate::{ContainerId, RepoFullName};
use anyhow::Context as _;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// `{container_id, repo_full_name, branch_name, working_dir_path,
/// admin_dir_path, created_at}` (spec §3).
#[derive(Debug, Clone)]
pub struct WorktreeRecord {
    pub container_id: ContainerId,
    pub repo_full_name: RepoFullName,
    pub branch_name: String,
    pub working_dir_path: PathBuf,
    pub admin_dir_path: PathBuf,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// In-memory index of live worktrees, mutated only by the gateway (spec §5
/// "Shared resource policy": "Worktree index: mutated only by the gateway").
#[derive(Default)]
pub struct WorktreeIndex {
    records: HashMap<(ContainerId, RepoFullName), WorktreeRecord>,
}

impl WorktreeIndex {
    pub fn insert(&mut self, record: WorktreeRecord) {
        self.records
            .insert((record.container_id.clone(), record.repo_full_name.clone()), record);
    }

    pub fn remove(&mut self, container_id: &ContainerId, repo: &RepoFullName) -> Option<WorktreeRecord> {
        self.records.remove(&(container_id.clone(), repo.clone()))
    }

    pub fn get(&self, container_id: &ContainerId, repo: &RepoFullName) -> Option<&WorktreeRecord> {
        self.records.get(&(container_id.clone(), repo.clone()))
    }

    pub fn list(&self) -> Vec<WorktreeRecord> {
        self.records.values().cloned().collect()
    }

    /// Records whose `container_id` is not in `active` — candidates for
    /// `sweep()` (spec §4.1 "sweep() removes orphans", §4.2 "Crash recovery").
    pub fn orphans(&self, active: &std::collections::HashSet<ContainerId>) -> Vec<WorktreeRecord> {
        self.records
            .values()
            .filter(|r| !active.contains(&r.container_id))
            .cloned()
            .collect()
    }
}

/// Bare/shared object store root for a repository: `<worktrees_dir>/<repo
/// sanitized>/.store`. Every per-container worktree is added against this
/// store with `git worktree add`, so object/ref storage is shared while the
/// admin dir and working tree stay per-container (spec §4.2).
pub fn shared_store_path(worktrees_dir: &Path, repo_full_name: &str) -> PathBuf {
    worktrees_dir.join(sanitize_repo_name(repo_full_name)).join(".store")
}

pub fn container_worktree_path(worktrees_dir: &Path, repo_full_name: &str, container_id: &str) -> PathBuf {
    worktrees_dir
        .join(sanitize_repo_name(repo_full_name))
        .join("containers")
        .join(container_id)
}

fn sanitize_repo_name(repo_full_name: &str) -> String {
    repo_full_name.replace('/', "__")
}

/// Branch name convention: `agent/<container_id>/<slug>` (spec §3, §4.2).
pub fn branch_name(container_id: &str, slug: &str) -> String {
    format!("agent/{container_id}/{slug}")
}

/// Parses the `<container_id>` out of a branch that follows the
/// `agent/<container_id>/<slug>` convention.
pub fn owning_container_id(branch: &str) -> Option<&str> {
    let rest = branch.strip_prefix("agent/")?;
    rest.split_once('/').map(|(id, _slug)| id)
}

/// Whether `branch` is in `protected`, matching exactly (spec §4.1: "pushes
/// to protected branches ... default includes main and master").
pub fn is_protected(branch: &str, protected: &[String]) -> bool {
    protected.iter().any(|p| p == branch)
}

/// Ensure the shared bare-like store exists for `repo_full_name`, cloning it
/// from `remote_url` on first use.
pub async fn ensure_shared_store(store_path: &Path, remote_url: &str) -> Result<()> {
    if store_path.join("HEAD").exists() {
        return Ok(());
    }
    std::fs::create_dir_all(
        store_path
            .parent()
            .context("shared store path has no parent")?,
    )?;
    let status = Command::new("git")
        .args(["clone", "--bare", remote_url])
        .arg(store_path)
        .status()
        .await
        .context("failed to spawn git clone --bare")?;
    if !status.success() {
        return Err(ContainerError::StartFailed(format!(
            "git clone --bare failed for {remote_url}"
        ))
        .into());
    }
    Ok(())
}

/// `worktree add` against the shared store on branch `agent/<container_id>/work`.
pub async fn create(
    store_path: &Path,
    working_dir: &Path,
    container_id: &ContainerId,
    repo_full_name: &RepoFullName,
) -> Result<WorktreeRecord> {
    let branch = branch_name(container_id, "work");

    if let Some(parent) = working_dir.parent() {
        std::fs::create_dir_all(parent).context("failed to create worktree parent directory")?;
    }

    let status = Command::new("git")
        .current_dir(store_path)
        .args(["worktree", "add", "-B", &branch])
        .arg(working_dir)
        .status()
        .await
        .context("failed to spawn git worktree add")?;

    if !status.success() {
        return Err(ContainerError::StartFailed(format!(
            "git worktree add failed for {repo_full_name} / {container_id}"
        ))
        .into());
    }

    Ok(WorktreeRecord {
        container_id: container_id.clone(),
        repo_full_name: repo_full_name.clone(),
        branch_name: branch,
        working_dir_path: working_dir.to_path_buf(),
        admin_dir_path: working_dir.join(".git"),
        created_at: chrono::Utc::now(),
    })
}

/// Remove a worktree, warning (not failing) if it carries uncommitted
/// changes (spec §4.1 "destroy(...) ... warning if uncommitted changes
/// exist").
pub async fn destroy(store_path: &Path, record: &WorktreeRecord) -> Result<bool> {
    let had_uncommitted = has_uncommitted_changes(&record.working_dir_path).await;
    if had_uncommitted {
        tracing::warn!(
            path = %record.working_dir_path.display(),
            container_id = %record.container_id,
            "removing worktree with uncommitted changes"
        );
    }

    let status = Command::new("git")
        .current_dir(store_path)
        .args(["worktree", "remove", "--force"])
        .arg(&record.working_dir_path)
        .status()
        .await
        .context("failed to spawn git worktree remove")?;

    if !status.success() {
        // The directory may already be gone (e.g. a prior crash); best effort.
        let _ = std::fs::remove_dir_all(&record.working_dir_path);
    }

    Ok(had_uncommitted)
}

async fn has_uncommitted_changes(working_dir: &Path) -> bool {
    let Ok(output) = Command::new("git")
        .current_dir(working_dir)
        .args(["status", "--porcelain"])
        .output()
        .await
    else {
        return false;
    };
    !output.stdout.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_name_follows_convention() {
        assert_eq!(branch_name("abc123", "work"), "agent/abc123/work");
    }

    #[test]
    fn owning_container_id_parses_convention_branches() {
        assert_eq!(owning_container_id("agent/abc123/work"), Some("abc123"));
        assert_eq!(owning_container_id("agent/def456/fix-slug-name"), Some("def456"));
        assert_eq!(owning_container_id("main"), None);
        assert_eq!(owning_container_id("feature/x"), None);
    }

    #[test]
    fn is_protected_matches_exactly() {
        let protected = vec!["main".to_string(), "master".to_string()];
        assert!(is_protected("main", &protected));
        assert!(!is_protected("main2", &protected));
    }

    #[test]
    fn sanitize_repo_name_replaces_slash() {
        assert_eq!(sanitize_repo_name("org/repo-x"), "org__repo-x");
    }
}
