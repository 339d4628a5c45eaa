//! Apply-tool core (spec §4.7 "Apply tool"): patch-preferred, file-copy
//! fallback, never both in the same run. Grounded on
//! `container::lifecycle::ContainerManager::checkout_fresh_branch`'s
//! `tokio::process::Command::new("git")` shell-out convention — the apply
//! tool is host-side and talks to a real git checkout directly, with no
//! gateway in between.

use crate::error::{Result, StagingError};
use crate::staging::Drop;
use anyhow::Context as _;
use chrono::Utc;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyStrategy {
    Patch,
    FileCopy,
}

/// The result of staging a drop's changes into a working tree, before the
/// human has confirmed the commit.
pub struct ApplyPlan {
    pub strategy: ApplyStrategy,
    pub diff_preview: String,
}

/// Apply `drop`'s changes into `worktree_path` without committing: patch
/// first, file-copy fallback only when the patch does not apply cleanly
/// (spec §4.7, §9 "never mixed in a single apply run").
pub async fn stage(worktree_path: &Path, drop: &Drop) -> Result<ApplyPlan> {
    let strategy = if let Some(patch_path) = &drop.patch_path {
        if patch_applies_cleanly(worktree_path, patch_path).await? {
            apply_patch(worktree_path, patch_path, &drop.slug).await?;
            ApplyStrategy::Patch
        } else {
            copy_raw_files(worktree_path, drop).await?;
            ApplyStrategy::FileCopy
        }
    } else {
        copy_raw_files(worktree_path, drop).await?;
        ApplyStrategy::FileCopy
    };

    let diff_preview = git_diff(worktree_path).await?;
    Ok(ApplyPlan { strategy, diff_preview })
}

async fn patch_applies_cleanly(worktree_path: &Path, patch_path: &Path) -> Result<bool> {
    let status = tokio::process::Command::new("git")
        .current_dir(worktree_path)
        .args(["apply", "--check"])
        .arg(patch_path)
        .status()
        .await
        .context("failed to spawn git apply --check")?;
    Ok(status.success())
}

async fn apply_patch(worktree_path: &Path, patch_path: &Path, slug: &str) -> Result<()> {
    let status = tokio::process::Command::new("git")
        .current_dir(worktree_path)
        .args(["apply"])
        .arg(patch_path)
        .status()
        .await
        .context("failed to spawn git apply")?;
    if !status.success() {
        return Err(StagingError::Conflict { slug: slug.to_string() }.into());
    }
    Ok(())
}

/// Copy every raw file in the drop to its repository-relative path in the
/// working tree, creating parent directories as needed.
async fn copy_raw_files(worktree_path: &Path, drop: &Drop) -> Result<()> {
    if drop.raw_files.is_empty() {
        return Err(StagingError::AmbiguousTarget { slug: drop.slug.clone() }.into());
    }
    for relative in &drop.raw_files {
        let source = drop.dir.join(relative);
        let dest = worktree_path.join(relative);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.with_context(|| format!("failed to create {}", parent.display()))?;
        }
        tokio::fs::copy(&source, &dest).await.with_context(|| format!("failed to copy {} to {}", source.display(), dest.display()))?;
    }
    Ok(())
}

async fn git_diff(worktree_path: &Path) -> Result<String> {
    let output = tokio::process::Command::new("git")
        .current_dir(worktree_path)
        .args(["diff", "--stat", "HEAD"])
        .output()
        .await
        .context("failed to spawn git diff")?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Undo a staged-but-unconfirmed change, leaving the working tree as it was
/// (spec §4.7 "Rejected or skipped drops remain in place" — the drop
/// directory stays, but the working tree must not carry its half-applied
/// state forward to the next drop).
pub async fn discard(worktree_path: &Path) -> Result<()> {
    let status = tokio::process::Command::new("git")
        .current_dir(worktree_path)
        .args(["checkout", "--", "."])
        .status()
        .await
        .context("failed to spawn git checkout -- .")?;
    if !status.success() {
        tracing::warn!(worktree = %worktree_path.display(), "git checkout -- . reported failure during discard");
    }

    let clean_status = tokio::process::Command::new("git")
        .current_dir(worktree_path)
        .args(["clean", "-fd"])
        .status()
        .await
        .context("failed to spawn git clean -fd")?;
    if !clean_status.success() {
        tracing::warn!(worktree = %worktree_path.display(), "git clean -fd reported failure during discard");
    }
    Ok(())
}

/// A fixed attribution footer appended to every commit this tool makes,
/// identifying it as a human-applied staged agent change rather than a
/// direct human edit (spec §4.7 "a fixed co-author attribution appended").
pub fn co_author_footer(agent_identity: &str) -> String {
    format!("Co-authored-by: {agent_identity}")
}

/// Commit the currently staged working-tree changes with a message derived
/// from CHANGES.md plus the fixed co-author footer.
pub async fn commit(worktree_path: &Path, drop: &Drop, agent_identity: &str) -> Result<String> {
    let add_status = tokio::process::Command::new("git")
        .current_dir(worktree_path)
        .args(["add", "-A"])
        .status()
        .await
        .context("failed to spawn git add -A")?;
    if !add_status.success() {
        return Err(StagingError::Conflict { slug: drop.slug.clone() }.into());
    }

    let message = format!(
        "{}\n\n{}",
        super::commit_message_from_changes(&drop.changes_md),
        co_author_footer(agent_identity)
    );
    let commit_status = tokio::process::Command::new("git")
        .current_dir(worktree_path)
        .args(["commit", "-m", &message])
        .status()
        .await
        .context("failed to spawn git commit")?;
    if !commit_status.success() {
        return Err(StagingError::Conflict { slug: drop.slug.clone() }.into());
    }

    let rev_parse = tokio::process::Command::new("git")
        .current_dir(worktree_path)
        .args(["rev-parse", "HEAD"])
        .output()
        .await
        .context("failed to spawn git rev-parse HEAD")?;
    Ok(String::from_utf8_lossy(&rev_parse.stdout).trim().to_string())
}

/// Move an applied (or abandoned) drop into the timestamped archive
/// directory (spec §4.7 "moved to an archive directory timestamped at
/// application time"). Re-running the apply tool against an already
/// archived slug finds nothing under `staged_changes_dir`, satisfying the
/// no-op-on-rerun idempotence law (spec §8).
pub async fn archive(staged_changes_archive_dir: &Path, drop: &Drop) -> Result<PathBuf> {
    tokio::fs::create_dir_all(staged_changes_archive_dir)
        .await
        .with_context(|| format!("failed to create {}", staged_changes_archive_dir.display()))?;

    let timestamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let dest = staged_changes_archive_dir.join(format!("{timestamp}-{}", drop.slug));
    tokio::fs::rename(&drop.dir, &dest)
        .await
        .with_context(|| format!("failed to archive {} to {}", drop.dir.display(), dest.display()))?;
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn co_author_footer_is_a_single_trailer_line() {
        let footer = co_author_footer("jib-agent <jib-agent@users.noreply.github.com>");
        assert_eq!(footer, "Co-authored-by: jib-agent <jib-agent@users.noreply.github.com>");
    }

    #[tokio::test]
    async fn file_copy_fallback_requires_at_least_one_raw_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let drop = Drop {
            slug: "empty-drop".to_string(),
            dir: dir.path().to_path_buf(),
            changes_md: "# Nothing".to_string(),
            patch_path: None,
            raw_files: vec![],
        };
        let error = copy_raw_files(dir.path(), &drop).await.expect_err("no raw files to copy");
        assert!(matches!(error, crate::Error::Staging(StagingError::AmbiguousTarget { .. })));
    }
}
