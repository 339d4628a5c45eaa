//! Staging / merge pipeline (spec §4.7): moves batches of agent-authored
//! changes out of the sandbox into `sharing/staged-changes/<slug>/` in a form
//! a human can inspect and apply. [`apply`] is the host-side apply tool's
//! core logic; this module only discovers and parses drops.

pub mod apply;

use crate::error::{Result, StagingError};
use anyhow::Context as _;
use std::path::{Path, PathBuf};

/// One `staged-changes/<slug>/` directory, read but not yet applied.
#[derive(Debug, Clone)]
pub struct Drop {
    pub slug: String,
    pub dir: PathBuf,
    pub changes_md: String,
    pub patch_path: Option<PathBuf>,
    pub raw_files: Vec<PathBuf>,
}

/// List every drop currently sitting in the staging directory, oldest first
/// by directory name (slugs are expected to sort chronologically).
pub fn list_drops(staged_changes_dir: &Path) -> Result<Vec<Drop>> {
    if !staged_changes_dir.exists() {
        return Ok(Vec::new());
    }

    let mut slugs: Vec<String> = std::fs::read_dir(staged_changes_dir)
        .with_context(|| format!("failed to list {}", staged_changes_dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| !name.starts_with('.'))
        .collect();
    slugs.sort();

    slugs.into_iter().map(|slug| load_drop(staged_changes_dir, &slug)).collect()
}

fn load_drop(staged_changes_dir: &Path, slug: &str) -> Result<Drop> {
    let dir = staged_changes_dir.join(slug);
    let changes_md_path = dir.join("CHANGES.md");
    let changes_md = std::fs::read_to_string(&changes_md_path)
        .with_context(|| format!("drop '{slug}' is missing CHANGES.md"))?;

    let patch_path = dir.join("changes.patch");
    let patch_path = patch_path.exists().then_some(patch_path);

    let raw_files = collect_raw_files(&dir)?;

    Ok(Drop { slug: slug.to_string(), dir, changes_md, patch_path, raw_files })
}

/// Every file under the drop directory other than `CHANGES.md` and
/// `changes.patch` is a raw-file-copy fallback candidate (spec §4.7 "(Optional)
/// raw files under their repository-relative paths").
fn collect_raw_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    walk_raw_files(dir, dir, &mut files)?;
    Ok(files)
}

fn walk_raw_files(root: &Path, current: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(current).with_context(|| format!("failed to list {}", current.display()))? {
        let entry = entry.context("failed to read directory entry")?;
        let path = entry.path();
        if path.is_dir() {
            walk_raw_files(root, &path, out)?;
            continue;
        }
        let relative = path.strip_prefix(root).expect("path is under root by construction");
        if relative == Path::new("CHANGES.md") || relative == Path::new("changes.patch") {
            continue;
        }
        out.push(relative.to_path_buf());
    }
    Ok(())
}

/// Auto-detect the target repository from `CHANGES.md`'s `Repository:`
/// field (spec §4.7 "auto-detects the target repository from CHANGES.md
/// (with override)"). Returns an error the apply tool surfaces to the human
/// so they can supply an explicit override instead.
pub fn detect_target_repo(drop: &Drop) -> Result<String> {
    drop.changes_md
        .lines()
        .find_map(|line| line.strip_prefix("Repository:").map(|rest| rest.trim().to_string()))
        .filter(|repo| !repo.is_empty())
        .ok_or_else(|| StagingError::AmbiguousTarget { slug: drop.slug.clone() }.into())
}

/// Derive a commit message from CHANGES.md: its first `# ` heading becomes
/// the subject, everything else becomes the body (spec §4.7 "a commit
/// message derived from CHANGES.md").
pub fn commit_message_from_changes(changes_md: &str) -> String {
    let mut lines = changes_md.lines();
    let subject = lines
        .by_ref()
        .find_map(|line| line.strip_prefix("# "))
        .unwrap_or("Apply staged changes")
        .trim()
        .to_string();
    let body: String = lines.collect::<Vec<_>>().join("\n").trim().to_string();
    if body.is_empty() {
        subject
    } else {
        format!("{subject}\n\n{body}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_repository_from_changes_md() {
        let drop = Drop {
            slug: "fix-typo".to_string(),
            dir: PathBuf::new(),
            changes_md: "# Fix typo\n\nRepository: org/repo-x\n\nOverview: ...\n".to_string(),
            patch_path: None,
            raw_files: vec![],
        };
        assert_eq!(detect_target_repo(&drop).unwrap(), "org/repo-x");
    }

    #[test]
    fn missing_repository_field_is_ambiguous() {
        let drop = Drop {
            slug: "no-repo".to_string(),
            dir: PathBuf::new(),
            changes_md: "# Something\n".to_string(),
            patch_path: None,
            raw_files: vec![],
        };
        assert!(detect_target_repo(&drop).is_err());
    }

    #[test]
    fn commit_message_splits_subject_and_body() {
        let msg = commit_message_from_changes("# Tidy imports\n\nRemoves an unused import in main.rs.\n");
        assert_eq!(msg, "Tidy imports\n\nRemoves an unused import in main.rs.");
    }

    #[test]
    fn commit_message_falls_back_without_heading() {
        let msg = commit_message_from_changes("no heading here");
        assert_eq!(msg, "Apply staged changes");
    }
}
