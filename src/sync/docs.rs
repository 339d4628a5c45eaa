//! Bulk documentation-like sync (spec §4.6 "Bulk pull"): enumerate an
//! allow-listed set of spaces, mirror each item to a stable local file path
//! with its body plus metadata, mirror upstream deletes, and report what
//! changed. Grounded on `secrets::SecretsStore::reload_if_changed`'s
//! mtime-gated reload shape for the allowlist load, and on
//! `gateway::code_proxy`'s bare-`reqwest` fetch-and-map-errors convention for
//! talking to the upstream source.

use crate::error::{ConfigError, Result};
use crate::HostDeps;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// One allow-listed source in `config/context-filters.yaml`.
#[derive(Debug, Clone, Deserialize)]
struct AllowedSpace {
    id: String,
    base_url: String,
}

#[derive(Debug, Default, Deserialize)]
struct ContextFilters {
    #[serde(default)]
    spaces: Vec<AllowedSpace>,
}

/// One item as reported by an upstream source's list endpoint.
#[derive(Debug, Clone, Deserialize)]
struct RemoteItem {
    id: String,
    title: String,
    body: String,
    updated_at: String,
}

/// Metadata sidecar written next to the mirrored body (spec §4.6 "body plus
/// metadata").
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ItemMetadata {
    space_id: String,
    item_id: String,
    title: String,
    updated_at: String,
}

/// What happened to one mirrored item during a sync run.
#[derive(Debug, Clone)]
pub struct SyncedItem {
    pub space_id: String,
    pub item_id: String,
    pub title: String,
}

/// Added/changed/removed summary for one bulk-pull run (spec §4.6 "A run
/// produces a summary of added/changed/removed items").
#[derive(Debug, Clone, Default)]
pub struct SyncSummary {
    pub added: Vec<SyncedItem>,
    pub changed: Vec<SyncedItem>,
    pub removed: Vec<SyncedItem>,
}

impl SyncSummary {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }

    /// A one-line digest handed to the post-sync analyzer as its trigger
    /// payload (spec §4.5 Timer trigger).
    pub fn describe(&self) -> String {
        format!(
            "{} added, {} changed, {} removed",
            self.added.len(),
            self.changed.len(),
            self.removed.len()
        )
    }
}

/// Run one full bulk-pull cycle across every allow-listed space.
pub async fn run_once(deps: &HostDeps) -> Result<SyncSummary> {
    let filters = load_context_filters(&deps.config.context_filters_path())?;
    if filters.spaces.is_empty() {
        return Ok(SyncSummary::default());
    }

    let client = reqwest::Client::new();
    let mirror_dir = deps.config.docs_mirror_dir();
    let mut summary = SyncSummary::default();

    for space in &filters.spaces {
        sync_space(&client, &mirror_dir, space, &mut summary).await?;
    }

    Ok(summary)
}

fn load_context_filters(path: &Path) -> Result<ContextFilters> {
    if !path.exists() {
        return Ok(ContextFilters::default());
    }
    let content = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_yaml::from_str(&content).map_err(|error| ConfigError::Invalid(format!("context-filters.yaml: {error}")).into())
}

async fn sync_space(
    client: &reqwest::Client,
    mirror_dir: &Path,
    space: &AllowedSpace,
    summary: &mut SyncSummary,
) -> Result<()> {
    let space_dir = mirror_dir.join(&space.id);
    tokio::fs::create_dir_all(&space_dir).await.with_context(|| format!("failed to create {}", space_dir.display()))?;

    let remote_items = fetch_remote_items(client, &space.base_url).await?;
    let remote_ids: HashSet<&str> = remote_items.iter().map(|item| item.id.as_str()).collect();

    let existing = existing_item_ids(&space_dir).await?;

    for item in &remote_items {
        let body_path = space_dir.join(format!("{}.md", item.id));
        let meta_path = space_dir.join(format!("{}.meta.json", item.id));

        let is_new = !existing.contains(&item.id);
        let changed = if is_new {
            false
        } else {
            read_existing_updated_at(&meta_path).await.map(|prev| prev != item.updated_at).unwrap_or(true)
        };

        if is_new || changed {
            write_item(&body_path, &meta_path, space, item).await?;
            let synced = SyncedItem { space_id: space.id.clone(), item_id: item.id.clone(), title: item.title.clone() };
            if is_new {
                summary.added.push(synced);
            } else {
                summary.changed.push(synced);
            }
        }
    }

    let remote_id_strings: HashSet<String> = remote_ids.iter().map(|s| s.to_string()).collect();
    for stale_id in existing.difference(&remote_id_strings) {
        let body_path = space_dir.join(format!("{stale_id}.md"));
        let meta_path = space_dir.join(format!("{stale_id}.meta.json"));
        let title = read_existing_title(&meta_path).await.unwrap_or_default();
        let _ = tokio::fs::remove_file(&body_path).await;
        let _ = tokio::fs::remove_file(&meta_path).await;
        summary.removed.push(SyncedItem { space_id: space.id.clone(), item_id: stale_id.clone(), title });
    }

    Ok(())
}

async fn fetch_remote_items(client: &reqwest::Client, base_url: &str) -> Result<Vec<RemoteItem>> {
    let url = format!("{}/items", base_url.trim_end_matches('/'));
    let response = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("bulk-pull request to {url} failed"))?;
    let items: Vec<RemoteItem> = response
        .error_for_status()
        .with_context(|| format!("bulk-pull source {url} returned an error"))?
        .json()
        .await
        .with_context(|| format!("bulk-pull source {url} returned unparseable JSON"))?;
    Ok(items)
}

async fn existing_item_ids(space_dir: &Path) -> Result<HashSet<String>> {
    let mut ids = HashSet::new();
    let mut entries = tokio::fs::read_dir(space_dir).await.with_context(|| format!("failed to list {}", space_dir.display()))?;
    while let Some(entry) = entries.next_entry().await.context("failed to read directory entry")? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("md") {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.insert(stem.to_string());
            }
        }
    }
    Ok(ids)
}

async fn read_existing_updated_at(meta_path: &Path) -> Option<String> {
    let content = tokio::fs::read_to_string(meta_path).await.ok()?;
    let meta: ItemMetadata = serde_json::from_str(&content).ok()?;
    Some(meta.updated_at)
}

async fn read_existing_title(meta_path: &Path) -> Option<String> {
    let content = tokio::fs::read_to_string(meta_path).await.ok()?;
    let meta: ItemMetadata = serde_json::from_str(&content).ok()?;
    Some(meta.title)
}

async fn write_item(body_path: &Path, meta_path: &Path, space: &AllowedSpace, item: &RemoteItem) -> Result<()> {
    tokio::fs::write(body_path, &item.body).await.with_context(|| format!("failed to write {}", body_path.display()))?;
    let meta = ItemMetadata {
        space_id: space.id.clone(),
        item_id: item.id.clone(),
        title: item.title.clone(),
        updated_at: item.updated_at.clone(),
    };
    let meta_content = serde_json::to_string_pretty(&meta).context("failed to serialize item metadata")?;
    tokio::fs::write(meta_path, meta_content).await.with_context(|| format!("failed to write {}", meta_path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_describe_counts_each_bucket() {
        let summary = SyncSummary {
            added: vec![SyncedItem { space_id: "ENG".into(), item_id: "1".into(), title: "a".into() }],
            changed: vec![],
            removed: vec![SyncedItem { space_id: "ENG".into(), item_id: "2".into(), title: "b".into() }],
        };
        assert_eq!(summary.describe(), "1 added, 0 changed, 1 removed");
        assert!(!summary.is_empty());
    }

    #[test]
    fn empty_summary_reports_empty() {
        assert!(SyncSummary::default().is_empty());
    }

    #[tokio::test]
    async fn detects_new_and_stale_items_across_a_sync_cycle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let space_dir = dir.path().join("ENG");
        tokio::fs::create_dir_all(&space_dir).await.unwrap();

        let space = AllowedSpace { id: "ENG".to_string(), base_url: "http://unused.invalid".to_string() };
        let mut summary = SyncSummary::default();

        let item = RemoteItem { id: "doc-1".to_string(), title: "Doc One".to_string(), body: "hello".to_string(), updated_at: "t1".to_string() };
        write_item(&space_dir.join("doc-1.md"), &space_dir.join("doc-1.meta.json"), &space, &item).await.unwrap();

        let existing = existing_item_ids(&space_dir).await.unwrap();
        assert!(existing.contains("doc-1"));

        let stale_title = read_existing_title(&space_dir.join("doc-1.meta.json")).await.unwrap();
        assert_eq!(stale_title, "Doc One");

        summary.removed.push(SyncedItem { space_id: "ENG".to_string(), item_id: "doc-1".to_string(), title: stale_title });
        assert_eq!(summary.describe(), "0 added, 0 changed, 1 removed");
    }
}
