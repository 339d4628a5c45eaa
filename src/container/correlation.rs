//! Run correlation and log indexing (spec §3 "Run correlation", §4.3 "Log and
//! correlation policy"): one record per container launch, logs addressable
//! both by `run_id` and by the originating `context_id`.

use crate::{ContainerId, ContextId, RunId, RunOrigin};
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// `{run_id, origin, source_ref, started_at, container_id, exit_status,
/// logs_path, context_id?}` (spec §3). Immutable after exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub origin: RunOriginRecord,
    pub source_ref: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub container_id: ContainerId,
    pub exit_status: Option<i32>,
    pub logs_path: PathBuf,
    pub context_id: Option<ContextId>,
}

/// Serializable mirror of [`RunOrigin`] (which itself carries no data payload
/// worth round-tripping through JSON beyond its tag).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOriginRecord {
    Timer,
    Chat,
    PrEvent,
    Manual,
}

impl From<RunOrigin> for RunOriginRecord {
    fn from(origin: RunOrigin) -> Self {
        match origin {
            RunOrigin::Timer => RunOriginRecord::Timer,
            RunOrigin::Chat => RunOriginRecord::Chat,
            RunOrigin::PrEvent => RunOriginRecord::PrEvent,
            RunOrigin::Manual => RunOriginRecord::Manual,
        }
    }
}

#[derive(Default, Serialize, Deserialize)]
struct IndexFile {
    #[serde(flatten)]
    by_context: HashMap<String, Vec<RunId>>,
}

/// `container_logs_dir()`-rooted index: `runs/<origin>/<run_id>.log` holds
/// the raw capture, `by-context/<context_id>/<run_id>.log` is a symlink to
/// it, and `index.json` maps `context_id -> run_ids[]` for fast lookup
/// without walking the alias directory.
pub struct CorrelationIndex {
    root: PathBuf,
    by_context: Mutex<HashMap<ContextId, Vec<RunId>>>,
}

impl CorrelationIndex {
    pub fn load(container_logs_dir: &Path) -> anyhow::Result<Self> {
        let index_path = container_logs_dir.join("index.json");
        let by_context = if index_path.exists() {
            let content = std::fs::read_to_string(&index_path)
                .with_context(|| format!("failed to read correlation index: {}", index_path.display()))?;
            let file: IndexFile = serde_json::from_str(&content)
                .with_context(|| format!("invalid correlation index JSON: {}", index_path.display()))?;
            file.by_context.into_iter().map(|(k, v)| (ContextId::from(k), v)).collect()
        } else {
            HashMap::new()
        };
        Ok(Self { root: container_logs_dir.to_path_buf(), by_context: Mutex::new(by_context) })
    }

    /// The host-side path a run's raw log should be captured to, creating
    /// its parent directory if needed.
    pub fn log_path(&self, origin: RunOrigin, run_id: RunId) -> anyhow::Result<PathBuf> {
        let origin_tag = match origin {
            RunOrigin::Timer => "timer",
            RunOrigin::Chat => "chat",
            RunOrigin::PrEvent => "pr-event",
            RunOrigin::Manual => "manual",
        };
        let dir = self.root.join("runs").join(origin_tag);
        std::fs::create_dir_all(&dir).context("failed to create run log directory")?;
        Ok(dir.join(format!("{run_id}.log")))
    }

    /// Record that `run_id`'s logs live at `logs_path`, aliasing the record
    /// under `context_id` (via a symlink and the in-memory/on-disk index)
    /// when one was supplied.
    pub fn record(&self, context_id: Option<&ContextId>, run_id: RunId, logs_path: &Path) -> anyhow::Result<()> {
        let Some(context_id) = context_id else {
            return Ok(());
        };

        let alias_dir = self.root.join("by-context").join(context_id.as_ref());
        std::fs::create_dir_all(&alias_dir).context("failed to create context alias directory")?;
        let alias_path = alias_dir.join(format!("{run_id}.log"));
        if !alias_path.exists() {
            symlink_best_effort(logs_path, &alias_path);
        }

        {
            let mut guard = self.by_context.lock().expect("correlation index mutex poisoned");
            guard.entry(context_id.clone()).or_default().push(run_id);
        }
        self.flush()
    }

    pub fn run_ids_for_context(&self, context_id: &str) -> Vec<RunId> {
        self.by_context
            .lock()
            .expect("correlation index mutex poisoned")
            .get(context_id)
            .cloned()
            .unwrap_or_default()
    }

    fn flush(&self) -> anyhow::Result<()> {
        let by_context: HashMap<String, Vec<RunId>> = self
            .by_context
            .lock()
            .expect("correlation index mutex poisoned")
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        let file = IndexFile { by_context };
        let content = serde_json::to_string_pretty(&file).context("failed to serialize correlation index")?;
        let index_path = self.root.join("index.json");
        let tmp_path = index_path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content)
            .with_context(|| format!("failed to write correlation index: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &index_path)
            .with_context(|| format!("failed to replace correlation index: {}", index_path.display()))?;
        Ok(())
    }
}

#[cfg(unix)]
fn symlink_best_effort(original: &Path, link: &Path) {
    if let Err(error) = std::os::unix::fs::symlink(original, link) {
        tracing::warn!(%error, link = %link.display(), "failed to create context alias symlink");
    }
}

#[cfg(not(unix))]
fn symlink_best_effort(original: &Path, link: &Path) {
    if let Err(error) = std::fs::copy(original, link) {
        tracing::warn!(%error, link = %link.display(), "failed to create context alias copy");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_path_is_namespaced_by_origin() {
        let dir = tempfile::tempdir().expect("tempdir");
        let index = CorrelationIndex::load(dir.path()).expect("load empty index");
        let run_id = RunId::parse_str("00000000-0000-0000-0000-000000000001").expect("valid uuid");
        let path = index.log_path(RunOrigin::Chat, run_id).expect("log path");
        assert!(path.starts_with(dir.path().join("runs").join("chat")));
        assert!(path.ends_with(format!("{run_id}.log")));
    }

    #[test]
    fn record_persists_context_to_run_id_mapping() {
        let dir = tempfile::tempdir().expect("tempdir");
        let index = CorrelationIndex::load(dir.path()).expect("load empty index");
        let run_id = RunId::parse_str("00000000-0000-0000-0000-000000000002").expect("valid uuid");
        let log_path = index.log_path(RunOrigin::Manual, run_id).expect("log path");
        std::fs::write(&log_path, "log output").expect("write log");

        let context_id: ContextId = ContextId::from("thread-1700000000.000100");
        index.record(Some(&context_id), run_id, &log_path).expect("record");

        let reloaded = CorrelationIndex::load(dir.path()).expect("reload index");
        assert_eq!(reloaded.run_ids_for_context(&context_id), vec![run_id]);
    }
}
