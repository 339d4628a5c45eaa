//! Persisted thread-root index (spec §4.4 "Thread keys are persisted so a
//! later update finds the existing thread and does not create a new one").
//! Keyed by `context_id` rather than by ts directly, since the producer of a
//! notification intent usually knows the task's `context_id` but not
//! whatever ts the bridge ended up posting the opening summary under.

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub channel: String,
    pub root_ts: String,
}

#[derive(Default, Serialize, Deserialize)]
struct ThreadIndexFile {
    #[serde(flatten)]
    records: HashMap<String, ThreadRecord>,
}

/// Tracks which `context_id` owns which already-posted thread root, so the
/// outbound watcher can turn a later notification into a reply instead of a
/// new top-level message.
pub struct ThreadIndex {
    path: PathBuf,
    records: Mutex<HashMap<String, ThreadRecord>>,
}

impl ThreadIndex {
    /// Load the index from `<tracking_dir>/thread-roots.json`, starting
    /// empty if the file does not exist yet.
    pub fn load(tracking_dir: &Path) -> anyhow::Result<Self> {
        let path = tracking_dir.join("thread-roots.json");
        let records = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read thread index: {}", path.display()))?;
            let file: ThreadIndexFile = serde_json::from_str(&content)
                .with_context(|| format!("invalid thread index JSON: {}", path.display()))?;
            file.records
        } else {
            HashMap::new()
        };
        Ok(Self { path, records: Mutex::new(records) })
    }

    /// The persisted root for `context_id`, if this thread has already been
    /// opened.
    pub fn lookup(&self, context_id: &str) -> Option<ThreadRecord> {
        self.records.lock().expect("thread index mutex poisoned").get(context_id).cloned()
    }

    /// Reverse lookup: does `root_ts` in `channel` belong to a thread this
    /// bridge itself opened? Used by the inbound listener to distinguish a
    /// bot-DM thread reply (spec §4.4) from an unrelated reply.
    pub fn find_by_root_ts(&self, channel: &str, root_ts: &str) -> Option<String> {
        self.records
            .lock()
            .expect("thread index mutex poisoned")
            .iter()
            .find(|(_, record)| record.channel == channel && record.root_ts == root_ts)
            .map(|(context_id, _)| context_id.clone())
    }

    /// Record that `context_id`'s thread root is now `root_ts` in `channel`,
    /// persisting immediately so a daemon restart does not lose it.
    pub fn record_root(&self, context_id: &str, channel: &str, root_ts: &str) -> anyhow::Result<()> {
        {
            let mut guard = self.records.lock().expect("thread index mutex poisoned");
            guard.insert(
                context_id.to_string(),
                ThreadRecord { channel: channel.to_string(), root_ts: root_ts.to_string() },
            );
        }
        self.flush()
    }

    fn flush(&self) -> anyhow::Result<()> {
        let records = self.records.lock().expect("thread index mutex poisoned").clone();
        let file = ThreadIndexFile { records };
        let content = serde_json::to_string_pretty(&file).context("failed to serialize thread index")?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content)
            .with_context(|| format!("failed to write thread index: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to replace thread index: {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let index = ThreadIndex::load(dir.path()).expect("load empty index");
        assert!(index.lookup("thread-1700000000.000100").is_none());

        index
            .record_root("thread-1700000000.000100", "DBOT01", "1700000000.000200")
            .expect("record root");

        let reloaded = ThreadIndex::load(dir.path()).expect("reload index");
        let record = reloaded.lookup("thread-1700000000.000100").expect("record should persist");
        assert_eq!(record.channel, "DBOT01");
        assert_eq!(record.root_ts, "1700000000.000200");
    }
}
