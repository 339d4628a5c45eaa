//! Outbound notification watcher (spec §4.4 "Outbound path"): a filesystem
//! watch on `sharing/notifications/` that coalesces intents arriving within a
//! batch window per thread and emits them through the gateway's chat proxy,
//! grounded on `secrets::SecretsStore::spawn_watcher`'s `notify`-based
//! reload loop, generalized from "reload one file" to "drain a directory".

use crate::chat::thread_index::ThreadIndex;
use crate::chat::{NotificationIntent, NotificationKind};
use crate::gateway::chat_proxy::{ChatProxy, PostMessageRequest};
use crate::tasks::store::TaskStore;
use crate::ContainerId;
use anyhow::Context as _;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// The bridge itself, not any particular sandbox, is the caller of record for
/// chat sends made on behalf of a notification drop.
fn host_caller() -> ContainerId {
    ContainerId::from("host-chat-bridge")
}

pub struct NotificationWatcher {
    notifications_dir: PathBuf,
    chat: Arc<ChatProxy>,
    thread_index: Arc<ThreadIndex>,
    tasks: Arc<TaskStore>,
    event_sink: crate::HostDeps,
    batch_window: Duration,
    pending: Arc<Mutex<HashMap<String, Vec<(PathBuf, NotificationIntent)>>>>,
}

impl NotificationWatcher {
    pub fn new(
        notifications_dir: PathBuf,
        chat: Arc<ChatProxy>,
        thread_index: Arc<ThreadIndex>,
        deps: crate::HostDeps,
        batch_window: Duration,
    ) -> Self {
        let tasks = deps.tasks.clone();
        Self {
            notifications_dir,
            chat,
            thread_index,
            tasks,
            event_sink: deps,
            batch_window,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start the filesystem watch and the coalescing loop. Also does one
    /// initial sweep of the directory so intents dropped while the bridge was
    /// down still get delivered.
    pub fn spawn(self: Arc<Self>) -> anyhow::Result<notify::RecommendedWatcher> {
        use notify::{RecursiveMode, Watcher};

        let (tx, mut rx) = tokio::sync::mpsc::channel::<PathBuf>(256);

        let watcher_tx = tx.clone();
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            let Ok(event) = event else { return };
            if !matches!(event.kind, notify::EventKind::Create(_) | notify::EventKind::Modify(_)) {
                return;
            }
            for path in event.paths {
                if path.extension().and_then(|e| e.to_str()) == Some("json") {
                    let _ = watcher_tx.try_send(path);
                }
            }
        })
        .context("failed to create notifications watcher")?;

        watcher
            .watch(&self.notifications_dir, RecursiveMode::NonRecursive)
            .context("failed to watch notifications directory")?;

        if let Ok(entries) = std::fs::read_dir(&self.notifications_dir) {
            for entry in entries.flatten() {
                let _ = tx.try_send(entry.path());
            }
        }

        let watcher_self = self.clone();
        tokio::spawn(async move {
            while let Some(path) = rx.recv().await {
                watcher_self.clone().ingest(path).await;
            }
        });

        Ok(watcher)
    }

    async fn ingest(self: Arc<Self>, path: PathBuf) {
        if !path.is_file() {
            return;
        }
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "failed to read notification intent file");
                return;
            }
        };
        let intent: NotificationIntent = match serde_json::from_str(&content) {
            Ok(intent) => intent,
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "failed to parse notification intent");
                return;
            }
        };

        let batch_key = intent
            .context_id
            .clone()
            .unwrap_or_else(|| format!("channel:{}", intent.channel));

        {
            let mut pending = self.pending.lock().await;
            let is_new_batch = !pending.contains_key(&batch_key);
            pending.entry(batch_key.clone()).or_default().push((path, intent));
            if !is_new_batch {
                return;
            }
        }

        let watcher_self = self.clone();
        let window = self.batch_window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            watcher_self.flush(&batch_key).await;
        });
    }

    async fn flush(&self, batch_key: &str) {
        let batch = {
            let mut pending = self.pending.lock().await;
            pending.remove(batch_key).unwrap_or_default()
        };
        if batch.is_empty() {
            return;
        }

        // Summary (if any) must open the thread before any detail/reply/ack
        // rides on it; everything else keeps arrival order.
        let mut ordered = batch;
        ordered.sort_by_key(|(_, intent)| !matches!(intent.kind, NotificationKind::Summary));

        // Two intents dropped twice within the same batch window must yield
        // at most one outbound message (spec §8 idempotence law). A later
        // duplicate's file is removed here rather than posted, since the
        // batch already carries an equivalent send.
        let (ordered, stale) = dedupe_by_content(ordered);
        for path in stale {
            let _ = tokio::fs::remove_file(&path).await;
        }

        let channel = ordered[0].1.channel.clone();
        let context_id = ordered.iter().find_map(|(_, i)| i.context_id.clone());

        let mut thread_ts = ordered
            .iter()
            .find_map(|(_, i)| i.thread_key.clone())
            .or_else(|| context_id.as_deref().and_then(|c| self.thread_index.lookup(c)).map(|r| r.root_ts));

        for (path, intent) in &ordered {
            let result = self
                .chat
                .post(
                    &host_caller(),
                    PostMessageRequest { channel: channel.clone(), text: intent.body.clone(), thread_ts: thread_ts.clone() },
                )
                .await;

            match result {
                Ok(response) => {
                    if thread_ts.is_none() {
                        thread_ts = Some(response.ts.clone());
                        if let Some(context_id) = &context_id {
                            if let Err(error) = self.thread_index.record_root(context_id, &channel, &response.ts) {
                                tracing::warn!(%error, context_id = %context_id, "failed to persist thread root");
                            }
                        }
                    }
                    let _ = tokio::fs::remove_file(path).await;
                }
                Err(error) => {
                    tracing::warn!(%error, channel = %channel, "notification send failed");
                    if let Some(context_id) = &context_id {
                        let _ = self
                            .tasks
                            .append_note(context_id, &format!("chat send failed: {error}"))
                            .await;
                    }
                    // Leave the file in place; the next filesystem event (or
                    // the next daemon start's initial sweep) will retry it.
                    return;
                }
            }
        }

        if let Some(context_id) = &context_id {
            let _ = self.tasks.append_note(context_id, "notification delivered").await;
        }
        self.event_sink.emit(crate::SystemEvent::NotificationQueued {
            context_id: context_id.as_deref().map(std::sync::Arc::from),
            thread_key: thread_ts,
        });
    }
}

/// Split a batch into the intents to actually post and the paths of later
/// duplicates to discard, keeping the first occurrence of each
/// (kind, channel, thread_key, context_id, body) tuple (spec §8 idempotence
/// law). Kept separate from `flush` so the dedup rule can be tested without
/// a live chat client.
fn dedupe_by_content(
    ordered: Vec<(PathBuf, NotificationIntent)>,
) -> (Vec<(PathBuf, NotificationIntent)>, Vec<PathBuf>) {
    let mut seen = std::collections::HashSet::new();
    let mut kept = Vec::with_capacity(ordered.len());
    let mut stale = Vec::new();
    for (path, intent) in ordered {
        let key = (intent.kind, intent.channel.clone(), intent.thread_key.clone(), intent.context_id.clone(), intent.body.clone());
        if seen.insert(key) {
            kept.push((path, intent));
        } else {
            stale.push(path);
        }
    }
    (kept, stale)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent(kind: NotificationKind, body: &str, context_id: Option<&str>) -> NotificationIntent {
        NotificationIntent {
            kind,
            channel: "C123".to_string(),
            thread_key: None,
            body: body.to_string(),
            context_id: context_id.map(str::to_string),
        }
    }

    #[test]
    fn identical_intents_dropped_twice_dedupe_to_one() {
        let ordered = vec![
            (PathBuf::from("a.json"), intent(NotificationKind::Summary, "same body", Some("thread-1"))),
            (PathBuf::from("b.json"), intent(NotificationKind::Summary, "same body", Some("thread-1"))),
        ];

        let (kept, stale) = dedupe_by_content(ordered);

        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].0, PathBuf::from("a.json"));
        assert_eq!(stale, vec![PathBuf::from("b.json")]);
    }

    #[test]
    fn distinct_intents_in_one_batch_all_survive() {
        let ordered = vec![
            (PathBuf::from("a.json"), intent(NotificationKind::Summary, "summary body", Some("thread-1"))),
            (PathBuf::from("b.json"), intent(NotificationKind::Detail, "detail body", Some("thread-1"))),
        ];

        let (kept, stale) = dedupe_by_content(ordered);

        assert_eq!(kept.len(), 2);
        assert!(stale.is_empty());
    }
}
