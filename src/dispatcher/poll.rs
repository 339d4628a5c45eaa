//! Trigger sources fed into the dispatcher that are not timers: the chat
//! drop-zone watcher and the code-hosting poll loop (spec §4.5 Trigger
//! sources: "chat inbound events", "code-hosting polling ... deduplicated by
//! event id"). The watcher setup is grounded on
//! `chat::outbound::NotificationWatcher::spawn`; the poll loop reuses
//! `gateway::code_proxy`'s octocrab client-per-call convention.

use super::Dispatcher;
use crate::error::{GatewayError, Result};
use crate::RepoFullName;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;

/// A single review comment, carried from the poll loop into a debounced
/// [`super::Trigger::PrReviewComments`] batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewComment {
    pub author: String,
    pub body: String,
    pub path: Option<String>,
}

/// What changed about a PR between two polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrEventKind {
    Opened,
    Updated,
    NewReviewComments,
    CheckFailed,
}

pub(super) fn format_comments(comments: &[ReviewComment]) -> String {
    comments
        .iter()
        .map(|c| match &c.path {
            Some(path) => format!("{} on {}: {}", c.author, path, c.body),
            None => format!("{}: {}", c.author, c.body),
        })
        .collect::<Vec<_>>()
        .join("\n---\n")
}

/// Start the drop-zone watcher for chat-originated triggers. Deliberately a
/// filesystem watch rather than a direct call from [`crate::chat::inbound`]
/// — the chat bridge and the dispatcher agree on a drop format, not on each
/// other's internals, mirroring how the outbound notification path decouples
/// the bridge from whatever wrote the intent file.
pub(super) fn spawn_chat_watcher(dispatcher: Arc<Dispatcher>) -> anyhow::Result<notify::RecommendedWatcher> {
    use notify::{RecursiveMode, Watcher};

    let watch_dir = dispatcher.deps.config.incoming_dir();
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
    .context("failed to create chat drop-zone watcher")?;

    watcher.watch(&watch_dir, RecursiveMode::NonRecursive).context("failed to watch incoming directory")?;

    if let Ok(entries) = std::fs::read_dir(&watch_dir) {
        for entry in entries.flatten() {
            let _ = tx.try_send(entry.path());
        }
    }

    tokio::spawn(async move {
        while let Some(path) = rx.recv().await {
            handle_chat_drop(&dispatcher, &path).await;
        }
    });

    Ok(watcher)
}

#[derive(Debug, Deserialize)]
struct ChatDrop {
    context_id: String,
    repo: String,
}

async fn handle_chat_drop(dispatcher: &Dispatcher, path: &Path) {
    if !path.is_file() {
        return;
    }
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(error) => {
            tracing::warn!(path = %path.display(), %error, "failed to read chat drop");
            return;
        }
    };
    let drop: ChatDrop = match serde_json::from_str(&content) {
        Ok(drop) => drop,
        Err(error) => {
            tracing::warn!(path = %path.display(), %error, "failed to parse chat drop");
            return;
        }
    };

    let trigger = super::Trigger::Chat {
        context_id: Arc::from(drop.context_id),
        repo: Arc::from(drop.repo),
        drop_path: path.to_path_buf(),
    };
    if let Err(error) = dispatcher.dispatch_with_retry(trigger).await {
        tracing::warn!(%error, path = %path.display(), "chat-triggered dispatch failed");
    }
}

/// Persisted "already handled" set for code-hosting events, same atomic
/// write-then-rename shape as `chat::thread_index::ThreadIndex` (spec §4.5
/// "deduplicated by event id").
struct SeenEventIndex {
    path: PathBuf,
    seen: Mutex<HashSet<String>>,
}

impl SeenEventIndex {
    fn load(tracking_dir: &Path) -> Result<Self> {
        let path = tracking_dir.join("code-host-poll-seen.json");
        let seen = if path.exists() {
            let content = std::fs::read_to_string(&path).context("failed to read seen-event index")?;
            serde_json::from_str(&content).context("invalid seen-event index JSON")?
        } else {
            HashSet::new()
        };
        Ok(Self { path, seen: Mutex::new(seen) })
    }

    fn is_new(&self, event_id: &str) -> bool {
        !self.seen.lock().expect("seen-event mutex poisoned").contains(event_id)
    }

    fn mark_seen(&self, event_id: &str) -> Result<()> {
        {
            let mut guard = self.seen.lock().expect("seen-event mutex poisoned");
            guard.insert(event_id.to_string());
        }
        self.flush()
    }

    fn flush(&self) -> Result<()> {
        let seen = self.seen.lock().expect("seen-event mutex poisoned").clone();
        let content = serde_json::to_string_pretty(&seen).context("failed to serialize seen-event index")?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content).context("failed to write seen-event index")?;
        std::fs::rename(&tmp_path, &self.path).context("failed to replace seen-event index")?;
        Ok(())
    }
}

fn octocrab_for(token: &str) -> Result<octocrab::Octocrab> {
    octocrab::OctocrabBuilder::new()
        .personal_token(token.to_string())
        .build()
        .map_err(|error| GatewayError::Upstream5xx { status: 502, body: error.to_string() }.into())
}

/// One code-hosting poll cycle: for every writable repo, list open PRs and
/// their checks, dispatch a trigger for anything not already seen (spec
/// §4.5 Trigger sources, §4.6 "deduplicated by event id").
pub(super) async fn poll_once(dispatcher: &Arc<Dispatcher>) -> Result<()> {
    let secrets = dispatcher.deps.secrets.current();
    let Some(token) = secrets.code_host_token.clone() else {
        tracing::debug!("no code-hosting token configured, skipping poll cycle");
        return Ok(());
    };
    let octocrab = octocrab_for(&token)?;
    let seen = SeenEventIndex::load(&dispatcher.deps.config.tracking_dir())?;

    for repo in dispatcher.deps.policy.writable_repos() {
        if let Err(error) = poll_repo(dispatcher, &octocrab, &seen, Arc::from(repo.as_str())).await {
            tracing::warn!(%error, repo, "code-hosting poll failed for repository");
        }
    }
    Ok(())
}

async fn poll_repo(
    dispatcher: &Arc<Dispatcher>,
    octocrab: &octocrab::Octocrab,
    seen: &SeenEventIndex,
    repo: RepoFullName,
) -> Result<()> {
    let Some((owner, name)) = repo.split_once('/') else {
        return Err(GatewayError::NotAllowed(format!("invalid repository name '{repo}'")).into());
    };

    let page = octocrab
        .pulls(owner, name)
        .list()
        .state(octocrab::params::State::Open)
        .send()
        .await
        .map_err(|error| GatewayError::Upstream4xx { status: 404, body: error.to_string() })?;

    for pr in page.items {
        let pr_number = pr.number;
        let updated_event_id = format!("{repo}#{pr_number}:updated:{}", pr.updated_at.map(|t| t.to_rfc3339()).unwrap_or_default());
        if seen.is_new(&updated_event_id) {
            seen.mark_seen(&updated_event_id)?;
            let trigger = super::Trigger::PrUpdated { repo: repo.clone(), pr_number };
            if let Err(error) = dispatcher.dispatch_with_retry(trigger).await {
                tracing::warn!(%error, repo = %repo, pr_number, "pr-updated dispatch failed");
            }
        }

        poll_review_comments(dispatcher, octocrab, seen, repo.clone(), owner, name, pr_number).await?;
        poll_failed_checks(dispatcher, octocrab, seen, repo.clone(), owner, name, &pr.head.sha).await?;
    }
    Ok(())
}

async fn poll_review_comments(
    dispatcher: &Arc<Dispatcher>,
    octocrab: &octocrab::Octocrab,
    seen: &SeenEventIndex,
    repo: RepoFullName,
    owner: &str,
    name: &str,
    pr_number: u64,
) -> Result<()> {
    let comments = octocrab
        .pulls(owner, name)
        .list_comments(Some(pr_number))
        .send()
        .await
        .map_err(|error| GatewayError::Upstream4xx { status: 404, body: error.to_string() })?;

    for comment in comments.items {
        let event_id = format!("{repo}#{pr_number}:comment:{}", comment.id);
        if !seen.is_new(&event_id) {
            continue;
        }
        seen.mark_seen(&event_id)?;

        let review_comment = ReviewComment {
            author: comment.user.login,
            body: comment.body.unwrap_or_default(),
            path: Some(comment.path),
        };
        dispatcher.pr_debounce.clone().record(dispatcher.clone(), repo.clone(), pr_number, review_comment).await;
    }
    Ok(())
}

async fn poll_failed_checks(
    dispatcher: &Dispatcher,
    octocrab: &octocrab::Octocrab,
    seen: &SeenEventIndex,
    repo: RepoFullName,
    owner: &str,
    name: &str,
    git_ref: &str,
) -> Result<()> {
    let runs = octocrab
        .checks(owner, name)
        .list_check_runs_for_git_ref(octocrab::params::repos::Commitish::from(git_ref.to_string()))
        .send()
        .await
        .map_err(|error| GatewayError::Upstream4xx { status: 404, body: error.to_string() })?;

    for run in runs.check_runs {
        if run.conclusion.as_deref() != Some("failure") {
            continue;
        }
        let event_id = format!("{repo}:check:{}:{}", run.name, run.id);
        if !seen.is_new(&event_id) {
            continue;
        }
        seen.mark_seen(&event_id)?;

        // `pr_number` is not known from a check-suite event alone; the
        // analyzer script resolves it from the commit sha via `gh pr view`.
        let trigger = super::Trigger::FailedCheck { repo: repo.clone(), pr_number: 0, check_name: run.name.clone() };
        if let Err(error) = dispatcher.dispatch_with_retry(trigger).await {
            tracing::warn!(%error, repo = %repo, check = run.name, "failed-check dispatch failed");
        }
    }
    Ok(())
}
