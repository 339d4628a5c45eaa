//! Event dispatcher (spec §4.5): translates timed syncs, chat inbound events,
//! code-hosting polling, and manual invocations into one-shot agent runs
//! through the container lifecycle manager. Grounded on `cron::scheduler`'s
//! timer-loop/execution-guard/circuit-breaker shape, generalized from "one
//! fixed prompt per job" to "a dispatch table keyed by trigger kind" (spec §9
//! "Dynamic dispatch of analyzers": adding an analyzer is adding a row).

mod debounce;
mod poll;

pub use debounce::PrCommentDebouncer;
pub use poll::{PrEventKind, ReviewComment};

use crate::container::lifecycle::ExecInput;
use crate::container::{ContainerManager, RepoMount};
use crate::error::{ContainerError, Result};
use crate::policy::RepoRole;
use crate::{pr_context_id, thread_context_id, ContainerId, ContextId, RepoFullName, RunOrigin};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// The trigger-kind half of a dispatch-table row (spec §4.5 Trigger sources).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerKind {
    Timer,
    Chat,
    PrUpdated,
    PrReviewComments,
    FailedCheck,
    Manual,
}

impl TriggerKind {
    /// Purely scheduled maintenance triggers fail fast with a low-priority
    /// notification rather than starting a container (spec §4.5 Dispatch).
    fn is_user_facing(self) -> bool {
        !matches!(self, TriggerKind::Timer)
    }
}

/// One fully-resolved trigger occurrence, carrying whatever payload its kind
/// needs to build an analyzer invocation.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// The hourly documentation-like bulk-sync run completed; `summary` is
    /// the added/changed/removed digest (spec §4.6) to hand the analyzer.
    Timer { summary: String },
    /// A chat-derived drop-zone file landed in `incoming/` or `responses/`.
    Chat { context_id: ContextId, repo: RepoFullName, drop_path: PathBuf },
    /// A PR was opened or updated.
    PrUpdated { repo: RepoFullName, pr_number: u64 },
    /// One or more review comments, already debounced into a single batch.
    PrReviewComments { repo: RepoFullName, pr_number: u64, comments: Vec<ReviewComment> },
    /// A check run transitioned to failed.
    FailedCheck { repo: RepoFullName, pr_number: u64, check_name: String },
    /// A local, authenticated caller asked for a specific analyzer by name.
    Manual { analyzer: String, args: Vec<String>, repo: RepoFullName, context_id: Option<ContextId> },
}

impl Trigger {
    fn kind(&self) -> TriggerKind {
        match self {
            Trigger::Timer { .. } => TriggerKind::Timer,
            Trigger::Chat { .. } => TriggerKind::Chat,
            Trigger::PrUpdated { .. } => TriggerKind::PrUpdated,
            Trigger::PrReviewComments { .. } => TriggerKind::PrReviewComments,
            Trigger::FailedCheck { .. } => TriggerKind::FailedCheck,
            Trigger::Manual { .. } => TriggerKind::Manual,
        }
    }

    /// The repository this trigger names, if any. Purely scheduled triggers
    /// (the doc-sync timer) carry no repo of their own — the dispatcher falls
    /// back to the first writable repo in policy (spec §4.5 Dispatch).
    fn repo_hint(&self) -> Option<RepoFullName> {
        match self {
            Trigger::Timer { .. } => None,
            Trigger::Chat { repo, .. } => Some(repo.clone()),
            Trigger::PrUpdated { repo, .. } => Some(repo.clone()),
            Trigger::PrReviewComments { repo, .. } => Some(repo.clone()),
            Trigger::FailedCheck { repo, .. } => Some(repo.clone()),
            Trigger::Manual { repo, .. } => Some(repo.clone()),
        }
    }

    fn context_id(&self) -> ContextId {
        match self {
            Trigger::Timer { .. } => Arc::from("timer-doc-sync"),
            Trigger::Chat { context_id, .. } => context_id.clone(),
            Trigger::PrUpdated { repo, pr_number } => pr_context_id(repo, *pr_number),
            Trigger::PrReviewComments { repo, pr_number, .. } => pr_context_id(repo, *pr_number),
            Trigger::FailedCheck { repo, pr_number, .. } => pr_context_id(repo, *pr_number),
            Trigger::Manual { context_id, .. } => {
                context_id.clone().unwrap_or_else(|| Arc::from(format!("manual-{}", uuid::Uuid::new_v4().simple())))
            }
        }
    }
}

/// A dispatch-table row: trigger kind plus the analyzer script it maps to.
/// New analyzers are added here, not by branching in [`Dispatcher::dispatch`]
/// (spec §9).
struct DispatchRow {
    trigger_kind: TriggerKind,
    script: &'static str,
}

const DISPATCH_TABLE: &[DispatchRow] = &[
    DispatchRow { trigger_kind: TriggerKind::Timer, script: "analyzers/doc-sync-digest.sh" },
    DispatchRow { trigger_kind: TriggerKind::Chat, script: "analyzers/chat-task.sh" },
    DispatchRow { trigger_kind: TriggerKind::PrUpdated, script: "analyzers/pr-review.sh" },
    DispatchRow { trigger_kind: TriggerKind::PrReviewComments, script: "analyzers/pr-review.sh" },
    DispatchRow { trigger_kind: TriggerKind::FailedCheck, script: "analyzers/check-failure.sh" },
    DispatchRow { trigger_kind: TriggerKind::Manual, script: "analyzers/manual.sh" },
];

fn script_for(kind: TriggerKind) -> &'static str {
    DISPATCH_TABLE
        .iter()
        .find(|row| row.trigger_kind == kind)
        .map(|row| row.script)
        .unwrap_or("analyzers/manual.sh")
}

/// Build the argv for a resolved trigger: the script path, then
/// trigger-specific arguments.
fn argv_for(trigger: &Trigger) -> Vec<String> {
    let script = script_for(trigger.kind()).to_string();
    match trigger {
        Trigger::Timer { summary } => vec![script, "--summary".to_string(), summary.clone()],
        Trigger::Chat { drop_path, .. } => vec![script, "--input-path".to_string(), drop_path.display().to_string()],
        Trigger::PrUpdated { repo, pr_number } => {
            vec![script, "--repo".to_string(), repo.to_string(), "--pr".to_string(), pr_number.to_string()]
        }
        Trigger::PrReviewComments { repo, pr_number, comments } => {
            let mut argv = vec![script, "--repo".to_string(), repo.to_string(), "--pr".to_string(), pr_number.to_string()];
            argv.push("--comments".to_string());
            argv.push(poll::format_comments(comments));
            argv
        }
        Trigger::FailedCheck { repo, pr_number, check_name } => {
            vec![
                script,
                "--repo".to_string(),
                repo.to_string(),
                "--pr".to_string(),
                pr_number.to_string(),
                "--check".to_string(),
                check_name.clone(),
            ]
        }
        Trigger::Manual { analyzer, args, .. } => {
            let mut argv = vec![analyzer.clone()];
            argv.extend(args.iter().cloned());
            argv
        }
    }
}

/// Whether a failed dispatch attempt is worth retrying with bounded backoff
/// (spec §4.5 Retries): container-not-ready and transient gateway/chat
/// failures are; content-level analyzer failures are not.
fn is_retryable(error: &crate::Error) -> bool {
    match error {
        crate::Error::Container(ContainerError::NoActiveContainer) => true,
        crate::Error::Container(ContainerError::StartFailed(_)) => true,
        crate::Error::Gateway(gateway_error) => gateway_error.is_retryable(),
        _ => false,
    }
}

/// Translates triggers into container-lifecycle-manager exec calls.
pub struct Dispatcher {
    deps: crate::HostDeps,
    containers: Arc<ContainerManager>,
    pr_debounce: Arc<PrCommentDebouncer>,
}

impl Dispatcher {
    pub fn new(deps: crate::HostDeps, containers: Arc<ContainerManager>) -> Arc<Self> {
        let debounce_window = Duration::from_secs(deps.config.dispatcher.pr_comment_debounce_secs);
        Arc::new(Self { deps, containers, pr_debounce: Arc::new(PrCommentDebouncer::new(debounce_window)) })
    }

    /// Start the background trigger sources: the hourly doc-sync timer, the
    /// code-hosting poll timer, and the chat drop-zone watcher. Returns once
    /// everything is spawned; each source runs for the life of the process.
    pub fn spawn(self: Arc<Self>) -> anyhow::Result<notify::RecommendedWatcher> {
        self.clone().spawn_doc_sync_timer();
        self.clone().spawn_code_host_poll_timer();
        poll::spawn_chat_watcher(self.clone())
    }

    fn spawn_doc_sync_timer(self: Arc<Self>) {
        let interval_secs = self.deps.config.dispatcher.doc_sync_interval_secs;
        let running = Arc::new(AtomicBool::new(false));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if running.swap(true, Ordering::AcqRel) {
                    tracing::debug!("doc-sync still running, skipping this tick");
                    continue;
                }
                let dispatcher = self.clone();
                let guard = running.clone();
                tokio::spawn(async move {
                    let _reset = DropGuard(guard);
                    match crate::sync::docs::run_once(&dispatcher.deps).await {
                        Ok(summary) if summary.is_empty() => {
                            tracing::debug!("doc-sync produced no changes, skipping analyzer dispatch");
                        }
                        Ok(summary) => {
                            if let Err(error) = dispatcher.dispatch_with_retry(Trigger::Timer { summary: summary.describe() }).await {
                                tracing::warn!(%error, "doc-sync post-sync analyzer dispatch failed");
                            }
                        }
                        Err(error) => tracing::warn!(%error, "doc-sync bulk pull failed"),
                    }
                });
            }
        });
    }

    fn spawn_code_host_poll_timer(self: Arc<Self>) {
        let interval_secs = self.deps.config.dispatcher.code_poll_interval_secs;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(error) = poll::poll_once(&self).await {
                    tracing::warn!(%error, "code-hosting poll failed");
                }
            }
        });
    }

    /// Dispatch one trigger with the bounded retry policy from spec §4.5.
    pub async fn dispatch_with_retry(&self, trigger: Trigger) -> Result<()> {
        let max_retries = self.deps.config.dispatcher.max_retries;
        let mut attempt = 0;
        loop {
            match self.dispatch(trigger.clone()).await {
                Ok(()) => return Ok(()),
                Err(error) if attempt < max_retries && is_retryable(&error) => {
                    attempt += 1;
                    let backoff = Duration::from_secs(2u64.saturating_pow(attempt));
                    tracing::warn!(%error, attempt, "retryable dispatch failure, backing off");
                    tokio::time::sleep(backoff).await;
                }
                Err(error) => {
                    self.notify_failure(&trigger, &error).await;
                    return Err(error);
                }
            }
        }
    }

    /// Resolve one trigger against the dispatch table and run it through the
    /// container lifecycle manager (spec §4.5 Dispatch).
    async fn dispatch(&self, trigger: Trigger) -> Result<()> {
        let context_id = trigger.context_id();
        let argv = argv_for(&trigger);

        let container_id = match self.containers.any_active().await {
            Some(id) => id,
            None if trigger.kind().is_user_facing() => {
                let repo = self.resolve_repo(&trigger)?;
                self.start_session_for(&repo).await?
            }
            None => {
                tracing::warn!(context_id = %context_id, "no active container for scheduled trigger, failing fast");
                return Err(ContainerError::NoActiveContainer.into());
            }
        };
        let repo = self.resolve_repo(&trigger)?;

        let run_id = uuid::Uuid::new_v4();
        let origin = run_origin_for(trigger.kind());
        self.deps.emit(crate::SystemEvent::RunStarted {
            run_id,
            origin,
            context_id: Some(context_id.clone()),
            container_id: container_id.clone(),
        });

        let outcome = self
            .containers
            .exec_in_running(ExecInput {
                container_id: container_id.clone(),
                argv,
                run_id,
                origin,
                context_id: Some(context_id.clone()),
                thread_ts: None,
                repo_full_name: repo,
            })
            .await?;

        if outcome.timed_out {
            self.deps.emit(crate::SystemEvent::RunTimedOut { run_id, context_id: Some(context_id.clone()) });
        } else {
            self.deps.emit(crate::SystemEvent::RunCompleted {
                run_id,
                context_id: Some(context_id.clone()),
                exit_status: outcome.exit_status,
            });
        }

        Ok(())
    }

    /// Resolve the repository a trigger operates against, falling back to
    /// the first writable repo in policy for triggers with no repo of their
    /// own (spec §4.5 Dispatch, §9 "first writable repo" default).
    fn resolve_repo(&self, trigger: &Trigger) -> Result<RepoFullName> {
        if let Some(repo) = trigger.repo_hint() {
            return Ok(repo);
        }
        self.deps
            .policy
            .writable_repos()
            .into_iter()
            .next()
            .map(Arc::from)
            .ok_or_else(|| ContainerError::StartFailed("no writable repository configured".to_string()).into())
    }

    async fn start_session_for(&self, repo: &RepoFullName) -> Result<ContainerId> {
        let role = self
            .deps
            .policy
            .lookup(repo)
            .map(|record| record.role)
            .unwrap_or(RepoRole::Readable);
        let remote_url = format!("https://github.com/{repo}.git");

        self.containers
            .start_session(crate::container::StartSessionInput {
                user_identity: self.deps.policy.github_username(),
                repos: vec![RepoMount { full_name: repo.clone(), role, remote_url }],
                private_mode: false,
                initial_prompt: None,
            })
            .await
    }

    /// A failure that exhausted retries (or was never retryable) surfaces as
    /// a notification in the associated thread, never a crash loop (spec §7,
    /// §4.5 Retries).
    async fn notify_failure(&self, trigger: &Trigger, error: &crate::Error) {
        let context_id = trigger.context_id();
        let _ = self.deps.tasks.append_note(&context_id, &format!("analyzer dispatch failed: {error}")).await;

        let severity = if trigger.kind().is_user_facing() { "normal" } else { "low" };
        let intent = crate::chat::NotificationIntent {
            kind: crate::chat::NotificationKind::Reply,
            channel: String::new(),
            thread_key: None,
            body: format!("[{severity}] analyzer dispatch failed for {context_id}: {error}"),
            context_id: Some(context_id.to_string()),
        };
        if let Ok(content) = serde_json::to_string_pretty(&intent) {
            let path = self.deps.config.notifications_dir().join(format!("dispatch-failure-{}.json", uuid::Uuid::new_v4().simple()));
            if let Err(io_error) = std::fs::write(&path, content) {
                tracing::warn!(%io_error, "failed to write dispatch-failure notification intent");
            }
        }
    }
}

fn run_origin_for(kind: TriggerKind) -> RunOrigin {
    match kind {
        TriggerKind::Timer => RunOrigin::Timer,
        TriggerKind::Chat => RunOrigin::Chat,
        TriggerKind::PrUpdated | TriggerKind::PrReviewComments | TriggerKind::FailedCheck => RunOrigin::PrEvent,
        TriggerKind::Manual => RunOrigin::Manual,
    }
}

/// Clears the execution-lock flag on drop so a panicking tick doesn't wedge
/// the timer loop forever (mirrors `cron::scheduler::ExecutionGuard`).
struct DropGuard(Arc<AtomicBool>);

impl Drop for DropGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub(crate) fn thread_context_id_from_ts(ts: &str) -> ContextId {
    thread_context_id(ts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_table_covers_every_trigger_kind() {
        for kind in [
            TriggerKind::Timer,
            TriggerKind::Chat,
            TriggerKind::PrUpdated,
            TriggerKind::PrReviewComments,
            TriggerKind::FailedCheck,
            TriggerKind::Manual,
        ] {
            assert_ne!(script_for(kind), "");
        }
    }

    #[test]
    fn only_timer_trigger_is_not_user_facing() {
        assert!(!TriggerKind::Timer.is_user_facing());
        assert!(TriggerKind::Chat.is_user_facing());
        assert!(TriggerKind::PrUpdated.is_user_facing());
        assert!(TriggerKind::Manual.is_user_facing());
    }
}
