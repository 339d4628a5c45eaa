//! jib: the security and coordination fabric for an autonomous software-engineering
//! agent platform. A trusted host synchronizes external state, bridges a chat
//! workspace to the agent, launches short-lived sandboxed containers, and mediates
//! every network- and git-touching operation the sandbox attempts.

pub mod chat;
pub mod config;
pub mod container;
pub mod daemon;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod git;
pub mod gateway;
pub mod policy;
pub mod secrets;
pub mod staging;
pub mod sync;
pub mod tasks;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Container identifier: assigned when the container lifecycle manager starts
/// a sandbox, threaded through every gateway request that container makes.
pub type ContainerId = Arc<str>;

/// Stable task key shared by chat threads and pull requests (§3 Context record).
pub type ContextId = Arc<str>;

/// Opaque identifier assigned by the task registry on creation.
pub type InternalId = Arc<str>;

/// Correlation id for one container run (§3 Run correlation).
pub type RunId = uuid::Uuid;

/// Full name of a repository as known to the code host, e.g. `org/repo-x`.
pub type RepoFullName = Arc<str>;

/// Where a [`ContextId`] came from, mirrored into context labels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContextSource {
    Thread,
    PullRequest,
}

/// Build a `thread-<ts>` context id from a message timestamp.
pub fn thread_context_id(ts: &str) -> ContextId {
    Arc::from(format!("thread-{ts}"))
}

/// Build a `pr-<repo>-<number>` context id.
pub fn pr_context_id(repo_full_name: &str, number: u64) -> ContextId {
    Arc::from(format!("pr-{repo_full_name}-{number}"))
}

/// Where a run was triggered from (§3 Run correlation, §4.5 Trigger sources).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOrigin {
    Timer,
    Chat,
    PrEvent,
    Manual,
}

impl std::fmt::Display for RunOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunOrigin::Timer => "timer",
            RunOrigin::Chat => "chat",
            RunOrigin::PrEvent => "pr-event",
            RunOrigin::Manual => "manual",
        };
        write!(f, "{s}")
    }
}

/// Internal pub/sub events the host-side services exchange. Distinct from the
/// HTTP API and the chat/staging drop zones — this is process-local
/// coordination only (e.g. the dispatcher telling the chat bridge a run
/// finished), never serialized across the sandbox boundary.
#[derive(Debug, Clone)]
pub enum SystemEvent {
    RunStarted {
        run_id: RunId,
        origin: RunOrigin,
        context_id: Option<ContextId>,
        container_id: ContainerId,
    },
    RunCompleted {
        run_id: RunId,
        context_id: Option<ContextId>,
        exit_status: Option<i32>,
    },
    RunTimedOut {
        run_id: RunId,
        context_id: Option<ContextId>,
    },
    NotificationQueued {
        context_id: Option<ContextId>,
        thread_key: Option<String>,
    },
    WorktreeSwept {
        container_id: ContainerId,
        repo: RepoFullName,
        had_uncommitted_changes: bool,
    },
}

/// Shared dependency bundle threaded through every host-side service.
///
/// Mirrors the "shared dependency bundle" shape common across this codebase's
/// processes: every long-lived task gets a cheap clone of the same handles
/// rather than reaching for ambient globals.
#[derive(Clone)]
pub struct HostDeps {
    pub config: Arc<config::Config>,
    pub secrets: Arc<secrets::SecretsStore>,
    pub policy: Arc<policy::PolicyStore>,
    pub tasks: Arc<tasks::store::TaskStore>,
    pub sqlite_pool: sqlx::SqlitePool,
    pub event_tx: tokio::sync::broadcast::Sender<SystemEvent>,
}

impl HostDeps {
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SystemEvent> {
        self.event_tx.subscribe()
    }

    pub fn emit(&self, event: SystemEvent) {
        // A broadcast channel with no receivers errors on send; that's fine,
        // it just means nothing is currently listening.
        let _ = self.event_tx.send(event);
    }
}
