//! Shared state for the gateway's HTTP handlers.

use crate::config::Config;
use crate::gateway::ratelimit::ChatPacer;
use crate::gateway::reqlog::RequestLog;
use crate::gateway::worktree::WorktreeIndex;
use crate::policy::PolicyStore;
use crate::secrets::SecretsStore;
use crate::ContainerId;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Repository visibility as seen by the code-hosting API, cached with a
/// bounded TTL (spec §4.1 "Code-hosting proxy").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoVisibility {
    Public,
    Private,
}

/// Installation access token cache entry (spec §4.1 Credential selection).
#[derive(Clone)]
pub struct CachedInstallationToken {
    pub token: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Clone)]
pub struct GatewayState {
    pub deps: crate::HostDeps,
    pub http_client: reqwest::Client,

    /// Positive visibility results, bounded TTL.
    pub visibility_cache: moka::future::Cache<String, RepoVisibility>,
    /// Not-found / error visibility results, shorter bounded TTL.
    pub visibility_negative_cache: moka::future::Cache<String, ()>,

    pub worktrees: Arc<RwLock<WorktreeIndex>>,
    pub active_containers: Arc<RwLock<HashSet<ContainerId>>>,
    pub chat_pacer: Arc<ChatPacer>,
    pub installation_tokens: Arc<RwLock<std::collections::HashMap<String, CachedInstallationToken>>>,
    pub reqlog: RequestLog,

    /// `true` when the session that owns this gateway instance was started
    /// with `private_mode`, gating visibility-blocked reads and stripped
    /// model-request tools (spec §4.1).
    pub private_mode: Arc<std::sync::atomic::AtomicBool>,
}

impl GatewayState {
    /// `worktrees`, `active_containers`, and `private_mode` are shared with
    /// the [`crate::container::ContainerManager`] constructed alongside this
    /// state so a session start (or exec) is visible to the gateway's HTTP
    /// handlers without a second source of truth (spec §4.1, §4.3).
    pub fn new(
        deps: crate::HostDeps,
        config: &Config,
        worktrees: Arc<RwLock<WorktreeIndex>>,
        active_containers: Arc<RwLock<HashSet<ContainerId>>>,
        private_mode: Arc<std::sync::atomic::AtomicBool>,
    ) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.gateway.upstream_timeout_secs))
            .build()?;

        let visibility_cache = moka::future::Cache::builder()
            .time_to_live(std::time::Duration::from_secs(
                config.gateway.visibility_cache_ttl_secs,
            ))
            .build();
        let visibility_negative_cache = moka::future::Cache::builder()
            .time_to_live(std::time::Duration::from_secs(
                config.gateway.visibility_cache_negative_ttl_secs,
            ))
            .build();

        let reqlog = RequestLog::new(deps.sqlite_pool.clone());

        Ok(Self {
            deps,
            http_client,
            visibility_cache,
            visibility_negative_cache,
            worktrees,
            active_containers,
            chat_pacer: Arc::new(ChatPacer::new(config.gateway.chat_pace_per_second)),
            installation_tokens: Arc::new(RwLock::new(std::collections::HashMap::new())),
            reqlog,
            private_mode,
        })
    }

    pub fn is_private_mode(&self) -> bool {
        self.private_mode.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub async fn cached_visibility(&self, repo: &str) -> Option<RepoVisibility> {
        if let Some(v) = self.visibility_cache.get(repo).await {
            return Some(v);
        }
        if self.visibility_negative_cache.get(repo).await.is_some() {
            return None;
        }
        None
    }

    pub async fn cache_visibility(&self, repo: &str, visibility: Option<RepoVisibility>) {
        match visibility {
            Some(v) => self.visibility_cache.insert(repo.to_string(), v).await,
            None => self.visibility_negative_cache.insert(repo.to_string(), ()).await,
        }
    }
}
