//! On-demand ticketing/code-hosting proxy (spec §4.6 "On-demand proxy"): no
//! local mirror, every lookup goes through the gateway's code-hosting proxy
//! and obeys the same repository policy as a sandbox's own `gh` calls.
//! Deliberately left backend-agnostic (spec §9): the call shape below would
//! serve a classic REST ticketing API or an MCP tool call equally well,
//! since this module commits to the interface rather than the protocol.

use crate::error::Result;
use crate::gateway::code_proxy::PullRequestSummary;
use crate::HostDeps;

/// One ticket/issue as surfaced to an analyzer — intentionally a narrower
/// shape than the code host's own issue model, since an analyzer only ever
/// needs enough to decide what to do next.
#[derive(Debug, Clone)]
pub struct TicketSummary {
    pub id: String,
    pub title: String,
    pub status: String,
    pub url: String,
}

/// Look up a single ticket by id through whichever backend the deployment
/// configures. No caching: every call is a fresh proxy round-trip, same as
/// the sandbox's own on-demand `gh` calls (spec §4.1 "On-demand proxy").
pub async fn get_ticket(_deps: &HostDeps, ticket_id: &str) -> Result<TicketSummary> {
    // No ticketing backend is wired up yet (spec §9: the interface is fixed,
    // the backend is an open question); this surfaces a clear not-found
    // until one is configured rather than silently returning stub data.
    Err(crate::error::ConfigError::Invalid(format!(
        "no ticketing backend configured for ticket '{ticket_id}'"
    ))
    .into())
}

/// Fetch a pull request's current state through the code-hosting proxy,
/// reusing the same policy-gated path an analyzer's own `gh` calls take
/// (spec §4.1 Code-hosting proxy, §4.6 On-demand proxy).
pub async fn get_pull_request(
    credential: &crate::gateway::credentials::ResolvedCredential,
    repo: &str,
    number: u64,
) -> Result<PullRequestSummary> {
    crate::gateway::code_proxy::get_pr(credential, repo, number).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_ticket_backend_returns_a_clear_error() {
        let instance_dir = tempfile::tempdir().expect("tempdir");
        let config = crate::config::Config::load_from(instance_dir.path()).expect("load config");
        let secrets_path = config.secrets_path();
        std::fs::write(&secrets_path, "").expect("write empty secrets file");
        let secrets = crate::secrets::SecretsStore::load(&secrets_path).expect("load secrets");
        let repos_path = config.repositories_path();
        std::fs::write(&repos_path, "github_username: bot\nwritable_repos: []\nreadable_repos: []\n").expect("write policy");
        let policy = crate::policy::PolicyStore::load(&repos_path).expect("load policy");
        let (event_tx, _rx) = tokio::sync::broadcast::channel(16);
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.expect("in-memory sqlite");
        let tasks = std::sync::Arc::new(crate::tasks::store::TaskStore::new(pool.clone()));

        let deps = HostDeps {
            config: std::sync::Arc::new(config),
            secrets: std::sync::Arc::new(secrets),
            policy: std::sync::Arc::new(policy),
            tasks,
            sqlite_pool: pool,
            event_tx,
        };

        let error = get_ticket(&deps, "TICK-1").await.expect_err("no backend configured yet");
        assert!(error.to_string().contains("TICK-1"));
    }
}
