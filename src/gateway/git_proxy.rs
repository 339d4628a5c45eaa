//! Git-over-network proxy and local-git-exec (spec §4.1 "Git-over-network
//! proxy", "Local git exec", §6 `/git/*`). Implements the push state
//! machine from spec §4.1:
//!
//! ```text
//! INIT → AUTHORIZE (branch ownership + policy)
//!      → (deny) REJECTED (terminal)
//!      → (allow) AUTH_TOKEN (mint or read cache)
//!      → EXECUTE (invoke underlying git push with injected credentials)
//!      → (success) ACCEPTED (terminal)
//!      → (retryable failure) AUTH_TOKEN (refresh once) → EXECUTE → ACCEPTED or REJECTED
//!      → (non-retryable) FAILED (terminal)
//! ```

use crate::error::{GatewayError, Result};
use crate::gateway::allowlist::{self, network_git_allowlist};
use crate::gateway::credentials::ResolvedCredential;
use crate::gateway::state::GatewayState;
use crate::gateway::worktree;
use crate::policy::PolicyStore;
use crate::ContainerId;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

#[derive(Debug, Deserialize)]
pub struct NetworkGitRequest {
    pub container_id: ContainerId,
    pub repo: String,
    pub refspec: String,
    pub subcommand: String,
}

#[derive(Debug, Serialize)]
pub struct NetworkGitResponse {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Deserialize)]
pub struct LocalGitRequest {
    pub container_id: ContainerId,
    pub repo: String,
    pub argv: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct LocalGitResponse {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Execute a network git operation (`push`/`fetch`/`pull`/`ls-remote`)
/// following the push state machine. Non-push subcommands skip the
/// branch-ownership and protected-branch checks, which only apply to
/// writes.
pub async fn execute(
    state: &GatewayState,
    policy: &PolicyStore,
    req: NetworkGitRequest,
) -> Result<NetworkGitResponse> {
    let mut argv = vec![req.subcommand.clone()];

    // AUTHORIZE
    if req.subcommand == "push" {
        if worktree::is_protected(&req.refspec, &state.deps.config.gateway.protected_branches) {
            log_and_return_err(
                state,
                &req.container_id,
                "git.push",
                &req.repo,
                GatewayError::ProtectedBranch { branch: req.refspec.clone() },
            )
            .await?;
        }

        match worktree::owning_container_id(&req.refspec) {
            Some(owner) if owner == req.container_id.as_ref() => {}
            _ => {
                log_and_return_err(
                    state,
                    &req.container_id,
                    "git.push",
                    &req.repo,
                    GatewayError::BranchNotOwned {
                        branch: req.refspec.clone(),
                        container_id: req.container_id.to_string(),
                    },
                )
                .await?;
            }
        }
    }

    allowlist::validate(&argv, network_git_allowlist())?;

    let record = policy
        .lookup(&req.repo)
        .ok_or_else(|| GatewayError::NotAllowed(format!("repository '{}' is not in policy", req.repo)))?;

    // AUTH_TOKEN
    let secrets = state.deps.secrets.current();
    let incognito = policy.incognito_identity();
    let mut credential = crate::gateway::credentials::resolve(state, &record, &secrets, incognito.as_ref()).await?;

    argv.push(req.refspec.clone());

    // EXECUTE, with one retry on a retryable upstream failure
    let store_path = worktree::shared_store_path(&state.deps.config.worktrees_dir(), &req.repo);
    let mut attempt = run_authenticated_git(&store_path, &argv, &credential).await;

    if let Err(ref error) = attempt {
        if is_retryable_git_failure(error) {
            credential = refresh_credential(state, policy, &record, &secrets, incognito.as_ref()).await?;
            attempt = run_authenticated_git(&store_path, &argv, &credential).await;
        }
    }

    match attempt {
        Ok(response) => {
            state
                .reqlog
                .record(&req.container_id, &format!("git.{}", req.subcommand), &req.repo, "accepted")
                .await;
            Ok(response)
        }
        Err(error) => {
            state
                .reqlog
                .record(&req.container_id, &format!("git.{}", req.subcommand), &req.repo, "failed")
                .await;
            Err(error)
        }
    }
}

async fn refresh_credential(
    state: &GatewayState,
    _policy: &PolicyStore,
    record: &crate::policy::RepositoryPolicyRecord,
    secrets: &crate::secrets::SecretBundle,
    incognito: Option<&crate::policy::IncognitoIdentity>,
) -> Result<ResolvedCredential> {
    // Installation tokens are cached by the credentials module; clearing the
    // cache entry before re-resolving forces a fresh mint.
    if let Some(app_id) = &secrets.code_host_installation_id {
        state.installation_tokens.write().await.remove(app_id);
    }
    crate::gateway::credentials::resolve(state, record, secrets, incognito).await
}

fn is_retryable_git_failure(error: &crate::Error) -> bool {
    matches!(
        error,
        crate::Error::Gateway(GatewayError::Upstream5xx { .. }) | crate::Error::Gateway(GatewayError::Timeout(_))
    )
}

async fn run_authenticated_git(
    store_path: &std::path::Path,
    argv: &[String],
    credential: &ResolvedCredential,
) -> Result<NetworkGitResponse> {
    let mut command = Command::new("git");
    command.current_dir(store_path).args(argv);

    // Credential injection via a disposable askpass-style env var rather than
    // embedding the token in the refspec URL, so it never appears in process
    // listings or shell history on the host.
    command.env("GIT_ASKPASS", "true");
    command.env("GIT_HTTP_EXTRAHEADER", format!("Authorization: Basic {}", encode_basic_auth(&credential.token)));

    if let Some(author) = &credential.git_author {
        command.env("GIT_AUTHOR_NAME", &author.name);
        command.env("GIT_AUTHOR_EMAIL", &author.email);
        command.env("GIT_COMMITTER_NAME", &author.name);
        command.env("GIT_COMMITTER_EMAIL", &author.email);
    }

    let output = command
        .output()
        .await
        .map_err(|error| GatewayError::Upstream5xx { status: 502, body: error.to_string() })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let kind = if output.status.code().is_none() {
            GatewayError::Timeout(stderr)
        } else {
            GatewayError::Upstream4xx { status: 1, body: stderr }
        };
        return Err(kind.into());
    }

    Ok(NetworkGitResponse {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

fn encode_basic_auth(token: &str) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(format!("x-access-token:{token}"))
}

/// Local-git-exec (spec §4.1 "Local git exec", §4.2): runs inside the
/// container's own worktree on the shared storage, never injects
/// credentials. Validated against [`allowlist::local_git_allowlist`].
pub async fn exec_local(state: &GatewayState, req: LocalGitRequest) -> Result<LocalGitResponse> {
    allowlist::validate(&req.argv, allowlist::local_git_allowlist())?;

    let worktrees = state.worktrees.read().await;
    let record = worktrees
        .get(&req.container_id, &req.repo.as_str().into())
        .cloned()
        .ok_or_else(|| GatewayError::NotAllowed(format!("no worktree for {} / {}", req.container_id, req.repo)))?;
    drop(worktrees);

    let output = Command::new("git")
        .current_dir(&record.working_dir_path)
        .args(&req.argv)
        .output()
        .await
        .map_err(|error| GatewayError::Upstream5xx { status: 502, body: error.to_string() })?;

    Ok(LocalGitResponse {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

async fn log_and_return_err(
    state: &GatewayState,
    container_id: &ContainerId,
    operation: &str,
    repo: &str,
    error: GatewayError,
) -> Result<()> {
    state.reqlog.record(container_id, operation, repo, error.kind()).await;
    Err(error.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_basic_auth_is_stable() {
        let encoded = encode_basic_auth("tok123");
        assert!(!encoded.is_empty());
        assert_ne!(encoded, "tok123");
    }
}
