//! Credential selection (spec §4.1 "Credential selection"): per request,
//! resolve the GitHub App installation token, the fallback PAT, or the
//! incognito personal token, and set commit attribution accordingly. The
//! container never receives any of these values — this module's outputs
//! stay inside the gateway process.

use crate::error::{GatewayError, Result};
use crate::gateway::state::{CachedInstallationToken, GatewayState};
use crate::policy::{AuthMode, IncognitoIdentity, RepositoryPolicyRecord};
use crate::secrets::SecretBundle;
use anyhow::Context as _;

/// The resolved credential + attribution for one code-hosting or git
/// operation against a specific repository.
#[derive(Debug, Clone)]
pub struct ResolvedCredential {
    pub token: String,
    pub git_author: Option<GitAuthor>,
}

#[derive(Debug, Clone)]
pub struct GitAuthor {
    pub name: String,
    pub email: String,
}

/// Installation tokens are valid for one hour from GitHub; refresh a little
/// early to avoid racing expiry mid-request.
const INSTALLATION_TOKEN_SAFETY_MARGIN_SECS: i64 = 60;

/// Resolve credentials for `repo` per spec §4.1:
/// 1. `auth_mode=app` → mint (or read cached) installation access token.
/// 2. `auth_mode=pat` → the fallback token.
/// 3. `auth_mode=incognito` → the personal token, author set to the
///    incognito identity.
pub async fn resolve(
    state: &GatewayState,
    policy_record: &RepositoryPolicyRecord,
    secrets: &SecretBundle,
    incognito: Option<&IncognitoIdentity>,
) -> Result<ResolvedCredential> {
    match policy_record.auth_mode {
        AuthMode::App => {
            let token = mint_or_cached_installation_token(state, secrets).await?;
            Ok(ResolvedCredential { token, git_author: None })
        }
        AuthMode::Pat => {
            let token = secrets
                .code_host_token
                .clone()
                .ok_or_else(|| GatewayError::Unauthorized("no fallback code-hosting token configured".to_string()))?;
            Ok(ResolvedCredential { token, git_author: None })
        }
        AuthMode::Incognito => {
            let token = secrets.incognito_personal_token.clone().ok_or_else(|| {
                GatewayError::Unauthorized("no incognito personal token configured".to_string())
            })?;
            let identity = incognito.ok_or_else(|| {
                GatewayError::Unauthorized("repository uses incognito auth but no identity is configured".to_string())
            })?;
            Ok(ResolvedCredential {
                token,
                git_author: Some(GitAuthor {
                    name: identity.commit_name.clone(),
                    email: identity.commit_email.clone(),
                }),
            })
        }
    }
}

async fn mint_or_cached_installation_token(state: &GatewayState, secrets: &SecretBundle) -> Result<String> {
    let app_id = secrets
        .code_host_app_id
        .clone()
        .ok_or_else(|| GatewayError::Unauthorized("no code-hosting app id configured".to_string()))?;
    let installation_id = secrets
        .code_host_installation_id
        .clone()
        .ok_or_else(|| GatewayError::Unauthorized("no code-hosting installation id configured".to_string()))?;
    let private_key = secrets
        .code_host_private_key
        .clone()
        .ok_or_else(|| GatewayError::Unauthorized("no code-hosting app private key configured".to_string()))?;

    {
        let cache = state.installation_tokens.read().await;
        if let Some(cached) = cache.get(&installation_id) {
            let margin = chrono::Duration::seconds(INSTALLATION_TOKEN_SAFETY_MARGIN_SECS);
            if cached.expires_at - margin > chrono::Utc::now() {
                return Ok(cached.token.clone());
            }
        }
    }

    let (token, expires_at) = mint_installation_token(&app_id, &private_key, &installation_id)
        .await
        .map_err(|error| GatewayError::Unauthorized(format!("failed to mint installation token: {error}")))?;

    let mut cache = state.installation_tokens.write().await;
    cache.insert(
        installation_id,
        CachedInstallationToken {
            token: token.clone(),
            expires_at,
        },
    );

    Ok(token)
}

/// Mint a fresh installation access token via GitHub's App JWT flow.
async fn mint_installation_token(
    app_id: &str,
    private_key_pem: &[u8],
    installation_id: &str,
) -> anyhow::Result<(String, chrono::DateTime<chrono::Utc>)> {
    let app_id: u64 = app_id.parse().context("CODE_HOST_APP_ID is not numeric")?;
    let installation_id: u64 = installation_id
        .parse()
        .context("CODE_HOST_INSTALLATION_ID is not numeric")?;
    let key = jsonwebtoken::EncodingKey::from_rsa_pem(private_key_pem)
        .context("failed to parse GitHub App private key as PEM")?;

    let octocrab = octocrab::Octocrab::builder()
        .app(octocrab::models::AppId(app_id), key)
        .build()
        .context("failed to build App-authenticated octocrab client")?;

    let (_client, token) = octocrab
        .installation_and_token(octocrab::models::InstallationId(installation_id))
        .await
        .context("failed to exchange App JWT for an installation access token")?;

    // GitHub installation tokens are valid for one hour from issuance;
    // octocrab's SecretString doesn't carry the upstream expiry back, so we
    // conservatively track our own hour-from-now clock.
    let expires_at = chrono::Utc::now() + chrono::Duration::hours(1);
    Ok((token.expose_secret().to_string(), expires_at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{AuthMode, RepoRole};

    fn repo(auth_mode: AuthMode) -> RepositoryPolicyRecord {
        RepositoryPolicyRecord {
            full_name: "org/repo-x".to_string(),
            role: RepoRole::Writable,
            auth_mode,
            default_reviewer: None,
        }
    }

    #[tokio::test]
    async fn pat_mode_uses_fallback_token() {
        let state = test_state();
        let secrets = SecretBundle {
            code_host_token: Some("ghp_fallback".to_string()),
            ..Default::default()
        };
        let resolved = resolve(&state, &repo(AuthMode::Pat), &secrets, None)
            .await
            .expect("pat resolution should succeed");
        assert_eq!(resolved.token, "ghp_fallback");
        assert!(resolved.git_author.is_none());
    }

    #[tokio::test]
    async fn incognito_mode_requires_identity() {
        let state = test_state();
        let secrets = SecretBundle {
            incognito_personal_token: Some("ghp_personal".to_string()),
            ..Default::default()
        };
        let error = resolve(&state, &repo(AuthMode::Incognito), &secrets, None)
            .await
            .unwrap_err();
        assert!(error.to_string().contains("unauthorized"));
    }

    #[tokio::test]
    async fn incognito_mode_sets_commit_author() {
        let state = test_state();
        let secrets = SecretBundle {
            incognito_personal_token: Some("ghp_personal".to_string()),
            ..Default::default()
        };
        let identity = IncognitoIdentity {
            user_handle: "botuser".to_string(),
            commit_name: "Bot User".to_string(),
            commit_email: "bot@example.com".to_string(),
        };
        let resolved = resolve(&state, &repo(AuthMode::Incognito), &secrets, Some(&identity))
            .await
            .expect("incognito resolution should succeed");
        assert_eq!(resolved.token, "ghp_personal");
        assert_eq!(resolved.git_author.unwrap().email, "bot@example.com");
    }

    fn test_state() -> GatewayState {
        let (tx, _rx) = tokio::sync::broadcast::channel(8);
        let config = crate::config::Config::load_from(
            &tempfile::tempdir().expect("tempdir").keep(),
        )
        .expect("config should load");
        let deps = crate::HostDeps {
            config: std::sync::Arc::new(config.clone()),
            secrets: std::sync::Arc::new(
                crate::secrets::SecretsStore::load(&{
                    let path = config.secrets_path();
                    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                    std::fs::write(&path, "").unwrap();
                    path
                })
                .expect("secrets should load"),
            ),
            policy: std::sync::Arc::new({
                let path = config.repositories_path();
                std::fs::write(&path, "github_username: bot\n").unwrap();
                crate::policy::PolicyStore::load(&path).expect("policy should load")
            }),
            tasks: std::sync::Arc::new(crate::tasks::store::TaskStore::new(
                sqlx::SqlitePool::connect_lazy("sqlite::memory:").expect("lazy pool"),
            )),
            sqlite_pool: sqlx::SqlitePool::connect_lazy("sqlite::memory:").expect("lazy pool"),
            event_tx: tx,
        };
        GatewayState::new(
            deps,
            &config,
            std::sync::Arc::new(tokio::sync::RwLock::new(crate::gateway::worktree::WorktreeIndex::default())),
            std::sync::Arc::new(tokio::sync::RwLock::new(std::collections::HashSet::new())),
            std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
        )
        .expect("gateway state should build")
    }
}
