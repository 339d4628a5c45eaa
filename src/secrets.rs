//! The secret bundle (spec §3): chat, code-hosting, and model credentials.
//! Lives only on the trusted side, is read mtime-watched for hot reload, and
//! never transits the sandbox boundary. Modeled on this codebase's
//! `ArcSwap`-backed credential reload in `llm::manager::LlmManager`.

use crate::error::{ConfigError, Result};
use anyhow::Context as _;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The secret bundle loaded from `config/secrets.env`.
///
/// Deliberately has no `Serialize` impl and a redacting `Debug` impl: this
/// struct's fields must never be logged or echoed back to a caller.
#[derive(Clone, Default)]
pub struct SecretBundle {
    pub chat_bot_token: Option<String>,
    pub chat_socket_token: Option<String>,
    pub code_host_token: Option<String>,
    pub code_host_app_id: Option<String>,
    pub code_host_installation_id: Option<String>,
    pub code_host_private_key: Option<Vec<u8>>,
    pub incognito_personal_token: Option<String>,
    pub model_api_key: Option<String>,
    pub model_oauth_token: Option<String>,
}

impl std::fmt::Debug for SecretBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretBundle")
            .field("chat_bot_token", &self.chat_bot_token.as_ref().map(|_| "<redacted>"))
            .field("chat_socket_token", &self.chat_socket_token.as_ref().map(|_| "<redacted>"))
            .field("code_host_token", &self.code_host_token.as_ref().map(|_| "<redacted>"))
            .field("code_host_app_id", &self.code_host_app_id)
            .field("code_host_installation_id", &self.code_host_installation_id)
            .field(
                "code_host_private_key",
                &self.code_host_private_key.as_ref().map(|_| "<redacted>"),
            )
            .field(
                "incognito_personal_token",
                &self.incognito_personal_token.as_ref().map(|_| "<redacted>"),
            )
            .field("model_api_key", &self.model_api_key.as_ref().map(|_| "<redacted>"))
            .field("model_oauth_token", &self.model_oauth_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl SecretBundle {
    /// Whether the model path prefers OAuth over an API key (spec §4.1:
    /// "OAuth preferred if both configured").
    pub fn model_credential(&self) -> Option<ModelCredential> {
        if let Some(token) = &self.model_oauth_token {
            return Some(ModelCredential::OAuth(token.clone()));
        }
        self.model_api_key.clone().map(ModelCredential::ApiKey)
    }
}

#[derive(Debug, Clone)]
pub enum ModelCredential {
    OAuth(String),
    ApiKey(String),
}

/// Hot-reloadable handle to the current secret bundle.
pub struct SecretsStore {
    path: PathBuf,
    current: ArcSwap<SecretBundle>,
    last_mtime: std::sync::Mutex<Option<std::time::SystemTime>>,
}

impl SecretsStore {
    /// Load the bundle from `path`, failing fatally (per spec §4.1 "Credential
    /// load failure at startup is fatal") if the file is missing or unreadable.
    pub fn load(path: &Path) -> Result<Self> {
        let (bundle, mtime) = read_bundle(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            current: ArcSwap::from_pointee(bundle),
            last_mtime: std::sync::Mutex::new(Some(mtime)),
        })
    }

    pub fn current(&self) -> Arc<SecretBundle> {
        self.current.load_full()
    }

    /// Re-read the file if its mtime has changed since the last load. Called
    /// at request boundaries in the gateway, per spec §4.1.
    pub fn reload_if_changed(&self) -> Result<bool> {
        let metadata = std::fs::metadata(&self.path)
            .with_context(|| format!("failed to stat secrets file: {}", self.path.display()))?;
        let mtime = metadata
            .modified()
            .context("filesystem does not report mtimes")?;

        let mut guard = self.last_mtime.lock().expect("secrets mtime mutex poisoned");
        if *guard == Some(mtime) {
            return Ok(false);
        }

        let (bundle, _) = read_bundle(&self.path)?;
        self.current.store(Arc::new(bundle));
        *guard = Some(mtime);
        tracing::info!(path = %self.path.display(), "secrets bundle reloaded");
        Ok(true)
    }

    /// Spawn a background watcher that reloads on filesystem change events,
    /// in addition to the request-boundary check in `reload_if_changed`.
    pub fn spawn_watcher(self: Arc<Self>) -> Result<notify::RecommendedWatcher> {
        use notify::{RecursiveMode, Watcher};

        let store = self.clone();
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            if event.is_ok() {
                if let Err(error) = store.reload_if_changed() {
                    tracing::warn!(%error, "failed to reload secrets after filesystem event");
                }
            }
        })
        .context("failed to create secrets file watcher")?;

        watcher
            .watch(&self.path, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch secrets file: {}", self.path.display()))?;

        Ok(watcher)
    }
}

fn read_bundle(path: &Path) -> Result<(SecretBundle, std::time::SystemTime)> {
    let metadata = std::fs::metadata(path).map_err(|source| ConfigError::Load {
        path: path.display().to_string(),
        source: Arc::new(source),
    })?;
    let mtime = metadata
        .modified()
        .context("filesystem does not report mtimes")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = metadata.permissions().mode() & 0o777;
        if mode != 0o600 {
            tracing::warn!(
                path = %path.display(),
                mode = format!("{mode:o}"),
                "secrets.env should be readable only by its owner (mode 600)"
            );
        }
    }

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Load {
        path: path.display().to_string(),
        source: Arc::new(source),
    })?;
    let map = parse_env_file(&content);

    let private_key = match map.get("CODE_HOST_PRIVATE_KEY_PATH") {
        Some(pem_path) if !pem_path.is_empty() => Some(
            std::fs::read(pem_path)
                .with_context(|| format!("failed to read private key at {pem_path}"))?,
        ),
        _ => None,
    };

    Ok((
        SecretBundle {
            chat_bot_token: non_empty(map.get("CHAT_BOT_TOKEN")),
            chat_socket_token: non_empty(map.get("CHAT_SOCKET_TOKEN")),
            code_host_token: non_empty(map.get("CODE_HOST_TOKEN")),
            code_host_app_id: non_empty(map.get("CODE_HOST_APP_ID")),
            code_host_installation_id: non_empty(map.get("CODE_HOST_INSTALLATION_ID")),
            code_host_private_key: private_key,
            incognito_personal_token: non_empty(map.get("INCOGNITO_PERSONAL_TOKEN")),
            model_api_key: non_empty(map.get("MODEL_API_KEY")),
            model_oauth_token: non_empty(map.get("MODEL_OAUTH_TOKEN")),
        },
        mtime,
    ))
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|v| !v.is_empty()).cloned()
}

/// Parse `KEY="value"` / `KEY=value` shell-style lines, ignoring blank lines
/// and `#`-prefixed comments.
fn parse_env_file(content: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, raw_value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim().to_string();
        let value = raw_value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);
        map.insert(key, value.to_string());
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quoted_and_bare_values() {
        let parsed = parse_env_file(
            "CHAT_BOT_TOKEN=\"xoxb-123\"\nMODEL_API_KEY=sk-abc\n# a comment\n\nCODE_HOST_APP_ID='42'\n",
        );
        assert_eq!(parsed.get("CHAT_BOT_TOKEN").map(String::as_str), Some("xoxb-123"));
        assert_eq!(parsed.get("MODEL_API_KEY").map(String::as_str), Some("sk-abc"));
        assert_eq!(parsed.get("CODE_HOST_APP_ID").map(String::as_str), Some("42"));
    }

    #[test]
    fn debug_impl_redacts_secret_values() {
        let bundle = SecretBundle {
            model_api_key: Some("sk-super-secret".to_string()),
            ..Default::default()
        };
        let rendered = format!("{bundle:?}");
        assert!(!rendered.contains("sk-super-secret"));
    }

    #[test]
    fn oauth_preferred_over_api_key() {
        let bundle = SecretBundle {
            model_api_key: Some("sk-key".to_string()),
            model_oauth_token: Some("oauth-token".to_string()),
            ..Default::default()
        };
        match bundle.model_credential() {
            Some(ModelCredential::OAuth(token)) => assert_eq!(token, "oauth-token"),
            other => panic!("expected OAuth credential, got {other:?}"),
        }
    }
}
