//! Repository policy store (spec §3): the declarative list of writable and
//! readable repositories, per-repo authentication mode, and incognito
//! identity mapping. Read from `config/repositories.yaml`, mutated only by
//! `setup`, hot-reloaded on mtime change the same way `secrets::SecretsStore`
//! reloads the secret bundle.

use crate::error::{ConfigError, Result};
use anyhow::Context as _;
use arc_swap::ArcSwap;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoRole {
    Writable,
    Readable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    App,
    Pat,
    Incognito,
}

/// `{full_name, role, auth_mode, default_reviewer?}` (spec §3).
#[derive(Debug, Clone)]
pub struct RepositoryPolicyRecord {
    pub full_name: String,
    pub role: RepoRole,
    pub auth_mode: AuthMode,
    pub default_reviewer: Option<String>,
}

/// `{user_handle, commit_name, commit_email}`. The personal token for this
/// identity lives in the secret bundle (`INCOGNITO_PERSONAL_TOKEN`), not here
/// — this store never holds credential material.
#[derive(Debug, Clone)]
pub struct IncognitoIdentity {
    pub user_handle: String,
    pub commit_name: String,
    pub commit_email: String,
}

#[derive(Debug, Clone, Default)]
struct PolicySnapshot {
    github_username: String,
    repos: HashMap<String, RepositoryPolicyRecord>,
    incognito: Option<IncognitoIdentity>,
}

#[derive(Deserialize)]
struct RawRepoSettings {
    #[serde(default = "default_auth_mode")]
    auth_mode: AuthMode,
    default_reviewer: Option<String>,
}

fn default_auth_mode() -> AuthMode {
    AuthMode::App
}

#[derive(Deserialize)]
struct RawIncognito {
    github_user: String,
    git_name: String,
    git_email: String,
}

#[derive(Deserialize)]
struct RawRepositoriesConfig {
    #[serde(default)]
    github_username: String,
    #[serde(default)]
    writable_repos: Vec<String>,
    #[serde(default)]
    readable_repos: Vec<String>,
    #[serde(default)]
    repo_settings: HashMap<String, RawRepoSettings>,
    incognito: Option<RawIncognito>,
}

pub struct PolicyStore {
    path: PathBuf,
    current: ArcSwap<PolicySnapshot>,
    last_mtime: std::sync::Mutex<Option<std::time::SystemTime>>,
}

impl PolicyStore {
    pub fn load(path: &Path) -> Result<Self> {
        let (snapshot, mtime) = read_policy(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            current: ArcSwap::from_pointee(snapshot),
            last_mtime: std::sync::Mutex::new(Some(mtime)),
        })
    }

    pub fn reload_if_changed(&self) -> Result<bool> {
        let metadata = std::fs::metadata(&self.path)
            .with_context(|| format!("failed to stat repository policy file: {}", self.path.display()))?;
        let mtime = metadata
            .modified()
            .context("filesystem does not report mtimes")?;

        let mut guard = self.last_mtime.lock().expect("policy mtime mutex poisoned");
        if *guard == Some(mtime) {
            return Ok(false);
        }

        let (snapshot, _) = read_policy(&self.path)?;
        self.current.store(Arc::new(snapshot));
        *guard = Some(mtime);
        tracing::info!(path = %self.path.display(), "repository policy reloaded");
        Ok(true)
    }

    pub fn github_username(&self) -> String {
        self.current.load().github_username.clone()
    }

    pub fn lookup(&self, full_name: &str) -> Option<RepositoryPolicyRecord> {
        self.current.load().repos.get(full_name).cloned()
    }

    pub fn incognito_identity(&self) -> Option<IncognitoIdentity> {
        self.current.load().incognito.clone()
    }

    /// Whether a read against `full_name` is allowed at all: writable and
    /// readable repos both permit reads.
    pub fn is_known_repo(&self, full_name: &str) -> bool {
        self.current.load().repos.contains_key(full_name)
    }

    pub fn writable_repos(&self) -> Vec<String> {
        self.current
            .load()
            .repos
            .values()
            .filter(|r| r.role == RepoRole::Writable)
            .map(|r| r.full_name.clone())
            .collect()
    }

    pub fn readable_repos(&self) -> Vec<String> {
        self.current
            .load()
            .repos
            .values()
            .filter(|r| r.role == RepoRole::Readable)
            .map(|r| r.full_name.clone())
            .collect()
    }

    /// Every repository in policy regardless of role, used by the "start a
    /// session container" CLI path to mount the full configured set (spec
    /// §4.3 "a set of repositories (writable/readable)").
    pub fn all_repos(&self) -> Vec<RepositoryPolicyRecord> {
        self.current.load().repos.values().cloned().collect()
    }
}

fn read_policy(path: &Path) -> Result<(PolicySnapshot, std::time::SystemTime)> {
    let metadata = std::fs::metadata(path).map_err(|source| ConfigError::Load {
        path: path.display().to_string(),
        source: Arc::new(source),
    })?;
    let mtime = metadata
        .modified()
        .context("filesystem does not report mtimes")?;

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Load {
        path: path.display().to_string(),
        source: Arc::new(source),
    })?;
    let raw: RawRepositoriesConfig = serde_yaml::from_str(&content)
        .map_err(|error| ConfigError::Invalid(format!("repositories.yaml: {error}")))?;

    let mut repos = HashMap::new();
    for full_name in &raw.writable_repos {
        insert_repo(&mut repos, &raw, full_name, RepoRole::Writable)?;
    }
    for full_name in &raw.readable_repos {
        insert_repo(&mut repos, &raw, full_name, RepoRole::Readable)?;
    }

    let incognito = raw.incognito.map(|i| IncognitoIdentity {
        user_handle: i.github_user,
        commit_name: i.git_name,
        commit_email: i.git_email,
    });

    let needs_incognito_identity = repos
        .values()
        .any(|r| r.auth_mode == AuthMode::Incognito);
    if needs_incognito_identity && incognito.is_none() {
        return Err(ConfigError::PolicyInvalid(
            "a repository uses auth_mode=incognito but no incognito identity is configured"
                .to_string(),
        )
        .into());
    }

    Ok((
        PolicySnapshot {
            github_username: raw.github_username,
            repos,
            incognito,
        },
        mtime,
    ))
}

fn insert_repo(
    repos: &mut HashMap<String, RepositoryPolicyRecord>,
    raw: &RawRepositoriesConfig,
    full_name: &str,
    role: RepoRole,
) -> Result<()> {
    if repos.contains_key(full_name) {
        return Err(ConfigError::PolicyInvalid(format!(
            "repository '{full_name}' listed more than once across writable_repos/readable_repos"
        ))
        .into());
    }

    let settings = raw.repo_settings.get(full_name);
    repos.insert(
        full_name.to_string(),
        RepositoryPolicyRecord {
            full_name: full_name.to_string(),
            role,
            auth_mode: settings.map(|s| s.auth_mode).unwrap_or(AuthMode::App),
            default_reviewer: settings.and_then(|s| s.default_reviewer.clone()),
        },
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp_yaml(content: &str) -> tempfile::NamedTempFile {
        use std::io::Write as _;
        let mut file = tempfile::NamedTempFile::new().expect("create temp file");
        file.write_all(content.as_bytes()).expect("write temp file");
        file
    }

    #[test]
    fn rejects_duplicate_full_name_across_roles() {
        let file = write_temp_yaml(
            "github_username: bot\nwritable_repos: [\"org/repo-x\"]\nreadable_repos: [\"org/repo-x\"]\n",
        );
        let error = PolicyStore::load(file.path()).expect_err("duplicate repo must be rejected");
        assert!(error.to_string().contains("listed more than once"));
    }

    #[test]
    fn requires_incognito_identity_when_used() {
        let file = write_temp_yaml(
            "github_username: bot\nwritable_repos: [\"org/repo-x\"]\nreadable_repos: []\nrepo_settings:\n  org/repo-x:\n    auth_mode: incognito\n",
        );
        let error = PolicyStore::load(file.path()).expect_err("missing incognito identity must be rejected");
        assert!(error.to_string().contains("incognito identity"));
    }

    #[test]
    fn loads_valid_policy_with_defaults() {
        let file = write_temp_yaml(
            "github_username: bot\nwritable_repos: [\"org/repo-x\"]\nreadable_repos: [\"org/repo-y\"]\n",
        );
        let store = PolicyStore::load(file.path()).expect("valid policy should load");
        let record = store.lookup("org/repo-x").expect("repo-x should be known");
        assert_eq!(record.role, RepoRole::Writable);
        assert_eq!(record.auth_mode, AuthMode::App);
        assert!(store.is_known_repo("org/repo-y"));
    }
}
