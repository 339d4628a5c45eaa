//! Configuration loading: the single on-disk location for non-secret settings
//! (§6 Configuration files). Secrets live in [`crate::secrets`]; repository
//! policy lives in [`crate::policy`]. This module owns directory layout,
//! telemetry, and the tunables for the gateway, chat bridge, and dispatcher.

use crate::error::{ConfigError, Result};
use anyhow::Context as _;
use std::path::{Path, PathBuf};

/// Top-level jib configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root instance directory: `~/.jib` unless overridden.
    pub instance_dir: PathBuf,

    /// Gateway sidecar tunables.
    pub gateway: GatewayConfig,

    /// Chat bridge tunables.
    pub chat: ChatConfig,

    /// Event dispatcher tunables.
    pub dispatcher: DispatcherConfig,

    /// Container lifecycle manager tunables.
    pub container: ContainerConfig,

    /// Telemetry / tracing export.
    pub telemetry: TelemetryConfig,
}

/// Gateway sidecar configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Internal-network-only bind address for the gateway HTTP API.
    pub bind: std::net::SocketAddr,

    /// Base URL of the external model API to proxy to.
    pub model_base_url: String,

    /// Branch names that can never be pushed to or merged (§4.1 Allow-lists).
    pub protected_branches: Vec<String>,

    /// Maximum chat sends per second, per (channel, thread_key) (§5 Rate limits).
    pub chat_pace_per_second: f64,

    /// Bounded TTL for the code-hosting visibility cache (§4.1 Code-hosting proxy).
    pub visibility_cache_ttl_secs: u64,

    /// TTL for negative (not-found / error) visibility cache entries.
    pub visibility_cache_negative_ttl_secs: u64,

    /// Default timeout applied to every outbound call the gateway makes.
    pub upstream_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8733".parse().expect("valid default bind addr"),
            model_base_url: "https://api.anthropic.com".to_string(),
            protected_branches: vec!["main".to_string(), "master".to_string()],
            chat_pace_per_second: 1.0,
            visibility_cache_ttl_secs: 300,
            visibility_cache_negative_ttl_secs: 30,
            upstream_timeout_secs: 30,
        }
    }
}

/// Chat bridge configuration.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Self-DM task prefix, matched case-insensitively (§4.4).
    pub self_dm_prefix: String,

    /// Optional whitelist restricting senders by user id.
    pub allowed_users: Option<Vec<String>>,

    /// Outbound notification batch window (§4.4 Outbound path).
    pub batch_window_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            self_dm_prefix: "claude:".to_string(),
            allowed_users: None,
            batch_window_secs: 30,
        }
    }
}

/// Event dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// PR review-comment debounce window (§4.5 Debouncing).
    pub pr_comment_debounce_secs: u64,

    /// Cadence for the bulk-documentation sync timer (§4.6).
    pub doc_sync_interval_secs: u64,

    /// Cadence for code-hosting event polling.
    pub code_poll_interval_secs: u64,

    /// Maximum wall time for an analyzer exec before it is killed (§4.5 Retries).
    pub analyzer_timeout_secs: u64,

    /// Bounded retry attempts for retryable analyzer failures.
    pub max_retries: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            pr_comment_debounce_secs: 60,
            doc_sync_interval_secs: 3600,
            code_poll_interval_secs: 120,
            analyzer_timeout_secs: 900,
            max_retries: 3,
        }
    }
}

/// Container lifecycle manager configuration (§4.3).
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Docker image tag sandbox containers run from.
    pub image: String,

    /// Workdir root inside the container that holds mounted repositories.
    pub container_workdir_root: PathBuf,

    /// Path (host side) to the `jib-git-wrapper` binary, bound read-only
    /// over `/usr/bin/git` in every container (§4.2).
    pub git_wrapper_path: PathBuf,

    /// Path (host side) to the `jib-gh-wrapper` binary, bound read-only over
    /// `/usr/bin/gh` in every container (§4.2).
    pub gh_wrapper_path: PathBuf,

    /// Gateway URL as seen from inside the container's network namespace.
    pub gateway_internal_url: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: "jib-sandbox:latest".to_string(),
            container_workdir_root: PathBuf::from("/workdir"),
            git_wrapper_path: PathBuf::from("/usr/local/libexec/jib/jib-git-wrapper"),
            gh_wrapper_path: PathBuf::from("/usr/local/libexec/jib/jib-gh-wrapper"),
            gateway_internal_url: "http://jib-gateway.internal:8733".to_string(),
        }
    }
}

/// OpenTelemetry export configuration, read the same way across every
/// long-lived host process.
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub otlp_endpoint: Option<String>,
    pub otlp_headers: std::collections::HashMap<String, String>,
    pub sample_rate: f64,
}

impl Config {
    /// Default instance directory, honoring `JIB_HOME` before falling back to
    /// the platform data directory.
    pub fn default_instance_dir() -> PathBuf {
        if let Ok(custom) = std::env::var("JIB_HOME") {
            return PathBuf::from(custom);
        }
        dirs::data_dir()
            .map(|d| d.join("jib"))
            .unwrap_or_else(|| PathBuf::from("./data"))
    }

    /// Load configuration from environment and the on-disk instance directory.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_instance_dir())
    }

    pub fn load_from(instance_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(instance_dir).with_context(|| {
            format!(
                "failed to create instance directory: {}",
                instance_dir.display()
            )
        })?;
        for sub in [
            "sharing/notifications",
            "sharing/incoming",
            "sharing/responses",
            "sharing/staged-changes",
            "sharing/staged-changes/.archive",
            "sharing/tracking",
            "sharing/container-logs",
            "docs-mirror",
        ] {
            std::fs::create_dir_all(instance_dir.join(sub))
                .with_context(|| format!("failed to create {sub} directory"))?;
        }

        let gateway = GatewayConfig {
            bind: std::env::var("JIB_GATEWAY_BIND")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(|| GatewayConfig::default().bind),
            model_base_url: std::env::var("JIB_MODEL_BASE_URL")
                .unwrap_or_else(|_| GatewayConfig::default().model_base_url),
            ..GatewayConfig::default()
        };

        let telemetry = TelemetryConfig {
            service_name: "jib-gatewayd".to_string(),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            otlp_headers: std::collections::HashMap::new(),
            sample_rate: std::env::var("JIB_TRACE_SAMPLE_RATE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1.0),
        };

        Ok(Self {
            instance_dir: instance_dir.to_path_buf(),
            gateway,
            chat: ChatConfig::default(),
            dispatcher: DispatcherConfig::default(),
            container: ContainerConfig::default(),
            telemetry,
        })
    }

    pub fn config_dir(&self) -> PathBuf {
        self.instance_dir.join("config")
    }

    pub fn repositories_path(&self) -> PathBuf {
        self.config_dir().join("repositories.yaml")
    }

    pub fn secrets_path(&self) -> PathBuf {
        self.config_dir().join("secrets.env")
    }

    pub fn context_filters_path(&self) -> PathBuf {
        self.config_dir().join("context-filters.yaml")
    }

    pub fn sqlite_path(&self) -> PathBuf {
        self.instance_dir.join("jib.db")
    }

    pub fn sharing_dir(&self) -> PathBuf {
        self.instance_dir.join("sharing")
    }

    pub fn notifications_dir(&self) -> PathBuf {
        self.sharing_dir().join("notifications")
    }

    pub fn incoming_dir(&self) -> PathBuf {
        self.sharing_dir().join("incoming")
    }

    pub fn responses_dir(&self) -> PathBuf {
        self.sharing_dir().join("responses")
    }

    pub fn staged_changes_dir(&self) -> PathBuf {
        self.sharing_dir().join("staged-changes")
    }

    pub fn staged_changes_archive_dir(&self) -> PathBuf {
        self.staged_changes_dir().join(".archive")
    }

    pub fn tracking_dir(&self) -> PathBuf {
        self.sharing_dir().join("tracking")
    }

    pub fn container_logs_dir(&self) -> PathBuf {
        self.sharing_dir().join("container-logs")
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.instance_dir.join("worktrees")
    }

    /// Local mirror written by the bulk-documentation sync adapter (spec
    /// §4.6 "write a stable local file path containing the current body
    /// plus metadata"). Owned by `sync::docs`, not read by anything else.
    pub fn docs_mirror_dir(&self) -> PathBuf {
        self.instance_dir.join("docs-mirror")
    }
}

/// Raised when a loader can't find a config value that has no sane default.
pub fn missing_key(key: &str) -> ConfigError {
    ConfigError::MissingKey(key.to_string())
}
