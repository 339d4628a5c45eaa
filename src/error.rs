//! Top-level error types for jib.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration and secrets loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: std::sync::Arc<std::io::Error>,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),

    #[error("repository policy violation: {0}")]
    PolicyInvalid(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The typed error kinds the gateway surfaces to its callers (§7).
///
/// These map directly onto the `{error, message, request_id}` JSON body
/// returned by every gateway HTTP endpoint.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("not_allowed: {0}")]
    NotAllowed(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("blocked_visibility: {repo} is public")]
    BlockedVisibility { repo: String },

    #[error("branch_not_owned: branch '{branch}' is not owned by container {container_id}")]
    BranchNotOwned {
        branch: String,
        container_id: String,
    },

    #[error("protected_branch: '{branch}' is protected")]
    ProtectedBranch { branch: String },

    #[error("upstream_4xx: {status}: {body}")]
    Upstream4xx { status: u16, body: String },

    #[error("upstream_5xx: {status}: {body}")]
    Upstream5xx { status: u16, body: String },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("no_active_container: {0}")]
    NoActiveContainer(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal: {request_id}")]
    Internal { request_id: String },
}

impl GatewayError {
    /// The stable string discriminant used in the JSON error body.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::NotAllowed(_) => "not_allowed",
            GatewayError::Unauthorized(_) => "unauthorized",
            GatewayError::BlockedVisibility { .. } => "blocked_visibility",
            GatewayError::BranchNotOwned { .. } => "branch_not_owned",
            GatewayError::ProtectedBranch { .. } => "protected_branch",
            GatewayError::Upstream4xx { .. } => "upstream_4xx",
            GatewayError::Upstream5xx { .. } => "upstream_5xx",
            GatewayError::Timeout(_) => "timeout",
            GatewayError::NoActiveContainer(_) => "no_active_container",
            GatewayError::Conflict(_) => "conflict",
            GatewayError::Internal { .. } => "internal",
        }
    }

    /// Whether a transient failure of this kind is worth retrying internally
    /// before surfacing to the caller (§4.1 Pacing and retry).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Upstream5xx { .. } | GatewayError::Timeout(_)
        )
    }
}

/// Container lifecycle manager errors.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("no active container for this exec request")]
    NoActiveContainer,

    #[error("container {id} not found")]
    NotFound { id: String },

    #[error("failed to start container: {0}")]
    StartFailed(String),

    #[error("exec timed out after {0:?}")]
    ExecTimeout(std::time::Duration),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Staging / merge pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    #[error("conflict: patch did not apply cleanly for '{slug}'")]
    Conflict { slug: String },

    #[error("drop '{slug}' not found")]
    NotFound { slug: String },

    #[error("could not infer target repository for '{slug}'")]
    AmbiguousTarget { slug: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
