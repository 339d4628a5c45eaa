//! Gateway HTTP API wiring (spec §6): the router for every endpoint the
//! sandbox wrapper binaries call. Internal-network-only; the spec's
//! authorization model is that the request arrives on the sidecar
//! interface at all, so there is no further auth layer here.

use crate::gateway::chat_proxy::{ChatProxy, PostMessageRequest, ReactRequest};
use crate::gateway::code_proxy::{self, CommentRequest, CreatePrRequest, ReviewRequest};
use crate::gateway::git_proxy::{self, LocalGitRequest, NetworkGitRequest};
use crate::gateway::model_proxy;
use crate::gateway::state::GatewayState;
use crate::gateway::worktree;

use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;

/// Shared app state: the gateway state plus the chat proxy, which owns its
/// own Slack client and so is threaded through separately.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<GatewayState>,
    pub chat: Arc<ChatProxy>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages", post(model_proxy::messages))
        .route("/v1/messages/count_tokens", post(model_proxy::count_tokens))
        .route("/chat/post", post(chat_post))
        .route("/chat/reply", post(chat_post))
        .route("/chat/react", post(chat_react))
        .route("/chat/thread", get(chat_thread))
        .route("/chat/users/{id}", get(chat_user))
        .route("/code/pr", post(code_create_pr))
        .route("/code/pr/{n}/comment", post(code_comment))
        .route("/code/pr/{n}/review", post(code_review))
        .route("/code/pr/{n}", get(code_get_pr))
        .route("/code/checks/{git_ref}", get(code_checks))
        .route("/code/tree/{git_ref}", get(code_tree))
        .route("/git/push", post(git_push))
        .route("/git/fetch", post(git_fetch))
        .route("/git/pull", post(git_pull))
        .route("/git/ls-remote", post(git_ls_remote))
        .route("/git/local", post(git_local))
        .route("/worktree", post(worktree_create))
        .route("/worktree/{container_id}/{repo}", delete(worktree_destroy))
        .route("/worktrees", get(worktree_list))
        .route("/api/v1/health", get(health))
        .with_state(state)
}

pub async fn serve(bind: SocketAddr, router: Router) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(%bind, "gateway HTTP API listening");
    axum::serve(listener, router).await?;
    Ok(())
}

fn err_response(error: crate::Error) -> Response {
    let (status, kind, request_id) = match &error {
        crate::Error::Gateway(g) => (status_for(g), g.kind().to_string(), uuid::Uuid::new_v4().to_string()),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal".to_string(), uuid::Uuid::new_v4().to_string()),
    };
    (
        status,
        Json(serde_json::json!({
            "error": kind,
            "message": error.to_string(),
            "request_id": request_id,
        })),
    )
        .into_response()
}

fn status_for(error: &crate::error::GatewayError) -> StatusCode {
    use crate::error::GatewayError as G;
    match error {
        G::NotAllowed(_) => StatusCode::FORBIDDEN,
        G::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        G::BlockedVisibility { .. } => StatusCode::FORBIDDEN,
        G::BranchNotOwned { .. } => StatusCode::FORBIDDEN,
        G::ProtectedBranch { .. } => StatusCode::FORBIDDEN,
        G::Upstream4xx { status, .. } => StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_REQUEST),
        G::Upstream5xx { .. } => StatusCode::BAD_GATEWAY,
        G::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        G::NoActiveContainer(_) => StatusCode::CONFLICT,
        G::Conflict(_) => StatusCode::CONFLICT,
        G::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn chat_post(State(state): State<AppState>, Json(req): Json<ChatPostBody>) -> Response {
    let result = state
        .chat
        .post(
            &req.container_id,
            PostMessageRequest {
                channel: req.channel,
                text: req.text,
                thread_ts: req.thread_ts,
            },
        )
        .await;
    match result {
        Ok(response) => Json(response).into_response(),
        Err(error) => err_response(error),
    }
}

#[derive(serde::Deserialize)]
struct ChatPostBody {
    container_id: crate::ContainerId,
    channel: String,
    text: String,
    thread_ts: Option<String>,
}

async fn chat_react(State(state): State<AppState>, Json(req): Json<ChatReactBody>) -> Response {
    match state
        .chat
        .react(
            &req.container_id,
            ReactRequest { channel: req.channel, ts: req.ts, emoji: req.emoji },
        )
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => err_response(error),
    }
}

#[derive(serde::Deserialize)]
struct ChatReactBody {
    container_id: crate::ContainerId,
    channel: String,
    ts: String,
    emoji: String,
}

#[derive(serde::Deserialize)]
struct ChatThreadQuery {
    container_id: crate::ContainerId,
    channel: String,
    thread_ts: String,
}

async fn chat_thread(State(state): State<AppState>, axum::extract::Query(q): axum::extract::Query<ChatThreadQuery>) -> Response {
    match state.chat.fetch_thread(&q.container_id, &q.channel, &q.thread_ts).await {
        Ok(messages) => Json(messages).into_response(),
        Err(error) => err_response(error),
    }
}

async fn chat_user(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    axum::extract::Query(q): axum::extract::Query<CallerQuery>,
) -> Response {
    match state.chat.get_user_profile(&q.container_id, &id).await {
        Ok(profile) => Json(profile).into_response(),
        Err(error) => err_response(error),
    }
}

#[derive(serde::Deserialize)]
struct CallerQuery {
    container_id: crate::ContainerId,
}

async fn code_create_pr(State(state): State<AppState>, Json(req): Json<CodePrBody>) -> Response {
    let credential = match code_proxy::authorize_write(&state.gateway, &state.gateway.deps.policy, &req.repo).await {
        Ok(c) => c,
        Err(error) => return err_response(error),
    };
    match code_proxy::create_pr(
        &credential,
        CreatePrRequest { repo: req.repo, title: req.title, body: req.body, head: req.head, base: req.base },
    )
    .await
    {
        Ok(pr) => Json(pr).into_response(),
        Err(error) => err_response(error),
    }
}

#[derive(serde::Deserialize)]
struct CodePrBody {
    repo: String,
    title: String,
    body: String,
    head: String,
    base: String,
}

async fn code_get_pr(
    State(state): State<AppState>,
    AxumPath(number): AxumPath<u64>,
    axum::extract::Query(q): axum::extract::Query<RepoQuery>,
) -> Response {
    if let Err(error) = code_proxy::authorize_read(&state.gateway, &state.gateway.deps.policy, &q.repo).await {
        return err_response(error);
    }
    let secrets = state.gateway.deps.secrets.current();
    let Some(record) = state.gateway.deps.policy.lookup(&q.repo) else {
        return err_response(crate::error::GatewayError::NotAllowed(format!("repository '{}' is not in policy", q.repo)).into());
    };
    let incognito = state.gateway.deps.policy.incognito_identity();
    let credential = match crate::gateway::credentials::resolve(&state.gateway, &record, &secrets, incognito.as_ref()).await {
        Ok(c) => c,
        Err(error) => return err_response(error),
    };
    match code_proxy::get_pr(&credential, &q.repo, number).await {
        Ok(pr) => Json(pr).into_response(),
        Err(error) => err_response(error),
    }
}

#[derive(serde::Deserialize)]
struct RepoQuery {
    repo: String,
}

async fn code_comment(State(state): State<AppState>, AxumPath(number): AxumPath<u64>, Json(req): Json<CommentRequest>) -> Response {
    let credential = match code_proxy::authorize_write(&state.gateway, &state.gateway.deps.policy, &req.repo).await {
        Ok(c) => c,
        Err(error) => return err_response(error),
    };
    match code_proxy::comment(&credential, number, req).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => err_response(error),
    }
}

async fn code_review(State(state): State<AppState>, AxumPath(number): AxumPath<u64>, Json(req): Json<ReviewRequest>) -> Response {
    let credential = match code_proxy::authorize_write(&state.gateway, &state.gateway.deps.policy, &req.repo).await {
        Ok(c) => c,
        Err(error) => return err_response(error),
    };
    match code_proxy::review(&credential, number, req).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => err_response(error),
    }
}

async fn code_checks(
    State(state): State<AppState>,
    AxumPath(git_ref): AxumPath<String>,
    axum::extract::Query(q): axum::extract::Query<RepoQuery>,
) -> Response {
    if let Err(error) = code_proxy::authorize_read(&state.gateway, &state.gateway.deps.policy, &q.repo).await {
        return err_response(error);
    }
    let secrets = state.gateway.deps.secrets.current();
    let Some(record) = state.gateway.deps.policy.lookup(&q.repo) else {
        return err_response(crate::error::GatewayError::NotAllowed(format!("repository '{}' is not in policy", q.repo)).into());
    };
    let incognito = state.gateway.deps.policy.incognito_identity();
    let credential = match crate::gateway::credentials::resolve(&state.gateway, &record, &secrets, incognito.as_ref()).await {
        Ok(c) => c,
        Err(error) => return err_response(error),
    };
    match code_proxy::checks(&credential, &q.repo, &git_ref).await {
        Ok(runs) => Json(runs).into_response(),
        Err(error) => err_response(error),
    }
}

async fn code_tree(
    State(state): State<AppState>,
    AxumPath(git_ref): AxumPath<String>,
    axum::extract::Query(q): axum::extract::Query<RepoQuery>,
) -> Response {
    if let Err(error) = code_proxy::authorize_read(&state.gateway, &state.gateway.deps.policy, &q.repo).await {
        return err_response(error);
    }
    let secrets = state.gateway.deps.secrets.current();
    let Some(record) = state.gateway.deps.policy.lookup(&q.repo) else {
        return err_response(crate::error::GatewayError::NotAllowed(format!("repository '{}' is not in policy", q.repo)).into());
    };
    let incognito = state.gateway.deps.policy.incognito_identity();
    let credential = match crate::gateway::credentials::resolve(&state.gateway, &record, &secrets, incognito.as_ref()).await {
        Ok(c) => c,
        Err(error) => return err_response(error),
    };
    match code_proxy::tree(&credential, &q.repo, &git_ref).await {
        Ok(entries) => Json(entries).into_response(),
        Err(error) => err_response(error),
    }
}

async fn git_push(State(state): State<AppState>, Json(req): Json<NetworkGitRequest>) -> Response {
    git_network(state, "push", req).await
}
async fn git_fetch(State(state): State<AppState>, Json(req): Json<NetworkGitRequest>) -> Response {
    git_network(state, "fetch", req).await
}
async fn git_pull(State(state): State<AppState>, Json(req): Json<NetworkGitRequest>) -> Response {
    git_network(state, "pull", req).await
}
async fn git_ls_remote(State(state): State<AppState>, Json(req): Json<NetworkGitRequest>) -> Response {
    git_network(state, "ls-remote", req).await
}

async fn git_network(state: AppState, subcommand: &str, mut req: NetworkGitRequest) -> Response {
    req.subcommand = subcommand.to_string();
    match git_proxy::execute(&state.gateway, &state.gateway.deps.policy, req).await {
        Ok(response) => Json(response).into_response(),
        Err(error) => err_response(error),
    }
}

async fn git_local(State(state): State<AppState>, Json(req): Json<LocalGitRequest>) -> Response {
    match git_proxy::exec_local(&state.gateway, req).await {
        Ok(response) => Json(response).into_response(),
        Err(error) => err_response(error),
    }
}

async fn worktree_create(State(state): State<AppState>, Json(req): Json<WorktreeCreateBody>) -> Response {
    let store_path = worktree::shared_store_path(&state.gateway.deps.config.worktrees_dir(), &req.repo);
    let working_dir = worktree::container_worktree_path(
        &state.gateway.deps.config.worktrees_dir(),
        &req.repo,
        &req.container_id,
    );

    match worktree::create(&store_path, &working_dir, &req.container_id, &req.repo.as_str().into()).await {
        Ok(record) => {
            state.gateway.worktrees.write().await.insert(record.clone());
            state.gateway.active_containers.write().await.insert(req.container_id.clone());
            Json(WorktreeCreatedResponse { working_dir_path: record.working_dir_path.display().to_string() }).into_response()
        }
        Err(error) => (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()).into_response(),
    }
}

#[derive(serde::Deserialize)]
struct WorktreeCreateBody {
    container_id: crate::ContainerId,
    repo: String,
}

#[derive(Serialize)]
struct WorktreeCreatedResponse {
    working_dir_path: String,
}

async fn worktree_destroy(
    State(state): State<AppState>,
    AxumPath((container_id, repo)): AxumPath<(crate::ContainerId, String)>,
) -> Response {
    let repo_id: crate::RepoFullName = repo.as_str().into();
    let record = {
        let mut worktrees = state.gateway.worktrees.write().await;
        worktrees.remove(&container_id, &repo_id)
    };
    let Some(record) = record else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let store_path = worktree::shared_store_path(&state.gateway.deps.config.worktrees_dir(), &repo);
    match worktree::destroy(&store_path, &record).await {
        Ok(had_uncommitted) => {
            state.gateway.deps.emit(crate::SystemEvent::WorktreeSwept {
                container_id: container_id.clone(),
                repo: repo_id,
                had_uncommitted_changes: had_uncommitted,
            });
            StatusCode::NO_CONTENT.into_response()
        }
        Err(error) => (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()).into_response(),
    }
}

async fn worktree_list(State(state): State<AppState>) -> Response {
    let records: Vec<_> = state
        .gateway
        .worktrees
        .read()
        .await
        .list()
        .into_iter()
        .map(|r| {
            serde_json::json!({
                "container_id": r.container_id,
                "repo_full_name": r.repo_full_name,
                "branch_name": r.branch_name,
                "working_dir_path": r.working_dir_path.display().to_string(),
                "created_at": r.created_at.to_rfc3339(),
            })
        })
        .collect();
    Json(records).into_response()
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    private_mode: bool,
    policy_summary: PolicySummary,
}

#[derive(Serialize)]
struct PolicySummary {
    writable_repo_count: usize,
    github_username: String,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        private_mode: state.gateway.is_private_mode(),
        policy_summary: PolicySummary {
            writable_repo_count: state.gateway.deps.policy.writable_repos().len(),
            github_username: state.gateway.deps.policy.github_username(),
        },
    })
}
