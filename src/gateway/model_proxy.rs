//! Model proxy (spec §4.1 "Model proxy", §6 `/v1/messages` and
//! `/v1/messages/count_tokens`): forwards chat/messages and token-count
//! requests to the external model API, injecting either an OAuth bearer or
//! an API key, streaming SSE responses back without buffering, and in
//! private mode stripping the blocked generic web tools before forwarding.

use crate::gateway::allowlist::is_private_mode_blocked_tool;
use crate::gateway::server::AppState;
use crate::gateway::state::GatewayState;
use crate::secrets::ModelCredential;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::Value;

/// Request headers never forwarded upstream: anything that would leak or
/// conflict with the gateway's own injected credential (spec §4.1: "Forward
/// all headers except a fixed auth-related blocklist").
const AUTH_HEADER_BLOCKLIST: &[&str] = &[
    "authorization",
    "x-api-key",
    "host",
    "content-length",
    "connection",
];

pub async fn messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    proxy_model_request(&state.gateway, "/v1/messages", headers, body).await
}

pub async fn count_tokens(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    proxy_model_request(&state.gateway, "/v1/messages/count_tokens", headers, body).await
}

async fn proxy_model_request(
    state: &GatewayState,
    path: &str,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let secrets = state.deps.secrets.current();
    let Some(credential) = secrets.model_credential() else {
        return (
            StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({
                "error": "unauthorized",
                "message": "no model API credential configured",
            })),
        )
            .into_response();
    };

    let body = if state.is_private_mode() {
        strip_blocked_tools(&body)
    } else {
        body.to_vec()
    };

    let url = format!(
        "{}{path}",
        state.deps.config.gateway.model_base_url.trim_end_matches('/')
    );
    let mut request = state.http_client.post(&url).body(body);

    for (name, value) in headers.iter() {
        let lower = name.as_str().to_ascii_lowercase();
        if AUTH_HEADER_BLOCKLIST.contains(&lower.as_str()) {
            continue;
        }
        request = request.header(name.clone(), value.clone());
    }

    request = match credential {
        ModelCredential::OAuth(token) => request.bearer_auth(token),
        ModelCredential::ApiKey(key) => request.header("x-api-key", key),
    };

    let upstream = match request.send().await {
        Ok(response) => response,
        Err(error) => {
            tracing::warn!(%error, path, "model proxy upstream request failed");
            return (
                StatusCode::BAD_GATEWAY,
                axum::Json(serde_json::json!({
                    "error": "upstream_5xx",
                    "message": error.to_string(),
                })),
            )
                .into_response();
        }
    };

    let status = upstream.status();
    let mut response_builder = Response::builder().status(status);
    for (name, value) in upstream.headers().iter() {
        // `request_id` header must pass through verbatim even on error
        // responses (spec §4.1: "Pass through error responses verbatim,
        // including the upstream request id header").
        if let Some(header_name) = HeaderName::from_bytes(name.as_str().as_bytes()).ok() {
            if let Ok(header_value) = HeaderValue::from_bytes(value.as_bytes()) {
                response_builder = response_builder.header(header_name, header_value);
            }
        }
    }

    let stream = upstream.bytes_stream();
    match response_builder.body(Body::from_stream(stream)) {
        Ok(response) => response,
        Err(error) => {
            tracing::error!(%error, "failed to construct streamed model proxy response");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
        }
    }
}

/// Remove any tool declaration named `web_search`/`web_fetch` (any casing)
/// from the request body's `tools` array (spec §4.1, §8 boundary behavior).
/// Logs the redaction. Falls back to forwarding the body unchanged if it
/// isn't valid JSON or has no `tools` array to touch.
fn strip_blocked_tools(body: &[u8]) -> Vec<u8> {
    let Ok(mut value) = serde_json::from_slice::<Value>(body) else {
        return body.to_vec();
    };

    let Some(tools) = value.get_mut("tools").and_then(Value::as_array_mut) else {
        return body.to_vec();
    };

    let before = tools.len();
    tools.retain(|tool| {
        let name = tool.get("name").and_then(Value::as_str).unwrap_or("");
        !is_private_mode_blocked_tool(name)
    });
    let removed = before - tools.len();

    if removed > 0 {
        tracing::info!(removed, "stripped private-mode-blocked tools from model request");
    }

    serde_json::to_vec(&value).unwrap_or_else(|_| body.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_web_search_and_web_fetch_case_insensitively() {
        let body = serde_json::json!({
            "tools": [
                {"name": "Web_Search"},
                {"name": "read_file"},
                {"name": "WEB_FETCH"},
            ]
        });
        let stripped = strip_blocked_tools(body.to_string().as_bytes());
        let parsed: Value = serde_json::from_slice(&stripped).unwrap();
        let names: Vec<&str> = parsed["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["read_file"]);
    }

    #[test]
    fn leaves_body_without_tools_untouched() {
        let body = serde_json::json!({"messages": []});
        let stripped = strip_blocked_tools(body.to_string().as_bytes());
        assert_eq!(stripped, body.to_string().into_bytes());
    }
}
