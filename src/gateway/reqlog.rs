//! Gateway request log (spec §3 "Gateway request log entry"): an
//! append-only record of every operation the gateway performed, with only
//! non-sensitive argument fragments — never credential material.

use crate::ContainerId;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLogEntry {
    pub ts: String,
    pub container_id: String,
    pub operation: String,
    pub args_allowed_subset: String,
    pub result_code: String,
}

#[derive(Clone)]
pub struct RequestLog {
    pool: SqlitePool,
}

impl RequestLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record one gateway operation. Never call this with secret material in
    /// `args_allowed_subset` — callers pass only the allow-listed argument
    /// fragments already validated by [`super::allowlist`].
    pub async fn record(
        &self,
        container_id: &ContainerId,
        operation: &str,
        args_allowed_subset: &str,
        result_code: &str,
    ) {
        let result = sqlx::query(
            "INSERT INTO request_log (container_id, operation, args_allowed_subset, result_code) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(container_id.as_ref())
        .bind(operation)
        .bind(args_allowed_subset)
        .bind(result_code)
        .execute(&self.pool)
        .await;

        if let Err(error) = result {
            tracing::warn!(%error, operation, "failed to append gateway request log entry");
        }
    }

    pub async fn recent_for_container(
        &self,
        container_id: &ContainerId,
        limit: i64,
    ) -> crate::Result<Vec<RequestLogEntry>> {
        let rows = sqlx::query_as::<_, (String, String, String, String, String)>(
            "SELECT ts, container_id, operation, args_allowed_subset, result_code \
             FROM request_log WHERE container_id = ? ORDER BY ts DESC LIMIT ?",
        )
        .bind(container_id.as_ref())
        .bind(limit.clamp(1, 1000))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(ts, container_id, operation, args_allowed_subset, result_code)| RequestLogEntry {
                ts,
                container_id,
                operation,
                args_allowed_subset,
                result_code,
            })
            .collect())
    }
}
