//! Context record storage (SQLite). A context record is the persistent task
//! key shared by chat threads and pull requests (spec §3): `thread-<ts>` or
//! `pr-<repo>-<number>`, created on first interaction and updated on every
//! subsequent one, including after it has been closed.

use crate::error::Result;
use crate::ContextId;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use sqlx::{Row as _, SqlitePool};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContextStatus {
    Open,
    InProgress,
    Blocked,
    Closed,
    Cancelled,
}

impl ContextStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ContextStatus::Open => "open",
            ContextStatus::InProgress => "in_progress",
            ContextStatus::Blocked => "blocked",
            ContextStatus::Closed => "closed",
            ContextStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(ContextStatus::Open),
            "in_progress" => Some(ContextStatus::InProgress),
            "blocked" => Some(ContextStatus::Blocked),
            "closed" => Some(ContextStatus::Closed),
            "cancelled" => Some(ContextStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for ContextStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single append-only, timestamp-prefixed note on a context record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextNote {
    pub ts: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextRecord {
    pub internal_id: String,
    pub context_id: String,
    pub title: String,
    pub status: ContextStatus,
    pub labels: Vec<String>,
    pub notes: Vec<ContextNote>,
    pub links: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Fields used the first time a context record is created. Ignored on a
/// repeat call for the same `context_id` — creation is idempotent.
#[derive(Debug, Clone)]
pub struct UpsertContextInput {
    pub context_id: ContextId,
    pub title: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a context record for `context_id` if none exists yet; otherwise
    /// return the existing one unchanged. Matches spec §3's idempotent-create
    /// and spec §8 invariant 4 (exactly one record per accepted context_id).
    pub async fn get_or_create(&self, input: UpsertContextInput) -> Result<ContextRecord> {
        if let Some(existing) = self.get(&input.context_id).await? {
            return Ok(existing);
        }

        let internal_id = uuid::Uuid::new_v4().to_string();
        let labels_json =
            serde_json::to_string(&input.labels).context("failed to serialize labels")?;

        let insert_result = sqlx::query(
            r#"
            INSERT INTO contexts (internal_id, context_id, title, status, labels, notes, links)
            VALUES (?, ?, ?, ?, ?, '[]', '[]')
            "#,
        )
        .bind(&internal_id)
        .bind(input.context_id.as_ref())
        .bind(&input.title)
        .bind(ContextStatus::Open.as_str())
        .bind(&labels_json)
        .execute(&self.pool)
        .await;

        match insert_result {
            Ok(_) => {}
            Err(sqlx::Error::Database(ref db_error))
                if db_error.code().as_deref() == Some("2067") =>
            {
                // Another caller created the same context_id concurrently;
                // creation must stay idempotent, so fall through and read it.
                tracing::debug!(context_id = %input.context_id, "context_id collision on create, reading existing record");
            }
            Err(error) => return Err(anyhow::anyhow!("failed to insert context record: {error}").into()),
        }

        self.get(&input.context_id)
            .await?
            .context("context record inserted but not found")
            .map_err(Into::into)
    }

    pub async fn get(&self, context_id: &str) -> Result<Option<ContextRecord>> {
        let row = sqlx::query(
            "SELECT internal_id, context_id, title, status, labels, notes, links, created_at, updated_at \
             FROM contexts WHERE context_id = ?",
        )
        .bind(context_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch context record")?;

        row.map(context_from_row).transpose()
    }

    pub async fn get_by_internal_id(&self, internal_id: &str) -> Result<Option<ContextRecord>> {
        let row = sqlx::query(
            "SELECT internal_id, context_id, title, status, labels, notes, links, created_at, updated_at \
             FROM contexts WHERE internal_id = ?",
        )
        .bind(internal_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch context record by internal id")?;

        row.map(context_from_row).transpose()
    }

    /// Append a note. Allowed regardless of current status — a closed record
    /// must still accept and surface new notes (spec §4.4).
    pub async fn append_note(&self, context_id: &str, body: &str) -> Result<Option<ContextRecord>> {
        let Some(current) = self.get(context_id).await? else {
            return Ok(None);
        };

        let mut notes = current.notes;
        notes.push(ContextNote {
            ts: chrono::Utc::now().to_rfc3339(),
            body: body.to_string(),
        });
        let notes_json = serde_json::to_string(&notes).context("failed to serialize notes")?;

        sqlx::query(
            "UPDATE contexts SET notes = ?, updated_at = datetime('now') WHERE context_id = ?",
        )
        .bind(notes_json)
        .bind(context_id)
        .execute(&self.pool)
        .await
        .context("failed to append context note")?;

        self.get(context_id).await
    }

    pub async fn set_status(
        &self,
        context_id: &str,
        status: ContextStatus,
    ) -> Result<Option<ContextRecord>> {
        let result = sqlx::query(
            "UPDATE contexts SET status = ?, updated_at = datetime('now') WHERE context_id = ?",
        )
        .bind(status.as_str())
        .bind(context_id)
        .execute(&self.pool)
        .await
        .context("failed to update context status")?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get(context_id).await
    }

    pub async fn add_label(&self, context_id: &str, label: &str) -> Result<Option<ContextRecord>> {
        let Some(current) = self.get(context_id).await? else {
            return Ok(None);
        };
        if current.labels.iter().any(|l| l == label) {
            return Ok(Some(current));
        }

        let mut labels = current.labels;
        labels.push(label.to_string());
        let labels_json = serde_json::to_string(&labels).context("failed to serialize labels")?;

        sqlx::query(
            "UPDATE contexts SET labels = ?, updated_at = datetime('now') WHERE context_id = ?",
        )
        .bind(labels_json)
        .bind(context_id)
        .execute(&self.pool)
        .await
        .context("failed to add context label")?;

        self.get(context_id).await
    }

    /// Link this context record to another one (e.g. a chat thread's task
    /// linking to the pull request the notification was about, spec §4.4).
    pub async fn add_link(&self, context_id: &str, other_context_id: &str) -> Result<Option<ContextRecord>> {
        let Some(current) = self.get(context_id).await? else {
            return Ok(None);
        };
        if current.links.iter().any(|l| l == other_context_id) {
            return Ok(Some(current));
        }

        let mut links = current.links;
        links.push(other_context_id.to_string());
        let links_json = serde_json::to_string(&links).context("failed to serialize links")?;

        sqlx::query(
            "UPDATE contexts SET links = ?, updated_at = datetime('now') WHERE context_id = ?",
        )
        .bind(links_json)
        .bind(context_id)
        .execute(&self.pool)
        .await
        .context("failed to add context link")?;

        self.get(context_id).await
    }

    pub async fn list_by_label(&self, label: &str, limit: i64) -> Result<Vec<ContextRecord>> {
        let rows = sqlx::query(
            "SELECT internal_id, context_id, title, status, labels, notes, links, created_at, updated_at \
             FROM contexts WHERE labels LIKE ? ORDER BY updated_at DESC LIMIT ?",
        )
        .bind(format!("%\"{label}\"%"))
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await
        .context("failed to list context records by label")?;

        rows.into_iter().map(context_from_row).collect()
    }
}

fn parse_string_list(value: &str) -> Vec<String> {
    serde_json::from_str(value).unwrap_or_default()
}

fn parse_notes(value: &str) -> Vec<ContextNote> {
    serde_json::from_str(value).unwrap_or_default()
}

fn context_from_row(row: sqlx::sqlite::SqliteRow) -> Result<ContextRecord> {
    let status_value: String = row
        .try_get("status")
        .context("failed to read context status")?;
    let status = ContextStatus::parse(&status_value)
        .with_context(|| format!("invalid context status in database: {status_value}"))?;

    let labels_value: String = row.try_get("labels").unwrap_or_else(|_| "[]".to_string());
    let notes_value: String = row.try_get("notes").unwrap_or_else(|_| "[]".to_string());
    let links_value: String = row.try_get("links").unwrap_or_else(|_| "[]".to_string());

    Ok(ContextRecord {
        internal_id: row
            .try_get("internal_id")
            .context("failed to read context internal_id")?,
        context_id: row
            .try_get("context_id")
            .context("failed to read context_id")?,
        title: row
            .try_get("title")
            .context("failed to read context title")?,
        status,
        labels: parse_string_list(&labels_value),
        notes: parse_notes(&notes_value),
        links: parse_string_list(&links_value),
        created_at: row
            .try_get::<chrono::NaiveDateTime, _>("created_at")
            .map(|v| v.and_utc().to_rfc3339())
            .context("failed to read context created_at")?,
        updated_at: row
            .try_get::<chrono::NaiveDateTime, _>("updated_at")
            .map(|v| v.and_utc().to_rfc3339())
            .context("failed to read context updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_store() -> TaskStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite should connect");

        sqlx::query(
            r#"
            CREATE TABLE contexts (
                internal_id TEXT PRIMARY KEY,
                context_id TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'open',
                labels TEXT NOT NULL DEFAULT '[]',
                notes TEXT NOT NULL DEFAULT '[]',
                links TEXT NOT NULL DEFAULT '[]',
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&pool)
        .await
        .expect("contexts schema should be created");

        TaskStore::new(pool)
    }

    #[tokio::test]
    async fn create_is_idempotent_under_same_context_id() {
        let store = setup_store().await;
        let context_id: ContextId = std::sync::Arc::from("thread-1700000000.000100");

        let first = store
            .get_or_create(UpsertContextInput {
                context_id: context_id.clone(),
                title: "list open PRs".to_string(),
                labels: vec!["chat".to_string(), "dm".to_string()],
            })
            .await
            .expect("first create should succeed");

        let second = store
            .get_or_create(UpsertContextInput {
                context_id: context_id.clone(),
                title: "a different title should be ignored".to_string(),
                labels: vec!["ignored".to_string()],
            })
            .await
            .expect("second create should succeed");

        assert_eq!(first.internal_id, second.internal_id);
        assert_eq!(second.title, "list open PRs");
        assert_eq!(second.labels, vec!["chat", "dm"]);
    }

    #[tokio::test]
    async fn closed_records_still_accept_notes() {
        let store = setup_store().await;
        let context_id: ContextId = std::sync::Arc::from("pr-project/repo-x-42");

        store
            .get_or_create(UpsertContextInput {
                context_id: context_id.clone(),
                title: "PR #42".to_string(),
                labels: vec!["pr".to_string()],
            })
            .await
            .expect("create should succeed");

        store
            .set_status(&context_id, ContextStatus::Closed)
            .await
            .expect("status update should succeed");

        let updated = store
            .append_note(&context_id, "late reviewer comment")
            .await
            .expect("append_note should succeed")
            .expect("record should exist");

        assert_eq!(updated.status, ContextStatus::Closed);
        assert_eq!(updated.notes.len(), 1);
        assert_eq!(updated.notes[0].body, "late reviewer comment");
    }

    #[tokio::test]
    async fn links_and_labels_deduplicate() {
        let store = setup_store().await;
        let context_id: ContextId = std::sync::Arc::from("thread-1700000001.000200");

        store
            .get_or_create(UpsertContextInput {
                context_id: context_id.clone(),
                title: "task".to_string(),
                labels: vec!["chat".to_string()],
            })
            .await
            .expect("create should succeed");

        store.add_label(&context_id, "chat").await.unwrap();
        store
            .add_link(&context_id, "pr-project/repo-x-42")
            .await
            .unwrap();
        let record = store
            .add_link(&context_id, "pr-project/repo-x-42")
            .await
            .unwrap()
            .expect("record should exist");

        assert_eq!(record.labels, vec!["chat"]);
        assert_eq!(record.links, vec!["pr-project/repo-x-42"]);
    }
}
