//! Session database repository.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::SqlitePool;

use tandem_protocol::SessionInfo;

use super::models::SessionRow;

const SESSION_COLUMNS: &str = "id, external_id, title, cwd, status, provider, model, resume_token, \
     last_prompt, allowed_tools, metadata, created_at, updated_at";

/// Fixed-width RFC 3339 so that text ordering matches time ordering.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Repository for session and message persistence.
#[derive(Debug, Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new session.
    pub async fn create(&self, session: &SessionInfo) -> Result<()> {
        let allowed_tools = session
            .allowed_tools
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let metadata = session
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, external_id, title, cwd, status, provider, model, resume_token,
                last_prompt, allowed_tools, metadata, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.external_id)
        .bind(&session.title)
        .bind(&session.cwd)
        .bind(session.status.to_string())
        .bind(session.provider.to_string())
        .bind(&session.model)
        .bind(&session.resume_token)
        .bind(&session.last_prompt)
        .bind(allowed_tools)
        .bind(metadata)
        .bind(format_timestamp(&session.created_at))
        .bind(format_timestamp(&session.updated_at))
        .execute(&self.pool)
        .await
        .context("creating session")?;

        Ok(())
    }

    /// Write every mutable field of `session`.
    pub async fn save(&self, session: &SessionInfo) -> Result<bool> {
        let allowed_tools = session
            .allowed_tools
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let metadata = session
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET title = ?, cwd = ?, status = ?, model = ?, resume_token = ?,
                last_prompt = ?, allowed_tools = ?, metadata = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&session.title)
        .bind(&session.cwd)
        .bind(session.status.to_string())
        .bind(&session.model)
        .bind(&session.resume_token)
        .bind(&session.last_prompt)
        .bind(allowed_tools)
        .bind(metadata)
        .bind(format_timestamp(&session.updated_at))
        .bind(&session.id)
        .execute(&self.pool)
        .await
        .context("updating session")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get(&self, id: &str) -> Result<Option<SessionInfo>> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching session")?;

        row.map(SessionInfo::try_from).transpose()
    }

    pub async fn get_by_external_id(&self, external_id: &str) -> Result<Option<SessionInfo>> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE external_id = ?"
        ))
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching session by external ID")?;

        row.map(SessionInfo::try_from).transpose()
    }

    /// Most recently updated session holding `token`.
    pub async fn find_by_resume_token(&self, token: &str) -> Result<Option<SessionInfo>> {
        let row = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE resume_token = ? \
             ORDER BY updated_at DESC LIMIT 1"
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .context("fetching session by resume token")?;

        row.map(SessionInfo::try_from).transpose()
    }

    /// List all sessions, most recently updated first.
    pub async fn list(&self) -> Result<Vec<SessionInfo>> {
        let rows = sqlx::query_as::<_, SessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY updated_at DESC"
        ))
        .fetch_all(&self.pool)
        .await
        .context("listing sessions")?;

        rows.into_iter().map(SessionInfo::try_from).collect()
    }

    /// Distinct working directories, most recently used first.
    pub async fn recent_cwds(&self, limit: i64) -> Result<Vec<String>> {
        let cwds = sqlx::query_scalar::<_, String>(
            r#"
            SELECT cwd FROM sessions
            WHERE cwd IS NOT NULL AND cwd != ''
            GROUP BY cwd
            ORDER BY MAX(updated_at) DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("listing recent working directories")?;

        Ok(cwds)
    }

    /// Delete a session and its messages. Returns whether the session existed.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("starting delete")?;

        sqlx::query("DELETE FROM messages WHERE session_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("deleting session messages")?;

        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("deleting session")?;

        tx.commit().await.context("committing delete")?;
        Ok(result.rows_affected() > 0)
    }

    /// Append a message payload at the end of a session's history.
    ///
    /// Returns `false` without writing when `message_id` is already stored for
    /// the session.
    pub async fn append_message(
        &self,
        session_id: &str,
        message_id: Option<&str>,
        payload: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO messages (session_id, seq, message_id, payload, created_at)
            SELECT ?, COALESCE(MAX(seq), 0) + 1, ?, ?, ?
            FROM messages WHERE session_id = ?
            "#,
        )
        .bind(session_id)
        .bind(message_id)
        .bind(payload)
        .bind(format_timestamp(&Utc::now()))
        .bind(session_id)
        .execute(&self.pool)
        .await
        .context("appending message")?;

        Ok(result.rows_affected() > 0)
    }

    /// Message payloads of a session in insertion order.
    pub async fn messages(&self, session_id: &str) -> Result<Vec<String>> {
        let payloads = sqlx::query_scalar::<_, String>(
            "SELECT payload FROM messages WHERE session_id = ? ORDER BY seq ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .context("listing messages")?;

        Ok(payloads)
    }
}
