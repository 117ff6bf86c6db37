//! Session data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

use tandem_protocol::{PendingPermission, Provider, SessionInfo, SessionStatus, StreamMessage};

/// A session as stored in the `sessions` table.
#[derive(Debug, Clone, FromRow)]
pub struct SessionRow {
    pub id: String,
    pub external_id: Option<String>,
    pub title: String,
    pub cwd: Option<String>,
    pub status: String,
    pub provider: String,
    pub model: Option<String>,
    pub resume_token: Option<String>,
    pub last_prompt: Option<String>,
    /// JSON array of tool names.
    pub allowed_tools: Option<String>,
    /// JSON object.
    pub metadata: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl TryFrom<SessionRow> for SessionInfo {
    type Error = anyhow::Error;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let status: SessionStatus = row.status.parse().map_err(anyhow::Error::msg)?;
        let provider: Provider = row.provider.parse().map_err(anyhow::Error::msg)?;
        let allowed_tools = row
            .allowed_tools
            .as_deref()
            .map(serde_json::from_str::<Vec<String>>)
            .transpose()?;
        let metadata = row
            .metadata
            .as_deref()
            .map(serde_json::from_str::<Value>)
            .transpose()?;

        Ok(SessionInfo {
            id: row.id,
            external_id: row.external_id,
            title: row.title,
            cwd: row.cwd,
            status,
            provider,
            model: row.model,
            resume_token: row.resume_token,
            last_prompt: row.last_prompt,
            allowed_tools,
            metadata,
            created_at: parse_timestamp(&row.created_at)?,
            updated_at: parse_timestamp(&row.updated_at)?,
        })
    }
}

fn parse_timestamp(value: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

/// Options for creating a new session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionOptions {
    pub title: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub provider: Provider,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub prompt: Option<String>,
}

/// Partial update merged into a stored session.
///
/// `None` leaves a field untouched. Provider and identity are immutable.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub title: Option<String>,
    pub cwd: Option<String>,
    pub status: Option<SessionStatus>,
    pub model: Option<String>,
    pub resume_token: Option<String>,
    pub last_prompt: Option<String>,
    pub allowed_tools: Option<Vec<String>>,
    pub metadata: Option<Value>,
}

impl SessionPatch {
    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn resume_token(token: impl Into<String>) -> Self {
        Self {
            resume_token: Some(token.into()),
            ..Default::default()
        }
    }

    /// Apply this patch to `session`, bumping `updated_at`.
    pub fn apply(self, session: &mut SessionInfo) {
        if let Some(title) = self.title {
            session.title = title;
        }
        if let Some(cwd) = self.cwd {
            session.cwd = Some(cwd);
        }
        if let Some(status) = self.status {
            session.status = status;
        }
        if let Some(model) = self.model {
            session.model = Some(model);
        }
        if let Some(token) = self.resume_token {
            session.resume_token = Some(token);
        }
        if let Some(prompt) = self.last_prompt {
            session.last_prompt = Some(prompt);
        }
        if let Some(tools) = self.allowed_tools {
            session.allowed_tools = Some(tools);
        }
        if let Some(metadata) = self.metadata {
            session.metadata = Some(metadata);
        }
        session.updated_at = Utc::now().max(session.updated_at);
    }
}

/// A session with its ordered messages and outstanding permission requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHistory {
    pub session: SessionInfo,
    pub messages: Vec<StreamMessage>,
    pub pending_permissions: Vec<PendingPermission>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SessionInfo {
        let now = Utc::now();
        SessionInfo {
            id: "s1".to_string(),
            external_id: None,
            title: "T".to_string(),
            cwd: Some("/tmp".to_string()),
            status: SessionStatus::Idle,
            provider: Provider::Claude,
            model: None,
            resume_token: None,
            last_prompt: None,
            allowed_tools: None,
            metadata: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_patch_merges_only_set_fields() {
        let mut session = sample();
        SessionPatch {
            status: Some(SessionStatus::Running),
            last_prompt: Some("hello".to_string()),
            ..Default::default()
        }
        .apply(&mut session);

        assert_eq!(session.status, SessionStatus::Running);
        assert_eq!(session.last_prompt.as_deref(), Some("hello"));
        assert_eq!(session.cwd.as_deref(), Some("/tmp"));
        assert!(session.updated_at >= session.created_at);
    }

    #[test]
    fn test_row_conversion_rejects_unknown_status() {
        let row = SessionRow {
            id: "s1".to_string(),
            external_id: None,
            title: "T".to_string(),
            cwd: None,
            status: "paused".to_string(),
            provider: "claude".to_string(),
            model: None,
            resume_token: None,
            last_prompt: None,
            allowed_tools: None,
            metadata: None,
            created_at: "2025-01-01T00:00:00Z".to_string(),
            updated_at: "2025-01-01T00:00:00Z".to_string(),
        };
        assert!(SessionInfo::try_from(row).is_err());
    }
}
