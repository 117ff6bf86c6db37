//! Canonical server events.
//!
//! Events are ephemeral signals for clients. Each is serialized as one
//! independently parseable JSON object `{"type": ..., "payload": {...}}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::messages::StreamMessage;
use crate::session::{SessionInfo, SessionStatus};

/// All events a client may observe, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerEvent {
    #[serde(rename = "session.status", rename_all = "camelCase")]
    SessionStatus {
        session_id: String,
        status: SessionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "stream.message", rename_all = "camelCase")]
    StreamMessage {
        session_id: String,
        message: StreamMessage,
    },

    #[serde(rename = "stream.user_prompt", rename_all = "camelCase")]
    StreamUserPrompt { session_id: String, prompt: String },

    #[serde(rename = "permission.request", rename_all = "camelCase")]
    PermissionRequest {
        session_id: String,
        tool_use_id: String,
        tool_name: String,
        input: Value,
    },

    #[serde(rename = "runner.error", rename_all = "camelCase")]
    RunnerError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        message: String,
    },

    #[serde(rename = "session.list")]
    SessionList { sessions: Vec<SessionInfo> },

    #[serde(rename = "session.history", rename_all = "camelCase")]
    SessionHistory {
        session_id: String,
        status: SessionStatus,
        messages: Vec<StreamMessage>,
        pending_permissions: Vec<PendingPermission>,
    },

    #[serde(rename = "session.deleted", rename_all = "camelCase")]
    SessionDeleted { session_id: String },
}

/// Snapshot of a tool invocation awaiting a human decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPermission {
    pub tool_use_id: String,
    pub tool_name: String,
    pub input: Value,
}

impl ServerEvent {
    /// The session this event is scoped to, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ServerEvent::SessionStatus { session_id, .. }
            | ServerEvent::StreamMessage { session_id, .. }
            | ServerEvent::StreamUserPrompt { session_id, .. }
            | ServerEvent::PermissionRequest { session_id, .. }
            | ServerEvent::SessionHistory { session_id, .. }
            | ServerEvent::SessionDeleted { session_id } => Some(session_id),
            ServerEvent::RunnerError { session_id, .. } => session_id.as_deref(),
            ServerEvent::SessionList { .. } => None,
        }
    }

    /// The status carried by a `session.status` event.
    pub fn status(&self) -> Option<SessionStatus> {
        match self {
            ServerEvent::SessionStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether this event closes a run's stream.
    pub fn is_terminal_status(&self) -> bool {
        self.status().is_some_and(SessionStatus::is_terminal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_event_wire_format() {
        let event = ServerEvent::SessionStatus {
            session_id: "s1".to_string(),
            status: SessionStatus::Running,
            title: Some("T".to_string()),
            cwd: None,
            error: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "session.status",
                "payload": {"sessionId": "s1", "status": "running", "title": "T"}
            })
        );
        let back: ServerEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
        assert!(!back.is_terminal_status());
    }

    #[test]
    fn test_permission_request_wire_format() {
        let event = ServerEvent::PermissionRequest {
            session_id: "s1".to_string(),
            tool_use_id: "toolu_1".to_string(),
            tool_name: "Bash".to_string(),
            input: json!({"command": "rm -rf build"}),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "permission.request");
        assert_eq!(value["payload"]["toolUseId"], "toolu_1");
        assert_eq!(event.session_id(), Some("s1"));
    }
}
