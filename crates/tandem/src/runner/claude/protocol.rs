//! Line protocol of the CLI query provider.
//!
//! Stdout carries one JSON object per line: canonical stream messages plus
//! `control_request` lines asking the host to approve a tool call. Stdin
//! carries the user turn and our `control_response` / interrupt lines.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use tandem_protocol::{PermissionDecision, StreamMessage};

/// One parsed stdout line.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaudeLine {
    Message(StreamMessage),
    ControlRequest {
        request_id: String,
        request: ControlRequest,
    },
    /// Anything we do not act on (`control_response`, `stream_event`, ...).
    Other(Value),
}

/// Body of a `control_request` line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum ControlRequest {
    CanUseTool {
        tool_name: String,
        #[serde(default)]
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_use_id: Option<String>,
    },
    #[serde(other)]
    Unsupported,
}

impl ClaudeLine {
    pub fn parse(line: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(line).context("parsing provider line")?;
        Ok(Self::from_value(value))
    }

    pub fn from_value(value: Value) -> Self {
        match value.get("type").and_then(Value::as_str) {
            Some("control_request") => {
                let request_id = value
                    .get("request_id")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let request = value
                    .get("request")
                    .cloned()
                    .map(serde_json::from_value::<ControlRequest>);
                match (request_id, request) {
                    (Some(request_id), Some(Ok(request))) => {
                        ClaudeLine::ControlRequest { request_id, request }
                    }
                    _ => ClaudeLine::Other(value),
                }
            }
            Some("system" | "assistant" | "user" | "result") => {
                match serde_json::from_value::<StreamMessage>(value.clone()) {
                    Ok(message) => ClaudeLine::Message(message),
                    Err(_) => ClaudeLine::Other(value),
                }
            }
            _ => ClaudeLine::Other(value),
        }
    }
}

/// Something written to the provider's stdin after the initial turn.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlOut {
    PermissionResponse {
        request_id: String,
        decision: PermissionDecision,
        /// Original tool input, echoed back when the decision does not replace it.
        input: Value,
    },
    /// Generic success reply to a control request we do not handle.
    Ack { request_id: String },
    Interrupt,
}

impl ControlOut {
    pub fn to_value(&self) -> Value {
        match self {
            ControlOut::PermissionResponse {
                request_id,
                decision,
                input,
            } => {
                let response = match decision {
                    PermissionDecision::Allow { updated_input } => json!({
                        "behavior": "allow",
                        "updatedInput": updated_input.clone().unwrap_or_else(|| input.clone()),
                    }),
                    PermissionDecision::Deny { message } => json!({
                        "behavior": "deny",
                        "message": message.clone().unwrap_or_else(|| "Permission denied".to_string()),
                    }),
                };
                json!({
                    "type": "control_response",
                    "response": {
                        "subtype": "success",
                        "request_id": request_id,
                        "response": response,
                    }
                })
            }
            ControlOut::Ack { request_id } => json!({
                "type": "control_response",
                "response": {"subtype": "success", "request_id": request_id, "response": {}}
            }),
            ControlOut::Interrupt => json!({
                "type": "control_request",
                "request_id": format!("interrupt-{}", uuid::Uuid::new_v4()),
                "request": {"subtype": "interrupt"}
            }),
        }
    }
}

/// The user turn written to stdin when a query starts.
pub fn user_turn(prompt: &str) -> Value {
    json!({
        "type": "user",
        "message": {"role": "user", "content": prompt}
    })
}
