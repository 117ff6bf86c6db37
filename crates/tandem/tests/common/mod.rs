//! Test utilities and common setup.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use serde_json::Value;
use tokio::sync::mpsc;

use tandem::api::{self, AppState};
use tandem::db::Database;
use tandem::hub::EventHub;
use tandem::permission::PermissionBroker;
use tandem::runner::{ClaudeRunner, CodexRunner, RunnerSet};
use tandem::session::{SessionRegistry, SessionRepository, SessionService};
use tandem_protocol::{ServerEvent, SessionStatus, StreamMessage};

pub mod scripted;

pub use scripted::{QueryStep, ScriptedQueryTransport, ScriptedThreadTransport, ThreadStep};

/// Upper bound for any single wait in a test.
pub const WAIT: Duration = Duration::from_secs(5);

pub struct Harness {
    pub service: Arc<SessionService>,
    pub database: Database,
    pub claude: ScriptedQueryTransport,
    pub codex: ScriptedThreadTransport,
}

/// Service over an in-memory database with the given provider scripts.
pub async fn harness(claude: Vec<Vec<QueryStep>>, codex: Vec<Vec<ThreadStep>>) -> Harness {
    let claude = ScriptedQueryTransport::new(claude);
    let codex = ScriptedThreadTransport::new(codex);

    let database = Database::in_memory().await.expect("in-memory database");
    let repo = SessionRepository::new(database.pool().clone());
    let registry = Arc::new(SessionRegistry::new(repo, Arc::new(PermissionBroker::new())));
    let runners = RunnerSet::new(
        Arc::new(ClaudeRunner::new(Arc::new(claude.clone()))),
        Arc::new(CodexRunner::new(Arc::new(codex.clone()))),
    );
    let service = Arc::new(SessionService::new(registry, runners, EventHub::new()));

    Harness {
        service,
        database,
        claude,
        codex,
    }
}

/// Router over a fresh harness.
pub async fn test_app(claude: Vec<Vec<QueryStep>>) -> (Router, Harness) {
    let harness = harness(claude, Vec::new()).await;
    let router = api::create_router(AppState::new(Arc::clone(&harness.service)));
    (router, harness)
}

/// A complete, successful turn that hands out `token`.
pub fn simple_turn(token: &str, reply: &str) -> Vec<QueryStep> {
    vec![
        QueryStep::Message(StreamMessage::init(token, None, None)),
        QueryStep::Message(StreamMessage::assistant_text(Some(token.to_string()), reply)),
        QueryStep::Message(StreamMessage::result_success(Some(token.to_string()), None)),
    ]
}

/// A turn that stays open until stopped.
pub fn held_turn(token: &str) -> Vec<QueryStep> {
    vec![
        QueryStep::Message(StreamMessage::init(token, None, None)),
        QueryStep::Hold,
    ]
}

pub async fn next_event(rx: &mut mpsc::Receiver<ServerEvent>) -> Option<ServerEvent> {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
}

/// Read events up to and including the first matching one.
pub async fn events_until(
    rx: &mut mpsc::Receiver<ServerEvent>,
    mut matches: impl FnMut(&ServerEvent) -> bool,
) -> Vec<ServerEvent> {
    let mut seen = Vec::new();
    while let Some(event) = next_event(rx).await {
        let done = matches(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
    panic!("stream ended before the expected event: {seen:#?}");
}

/// Drain a run's stream to its end.
pub async fn collect(mut rx: mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Some(event) = next_event(&mut rx).await {
        events.push(event);
    }
    events
}

/// `type` tags of `events`, with the message type for `stream.message`.
pub fn kinds(events: &[ServerEvent]) -> Vec<String> {
    events
        .iter()
        .map(|event| {
            let value = serde_json::to_value(event).expect("serialize event");
            let kind = value["type"].as_str().unwrap_or_default().to_string();
            match &value["payload"]["message"]["type"] {
                Value::String(message_type) => format!("{kind}:{message_type}"),
                _ => kind,
            }
        })
        .collect()
}

pub fn final_status(events: &[ServerEvent]) -> SessionStatus {
    events
        .last()
        .and_then(ServerEvent::status)
        .expect("stream must end with a status event")
}

pub fn session_id_of(events: &[ServerEvent]) -> String {
    events
        .first()
        .and_then(ServerEvent::session_id)
        .expect("first event carries the session id")
        .to_string()
}

/// Parse an SSE body into events, one JSON object per `data:` line.
pub fn parse_sse(body: &str) -> Vec<ServerEvent> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim()).expect("valid event JSON"))
        .collect()
}
