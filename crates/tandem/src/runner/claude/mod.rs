//! Runner for the CLI query provider.
//!
//! The provider already speaks the canonical message vocabulary, so messages
//! pass through untouched. Tool approvals arrive in-band as control requests;
//! each is parked in the permission broker and answered when decided,
//! without pausing the rest of the stream.

pub mod protocol;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use futures::stream::{BoxStream, FuturesUnordered};
use futures::{FutureExt, StreamExt};
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::DropGuard;

use tandem_protocol::{PermissionDecision, Provider, StreamMessage};

use self::protocol::{ClaudeLine, ControlOut, ControlRequest, user_turn};
use super::process::{ProcessSpec, StderrTail, spawn_line_process};
use super::{RunContext, RunEmitter, RunEvent, RunHandle, RunOutcome, RunRequest, Runner};
use crate::config::ClaudeConfig;
use crate::error::{Result, TandemError};
use crate::permission::PermissionBroker;

/// Parameters of one query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub prompt: String,
    pub cwd: Option<PathBuf>,
    pub resume: Option<String>,
    pub model: Option<String>,
    pub allowed_tools: Vec<String>,
}

/// An open query against the provider.
pub struct QueryConnection {
    pub lines: BoxStream<'static, ClaudeLine>,
    /// Dropping this sender ends the provider's input.
    pub control: mpsc::Sender<ControlOut>,
    pub stderr: StderrTail,
    /// Kept alive for as long as the query runs.
    pub guard: Option<DropGuard>,
}

/// Source of provider queries.
#[async_trait]
pub trait QueryTransport: Send + Sync {
    async fn open(&self, request: QueryRequest) -> anyhow::Result<QueryConnection>;
}

/// Runs the provider binary in stream-json mode.
#[derive(Debug, Clone)]
pub struct ProcessQueryTransport {
    config: ClaudeConfig,
    env: Vec<(String, String)>,
}

impl ProcessQueryTransport {
    pub fn new(config: ClaudeConfig) -> Self {
        Self {
            config,
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    fn args(&self, request: &QueryRequest) -> Vec<String> {
        let mut args: Vec<String> = [
            "-p",
            "--output-format",
            "stream-json",
            "--input-format",
            "stream-json",
            "--verbose",
            "--permission-prompt-tool",
            "stdio",
        ]
        .into_iter()
        .map(String::from)
        .collect();

        if let Some(model) = request.model.as_ref() {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(resume) = request.resume.as_ref() {
            args.push("--resume".to_string());
            args.push(resume.clone());
        }
        if !request.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(request.allowed_tools.join(","));
        }
        args.extend(self.config.extra_args.iter().cloned());
        args
    }
}

#[async_trait]
impl QueryTransport for ProcessQueryTransport {
    async fn open(&self, request: QueryRequest) -> anyhow::Result<QueryConnection> {
        let process = spawn_line_process(
            ProcessSpec {
                label: "claude",
                program: self.config.binary.clone(),
                args: self.args(&request),
                cwd: request.cwd.clone(),
                env: self.env.clone(),
            },
            true,
        )?;

        let stdin = process.stdin.context("claude process has no stdin")?;
        stdin
            .send(user_turn(&request.prompt).to_string())
            .await
            .context("sending prompt to claude")?;

        let (control_tx, mut control_rx) = mpsc::channel::<ControlOut>(16);
        tokio::spawn(async move {
            while let Some(out) = control_rx.recv().await {
                if stdin.send(out.to_value().to_string()).await.is_err() {
                    break;
                }
            }
        });

        let lines = ReceiverStream::new(process.lines)
            .filter_map(|line| async move {
                match ClaudeLine::parse(&line) {
                    Ok(parsed) => Some(parsed),
                    Err(e) => {
                        let display: String = line.chars().take(200).collect();
                        warn!("Failed to parse claude line: {:?}, line: {}", e, display);
                        None
                    }
                }
            })
            .boxed();

        Ok(QueryConnection {
            lines,
            control: control_tx,
            stderr: process.stderr,
            guard: Some(process.guard),
        })
    }
}

/// Runner for `Provider::Claude`.
pub struct ClaudeRunner {
    transport: Arc<dyn QueryTransport>,
    default_model: Option<String>,
}

impl ClaudeRunner {
    pub fn new(transport: Arc<dyn QueryTransport>) -> Self {
        Self {
            transport,
            default_model: None,
        }
    }

    pub fn with_default_model(mut self, model: Option<String>) -> Self {
        self.default_model = model;
        self
    }
}

#[async_trait]
impl Runner for ClaudeRunner {
    fn provider(&self) -> Provider {
        Provider::Claude
    }

    async fn start(&self, request: RunRequest, ctx: RunContext) -> Result<RunHandle> {
        let session_id = request.session.id.clone();
        let query = QueryRequest {
            prompt: request.prompt,
            cwd: request.session.cwd.as_ref().map(PathBuf::from),
            resume: request.resume_token,
            model: request
                .model
                .or_else(|| request.session.model.clone())
                .or_else(|| self.default_model.clone()),
            allowed_tools: request.session.allowed_tools.clone().unwrap_or_default(),
        };
        info!(
            "Starting claude query for session {} (resume: {})",
            session_id,
            query.resume.is_some()
        );

        let connection = self
            .transport
            .open(query)
            .await
            .map_err(|e| TandemError::provider(format!("{e:#}")))?;

        let (emitter, events) = RunEmitter::channel(ctx.cancel.clone());
        tokio::spawn(drive_query(session_id, connection, emitter, ctx.permissions));

        Ok(RunHandle {
            cancel: ctx.cancel,
            events,
        })
    }
}

/// A permission decision ready to be sent back upstream.
struct Decided {
    request_id: String,
    decision: PermissionDecision,
    input: Value,
}

/// Pump one query until it finishes or is aborted.
///
/// Upstream lines and decided permissions are merged in one loop, so a
/// parked tool call never blocks the messages that follow it.
async fn drive_query(
    session_id: String,
    connection: QueryConnection,
    emitter: RunEmitter,
    permissions: Arc<PermissionBroker>,
) {
    let QueryConnection {
        mut lines,
        control,
        stderr,
        guard,
    } = connection;
    // Dropped once the turn's result arrives, ending the provider's input.
    let mut control = Some(control);
    let cancel = emitter.token().clone();
    let mut waiters = FuturesUnordered::new();
    let mut result: Option<RunOutcome> = None;

    let outcome = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break RunOutcome::Aborted,

            Some(decided) = waiters.next(), if !waiters.is_empty() => {
                let Decided { request_id, decision, input } = decided;
                let sent = match control.as_ref() {
                    Some(control) => control
                        .send(ControlOut::PermissionResponse { request_id, decision, input })
                        .await
                        .is_ok(),
                    None => false,
                };
                if !sent {
                    debug!("claude input closed before permission response");
                }
            }

            line = lines.next() => {
                let Some(line) = line else {
                    break match result.take() {
                        Some(outcome) => outcome,
                        None => RunOutcome::Failed(exit_message(&stderr)),
                    };
                };
                if emitter.is_aborted() {
                    break RunOutcome::Aborted;
                }

                match line {
                    ClaudeLine::Message(message) => {
                        let finished = result_outcome(&message);
                        if !emitter.emit(RunEvent::Message(message)).await {
                            break RunOutcome::Aborted;
                        }
                        if finished.is_some() {
                            result = finished;
                            control = None;
                        }
                    }
                    ClaudeLine::ControlRequest {
                        request_id,
                        request: ControlRequest::CanUseTool { tool_name, input, tool_use_id },
                    } => {
                        let tool_use_id = tool_use_id.unwrap_or_else(|| request_id.clone());
                        let ticket = permissions.park(&session_id, &tool_use_id, &tool_name, input.clone());
                        let announced = emitter
                            .emit(RunEvent::PermissionRequest {
                                tool_use_id,
                                tool_name,
                                input: input.clone(),
                            })
                            .await;
                        if !announced {
                            break RunOutcome::Aborted;
                        }
                        let cancel = cancel.clone();
                        waiters.push(
                            async move {
                                let decision = ticket.wait(&cancel).await;
                                Decided { request_id, decision, input }
                            }
                            .boxed(),
                        );
                    }
                    ClaudeLine::ControlRequest { request_id, request: ControlRequest::Unsupported } => {
                        debug!("Acknowledging unsupported control request {}", request_id);
                        if let Some(control) = control.as_ref() {
                            let _ = control.send(ControlOut::Ack { request_id }).await;
                        }
                    }
                    ClaudeLine::Other(value) => {
                        debug!(
                            "Ignoring claude line of type {:?}",
                            value.get("type").and_then(Value::as_str)
                        );
                    }
                }
            }
        }
    };

    if outcome == RunOutcome::Aborted {
        info!("Aborting claude query for session {}", session_id);
        if let Some(control) = control.take() {
            let _ = control.send(ControlOut::Interrupt).await;
        }
        permissions.deny_all(&session_id);
    }
    drop(waiters);
    drop(control);
    drop(lines);
    drop(guard);
    emitter.finish(outcome).await;
}

fn result_outcome(message: &StreamMessage) -> Option<RunOutcome> {
    match message {
        StreamMessage::Result(result) if result.is_error => Some(RunOutcome::Failed(
            result
                .result
                .clone()
                .unwrap_or_else(|| result.subtype.clone()),
        )),
        StreamMessage::Result(_) => Some(RunOutcome::Completed),
        _ => None,
    }
}

fn exit_message(stderr: &StderrTail) -> String {
    match stderr.last() {
        Some(line) => format!("claude exited before completing the turn: {line}"),
        None => "claude exited before completing the turn".to_string(),
    }
}
