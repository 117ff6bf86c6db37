//! Runner for the thread API provider.
//!
//! The provider reports phase-oriented `thread/turn/item` events which the
//! [`translator`] folds into canonical messages. It has no interactive
//! approval hook; tool policy is fixed by its sandbox setting.

pub mod events;
pub mod translator;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use log::{debug, info, warn};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::DropGuard;

use tandem_protocol::Provider;

use self::events::ThreadEvent;
use self::translator::ThreadTranslator;
use super::process::{ProcessSpec, StderrTail, spawn_line_process};
use super::{RunContext, RunEmitter, RunEvent, RunHandle, RunOutcome, RunRequest, Runner};
use crate::config::CodexConfig;
use crate::error::{Result, TandemError};

/// Parameters of one turn on a thread.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadRequest {
    pub prompt: String,
    pub cwd: Option<PathBuf>,
    /// Thread to resume; `None` starts a new thread.
    pub thread_id: Option<String>,
    pub model: Option<String>,
}

/// A running turn.
pub struct ThreadConnection {
    pub events: BoxStream<'static, ThreadEvent>,
    pub stderr: StderrTail,
    /// Kept alive for as long as the turn runs.
    pub guard: Option<DropGuard>,
}

/// Source of thread turns.
#[async_trait]
pub trait ThreadTransport: Send + Sync {
    async fn run(&self, request: ThreadRequest) -> anyhow::Result<ThreadConnection>;
}

/// Runs the provider binary in `exec --json` mode.
#[derive(Debug, Clone)]
pub struct ProcessThreadTransport {
    config: CodexConfig,
    env: Vec<(String, String)>,
}

impl ProcessThreadTransport {
    pub fn new(config: CodexConfig) -> Self {
        Self {
            config,
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    fn args(&self, request: &ThreadRequest) -> Vec<String> {
        let mut args = vec![
            "exec".to_string(),
            "--json".to_string(),
            "--skip-git-repo-check".to_string(),
        ];
        if let Some(model) = request.model.as_ref() {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(sandbox) = self.config.sandbox.as_ref() {
            args.push("--sandbox".to_string());
            args.push(sandbox.clone());
        }
        args.extend(self.config.extra_args.iter().cloned());
        if let Some(thread_id) = request.thread_id.as_ref() {
            args.push("resume".to_string());
            args.push(thread_id.clone());
        }
        // A prompt starting with `-` must not be read as an option.
        args.push("--".to_string());
        args.push(request.prompt.clone());
        args
    }
}

#[async_trait]
impl ThreadTransport for ProcessThreadTransport {
    async fn run(&self, request: ThreadRequest) -> anyhow::Result<ThreadConnection> {
        let process = spawn_line_process(
            ProcessSpec {
                label: "codex",
                program: self.config.binary.clone(),
                args: self.args(&request),
                cwd: request.cwd.clone(),
                env: self.env.clone(),
            },
            false,
        )?;

        let events = ReceiverStream::new(process.lines)
            .filter_map(|line| async move {
                match serde_json::from_str::<ThreadEvent>(&line) {
                    Ok(event) => Some(event),
                    Err(e) => {
                        let display: String = line.chars().take(200).collect();
                        warn!("Failed to parse codex event: {:?}, line: {}", e, display);
                        None
                    }
                }
            })
            .boxed();

        Ok(ThreadConnection {
            events,
            stderr: process.stderr,
            guard: Some(process.guard),
        })
    }
}

/// Runner for `Provider::Codex`.
pub struct CodexRunner {
    transport: Arc<dyn ThreadTransport>,
    default_model: Option<String>,
}

impl CodexRunner {
    pub fn new(transport: Arc<dyn ThreadTransport>) -> Self {
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
impl Runner for CodexRunner {
    fn provider(&self) -> Provider {
        Provider::Codex
    }

    async fn start(&self, request: RunRequest, ctx: RunContext) -> Result<RunHandle> {
        let session_id = request.session.id.clone();
        let model = request
            .model
            .or_else(|| request.session.model.clone())
            .or_else(|| self.default_model.clone());
        let translator = ThreadTranslator::new(model.clone(), request.session.cwd.clone());
        let thread = ThreadRequest {
            prompt: request.prompt,
            cwd: request.session.cwd.as_ref().map(PathBuf::from),
            thread_id: request.resume_token,
            model,
        };
        info!(
            "Starting codex turn for session {} (resume: {})",
            session_id,
            thread.thread_id.is_some()
        );

        let connection = self
            .transport
            .run(thread)
            .await
            .map_err(|e| TandemError::provider(format!("{e:#}")))?;

        let (emitter, events) = RunEmitter::channel(ctx.cancel.clone());
        tokio::spawn(drive_thread(session_id, connection, translator, emitter));

        Ok(RunHandle {
            cancel: ctx.cancel,
            events,
        })
    }
}

/// Pump one turn until it finishes or is aborted.
async fn drive_thread(
    session_id: String,
    connection: ThreadConnection,
    mut translator: ThreadTranslator,
    emitter: RunEmitter,
) {
    let ThreadConnection {
        mut events,
        stderr,
        guard,
    } = connection;
    let cancel = emitter.token().clone();
    let mut last_error: Option<String> = None;

    let outcome = 'run: loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break RunOutcome::Aborted,
            event = events.next() => event,
        };
        let Some(event) = event else {
            let message = last_error
                .take()
                .or_else(|| stderr.last())
                .unwrap_or_else(|| "codex exited before completing the turn".to_string());
            break RunOutcome::Failed(message);
        };
        if emitter.is_aborted() {
            break RunOutcome::Aborted;
        }

        let terminal = match &event {
            ThreadEvent::TurnCompleted { .. } => Some(RunOutcome::Completed),
            ThreadEvent::TurnFailed { error } => Some(RunOutcome::Failed(error.message.clone())),
            ThreadEvent::Error { message } => {
                last_error = Some(message.clone());
                None
            }
            _ => None,
        };

        for message in translator.translate(&event) {
            if !emitter.emit(RunEvent::Message(message)).await {
                break 'run RunOutcome::Aborted;
            }
        }

        if let Some(outcome) = terminal {
            break outcome;
        }
    };

    if outcome == RunOutcome::Aborted {
        info!("Aborting codex turn for session {}", session_id);
    } else {
        debug!("codex turn for session {} ended: {:?}", session_id, outcome);
    }
    drop(events);
    drop(guard);
    emitter.finish(outcome).await;
}
