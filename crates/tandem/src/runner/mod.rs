//! Runner contract.
//!
//! A runner drives one conversation turn against one provider backend and
//! reports it as an ordered stream of canonical events ending in exactly one
//! `Finished`.
//!
//! ```text
//! SessionService ──start──► Runner ──► provider transport (process / scripted)
//!        ▲                    │
//!        └──── RunEvent ◄─────┘   Message* · PermissionRequest* · Finished
//! ```
//!
//! Abort is cooperative: runners check the run's `CancellationToken` after
//! every upstream read and again before every emit. Once observed, nothing
//! more is forwarded, pending permissions are denied and the run finishes
//! `Aborted`.

pub mod claude;
pub mod codex;
pub mod process;

use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tandem_protocol::{Provider, SessionInfo, StreamMessage};

use crate::config::AppConfig;
use crate::error::Result;
use crate::permission::PermissionBroker;
use crate::supervisor::SidecarEnv;

pub use claude::{ClaudeRunner, ProcessQueryTransport};
pub use codex::{CodexRunner, ProcessThreadTransport};

/// Buffer size for a run's event channel.
const RUN_EVENT_BUFFER_SIZE: usize = 64;

/// One turn to execute.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub prompt: String,
    pub session: SessionInfo,
    /// Token of the provider conversation to resume; `None` starts a new one.
    pub resume_token: Option<String>,
    pub model: Option<String>,
}

/// Shared facilities a runner works with.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub cancel: CancellationToken,
    pub permissions: Arc<PermissionBroker>,
}

/// Handle to a started run.
#[derive(Debug)]
pub struct RunHandle {
    pub cancel: CancellationToken,
    pub events: mpsc::Receiver<RunEvent>,
}

/// Something a run produced.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    Message(StreamMessage),
    /// A tool call is parked in the broker waiting for a human decision.
    PermissionRequest {
        tool_use_id: String,
        tool_name: String,
        input: Value,
    },
    Finished(RunOutcome),
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    Failed(String),
    Aborted,
}

/// A provider backend able to execute conversation turns.
#[async_trait]
pub trait Runner: Send + Sync {
    fn provider(&self) -> Provider;

    /// Start a turn. Errors here mean the provider could not be launched at all.
    async fn start(&self, request: RunRequest, ctx: RunContext) -> Result<RunHandle>;
}

/// The runner for each provider.
#[derive(Clone)]
pub struct RunnerSet {
    claude: Arc<dyn Runner>,
    codex: Arc<dyn Runner>,
}

impl std::fmt::Debug for RunnerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerSet").finish_non_exhaustive()
    }
}

impl RunnerSet {
    pub fn new(claude: Arc<dyn Runner>, codex: Arc<dyn Runner>) -> Self {
        Self { claude, codex }
    }

    /// Process-backed runners for both providers.
    ///
    /// Provider processes get the configured extra `PATH`, proxy and env.
    pub fn from_config(config: &AppConfig) -> Self {
        let env = SidecarEnv::from_config(&config.sidecar).to_pairs();
        let claude = ProcessQueryTransport::new(config.claude.clone()).with_env(env.clone());
        let codex = ProcessThreadTransport::new(config.codex.clone()).with_env(env);
        Self::new(
            Arc::new(
                ClaudeRunner::new(Arc::new(claude))
                    .with_default_model(config.claude.default_model.clone()),
            ),
            Arc::new(
                CodexRunner::new(Arc::new(codex))
                    .with_default_model(config.codex.default_model.clone()),
            ),
        )
    }

    pub fn get(&self, provider: Provider) -> Arc<dyn Runner> {
        match provider {
            Provider::Claude => Arc::clone(&self.claude),
            Provider::Codex => Arc::clone(&self.codex),
        }
    }
}

/// Sending half of a run's event channel with the abort checkpoint built in.
#[derive(Debug)]
pub(crate) struct RunEmitter {
    tx: mpsc::Sender<RunEvent>,
    cancel: CancellationToken,
}

impl RunEmitter {
    pub(crate) fn channel(cancel: CancellationToken) -> (Self, mpsc::Receiver<RunEvent>) {
        let (tx, rx) = mpsc::channel(RUN_EVENT_BUFFER_SIZE);
        (Self { tx, cancel }, rx)
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Forward an event unless the run was aborted or nobody is listening.
    ///
    /// Returns `false` when the caller should stop producing.
    pub(crate) async fn emit(&self, event: RunEvent) -> bool {
        if self.is_aborted() {
            return false;
        }
        self.tx.send(event).await.is_ok()
    }

    /// Send the single terminal event.
    pub(crate) async fn finish(self, outcome: RunOutcome) {
        debug!("Run finished: {:?}", outcome);
        let _ = self.tx.send(RunEvent::Finished(outcome)).await;
    }
}
