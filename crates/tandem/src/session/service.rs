//! Session service.
//!
//! Orchestrates runs: validates a request, creates or loads the session,
//! registers its abort handle, starts the provider runner and consumes the
//! runner's events in one task per run. Every event is persisted first, then
//! sent to the run's stream and published on the hub.

use std::sync::Arc;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use tandem_protocol::{
    PermissionDecision, Provider, ServerEvent, SessionInfo, SessionStatus, StreamMessage,
};

use super::models::{CreateSessionOptions, SessionHistory, SessionPatch};
use super::registry::SessionRegistry;
use crate::cancel::{CancellationController, RunRegistration};
use crate::error::{Result, TandemError};
use crate::hub::EventHub;
use crate::permission::PermissionBroker;
use crate::runner::{RunContext, RunEvent, RunHandle, RunOutcome, RunRequest, RunnerSet};

/// Buffer size for a run's client stream.
const RUN_STREAM_BUFFER_SIZE: usize = 256;

/// Events of one run, ending after its terminal `session.status`.
pub type RunStream = mpsc::Receiver<ServerEvent>;

/// Request to start a new session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub title: String,
    pub prompt: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub provider: Provider,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default, alias = "externalSessionId")]
    pub external_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// Request to continue an existing provider conversation.
///
/// The session is looked up by `session_id` when given, else by `resume_token`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueRequest {
    pub prompt: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub resume_token: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Delivers a run's events to its client stream and to the hub.
#[derive(Clone)]
struct RunSink {
    tx: mpsc::Sender<ServerEvent>,
    hub: EventHub,
}

impl RunSink {
    async fn emit(&self, event: ServerEvent) {
        self.hub.publish(event.clone());
        if self.tx.send(event).await.is_err() {
            debug!("Run stream receiver dropped");
        }
    }
}

/// Coordinates sessions, runners, permissions and cancellation.
pub struct SessionService {
    registry: Arc<SessionRegistry>,
    runners: RunnerSet,
    controller: CancellationController,
    hub: EventHub,
}

impl std::fmt::Debug for SessionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionService")
            .field("controller", &self.controller)
            .finish_non_exhaustive()
    }
}

impl SessionService {
    pub fn new(registry: Arc<SessionRegistry>, runners: RunnerSet, hub: EventHub) -> Self {
        Self {
            registry,
            runners,
            controller: CancellationController::new(),
            hub,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn controller(&self) -> &CancellationController {
        &self.controller
    }

    fn permissions(&self) -> &Arc<PermissionBroker> {
        self.registry.permissions()
    }

    /// Subscribe to every event the service publishes.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.hub.subscribe()
    }

    /// Create a session and run its first turn.
    pub async fn start(&self, request: StartRequest) -> Result<RunStream> {
        if request.title.trim().is_empty() {
            return Err(TandemError::validation("title is required"));
        }
        if request.prompt.trim().is_empty() {
            return Err(TandemError::validation("prompt is required"));
        }
        if let Some(external_id) = request.external_id.as_deref() {
            if self.controller.is_active(external_id) {
                return Err(TandemError::Conflict(external_id.to_string()));
            }
        }

        let session = self
            .registry
            .create(CreateSessionOptions {
                title: request.title,
                cwd: request.cwd,
                external_id: request.external_id,
                provider: request.provider,
                model: request.model.clone(),
                allowed_tools: request.allowed_tools,
                metadata: request.metadata,
                prompt: None,
            })
            .await?;
        self.publish_session_list().await;

        self.launch(session, request.prompt, None, request.model)
            .await
    }

    /// Run another turn on a session that has a resume token.
    pub async fn continue_session(&self, request: ContinueRequest) -> Result<RunStream> {
        if request.prompt.trim().is_empty() {
            return Err(TandemError::validation("prompt is required"));
        }

        let session = match (request.session_id.as_deref(), request.resume_token.as_deref()) {
            (Some(id), _) => self.registry.get_by_tracking_id(id).await?,
            (None, Some(token)) => self.registry.find_by_resume_token(token).await?,
            (None, None) => {
                return Err(TandemError::validation(
                    "sessionId or resumeToken is required",
                ));
            }
        };
        let Some(session) = session else {
            return Err(TandemError::not_found("session"));
        };

        let Some(token) = request
            .resume_token
            .clone()
            .or_else(|| session.resume_token.clone())
        else {
            return Err(TandemError::validation(format!(
                "session {} has no resume token yet",
                session.id
            )));
        };

        self.launch(session, request.prompt, Some(token), request.model)
            .await
    }

    async fn launch(
        &self,
        session: SessionInfo,
        prompt: String,
        resume_token: Option<String>,
        model: Option<String>,
    ) -> Result<RunStream> {
        let registration = self.controller.register(session.tracking_id())?;

        let session = self
            .registry
            .update(
                &session.id,
                SessionPatch {
                    status: Some(SessionStatus::Running),
                    last_prompt: Some(prompt.clone()),
                    model: model.clone(),
                    ..Default::default()
                },
            )
            .await?
            .ok_or_else(|| TandemError::not_found("session"))?;
        info!(
            "Starting run for session {} (provider {}, resume: {})",
            session.id,
            session.provider,
            resume_token.is_some()
        );

        let (tx, rx) = mpsc::channel(RUN_STREAM_BUFFER_SIZE);
        let sink = RunSink {
            tx,
            hub: self.hub.clone(),
        };

        sink.emit(ServerEvent::SessionStatus {
            session_id: session.id.clone(),
            status: SessionStatus::Running,
            title: Some(session.title.clone()),
            cwd: session.cwd.clone(),
            error: None,
        })
        .await;

        let prompt_message = StreamMessage::user_prompt(prompt.clone());
        self.registry
            .record_message(&session.id, &prompt_message)
            .await?;
        sink.emit(ServerEvent::StreamUserPrompt {
            session_id: session.id.clone(),
            prompt: prompt.clone(),
        })
        .await;

        let runner = self.runners.get(session.provider);
        let started = runner
            .start(
                RunRequest {
                    prompt,
                    session: session.clone(),
                    resume_token,
                    model,
                },
                RunContext {
                    cancel: registration.token(),
                    permissions: Arc::clone(self.permissions()),
                },
            )
            .await;

        let run = RunTask {
            registry: Arc::clone(&self.registry),
            session,
            registration,
            sink,
        };
        match started {
            Ok(handle) => {
                tokio::spawn(run.consume(handle));
            }
            Err(e) => {
                warn!("Runner failed to start: {}", e);
                run.finish(RunOutcome::Failed(e.to_string())).await;
            }
        }

        Ok(rx)
    }

    /// Signal the run of a session (by id or external id) to stop.
    ///
    /// Returns whether a live run was found.
    pub async fn stop(&self, id: &str) -> Result<bool> {
        let tracking_id = match self.registry.get_by_tracking_id(id).await? {
            Some(session) => session.tracking_id().to_string(),
            None => id.to_string(),
        };
        Ok(self.controller.stop(&tracking_id))
    }

    /// Deliver a human decision for a parked tool call.
    pub async fn respond_permission(
        &self,
        session_id: &str,
        tool_use_id: &str,
        decision: PermissionDecision,
    ) -> Result<bool> {
        if self
            .permissions()
            .resolve(session_id, tool_use_id, decision.clone())
        {
            return Ok(true);
        }
        // The caller may know the session by its external id.
        match self.registry.get_by_tracking_id(session_id).await? {
            Some(session) if session.id != session_id => Ok(self
                .permissions()
                .resolve(&session.id, tool_use_id, decision)),
            _ => Ok(false),
        }
    }

    /// Stop any active run, then remove the session and its messages.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let Some(session) = self.registry.get_by_tracking_id(id).await? else {
            return Err(TandemError::not_found(format!("session {id}")));
        };
        let tracking_id = session.tracking_id().to_string();

        if self.controller.stop(&tracking_id) {
            info!("Stopping active run before deleting session {}", session.id);
        }
        self.permissions().deny_all(&session.id);
        self.controller.wait_released(&tracking_id).await;

        self.registry.delete(&session.id).await?;
        self.hub.publish(ServerEvent::SessionDeleted {
            session_id: session.id.clone(),
        });
        self.publish_session_list().await;
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<SessionInfo>> {
        self.registry.list().await
    }

    pub async fn get(&self, id: &str) -> Result<SessionInfo> {
        self.registry
            .get_by_tracking_id(id)
            .await?
            .ok_or_else(|| TandemError::not_found(format!("session {id}")))
    }

    pub async fn history(&self, id: &str) -> Result<SessionHistory> {
        let session = self.get(id).await?;
        self.registry
            .history(&session.id)
            .await?
            .ok_or_else(|| TandemError::not_found(format!("session {id}")))
    }

    pub async fn recent_cwds(&self, limit: usize) -> Result<Vec<String>> {
        self.registry.list_recent_cwds(limit).await
    }

    /// Signal every active run. Used on shutdown.
    pub fn stop_all(&self) -> usize {
        self.controller.stop_all()
    }

    async fn publish_session_list(&self) {
        match self.registry.list().await {
            Ok(sessions) => self.hub.publish(ServerEvent::SessionList { sessions }),
            Err(e) => warn!("Failed to list sessions for broadcast: {}", e),
        }
    }
}

/// The consuming side of one run.
struct RunTask {
    registry: Arc<SessionRegistry>,
    session: SessionInfo,
    registration: RunRegistration,
    sink: RunSink,
}

impl RunTask {
    async fn consume(mut self, mut handle: RunHandle) {
        let mut outcome = None;

        while let Some(event) = handle.events.recv().await {
            match event {
                RunEvent::Message(mut message) => {
                    if self.registration.is_cancelled() {
                        continue;
                    }
                    message.ensure_uuid();
                    self.on_message(message).await;
                }
                RunEvent::PermissionRequest {
                    tool_use_id,
                    tool_name,
                    input,
                } => {
                    if self.registration.is_cancelled() {
                        continue;
                    }
                    self.sink
                        .emit(ServerEvent::PermissionRequest {
                            session_id: self.session.id.clone(),
                            tool_use_id,
                            tool_name,
                            input,
                        })
                        .await;
                }
                RunEvent::Finished(finished) => {
                    outcome = Some(finished);
                    break;
                }
            }
        }

        let outcome = outcome
            .unwrap_or_else(|| RunOutcome::Failed("runner stopped without finishing".to_string()));
        self.finish(outcome).await;
    }

    async fn on_message(&mut self, message: StreamMessage) {
        let session_id = self.session.id.clone();
        if let Err(e) = self.registry.record_message(&session_id, &message).await {
            // Clients only see what history can replay.
            error!(
                "Failed to record message for session {}, reporting an error instead: {}",
                session_id, e
            );
            self.sink
                .emit(ServerEvent::RunnerError {
                    session_id: Some(session_id),
                    message: format!("failed to persist message: {e}"),
                })
                .await;
            return;
        }

        if let Some(token) = message.resume_token() {
            if self.session.resume_token.as_deref() != Some(token) {
                match self
                    .registry
                    .update(&session_id, SessionPatch::resume_token(token))
                    .await
                {
                    Ok(Some(updated)) => self.session = updated,
                    Ok(None) => warn!("Session {} vanished while running", session_id),
                    Err(e) => error!(
                        "Failed to store resume token for session {}: {}",
                        session_id, e
                    ),
                }
            }
        }

        self.sink
            .emit(ServerEvent::StreamMessage {
                session_id,
                message,
            })
            .await;
    }

    /// Write the terminal status, release the run, then announce it.
    async fn finish(self, outcome: RunOutcome) {
        let session_id = self.session.id.clone();
        self.registry.permissions().deny_all(&session_id);

        // Abort wins when signalled before the final status write, so the
        // flag is read as late as possible.
        let (status, error) = if self.registration.is_cancelled() {
            (SessionStatus::Idle, None)
        } else {
            match outcome {
                RunOutcome::Completed => (SessionStatus::Completed, None),
                RunOutcome::Failed(message) => (SessionStatus::Error, Some(message)),
                RunOutcome::Aborted => (SessionStatus::Idle, None),
            }
        };
        let session = match self
            .registry
            .update(&session_id, SessionPatch::status(status))
            .await
        {
            Ok(Some(session)) => session,
            Ok(None) => self.session.clone(),
            Err(e) => {
                error!("Failed to store final status for session {}: {}", session_id, e);
                self.session.clone()
            }
        };
        info!("Run for session {} ended: {}", session_id, status);
        self.registration.release();

        if let Some(message) = error.as_ref() {
            self.sink
                .emit(ServerEvent::RunnerError {
                    session_id: Some(session_id.clone()),
                    message: message.clone(),
                })
                .await;
        }
        self.sink
            .emit(ServerEvent::SessionStatus {
                session_id,
                status,
                title: Some(session.title),
                cwd: session.cwd,
                error,
            })
            .await;
    }
}
