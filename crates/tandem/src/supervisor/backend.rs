//! Execution backends.
//!
//! The orchestrator runs either inside the calling process or inside a
//! supervised sidecar reached over HTTP+SSE. Both hand out the same canonical
//! event stream, ending after the run's terminal `session.status`.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use log::{info, warn};
use reqwest::{RequestBuilder, StatusCode};
use reqwest_eventsource::{Event, EventSource, retry::Never};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio_stream::wrappers::ReceiverStream;

use tandem_protocol::{PermissionDecision, ServerEvent, SessionInfo};

use crate::config::AppConfig;
use crate::error::{Result, TandemError};
use crate::session::{ContinueRequest, SessionService, StartRequest};

use super::sidecar::SidecarSupervisor;

/// Canonical events of one run.
pub type EventStream = BoxStream<'static, ServerEvent>;

/// Where the orchestrator executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendMode {
    InProcess,
    Sidecar,
}

impl std::fmt::Display for BackendMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendMode::InProcess => write!(f, "in-process"),
            BackendMode::Sidecar => write!(f, "sidecar"),
        }
    }
}

/// Operations a client can invoke regardless of where the orchestrator runs.
#[async_trait]
pub trait OrchestratorBackend: Send + Sync {
    fn mode(&self) -> BackendMode;

    async fn start(&self, request: StartRequest) -> Result<EventStream>;

    async fn continue_session(&self, request: ContinueRequest) -> Result<EventStream>;

    async fn stop(&self, session_id: &str) -> Result<bool>;

    async fn respond_permission(
        &self,
        session_id: &str,
        tool_use_id: &str,
        decision: PermissionDecision,
    ) -> Result<bool>;

    async fn list(&self) -> Result<Vec<SessionInfo>>;

    async fn delete(&self, session_id: &str) -> Result<()>;

    /// Stop active runs and release backend resources.
    async fn shutdown(&self);
}

/// Runs the orchestrator on this process's runtime.
#[derive(Debug, Clone)]
pub struct InProcessBackend {
    service: Arc<SessionService>,
}

impl InProcessBackend {
    pub fn new(service: Arc<SessionService>) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &Arc<SessionService> {
        &self.service
    }
}

#[async_trait]
impl OrchestratorBackend for InProcessBackend {
    fn mode(&self) -> BackendMode {
        BackendMode::InProcess
    }

    async fn start(&self, request: StartRequest) -> Result<EventStream> {
        let rx = self.service.start(request).await?;
        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn continue_session(&self, request: ContinueRequest) -> Result<EventStream> {
        let rx = self.service.continue_session(request).await?;
        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn stop(&self, session_id: &str) -> Result<bool> {
        self.service.stop(session_id).await
    }

    async fn respond_permission(
        &self,
        session_id: &str,
        tool_use_id: &str,
        decision: PermissionDecision,
    ) -> Result<bool> {
        self.service
            .respond_permission(session_id, tool_use_id, decision)
            .await
    }

    async fn list(&self) -> Result<Vec<SessionInfo>> {
        self.service.list().await
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        self.service.delete(session_id).await
    }

    async fn shutdown(&self) {
        let stopped = self.service.stop_all();
        if stopped > 0 {
            info!("Stopped {} active run(s)", stopped);
        }
    }
}

#[derive(Debug, Deserialize)]
struct StopResponse {
    stopped: bool,
}

#[derive(Debug, Deserialize)]
struct ResolveResponse {
    resolved: bool,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Talks to a supervised sidecar over HTTP+SSE.
#[derive(Debug)]
pub struct SidecarBackend {
    supervisor: Arc<SidecarSupervisor>,
}

impl SidecarBackend {
    pub fn new(supervisor: Arc<SidecarSupervisor>) -> Self {
        Self { supervisor }
    }

    async fn url(&self, path: &str) -> Result<String> {
        let base = self.supervisor.ensure_started().await?;
        Ok(format!("{base}{path}"))
    }

    async fn open_stream(&self, request: RequestBuilder) -> Result<EventStream> {
        let mut source = EventSource::new(request)
            .map_err(|e| TandemError::infrastructure(format!("building sidecar request: {e}")))?;
        // Reconnecting would start a second run.
        source.set_retry_policy(Box::new(Never));

        match source.next().await {
            Some(Ok(Event::Open)) => Ok(sse_events(source)),
            Some(Ok(Event::Message(message))) => {
                let first = parse_event(&message.data);
                Ok(futures::stream::iter(first)
                    .chain(sse_events(source))
                    .boxed())
            }
            Some(Err(reqwest_eventsource::Error::InvalidStatusCode(status, response))) => {
                source.close();
                let body = response.text().await.unwrap_or_default();
                Err(error_from_status(status, &body))
            }
            Some(Err(e)) => {
                source.close();
                Err(TandemError::infrastructure(format!(
                    "sidecar stream failed: {e}"
                )))
            }
            None => Err(TandemError::infrastructure("sidecar closed the stream")),
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| TandemError::infrastructure(format!("sidecar request failed: {e}")))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(error_from_status(status, &body))
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        self.send(request)
            .await?
            .json::<T>()
            .await
            .map_err(|e| TandemError::infrastructure(format!("invalid sidecar response: {e}")))
    }
}

#[async_trait]
impl OrchestratorBackend for SidecarBackend {
    fn mode(&self) -> BackendMode {
        BackendMode::Sidecar
    }

    async fn start(&self, request: StartRequest) -> Result<EventStream> {
        let url = self.url("/sessions/start").await?;
        let builder = self.supervisor.client().post(url).json(&request);
        self.open_stream(builder).await
    }

    async fn continue_session(&self, request: ContinueRequest) -> Result<EventStream> {
        let url = self.url("/sessions/continue").await?;
        let builder = self.supervisor.client().post(url).json(&request);
        self.open_stream(builder).await
    }

    async fn stop(&self, session_id: &str) -> Result<bool> {
        let url = self.url(&format!("/sessions/{session_id}/stop")).await?;
        let response: StopResponse = self
            .send_json(self.supervisor.client().post(url))
            .await?;
        Ok(response.stopped)
    }

    async fn respond_permission(
        &self,
        session_id: &str,
        tool_use_id: &str,
        decision: PermissionDecision,
    ) -> Result<bool> {
        let url = self
            .url(&format!("/sessions/{session_id}/permissions/{tool_use_id}"))
            .await?;
        let response: ResolveResponse = self
            .send_json(self.supervisor.client().post(url).json(&decision))
            .await?;
        Ok(response.resolved)
    }

    async fn list(&self) -> Result<Vec<SessionInfo>> {
        let url = self.url("/sessions").await?;
        let event: ServerEvent = self.send_json(self.supervisor.client().get(url)).await?;
        match event {
            ServerEvent::SessionList { sessions } => Ok(sessions),
            other => Err(TandemError::infrastructure(format!(
                "unexpected sidecar response: {other:?}"
            ))),
        }
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        let url = self.url(&format!("/sessions/{session_id}")).await?;
        self.send(self.supervisor.client().delete(url)).await?;
        Ok(())
    }

    async fn shutdown(&self) {
        self.supervisor.stop().await;
    }
}

fn parse_event(data: &str) -> Option<ServerEvent> {
    match serde_json::from_str(data) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!("Dropping unparseable sidecar event: {}", e);
            None
        }
    }
}

/// Canonical events from an open event source, closing it after the terminal status.
fn sse_events(source: EventSource) -> EventStream {
    futures::stream::unfold(Some(source), |state| async move {
        let mut source = state?;
        loop {
            match source.next().await {
                Some(Ok(Event::Open)) => continue,
                Some(Ok(Event::Message(message))) => {
                    let Some(event) = parse_event(&message.data) else {
                        continue;
                    };
                    if event.is_terminal_status() {
                        source.close();
                        return Some((event, None));
                    }
                    return Some((event, Some(source)));
                }
                Some(Err(reqwest_eventsource::Error::StreamEnded)) | None => {
                    source.close();
                    return None;
                }
                Some(Err(e)) => {
                    source.close();
                    let event = ServerEvent::RunnerError {
                        session_id: None,
                        message: format!("sidecar stream failed: {e}"),
                    };
                    return Some((event, None));
                }
            }
        }
    })
    .boxed()
}

/// Map a sidecar error response back onto the error taxonomy.
pub fn error_from_status(status: StatusCode, body: &str) -> TandemError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .map(|body| body.error)
        .unwrap_or_else(|_| body.trim().to_string());
    match status {
        StatusCode::BAD_REQUEST => TandemError::Validation(
            message
                .strip_prefix("invalid request: ")
                .unwrap_or(&message)
                .to_string(),
        ),
        StatusCode::NOT_FOUND => TandemError::NotFound(
            message
                .strip_suffix(" not found")
                .unwrap_or(&message)
                .to_string(),
        ),
        StatusCode::CONFLICT => TandemError::Conflict(
            message
                .strip_prefix("a run is already active for ")
                .unwrap_or(&message)
                .to_string(),
        ),
        StatusCode::BAD_GATEWAY => TandemError::Provider(message),
        StatusCode::SERVICE_UNAVAILABLE => TandemError::Infrastructure(message),
        _ => TandemError::Storage(anyhow::anyhow!("sidecar returned {status}: {message}")),
    }
}

/// Pick the backend for this process.
///
/// With the sidecar enabled, it is spawned and used; if that fails and
/// fallback is allowed, the orchestrator runs in-process instead.
pub async fn connect_backend<F, Fut>(
    config: &AppConfig,
    config_file: Option<&Path>,
    in_process: F,
) -> Result<Arc<dyn OrchestratorBackend>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Arc<SessionService>>>,
{
    if config.sidecar.enabled {
        match start_sidecar(config, config_file).await {
            Ok(backend) => return Ok(backend),
            Err(e) if config.sidecar.fallback_in_process => {
                warn!("Sidecar unavailable, running in-process: {}", e);
            }
            Err(e) => return Err(e),
        }
    }

    let service = in_process().await?;
    info!("Orchestrator running in-process");
    Ok(Arc::new(InProcessBackend::new(service)))
}

async fn start_sidecar(
    config: &AppConfig,
    config_file: Option<&Path>,
) -> Result<Arc<dyn OrchestratorBackend>> {
    let mut supervisor = SidecarSupervisor::from_config(&config.sidecar)?;
    if let Some(path) = config_file {
        supervisor = supervisor.with_config_file(path);
    }
    let supervisor = Arc::new(supervisor);
    let base_url = supervisor.ensure_started().await?;
    info!("Orchestrator running in sidecar at {}", base_url);
    Ok(Arc::new(SidecarBackend::new(supervisor)))
}
