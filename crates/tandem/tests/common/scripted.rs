//! Scripted provider transports.
//!
//! Each `open`/`run` call plays the next queued script. When the queue is
//! empty the call fails, which surfaces as a provider start error.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use tandem::runner::claude::protocol::{ClaudeLine, ControlOut, ControlRequest};
use tandem::runner::claude::{QueryConnection, QueryRequest, QueryTransport};
use tandem::runner::codex::events::ThreadEvent;
use tandem::runner::codex::{ThreadConnection, ThreadRequest, ThreadTransport};
use tandem::runner::process::StderrTail;
use tandem_protocol::{PermissionDecision, StreamMessage};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// One step of a scripted CLI query.
#[derive(Debug, Clone)]
pub enum QueryStep {
    Message(StreamMessage),
    /// Ask for approval of a tool call, wait for the answer and report the
    /// tool result the provider would produce for it.
    Permission {
        tool_use_id: String,
        tool_name: String,
        input: Value,
    },
    Delay(Duration),
    /// Stay open until the runner lets go of the query.
    Hold,
}

impl QueryStep {
    pub fn permission(tool_use_id: &str, tool_name: &str, input: Value) -> Self {
        QueryStep::Permission {
            tool_use_id: tool_use_id.to_string(),
            tool_name: tool_name.to_string(),
            input,
        }
    }
}

/// Plays queued scripts as CLI queries.
#[derive(Debug, Clone, Default)]
pub struct ScriptedQueryTransport {
    scripts: Arc<Mutex<VecDeque<Vec<QueryStep>>>>,
    requests: Arc<Mutex<Vec<QueryRequest>>>,
    control: Arc<Mutex<Vec<ControlOut>>>,
}

impl ScriptedQueryTransport {
    pub fn new(scripts: Vec<Vec<QueryStep>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts.into())),
            ..Default::default()
        }
    }

    pub fn push_script(&self, steps: Vec<QueryStep>) {
        lock(&self.scripts).push_back(steps);
    }

    /// Queries opened so far.
    pub fn requests(&self) -> Vec<QueryRequest> {
        lock(&self.requests).clone()
    }

    /// Everything the runner wrote back, in order.
    pub fn control_messages(&self) -> Vec<ControlOut> {
        lock(&self.control).clone()
    }
}

#[async_trait]
impl QueryTransport for ScriptedQueryTransport {
    async fn open(&self, request: QueryRequest) -> anyhow::Result<QueryConnection> {
        let steps = lock(&self.scripts)
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("no scripted query left"))?;
        lock(&self.requests).push(request);

        let (line_tx, line_rx) = mpsc::channel(64);
        let (control_tx, control_rx) = mpsc::channel(16);
        tokio::spawn(play_query(
            steps,
            line_tx,
            control_rx,
            Arc::clone(&self.control),
        ));

        Ok(QueryConnection {
            lines: ReceiverStream::new(line_rx).boxed(),
            control: control_tx,
            stderr: StderrTail::default(),
            guard: None,
        })
    }
}

async fn play_query(
    steps: Vec<QueryStep>,
    lines: mpsc::Sender<ClaudeLine>,
    mut control_rx: mpsc::Receiver<ControlOut>,
    control_log: Arc<Mutex<Vec<ControlOut>>>,
) {
    let mut control_open = true;
    for step in steps {
        match step {
            QueryStep::Message(message) => {
                if lines.send(ClaudeLine::Message(message)).await.is_err() {
                    return;
                }
            }
            QueryStep::Permission {
                tool_use_id,
                tool_name,
                input,
            } => {
                let request_id = format!("req-{tool_use_id}");
                let line = ClaudeLine::ControlRequest {
                    request_id: request_id.clone(),
                    request: ControlRequest::CanUseTool {
                        tool_name,
                        input,
                        tool_use_id: Some(tool_use_id.clone()),
                    },
                };
                if lines.send(line).await.is_err() {
                    return;
                }

                let decision = loop {
                    let out = tokio::select! {
                        biased;
                        out = control_rx.recv(), if control_open => out,
                        _ = lines.closed() => return,
                    };
                    let Some(out) = out else {
                        control_open = false;
                        continue;
                    };
                    lock(&control_log).push(out.clone());
                    match out {
                        ControlOut::PermissionResponse {
                            request_id: answered,
                            decision,
                            ..
                        } if answered == request_id => break decision,
                        ControlOut::Interrupt => return,
                        _ => {}
                    }
                };

                let result = match decision {
                    PermissionDecision::Allow { .. } => {
                        StreamMessage::tool_result(None, tool_use_id, "ok", false)
                    }
                    PermissionDecision::Deny { message } => StreamMessage::tool_result(
                        None,
                        tool_use_id,
                        message.unwrap_or_else(|| "Permission denied".to_string()),
                        true,
                    ),
                };
                if lines.send(ClaudeLine::Message(result)).await.is_err() {
                    return;
                }
            }
            QueryStep::Delay(duration) => tokio::time::sleep(duration).await,
            QueryStep::Hold => loop {
                tokio::select! {
                    biased;
                    out = control_rx.recv(), if control_open => match out {
                        Some(out) => lock(&control_log).push(out),
                        None => control_open = false,
                    },
                    _ = lines.closed() => return,
                }
            },
        }
    }

    // Record whatever the runner still writes before it closes its input.
    while let Ok(Some(out)) =
        tokio::time::timeout(Duration::from_millis(50), control_rx.recv()).await
    {
        lock(&control_log).push(out);
    }
}

/// One step of a scripted thread turn.
#[derive(Debug, Clone)]
pub enum ThreadStep {
    Event(ThreadEvent),
    Delay(Duration),
    Hold,
}

/// Plays queued scripts as thread turns.
#[derive(Debug, Clone, Default)]
pub struct ScriptedThreadTransport {
    scripts: Arc<Mutex<VecDeque<Vec<ThreadStep>>>>,
    requests: Arc<Mutex<Vec<ThreadRequest>>>,
}

impl ScriptedThreadTransport {
    pub fn new(scripts: Vec<Vec<ThreadStep>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts.into())),
            ..Default::default()
        }
    }

    pub fn push_script(&self, steps: Vec<ThreadStep>) {
        lock(&self.scripts).push_back(steps);
    }

    pub fn requests(&self) -> Vec<ThreadRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl ThreadTransport for ScriptedThreadTransport {
    async fn run(&self, request: ThreadRequest) -> anyhow::Result<ThreadConnection> {
        let steps = lock(&self.scripts)
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("no scripted turn left"))?;
        lock(&self.requests).push(request);

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            for step in steps {
                match step {
                    ThreadStep::Event(event) => {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    ThreadStep::Delay(duration) => tokio::time::sleep(duration).await,
                    ThreadStep::Hold => {
                        tx.closed().await;
                        return;
                    }
                }
            }
        });

        Ok(ThreadConnection {
            events: ReceiverStream::new(rx).boxed(),
            stderr: StderrTail::default(),
            guard: None,
        })
    }
}
