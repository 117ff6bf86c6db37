//! Translator from thread API events to canonical stream messages.
//!
//! ## Rules
//!
//! 1. One thread event produces 0..N canonical messages, in order.
//! 2. Tool-like items become an assistant `tool_use` followed by exactly one
//!    user `tool_result`. A result never precedes its tool use: when an item
//!    completes without a started phase, the tool use is synthesised first.
//! 3. Text, reasoning, todo and error items are rendered once, on completion.
//! 4. The translator is stateful: it remembers the thread id and which items
//!    have been announced or finished.

use std::collections::HashSet;

use serde_json::{Value, json};

use tandem_protocol::{ContentBlock, StreamMessage, Usage};

use super::events::{ItemStatus, ThreadEvent, ThreadItem, ThreadUsage};

/// Translates thread events into canonical messages for one run.
#[derive(Debug, Default)]
pub struct ThreadTranslator {
    /// Provider thread id, used as the resume token.
    thread_id: Option<String>,
    model: Option<String>,
    cwd: Option<String>,
    /// Tool items whose `tool_use` was emitted.
    announced: HashSet<String>,
    /// Tool items whose `tool_result` was emitted.
    finished: HashSet<String>,
}

impl ThreadTranslator {
    pub fn new(model: Option<String>, cwd: Option<String>) -> Self {
        Self {
            model,
            cwd,
            ..Default::default()
        }
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }

    /// Translate one event into zero or more canonical messages.
    pub fn translate(&mut self, event: &ThreadEvent) -> Vec<StreamMessage> {
        match event {
            ThreadEvent::ThreadStarted { thread_id } => self.on_thread_started(thread_id),
            ThreadEvent::TurnStarted | ThreadEvent::Unknown => vec![],
            ThreadEvent::ItemStarted { item } => self.on_item_started(item),
            ThreadEvent::ItemUpdated { item } => self.on_item_updated(item),
            ThreadEvent::ItemCompleted { item } => self.on_item_completed(item),
            ThreadEvent::TurnCompleted { usage } => vec![StreamMessage::result_success(
                self.thread_id.clone(),
                usage.as_ref().map(convert_usage),
            )],
            ThreadEvent::TurnFailed { error } => vec![
                self.error_text(&error.message),
                StreamMessage::result_error(self.thread_id.clone(), error.message.clone()),
            ],
            ThreadEvent::Error { message } => vec![self.error_text(message)],
        }
    }

    fn on_thread_started(&mut self, thread_id: &str) -> Vec<StreamMessage> {
        self.thread_id = Some(thread_id.to_string());
        vec![StreamMessage::init(
            thread_id,
            self.model.clone(),
            self.cwd.clone(),
        )]
    }

    fn on_item_started(&mut self, item: &ThreadItem) -> Vec<StreamMessage> {
        if !item.is_tool() {
            return vec![];
        }
        self.announce(item).into_iter().collect()
    }

    fn on_item_updated(&mut self, item: &ThreadItem) -> Vec<StreamMessage> {
        if !item.is_tool() {
            return vec![];
        }
        if tool_status(item).is_terminal() {
            return self.finish(item);
        }
        self.announce(item).into_iter().collect()
    }

    fn on_item_completed(&mut self, item: &ThreadItem) -> Vec<StreamMessage> {
        match item {
            ThreadItem::AgentMessage { text, .. } => {
                if text.is_empty() {
                    vec![]
                } else {
                    vec![StreamMessage::assistant_text(self.thread_id.clone(), text)]
                }
            }
            ThreadItem::Reasoning { text, .. } => {
                if text.is_empty() {
                    vec![]
                } else {
                    vec![StreamMessage::assistant(
                        self.thread_id.clone(),
                        vec![ContentBlock::Thinking {
                            thinking: text.clone(),
                            signature: None,
                        }],
                    )]
                }
            }
            ThreadItem::TodoList { items, .. } => {
                let text = items
                    .iter()
                    .map(|todo| {
                        let mark = if todo.completed { '☑' } else { '☐' };
                        format!("{mark} {}", todo.text)
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                vec![StreamMessage::assistant_text(self.thread_id.clone(), text)]
            }
            ThreadItem::Error { message, .. } => vec![self.error_text(message)],
            ThreadItem::Unknown => vec![],
            _ => self.finish(item),
        }
    }

    /// Emit the tool use for `item` unless already emitted.
    fn announce(&mut self, item: &ThreadItem) -> Option<StreamMessage> {
        let id = item.id()?;
        if !self.announced.insert(id.to_string()) {
            return None;
        }
        let (name, input) = tool_call(item)?;
        Some(StreamMessage::tool_use(
            self.thread_id.clone(),
            id,
            name,
            input,
        ))
    }

    /// Emit the tool result for `item` (with its tool use first if needed), once.
    fn finish(&mut self, item: &ThreadItem) -> Vec<StreamMessage> {
        let Some(id) = item.id() else {
            return vec![];
        };
        if self.finished.contains(id) {
            return vec![];
        }
        let mut out: Vec<StreamMessage> = self.announce(item).into_iter().collect();
        let (content, is_error) = tool_output(item);
        self.finished.insert(id.to_string());
        out.push(StreamMessage::tool_result(
            self.thread_id.clone(),
            id,
            content,
            is_error,
        ));
        out
    }

    fn error_text(&self, message: &str) -> StreamMessage {
        StreamMessage::assistant_text(self.thread_id.clone(), format!("Error: {message}"))
    }
}

fn convert_usage(usage: &ThreadUsage) -> Usage {
    Usage {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cache_read_input_tokens: Some(usage.cached_input_tokens),
        cache_creation_input_tokens: None,
    }
}

fn tool_status(item: &ThreadItem) -> ItemStatus {
    match item {
        ThreadItem::CommandExecution { status, .. }
        | ThreadItem::FileChange { status, .. }
        | ThreadItem::McpToolCall { status, .. } => *status,
        // Web searches have no lifecycle status; they are done when completed.
        _ => ItemStatus::InProgress,
    }
}

/// Canonical tool name and input for a tool-like item.
fn tool_call(item: &ThreadItem) -> Option<(String, Value)> {
    match item {
        ThreadItem::CommandExecution { command, .. } => {
            Some(("Bash".to_string(), json!({ "command": command })))
        }
        ThreadItem::McpToolCall {
            server,
            tool,
            arguments,
            ..
        } => Some((format!("mcp__{server}__{tool}"), arguments.clone())),
        ThreadItem::WebSearch { query, .. } => {
            Some(("WebSearch".to_string(), json!({ "query": query })))
        }
        ThreadItem::FileChange { changes, .. } => Some((
            "FileChange".to_string(),
            json!({
                "changes": changes
                    .iter()
                    .map(|change| json!({"path": change.path, "kind": change.kind}))
                    .collect::<Vec<_>>()
            }),
        )),
        _ => None,
    }
}

/// Result text and error flag for a finished tool-like item.
fn tool_output(item: &ThreadItem) -> (String, bool) {
    match item {
        ThreadItem::CommandExecution {
            aggregated_output,
            exit_code,
            status,
            ..
        } => {
            let content = match exit_code {
                Some(code) if aggregated_output.is_empty() => format!("Exit code: {code}"),
                Some(code) => format!("Exit code: {code}\n{aggregated_output}"),
                None => aggregated_output.clone(),
            };
            (content, status.is_error())
        }
        ThreadItem::McpToolCall {
            result,
            error,
            status,
            ..
        } => match error {
            Some(error) => (error.message.clone(), true),
            None => {
                let content = match result {
                    Some(result) => match result.get("content") {
                        Some(content) => ContentBlock::result_text(content),
                        None => result.to_string(),
                    },
                    None => String::new(),
                };
                (content, status.is_error())
            }
        },
        ThreadItem::WebSearch { query, .. } => (format!("Searched: {query}"), false),
        ThreadItem::FileChange {
            changes, status, ..
        } => {
            let listing = changes
                .iter()
                .map(|change| format!("{} {}", change.kind, change.path))
                .collect::<Vec<_>>()
                .join("\n");
            if status.is_error() {
                (format!("Failed to apply changes\n{listing}"), true)
            } else {
                (listing, false)
            }
        }
        _ => (String::new(), false),
    }
}
