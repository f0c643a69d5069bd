//! Shared test harness: a scripted provider and mock tools.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{Value, json};
use skein::cancel::CancelToken;
use skein::error::{Error, Result};
use skein::events::{EventHandler, ThreadEvent};
use skein::model::{
    AssistantMessage, ContentBlock, Message, StopReason, StreamEvent, TextContent, ToolCall, Usage,
    now_millis,
};
use skein::provider::{Context, EventStream, ModelPrice, Provider, StreamOptions};
use skein::tools::{
    StructuredToolResult, Tool, ToolInvocation, ToolRegistry, ToolResultData, ToolState,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Scripted Provider
// ============================================================================

/// One scripted assistant turn.
#[derive(Debug, Clone)]
pub enum Turn {
    /// Plain text answer; ends the exchange.
    Text(String),
    /// Tool calls: `(call_id, tool_name, arguments)`.
    ToolCalls(Vec<(String, String, Value)>),
    /// Fail the stream before any event.
    TransientFailure(String),
}

/// Provider that replays a scripted sequence of turns.
pub struct ScriptedProvider {
    turns: Mutex<VecDeque<Turn>>,
    /// Message counts of each received request context.
    pub request_message_counts: Mutex<Vec<usize>>,
    /// Tool names advertised on each request.
    pub request_tool_names: Mutex<Vec<Vec<String>>>,
    pub stream_calls: AtomicUsize,
    context_window: u32,
    usage_per_turn: Usage,
}

impl ScriptedProvider {
    pub fn new(turns: impl IntoIterator<Item = Turn>) -> Self {
        Self {
            turns: Mutex::new(turns.into_iter().collect()),
            request_message_counts: Mutex::new(Vec::new()),
            request_tool_names: Mutex::new(Vec::new()),
            stream_calls: AtomicUsize::new(0),
            context_window: 200_000,
            usage_per_turn: Usage {
                input: 25,
                output: 10,
                cache_read: 0,
                cache_write: 0,
                total_tokens: 35,
                cost: skein::model::Cost::default(),
            },
        }
    }

    #[must_use]
    pub fn with_context_window(mut self, window: u32) -> Self {
        self.context_window = window;
        self
    }

    #[must_use]
    pub fn with_usage(mut self, input: u64, output: u64) -> Self {
        self.usage_per_turn = Usage {
            input,
            output,
            cache_read: 0,
            cache_write: 0,
            total_tokens: input + output,
            cost: skein::model::Cost::default(),
        };
        self
    }

    pub fn calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    fn message(&self, content: Vec<ContentBlock>, stop_reason: StopReason) -> AssistantMessage {
        AssistantMessage {
            content,
            api: "scripted".into(),
            provider: "scripted".into(),
            model: "scripted-model".into(),
            usage: self.usage_per_turn.clone(),
            stop_reason,
            error_message: None,
            timestamp: now_millis(),
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn api(&self) -> &str {
        "scripted"
    }

    fn model_id(&self) -> &str {
        "scripted-model"
    }

    fn context_window(&self) -> u32 {
        self.context_window
    }

    fn price(&self) -> ModelPrice {
        ModelPrice {
            input: 3.0,
            output: 15.0,
            cache_read: 0.3,
            cache_write: 3.75,
        }
    }

    async fn stream(&self, context: &Context, _options: &StreamOptions) -> Result<EventStream> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        self.request_message_counts
            .lock()
            .unwrap()
            .push(context.messages.len());
        self.request_tool_names.lock().unwrap().push(
            context
                .tools
                .iter()
                .map(|tool| tool.name.clone())
                .collect(),
        );

        let turn = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::fatal("scripted", "script exhausted"))?;

        let events: Vec<Result<StreamEvent>> = match turn {
            Turn::TransientFailure(message) => {
                return Err(Error::transient("scripted", message));
            }
            Turn::Text(text) => {
                let message = self.message(
                    vec![ContentBlock::Text(TextContent::new(text.clone()))],
                    StopReason::Stop,
                );
                vec![
                    Ok(StreamEvent::Start),
                    Ok(StreamEvent::TextStart { content_index: 0 }),
                    Ok(StreamEvent::TextDelta {
                        content_index: 0,
                        delta: text.clone(),
                    }),
                    Ok(StreamEvent::TextEnd {
                        content_index: 0,
                        content: text,
                    }),
                    Ok(StreamEvent::Done {
                        reason: StopReason::Stop,
                        message,
                    }),
                ]
            }
            Turn::ToolCalls(calls) => {
                let mut events = vec![Ok(StreamEvent::Start)];
                let mut blocks = Vec::new();
                for (index, (id, name, arguments)) in calls.into_iter().enumerate() {
                    events.push(Ok(StreamEvent::ToolCallStart {
                        content_index: index,
                        id: id.clone(),
                        name: name.clone(),
                    }));
                    let call = ToolCall {
                        id,
                        name,
                        arguments,
                    };
                    events.push(Ok(StreamEvent::ToolCallEnd {
                        content_index: index,
                        tool_call: call.clone(),
                    }));
                    blocks.push(ContentBlock::ToolCall(call));
                }
                let message = self.message(blocks, StopReason::ToolUse);
                events.push(Ok(StreamEvent::Done {
                    reason: StopReason::ToolUse,
                    message,
                }));
                events
            }
        };

        Ok(Box::pin(futures::stream::iter(events)))
    }
}

// ============================================================================
// Mock Tools
// ============================================================================

/// Shell-like tool that sleeps, observing cancellation.
pub struct SleepTool {
    pub duration: Duration,
}

#[async_trait]
impl Tool for SleepTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Run a shell command"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"command": {"type": "string"}},
            "required": ["command"]
        })
    }

    fn validate(&self, input: &Value) -> Result<()> {
        if input.get("command").and_then(Value::as_str).is_some() {
            Ok(())
        } else {
            Err(Error::invalid_tool_input(self.name(), "missing 'command'"))
        }
    }

    async fn execute(
        &self,
        invocation: &ToolInvocation,
        _state: &ToolState,
        cancel: &CancelToken,
    ) -> StructuredToolResult {
        let command = invocation
            .input
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        tokio::select! {
            () = tokio::time::sleep(self.duration) => StructuredToolResult::success(
                self.name(),
                ToolResultData::Shell {
                    command: command.clone(),
                    exit_code: 0,
                    stdout: if command.starts_with("echo ") {
                        format!("{}\n", &command[5..])
                    } else {
                        String::new()
                    },
                    stderr: String::new(),
                    duration_ms: self.duration.as_millis() as u64,
                    cancelled: false,
                },
            ),
            () = cancel.cancelled() => StructuredToolResult::cancelled(self.name()),
        }
    }
}

/// File-read tool over an in-memory filesystem, with per-file delays to
/// exercise out-of-order completion.
pub struct MemoryReadTool {
    pub files: HashMap<String, String>,
    pub delays: HashMap<String, Duration>,
}

impl MemoryReadTool {
    pub fn new(files: impl IntoIterator<Item = (&'static str, &'static str)>) -> Self {
        Self {
            files: files
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            delays: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_delay(mut self, path: &str, delay: Duration) -> Self {
        self.delays.insert(path.to_string(), delay);
        self
    }
}

#[async_trait]
impl Tool for MemoryReadTool {
    fn name(&self) -> &str {
        "file_read"
    }

    fn description(&self) -> &str {
        "Read a file"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"]
        })
    }

    fn concurrency_safe(&self) -> bool {
        true
    }

    fn validate(&self, input: &Value) -> Result<()> {
        if input.get("path").and_then(Value::as_str).is_some() {
            Ok(())
        } else {
            Err(Error::invalid_tool_input(self.name(), "missing 'path'"))
        }
    }

    async fn execute(
        &self,
        invocation: &ToolInvocation,
        state: &ToolState,
        _cancel: &CancelToken,
    ) -> StructuredToolResult {
        let path = invocation
            .input
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if let Some(delay) = self.delays.get(&path) {
            tokio::time::sleep(*delay).await;
        }
        match self.files.get(&path) {
            Some(content) => {
                state.touch_file(&path);
                let lines: Vec<String> = content.lines().map(ToString::to_string).collect();
                StructuredToolResult::success(
                    self.name(),
                    ToolResultData::FileRead {
                        path,
                        offset: 0,
                        total_lines: lines.len(),
                        lines,
                        truncated: false,
                    },
                )
            }
            None => StructuredToolResult::failure(self.name(), format!("no such file: {path}")),
        }
    }
}

// ============================================================================
// Event Collection
// ============================================================================

/// Collect every event a send emits.
pub fn collector() -> (EventHandler, Arc<Mutex<Vec<ThreadEvent>>>) {
    let seen: Arc<Mutex<Vec<ThreadEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handler: EventHandler = Arc::new(move |event| {
        sink.lock().unwrap().push(event);
    });
    (handler, seen)
}

pub fn kinds(events: &[ThreadEvent]) -> Vec<String> {
    events
        .iter()
        .map(|event| {
            serde_json::to_value(event).unwrap()["kind"]
                .as_str()
                .unwrap()
                .to_string()
        })
        .collect()
}

/// Registry with the standard mock tool set.
pub fn registry_with(tools: Vec<Arc<dyn Tool>>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for tool in tools {
        registry.register(tool).unwrap();
    }
    registry
}

/// Count messages of each role in a transcript.
pub fn role_counts(messages: &[Message]) -> (usize, usize, usize, usize) {
    let mut user = 0;
    let mut assistant = 0;
    let mut tool_result = 0;
    let mut summary = 0;
    for message in messages {
        match message {
            Message::User(_) => user += 1,
            Message::Assistant(_) => assistant += 1,
            Message::ToolResult(_) => tool_result += 1,
            Message::Summary(_) => summary += 1,
        }
    }
    (user, assistant, tool_result, summary)
}
