//! OpenAI Chat Completions adapter.
//!
//! Streams content and tool-call-argument deltas. Reasoning-capable model
//! classes take a reasoning-effort parameter instead of thinking blocks.
//! The chat wire format delivers tool calls indexed within one choice, so
//! arguments accumulate per tool-call index until the stream finishes.

use crate::error::{Error, Result};
use crate::model::{
    AssistantMessage, ContentBlock, Message, StopReason, StreamEvent, TextContent, ToolCall, Usage,
    UserContent, now_millis,
};
use crate::models::{self, ModelInfo};
use crate::provider::{Context, EventStream, ModelPrice, Provider, StreamOptions, ToolDef, ToolNameMap};
use crate::providers::classify_status;
use crate::sse::SseStream;
use async_trait::async_trait;
use futures::stream;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::pin::Pin;

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

// ============================================================================
// Provider
// ============================================================================

/// OpenAI Chat Completions provider.
pub struct OpenAiProvider {
    client: reqwest::Client,
    model: String,
    base_url: String,
    provider: String,
    api_key: Option<String>,
    info: ModelInfo,
}

impl OpenAiProvider {
    pub fn new(model: impl Into<String>) -> Self {
        let model = model.into();
        let info = models::lookup(&model);
        Self {
            client: reqwest::Client::new(),
            model,
            base_url: OPENAI_API_URL.to_string(),
            provider: "openai".to_string(),
            api_key: None,
            info,
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    #[must_use]
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    fn build_request(&self, context: &Context, options: &StreamOptions) -> OpenAiRequest {
        let messages = convert_messages(context.system_prompt.as_deref(), &context.messages);
        let name_map = ToolNameMap::build(context.tools.iter().map(|tool| tool.name.as_str()));
        let tools: Option<Vec<OpenAiToolDef>> = if context.tools.is_empty() {
            None
        } else {
            Some(
                context
                    .tools
                    .iter()
                    .map(|tool| convert_tool(tool, &name_map))
                    .collect(),
            )
        };

        // Reasoning models reject the sampling knobs non-reasoning models
        // expect, and vice versa for reasoning_effort.
        let (temperature, reasoning_effort) = if self.info.reasoning {
            (None, Some(options.reasoning_effort.unwrap_or_default()))
        } else {
            (options.temperature, None)
        };

        OpenAiRequest {
            model: self.model.clone(),
            messages,
            tools,
            temperature,
            max_completion_tokens: options.max_tokens,
            reasoning_effort,
            stream: true,
            stream_options: StreamOptionsBody {
                include_usage: true,
            },
        }
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.provider
    }

    fn api(&self) -> &str {
        "openai-completions"
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    fn context_window(&self) -> u32 {
        self.info.context_window
    }

    fn price(&self) -> ModelPrice {
        self.info.price
    }

    fn supports_parallel_tool_calls(&self) -> bool {
        self.info.parallel_tools
    }

    fn raw_messages(&self, messages: &[Message]) -> Value {
        serde_json::to_value(convert_messages(None, messages)).unwrap_or(Value::Null)
    }

    async fn stream(&self, context: &Context, options: &StreamOptions) -> Result<EventStream> {
        let api_key = options
            .api_key
            .clone()
            .or_else(|| self.api_key.clone())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .ok_or_else(|| {
                Error::fatal(
                    self.name(),
                    "missing API key: set OPENAI_API_KEY or configure credentials",
                )
            })?;

        let request_body = self.build_request(context, options);

        let mut request = self
            .client
            .post(&self.base_url)
            .header("Accept", "text/event-stream")
            .header("Authorization", format!("Bearer {api_key}"));
        for (key, value) in &options.headers {
            request = request.header(key, value);
        }

        let response = request.json(&request_body).send().await?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body = response
                .text()
                .await
                .unwrap_or_else(|e| format!("<failed to read body: {e}>"));
            return Err(classify_status(self.name(), status, &body));
        }

        let byte_stream: Pin<Box<dyn Stream<Item = std::io::Result<Vec<u8>>> + Send>> =
            Box::pin(
                response
                    .bytes_stream()
                    .map(|chunk| chunk.map(|b| b.to_vec()).map_err(std::io::Error::other)),
            );
        let event_source = SseStream::new(byte_stream);

        let name_map = ToolNameMap::build(context.tools.iter().map(|tool| tool.name.as_str()));
        let state = StreamState::new(
            event_source,
            self.model.clone(),
            self.api().to_string(),
            self.name().to_string(),
            name_map,
        );

        let stream = stream::unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    if matches!(&event, StreamEvent::Done { .. } | StreamEvent::Error { .. }) {
                        state.done = true;
                    }
                    return Some((Ok(event), state));
                }
                if state.done {
                    return None;
                }
                match state.event_source.next().await {
                    Some(Ok(msg)) => {
                        if msg.data == "[DONE]" {
                            state.finish();
                            continue;
                        }
                        if let Err(e) = state.process_chunk(&msg.data) {
                            state.done = true;
                            return Some((Err(e), state));
                        }
                    }
                    Some(Err(e)) => {
                        state.done = true;
                        let err = Error::transient("openai", format!("SSE error: {e}"));
                        return Some((Err(err), state));
                    }
                    None => {
                        state.finish();
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

// ============================================================================
// Stream State
// ============================================================================

struct PartialToolCall {
    content_index: usize,
    id: String,
    name: String,
    arguments: String,
}

struct StreamState<S>
where
    S: futures::Stream<Item = std::io::Result<Vec<u8>>> + Unpin,
{
    event_source: SseStream<S>,
    partial: AssistantMessage,
    /// Open tool calls by wire index within the choice.
    tool_calls: Vec<PartialToolCall>,
    text_index: Option<usize>,
    finish_reason: Option<StopReason>,
    pending: std::collections::VecDeque<StreamEvent>,
    name_map: ToolNameMap,
    started: bool,
    finished: bool,
    done: bool,
}

impl<S> StreamState<S>
where
    S: futures::Stream<Item = std::io::Result<Vec<u8>>> + Unpin,
{
    fn new(
        event_source: SseStream<S>,
        model: String,
        api: String,
        provider: String,
        name_map: ToolNameMap,
    ) -> Self {
        Self {
            event_source,
            partial: AssistantMessage {
                content: Vec::new(),
                api,
                provider,
                model,
                usage: Usage::default(),
                stop_reason: StopReason::Stop,
                error_message: None,
                timestamp: now_millis(),
            },
            tool_calls: Vec::new(),
            text_index: None,
            finish_reason: None,
            pending: std::collections::VecDeque::new(),
            name_map,
            started: false,
            finished: false,
            done: false,
        }
    }

    fn process_chunk(&mut self, data: &str) -> Result<()> {
        let chunk: OpenAiChunk = serde_json::from_str(data)
            .map_err(|e| Error::fatal("openai", format!("stream parse error: {e}")))?;

        if !self.started {
            self.started = true;
            self.pending.push_back(StreamEvent::Start);
        }

        if let Some(usage) = chunk.usage {
            self.partial.usage.input = usage.prompt_tokens;
            self.partial.usage.output = usage.completion_tokens;
            if let Some(details) = usage.prompt_tokens_details {
                self.partial.usage.cache_read = details.cached_tokens;
                self.partial.usage.input = usage.prompt_tokens.saturating_sub(details.cached_tokens);
            }
            self.partial.usage.recompute_total();
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return Ok(());
        };

        if let Some(content) = choice.delta.content {
            if !content.is_empty() {
                let content_index = match self.text_index {
                    Some(index) => index,
                    None => {
                        let index = self.partial.content.len();
                        self.partial
                            .content
                            .push(ContentBlock::Text(TextContent::new("")));
                        self.text_index = Some(index);
                        self.pending.push_back(StreamEvent::TextStart {
                            content_index: index,
                        });
                        index
                    }
                };
                if let Some(ContentBlock::Text(t)) = self.partial.content.get_mut(content_index) {
                    t.text.push_str(&content);
                }
                self.pending.push_back(StreamEvent::TextDelta {
                    content_index,
                    delta: content,
                });
            }
        }

        for tool_delta in choice.delta.tool_calls {
            let wire_index = tool_delta.index;
            while self.tool_calls.len() <= wire_index {
                let content_index = self.partial.content.len();
                self.partial.content.push(ContentBlock::ToolCall(ToolCall {
                    id: String::new(),
                    name: String::new(),
                    arguments: Value::Null,
                }));
                self.tool_calls.push(PartialToolCall {
                    content_index,
                    id: String::new(),
                    name: String::new(),
                    arguments: String::new(),
                });
            }
            let partial = &mut self.tool_calls[wire_index];
            if let Some(id) = tool_delta.id {
                partial.id = id;
            }
            if let Some(function) = tool_delta.function {
                let mut started = false;
                if let Some(name) = function.name {
                    partial.name = name;
                    started = true;
                }
                if started {
                    self.pending.push_back(StreamEvent::ToolCallStart {
                        content_index: partial.content_index,
                        id: partial.id.clone(),
                        name: partial.name.clone(),
                    });
                }
                if let Some(arguments) = function.arguments {
                    partial.arguments.push_str(&arguments);
                    self.pending.push_back(StreamEvent::ToolCallDelta {
                        content_index: partial.content_index,
                        delta: arguments,
                    });
                }
            }
        }

        if let Some(reason) = choice.finish_reason {
            self.finish_reason = Some(match reason.as_str() {
                "tool_calls" | "function_call" => StopReason::ToolUse,
                "length" => StopReason::Length,
                "content_filter" => StopReason::Refusal,
                _ => StopReason::Stop,
            });
        }

        Ok(())
    }

    /// Seal open blocks and queue the Done event.
    fn finish(&mut self) {
        if self.finished {
            self.done = self.pending.is_empty();
            return;
        }
        self.finished = true;

        if let Some(index) = self.text_index.take() {
            if let Some(ContentBlock::Text(t)) = self.partial.content.get(index) {
                self.pending.push_back(StreamEvent::TextEnd {
                    content_index: index,
                    content: t.text.clone(),
                });
            }
        }

        for partial in self.tool_calls.drain(..) {
            let arguments: Value = if partial.arguments.is_empty() {
                json!({})
            } else {
                serde_json::from_str(&partial.arguments).unwrap_or(Value::Null)
            };
            let name = self
                .name_map
                .from_wire(&partial.name)
                .map_or(partial.name.clone(), ToString::to_string);
            let tool_call = ToolCall {
                id: partial.id,
                name,
                arguments: arguments.clone(),
            };
            if let Some(ContentBlock::ToolCall(tc)) =
                self.partial.content.get_mut(partial.content_index)
            {
                *tc = tool_call.clone();
            }
            self.pending.push_back(StreamEvent::ToolCallEnd {
                content_index: partial.content_index,
                tool_call,
            });
        }

        let reason = self.finish_reason.take().unwrap_or(StopReason::Stop);
        self.partial.stop_reason = reason;
        self.pending.push_back(StreamEvent::Done {
            reason,
            message: std::mem::take(&mut self.partial),
        });
    }
}

// ============================================================================
// Wire Conversion
// ============================================================================

fn convert_messages(system_prompt: Option<&str>, messages: &[Message]) -> Vec<Value> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    if let Some(system) = system_prompt {
        out.push(json!({"role": "system", "content": system}));
    }
    for message in messages {
        match message {
            Message::User(user) => match &user.content {
                UserContent::Text(text) => {
                    out.push(json!({"role": "user", "content": text}));
                }
                UserContent::Blocks(blocks) => {
                    let parts: Vec<Value> = blocks
                        .iter()
                        .filter_map(|block| match block {
                            ContentBlock::Text(t) => {
                                Some(json!({"type": "text", "text": t.text}))
                            }
                            ContentBlock::Image(image) => Some(json!({
                                "type": "image_url",
                                "image_url": {
                                    "url": format!(
                                        "data:{};base64,{}",
                                        image.mime_type, image.data
                                    ),
                                },
                            })),
                            _ => None,
                        })
                        .collect();
                    out.push(json!({"role": "user", "content": parts}));
                }
            },
            Message::Assistant(assistant) => {
                let text = assistant.text();
                let tool_calls: Vec<Value> = assistant
                    .content
                    .iter()
                    .filter_map(|block| match block {
                        ContentBlock::ToolCall(call) => Some(json!({
                            "id": call.id,
                            "type": "function",
                            "function": {
                                "name": call.name,
                                "arguments": call.arguments.to_string(),
                            },
                        })),
                        _ => None,
                    })
                    .collect();

                let mut entry = json!({"role": "assistant"});
                if !text.is_empty() {
                    entry["content"] = json!(text);
                }
                if !tool_calls.is_empty() {
                    entry["tool_calls"] = json!(tool_calls);
                }
                if !text.is_empty() || !tool_calls.is_empty() {
                    out.push(entry);
                }
            }
            Message::ToolResult(results) => {
                for entry in &results.results {
                    let text: String = entry
                        .content
                        .iter()
                        .filter_map(|block| match block {
                            ContentBlock::Text(t) => Some(t.text.as_str()),
                            _ => None,
                        })
                        .collect::<Vec<_>>()
                        .join("\n");
                    out.push(json!({
                        "role": "tool",
                        "tool_call_id": entry.tool_call_id,
                        "content": text,
                    }));
                }
            }
            Message::Summary(summary) => {
                out.push(json!({
                    "role": "user",
                    "content": format!(
                        "Summary of the conversation so far:\n\n{}", summary.summary
                    ),
                }));
            }
        }
    }
    out
}

fn convert_tool(tool: &ToolDef, name_map: &ToolNameMap) -> OpenAiToolDef {
    OpenAiToolDef {
        r#type: "function",
        function: OpenAiFunctionDef {
            name: name_map
                .to_wire(&tool.name)
                .unwrap_or(tool.name.as_str())
                .to_string(),
            description: tool.description.clone(),
            parameters: tool.parameters.clone(),
        },
    }
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiToolDef>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<crate::provider::ReasoningEffort>,
    stream: bool,
    stream_options: StreamOptionsBody,
}

#[derive(Debug, Serialize)]
struct StreamOptionsBody {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct OpenAiToolDef {
    r#type: &'static str,
    function: OpenAiFunctionDef,
}

#[derive(Debug, Serialize)]
struct OpenAiFunctionDef {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
struct OpenAiChunk {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    #[serde(default)]
    delta: OpenAiDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAiToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCallDelta {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<OpenAiFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct OpenAiFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<OpenAiPromptTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct OpenAiPromptTokensDetails {
    #[serde(default)]
    cached_tokens: u64,
}
