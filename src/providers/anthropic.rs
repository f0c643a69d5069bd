//! Anthropic Messages API adapter.
//!
//! Streams text, thinking (with signatures), and tool-use deltas over SSE.
//! Supports extended-thinking token budgets, prompt caching via a
//! `cache_control` marker on the last content block, and interleaved
//! thinking between tool results.

use crate::error::{Error, Result};
use crate::model::{
    AssistantMessage, ContentBlock, Message, StopReason, StreamEvent, TextContent, ThinkingContent,
    ThinkingLevel, ToolCall, Usage, UserContent, now_millis,
};
use crate::models::{self, ModelInfo};
use crate::provider::{
    CacheRetention, Context, EventStream, ModelPrice, Provider, StreamOptions, ToolDef,
    ToolNameMap,
};
use crate::providers::classify_status;
use crate::sse::SseStream;
use async_trait::async_trait;
use futures::stream;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::pin::Pin;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 8192;

// ============================================================================
// Provider
// ============================================================================

/// Anthropic Messages API provider.
pub struct AnthropicProvider {
    client: reqwest::Client,
    model: String,
    base_url: String,
    provider: String,
    api_key: Option<String>,
    info: ModelInfo,
}

impl AnthropicProvider {
    pub fn new(model: impl Into<String>) -> Self {
        let model = model.into();
        let info = models::lookup(&model);
        Self {
            client: reqwest::Client::new(),
            model,
            base_url: ANTHROPIC_API_URL.to_string(),
            provider: "anthropic".to_string(),
            api_key: None,
            info,
        }
    }

    /// Override the base URL (proxies, test servers).
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

    /// Build the request body for the Messages API.
    fn build_request(&self, context: &Context, options: &StreamOptions) -> AnthropicRequest {
        let mut messages = convert_messages(&context.messages);

        // The runtime marks the last content block of each turn as
        // cacheable so the provider reuses the shared prefix.
        if options.cache_retention != CacheRetention::None {
            if let Some(block) = messages
                .last_mut()
                .and_then(|message| message.content.last_mut())
            {
                if let Some(obj) = block.as_object_mut() {
                    obj.insert("cache_control".to_string(), json!({"type": "ephemeral"}));
                }
            }
        }

        let name_map = ToolNameMap::build(context.tools.iter().map(|tool| tool.name.as_str()));
        let tools: Option<Vec<AnthropicTool>> = if context.tools.is_empty() {
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

        let thinking = options.thinking_level.and_then(|level| {
            if level == ThinkingLevel::Off {
                None
            } else {
                let budget = options
                    .thinking_budgets
                    .as_ref()
                    .map_or_else(|| level.default_budget(), |b| b.budget_for(level));
                Some(AnthropicThinking {
                    r#type: "enabled",
                    budget_tokens: budget,
                })
            }
        });

        let mut max_tokens = options
            .max_tokens
            .unwrap_or(self.info.max_output_tokens.min(DEFAULT_MAX_TOKENS));
        if let Some(t) = &thinking {
            if max_tokens <= t.budget_tokens {
                max_tokens = t.budget_tokens + 4096;
            }
        }

        AnthropicRequest {
            model: self.model.clone(),
            messages,
            system: context.system_prompt.clone(),
            max_tokens,
            temperature: options.temperature,
            tools,
            stream: true,
            thinking,
        }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.provider
    }

    fn api(&self) -> &str {
        "anthropic-messages"
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

    fn raw_messages(&self, messages: &[Message]) -> Value {
        serde_json::to_value(convert_messages(messages)).unwrap_or(Value::Null)
    }

    async fn stream(&self, context: &Context, options: &StreamOptions) -> Result<EventStream> {
        let api_key = options
            .api_key
            .clone()
            .or_else(|| self.api_key.clone())
            .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
            .ok_or_else(|| {
                Error::fatal(
                    self.name(),
                    "missing API key: set ANTHROPIC_API_KEY or configure credentials",
                )
            })?;

        let request_body = self.build_request(context, options);

        let mut request = self
            .client
            .post(&self.base_url)
            .header("Accept", "text/event-stream")
            .header("anthropic-version", ANTHROPIC_API_VERSION)
            .header("X-API-Key", &api_key);

        if options.cache_retention != CacheRetention::None {
            request = request.header("anthropic-beta", "prompt-caching-2024-07-31");
        }
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
            if state.done {
                return None;
            }
            loop {
                match state.event_source.next().await {
                    Some(Ok(msg)) => {
                        if msg.event == "ping" {
                            continue;
                        }
                        match state.process_event(&msg.data) {
                            Ok(Some(event)) => {
                                if matches!(
                                    &event,
                                    StreamEvent::Done { .. } | StreamEvent::Error { .. }
                                ) {
                                    state.done = true;
                                }
                                return Some((Ok(event), state));
                            }
                            Ok(None) => {}
                            Err(e) => {
                                state.done = true;
                                return Some((Err(e), state));
                            }
                        }
                    }
                    Some(Err(e)) => {
                        state.done = true;
                        let err = Error::transient("anthropic", format!("SSE error: {e}"));
                        return Some((Err(err), state));
                    }
                    // Stream ended before message_stop (network disconnect).
                    // Emit Done so the loop receives the partial message.
                    None => {
                        state.done = true;
                        let reason = state.partial.stop_reason;
                        let message = std::mem::take(&mut state.partial);
                        return Some((Ok(StreamEvent::Done { reason, message }), state));
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

struct StreamState<S>
where
    S: futures::Stream<Item = std::io::Result<Vec<u8>>> + Unpin,
{
    event_source: SseStream<S>,
    partial: AssistantMessage,
    current_tool_json: String,
    current_tool_id: Option<String>,
    current_tool_name: Option<String>,
    name_map: ToolNameMap,
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
            current_tool_json: String::new(),
            current_tool_id: None,
            current_tool_name: None,
            name_map,
            done: false,
        }
    }

    fn process_event(&mut self, data: &str) -> Result<Option<StreamEvent>> {
        let event: AnthropicStreamEvent = serde_json::from_str(data)
            .map_err(|e| Error::fatal("anthropic", format!("stream parse error: {e}")))?;

        match event {
            AnthropicStreamEvent::MessageStart { message } => {
                if let Some(usage) = message.usage {
                    self.partial.usage.input = usage.input_tokens;
                    self.partial.usage.cache_read =
                        usage.cache_read_input_tokens.unwrap_or_default();
                    self.partial.usage.cache_write =
                        usage.cache_creation_input_tokens.unwrap_or_default();
                    self.partial.usage.recompute_total();
                }
                Ok(Some(StreamEvent::Start))
            }
            AnthropicStreamEvent::ContentBlockStart {
                index,
                content_block,
            } => Ok(Some(self.handle_block_start(index as usize, content_block))),
            AnthropicStreamEvent::ContentBlockDelta { index, delta } => {
                Ok(self.handle_block_delta(index as usize, delta))
            }
            AnthropicStreamEvent::ContentBlockStop { index } => {
                Ok(self.handle_block_stop(index as usize))
            }
            AnthropicStreamEvent::MessageDelta { delta, usage } => {
                if let Some(stop_reason) = delta.stop_reason {
                    self.partial.stop_reason = match stop_reason {
                        AnthropicStopReason::MaxTokens => StopReason::Length,
                        AnthropicStopReason::ToolUse => StopReason::ToolUse,
                        AnthropicStopReason::Refusal => StopReason::Refusal,
                        AnthropicStopReason::EndTurn | AnthropicStopReason::StopSequence => {
                            StopReason::Stop
                        }
                    };
                }
                if let Some(u) = usage {
                    self.partial.usage.output = u.output_tokens;
                    self.partial.usage.recompute_total();
                }
                Ok(None)
            }
            AnthropicStreamEvent::MessageStop => {
                let reason = self.partial.stop_reason;
                Ok(Some(StreamEvent::Done {
                    reason,
                    message: std::mem::take(&mut self.partial),
                }))
            }
            AnthropicStreamEvent::Error { error } => {
                self.partial.stop_reason = StopReason::Error;
                self.partial.error_message = Some(error.message);
                Ok(Some(StreamEvent::Error {
                    reason: StopReason::Error,
                    message: std::mem::take(&mut self.partial),
                }))
            }
            AnthropicStreamEvent::Ping => Ok(None),
        }
    }

    fn handle_block_start(
        &mut self,
        content_index: usize,
        content_block: AnthropicContentBlock,
    ) -> StreamEvent {
        match content_block {
            AnthropicContentBlock::Text => {
                self.partial
                    .content
                    .push(ContentBlock::Text(TextContent::new("")));
                StreamEvent::TextStart { content_index }
            }
            AnthropicContentBlock::Thinking => {
                self.partial
                    .content
                    .push(ContentBlock::Thinking(ThinkingContent {
                        thinking: String::new(),
                        signature: None,
                    }));
                StreamEvent::ThinkingStart { content_index }
            }
            AnthropicContentBlock::RedactedThinking { data } => {
                self.partial
                    .content
                    .push(ContentBlock::Redacted(crate::model::RedactedContent {
                        data: json!({"type": "redacted_thinking", "data": data}),
                    }));
                StreamEvent::ThinkingStart { content_index }
            }
            AnthropicContentBlock::ToolUse { id, name } => {
                // Reverse the wire normalization back to the registry name.
                let name = self
                    .name_map
                    .from_wire(&name)
                    .map_or(name.clone(), ToString::to_string);
                self.current_tool_json.clear();
                self.current_tool_id = Some(id.clone());
                self.current_tool_name = Some(name.clone());
                self.partial.content.push(ContentBlock::ToolCall(ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: Value::Null,
                }));
                StreamEvent::ToolCallStart {
                    content_index,
                    id,
                    name,
                }
            }
        }
    }

    fn handle_block_delta(
        &mut self,
        content_index: usize,
        delta: AnthropicDelta,
    ) -> Option<StreamEvent> {
        match delta {
            AnthropicDelta::TextDelta { text } => {
                if let Some(ContentBlock::Text(t)) = self.partial.content.get_mut(content_index) {
                    t.text.push_str(&text);
                }
                Some(StreamEvent::TextDelta {
                    content_index,
                    delta: text,
                })
            }
            AnthropicDelta::ThinkingDelta { thinking } => {
                if let Some(ContentBlock::Thinking(t)) = self.partial.content.get_mut(content_index)
                {
                    t.thinking.push_str(&thinking);
                }
                Some(StreamEvent::ThinkingDelta {
                    content_index,
                    delta: thinking,
                })
            }
            AnthropicDelta::InputJsonDelta { partial_json } => {
                self.current_tool_json.push_str(&partial_json);
                Some(StreamEvent::ToolCallDelta {
                    content_index,
                    delta: partial_json,
                })
            }
            AnthropicDelta::SignatureDelta { signature } => {
                // Delivers the thinking signature required for multi-turn
                // extended thinking.
                if let Some(ContentBlock::Thinking(t)) = self.partial.content.get_mut(content_index)
                {
                    t.signature = Some(signature);
                }
                None
            }
        }
    }

    fn handle_block_stop(&mut self, content_index: usize) -> Option<StreamEvent> {
        match self.partial.content.get_mut(content_index) {
            Some(ContentBlock::Text(t)) => Some(StreamEvent::TextEnd {
                content_index,
                content: t.text.clone(),
            }),
            Some(ContentBlock::Thinking(t)) => Some(StreamEvent::ThinkingEnd {
                content_index,
                content: t.thinking.clone(),
            }),
            Some(ContentBlock::ToolCall(tc)) => {
                let arguments: Value = if self.current_tool_json.is_empty() {
                    json!({})
                } else {
                    match serde_json::from_str(&self.current_tool_json) {
                        Ok(args) => args,
                        Err(e) => {
                            tracing::warn!(
                                error = %e,
                                raw = %self.current_tool_json,
                                "failed to parse tool arguments as JSON"
                            );
                            Value::Null
                        }
                    }
                };
                let tool_call = ToolCall {
                    id: self.current_tool_id.take().unwrap_or_default(),
                    name: self.current_tool_name.take().unwrap_or_default(),
                    arguments: arguments.clone(),
                };
                tc.arguments = arguments;
                self.current_tool_json.clear();
                Some(StreamEvent::ToolCallEnd {
                    content_index,
                    tool_call,
                })
            }
            _ => None,
        }
    }
}

// ============================================================================
// Wire Conversion
// ============================================================================

fn convert_messages(messages: &[Message]) -> Vec<AnthropicMessage> {
    let mut out = Vec::with_capacity(messages.len());
    for message in messages {
        match message {
            Message::User(user) => {
                let content = match &user.content {
                    UserContent::Text(text) => vec![json!({"type": "text", "text": text})],
                    UserContent::Blocks(blocks) => blocks.iter().filter_map(user_block).collect(),
                };
                if !content.is_empty() {
                    out.push(AnthropicMessage {
                        role: "user",
                        content,
                    });
                }
            }
            Message::Assistant(assistant) => {
                let content: Vec<Value> =
                    assistant.content.iter().filter_map(assistant_block).collect();
                if !content.is_empty() {
                    out.push(AnthropicMessage {
                        role: "assistant",
                        content,
                    });
                }
            }
            Message::ToolResult(results) => {
                let content: Vec<Value> = results
                    .results
                    .iter()
                    .map(|entry| {
                        let text: String = entry
                            .content
                            .iter()
                            .filter_map(|block| match block {
                                ContentBlock::Text(t) => Some(t.text.as_str()),
                                _ => None,
                            })
                            .collect::<Vec<_>>()
                            .join("\n");
                        json!({
                            "type": "tool_result",
                            "tool_use_id": entry.tool_call_id,
                            "content": [{"type": "text", "text": text}],
                            "is_error": entry.is_error,
                        })
                    })
                    .collect();
                out.push(AnthropicMessage {
                    role: "user",
                    content,
                });
            }
            Message::Summary(summary) => {
                out.push(AnthropicMessage {
                    role: "user",
                    content: vec![json!({
                        "type": "text",
                        "text": format!("Summary of the conversation so far:\n\n{}", summary.summary),
                    })],
                });
            }
        }
    }
    out
}

fn user_block(block: &ContentBlock) -> Option<Value> {
    match block {
        ContentBlock::Text(t) => Some(json!({"type": "text", "text": t.text})),
        ContentBlock::Image(image) => Some(json!({
            "type": "image",
            "source": {
                "type": "base64",
                "media_type": image.mime_type,
                "data": image.data,
            },
        })),
        ContentBlock::Redacted(r) => Some(r.data.clone()),
        _ => None,
    }
}

fn assistant_block(block: &ContentBlock) -> Option<Value> {
    match block {
        ContentBlock::Text(t) => {
            if t.text.is_empty() {
                None
            } else {
                Some(json!({"type": "text", "text": t.text}))
            }
        }
        ContentBlock::Thinking(t) => Some(json!({
            "type": "thinking",
            "thinking": t.thinking,
            "signature": t.signature.clone().unwrap_or_default(),
        })),
        ContentBlock::ToolCall(call) => Some(json!({
            "type": "tool_use",
            "id": call.id,
            "name": call.name,
            "input": if call.arguments.is_null() { json!({}) } else { call.arguments.clone() },
        })),
        // Opaque blocks (e.g. redacted thinking) are echoed back unchanged.
        ContentBlock::Redacted(r) => Some(r.data.clone()),
        ContentBlock::Image(_) => None,
    }
}

fn convert_tool(tool: &ToolDef, name_map: &ToolNameMap) -> AnthropicTool {
    AnthropicTool {
        name: name_map
            .to_wire(&tool.name)
            .unwrap_or(tool.name.as_str())
            .to_string(),
        description: tool.description.clone(),
        input_schema: tool.parameters.clone(),
    }
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<AnthropicThinking>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<Value>,
}

#[derive(Debug, Serialize)]
struct AnthropicThinking {
    r#type: &'static str,
    budget_tokens: u32,
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicStreamEvent {
    MessageStart {
        message: AnthropicMessageStart,
    },
    ContentBlockStart {
        index: u32,
        content_block: AnthropicContentBlock,
    },
    ContentBlockDelta {
        index: u32,
        delta: AnthropicDelta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        delta: AnthropicMessageDelta,
        #[serde(default)]
        usage: Option<AnthropicDeltaUsage>,
    },
    MessageStop,
    Error {
        error: AnthropicError,
    },
    Ping,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageStart {
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
    #[serde(default)]
    cache_creation_input_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text,
    Thinking,
    RedactedThinking {
        #[serde(default)]
        data: String,
    },
    ToolUse {
        id: String,
        name: String,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicDelta {
    TextDelta {
        #[serde(default)]
        text: String,
    },
    ThinkingDelta {
        #[serde(default)]
        thinking: String,
    },
    InputJsonDelta {
        #[serde(default)]
        partial_json: String,
    },
    SignatureDelta {
        #[serde(default)]
        signature: String,
    },
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageDelta {
    #[serde(default)]
    stop_reason: Option<AnthropicStopReason>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum AnthropicStopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
    Refusal,
}

#[derive(Debug, Deserialize)]
struct AnthropicDeltaUsage {
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    #[serde(default)]
    message: String,
}
