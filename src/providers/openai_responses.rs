//! OpenAI Responses API adapter.
//!
//! Stateful variant: after the first turn the adapter passes
//! `previous_response_id` and sends only the messages added since, instead
//! of replaying the whole transcript. Reasoning summary deltas surface as
//! thinking events; function-call items map onto tool-call events.

use crate::error::{Error, Result};
use crate::model::{
    AssistantMessage, ContentBlock, Message, StopReason, StreamEvent, TextContent, ThinkingContent,
    ToolCall, Usage, UserContent, now_millis,
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
use std::sync::{Arc, Mutex};

const OPENAI_RESPONSES_API_URL: &str = "https://api.openai.com/v1/responses";

/// Adapter-side conversation state: the last server response id and how many
/// canonical messages that response already covers.
#[derive(Debug, Clone, Default)]
struct ResponseState {
    response_id: Option<String>,
    covered_messages: usize,
}

// ============================================================================
// Provider
// ============================================================================

/// OpenAI Responses API provider.
pub struct OpenAiResponsesProvider {
    client: reqwest::Client,
    model: String,
    base_url: String,
    provider: String,
    api_key: Option<String>,
    info: ModelInfo,
    state: Arc<Mutex<ResponseState>>,
}

impl OpenAiResponsesProvider {
    pub fn new(model: impl Into<String>) -> Self {
        let model = model.into();
        let info = models::lookup(&model);
        Self {
            client: reqwest::Client::new(),
            model,
            base_url: OPENAI_RESPONSES_API_URL.to_string(),
            provider: "openai".to_string(),
            api_key: None,
            info,
            state: Arc::new(Mutex::new(ResponseState::default())),
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

    /// The response id the next request would chain from, if any.
    pub fn previous_response_id(&self) -> Option<String> {
        self.state
            .lock()
            .expect("response state lock poisoned")
            .response_id
            .clone()
    }

    fn build_request(&self, context: &Context, options: &StreamOptions) -> OpenAiResponsesRequest {
        let state = self
            .state
            .lock()
            .expect("response state lock poisoned")
            .clone();

        // With a live response id only the suffix added since that response
        // needs to go over the wire.
        let (previous_response_id, window) = match &state.response_id {
            Some(id) if state.covered_messages <= context.messages.len() => {
                (Some(id.clone()), &context.messages[state.covered_messages..])
            }
            _ => (None, &context.messages[..]),
        };

        let input = convert_messages(window);
        let name_map = ToolNameMap::build(context.tools.iter().map(|tool| tool.name.as_str()));
        let tools: Option<Vec<OpenAiResponsesTool>> = if context.tools.is_empty() {
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

        let reasoning = if self.info.reasoning {
            Some(ReasoningBody {
                effort: options.reasoning_effort.unwrap_or_default(),
                summary: "auto",
            })
        } else {
            None
        };

        OpenAiResponsesRequest {
            model: self.model.clone(),
            input,
            instructions: context.system_prompt.clone(),
            previous_response_id,
            tools,
            temperature: if self.info.reasoning {
                None
            } else {
                options.temperature
            },
            max_output_tokens: options.max_tokens,
            reasoning,
            stream: true,
        }
    }
}

#[async_trait]
impl Provider for OpenAiResponsesProvider {
    fn name(&self) -> &str {
        &self.provider
    }

    fn api(&self) -> &str {
        "openai-responses"
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
        true
    }

    fn raw_messages(&self, messages: &[Message]) -> Value {
        serde_json::to_value(convert_messages(messages)).unwrap_or(Value::Null)
    }

    fn reset_conversation_state(&self) {
        *self.state.lock().expect("response state lock poisoned") = ResponseState::default();
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
            Arc::clone(&self.state),
            context.messages.len(),
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
                        if msg.data == "[DONE]" || msg.data.is_empty() {
                            continue;
                        }
                        if let Err(e) = state.process_event(&msg.data) {
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemKind {
    Message,
    Reasoning,
    FunctionCall,
}

struct OpenItem {
    kind: ItemKind,
    content_index: usize,
    call_id: String,
    name: String,
    arguments: String,
}

struct StreamState<S>
where
    S: futures::Stream<Item = std::io::Result<Vec<u8>>> + Unpin,
{
    event_source: SseStream<S>,
    partial: AssistantMessage,
    items: Vec<OpenItem>,
    saw_tool_call: bool,
    pending: std::collections::VecDeque<StreamEvent>,
    shared: Arc<Mutex<ResponseState>>,
    request_messages: usize,
    name_map: ToolNameMap,
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
        shared: Arc<Mutex<ResponseState>>,
        request_messages: usize,
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
            items: Vec::new(),
            saw_tool_call: false,
            pending: std::collections::VecDeque::new(),
            shared,
            request_messages,
            name_map,
            finished: false,
            done: false,
        }
    }

    fn item_for_output_index(&mut self, output_index: usize) -> Option<&mut OpenItem> {
        self.items.get_mut(output_index)
    }

    fn process_event(&mut self, data: &str) -> Result<()> {
        let event: ResponsesStreamEvent = serde_json::from_str(data)
            .map_err(|e| Error::fatal("openai", format!("stream parse error: {e}")))?;

        match event {
            ResponsesStreamEvent::ResponseCreated { .. } => {
                self.pending.push_back(StreamEvent::Start);
            }
            ResponsesStreamEvent::OutputItemAdded { output_index, item } => {
                // Pad in case items arrive out of order.
                while self.items.len() < output_index {
                    self.items.push(OpenItem {
                        kind: ItemKind::Message,
                        content_index: usize::MAX,
                        call_id: String::new(),
                        name: String::new(),
                        arguments: String::new(),
                    });
                }
                let content_index = self.partial.content.len();
                match item.r#type.as_str() {
                    "function_call" => {
                        let call_id = item.call_id.unwrap_or_default();
                        let wire_name = item.name.unwrap_or_default();
                        let name = self
                            .name_map
                            .from_wire(&wire_name)
                            .map_or(wire_name, ToString::to_string);
                        self.partial.content.push(ContentBlock::ToolCall(ToolCall {
                            id: call_id.clone(),
                            name: name.clone(),
                            arguments: Value::Null,
                        }));
                        self.items.push(OpenItem {
                            kind: ItemKind::FunctionCall,
                            content_index,
                            call_id: call_id.clone(),
                            name: name.clone(),
                            arguments: String::new(),
                        });
                        self.saw_tool_call = true;
                        self.pending.push_back(StreamEvent::ToolCallStart {
                            content_index,
                            id: call_id,
                            name,
                        });
                    }
                    "reasoning" => {
                        self.partial
                            .content
                            .push(ContentBlock::Thinking(ThinkingContent {
                                thinking: String::new(),
                                signature: item.id,
                            }));
                        self.items.push(OpenItem {
                            kind: ItemKind::Reasoning,
                            content_index,
                            call_id: String::new(),
                            name: String::new(),
                            arguments: String::new(),
                        });
                        self.pending
                            .push_back(StreamEvent::ThinkingStart { content_index });
                    }
                    _ => {
                        self.partial
                            .content
                            .push(ContentBlock::Text(TextContent::new("")));
                        self.items.push(OpenItem {
                            kind: ItemKind::Message,
                            content_index,
                            call_id: String::new(),
                            name: String::new(),
                            arguments: String::new(),
                        });
                        self.pending
                            .push_back(StreamEvent::TextStart { content_index });
                    }
                }
            }
            ResponsesStreamEvent::OutputTextDelta {
                output_index,
                delta,
            } => {
                if let Some(item) = self.item_for_output_index(output_index) {
                    let content_index = item.content_index;
                    if let Some(ContentBlock::Text(t)) = self.partial.content.get_mut(content_index)
                    {
                        t.text.push_str(&delta);
                    }
                    self.pending.push_back(StreamEvent::TextDelta {
                        content_index,
                        delta,
                    });
                }
            }
            ResponsesStreamEvent::OutputTextDone { output_index, text } => {
                if let Some(item) = self.item_for_output_index(output_index) {
                    let content_index = item.content_index;
                    if let Some(ContentBlock::Text(t)) = self.partial.content.get_mut(content_index)
                    {
                        t.text = text.clone();
                    }
                    self.pending.push_back(StreamEvent::TextEnd {
                        content_index,
                        content: text,
                    });
                }
            }
            ResponsesStreamEvent::ReasoningSummaryTextDelta {
                output_index,
                delta,
            } => {
                if let Some(item) = self.item_for_output_index(output_index) {
                    let content_index = item.content_index;
                    if let Some(ContentBlock::Thinking(t)) =
                        self.partial.content.get_mut(content_index)
                    {
                        t.thinking.push_str(&delta);
                    }
                    self.pending.push_back(StreamEvent::ThinkingDelta {
                        content_index,
                        delta,
                    });
                }
            }
            ResponsesStreamEvent::ReasoningSummaryTextDone { output_index, text } => {
                if let Some(item) = self.item_for_output_index(output_index) {
                    let content_index = item.content_index;
                    self.pending.push_back(StreamEvent::ThinkingEnd {
                        content_index,
                        content: text,
                    });
                }
            }
            ResponsesStreamEvent::FunctionCallArgumentsDelta {
                output_index,
                delta,
            } => {
                if let Some(item) = self.item_for_output_index(output_index) {
                    item.arguments.push_str(&delta);
                    let content_index = item.content_index;
                    self.pending.push_back(StreamEvent::ToolCallDelta {
                        content_index,
                        delta,
                    });
                }
            }
            ResponsesStreamEvent::FunctionCallArgumentsDone {
                output_index,
                arguments,
            } => {
                if let Some(item) = self.item_for_output_index(output_index) {
                    item.arguments = arguments;
                }
            }
            ResponsesStreamEvent::OutputItemDone { output_index, .. } => {
                let Some(item) = self.items.get(output_index) else {
                    return Ok(());
                };
                if item.kind == ItemKind::FunctionCall {
                    let arguments: Value = if item.arguments.is_empty() {
                        json!({})
                    } else {
                        serde_json::from_str(&item.arguments).unwrap_or(Value::Null)
                    };
                    let tool_call = ToolCall {
                        id: item.call_id.clone(),
                        name: item.name.clone(),
                        arguments: arguments.clone(),
                    };
                    let content_index = item.content_index;
                    if let Some(ContentBlock::ToolCall(tc)) =
                        self.partial.content.get_mut(content_index)
                    {
                        *tc = tool_call.clone();
                    }
                    self.pending.push_back(StreamEvent::ToolCallEnd {
                        content_index,
                        tool_call,
                    });
                }
            }
            ResponsesStreamEvent::ResponseCompleted { response } => {
                if let Some(usage) = response.usage {
                    let cached = usage
                        .input_tokens_details
                        .map(|d| d.cached_tokens)
                        .unwrap_or_default();
                    self.partial.usage.input = usage.input_tokens.saturating_sub(cached);
                    self.partial.usage.cache_read = cached;
                    self.partial.usage.output = usage.output_tokens;
                    self.partial.usage.recompute_total();
                }
                if let Some(id) = response.id {
                    let mut shared = self.shared.lock().expect("response state lock poisoned");
                    shared.response_id = Some(id);
                    shared.covered_messages = self.request_messages;
                }
                self.finish();
            }
            ResponsesStreamEvent::ResponseFailed { response } => {
                let message = response
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "response failed".to_string());
                self.partial.stop_reason = StopReason::Error;
                self.partial.error_message = Some(message);
                self.pending.push_back(StreamEvent::Error {
                    reason: StopReason::Error,
                    message: std::mem::take(&mut self.partial),
                });
            }
            ResponsesStreamEvent::ResponseError { message } => {
                self.partial.stop_reason = StopReason::Error;
                self.partial.error_message = Some(message);
                self.pending.push_back(StreamEvent::Error {
                    reason: StopReason::Error,
                    message: std::mem::take(&mut self.partial),
                });
            }
            ResponsesStreamEvent::Other => {}
        }
        Ok(())
    }

    fn finish(&mut self) {
        if self.finished {
            self.done = self.pending.is_empty();
            return;
        }
        self.finished = true;
        let reason = if self.saw_tool_call {
            StopReason::ToolUse
        } else {
            StopReason::Stop
        };
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

fn convert_messages(messages: &[Message]) -> Vec<Value> {
    let mut out = Vec::with_capacity(messages.len());
    for message in messages {
        match message {
            Message::User(user) => {
                let content: Vec<Value> = match &user.content {
                    UserContent::Text(text) => {
                        vec![json!({"type": "input_text", "text": text})]
                    }
                    UserContent::Blocks(blocks) => blocks
                        .iter()
                        .filter_map(|block| match block {
                            ContentBlock::Text(t) => {
                                Some(json!({"type": "input_text", "text": t.text}))
                            }
                            ContentBlock::Image(image) => Some(json!({
                                "type": "input_image",
                                "image_url": format!(
                                    "data:{};base64,{}",
                                    image.mime_type, image.data
                                ),
                            })),
                            _ => None,
                        })
                        .collect(),
                };
                out.push(json!({"role": "user", "content": content}));
            }
            Message::Assistant(assistant) => {
                let text = assistant.text();
                if !text.is_empty() {
                    out.push(json!({
                        "role": "assistant",
                        "content": [{"type": "output_text", "text": text}],
                    }));
                }
                for block in &assistant.content {
                    if let ContentBlock::ToolCall(call) = block {
                        out.push(json!({
                            "type": "function_call",
                            "call_id": call.id,
                            "name": call.name,
                            "arguments": call.arguments.to_string(),
                        }));
                    }
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
                        "type": "function_call_output",
                        "call_id": entry.tool_call_id,
                        "output": text,
                    }));
                }
            }
            Message::Summary(summary) => {
                out.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "input_text",
                        "text": format!(
                            "Summary of the conversation so far:\n\n{}", summary.summary
                        ),
                    }],
                }));
            }
        }
    }
    out
}

fn convert_tool(tool: &ToolDef, name_map: &ToolNameMap) -> OpenAiResponsesTool {
    OpenAiResponsesTool {
        r#type: "function",
        name: name_map
            .to_wire(&tool.name)
            .unwrap_or(tool.name.as_str())
            .to_string(),
        description: tool.description.clone(),
        parameters: tool.parameters.clone(),
    }
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Serialize)]
struct OpenAiResponsesRequest {
    model: String,
    input: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_response_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiResponsesTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning: Option<ReasoningBody>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ReasoningBody {
    effort: crate::provider::ReasoningEffort,
    summary: &'static str,
}

#[derive(Debug, Serialize)]
struct OpenAiResponsesTool {
    r#type: &'static str,
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ResponsesStreamEvent {
    #[serde(rename = "response.created")]
    ResponseCreated {
        #[serde(default)]
        response: Option<Value>,
    },
    #[serde(rename = "response.output_item.added")]
    OutputItemAdded {
        #[serde(default)]
        output_index: usize,
        item: ResponsesItem,
    },
    #[serde(rename = "response.output_text.delta")]
    OutputTextDelta {
        #[serde(default)]
        output_index: usize,
        #[serde(default)]
        delta: String,
    },
    #[serde(rename = "response.output_text.done")]
    OutputTextDone {
        #[serde(default)]
        output_index: usize,
        #[serde(default)]
        text: String,
    },
    #[serde(rename = "response.reasoning_summary_text.delta")]
    ReasoningSummaryTextDelta {
        #[serde(default)]
        output_index: usize,
        #[serde(default)]
        delta: String,
    },
    #[serde(rename = "response.reasoning_summary_text.done")]
    ReasoningSummaryTextDone {
        #[serde(default)]
        output_index: usize,
        #[serde(default)]
        text: String,
    },
    #[serde(rename = "response.function_call_arguments.delta")]
    FunctionCallArgumentsDelta {
        #[serde(default)]
        output_index: usize,
        #[serde(default)]
        delta: String,
    },
    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        #[serde(default)]
        output_index: usize,
        #[serde(default)]
        arguments: String,
    },
    #[serde(rename = "response.output_item.done")]
    OutputItemDone {
        #[serde(default)]
        output_index: usize,
        #[serde(default)]
        item: Option<Value>,
    },
    #[serde(rename = "response.completed")]
    ResponseCompleted { response: ResponsesCompleted },
    #[serde(rename = "response.failed")]
    ResponseFailed { response: ResponsesFailed },
    #[serde(rename = "error")]
    ResponseError {
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ResponsesItem {
    #[serde(default)]
    r#type: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    call_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponsesCompleted {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    usage: Option<ResponsesUsage>,
}

#[derive(Debug, Deserialize)]
struct ResponsesFailed {
    #[serde(default)]
    error: Option<ResponsesError>,
}

#[derive(Debug, Deserialize)]
struct ResponsesError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ResponsesUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    input_tokens_details: Option<ResponsesInputTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct ResponsesInputTokensDetails {
    #[serde(default)]
    cached_tokens: u64,
}
