//! Canonical message types and content blocks.
//!
//! This module defines the provider-independent representation of a
//! conversation: messages, content blocks, usage tracking, and the
//! streaming events adapters emit while a response is in flight.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current canonical transcript schema version.
pub const TRANSCRIPT_VERSION: u32 = 1;

// ============================================================================
// Message Types
// ============================================================================

/// A message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "camelCase")]
pub enum Message {
    User(UserMessage),
    Assistant(AssistantMessage),
    ToolResult(ToolResultMessage),
    /// Compaction summary standing in for the replaced transcript prefix.
    Summary(SummaryMessage),
}

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::User(UserMessage {
            content: UserContent::Text(text.into()),
            timestamp: now_millis(),
        })
    }

    pub fn user_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self::User(UserMessage {
            content: UserContent::Blocks(blocks),
            timestamp: now_millis(),
        })
    }

    /// Tool-call blocks contained in this message (assistant messages only).
    pub fn tool_calls(&self) -> Vec<&ToolCall> {
        match self {
            Self::Assistant(msg) => msg
                .content
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::ToolCall(call) => Some(call),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// A user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessage {
    pub content: UserContent,
    pub timestamp: i64,
}

/// User message content, plain text or structured blocks (text + images).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl UserContent {
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text(t) => Some(t.text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// An assistant message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantMessage {
    pub content: Vec<ContentBlock>,
    pub api: String,
    pub provider: String,
    pub model: String,
    pub usage: Usage,
    pub stop_reason: StopReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub timestamp: i64,
}

impl AssistantMessage {
    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text(t) => Some(t.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// One tool's entry inside a tool-result message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultEntry {
    pub tool_call_id: String,
    pub tool_name: String,
    pub content: Vec<ContentBlock>,
    /// Structured result serialized for renderers; the by-call-id map on the
    /// conversation record is the typed source of truth.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default)]
    pub is_error: bool,
}

/// A tool-result message: all results of one assistant turn, in the order the
/// matching tool calls appeared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultMessage {
    pub results: Vec<ToolResultEntry>,
    pub timestamp: i64,
}

/// A compaction summary message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryMessage {
    pub summary: String,
    pub tokens_before: u64,
    pub timestamp: i64,
}

// ============================================================================
// Stop Reasons
// ============================================================================

/// Why a response ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    #[default]
    Stop,
    Length,
    ToolUse,
    Refusal,
    Error,
    Aborted,
    TurnCapped,
}

// ============================================================================
// Content Blocks
// ============================================================================

/// A content block in a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ContentBlock {
    Text(TextContent),
    Thinking(ThinkingContent),
    Image(ImageContent),
    ToolCall(ToolCall),
    /// Opaque provider data the runtime must echo back unchanged.
    Redacted(RedactedContent),
}

/// Text content block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextContent {
    pub text: String,
}

impl TextContent {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// Thinking/reasoning content block. The signature is opaque provider data
/// that must be echoed back for multi-turn extended thinking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingContent {
    pub thinking: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Image content block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageContent {
    /// Base64 encoded image data.
    pub data: String,
    pub mime_type: String,
}

/// Tool call content block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Redacted/opaque passthrough block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedactedContent {
    pub data: Value,
}

// ============================================================================
// Usage Tracking
// ============================================================================

/// Token usage and cost tracking.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_write: u64,
    pub total_tokens: u64,
    pub cost: Cost,
}

impl Usage {
    /// Fold another usage sample into this one. Saturating; cumulative
    /// counters only grow.
    pub fn add(&mut self, other: &Usage) {
        self.input = self.input.saturating_add(other.input);
        self.output = self.output.saturating_add(other.output);
        self.cache_read = self.cache_read.saturating_add(other.cache_read);
        self.cache_write = self.cache_write.saturating_add(other.cache_write);
        self.recompute_total();
        self.cost.add(&other.cost);
    }

    pub fn recompute_total(&mut self) {
        self.total_tokens = self
            .input
            .saturating_add(self.output)
            .saturating_add(self.cache_read)
            .saturating_add(self.cache_write);
    }

    /// Tokens the last exchange reported as occupying the context window.
    pub fn context_tokens(&self) -> u64 {
        self.input
            .saturating_add(self.cache_read)
            .saturating_add(self.cache_write)
            .saturating_add(self.output)
    }
}

/// Cost breakdown in dollars.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cost {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_write: f64,
    pub total: f64,
}

impl Cost {
    pub fn add(&mut self, other: &Cost) {
        self.input += other.input;
        self.output += other.output;
        self.cache_read += other.cache_read;
        self.cache_write += other.cache_write;
        self.total += other.total;
    }
}

// ============================================================================
// Streaming Events (provider -> runtime)
// ============================================================================

/// Streaming event emitted by a provider adapter during one turn.
///
/// Ordering within a turn: `Start` first; a `ThinkingEnd` precedes any
/// `TextDelta` of the same logical message; `Done`/`Error` arrive last,
/// after every delta.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Start,

    TextStart {
        content_index: usize,
    },
    TextDelta {
        content_index: usize,
        delta: String,
    },
    TextEnd {
        content_index: usize,
        content: String,
    },

    ThinkingStart {
        content_index: usize,
    },
    ThinkingDelta {
        content_index: usize,
        delta: String,
    },
    ThinkingEnd {
        content_index: usize,
        content: String,
    },

    ToolCallStart {
        content_index: usize,
        id: String,
        name: String,
    },
    ToolCallDelta {
        content_index: usize,
        delta: String,
    },
    ToolCallEnd {
        content_index: usize,
        tool_call: ToolCall,
    },

    Done {
        reason: StopReason,
        message: AssistantMessage,
    },
    Error {
        reason: StopReason,
        message: AssistantMessage,
    },
}

// ============================================================================
// Thinking Level
// ============================================================================

/// Extended thinking level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    #[default]
    Off,
    Low,
    Medium,
    High,
}

impl ThinkingLevel {
    /// Default token budget for this level.
    pub const fn default_budget(self) -> u32 {
        match self {
            Self::Off => 0,
            Self::Low => 2048,
            Self::Medium => 8192,
            Self::High => 16384,
        }
    }
}

impl std::str::FromStr for ThinkingLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(format!("Invalid thinking level: {s}")),
        }
    }
}

// ============================================================================
// Transcript
// ============================================================================

/// The ordered canonical message list of one thread.
///
/// Append-only within an exchange; only compaction replaces the prefix.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcript {
    messages: Vec<Message>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranscriptFile {
    version: u32,
    messages: Vec<Message>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn push_user(&mut self, message: UserMessage) {
        self.messages.push(Message::User(message));
    }

    pub fn push_assistant(&mut self, message: AssistantMessage) {
        self.messages.push(Message::Assistant(message));
    }

    pub fn push_tool_results(&mut self, results: Vec<ToolResultEntry>) {
        self.messages.push(Message::ToolResult(ToolResultMessage {
            results,
            timestamp: now_millis(),
        }));
    }

    pub fn push_summary(&mut self, summary: SummaryMessage) {
        self.messages.push(Message::Summary(summary));
    }

    /// Replace the whole transcript (compaction).
    pub fn replace(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    /// The first user message's text, for conversation listings.
    pub fn first_user_text(&self) -> Option<String> {
        self.messages.iter().find_map(|message| match message {
            Message::User(user) => Some(user.content.as_text()),
            _ => None,
        })
    }

    /// Text of the last assistant message, if any.
    pub fn last_assistant_text(&self) -> Option<String> {
        self.messages.iter().rev().find_map(|message| match message {
            Message::Assistant(assistant) => Some(assistant.text()),
            _ => None,
        })
    }

    /// Collect ids of tool calls that have no matching tool result later in
    /// the transcript.
    pub fn orphan_tool_call_ids(&self) -> Vec<String> {
        let mut resolved = std::collections::HashSet::new();
        for message in &self.messages {
            if let Message::ToolResult(results) = message {
                for entry in &results.results {
                    resolved.insert(entry.tool_call_id.clone());
                }
            }
        }

        let mut orphans = Vec::new();
        for message in &self.messages {
            for call in message.tool_calls() {
                if !resolved.contains(&call.id) {
                    orphans.push(call.id.clone());
                }
            }
        }
        orphans
    }

    /// Remove tool-call blocks with no matching result, then drop assistant
    /// messages that became empty. Idempotent; returns how many blocks were
    /// trimmed.
    pub fn trim_orphan_tool_calls(&mut self) -> usize {
        let orphans: std::collections::HashSet<String> =
            self.orphan_tool_call_ids().into_iter().collect();
        if orphans.is_empty() {
            return 0;
        }

        let mut trimmed = 0;
        for message in &mut self.messages {
            if let Message::Assistant(assistant) = message {
                let before = assistant.content.len();
                assistant.content.retain(|block| match block {
                    ContentBlock::ToolCall(call) => !orphans.contains(&call.id),
                    _ => true,
                });
                trimmed += before - assistant.content.len();
                if assistant.stop_reason == StopReason::ToolUse
                    && assistant.content.iter().all(|b| !matches!(b, ContentBlock::ToolCall(_)))
                {
                    assistant.stop_reason = StopReason::Stop;
                }
            }
        }
        self.messages.retain(|message| match message {
            Message::Assistant(assistant) => !assistant.content.is_empty(),
            _ => true,
        });
        trimmed
    }

    /// Window selection: the leading summary (if any) plus the last `n`
    /// messages.
    pub fn window(&self, n: usize) -> Vec<Message> {
        let mut selected = Vec::new();
        if let Some(summary @ Message::Summary(_)) = self.messages.first() {
            selected.push(summary.clone());
        }
        let tail_start = self.messages.len().saturating_sub(n);
        for message in &self.messages[tail_start..] {
            if selected.first() == Some(message) {
                continue;
            }
            selected.push(message.clone());
        }
        selected
    }

    /// Index of the message starting the tail that keeps the last `turns`
    /// user turns (compaction keeps everything from there on).
    pub fn tail_start_for_user_turns(&self, turns: usize) -> usize {
        if turns == 0 {
            return self.messages.len();
        }
        let mut seen = 0;
        for (idx, message) in self.messages.iter().enumerate().rev() {
            if matches!(message, Message::User(_)) {
                seen += 1;
                if seen == turns {
                    return idx;
                }
            }
        }
        0
    }

    /// Serialize to the stable, versioned canonical form.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(TranscriptFile {
            version: TRANSCRIPT_VERSION,
            messages: self.messages.clone(),
        })?)
    }

    /// Deserialize the canonical form. Fails with `SchemaVersionMismatch`
    /// on an unknown version; trims orphan tool calls inherited from a
    /// crashed exchange.
    pub fn from_value(value: Value) -> Result<Self> {
        let file: TranscriptFile = serde_json::from_value(value)?;
        if file.version > TRANSCRIPT_VERSION {
            return Err(Error::SchemaVersionMismatch {
                found: file.version,
                supported: TRANSCRIPT_VERSION,
            });
        }
        let mut transcript = Self {
            messages: file.messages,
        };
        transcript.trim_orphan_tool_calls();
        Ok(transcript)
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
