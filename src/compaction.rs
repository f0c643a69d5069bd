//! Context compaction for long threads.
//!
//! Between turns, when the context window is nearly full, the runtime asks
//! the provider for a short summary of the transcript and replaces the
//! canonical prefix with a single summary message plus a small tail of
//! recent user turns. Cumulative cost is preserved; only the context-window
//! counter resets.

use crate::error::{Error, Result};
use crate::model::{
    ContentBlock, Message, StreamEvent, SummaryMessage, Transcript, UserContent, now_millis,
};
use crate::provider::{Context, Provider, StreamOptions};
use futures::StreamExt;

/// Approximate characters per token for code-heavy English text.
/// Conservative (overestimates tokens) to avoid exceeding context windows.
const CHARS_PER_TOKEN_ESTIMATE: u64 = 3;

/// Estimated tokens for an image content block.
const IMAGE_TOKEN_ESTIMATE: u64 = 1200;

/// System prompt for the summary thread.
const SUMMARY_PROMPT: &str = "You summarize a coding-agent conversation so it can continue in a \
fresh context window. Preserve, concisely: the user's current goals, files read or modified, \
running background processes, unresolved tool errors, and decisions already made. Answer with \
the summary only.";

/// Compaction configuration.
#[derive(Debug, Clone)]
pub struct CompactionSettings {
    pub enabled: bool,
    /// Fraction of the advertised context window that triggers compaction.
    pub ratio: f64,
    /// User turns kept verbatim after the summary.
    pub keep_recent_user_turns: usize,
    /// Per-tool-result character cap when feeding the summary request.
    pub max_tool_result_chars: usize,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ratio: 0.8,
            keep_recent_user_turns: 2,
            max_tool_result_chars: 2_000,
        }
    }
}

/// Result of one compaction run.
#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    pub summary: String,
    pub tokens_before: u64,
    pub messages_removed: usize,
}

/// Whether the between-turn check should trigger compaction.
pub fn should_compact(settings: &CompactionSettings, context_tokens: u64, window: u32) -> bool {
    if !settings.enabled || window == 0 {
        return false;
    }
    context_tokens as f64 >= settings.ratio * f64::from(window)
}

/// Estimate context tokens for a transcript from its serialized size.
pub fn estimate_context_tokens(messages: &[Message]) -> u64 {
    let mut chars: u64 = 0;
    let mut images: u64 = 0;
    for message in messages {
        match message {
            Message::User(user) => match &user.content {
                UserContent::Text(text) => chars += text.len() as u64,
                UserContent::Blocks(blocks) => {
                    let (c, i) = count_blocks(blocks);
                    chars += c;
                    images += i;
                }
            },
            Message::Assistant(assistant) => {
                let (c, i) = count_blocks(&assistant.content);
                chars += c;
                images += i;
            }
            Message::ToolResult(results) => {
                for entry in &results.results {
                    let (c, i) = count_blocks(&entry.content);
                    chars += c;
                    images += i;
                }
            }
            Message::Summary(summary) => chars += summary.summary.len() as u64,
        }
    }
    chars / CHARS_PER_TOKEN_ESTIMATE + images * IMAGE_TOKEN_ESTIMATE
}

fn count_blocks(blocks: &[ContentBlock]) -> (u64, u64) {
    let mut chars = 0u64;
    let mut images = 0u64;
    for block in blocks {
        match block {
            ContentBlock::Text(t) => chars += t.text.len() as u64,
            ContentBlock::Thinking(t) => chars += t.thinking.len() as u64,
            ContentBlock::ToolCall(call) => {
                chars += call.name.len() as u64 + call.arguments.to_string().len() as u64;
            }
            ContentBlock::Image(_) => images += 1,
            ContentBlock::Redacted(r) => chars += r.data.to_string().len() as u64,
        }
    }
    (chars, images)
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{kept}\n[... truncated]")
}

/// Render the transcript into the text fed to the summary request.
fn render_for_summary(messages: &[Message], settings: &CompactionSettings) -> String {
    let mut out = String::new();
    for message in messages {
        match message {
            Message::User(user) => {
                out.push_str("[user]\n");
                out.push_str(&user.content.as_text());
                out.push('\n');
            }
            Message::Assistant(assistant) => {
                out.push_str("[assistant]\n");
                out.push_str(&assistant.text());
                out.push('\n');
                for call in message.tool_calls() {
                    out.push_str(&format!("[tool call] {}: {}\n", call.name, call.arguments));
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
                    out.push_str(&format!(
                        "[tool result {}{}]\n{}\n",
                        entry.tool_name,
                        if entry.is_error { ", error" } else { "" },
                        truncate_chars(&text, settings.max_tool_result_chars)
                    ));
                }
            }
            Message::Summary(summary) => {
                out.push_str("[earlier summary]\n");
                out.push_str(&summary.summary);
                out.push('\n');
            }
        }
    }
    out
}

/// Ask the provider for a transcript summary on a dedicated summary thread.
pub async fn summarize(
    provider: &dyn Provider,
    options: &StreamOptions,
    messages: &[Message],
    settings: &CompactionSettings,
) -> Result<String> {
    let rendered = render_for_summary(messages, settings);
    let context = Context {
        system_prompt: Some(SUMMARY_PROMPT.to_string()),
        messages: vec![Message::user_text(format!(
            "Summarize this conversation:\n\n{rendered}"
        ))],
        tools: Vec::new(),
    };

    let mut summary_options = options.clone();
    summary_options.thinking_level = None;
    summary_options.cache_retention = crate::provider::CacheRetention::None;

    let mut stream = provider.stream(&context, &summary_options).await?;
    let mut collected = String::new();
    while let Some(event) = stream.next().await {
        match event? {
            StreamEvent::Done { message, .. } => {
                let text = message.text();
                if !text.is_empty() {
                    collected = text;
                }
            }
            StreamEvent::Error { message, .. } => {
                return Err(Error::tool(
                    "compaction",
                    message
                        .error_message
                        .unwrap_or_else(|| "summary request failed".to_string()),
                ));
            }
            _ => {}
        }
    }

    let collected = collected.trim().to_string();
    if collected.is_empty() {
        return Err(Error::tool("compaction", "provider returned empty summary"));
    }
    Ok(collected)
}

/// Compact the transcript in place: `[summary, tail of recent user turns]`.
///
/// Returns `None` when the transcript is already compact (a leading summary
/// with nothing but the kept tail behind it), which makes back-to-back runs
/// idempotent.
pub async fn compact(
    transcript: &mut Transcript,
    provider: &dyn Provider,
    options: &StreamOptions,
    settings: &CompactionSettings,
) -> Result<Option<CompactionOutcome>> {
    let tail_start = transcript.tail_start_for_user_turns(settings.keep_recent_user_turns);
    let already_compact = matches!(transcript.messages().first(), Some(Message::Summary(_)))
        && tail_start <= 1;
    if already_compact || transcript.is_empty() || tail_start == 0 {
        return Ok(None);
    }

    let tokens_before = estimate_context_tokens(transcript.messages());
    let summary = summarize(provider, options, transcript.messages(), settings).await?;

    let tail: Vec<Message> = transcript.messages()[tail_start..].to_vec();
    let messages_removed = transcript.len() - tail.len();

    let mut replacement = Vec::with_capacity(tail.len() + 1);
    replacement.push(Message::Summary(SummaryMessage {
        summary: summary.clone(),
        tokens_before,
        timestamp: now_millis(),
    }));
    replacement.extend(tail);
    transcript.replace(replacement);
    transcript.trim_orphan_tool_calls();

    // Stateful adapters must not resume a server-side thread that still
    // references the discarded prefix.
    provider.reset_conversation_state();

    Ok(Some(CompactionOutcome {
        summary,
        tokens_before,
        messages_removed,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        AssistantMessage, StopReason, TextContent, ToolResultEntry, Usage, UserMessage,
    };

    fn user(text: &str) -> Message {
        Message::User(UserMessage {
            content: UserContent::Text(text.into()),
            timestamp: 0,
        })
    }

    fn assistant(text: &str) -> Message {
        Message::Assistant(AssistantMessage {
            content: vec![ContentBlock::Text(TextContent::new(text))],
            api: "test".into(),
            provider: "test".into(),
            model: "m".into(),
            usage: Usage::default(),
            stop_reason: StopReason::Stop,
            error_message: None,
            timestamp: 0,
        })
    }

    #[test]
    fn trigger_respects_ratio_and_enable_flag() {
        let settings = CompactionSettings {
            ratio: 0.5,
            ..CompactionSettings::default()
        };
        assert!(should_compact(&settings, 600, 1000));
        assert!(!should_compact(&settings, 400, 1000));
        let disabled = CompactionSettings {
            enabled: false,
            ..settings
        };
        assert!(!should_compact(&disabled, 600, 1000));
    }

    #[test]
    fn token_estimate_counts_text_and_images() {
        let text_only = vec![user(&"x".repeat(300))];
        assert_eq!(estimate_context_tokens(&text_only), 100);

        let with_image = vec![Message::user_blocks(vec![ContentBlock::Image(
            crate::model::ImageContent {
                data: String::new(),
                mime_type: "image/png".into(),
            },
        )])];
        assert_eq!(estimate_context_tokens(&with_image), IMAGE_TOKEN_ESTIMATE);
    }

    #[test]
    fn summary_rendering_truncates_tool_results() {
        let settings = CompactionSettings {
            max_tool_result_chars: 10,
            ..CompactionSettings::default()
        };
        let mut transcript = Transcript::new();
        transcript.push_user(UserMessage {
            content: UserContent::Text("run it".into()),
            timestamp: 0,
        });
        transcript.push_tool_results(vec![ToolResultEntry {
            tool_call_id: "c1".into(),
            tool_name: "shell".into(),
            content: vec![ContentBlock::Text(TextContent::new("y".repeat(100)))],
            details: None,
            is_error: false,
        }]);
        let rendered = render_for_summary(transcript.messages(), &settings);
        assert!(rendered.contains("[... truncated]"));
        assert!(rendered.contains("[tool result shell]"));
    }

    #[test]
    fn compact_skips_short_transcripts() {
        // All messages fall inside the kept tail: nothing to do.
        let transcript = Transcript::from_messages(vec![user("only")]);
        assert_eq!(transcript.tail_start_for_user_turns(2), 0);
    }

    #[test]
    fn tail_keeps_recent_turns() {
        let messages = vec![
            user("a"),
            assistant("ra"),
            user("b"),
            assistant("rb"),
            user("c"),
            assistant("rc"),
        ];
        let transcript = Transcript::from_messages(messages);
        let tail_start = transcript.tail_start_for_user_turns(2);
        assert_eq!(tail_start, 2);
    }
}
