//! Headless structured stream.
//!
//! Newline-delimited JSON, one event per line, for machine consumers. The
//! `kind` vocabulary is a stable external contract; every line carries the
//! conversation id.

use crate::error::Result;
use crate::events::ThreadEvent;
use serde_json::Value;
use std::io::Write;
use std::sync::Mutex;

/// Serialize one event to its NDJSON value, or `None` for event kinds the
/// headless contract does not carry.
pub fn event_to_json(event: &ThreadEvent, conversation_id: &str) -> Option<Value> {
    let mut value = match event {
        // Internal bookkeeping that headless consumers reconstruct from the
        // terminal events instead.
        ThreadEvent::TurnStart { .. } | ThreadEvent::Done { .. } => return None,
        other => serde_json::to_value(other).ok()?,
    };
    if let Some(obj) = value.as_object_mut() {
        // `text` doubles as the content-end marker in the wire vocabulary.
        if obj.get("kind").and_then(Value::as_str) == Some("assistant-message") {
            obj.insert("kind".to_string(), Value::String("content-end".to_string()));
        }
        obj.insert(
            "conversationId".to_string(),
            Value::String(conversation_id.to_string()),
        );
    }
    Some(value)
}

/// NDJSON event writer over any `Write` sink.
pub struct HeadlessWriter<W: Write> {
    out: Mutex<W>,
    conversation_id: String,
}

impl<W: Write> HeadlessWriter<W> {
    pub fn new(out: W, conversation_id: impl Into<String>) -> Self {
        Self {
            out: Mutex::new(out),
            conversation_id: conversation_id.into(),
        }
    }

    /// Write one event as a JSON line. Unknown/internal kinds are skipped.
    pub fn write_event(&self, event: &ThreadEvent) -> Result<()> {
        let Some(value) = event_to_json(event, &self.conversation_id) else {
            return Ok(());
        };
        let mut out = self.out.lock().expect("headless writer lock poisoned");
        serde_json::to_writer(&mut *out, &value)?;
        out.write_all(b"\n")?;
        out.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().expect("headless writer lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{StopReason, Usage};
    use crate::tools::StructuredToolResult;

    #[test]
    fn lines_carry_kind_and_conversation_id() {
        let writer = HeadlessWriter::new(Vec::new(), "conv-1");
        writer
            .write_event(&ThreadEvent::TextDelta { delta: "hi".into() })
            .unwrap();
        writer
            .write_event(&ThreadEvent::TurnEnd {
                turn: 1,
                reason: StopReason::Stop,
            })
            .unwrap();
        let output = String::from_utf8(writer.into_inner()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["kind"], "text-delta");
        assert_eq!(first["conversationId"], "conv-1");

        let second: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["kind"], "turn-end");
        assert_eq!(second["reason"], "stop");
    }

    #[test]
    fn tool_events_carry_ids_and_results() {
        let value = event_to_json(
            &ThreadEvent::ToolResult {
                tool_call_id: "c1".into(),
                tool_name: "shell".into(),
                success: false,
                result: StructuredToolResult::failure("shell", "exit 1"),
            },
            "conv-2",
        )
        .unwrap();
        assert_eq!(value["kind"], "tool-result");
        assert_eq!(value["toolCallId"], "c1");
        assert_eq!(value["result"]["error"], "exit 1");
    }

    #[test]
    fn internal_kinds_are_skipped() {
        assert!(event_to_json(&ThreadEvent::TurnStart { turn: 1 }, "c").is_none());
        assert!(
            event_to_json(
                &ThreadEvent::Done {
                    usage: Usage::default()
                },
                "c"
            )
            .is_none()
        );
        assert!(event_to_json(&ThreadEvent::Cancelled, "c").is_some());
    }
}
