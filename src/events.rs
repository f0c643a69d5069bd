//! Unified event vocabulary and handler delivery.
//!
//! Every `send` produces one ordered event stream for the caller-supplied
//! handler. The handler is untrusted: it may be slow or drop events, and the
//! runtime must never block a provider network read waiting for it. Delivery
//! goes through a bounded queue whose backpressure policy is: drop deltas,
//! never drop structural events.

use crate::model::{AssistantMessage, StopReason, Usage};
use crate::tools::StructuredToolResult;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Default event queue capacity per send.
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 256;

/// Events emitted to the caller during one exchange.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ThreadEvent {
    /// A provider round trip is starting.
    TurnStart { turn: usize },

    TextDelta { delta: String },
    /// A text block completed.
    Text { text: String },

    ThinkingStart,
    ThinkingDelta { delta: String },
    ThinkingEnd { thinking: String },

    /// Partial tool-call arguments are streaming in.
    ToolCallPartial { delta: String },
    /// The model requested a tool execution.
    ToolUse {
        tool_call_id: String,
        tool_name: String,
        input: Value,
    },
    /// A tool execution finished.
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        success: bool,
        result: StructuredToolResult,
    },

    /// The assistant message for this turn is complete.
    AssistantMessage { message: AssistantMessage },
    /// Usage reported for the completed turn.
    Usage { usage: Usage },
    TurnEnd { turn: usize, reason: StopReason },

    /// A steer message was applied between turns.
    SteerApplied { count: usize },
    CompactionStarted,
    CompactionComplete { tokens_before: u64 },
    BackgroundProcessSpawned { pid: u32, command: String },

    Cancelled,
    Failed { error: String },
    /// The exchange finished; final cumulative usage attached.
    Done { usage: Usage },
}

impl ThreadEvent {
    /// Structural events are never dropped under backpressure; deltas may be.
    pub const fn is_structural(&self) -> bool {
        !matches!(
            self,
            Self::TextDelta { .. }
                | Self::ThinkingDelta { .. }
                | Self::ToolCallPartial { .. }
        )
    }
}

/// Caller-supplied consumer for the event stream.
pub type EventHandler = Arc<dyn Fn(ThreadEvent) + Send + Sync>;

/// Bounded delivery queue between the exchange loop and the handler.
///
/// A dedicated forwarding task drains the queue, so a slow handler slows
/// only itself; the producer drops deltas when the queue is full.
pub struct EventSink {
    tx: Option<mpsc::Sender<ThreadEvent>>,
    dropped: Arc<AtomicU64>,
    forwarder: Option<tokio::task::JoinHandle<()>>,
}

impl EventSink {
    pub fn new(handler: EventHandler) -> Self {
        Self::with_capacity(handler, DEFAULT_EVENT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(handler: EventHandler, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<ThreadEvent>(capacity.max(1));
        let forwarder = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                handler(event);
            }
        });
        Self {
            tx: Some(tx),
            dropped: Arc::new(AtomicU64::new(0)),
            forwarder: Some(forwarder),
        }
    }

    /// Emit an event. Deltas are dropped when the queue is full; structural
    /// events wait for a slot.
    pub async fn emit(&self, event: ThreadEvent) {
        let Some(tx) = &self.tx else { return };
        if event.is_structural() {
            // Ignore a closed channel: the consumer going away must not
            // fail the exchange.
            let _ = tx.send(event).await;
        } else if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(event) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of delta events dropped under backpressure so far.
    pub fn dropped_deltas(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Close the queue and wait for queued events to reach the handler.
    pub async fn close(mut self) {
        self.tx.take();
        if let Some(forwarder) = self.forwarder.take() {
            let _ = forwarder.await;
        }
    }
}

impl Drop for EventSink {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}
