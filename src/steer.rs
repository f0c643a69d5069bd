//! Out-of-band steering messages.
//!
//! A process-wide bus, keyed by conversation id, lets external clients
//! enqueue user messages for an in-flight thread. The thread subscribes on
//! `send` and drains the bus between turns. Messages arriving while no run
//! is in flight queue up for the next `send`.

use crate::model::now_millis;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::mpsc;

/// Per-conversation channel capacity.
const STEER_CHANNEL_CAPACITY: usize = 64;

/// A steering message waiting to be applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SteerMessage {
    pub content: String,
    pub enqueued_at: i64,
}

impl SteerMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            enqueued_at: now_millis(),
        }
    }
}

/// Outcome of enqueueing a steer message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SteerOutcome {
    /// A thread is subscribed and will apply the message between turns.
    Delivered,
    /// No run in flight; the message waits for the next `send`.
    Queued,
    /// The subscriber's channel is full; the message was queued instead.
    Backlogged,
}

enum Entry {
    Subscribed(mpsc::Sender<SteerMessage>),
    Queued(VecDeque<SteerMessage>),
}

type Entries = Arc<Mutex<HashMap<String, Entry>>>;

/// Process-wide steer bus keyed by conversation id.
#[derive(Clone, Default)]
pub struct SteerBus {
    entries: Entries,
}

static GLOBAL: OnceLock<SteerBus> = OnceLock::new();

impl SteerBus {
    /// The process-wide bus.
    pub fn global() -> &'static SteerBus {
        GLOBAL.get_or_init(SteerBus::default)
    }

    /// A private bus, for tests.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a steering message for a conversation.
    pub fn enqueue(&self, conversation_id: &str, message: SteerMessage) -> SteerOutcome {
        let mut entries = self.entries.lock().expect("steer bus lock poisoned");
        match entries.get_mut(conversation_id) {
            Some(Entry::Subscribed(tx)) => match tx.try_send(message) {
                Ok(()) => SteerOutcome::Delivered,
                Err(mpsc::error::TrySendError::Full(message)) => {
                    // Do not lose the message: spill to the fallback queue,
                    // drained on the subscriber's next boundary check.
                    let queue = VecDeque::from([message]);
                    entries.insert(conversation_id.to_string(), Entry::Queued(queue));
                    SteerOutcome::Backlogged
                }
                Err(mpsc::error::TrySendError::Closed(message)) => {
                    let queue = VecDeque::from([message]);
                    entries.insert(conversation_id.to_string(), Entry::Queued(queue));
                    SteerOutcome::Queued
                }
            },
            Some(Entry::Queued(queue)) => {
                queue.push_back(message);
                SteerOutcome::Queued
            }
            None => {
                entries.insert(
                    conversation_id.to_string(),
                    Entry::Queued(VecDeque::from([message])),
                );
                SteerOutcome::Queued
            }
        }
    }

    /// Whether any steer messages are pending for the conversation.
    pub fn has_pending(&self, conversation_id: &str) -> bool {
        let entries = self.entries.lock().expect("steer bus lock poisoned");
        matches!(
            entries.get(conversation_id),
            Some(Entry::Queued(queue)) if !queue.is_empty()
        )
    }

    /// Subscribe a thread to its conversation's steer messages. Any backlog
    /// queued while idle is delivered first, in order.
    pub fn subscribe(&self, conversation_id: &str) -> SteerSubscription {
        let (tx, rx) = mpsc::channel(STEER_CHANNEL_CAPACITY);
        let mut entries = self.entries.lock().expect("steer bus lock poisoned");
        if let Some(Entry::Queued(backlog)) =
            entries.insert(conversation_id.to_string(), Entry::Subscribed(tx.clone()))
        {
            for message in backlog {
                // Capacity exceeds any realistic idle backlog; drop excess
                // rather than block under the lock.
                let _ = tx.try_send(message);
            }
        }
        SteerSubscription {
            entries: Arc::clone(&self.entries),
            conversation_id: conversation_id.to_string(),
            rx,
        }
    }
}

/// A thread's live subscription to its steer channel.
///
/// Unsubscribes from the bus on drop; messages enqueued afterwards fall
/// back to the idle queue.
pub struct SteerSubscription {
    entries: Entries,
    conversation_id: String,
    rx: mpsc::Receiver<SteerMessage>,
}

impl SteerSubscription {
    /// Drain all currently pending steer messages without waiting.
    pub fn drain(&mut self) -> Vec<SteerMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = self.rx.try_recv() {
            messages.push(message);
        }
        // Pick up anything that spilled to the fallback queue while the
        // channel was full.
        let mut entries = self.entries.lock().expect("steer bus lock poisoned");
        if let Some(Entry::Queued(queue)) = entries.get_mut(&self.conversation_id) {
            messages.extend(queue.drain(..));
        }
        messages
    }
}

impl Drop for SteerSubscription {
    fn drop(&mut self) {
        let mut entries = self.entries.lock().expect("steer bus lock poisoned");
        if let Some(Entry::Subscribed(_)) = entries.get(&self.conversation_id) {
            entries.remove(&self.conversation_id);
        }
    }
}
