//! Compaction round trip (scenario: fill a small context window, compact,
//! continue, and verify the persisted record survives a round trip).

mod common;

use common::{ScriptedProvider, Turn, collector, kinds};
use skein::provider::Provider;
use skein::compaction::CompactionSettings;
use skein::events::ThreadEvent;
use skein::model::Message;
use skein::store::{ConversationRecord, ConversationStore};
use skein::store_json::JsonStore;
use skein::thread::{SendOptions, Thread, ThreadConfig, ThreadState};
use skein::tools::ToolRegistry;
use std::sync::Arc;

#[tokio::test]
async fn compaction_summarizes_and_continues_the_exchange() {
    // Tiny advertised window with a compact ratio of 0.5: the first turn's
    // reported usage (600 tokens) trips the between-turn check.
    let provider = Arc::new(
        ScriptedProvider::new([
            // Turn 1: a long answer that fills the window.
            Turn::Text("x".repeat(2_000)),
            // Steered follow-up triggers compaction first; this is the
            // summary request made on the dedicated summary thread.
            Turn::Text("summary: the user is testing context compaction".into()),
            // Turn 2 after compaction.
            Turn::Text("continuing with fresh context".into()),
        ])
        .with_usage(500, 100)
        .with_context_window(1_000),
    );

    let config = ThreadConfig {
        compaction: CompactionSettings {
            enabled: true,
            ratio: 0.5,
            keep_recent_user_turns: 1,
            max_tool_result_chars: 500,
        },
        ..ThreadConfig::default()
    };

    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn ConversationStore> = Arc::new(JsonStore::open(dir.path()).unwrap());
    let bus = skein::steer::SteerBus::new();
    let mut thread = Thread::new(
        Arc::clone(&provider) as Arc<dyn Provider>,
        ToolRegistry::new(),
        config,
    )
    .with_store(Arc::clone(&store))
    .with_steer_bus(bus.clone());

    // A queued steer message forces a second turn, so the compaction check
    // runs again with the inflated context counter.
    bus.enqueue(
        thread.conversation_id(),
        skein::steer::SteerMessage::new("keep going"),
    );

    let (handler, events) = collector();
    let result = thread
        .send(
            "fill the window",
            SendOptions {
                handler: Some(handler),
                ..SendOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(result.state, ThreadState::Done);
    assert_eq!(result.text, "continuing with fresh context");

    let events = events.lock().unwrap();
    let kinds = kinds(&events);
    assert!(kinds.contains(&"compaction-started".to_string()));
    assert!(kinds.contains(&"compaction-complete".to_string()));
    let tokens_before = events
        .iter()
        .find_map(|e| match e {
            ThreadEvent::CompactionComplete { tokens_before } => Some(*tokens_before),
            _ => None,
        })
        .unwrap();
    assert!(tokens_before > 0);

    // The canonical list now begins with exactly one summary message.
    assert!(matches!(thread.messages()[0], Message::Summary(_)));
    let summaries = thread
        .messages()
        .iter()
        .filter(|m| matches!(m, Message::Summary(_)))
        .count();
    assert_eq!(summaries, 1);

    // The persisted record round-trips exactly.
    let record = store.load(thread.conversation_id()).await.unwrap();
    let json = serde_json::to_string(&record).unwrap();
    let back: ConversationRecord = serde_json::from_str(&json).unwrap();
    assert_eq!(record, back);
    assert!(matches!(record.messages[0], Message::Summary(_)));
}

#[tokio::test]
async fn compaction_resets_context_but_not_cumulative_usage() {
    let provider = Arc::new(
        ScriptedProvider::new([
            Turn::Text("y".repeat(3_000)),
            Turn::Text("a short summary".into()),
            Turn::Text("after compaction".into()),
        ])
        .with_usage(800, 200)
        .with_context_window(1_000),
    );
    let config = ThreadConfig {
        compaction: CompactionSettings {
            enabled: true,
            ratio: 0.5,
            keep_recent_user_turns: 1,
            max_tool_result_chars: 500,
        },
        ..ThreadConfig::default()
    };
    let bus = skein::steer::SteerBus::new();
    let mut thread = Thread::new(Arc::clone(&provider) as Arc<dyn Provider>, ToolRegistry::new(), config)
        .with_steer_bus(bus.clone());
    bus.enqueue(
        thread.conversation_id(),
        skein::steer::SteerMessage::new("more"),
    );

    let result = thread
        .send("start", SendOptions {
            no_save: true,
            ..SendOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(result.turns, 2);

    // Cumulative usage kept both provider turns (the summary thread's usage
    // belongs to the summary request, not this thread).
    assert_eq!(thread.usage().total_tokens, 2_000);
    // The context counter reflects the post-compaction window, far below
    // two raw turns.
    assert!(thread.context_tokens() <= 1_000);
}

#[tokio::test]
async fn disabled_compaction_never_triggers() {
    let provider = Arc::new(
        ScriptedProvider::new([Turn::Text("z".repeat(2_000))])
            .with_usage(900, 100)
            .with_context_window(1_000),
    );
    let config = ThreadConfig {
        compaction: CompactionSettings {
            enabled: false,
            ratio: 0.1,
            keep_recent_user_turns: 1,
            max_tool_result_chars: 500,
        },
        ..ThreadConfig::default()
    };
    let mut thread = Thread::new(Arc::clone(&provider) as Arc<dyn Provider>, ToolRegistry::new(), config);

    let (handler, events) = collector();
    thread
        .send(
            "go",
            SendOptions {
                handler: Some(handler),
                no_save: true,
                ..SendOptions::default()
            },
        )
        .await
        .unwrap();

    let events = events.lock().unwrap();
    assert!(!kinds(&events).contains(&"compaction-started".to_string()));
    assert!(thread.messages().iter().all(|m| !matches!(m, Message::Summary(_))));
}
