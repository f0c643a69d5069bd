//! End-to-end exchange loop scenarios against the scripted provider.

mod common;

use common::{MemoryReadTool, ScriptedProvider, SleepTool, Turn, collector, kinds, registry_with, role_counts};
use skein::provider::Provider;
use serde_json::json;
use skein::cancel::CancelHandle;
use skein::error::Error;
use skein::events::ThreadEvent;
use skein::hooks::{Hook, HookDecision, HookSet};
use skein::model::{Message, StopReason};
use skein::steer::{SteerBus, SteerMessage};
use skein::store_json::JsonStore;
use skein::store::{ConversationStore, QueryOptions};
use skein::thread::{SendOptions, Thread, ThreadConfig, ThreadState};
use skein::tools::{ToolRegistry, ToolResultData};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn thread_with(provider: ScriptedProvider, registry: ToolRegistry) -> (Thread, Arc<ScriptedProvider>) {
    let provider = Arc::new(provider);
    let thread = Thread::new(Arc::clone(&provider) as Arc<dyn Provider>, registry, ThreadConfig::default());
    (thread, provider)
}

// S1: simple question and answer with tools disabled.
#[tokio::test]
async fn simple_question_and_answer() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonStore::open(dir.path()).unwrap());
    let (mut thread, provider) = thread_with(
        ScriptedProvider::new([Turn::Text("2+2 is 4.".into())]),
        ToolRegistry::new(),
    );
    thread = thread.with_store(Arc::clone(&store) as Arc<dyn ConversationStore>);
    let (handler, events) = collector();

    let result = thread
        .send(
            "what is 2+2?",
            SendOptions {
                no_tools: true,
                handler: Some(handler),
                ..SendOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(result.state, ThreadState::Done);
    assert!(result.text.contains('4'));
    assert_eq!(result.turns, 1);
    assert!(result.usage.input > 0 && result.usage.output > 0);
    assert!(result.usage.cost.total > 0.0);
    assert_eq!(provider.calls(), 1);

    let (user, assistant, tool_results, _) = role_counts(thread.messages());
    assert_eq!((user, assistant, tool_results), (1, 1, 0));

    let events = events.lock().unwrap();
    let kinds = kinds(&events);
    assert!(kinds.contains(&"turn-start".to_string()));
    assert!(kinds.contains(&"text-delta".to_string()));
    assert!(kinds.contains(&"done".to_string()));
    let turn_end = events
        .iter()
        .find_map(|e| match e {
            ThreadEvent::TurnEnd { reason, .. } => Some(*reason),
            _ => None,
        })
        .unwrap();
    assert_eq!(turn_end, StopReason::Stop);

    // Persisted under an id whose prefix is today's UTC date.
    let listed = store.list(&QueryOptions::default()).await.unwrap();
    assert_eq!(listed.total, 1);
    let today = chrono::Utc::now().format("%Y%m%d").to_string();
    assert!(listed.summaries[0].id.starts_with(&today));
}

// S2: a single tool call, then a closing text turn.
#[tokio::test]
async fn single_tool_call_round_trip() {
    let registry = registry_with(vec![Arc::new(SleepTool {
        duration: Duration::from_millis(5),
    })]);
    let (mut thread, provider) = thread_with(
        ScriptedProvider::new([
            Turn::ToolCalls(vec![(
                "call_1".into(),
                "shell".into(),
                json!({"command": "echo hi"}),
            )]),
            Turn::Text("done: hi".into()),
        ]),
        registry,
    );
    let (handler, events) = collector();

    let result = thread
        .send(
            "run `echo hi`",
            SendOptions {
                handler: Some(handler),
                no_save: true,
                ..SendOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(result.state, ThreadState::Done);
    assert_eq!(result.turns, 2);
    assert_eq!(provider.calls(), 2);

    let events = events.lock().unwrap();
    let tool_result = events
        .iter()
        .find_map(|e| match e {
            ThreadEvent::ToolResult { result, .. } => Some(result.clone()),
            _ => None,
        })
        .expect("tool result event");
    assert!(tool_result.success);
    match tool_result.data {
        Some(ToolResultData::Shell {
            exit_code, stdout, ..
        }) => {
            assert_eq!(exit_code, 0);
            assert_eq!(stdout, "hi\n");
        }
        other => panic!("expected shell data, got {other:?}"),
    }

    // Tool-use and its result are paired in the transcript.
    let (user, assistant, tool_results, _) = role_counts(thread.messages());
    assert_eq!((user, assistant, tool_results), (1, 2, 1));
}

// S3: three parallel reads; results in input order despite reversed delays.
#[tokio::test]
async fn parallel_tool_results_preserve_input_order() {
    let read_tool = MemoryReadTool::new([("a.txt", "alpha"), ("b.txt", "beta"), ("c.txt", "gamma")])
        .with_delay("a.txt", Duration::from_millis(60))
        .with_delay("b.txt", Duration::from_millis(30))
        .with_delay("c.txt", Duration::from_millis(1));
    let registry = registry_with(vec![Arc::new(read_tool)]);
    let (mut thread, _provider) = thread_with(
        ScriptedProvider::new([
            Turn::ToolCalls(vec![
                ("r1".into(), "file_read".into(), json!({"path": "a.txt"})),
                ("r2".into(), "file_read".into(), json!({"path": "b.txt"})),
                ("r3".into(), "file_read".into(), json!({"path": "c.txt"})),
            ]),
            Turn::Text("read all three".into()),
        ]),
        registry,
    );

    let result = thread
        .send("read files a, b, c", SendOptions {
            no_save: true,
            ..SendOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(result.state, ThreadState::Done);

    let tool_message = thread
        .messages()
        .iter()
        .find_map(|message| match message {
            Message::ToolResult(results) => Some(results.clone()),
            _ => None,
        })
        .expect("tool result message");
    let ids: Vec<&str> = tool_message
        .results
        .iter()
        .map(|entry| entry.tool_call_id.as_str())
        .collect();
    assert_eq!(ids, vec!["r1", "r2", "r3"]);

    // One assistant message carries all three calls.
    let calls = thread
        .messages()
        .iter()
        .map(|m| m.tool_calls().len())
        .max()
        .unwrap();
    assert_eq!(calls, 3);

    // The reads went through shared state.
    assert!(thread.tool_state().file_last_accessed("b.txt").is_some());
}

// S4: the turn cap stops the loop with a synthetic assistant message.
#[tokio::test]
async fn turn_cap_appends_synthetic_message() {
    let registry = registry_with(vec![Arc::new(SleepTool {
        duration: Duration::from_millis(1),
    })]);
    // The script would keep asking for tools forever.
    let (mut thread, provider) = thread_with(
        ScriptedProvider::new([
            Turn::ToolCalls(vec![(
                "c1".into(),
                "shell".into(),
                json!({"command": "echo loop"}),
            )]),
            Turn::ToolCalls(vec![(
                "c2".into(),
                "shell".into(),
                json!({"command": "echo loop"}),
            )]),
        ]),
        registry,
    );

    let result = thread
        .send(
            "keep going",
            SendOptions {
                max_turns: 1,
                no_save: true,
                ..SendOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(result.state, ThreadState::TurnCapped);
    assert!(result.text.contains("turn limit"));
    // Exactly one provider call; the cap prevented the second.
    assert_eq!(provider.calls(), 1);

    let last = thread.messages().last().unwrap();
    match last {
        Message::Assistant(assistant) => {
            assert_eq!(assistant.stop_reason, StopReason::TurnCapped);
        }
        other => panic!("expected synthetic assistant message, got {other:?}"),
    }
}

// S5: cancellation mid-tool returns promptly with no orphan tool-use.
#[tokio::test]
async fn cancellation_mid_tool_is_prompt_and_leaves_no_orphans() {
    let registry = registry_with(vec![Arc::new(SleepTool {
        duration: Duration::from_secs(10),
    })]);
    let (mut thread, _provider) = thread_with(
        ScriptedProvider::new([Turn::ToolCalls(vec![(
            "slow".into(),
            "shell".into(),
            json!({"command": "sleep 10"}),
        )])]),
        registry,
    );

    let (handle, token) = CancelHandle::new();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.cancel();
    });

    let started = Instant::now();
    let (handler, events) = collector();
    let err = thread
        .send(
            "run a slow command",
            SendOptions {
                cancel: token,
                handler: Some(handler),
                no_save: true,
                ..SendOptions::default()
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(thread.state(), ThreadState::Cancelled);

    // The tool-use has a matching cancelled result: no orphans remain.
    let tool_message = thread
        .messages()
        .iter()
        .find_map(|message| match message {
            Message::ToolResult(results) => Some(results.clone()),
            _ => None,
        })
        .expect("cancelled tool result appended");
    assert_eq!(tool_message.results.len(), 1);
    assert!(tool_message.results[0].is_error);

    let events = events.lock().unwrap();
    assert!(kinds(&events).contains(&"cancelled".to_string()));
}

#[tokio::test]
async fn invalid_tool_input_becomes_failed_result_not_error() {
    let registry = registry_with(vec![Arc::new(SleepTool {
        duration: Duration::from_millis(1),
    })]);
    let (mut thread, _provider) = thread_with(
        ScriptedProvider::new([
            // Missing the required `command` field.
            Turn::ToolCalls(vec![("bad".into(), "shell".into(), json!({"cmd": "oops"}))]),
            Turn::Text("recovered".into()),
        ]),
        registry,
    );

    let result = thread
        .send("go", SendOptions {
            no_save: true,
            ..SendOptions::default()
        })
        .await
        .unwrap();

    assert_eq!(result.state, ThreadState::Done);
    let tool_message = thread
        .messages()
        .iter()
        .find_map(|message| match message {
            Message::ToolResult(results) => Some(results.clone()),
            _ => None,
        })
        .unwrap();
    assert!(tool_message.results[0].is_error);
    let details = tool_message.results[0].details.as_ref().unwrap();
    assert!(details["error"].as_str().unwrap().contains("command"));
}

#[tokio::test]
async fn unknown_tool_becomes_failed_result() {
    let (mut thread, _provider) = thread_with(
        ScriptedProvider::new([
            Turn::ToolCalls(vec![("x".into(), "missing_tool".into(), json!({}))]),
            Turn::Text("ok".into()),
        ]),
        ToolRegistry::new(),
    );
    let result = thread
        .send("go", SendOptions {
            no_save: true,
            ..SendOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(result.state, ThreadState::Done);
}

struct ShellBlocker;

#[async_trait::async_trait]
impl Hook for ShellBlocker {
    fn name(&self) -> &str {
        "shell-blocker"
    }

    async fn before_tool_call(&self, invocation: &skein::tools::ToolInvocation) -> HookDecision {
        if invocation.name == "shell" {
            HookDecision::Block {
                reason: "shell access is disabled in this environment".into(),
            }
        } else {
            HookDecision::Allow
        }
    }
}

#[tokio::test]
async fn hook_blocks_tool_with_failed_result() {
    let registry = registry_with(vec![Arc::new(SleepTool {
        duration: Duration::from_millis(1),
    })]);
    let mut hooks = HookSet::new();
    hooks.push(Arc::new(ShellBlocker));

    let provider = Arc::new(ScriptedProvider::new([
        Turn::ToolCalls(vec![(
            "c1".into(),
            "shell".into(),
            json!({"command": "echo hi"}),
        )]),
        Turn::Text("understood".into()),
    ]));
    let mut thread = Thread::new(Arc::clone(&provider) as Arc<dyn Provider>, registry, ThreadConfig::default())
        .with_hooks(hooks);

    let result = thread
        .send("try the shell", SendOptions {
            no_save: true,
            ..SendOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(result.state, ThreadState::Done);

    let tool_message = thread
        .messages()
        .iter()
        .find_map(|message| match message {
            Message::ToolResult(results) => Some(results.clone()),
            _ => None,
        })
        .unwrap();
    assert!(tool_message.results[0].is_error);
    let details = tool_message.results[0].details.as_ref().unwrap();
    assert_eq!(details["data"]["type"], "blocked");
}

#[tokio::test]
async fn steer_message_applied_between_turns() {
    let bus = SteerBus::new();
    let provider = Arc::new(ScriptedProvider::new([
        Turn::Text("first answer".into()),
        Turn::Text("steered answer".into()),
    ]));
    let mut thread = Thread::new(
        Arc::clone(&provider) as Arc<dyn Provider>,
        ToolRegistry::new(),
        ThreadConfig::default(),
    )
    .with_steer_bus(bus.clone());

    // Queued before the run starts: applied at the first idle boundary.
    bus.enqueue(
        thread.conversation_id(),
        SteerMessage::new("also check the docs"),
    );

    let (handler, events) = collector();
    let result = thread
        .send(
            "hello",
            SendOptions {
                handler: Some(handler),
                no_save: true,
                ..SendOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(result.state, ThreadState::Done);
    assert_eq!(result.turns, 2);
    assert_eq!(result.text, "steered answer");
    assert_eq!(provider.calls(), 2);

    let events = events.lock().unwrap();
    assert!(
        events
            .iter()
            .any(|e| matches!(e, ThreadEvent::SteerApplied { count: 1 }))
    );
    let (user, assistant, _, _) = role_counts(thread.messages());
    assert_eq!((user, assistant), (2, 2));
}

// Property 8 seed: a transient failure retried at stream establishment does
// not duplicate assistant messages.
#[tokio::test]
async fn transient_failure_retries_without_duplication() {
    let provider = Arc::new(ScriptedProvider::new([
        Turn::TransientFailure("connection reset".into()),
        Turn::Text("after retry".into()),
    ]));
    let mut config = ThreadConfig::default();
    config.retry.initial_delay = Duration::from_millis(1);
    config.retry.max_delay = Duration::from_millis(2);
    let mut thread = Thread::new(Arc::clone(&provider) as Arc<dyn Provider>, ToolRegistry::new(), config);

    let result = thread
        .send("go", SendOptions {
            no_save: true,
            ..SendOptions::default()
        })
        .await
        .unwrap();

    assert_eq!(result.text, "after retry");
    assert_eq!(provider.calls(), 2);
    let (user, assistant, _, _) = role_counts(thread.messages());
    assert_eq!((user, assistant), (1, 1));
}

#[tokio::test]
async fn exhausted_retries_surface_transient_error() {
    let provider = Arc::new(ScriptedProvider::new([
        Turn::TransientFailure("503".into()),
        Turn::TransientFailure("503".into()),
        Turn::TransientFailure("503".into()),
    ]));
    let mut config = ThreadConfig::default();
    config.retry.initial_delay = Duration::from_millis(1);
    config.retry.max_delay = Duration::from_millis(2);
    let mut thread = Thread::new(Arc::clone(&provider) as Arc<dyn Provider>, ToolRegistry::new(), config);

    let err = thread
        .send("go", SendOptions {
            no_save: true,
            ..SendOptions::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ProviderTransient { .. }));
    assert_eq!(thread.state(), ThreadState::Failed);
    assert_eq!(provider.calls(), 3);
}

#[tokio::test]
async fn subagent_usage_folds_into_parent() {
    // Parent and child share the provider; the script serves the child's
    // turn first, then the parent's.
    let provider = Arc::new(
        ScriptedProvider::new([
            Turn::Text("child result".into()),
            Turn::Text("parent result".into()),
        ])
        .with_usage(100, 40),
    );
    let registry = registry_with(vec![Arc::new(SleepTool {
        duration: Duration::from_millis(1),
    })]);
    let mut parent = Thread::new(Arc::clone(&provider) as Arc<dyn Provider>, registry, ThreadConfig::default());

    let mut child = parent.subagent(&["shell"]);
    let child_result = child
        .send("delegate this", SendOptions {
            no_save: true,
            ..SendOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(child_result.text, "child result");
    assert_eq!(child_result.usage.total_tokens, 140);

    // The child's usage is already visible in the parent's totals.
    assert_eq!(parent.usage().total_tokens, 140);

    parent
        .send("now the parent", SendOptions {
            no_save: true,
            ..SendOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(parent.usage().total_tokens, 280);
}

#[tokio::test]
async fn persistence_failure_rolls_back_memory() {
    struct FailingStore;

    #[async_trait::async_trait]
    impl ConversationStore for FailingStore {
        async fn save(&self, _record: &skein::store::ConversationRecord) -> skein::Result<()> {
            Err(skein::Error::persistence("disk full"))
        }
        async fn load(&self, id: &str) -> skein::Result<skein::store::ConversationRecord> {
            Err(skein::Error::NotFound { id: id.into() })
        }
        async fn list(&self, _options: &QueryOptions) -> skein::Result<skein::store::QueryResult> {
            Ok(skein::store::QueryResult::default())
        }
        async fn delete(&self, _id: &str) -> skein::Result<()> {
            Ok(())
        }
    }

    let provider = Arc::new(ScriptedProvider::new([Turn::Text("answer".into())]));
    let mut thread = Thread::new(
        Arc::clone(&provider) as Arc<dyn Provider>,
        ToolRegistry::new(),
        ThreadConfig::default(),
    )
    .with_store(Arc::new(FailingStore));

    let before_len = thread.messages().len();
    let err = thread.send("hello", SendOptions::default()).await.unwrap_err();
    assert!(matches!(err, Error::Persistence(_)));
    assert_eq!(thread.state(), ThreadState::Failed);
    // In-memory state matches what is on disk: nothing.
    assert_eq!(thread.messages().len(), before_len);
    assert_eq!(thread.usage().total_tokens, 0);
}

#[tokio::test]
async fn panicking_tool_yields_failed_result_and_siblings_survive() {
    struct PanicTool;

    #[async_trait::async_trait]
    impl skein::tools::Tool for PanicTool {
        fn name(&self) -> &str {
            "boom"
        }
        fn description(&self) -> &str {
            "always panics"
        }
        fn input_schema(&self) -> serde_json::Value {
            json!({"type": "object"})
        }
        fn concurrency_safe(&self) -> bool {
            true
        }
        async fn execute(
            &self,
            _invocation: &skein::tools::ToolInvocation,
            _state: &skein::tools::ToolState,
            _cancel: &skein::cancel::CancelToken,
        ) -> skein::tools::StructuredToolResult {
            panic!("tool exploded");
        }
    }

    let registry = registry_with(vec![
        Arc::new(PanicTool),
        Arc::new(MemoryReadTool::new([("ok.txt", "fine")])),
    ]);
    let (mut thread, _provider) = thread_with(
        ScriptedProvider::new([
            Turn::ToolCalls(vec![
                ("p1".into(), "boom".into(), json!({})),
                ("p2".into(), "file_read".into(), json!({"path": "ok.txt"})),
            ]),
            Turn::Text("recovered".into()),
        ]),
        registry,
    );

    let result = thread
        .send("go", SendOptions {
            no_save: true,
            ..SendOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(result.state, ThreadState::Done);

    let tool_message = thread
        .messages()
        .iter()
        .find_map(|message| match message {
            Message::ToolResult(results) => Some(results.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(tool_message.results.len(), 2);
    assert!(tool_message.results[0].is_error);
    assert!(!tool_message.results[1].is_error);
}

#[tokio::test]
async fn allowed_tools_narrow_advertisement() {
    let registry = registry_with(vec![
        Arc::new(SleepTool {
            duration: Duration::from_millis(1),
        }),
        Arc::new(MemoryReadTool::new([("a.txt", "alpha")])),
    ]);
    let provider = Arc::new(ScriptedProvider::new([
        Turn::Text("ok".into()),
        Turn::Text("ok".into()),
    ]));
    let mut thread = Thread::new(Arc::clone(&provider) as Arc<dyn Provider>, registry, ThreadConfig::default());

    thread
        .send(
            "hi",
            SendOptions {
                allowed_tools: Some(vec!["file_read".to_string()]),
                no_save: true,
                ..SendOptions::default()
            },
        )
        .await
        .unwrap();
    thread
        .send(
            "hi again",
            SendOptions {
                no_tools: true,
                no_save: true,
                ..SendOptions::default()
            },
        )
        .await
        .unwrap();

    let advertised = provider.request_tool_names.lock().unwrap().clone();
    assert_eq!(advertised[0], vec!["file_read".to_string()]);
    assert!(advertised[1].is_empty());
}
