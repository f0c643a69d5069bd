//! The thread runtime: the exchange loop.
//!
//! A `Thread` owns a conversation's canonical transcript, usage counters,
//! and cancellation scope. `send` runs the loop:
//!
//! 1. Append the user message (trimming orphan tool calls inherited from a
//!    crashed exchange).
//! 2. Stream one assistant turn from the provider, piping events to the
//!    caller's handler as they arrive.
//! 3. If the turn requested tools: validate, run them concurrently, append
//!    one tool-result message in tool-call order, and go again.
//! 4. Stop on a terminal turn, the turn cap, cancellation, or steer/hook
//!    injected follow-ups; then persist the record.

use crate::cancel::CancelToken;
use crate::compaction::{self, CompactionSettings};
use crate::error::{Error, Result};
use crate::events::{EventHandler, EventSink, ThreadEvent};
use crate::hooks::{HookDecision, HookSet};
use crate::model::{
    AssistantMessage, ContentBlock, ImageContent, Message, StopReason, StreamEvent, TextContent,
    ToolCall, ToolResultEntry, Transcript, Usage, UserContent, UserMessage, now_millis,
};
use crate::provider::{CacheRetention, Context, EventStream, Provider, StreamOptions};
use crate::providers::{RetryPolicy, with_retry};
use crate::steer::SteerBus;
use crate::store::{ConversationRecord, ConversationStore, generate_conversation_id};
use crate::tools::{StructuredToolResult, ToolInvocation, ToolRegistry, ToolState};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

/// Upper bound on tools executing concurrently within one turn.
const MAX_CONCURRENT_TOOLS: usize = 8;

/// Grace period for in-flight tools to observe cancellation before their
/// results are synthesized as cancelled.
pub const TOOL_CANCEL_GRACE: Duration = Duration::from_secs(2);

// ============================================================================
// Configuration
// ============================================================================

/// Per-thread configuration.
#[derive(Debug, Clone, Default)]
pub struct ThreadConfig {
    /// Base system prompt.
    pub system_prompt: Option<String>,
    /// Files whose contents are appended to the system prompt each turn.
    pub context_files: Vec<String>,
    pub compaction: CompactionSettings,
    pub retry: RetryPolicy,
    /// Base stream options (temperature, thinking, headers).
    pub stream_options: StreamOptions,
    /// Mark the request cacheable every N turns (0 disables).
    pub cache_every: usize,
}

/// Options for one `send`.
#[derive(Clone)]
pub struct SendOptions {
    /// Hard cap on provider round trips. 0 = unlimited.
    pub max_turns: usize,
    /// Narrow the advertised tool set for this run.
    pub allowed_tools: Option<Vec<String>>,
    /// Advertise no tools at all.
    pub no_tools: bool,
    /// Skip persistence for this run.
    pub no_save: bool,
    pub cancel: CancelToken,
    pub handler: Option<EventHandler>,
    pub disable_auto_compact: bool,
    /// Override the configured compaction trigger ratio for this run.
    pub compact_ratio: Option<f64>,
    /// Images attached to the user message.
    pub images: Vec<ImageContent>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            max_turns: 0,
            allowed_tools: None,
            no_tools: false,
            no_save: false,
            cancel: CancelToken::never(),
            handler: None,
            disable_auto_compact: false,
            compact_ratio: None,
            images: Vec::new(),
        }
    }
}

impl std::fmt::Debug for SendOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendOptions")
            .field("max_turns", &self.max_turns)
            .field("allowed_tools", &self.allowed_tools)
            .field("no_tools", &self.no_tools)
            .field("no_save", &self.no_save)
            .finish()
    }
}

/// Terminal state of one `send`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Idle,
    PreparingTurn,
    Streaming,
    ExecutingTools,
    AwaitingSteer,
    Done,
    Failed,
    Cancelled,
    TurnCapped,
}

/// Result of a completed `send`.
#[derive(Debug, Clone)]
pub struct SendResult {
    pub state: ThreadState,
    /// Text of the final assistant message.
    pub text: String,
    /// Usage for this exchange only.
    pub usage: Usage,
    pub turns: usize,
}

// ============================================================================
// Thread
// ============================================================================

/// One live conversational exchange runtime.
pub struct Thread {
    provider: Arc<dyn Provider>,
    tools: ToolRegistry,
    tool_state: Arc<ToolState>,
    hooks: HookSet,
    config: ThreadConfig,
    transcript: Transcript,
    /// Cumulative usage across all exchanges of this thread.
    usage: Usage,
    /// Tokens the latest turn reported as occupying the context window.
    context_tokens: u64,
    tool_results: HashMap<String, StructuredToolResult>,
    conversation_id: String,
    store: Option<Arc<dyn ConversationStore>>,
    steer_bus: SteerBus,
    /// Usage folded in from completed subagents.
    subagent_usage: Arc<StdMutex<Usage>>,
    /// Accumulator of a parent thread, for subagents.
    parent_usage: Option<Arc<StdMutex<Usage>>>,
    created_at: DateTime<Utc>,
    state: ThreadState,
}

impl Thread {
    pub fn new(provider: Arc<dyn Provider>, tools: ToolRegistry, config: ThreadConfig) -> Self {
        Self {
            provider,
            tools,
            tool_state: Arc::new(ToolState::new()),
            hooks: HookSet::new(),
            config,
            transcript: Transcript::new(),
            usage: Usage::default(),
            context_tokens: 0,
            tool_results: HashMap::new(),
            conversation_id: generate_conversation_id(),
            store: None,
            steer_bus: SteerBus::global().clone(),
            subagent_usage: Arc::new(StdMutex::new(Usage::default())),
            parent_usage: None,
            created_at: Utc::now(),
            state: ThreadState::Idle,
        }
    }

    /// Rebuild a thread from a persisted record.
    pub fn resume(
        record: ConversationRecord,
        provider: Arc<dyn Provider>,
        tools: ToolRegistry,
        config: ThreadConfig,
    ) -> Result<Self> {
        record.check_version()?;
        let mut transcript = Transcript::from_messages(record.messages);
        transcript.trim_orphan_tool_calls();

        let tool_state = ToolState::new();
        tool_state.restore_file_access(record.file_last_access);
        tool_state.restore_background_processes(record.background_processes);

        // A stateful adapter must not chain onto a server-side thread the
        // rebuilt context no longer matches.
        provider.reset_conversation_state();

        let context_tokens = compaction::estimate_context_tokens(transcript.messages());
        Ok(Self {
            provider,
            tools,
            tool_state: Arc::new(tool_state),
            hooks: HookSet::new(),
            config,
            transcript,
            usage: record.usage,
            context_tokens,
            tool_results: record.tool_results,
            conversation_id: record.id,
            store: None,
            steer_bus: SteerBus::global().clone(),
            subagent_usage: Arc::new(StdMutex::new(Usage::default())),
            parent_usage: None,
            created_at: record.created_at,
            state: ThreadState::Idle,
        })
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_hooks(mut self, hooks: HookSet) -> Self {
        self.hooks = hooks;
        self
    }

    #[must_use]
    pub fn with_conversation_id(mut self, id: impl Into<String>) -> Self {
        self.conversation_id = id.into();
        self
    }

    #[must_use]
    pub fn with_steer_bus(mut self, bus: SteerBus) -> Self {
        self.steer_bus = bus;
        self
    }

    /// Construct a child thread for a delegated subtask: narrowed tool set,
    /// its own cancellation scope, and usage that folds back into this
    /// thread's totals on completion.
    pub fn subagent(&self, allowed_tools: &[&str]) -> Thread {
        let allowed: Vec<String> = allowed_tools.iter().map(ToString::to_string).collect();
        let mut child = Thread::new(
            Arc::clone(&self.provider),
            self.tools.filtered(&allowed),
            self.config.clone(),
        );
        child.parent_usage = Some(Arc::clone(&self.subagent_usage));
        child
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn messages(&self) -> &[Message] {
        self.transcript.messages()
    }

    pub fn state(&self) -> ThreadState {
        self.state
    }

    pub fn tool_state(&self) -> &Arc<ToolState> {
        &self.tool_state
    }

    /// Cumulative usage including completed subagents.
    pub fn usage(&self) -> Usage {
        let mut total = self.usage.clone();
        let subagent = self
            .subagent_usage
            .lock()
            .expect("subagent usage lock poisoned");
        total.add(&subagent);
        total
    }

    /// Tokens currently occupying the context window.
    pub fn context_tokens(&self) -> u64 {
        self.context_tokens
    }

    // ========================================================================
    // Send
    // ========================================================================

    /// Run one exchange. Terminal events (`done`, `cancelled`, `failed`) are
    /// always emitted before this returns.
    pub async fn send(
        &mut self,
        message: impl Into<String>,
        options: SendOptions,
    ) -> Result<SendResult> {
        let handler: EventHandler = options.handler.clone().unwrap_or_else(|| Arc::new(|_| {}));
        let sink = EventSink::new(handler);

        let result = self.run_exchange(message.into(), &options, &sink).await;

        match &result {
            Ok(outcome) => {
                sink.emit(ThreadEvent::Done {
                    usage: outcome.usage.clone(),
                })
                .await;
            }
            Err(Error::Cancelled) => sink.emit(ThreadEvent::Cancelled).await,
            Err(err) => {
                sink.emit(ThreadEvent::Failed {
                    error: err.to_string(),
                })
                .await;
            }
        }
        sink.close().await;
        result
    }

    #[allow(clippy::too_many_lines)]
    async fn run_exchange(
        &mut self,
        message: String,
        options: &SendOptions,
        sink: &EventSink,
    ) -> Result<SendResult> {
        if let HookDecision::Block { reason } = self.hooks.user_message_send(&message).await {
            return Err(Error::HookBlocked {
                hook: "user_message_send".into(),
                reason,
            });
        }

        // Rollback point: a failed save must leave in-memory state matching
        // what is actually on disk.
        let snapshot = (
            self.transcript.clone(),
            self.usage.clone(),
            self.tool_results.clone(),
            self.context_tokens,
        );

        self.transcript.trim_orphan_tool_calls();
        self.transcript.push_user(build_user_message(&message, &options.images));

        let mut steer = self.steer_bus.subscribe(&self.conversation_id);

        let registry = self.effective_registry(options);
        let provider = Arc::clone(&self.provider);
        let mut compaction_settings = self.config.compaction.clone();
        if let Some(ratio) = options.compact_ratio {
            compaction_settings.ratio = ratio;
        }

        let mut exchange_usage = Usage::default();
        let mut final_text = String::new();
        let mut turn = 0usize;

        loop {
            turn += 1;
            self.state = ThreadState::PreparingTurn;

            if options.cancel.is_cancelled() {
                return self.finish_cancelled(options).await;
            }

            if options.max_turns > 0 && turn > options.max_turns {
                let capped = self.build_capped_message(options.max_turns);
                sink.emit(ThreadEvent::AssistantMessage {
                    message: capped.clone(),
                })
                .await;
                final_text = capped.text();
                self.transcript.push_assistant(capped);
                self.state = ThreadState::TurnCapped;
                break;
            }

            // Auto-compact fires between turns only, never mid-turn.
            if !options.disable_auto_compact
                && compaction::should_compact(
                    &compaction_settings,
                    self.context_tokens,
                    provider.context_window(),
                )
            {
                sink.emit(ThreadEvent::CompactionStarted).await;
                match compaction::compact(
                    &mut self.transcript,
                    provider.as_ref(),
                    &self.config.stream_options,
                    &compaction_settings,
                )
                .await
                {
                    Ok(Some(outcome)) => {
                        self.context_tokens =
                            compaction::estimate_context_tokens(self.transcript.messages());
                        sink.emit(ThreadEvent::CompactionComplete {
                            tokens_before: outcome.tokens_before,
                        })
                        .await;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        // The exchange continues on the uncompacted context.
                        tracing::warn!(error = %err, "auto-compaction failed");
                    }
                }
            }

            sink.emit(ThreadEvent::TurnStart { turn }).await;

            let context = Context {
                system_prompt: self.build_system_prompt(),
                messages: self.transcript.messages().to_vec(),
                tools: registry.describe_all(),
            };
            let stream_options = self.stream_options_for_turn(turn);

            self.state = ThreadState::Streaming;
            let stream_result = with_retry(&self.config.retry, || {
                provider.stream(&context, &stream_options)
            })
            .await;

            let event_stream = match stream_result {
                Ok(event_stream) => event_stream,
                Err(err) => {
                    self.persist_best_effort(options).await;
                    self.state = ThreadState::Failed;
                    return Err(err);
                }
            };

            let assistant = match consume_stream(event_stream, sink, &options.cancel).await {
                Ok(assistant) => assistant,
                Err(Error::Cancelled) => return self.finish_cancelled(options).await,
                Err(err) => {
                    self.persist_best_effort(options).await;
                    self.state = ThreadState::Failed;
                    return Err(err);
                }
            };

            if assistant.stop_reason == StopReason::Error {
                let message = assistant
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "provider reported an error".to_string());
                self.transcript.push_assistant(assistant);
                self.persist_best_effort(options).await;
                self.state = ThreadState::Failed;
                return Err(Error::fatal(provider.name(), message));
            }

            // Account the turn before deciding what comes next.
            let mut turn_usage = assistant.usage.clone();
            turn_usage.cost = provider.price().cost(
                turn_usage.input,
                turn_usage.output,
                turn_usage.cache_read,
                turn_usage.cache_write,
            );
            self.context_tokens = turn_usage.context_tokens();
            exchange_usage.add(&turn_usage);
            self.usage.add(&turn_usage);

            let stop_reason = assistant.stop_reason;
            let tool_calls: Vec<ToolCall> =
                assistant.content.iter().filter_map(|block| match block {
                    ContentBlock::ToolCall(call) => Some(call.clone()),
                    _ => None,
                })
                .collect();

            sink.emit(ThreadEvent::AssistantMessage {
                message: assistant.clone(),
            })
            .await;
            sink.emit(ThreadEvent::Usage {
                usage: turn_usage.clone(),
            })
            .await;
            final_text = assistant.text();
            self.transcript.push_assistant(assistant);

            if stop_reason != StopReason::ToolUse || tool_calls.is_empty() {
                sink.emit(ThreadEvent::TurnEnd {
                    turn,
                    reason: stop_reason,
                })
                .await;
                self.hooks.turn_end(turn).await;

                let follow_ups = self.hooks.agent_stop(self.transcript.messages()).await;
                if !follow_ups.is_empty() {
                    for text in follow_ups {
                        self.transcript.push_user(build_user_message(&text, &[]));
                    }
                    continue;
                }

                self.state = ThreadState::AwaitingSteer;
                let steered = steer.drain();
                if !steered.is_empty() {
                    sink.emit(ThreadEvent::SteerApplied {
                        count: steered.len(),
                    })
                    .await;
                    for message in steered {
                        self.transcript
                            .push_user(build_user_message(&message.content, &[]));
                    }
                    continue;
                }

                self.state = ThreadState::Done;
                break;
            }

            // Tool turn.
            self.state = ThreadState::ExecutingTools;
            for call in &tool_calls {
                sink.emit(ThreadEvent::ToolUse {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    input: call.arguments.clone(),
                })
                .await;
            }

            let background_before: HashSet<u32> = self
                .tool_state
                .background_processes()
                .iter()
                .map(|p| p.pid)
                .collect();

            let (results, tools_cancelled) = self
                .execute_tool_calls(&tool_calls, &registry, &options.cancel)
                .await;

            let mut entries = Vec::with_capacity(results.len());
            for (call, result) in tool_calls.iter().zip(results) {
                sink.emit(ThreadEvent::ToolResult {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    success: result.success,
                    result: result.clone(),
                })
                .await;
                entries.push(ToolResultEntry {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    content: result.content_blocks(),
                    details: serde_json::to_value(&result).ok(),
                    is_error: !result.success,
                });
                self.tool_results.insert(call.id.clone(), result);
            }
            self.transcript.push_tool_results(entries);

            for process in self.tool_state.background_processes() {
                if !background_before.contains(&process.pid) {
                    sink.emit(ThreadEvent::BackgroundProcessSpawned {
                        pid: process.pid,
                        command: process.command.clone(),
                    })
                    .await;
                }
            }

            sink.emit(ThreadEvent::TurnEnd {
                turn,
                reason: StopReason::ToolUse,
            })
            .await;
            self.hooks.turn_end(turn).await;

            if tools_cancelled {
                return self.finish_cancelled(options).await;
            }

            // Steer boundary between turns.
            let steered = steer.drain();
            if !steered.is_empty() {
                sink.emit(ThreadEvent::SteerApplied {
                    count: steered.len(),
                })
                .await;
                for message in steered {
                    self.transcript
                        .push_user(build_user_message(&message.content, &[]));
                }
            }
        }

        // Persist; a failed save fails the exchange and rolls memory back to
        // match disk.
        if !options.no_save {
            if let Some(store) = &self.store {
                let record = self.build_record();
                if let Err(err) = store.save(&record).await {
                    let (transcript, usage, tool_results, context_tokens) = snapshot;
                    self.transcript = transcript;
                    self.usage = usage;
                    self.tool_results = tool_results;
                    self.context_tokens = context_tokens;
                    self.state = ThreadState::Failed;
                    return Err(match err {
                        persistence @ Error::Persistence(_) => persistence,
                        other => Error::persistence(other.to_string()),
                    });
                }
            }
        }

        if let Some(parent) = &self.parent_usage {
            parent
                .lock()
                .expect("parent usage lock poisoned")
                .add(&exchange_usage);
        }

        Ok(SendResult {
            state: self.state,
            text: final_text,
            usage: exchange_usage,
            turns: turn,
        })
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn effective_registry(&self, options: &SendOptions) -> ToolRegistry {
        if options.no_tools {
            ToolRegistry::new()
        } else if let Some(allowed) = &options.allowed_tools {
            self.tools.filtered(allowed)
        } else {
            self.tools.clone()
        }
    }

    fn stream_options_for_turn(&self, turn: usize) -> StreamOptions {
        let mut stream_options = self.config.stream_options.clone();
        stream_options.session_id = Some(self.conversation_id.clone());
        if self.config.cache_every > 0 && (turn == 1 || turn % self.config.cache_every == 0) {
            if stream_options.cache_retention == CacheRetention::None {
                stream_options.cache_retention = CacheRetention::Short;
            }
        } else if self.config.cache_every > 0 {
            stream_options.cache_retention = CacheRetention::None;
        }
        stream_options
    }

    fn build_system_prompt(&self) -> Option<String> {
        let mut parts: Vec<String> = Vec::new();
        if let Some(prompt) = &self.config.system_prompt {
            parts.push(prompt.clone());
        }
        for path in &self.config.context_files {
            match std::fs::read_to_string(path) {
                Ok(content) => parts.push(format!("## Context: {path}\n\n{content}")),
                Err(err) => {
                    tracing::debug!(path = %path, error = %err, "skipping context file");
                }
            }
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }

    fn build_capped_message(&self, max_turns: usize) -> AssistantMessage {
        AssistantMessage {
            content: vec![ContentBlock::Text(TextContent::new(format!(
                "Stopping: the turn limit for this run ({max_turns}) was reached before the \
                 task completed. Resume the conversation to continue."
            )))],
            api: self.provider.api().to_string(),
            provider: self.provider.name().to_string(),
            model: self.provider.model_id().to_string(),
            usage: Usage::default(),
            stop_reason: StopReason::TurnCapped,
            error_message: None,
            timestamp: now_millis(),
        }
    }

    async fn finish_cancelled(&mut self, options: &SendOptions) -> Result<SendResult> {
        self.transcript.trim_orphan_tool_calls();
        self.persist_best_effort(options).await;
        self.state = ThreadState::Cancelled;
        Err(Error::Cancelled)
    }

    async fn persist_best_effort(&mut self, options: &SendOptions) {
        if options.no_save {
            return;
        }
        let Some(store) = &self.store else { return };
        let record = self.build_record();
        if let Err(err) = store.save(&record).await {
            tracing::warn!(error = %err, "best-effort persistence of partial transcript failed");
        }
    }

    /// Assemble the persistence record from the current thread state.
    pub fn build_record(&self) -> ConversationRecord {
        let mut record = ConversationRecord::new(&self.conversation_id, self.provider.name());
        record.created_at = self.created_at;
        record.updated_at = Utc::now();
        record.messages = self.transcript.messages().to_vec();
        record.raw_messages = self.provider.raw_messages(self.transcript.messages());
        record.usage = self.usage();
        record.first_message = self.transcript.first_user_text();
        record.summary = self.transcript.last_assistant_text().map(|text| {
            let mut summary: String = text.chars().take(100).collect();
            if text.chars().count() > 100 {
                summary.push_str("...");
            }
            summary
        });
        record.file_last_access = self.tool_state.file_access_snapshot();
        record.background_processes = self.tool_state.background_processes();
        record.tool_results = self.tool_results.clone();
        record
    }

    /// Validate, gate through hooks, and execute one turn's tool calls.
    ///
    /// Results come back in tool-call order regardless of completion order.
    /// The bool reports whether cancellation interrupted execution.
    async fn execute_tool_calls(
        &self,
        tool_calls: &[ToolCall],
        registry: &ToolRegistry,
        cancel: &CancelToken,
    ) -> (Vec<StructuredToolResult>, bool) {
        let mut outputs: Vec<Option<StructuredToolResult>> = Vec::new();
        outputs.resize_with(tool_calls.len(), || None);
        let mut runnable: Vec<(usize, ToolInvocation)> = Vec::new();

        // Validation and hook gating happen up front, sequentially; invalid
        // inputs and blocked calls become failed results without executing.
        for (index, call) in tool_calls.iter().enumerate() {
            let Some(tool) = registry.get(&call.name) else {
                outputs[index] = Some(StructuredToolResult::failure(
                    &call.name,
                    format!("unknown tool '{}'", call.name),
                ));
                continue;
            };
            if let Err(err) = tool.validate(&call.arguments) {
                outputs[index] = Some(StructuredToolResult::failure(&call.name, err.to_string()));
                continue;
            }

            let mut invocation = ToolInvocation {
                call_id: call.id.clone(),
                name: call.name.clone(),
                input: call.arguments.clone(),
            };
            match self.hooks.before_tool_call(&invocation).await {
                HookDecision::Block { reason } => {
                    outputs[index] = Some(StructuredToolResult::blocked(&call.name, reason));
                    continue;
                }
                HookDecision::RewriteInput { input } => invocation.input = input,
                HookDecision::Allow => {}
            }
            runnable.push((index, invocation));
        }

        let mut cancelled = false;
        let parallel_supported = self.provider.supports_parallel_tool_calls();

        // Fork-join with safety barriers: concurrency-safe tools batch up;
        // a serial tool flushes the batch first, then runs alone.
        let mut batch: Vec<(usize, ToolInvocation)> = Vec::new();
        let mut iter = runnable.into_iter().peekable();
        while let Some((index, invocation)) = iter.next() {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let concurrency_safe = parallel_supported
                && registry
                    .get(&invocation.name)
                    .is_some_and(|tool| tool.concurrency_safe());

            if concurrency_safe {
                batch.push((index, invocation));
                if iter.peek().is_some() {
                    continue;
                }
                let results = self
                    .run_batch(std::mem::take(&mut batch), registry, cancel)
                    .await;
                cancelled = self.collect_batch(results, &mut outputs);
            } else {
                if !batch.is_empty() {
                    let results = self
                        .run_batch(std::mem::take(&mut batch), registry, cancel)
                        .await;
                    if self.collect_batch(results, &mut outputs) {
                        cancelled = true;
                        break;
                    }
                }
                let results = self.run_batch(vec![(index, invocation)], registry, cancel).await;
                if self.collect_batch(results, &mut outputs) {
                    cancelled = true;
                    break;
                }
            }
        }
        if !batch.is_empty() && !cancelled {
            let results = self.run_batch(batch, registry, cancel).await;
            cancelled = self.collect_batch(results, &mut outputs);
        }

        let results = tool_calls
            .iter()
            .zip(outputs)
            .map(|(call, output)| {
                output.unwrap_or_else(|| {
                    if cancelled || cancel.is_cancelled() {
                        StructuredToolResult::cancelled(&call.name)
                    } else {
                        StructuredToolResult::failure(&call.name, "tool did not run")
                    }
                })
            })
            .collect();
        (results, cancelled || cancel.is_cancelled())
    }

    /// Run one batch concurrently, racing the cancellation token. On cancel,
    /// in-flight tools get a grace period to observe the token.
    async fn run_batch(
        &self,
        batch: Vec<(usize, ToolInvocation)>,
        registry: &ToolRegistry,
        cancel: &CancelToken,
    ) -> Vec<(usize, StructuredToolResult)> {
        let futures = batch.into_iter().map(|(index, invocation)| {
            let tool = registry.get(&invocation.name).map(Arc::clone);
            let state = Arc::clone(&self.tool_state);
            let hooks = self.hooks.clone();
            let cancel = cancel.clone();
            async move {
                let name = invocation.name.clone();
                // Each tool runs in its own task so a panicking tool turns
                // into a failed result instead of taking down its siblings.
                let handle = tokio::spawn(async move {
                    let result = match tool {
                        Some(tool) => tool.execute(&invocation, &state, &cancel).await,
                        None => StructuredToolResult::failure(&invocation.name, "unknown tool"),
                    };
                    hooks.after_tool_call(&invocation, result).await
                });
                match handle.await {
                    Ok(result) => (index, result),
                    Err(err) => {
                        tracing::warn!(tool = %name, error = %err, "tool task aborted");
                        (
                            index,
                            StructuredToolResult::failure(&name, "tool panicked during execution"),
                        )
                    }
                }
            }
        });

        let mut joined = Box::pin(
            stream::iter(futures)
                .buffer_unordered(MAX_CONCURRENT_TOOLS)
                .collect::<Vec<_>>(),
        );

        tokio::select! {
            results = &mut joined => results,
            () = cancel.cancelled() => {
                match tokio::time::timeout(TOOL_CANCEL_GRACE, &mut joined).await {
                    Ok(results) => results,
                    Err(_) => Vec::new(),
                }
            }
        }
    }

    /// Store batch results; returns true when cancellation fired.
    fn collect_batch(
        &self,
        results: Vec<(usize, StructuredToolResult)>,
        outputs: &mut [Option<StructuredToolResult>],
    ) -> bool {
        let mut any = false;
        for (index, result) in results {
            outputs[index] = Some(result);
            any = true;
        }
        // An empty result set from a non-empty batch means the grace period
        // expired after cancellation.
        !any
    }
}

/// Consume one provider stream, forwarding deltas to the sink, racing
/// cancellation, and returning the completed assistant message.
async fn consume_stream(
    mut event_stream: EventStream,
    sink: &EventSink,
    cancel: &CancelToken,
) -> Result<AssistantMessage> {
    loop {
        let next = tokio::select! {
            next = event_stream.next() => next,
            () = cancel.cancelled() => return Err(Error::Cancelled),
        };
        let Some(event) = next else {
            return Err(Error::fatal("provider", "stream ended without a final message"));
        };
        match event? {
            StreamEvent::Start | StreamEvent::TextStart { .. } | StreamEvent::ToolCallStart { .. } => {}
            StreamEvent::TextDelta { delta, .. } => {
                sink.emit(ThreadEvent::TextDelta { delta }).await;
            }
            StreamEvent::TextEnd { content, .. } => {
                sink.emit(ThreadEvent::Text { text: content }).await;
            }
            StreamEvent::ThinkingStart { .. } => {
                sink.emit(ThreadEvent::ThinkingStart).await;
            }
            StreamEvent::ThinkingDelta { delta, .. } => {
                sink.emit(ThreadEvent::ThinkingDelta { delta }).await;
            }
            StreamEvent::ThinkingEnd { content, .. } => {
                sink.emit(ThreadEvent::ThinkingEnd { thinking: content }).await;
            }
            StreamEvent::ToolCallDelta { delta, .. } => {
                sink.emit(ThreadEvent::ToolCallPartial { delta }).await;
            }
            StreamEvent::ToolCallEnd { .. } => {}
            StreamEvent::Done { message, .. } | StreamEvent::Error { message, .. } => {
                return Ok(message);
            }
        }
    }
}

fn build_user_message(text: &str, images: &[ImageContent]) -> UserMessage {
    if images.is_empty() {
        UserMessage {
            content: UserContent::Text(text.to_string()),
            timestamp: now_millis(),
        }
    } else {
        let mut blocks = vec![ContentBlock::Text(TextContent::new(text))];
        blocks.extend(images.iter().cloned().map(ContentBlock::Image));
        UserMessage {
            content: UserContent::Blocks(blocks),
            timestamp: now_millis(),
        }
    }
}
