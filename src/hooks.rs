//! Lifecycle hooks.
//!
//! External integrations observe and shape the exchange loop at fixed
//! points: before/after tool calls, on user message send, when the agent
//! would stop, and at turn end. Hooks run under a timeout and are
//! fail-open: a hook that times out or errors never blocks the loop.

use crate::model::Message;
use crate::tools::{StructuredToolResult, ToolInvocation};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Default budget for a single hook invocation.
pub const HOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// Decision returned by blocking-capable hook points.
#[derive(Debug, Clone)]
pub enum HookDecision {
    Allow,
    /// Refuse the operation. For tool calls this becomes a failed tool
    /// result carrying the reason; for user messages it fails the send.
    Block { reason: String },
    /// Allow, substituting a rewritten tool input.
    RewriteInput { input: Value },
}

/// A lifecycle hook. Every method has a permissive default, so hooks
/// implement only the points they care about.
#[async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    /// Runs before a tool executes. Deny-fast: the first blocking hook
    /// decides and the tool never starts.
    async fn before_tool_call(&self, _invocation: &ToolInvocation) -> HookDecision {
        HookDecision::Allow
    }

    /// Runs after a tool executed. May rewrite the structured result.
    async fn after_tool_call(
        &self,
        _invocation: &ToolInvocation,
        _result: &StructuredToolResult,
    ) -> Option<StructuredToolResult> {
        None
    }

    /// Runs before a user message enters the transcript.
    async fn user_message_send(&self, _text: &str) -> HookDecision {
        HookDecision::Allow
    }

    /// Runs when the model stopped without tool calls. Returned strings are
    /// injected as follow-up user messages and the loop continues.
    async fn agent_stop(&self, _transcript: &[Message]) -> Vec<String> {
        Vec::new()
    }

    /// Runs at the end of every turn.
    async fn turn_end(&self, _turn: usize) {}
}

/// An ordered set of hooks with fail-open dispatch.
#[derive(Clone)]
pub struct HookSet {
    hooks: Vec<Arc<dyn Hook>>,
    timeout: Duration,
}

impl Default for HookSet {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HookSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookSet")
            .field("hooks", &self.hooks.iter().map(|h| h.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl HookSet {
    pub fn new() -> Self {
        Self {
            hooks: Vec::new(),
            timeout: HOOK_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn push(&mut self, hook: Arc<dyn Hook>) {
        self.hooks.push(hook);
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Dispatch `before_tool_call` to every hook in order. The first block
    /// wins; rewrites compose left to right. A timed-out hook counts as
    /// allowing.
    pub async fn before_tool_call(&self, invocation: &ToolInvocation) -> HookDecision {
        let mut rewritten: Option<Value> = None;
        for hook in &self.hooks {
            let mut effective = invocation.clone();
            if let Some(input) = &rewritten {
                effective.input = input.clone();
            }
            match tokio::time::timeout(self.timeout, hook.before_tool_call(&effective)).await {
                Ok(HookDecision::Block { reason }) => {
                    return HookDecision::Block { reason };
                }
                Ok(HookDecision::RewriteInput { input }) => {
                    rewritten = Some(input);
                }
                Ok(HookDecision::Allow) => {}
                Err(_) => {
                    tracing::warn!(
                        hook = hook.name(),
                        tool = %invocation.name,
                        "before_tool_call hook timed out (fail-open)"
                    );
                }
            }
        }
        match rewritten {
            Some(input) => HookDecision::RewriteInput { input },
            None => HookDecision::Allow,
        }
    }

    /// Dispatch `after_tool_call`; later hooks see earlier rewrites.
    pub async fn after_tool_call(
        &self,
        invocation: &ToolInvocation,
        mut result: StructuredToolResult,
    ) -> StructuredToolResult {
        for hook in &self.hooks {
            match tokio::time::timeout(self.timeout, hook.after_tool_call(invocation, &result))
                .await
            {
                Ok(Some(modified)) => result = modified,
                Ok(None) => {}
                Err(_) => {
                    tracing::warn!(
                        hook = hook.name(),
                        tool = %invocation.name,
                        "after_tool_call hook timed out (fail-open)"
                    );
                }
            }
        }
        result
    }

    /// Dispatch `user_message_send`. Deny-fast.
    pub async fn user_message_send(&self, text: &str) -> HookDecision {
        for hook in &self.hooks {
            match tokio::time::timeout(self.timeout, hook.user_message_send(text)).await {
                Ok(HookDecision::Block { reason }) => return HookDecision::Block { reason },
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!(
                        hook = hook.name(),
                        "user_message_send hook timed out (fail-open)"
                    );
                }
            }
        }
        HookDecision::Allow
    }

    /// Collect follow-up messages from every hook.
    pub async fn agent_stop(&self, transcript: &[Message]) -> Vec<String> {
        let mut follow_ups = Vec::new();
        for hook in &self.hooks {
            match tokio::time::timeout(self.timeout, hook.agent_stop(transcript)).await {
                Ok(messages) => follow_ups.extend(messages),
                Err(_) => {
                    tracing::warn!(hook = hook.name(), "agent_stop hook timed out (fail-open)");
                }
            }
        }
        follow_ups
    }

    pub async fn turn_end(&self, turn: usize) {
        for hook in &self.hooks {
            if tokio::time::timeout(self.timeout, hook.turn_end(turn))
                .await
                .is_err()
            {
                tracing::warn!(hook = hook.name(), "turn_end hook timed out (fail-open)");
            }
        }
    }
}
