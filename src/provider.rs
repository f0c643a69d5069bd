//! LLM provider abstraction layer.
//!
//! This module defines the provider trait and common types for interacting
//! with different LLM APIs behind one capability set.

use crate::error::Result;
use crate::model::{Message, StreamEvent, ThinkingLevel};
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;

/// Boxed event stream returned by `Provider::stream`.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>;

// ============================================================================
// Provider Trait
// ============================================================================

/// A provider for streaming LLM completions.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Get the provider name.
    fn name(&self) -> &str;

    /// Get the API type.
    fn api(&self) -> &str;

    /// Get the model identifier used by this provider.
    fn model_id(&self) -> &str;

    /// Advertised maximum context window in tokens.
    fn context_window(&self) -> u32;

    /// Pricing per million tokens for the configured model.
    fn price(&self) -> ModelPrice;

    /// Whether the wire protocol supports several tool calls executing in
    /// parallel on the client side.
    fn supports_parallel_tool_calls(&self) -> bool {
        true
    }

    /// Stream a completion.
    async fn stream(&self, context: &Context, options: &StreamOptions) -> Result<EventStream>;

    /// Build the exact wire-form messages this adapter would send, for
    /// lossless same-provider resume.
    fn raw_messages(&self, messages: &[Message]) -> serde_json::Value {
        serde_json::to_value(messages).unwrap_or(serde_json::Value::Null)
    }

    /// Drop any adapter-side conversation state (stateful APIs only).
    /// Called after compaction and on resume.
    fn reset_conversation_state(&self) {}
}

// ============================================================================
// Context
// ============================================================================

/// Context for a completion request.
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDef>,
}

// ============================================================================
// Tool Definition
// ============================================================================

/// A tool definition advertised to the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool input.
    pub parameters: serde_json::Value,
}

// ============================================================================
// Stream Options
// ============================================================================

/// Options for a streaming completion.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub api_key: Option<String>,
    pub cache_retention: CacheRetention,
    pub session_id: Option<String>,
    pub headers: HashMap<String, String>,
    pub thinking_level: Option<ThinkingLevel>,
    pub thinking_budgets: Option<ThinkingBudgets>,
    pub reasoning_effort: Option<ReasoningEffort>,
}

/// Prompt cache retention policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheRetention {
    #[default]
    None,
    Short,
    Long,
}

/// Reasoning effort for reasoning-capable OpenAI model classes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    #[default]
    Medium,
    High,
}

/// Custom thinking token budgets per level.
#[derive(Debug, Clone)]
pub struct ThinkingBudgets {
    pub low: u32,
    pub medium: u32,
    pub high: u32,
}

impl Default for ThinkingBudgets {
    fn default() -> Self {
        Self {
            low: 2048,
            medium: 8192,
            high: 16384,
        }
    }
}

impl ThinkingBudgets {
    pub const fn budget_for(&self, level: ThinkingLevel) -> u32 {
        match level {
            ThinkingLevel::Off => 0,
            ThinkingLevel::Low => self.low,
            ThinkingLevel::Medium => self.medium,
            ThinkingLevel::High => self.high,
        }
    }
}

// ============================================================================
// Pricing
// ============================================================================

/// Model pricing per million tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelPrice {
    pub input: f64,
    pub output: f64,
    pub cache_read: f64,
    pub cache_write: f64,
}

impl ModelPrice {
    /// Dollar cost of a usage sample at this price.
    #[allow(clippy::cast_precision_loss)]
    pub fn cost(&self, input: u64, output: u64, cache_read: u64, cache_write: u64) -> crate::model::Cost {
        let input_cost = (self.input / 1_000_000.0) * input as f64;
        let output_cost = (self.output / 1_000_000.0) * output as f64;
        let cache_read_cost = (self.cache_read / 1_000_000.0) * cache_read as f64;
        let cache_write_cost = (self.cache_write / 1_000_000.0) * cache_write as f64;
        crate::model::Cost {
            input: input_cost,
            output: output_cost,
            cache_read: cache_read_cost,
            cache_write: cache_write_cost,
            total: input_cost + output_cost + cache_read_cost + cache_write_cost,
        }
    }
}

// ============================================================================
// Tool Name Normalization
// ============================================================================

/// Normalize a registry tool name into a provider-safe wire identifier.
///
/// Providers constrain tool identifiers to `[a-zA-Z0-9_-]` and bounded
/// length; anything else maps to `_`.
pub fn normalize_tool_name(name: &str) -> String {
    let mut normalized: String = name
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if normalized.is_empty() {
        normalized.push('_');
    }
    normalized.truncate(64);
    normalized
}

/// Reversible, collision-free mapping between registry names and wire
/// identifiers over one advertised tool set.
#[derive(Debug, Clone, Default)]
pub struct ToolNameMap {
    to_wire: HashMap<String, String>,
    from_wire: HashMap<String, String>,
}

impl ToolNameMap {
    /// Build a total mapping for the advertised set. Collisions after
    /// normalization get a numeric suffix.
    pub fn build<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut map = Self::default();
        for name in names {
            let mut wire = normalize_tool_name(name);
            let mut counter = 2;
            while map.from_wire.contains_key(&wire) {
                let base = normalize_tool_name(name);
                let suffix = format!("_{counter}");
                let keep = base.len().min(64 - suffix.len());
                wire = format!("{}{suffix}", &base[..keep]);
                counter += 1;
            }
            map.to_wire.insert(name.to_string(), wire.clone());
            map.from_wire.insert(wire, name.to_string());
        }
        map
    }

    pub fn to_wire(&self, name: &str) -> Option<&str> {
        self.to_wire.get(name).map(String::as_str)
    }

    pub fn from_wire(&self, wire: &str) -> Option<&str> {
        self.from_wire.get(wire).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_is_provider_safe() {
        assert_eq!(normalize_tool_name("file.read"), "file_read");
        assert_eq!(normalize_tool_name("mcp:server/tool"), "mcp_server_tool");
        let long = "x".repeat(100);
        assert_eq!(normalize_tool_name(&long).len(), 64);
    }

    #[test]
    fn name_map_is_total_and_collision_free() {
        let map = ToolNameMap::build(["file.read", "file:read", "shell"]);
        let wire_a = map.to_wire("file.read").unwrap();
        let wire_b = map.to_wire("file:read").unwrap();
        assert_ne!(wire_a, wire_b);
        assert_eq!(map.from_wire(wire_a), Some("file.read"));
        assert_eq!(map.from_wire(wire_b), Some("file:read"));
        assert_eq!(map.from_wire("shell"), Some("shell"));
    }

    #[test]
    fn price_cost_sums_components() {
        let price = ModelPrice {
            input: 3.0,
            output: 15.0,
            cache_read: 0.3,
            cache_write: 3.75,
        };
        let cost = price.cost(1_000_000, 1_000_000, 0, 0);
        assert!((cost.total - 18.0).abs() < 1e-9);
    }
}
