//! Model catalog: pricing, context windows, and capability flags.
//!
//! The catalog backs cost computation and the advertised context window
//! used by the compaction trigger. Unknown models fall back to
//! conservative defaults so a new model id never breaks the runtime.

use crate::provider::ModelPrice;

/// Static description of a known model.
#[derive(Debug, Clone, Copy)]
pub struct ModelInfo {
    pub id: &'static str,
    pub provider: &'static str,
    pub context_window: u32,
    pub max_output_tokens: u32,
    /// Reasoning-capable model class (thinking blocks / reasoning effort).
    pub reasoning: bool,
    /// Whether the chat wire protocol permits client-side parallel tool calls.
    pub parallel_tools: bool,
    pub price: ModelPrice,
}

const fn price(input: f64, output: f64, cache_read: f64, cache_write: f64) -> ModelPrice {
    ModelPrice {
        input,
        output,
        cache_read,
        cache_write,
    }
}

/// Known models. Prefix matching applies, so point releases inherit their
/// family entry.
pub const CATALOG: &[ModelInfo] = &[
    ModelInfo {
        id: "claude-opus-4",
        provider: "anthropic",
        context_window: 200_000,
        max_output_tokens: 32_000,
        reasoning: true,
        parallel_tools: true,
        price: price(15.0, 75.0, 1.5, 18.75),
    },
    ModelInfo {
        id: "claude-sonnet-4",
        provider: "anthropic",
        context_window: 200_000,
        max_output_tokens: 64_000,
        reasoning: true,
        parallel_tools: true,
        price: price(3.0, 15.0, 0.3, 3.75),
    },
    ModelInfo {
        id: "claude-haiku-4",
        provider: "anthropic",
        context_window: 200_000,
        max_output_tokens: 64_000,
        reasoning: false,
        parallel_tools: true,
        price: price(1.0, 5.0, 0.1, 1.25),
    },
    ModelInfo {
        id: "claude-3-5-haiku",
        provider: "anthropic",
        context_window: 200_000,
        max_output_tokens: 8_192,
        reasoning: false,
        parallel_tools: true,
        price: price(0.8, 4.0, 0.08, 1.0),
    },
    ModelInfo {
        id: "gpt-5",
        provider: "openai",
        context_window: 400_000,
        max_output_tokens: 128_000,
        reasoning: true,
        parallel_tools: false,
        price: price(1.25, 10.0, 0.125, 0.0),
    },
    ModelInfo {
        id: "gpt-4.1",
        provider: "openai",
        context_window: 1_047_576,
        max_output_tokens: 32_768,
        reasoning: false,
        parallel_tools: true,
        price: price(2.0, 8.0, 0.5, 0.0),
    },
    ModelInfo {
        id: "gpt-4o",
        provider: "openai",
        context_window: 128_000,
        max_output_tokens: 16_384,
        reasoning: false,
        parallel_tools: true,
        price: price(2.5, 10.0, 1.25, 0.0),
    },
    ModelInfo {
        id: "o3",
        provider: "openai",
        context_window: 200_000,
        max_output_tokens: 100_000,
        reasoning: true,
        parallel_tools: false,
        price: price(2.0, 8.0, 0.5, 0.0),
    },
    ModelInfo {
        id: "o4-mini",
        provider: "openai",
        context_window: 200_000,
        max_output_tokens: 100_000,
        reasoning: true,
        parallel_tools: false,
        price: price(1.1, 4.4, 0.275, 0.0),
    },
];

/// Fallback for model ids not in the catalog.
pub const DEFAULT_MODEL_INFO: ModelInfo = ModelInfo {
    id: "unknown",
    provider: "unknown",
    context_window: 128_000,
    max_output_tokens: 8_192,
    reasoning: false,
    parallel_tools: false,
    price: price(0.0, 0.0, 0.0, 0.0),
};

/// Short aliases accepted anywhere a model id is.
const ALIASES: &[(&str, &str)] = &[
    ("opus", "claude-opus-4"),
    ("sonnet", "claude-sonnet-4"),
    ("haiku", "claude-haiku-4"),
];

/// Resolve an alias to a catalog model id, or return the input unchanged.
pub fn resolve_alias(name: &str) -> &str {
    ALIASES
        .iter()
        .find(|(alias, _)| *alias == name)
        .map_or(name, |(_, id)| *id)
}

/// Look up model info by id. Longest matching catalog prefix wins, so
/// `claude-sonnet-4-5-20260101` resolves to the `claude-sonnet-4` family.
pub fn lookup(model_id: &str) -> ModelInfo {
    let model_id = resolve_alias(model_id);
    CATALOG
        .iter()
        .filter(|info| model_id.starts_with(info.id))
        .max_by_key(|info| info.id.len())
        .copied()
        .unwrap_or(DEFAULT_MODEL_INFO)
}

/// Whether a model name belongs to the OpenAI families.
pub fn is_openai_model(model_id: &str) -> bool {
    let model_id = resolve_alias(model_id);
    model_id.starts_with("gpt-")
        || model_id.starts_with("o1")
        || model_id.starts_with("o3")
        || model_id.starts_with("o4")
}
