//! Provider adapter implementations.
//!
//! Three concrete adapters sit behind the [`Provider`](crate::provider::Provider)
//! trait: Anthropic Messages, OpenAI Chat Completions, and OpenAI Responses.
//! Selection follows an explicit provider name when given, otherwise the
//! model-name family.

pub mod anthropic;
pub mod openai;
pub mod openai_responses;
pub mod retry;

pub use retry::{Backoff, RetryPolicy, with_retry};

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::models;
use crate::provider::Provider;
use std::sync::Arc;

/// Create a provider for `model`, honoring an explicit provider override.
///
/// Accepted provider names: `anthropic`, `openai`, `openai-responses`.
pub fn create_provider(
    provider: Option<&str>,
    model: &str,
    config: &RuntimeConfig,
) -> Result<Arc<dyn Provider>> {
    let model = models::resolve_alias(model).to_string();

    if let Some(name) = provider {
        return match name {
            "anthropic" => Ok(Arc::new(
                anthropic::AnthropicProvider::new(&model).with_api_key(config.anthropic_api_key.clone()),
            )),
            "openai" => Ok(Arc::new(
                openai::OpenAiProvider::new(&model).with_api_key(config.openai_api_key.clone()),
            )),
            "openai-responses" => Ok(Arc::new(
                openai_responses::OpenAiResponsesProvider::new(&model)
                    .with_api_key(config.openai_api_key.clone()),
            )),
            other => Err(Error::config(format!("unsupported provider: {other}"))),
        };
    }

    // No explicit provider: detect by model family. Anthropic is the
    // default for unknown names.
    if models::is_openai_model(&model) {
        Ok(Arc::new(
            openai::OpenAiProvider::new(&model).with_api_key(config.openai_api_key.clone()),
        ))
    } else {
        Ok(Arc::new(
            anthropic::AnthropicProvider::new(&model).with_api_key(config.anthropic_api_key.clone()),
        ))
    }
}

/// Map an HTTP status from a provider API to the runtime error taxonomy.
pub(crate) fn classify_status(provider: &str, status: u16, body: &str) -> Error {
    let message = format!("HTTP {status}: {body}");
    if status == 429 || (500..600).contains(&status) {
        Error::transient(provider, message)
    } else {
        Error::fatal(provider, message)
    }
}
