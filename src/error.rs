//! Error types for the skein runtime.

use thiserror::Error;

/// Result type alias using our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the skein runtime.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Tool input failed validation. Absorbed into a failed tool result
    /// inside the exchange loop; never surfaced to the caller directly.
    #[error("Invalid tool input for '{tool}': {message}")]
    InvalidToolInput { tool: String, message: String },

    /// Tool execution errors
    #[error("Tool error: {tool}: {message}")]
    Tool { tool: String, message: String },

    /// Transient provider error (network, 5xx, rate limit). Retried by the
    /// adapter; surfaced only after attempts are exhausted.
    #[error("Provider error (transient): {provider}: {message}")]
    ProviderTransient { provider: String, message: String },

    /// Fatal provider error (auth, invalid request, content filter).
    #[error("Provider error: {provider}: {message}")]
    ProviderFatal { provider: String, message: String },

    /// Conversation persistence failure. Fatal to the current exchange.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Conversation record not found
    #[error("Conversation not found: {id}")]
    NotFound { id: String },

    /// Persisted data was written by an unknown schema version.
    #[error("Schema version mismatch: found {found}, supported up to {supported}")]
    SchemaVersionMismatch { found: u32, supported: u32 },

    /// A lifecycle hook blocked the operation.
    #[error("Blocked by hook '{hook}': {reason}")]
    HookBlocked { hook: String, reason: String },

    /// The exchange was cancelled via its cancellation token.
    #[error("Operation cancelled")]
    Cancelled,

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// SQLite errors
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a tool error.
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Create an invalid-tool-input error.
    pub fn invalid_tool_input(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidToolInput {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Create a transient provider error.
    pub fn transient(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProviderTransient {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a fatal provider error.
    pub fn fatal(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProviderFatal {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a persistence error.
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Whether this error is worth retrying at the provider layer.
    ///
    /// Transport-level failures (connect/timeout) retry; everything that
    /// reached the server and was rejected deliberately does not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ProviderTransient { .. } => true,
            Self::Http(err) => err.is_connect() || err.is_timeout(),
            _ => false,
        }
    }
}
