//! Conversation records and the persistence store contract.
//!
//! A conversation record is the unit of persistence: the canonical
//! transcript, the raw provider wire form, usage, tool results by call id,
//! and ambient state (file access times, background processes). Records are
//! written after every completed exchange and after every failed exchange
//! that produced output or tool side effects.

use crate::error::{Error, Result};
use crate::model::{Message, Usage};
use crate::tools::{BackgroundProcess, StructuredToolResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Current conversation record schema version.
pub const RECORD_VERSION: u32 = 2;

/// Generate a sortable conversation id: UTC timestamp plus a short nonce.
pub fn generate_conversation_id() -> String {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S");
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!("{stamp}-{}", &nonce[..8])
}

/// A persisted conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub id: String,
    pub version: u32,
    pub provider: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_message: Option<String>,
    /// Canonical messages (provider-independent, used for rendering and
    /// cross-provider resume).
    pub messages: Vec<Message>,
    /// Provider wire form of the same transcript, for exact-fidelity resume
    /// within the same provider.
    pub raw_messages: Value,
    pub usage: Usage,
    #[serde(default)]
    pub file_last_access: HashMap<String, i64>,
    #[serde(default)]
    pub background_processes: Vec<BackgroundProcess>,
    /// Structured results keyed by tool call id.
    #[serde(default)]
    pub tool_results: HashMap<String, StructuredToolResult>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl ConversationRecord {
    pub fn new(id: impl Into<String>, provider: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            version: RECORD_VERSION,
            provider: provider.into(),
            created_at: now,
            updated_at: now,
            summary: None,
            first_message: None,
            messages: Vec::new(),
            raw_messages: Value::Array(Vec::new()),
            usage: Usage::default(),
            file_last_access: HashMap::new(),
            background_processes: Vec::new(),
            tool_results: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    /// Reject records written by a future schema version.
    pub fn check_version(&self) -> Result<()> {
        if self.version > RECORD_VERSION {
            return Err(Error::SchemaVersionMismatch {
                found: self.version,
                supported: RECORD_VERSION,
            });
        }
        Ok(())
    }

    /// Projection for listings.
    pub fn to_summary(&self) -> ConversationSummary {
        ConversationSummary {
            id: self.id.clone(),
            message_count: self.messages.len(),
            first_message: self.first_message.clone().unwrap_or_default(),
            summary: self.summary.clone(),
            provider: self.provider.clone(),
            usage: self.usage.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// A brief overview of one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: String,
    pub message_count: usize,
    pub first_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub provider: String,
    pub usage: Usage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Sort field for conversation queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortBy {
    #[default]
    UpdatedAt,
    CreatedAt,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Filtering, sorting, and pagination for `list`.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Substring match against first message and summary.
    pub search_term: Option<String>,
    pub provider: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// 0 means no limit.
    pub limit: usize,
    pub offset: usize,
    pub sort_by: SortBy,
    pub sort_order: SortOrder,
}

/// Result of a `list` query.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub summaries: Vec<ConversationSummary>,
    /// Total matches before pagination.
    pub total: usize,
}

/// The persistence store contract.
///
/// Multiple processes may open the same store; `save` is atomic per record
/// and `list` reads a consistent snapshot.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Persist the whole record atomically.
    async fn save(&self, record: &ConversationRecord) -> Result<()>;

    /// Load a record by id. `Error::NotFound` when the id does not exist.
    async fn load(&self, id: &str) -> Result<ConversationRecord>;

    /// List conversation summaries matching the query.
    async fn list(&self, options: &QueryOptions) -> Result<QueryResult>;

    /// Delete a record by id. Deleting a missing record is not an error.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Id of the most recently updated conversation, if any.
    async fn most_recent(&self) -> Result<Option<String>> {
        let result = self
            .list(&QueryOptions {
                limit: 1,
                ..QueryOptions::default()
            })
            .await?;
        Ok(result.summaries.into_iter().next().map(|s| s.id))
    }
}

/// Apply query filtering/sorting/pagination to a full summary set.
///
/// Shared by the JSON store and tests; the SQLite store pushes the
/// equivalent into SQL.
pub fn apply_query(mut summaries: Vec<ConversationSummary>, options: &QueryOptions) -> QueryResult {
    if let Some(provider) = &options.provider {
        summaries.retain(|s| &s.provider == provider);
    }
    if let Some(term) = &options.search_term {
        let term = term.to_lowercase();
        summaries.retain(|s| {
            s.first_message.to_lowercase().contains(&term)
                || s.summary
                    .as_deref()
                    .is_some_and(|sum| sum.to_lowercase().contains(&term))
        });
    }
    if let Some(since) = options.since {
        summaries.retain(|s| s.updated_at >= since);
    }
    if let Some(until) = options.until {
        summaries.retain(|s| s.updated_at <= until);
    }

    summaries.sort_by(|a, b| {
        let ordering = match options.sort_by {
            SortBy::UpdatedAt => a.updated_at.cmp(&b.updated_at),
            SortBy::CreatedAt => a.created_at.cmp(&b.created_at),
        };
        match options.sort_order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    });

    let total = summaries.len();
    let page: Vec<ConversationSummary> = summaries
        .into_iter()
        .skip(options.offset)
        .take(if options.limit == 0 {
            usize::MAX
        } else {
            options.limit
        })
        .collect();

    QueryResult {
        summaries: page,
        total,
    }
}
