//! SQLite conversation store.
//!
//! Default backend: one database file holds every conversation. Saves run
//! in an immediate transaction so a record is visible in full or not at
//! all; WAL mode lets readers overlap a writer. A `schema_version` table
//! gates idempotent migrations at open time.

use crate::error::{Error, Result};
use crate::store::{
    ConversationRecord, ConversationStore, ConversationSummary, QueryOptions, QueryResult, SortBy,
    SortOrder,
};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Database schema version (independent of the record schema version).
const SCHEMA_VERSION: i64 = 1;

const INIT_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
  version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS conversations (
  id TEXT PRIMARY KEY,
  provider TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  summary TEXT,
  first_message TEXT,
  message_count INTEGER NOT NULL DEFAULT 0,
  usage_json TEXT NOT NULL,
  record_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conversations_updated_at
  ON conversations(updated_at);
CREATE INDEX IF NOT EXISTS idx_conversations_provider
  ON conversations(provider);
";

/// SQLite-backed conversation store.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    #[allow(dead_code)]
    path: PathBuf,
}

impl SqliteStore {
    /// Open (and migrate) a database file.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// In-memory database, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
        })
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| Error::persistence("sqlite connection lock poisoned"))?;
            op(&mut guard)
        })
        .await
        .map_err(|err| Error::persistence(format!("store task failed: {err}")))?
    }
}

/// Run schema migrations once; safe to call on every open.
fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(INIT_SQL)?;
    let current: Option<i64> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .optional()?;

    match current {
        None => {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;
        }
        Some(version) if version > SCHEMA_VERSION => {
            return Err(Error::SchemaVersionMismatch {
                found: u32::try_from(version).unwrap_or(u32::MAX),
                supported: u32::try_from(SCHEMA_VERSION).unwrap_or(0),
            });
        }
        Some(version) if version < SCHEMA_VERSION => {
            // Stepwise migrations land here as the schema evolves.
            conn.execute(
                "UPDATE schema_version SET version = ?1",
                params![SCHEMA_VERSION],
            )?;
        }
        Some(_) => {}
    }
    Ok(())
}

fn row_to_summary(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationSummary> {
    let usage_json: String = row.get("usage_json")?;
    let usage = serde_json::from_str(&usage_json).unwrap_or_default();
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    Ok(ConversationSummary {
        id: row.get("id")?,
        message_count: row.get::<_, i64>("message_count")? as usize,
        first_message: row
            .get::<_, Option<String>>("first_message")?
            .unwrap_or_default(),
        summary: row.get("summary")?,
        provider: row.get("provider")?,
        usage,
        created_at: created_at.parse().unwrap_or(chrono::DateTime::UNIX_EPOCH),
        updated_at: updated_at.parse().unwrap_or(chrono::DateTime::UNIX_EPOCH),
    })
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn save(&self, record: &ConversationRecord) -> Result<()> {
        let record = record.clone();
        self.with_conn(move |conn| {
            let record_json = serde_json::to_string(&record)?;
            let usage_json = serde_json::to_string(&record.usage)?;
            let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
            tx.execute(
                "INSERT INTO conversations
                   (id, provider, created_at, updated_at, summary, first_message,
                    message_count, usage_json, record_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                   provider = excluded.provider,
                   updated_at = excluded.updated_at,
                   summary = excluded.summary,
                   first_message = excluded.first_message,
                   message_count = excluded.message_count,
                   usage_json = excluded.usage_json,
                   record_json = excluded.record_json",
                params![
                    record.id,
                    record.provider,
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                    record.summary,
                    record.first_message,
                    record.messages.len() as i64,
                    usage_json,
                    record_json,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn load(&self, id: &str) -> Result<ConversationRecord> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let record_json: Option<String> = conn
                .query_row(
                    "SELECT record_json FROM conversations WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(record_json) = record_json else {
                return Err(Error::NotFound { id });
            };
            let record: ConversationRecord = serde_json::from_str(&record_json)?;
            record.check_version()?;
            Ok(record)
        })
        .await
    }

    async fn list(&self, options: &QueryOptions) -> Result<QueryResult> {
        let options = options.clone();
        self.with_conn(move |conn| {
            let mut clauses: Vec<String> = Vec::new();
            let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

            if let Some(provider) = &options.provider {
                clauses.push(format!("provider = ?{}", args.len() + 1));
                args.push(Box::new(provider.clone()));
            }
            if let Some(term) = &options.search_term {
                clauses.push(format!(
                    "(first_message LIKE ?{n} OR summary LIKE ?{n})",
                    n = args.len() + 1
                ));
                args.push(Box::new(format!("%{term}%")));
            }
            if let Some(since) = options.since {
                clauses.push(format!("updated_at >= ?{}", args.len() + 1));
                args.push(Box::new(since.to_rfc3339()));
            }
            if let Some(until) = options.until {
                clauses.push(format!("updated_at <= ?{}", args.len() + 1));
                args.push(Box::new(until.to_rfc3339()));
            }

            let where_sql = if clauses.is_empty() {
                String::new()
            } else {
                format!("WHERE {}", clauses.join(" AND "))
            };
            let sort_col = match options.sort_by {
                SortBy::UpdatedAt => "updated_at",
                SortBy::CreatedAt => "created_at",
            };
            let sort_dir = match options.sort_order {
                SortOrder::Asc => "ASC",
                SortOrder::Desc => "DESC",
            };

            let params_ref: Vec<&dyn rusqlite::types::ToSql> =
                args.iter().map(AsRef::as_ref).collect();

            let total: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM conversations {where_sql}"),
                params_ref.as_slice(),
                |row| row.get(0),
            )?;

            let limit = if options.limit == 0 {
                i64::MAX
            } else {
                options.limit as i64
            };
            let sql = format!(
                "SELECT id, provider, created_at, updated_at, summary, first_message,
                        message_count, usage_json
                 FROM conversations {where_sql}
                 ORDER BY {sort_col} {sort_dir}
                 LIMIT {limit} OFFSET {}",
                options.offset
            );
            let mut stmt = conn.prepare(&sql)?;
            let summaries = stmt
                .query_map(params_ref.as_slice(), row_to_summary)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(QueryResult {
                summaries,
                total: total as usize,
            })
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
    }
}
