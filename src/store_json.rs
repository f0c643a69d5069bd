//! File-per-record conversation store.
//!
//! Fallback backend: each conversation lives in `<dir>/<id>.json`. Writes go
//! through a temp file in the same directory followed by an atomic rename,
//! under a per-record advisory file lock so concurrent processes serialize
//! on the same conversation without blocking unrelated ones.

use crate::error::{Error, Result};
use crate::store::{
    ConversationRecord, ConversationStore, ConversationSummary, QueryOptions, QueryResult,
    apply_query,
};
use async_trait::async_trait;
use fs4::fs_std::FileExt;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

/// JSON file-per-record store rooted at one directory.
#[derive(Debug, Clone)]
pub struct JsonStore {
    dir: PathBuf,
}

impl JsonStore {
    /// Open (and create) a store directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn lock_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.lock"))
    }

    /// Acquire the per-record advisory lock. Held for the duration of a
    /// save; readers do not take it (they read the atomically renamed file).
    fn lock_record(&self, id: &str) -> Result<fs::File> {
        let lock = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.lock_path(id))?;
        lock.lock_exclusive()?;
        Ok(lock)
    }

    fn read_record(path: &Path) -> Result<ConversationRecord> {
        let data = fs::read(path)?;
        let record: ConversationRecord = serde_json::from_slice(&data)?;
        record.check_version()?;
        Ok(record)
    }

    fn save_blocking(dir: &Path, lock: &fs::File, record: &ConversationRecord) -> Result<()> {
        let path = dir.join(format!("{}.json", record.id));
        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer(&mut temp, record)?;
        temp.flush()?;
        temp.persist(&path)
            .map_err(|err| Error::persistence(format!("atomic rename failed: {}", err.error)))?;
        // Lock released on drop; make the dependency explicit.
        let _ = lock;
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for JsonStore {
    async fn save(&self, record: &ConversationRecord) -> Result<()> {
        let store = self.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || {
            let lock = store.lock_record(&record.id)?;
            Self::save_blocking(&store.dir, &lock, &record)
        })
        .await
        .map_err(|err| Error::persistence(format!("save task failed: {err}")))?
    }

    async fn load(&self, id: &str) -> Result<ConversationRecord> {
        let path = self.record_path(id);
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            if !path.exists() {
                return Err(Error::NotFound { id });
            }
            Self::read_record(&path)
        })
        .await
        .map_err(|err| Error::persistence(format!("load task failed: {err}")))?
    }

    async fn list(&self, options: &QueryOptions) -> Result<QueryResult> {
        let dir = self.dir.clone();
        let options = options.clone();
        tokio::task::spawn_blocking(move || {
            let mut summaries: Vec<ConversationSummary> = Vec::new();
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match Self::read_record(&path) {
                    Ok(record) => summaries.push(record.to_summary()),
                    Err(err) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %err,
                            "skipping unreadable conversation record"
                        );
                    }
                }
            }
            Ok(apply_query(summaries, &options))
        })
        .await
        .map_err(|err| Error::persistence(format!("list task failed: {err}")))?
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let record = self.record_path(id);
        let lock = self.lock_path(id);
        tokio::task::spawn_blocking(move || {
            for path in [record, lock] {
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(Error::Io(err)),
                }
            }
            Ok(())
        })
        .await
        .map_err(|err| Error::persistence(format!("delete task failed: {err}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Message;
    use crate::store::generate_conversation_id;

    fn record_with_message(id: &str, text: &str) -> ConversationRecord {
        let mut record = ConversationRecord::new(id, "anthropic");
        record.messages.push(Message::user_text(text));
        record.first_message = Some(text.to_string());
        record
    }

    #[tokio::test]
    async fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        let record = record_with_message(&generate_conversation_id(), "hello");
        store.save(&record).await.unwrap();
        let loaded = store.load(&record.id).await.unwrap();
        assert_eq!(record, loaded);
    }

    #[tokio::test]
    async fn load_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.load("nope").await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn list_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        let a = record_with_message("20260101T000000-aaaaaaaa", "first");
        let b = record_with_message("20260102T000000-bbbbbbbb", "second");
        store.save(&a).await.unwrap();
        store.save(&b).await.unwrap();

        let result = store.list(&QueryOptions::default()).await.unwrap();
        assert_eq!(result.total, 2);

        store.delete(&a.id).await.unwrap();
        // Deleting twice is fine.
        store.delete(&a.id).await.unwrap();
        let result = store.list(&QueryOptions::default()).await.unwrap();
        assert_eq!(result.total, 1);
        assert_eq!(result.summaries[0].id, b.id);
    }

    #[tokio::test]
    async fn most_recent_prefers_latest_update() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path()).unwrap();
        let mut a = record_with_message("20260101T000000-aaaaaaaa", "first");
        a.updated_at = chrono::DateTime::from_timestamp(100, 0).unwrap();
        let mut b = record_with_message("20260102T000000-bbbbbbbb", "second");
        b.updated_at = chrono::DateTime::from_timestamp(200, 0).unwrap();
        store.save(&a).await.unwrap();
        store.save(&b).await.unwrap();
        assert_eq!(store.most_recent().await.unwrap(), Some(b.id));
    }
}
