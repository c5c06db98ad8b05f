//! Append-only journal of question/answer exchanges.
//!
//! Interactions are persisted as one pretty-printed JSON array in a single file, read and
//! rewritten whole on every append. A mutex serializes writers so concurrent chats cannot
//! lose records. A file that fails to parse is treated as empty; the next append replaces
//! its content.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::Mutex;

/// Errors raised while reading or writing the journal file.
#[derive(Debug, Error)]
pub enum JournalError {
    /// Filesystem read or write failed.
    #[error("Journal I/O failed: {0}")]
    Io(#[from] std::io::Error),
    /// Records could not be rendered as JSON.
    #[error("Journal serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    /// The current time could not be formatted.
    #[error("Timestamp formatting failed: {0}")]
    Timestamp(#[from] time::error::Format),
}

/// One logged question/answer exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionRecord {
    /// RFC 3339 time at which the exchange completed.
    pub timestamp: String,
    /// Document the question was asked against.
    pub doc_id: String,
    /// Question as submitted by the client.
    pub question: String,
    /// Answer returned by the chain.
    pub answer: String,
}

/// Append-only store of interaction records backed by one JSON file.
pub struct InteractionJournal {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl InteractionJournal {
    /// Create a journal backed by the given file path. The file is created on first append.
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    /// Append one record stamped with the current UTC time.
    ///
    /// The whole file is rewritten under the writer lock; record order is append order.
    pub async fn append(
        &self,
        doc_id: &str,
        question: &str,
        answer: &str,
    ) -> Result<(), JournalError> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.load().await?;
        let timestamp = OffsetDateTime::now_utc().format(&Rfc3339)?;
        records.push(InteractionRecord {
            timestamp,
            doc_id: doc_id.to_string(),
            question: question.to_string(),
            answer: answer.to_string(),
        });

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_string_pretty(&records)?;
        tokio::fs::write(&self.path, body).await?;
        tracing::debug!(path = %self.path.display(), records = records.len(), "Journal updated");
        Ok(())
    }

    /// Return every record currently on disk, oldest first.
    pub async fn read_all(&self) -> Result<Vec<InteractionRecord>, JournalError> {
        self.load().await
    }

    async fn load(&self) -> Result<Vec<InteractionRecord>, JournalError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_slice(&raw) {
            Ok(records) => Ok(records),
            Err(err) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    "Journal content unreadable; starting from an empty log"
                );
                Ok(Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn scratch_path() -> PathBuf {
        std::env::temp_dir().join(format!("ragchat-journal-{}.json", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn appends_accumulate_in_order() {
        let path = scratch_path();
        let journal = InteractionJournal::new(path.clone());

        journal.append("doc1", "first?", "one").await.expect("append");
        journal.append("doc1", "second?", "two").await.expect("append");
        journal
            .append("doc2", "third?", "three")
            .await
            .expect("append");

        let records = journal.read_all().await.expect("read");
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].question, "first?");
        assert_eq!(records[1].answer, "two");
        assert_eq!(records[2].doc_id, "doc2");
        assert!(records.iter().all(|record| !record.timestamp.is_empty()));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn missing_file_reads_as_empty() {
        let journal = InteractionJournal::new(scratch_path());
        assert!(journal.read_all().await.expect("read").is_empty());
    }

    #[tokio::test]
    async fn unparseable_file_is_treated_as_empty() {
        let path = scratch_path();
        std::fs::write(&path, "not json at all").expect("seed file");
        let journal = InteractionJournal::new(path.clone());

        assert!(journal.read_all().await.expect("read").is_empty());

        journal.append("doc1", "q", "a").await.expect("append");
        let records = journal.read_all().await.expect("read");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].question, "q");

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn file_is_pretty_printed_with_literal_unicode() {
        let path = scratch_path();
        let journal = InteractionJournal::new(path.clone());

        journal
            .append("doc1", "qu'est-ce que c'est ?", "c'est un résumé")
            .await
            .expect("append");

        let raw = std::fs::read_to_string(&path).expect("raw journal");
        assert!(raw.starts_with("[\n"));
        assert!(raw.contains("résumé"));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn concurrent_appends_lose_no_records() {
        let path = scratch_path();
        let journal = Arc::new(InteractionJournal::new(path.clone()));

        let mut handles = Vec::new();
        for i in 0..8 {
            let journal = Arc::clone(&journal);
            handles.push(tokio::spawn(async move {
                journal
                    .append("doc1", &format!("question {i}"), "answer")
                    .await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("append");
        }

        assert_eq!(journal.read_all().await.expect("read").len(), 8);

        let _ = std::fs::remove_file(&path);
    }
}
