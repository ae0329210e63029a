//! Append-only JSON Lines logs for downstream consumers.
//!
//! The event log records every settled or deferred item and every Slack
//! trigger; the message log keeps one line per Slack message. Both are
//! plain files a human or the indexer can tail.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::source::triggers::TriggerKind;
use crate::source::ListedMessage;
use crate::types::SourceKind;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    Fetched {
        source: SourceKind,
        item_id: String,
        name: String,
        path: String,
        size: u64,
        checksum: String,
        adopted: bool,
    },
    Skipped {
        source: SourceKind,
        item_id: String,
        name: String,
        reason: String,
    },
    /// Retries ran out; the item is listed again next cycle.
    Deferred {
        source: SourceKind,
        item_id: String,
        name: String,
        error: String,
    },
    Trigger {
        source: SourceKind,
        channel: String,
        ts: String,
        user: Option<String>,
        kind: TriggerKind,
        details: String,
        text: String,
        permalink: Option<String>,
    },
}

#[derive(Serialize)]
struct Stamped<'a, T: Serialize> {
    logged_at: DateTime<Utc>,
    #[serde(flatten)]
    record: &'a T,
}

/// Serialised appends to one JSON Lines file. Clones share the file lock.
#[derive(Debug, Clone)]
pub struct JsonlWriter {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl JsonlWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record as a single line, stamped with the current time.
    pub async fn append<T: Serialize>(&self, record: &T) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(&Stamped {
            logged_at: Utc::now(),
            record,
        })?;
        line.push(b'\n');

        let _guard = self.lock.lock().await;
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir).await?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await
    }
}

/// The shared event log. A failed write is logged, never fatal.
#[derive(Debug, Clone)]
pub struct EventLog {
    writer: JsonlWriter,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            writer: JsonlWriter::new(path),
        }
    }

    pub async fn emit(&self, event: Event) {
        if let Err(e) = self.writer.append(&event).await {
            tracing::warn!(
                path = %self.writer.path().display(),
                error = %e,
                "Failed to append to event log"
            );
        }
    }
}

#[derive(Debug, Serialize)]
struct MessageLine<'a> {
    channel: &'a str,
    ts: &'a str,
    user: Option<&'a str>,
    text: &'a str,
    posted_at: DateTime<Utc>,
    file_count: usize,
}

/// Slack message transcript, one line per message.
#[derive(Debug, Clone)]
pub struct MessageLog {
    writer: JsonlWriter,
}

impl MessageLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            writer: JsonlWriter::new(path),
        }
    }

    pub async fn append(&self, message: &ListedMessage) -> std::io::Result<()> {
        self.writer
            .append(&MessageLine {
                channel: &message.channel,
                ts: &message.ts,
                user: message.user.as_deref(),
                text: &message.text,
                posted_at: message.posted_at,
                file_count: message.file_count,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::tests::ts;

    fn lines(path: &Path) -> Vec<serde_json::Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn events_are_tagged_and_stamped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("events.jsonl");
        let log = EventLog::new(&path);

        log.emit(Event::Skipped {
            source: SourceKind::Drive,
            item_id: "E".into(),
            name: "huge.pdf".into(),
            reason: "size 30 exceeds limit 10".into(),
        })
        .await;
        log.emit(Event::Deferred {
            source: SourceKind::Slack,
            item_id: "F1".into(),
            name: "a.pdf".into(),
            error: "HTTP 503".into(),
        })
        .await;

        let out = lines(&path);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["event"], "skipped");
        assert_eq!(out[0]["source"], "drive");
        assert_eq!(out[0]["item_id"], "E");
        assert!(out[0]["logged_at"].is_string());
        assert_eq!(out[1]["event"], "deferred");
    }

    #[tokio::test]
    async fn trigger_event_carries_kind_and_permalink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let log = EventLog::new(&path);
        log.emit(Event::Trigger {
            source: SourceKind::Slack,
            channel: "C1".into(),
            ts: "1.000100".into(),
            user: Some("U1".into()),
            kind: TriggerKind::PatternMatch,
            details: "Contains todo/note/reminder pattern".into(),
            text: "todo: ship".into(),
            permalink: Some("https://app.slack.com/client/T1/C1/thread/C1-1.000100".into()),
        })
        .await;

        let out = lines(&path);
        assert_eq!(out[0]["event"], "trigger");
        assert_eq!(out[0]["kind"], "pattern_match");
        assert_eq!(
            out[0]["permalink"],
            "https://app.slack.com/client/T1/C1/thread/C1-1.000100"
        );
    }

    #[tokio::test]
    async fn message_log_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slack").join("messages.jsonl");
        let log = MessageLog::new(&path);
        let msg = ListedMessage {
            channel: "C1".into(),
            ts: "1.000100".into(),
            user: Some("U1".into()),
            text: "hello".into(),
            posted_at: ts(1),
            file_count: 0,
            trigger: None,
            permalink: None,
        };
        log.append(&msg).await.unwrap();
        log.append(&msg).await.unwrap();

        let out = lines(&path);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["channel"], "C1");
        assert_eq!(out[0]["text"], "hello");
        assert_eq!(out[0]["file_count"], 0);
    }
}
