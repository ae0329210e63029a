//! In-memory poll state for one source, backed by the state database.
//!
//! The tracker is owned by exactly one poll loop. It holds the watermark,
//! the set of settled item ids and the ids currently being fetched, and
//! persists every transition before applying it in memory.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::db::StateDb;
use super::error::StateError;
use super::types::{FetchRecord, SkipRecord, Watermark};
use crate::source::RemoteItem;
use crate::types::SourceKind;

pub struct StateTracker {
    source: SourceKind,
    db: Arc<dyn StateDb>,
    watermark: Watermark,
    known_ids: HashSet<String>,
    logged_messages: HashSet<String>,
    in_flight: HashSet<String>,
}

impl std::fmt::Debug for StateTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateTracker")
            .field("source", &self.source)
            .field("watermark", &self.watermark)
            .field("known_ids", &self.known_ids.len())
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl StateTracker {
    /// Reload watermark, settled ids and logged messages from the database.
    pub async fn load(source: SourceKind, db: Arc<dyn StateDb>) -> Result<Self, StateError> {
        let watermark = db.get_watermark(source).await?;
        let known_ids = db.load_known_ids(source).await?;
        let logged_messages = db.load_logged_messages(source).await?;
        tracing::debug!(
            source = %source,
            watermark = %watermark,
            known = known_ids.len(),
            "Loaded poll state"
        );
        Ok(Self {
            source,
            db,
            watermark,
            known_ids,
            logged_messages,
            in_flight: HashSet::new(),
        })
    }

    pub fn source(&self) -> SourceKind {
        self.source
    }

    pub fn watermark(&self) -> Watermark {
        self.watermark
    }

    pub fn db(&self) -> &Arc<dyn StateDb> {
        &self.db
    }

    pub fn known_count(&self) -> usize {
        self.known_ids.len()
    }

    pub fn is_new(&self, item: &RemoteItem) -> bool {
        !self.known_ids.contains(&item.id) && !self.in_flight.contains(&item.id)
    }

    /// Claim an item for fetching. Returns false if it is settled or
    /// already claimed, in which case the caller must not fetch it.
    pub fn begin(&mut self, item: &RemoteItem) -> bool {
        if !self.is_new(item) {
            return false;
        }
        self.in_flight.insert(item.id.clone())
    }

    /// Give up a claim without recording anything (deferred or aborted fetch).
    pub fn release(&mut self, item_id: &str) {
        self.in_flight.remove(item_id);
    }

    #[cfg(test)]
    pub fn outstanding(&self) -> usize {
        self.in_flight.len()
    }

    /// Record a durable fetch. The file must already sit at `local_path`.
    pub async fn record(
        &mut self,
        item: &RemoteItem,
        local_path: PathBuf,
        size_bytes: u64,
        checksum: String,
    ) -> Result<(), StateError> {
        let present = tokio::fs::metadata(&local_path)
            .await
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false);
        if !present {
            self.in_flight.remove(&item.id);
            return Err(StateError::MissingFile(local_path));
        }

        let record = FetchRecord {
            item_id: item.id.clone(),
            name: item.name.clone(),
            kind: item.kind,
            local_path,
            size_bytes,
            checksum,
            fetched_at: Utc::now(),
        };
        self.db.record_fetched(self.source, &record).await?;
        self.in_flight.remove(&item.id);
        self.known_ids.insert(item.id.clone());
        Ok(())
    }

    /// Persist a skip decision so the item is never attempted again.
    pub async fn record_skip(&mut self, item: &RemoteItem, reason: &str) -> Result<(), StateError> {
        let record = SkipRecord {
            item_id: item.id.clone(),
            name: item.name.clone(),
            kind: item.kind,
            reason: reason.to_string(),
            skipped_at: Utc::now(),
        };
        self.db.record_skipped(self.source, &record).await?;
        self.in_flight.remove(&item.id);
        self.known_ids.insert(item.id.clone());
        Ok(())
    }

    /// Move the watermark forward at the end of a cycle.
    ///
    /// `earliest_deferred` is the oldest `modified_at` among items whose
    /// fetch was put off; the watermark stops there so the next listing
    /// returns them again. Returns true if the stored watermark changed.
    pub async fn advance_watermark(
        &mut self,
        next: Watermark,
        earliest_deferred: Option<DateTime<Utc>>,
    ) -> Result<bool, StateError> {
        if !self.in_flight.is_empty() {
            return Err(StateError::OutstandingFetches {
                kind: self.source,
                count: self.in_flight.len(),
            });
        }
        if next.is_before(&self.watermark) {
            return Err(StateError::WatermarkRegression {
                kind: self.source,
                current: self.watermark.to_string(),
                requested: next.to_string(),
            });
        }

        let mut target = next;
        if let Some(limit) = earliest_deferred {
            let clamped = Watermark::at(self.source, limit);
            if clamped.is_before(&target) {
                target = clamped;
            }
            // Never behind where we already are.
            if target.is_before(&self.watermark) {
                target = self.watermark;
            }
        }

        if target == self.watermark {
            return Ok(false);
        }
        self.db.set_watermark(&target).await?;
        tracing::debug!(
            source = %self.source,
            from = %self.watermark,
            to = %target,
            "Advanced watermark"
        );
        self.watermark = target;
        Ok(true)
    }

    pub fn is_message_logged(&self, key: &str) -> bool {
        self.logged_messages.contains(key)
    }

    pub async fn mark_message_logged(&mut self, key: String) -> Result<(), StateError> {
        self.db.mark_message_logged(self.source, &key).await?;
        self.logged_messages.insert(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::tests::{item, ts};
    use crate::state::SqliteStateDb;

    async fn tracker() -> StateTracker {
        let db: Arc<dyn StateDb> = Arc::new(SqliteStateDb::open_in_memory().unwrap());
        StateTracker::load(SourceKind::Drive, db).await.unwrap()
    }

    #[tokio::test]
    async fn begin_claims_once() {
        let mut t = tracker().await;
        let a = item("A", 10);
        assert!(t.is_new(&a));
        assert!(t.begin(&a));
        assert!(!t.is_new(&a));
        assert!(!t.begin(&a));
        t.release("A");
        assert!(t.is_new(&a));
    }

    #[tokio::test]
    async fn record_requires_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = tracker().await;
        let a = item("A", 10);
        assert!(t.begin(&a));

        let missing = dir.path().join("a.pdf");
        let err = t
            .record(&a, missing.clone(), 4, "x".into())
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::MissingFile(_)));
        assert!(t.is_new(&a));

        std::fs::write(&missing, b"data").unwrap();
        assert!(t.begin(&a));
        t.record(&a, missing, 4, "x".into()).await.unwrap();
        assert!(!t.is_new(&a));
        assert_eq!(t.outstanding(), 0);
    }

    #[tokio::test]
    async fn skips_survive_reload() {
        let db: Arc<dyn StateDb> = Arc::new(SqliteStateDb::open_in_memory().unwrap());
        let mut t = StateTracker::load(SourceKind::Drive, db.clone())
            .await
            .unwrap();
        let e = item("E", 10);
        assert!(t.begin(&e));
        t.record_skip(&e, "size exceeded").await.unwrap();

        let reloaded = StateTracker::load(SourceKind::Drive, db).await.unwrap();
        assert!(!reloaded.is_new(&e));
    }

    #[tokio::test]
    async fn watermark_refuses_while_fetch_outstanding() {
        let mut t = tracker().await;
        assert!(t.begin(&item("A", 10)));
        let err = t
            .advance_watermark(Watermark::at(SourceKind::Drive, ts(10)), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::OutstandingFetches { count: 1, .. }));
    }

    #[tokio::test]
    async fn watermark_is_monotonic() {
        let mut t = tracker().await;
        assert!(t
            .advance_watermark(Watermark::at(SourceKind::Drive, ts(20)), None)
            .await
            .unwrap());
        assert!(!t
            .advance_watermark(Watermark::at(SourceKind::Drive, ts(20)), None)
            .await
            .unwrap());
        let err = t
            .advance_watermark(Watermark::at(SourceKind::Drive, ts(5)), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::WatermarkRegression { .. }));
        assert_eq!(t.watermark().cursor, Some(ts(20)));
    }

    #[tokio::test]
    async fn deferred_items_hold_watermark_back() {
        let mut t = tracker().await;
        t.advance_watermark(Watermark::at(SourceKind::Drive, ts(10)), None)
            .await
            .unwrap();
        t.advance_watermark(Watermark::at(SourceKind::Drive, ts(50)), Some(ts(30)))
            .await
            .unwrap();
        assert_eq!(t.watermark().cursor, Some(ts(30)));

        // A deferred item older than the current watermark cannot rewind it.
        assert!(!t
            .advance_watermark(Watermark::at(SourceKind::Drive, ts(60)), Some(ts(5)))
            .await
            .unwrap());
        assert_eq!(t.watermark().cursor, Some(ts(30)));
    }

    #[tokio::test]
    async fn logged_messages_persist() {
        let db: Arc<dyn StateDb> = Arc::new(SqliteStateDb::open_in_memory().unwrap());
        let mut t = StateTracker::load(SourceKind::Slack, db.clone())
            .await
            .unwrap();
        assert!(!t.is_message_logged("C1:1.0"));
        t.mark_message_logged("C1:1.0".into()).await.unwrap();
        assert!(t.is_message_logged("C1:1.0"));

        let reloaded = StateTracker::load(SourceKind::Slack, db).await.unwrap();
        assert!(reloaded.is_message_logged("C1:1.0"));
    }
}
