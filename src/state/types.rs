//! Types for the state tracking module.

use std::path::PathBuf;

use chrono::{DateTime, TimeZone, Utc};

use crate::source::ItemKind;
use crate::types::SourceKind;

/// Cursor bounding which items a listing returns.
///
/// `cursor == None` lists everything. Stored with microsecond precision,
/// which covers both Drive (milliseconds) and Slack (`ts` microseconds).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermark {
    pub source: SourceKind,
    pub cursor: Option<DateTime<Utc>>,
}

impl Watermark {
    pub fn zero(source: SourceKind) -> Self {
        Self {
            source,
            cursor: None,
        }
    }

    pub fn at(source: SourceKind, cursor: DateTime<Utc>) -> Self {
        Self {
            source,
            cursor: Some(cursor),
        }
    }

    /// The later of this watermark and `t`.
    pub fn max_with(self, t: DateTime<Utc>) -> Self {
        let cursor = match self.cursor {
            Some(c) => c.max(t),
            None => t,
        };
        Self::at(self.source, cursor)
    }

    /// True if `self` lies strictly before `other`. Zero is before everything.
    pub fn is_before(&self, other: &Watermark) -> bool {
        match (self.cursor, other.cursor) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(a), Some(b)) => a < b,
        }
    }

    pub(crate) fn to_micros(self) -> Option<i64> {
        self.cursor.map(|c| c.timestamp_micros())
    }

    pub(crate) fn from_micros(source: SourceKind, micros: Option<i64>) -> Self {
        Self {
            source,
            cursor: micros.and_then(|m| Utc.timestamp_micros(m).single()),
        }
    }
}

impl std::fmt::Display for Watermark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.cursor {
            Some(c) => write!(f, "{}", c.to_rfc3339()),
            None => f.write_str("none"),
        }
    }
}

/// Settled state of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    /// Durably written to the knowledge base.
    Fetched,
    /// Deliberately excluded; never retried until `reset-skipped`.
    Skipped,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fetched => "fetched",
            Self::Skipped => "skipped",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "fetched" => Some(Self::Fetched),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// Durable proof that one item was materialised locally.
#[derive(Debug, Clone)]
pub struct FetchRecord {
    pub item_id: String,
    pub name: String,
    pub kind: ItemKind,
    pub local_path: PathBuf,
    pub size_bytes: u64,
    /// Hex SHA-256 of the bytes on disk.
    pub checksum: String,
    pub fetched_at: DateTime<Utc>,
}

/// Durable proof that an item was deliberately excluded.
#[derive(Debug, Clone)]
pub struct SkipRecord {
    pub item_id: String,
    pub name: String,
    pub kind: ItemKind,
    pub reason: String,
    pub skipped_at: DateTime<Utc>,
}

/// A row of the `items` table, as read back for `status` and `verify`.
#[derive(Debug, Clone)]
pub struct ItemRecord {
    pub source: SourceKind,
    pub item_id: String,
    pub name: String,
    pub kind: ItemKind,
    pub local_path: Option<PathBuf>,
    pub size_bytes: Option<u64>,
    pub checksum: Option<String>,
    pub reason: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Counters for one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub listed: usize,
    pub fetched: usize,
    pub skipped: usize,
    pub deferred: usize,
    pub messages_logged: usize,
    pub interrupted: bool,
}

/// Per-source summary shown by `status`.
#[derive(Debug, Clone)]
pub struct SourceSummary {
    pub source: SourceKind,
    pub fetched: u64,
    pub skipped: u64,
    pub total_bytes: u64,
    pub watermark: Watermark,
    pub logged_messages: u64,
    pub last_cycle_started: Option<DateTime<Utc>>,
    pub last_cycle_completed: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::tests::ts;

    #[test]
    fn max_with_never_goes_backwards() {
        let w = Watermark::at(SourceKind::Drive, ts(100));
        assert_eq!(w.max_with(ts(50)).cursor, Some(ts(100)));
        assert_eq!(w.max_with(ts(150)).cursor, Some(ts(150)));
        assert_eq!(
            Watermark::zero(SourceKind::Drive).max_with(ts(1)).cursor,
            Some(ts(1))
        );
    }

    #[test]
    fn ordering_treats_zero_as_earliest() {
        let zero = Watermark::zero(SourceKind::Slack);
        let later = Watermark::at(SourceKind::Slack, ts(10));
        assert!(zero.is_before(&later));
        assert!(!later.is_before(&zero));
        assert!(!zero.is_before(&zero));
        assert!(!later.is_before(&later));
    }

    #[test]
    fn micros_round_trip() {
        let t = Utc.timestamp_micros(1_712_345_678_000_200).single().unwrap();
        let w = Watermark::at(SourceKind::Slack, t);
        let back = Watermark::from_micros(SourceKind::Slack, w.to_micros());
        assert_eq!(back, w);
        assert_eq!(
            Watermark::from_micros(SourceKind::Slack, None),
            Watermark::zero(SourceKind::Slack)
        );
    }

    #[test]
    fn status_strings() {
        for s in [RecordStatus::Fetched, RecordStatus::Skipped] {
            assert_eq!(RecordStatus::from_str(s.as_str()), Some(s));
        }
        assert_eq!(RecordStatus::from_str("pending"), None);
    }
}
