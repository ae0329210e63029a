//! Remote sources: the listing and streaming side of a poll cycle.
//!
//! A [`Source`] answers two questions: which items changed at or after a
//! watermark, and what are the bytes of one item. It never touches local
//! state; deduplication and persistence belong to the state tracker.

pub mod drive;
pub mod error;
pub mod google_auth;
pub mod slack;
pub mod triggers;

pub use error::SourceError;

use std::collections::HashSet;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::Serialize;

use crate::state::Watermark;
use crate::types::SourceKind;
use triggers::Trigger;

/// How far behind the start of a listing the next watermark is held.
///
/// A listing spans several requests (pages, channels). Something created
/// while it runs can carry a timestamp older than items already returned,
/// so the cursor never passes `listing start - margin`.
pub const LISTING_SETTLE_SECS: i64 = 60;

/// What a remote item is, which decides how the fetcher materialises it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// Google Docs document, exported as docx.
    NativeDoc,
    /// Google Sheets spreadsheet, exported as xlsx.
    Sheet,
    /// Google Slides presentation, exported as pptx.
    Slide,
    /// Plain file or attachment, downloaded byte-for-byte.
    BinaryFile,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NativeDoc => "native_doc",
            Self::Sheet => "sheet",
            Self::Slide => "slide",
            Self::BinaryFile => "binary_file",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "native_doc" => Some(Self::NativeDoc),
            "sheet" => Some(Self::Sheet),
            "slide" => Some(Self::Slide),
            "binary_file" => Some(Self::BinaryFile),
            _ => None,
        }
    }

    /// Target MIME type for kinds that must be exported rather than downloaded.
    pub fn export_mime(&self) -> Option<&'static str> {
        match self {
            Self::NativeDoc => {
                Some("application/vnd.openxmlformats-officedocument.wordprocessingml.document")
            }
            Self::Sheet => Some("application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"),
            Self::Slide => {
                Some("application/vnd.openxmlformats-officedocument.presentationml.presentation")
            }
            Self::BinaryFile => None,
        }
    }

    /// Extension (with dot) appended to exported files.
    pub fn export_extension(&self) -> Option<&'static str> {
        match self {
            Self::NativeDoc => Some(".docx"),
            Self::Sheet => Some(".xlsx"),
            Self::Slide => Some(".pptx"),
            Self::BinaryFile => None,
        }
    }
}

/// One fetchable unit as seen in a single listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteItem {
    pub id: String,
    pub name: String,
    pub kind: ItemKind,
    pub mime_type: String,
    /// Byte size when the source reports it (never for exports).
    pub size: Option<u64>,
    pub modified_at: DateTime<Utc>,
    pub source: SourceKind,
    /// Direct download URL, for sources that hand one out with the listing.
    pub download_url: Option<String>,
}

/// A chat message returned alongside a listing (Slack only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListedMessage {
    pub channel: String,
    pub ts: String,
    pub user: Option<String>,
    pub text: String,
    pub posted_at: DateTime<Utc>,
    pub file_count: usize,
    #[serde(skip)]
    pub trigger: Option<Trigger>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permalink: Option<String>,
}

impl ListedMessage {
    /// Stable identity used to log each message once.
    pub fn key(&self) -> String {
        format!("{}:{}", self.channel, self.ts)
    }
}

/// Result of [`Source::list_since`].
#[derive(Debug, Clone)]
pub struct Listing {
    /// Items ordered by `modified_at` ascending, oldest first.
    pub items: Vec<RemoteItem>,
    pub messages: Vec<ListedMessage>,
    /// Watermark to use for the next listing once this one is settled.
    pub next_watermark: Watermark,
}

impl Listing {
    /// Order the items and derive the next watermark: the newest timestamp
    /// seen, or `current` when nothing newer was returned.
    ///
    /// An id listed more than once (a Slack file shared in two messages)
    /// keeps only its oldest occurrence.
    pub fn new(
        current: Watermark,
        mut items: Vec<RemoteItem>,
        mut messages: Vec<ListedMessage>,
    ) -> Self {
        items.sort_by(|a, b| a.modified_at.cmp(&b.modified_at).then_with(|| a.id.cmp(&b.id)));
        let mut seen = HashSet::new();
        items.retain(|item| seen.insert(item.id.clone()));
        messages.sort_by(|a, b| a.posted_at.cmp(&b.posted_at));

        let newest = items
            .iter()
            .map(|i| i.modified_at)
            .chain(messages.iter().map(|m| m.posted_at))
            .max();
        let next_watermark = match newest {
            Some(t) => current.max_with(t),
            None => current,
        };

        Self {
            items,
            messages,
            next_watermark,
        }
    }

    /// Hold the next watermark at or before `started` minus
    /// [`LISTING_SETTLE_SECS`], never below `current`. Anything re-listed
    /// because of the hold is filtered by the tracker's known ids.
    pub fn settled_before(mut self, current: Watermark, started: DateTime<Utc>) -> Self {
        let limit = current.max_with(started - chrono::Duration::seconds(LISTING_SETTLE_SECS));
        if limit.is_before(&self.next_watermark) {
            self.next_watermark = limit;
        }
        self
    }
}

/// Stream of body chunks for one item.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, SourceError>> + Send>>;

/// An opened item body.
pub struct Download {
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

impl std::fmt::Debug for Download {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Download")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// A remote system the poll loop mirrors from.
#[async_trait]
pub trait Source: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Validate credentials before the first cycle. An error here is fatal.
    async fn check_auth(&self) -> Result<(), SourceError>;

    /// List items modified at or after `watermark`. Must not mutate local state.
    async fn list_since(&self, watermark: &Watermark) -> Result<Listing, SourceError>;

    /// Open the item body: an export for native documents, raw bytes otherwise.
    async fn open(&self, item: &RemoteItem) -> Result<Download, SourceError>;
}

/// Map a non-success HTTP response onto the error taxonomy.
pub(crate) async fn check_response(
    resp: reqwest::Response,
    context: &str,
) -> Result<reqwest::Response, SourceError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let code = status.as_u16();
    let retry_after = parse_retry_after(resp.headers());

    match code {
        429 => Err(SourceError::RateLimited {
            context: context.to_string(),
            retry_after,
        }),
        401 => {
            let body = resp.text().await.unwrap_or_default();
            Err(SourceError::Auth(format!(
                "{} returned 401: {}",
                context,
                truncate(&body, 200)
            )))
        }
        // Drive reports quota exhaustion as 403 with a rateLimitExceeded reason.
        403 => {
            let body = resp.text().await.unwrap_or_default();
            if body.contains("rateLimitExceeded") {
                Err(SourceError::RateLimited {
                    context: context.to_string(),
                    retry_after,
                })
            } else {
                tracing::debug!(context, body = %truncate(&body, 200), "403 response");
                Err(SourceError::HttpStatus {
                    status: code,
                    context: context.to_string(),
                })
            }
        }
        _ => Err(SourceError::HttpStatus {
            status: code,
            context: context.to_string(),
        }),
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Wrap a successful response body as a [`Download`].
pub(crate) fn into_download(resp: reqwest::Response) -> Download {
    let content_length = resp.content_length();
    let body = resp
        .bytes_stream()
        .map(|chunk| chunk.map(|b| b.to_vec()).map_err(SourceError::from));
    Download {
        content_length,
        body: Box::pin(body),
    }
}

pub(crate) fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
