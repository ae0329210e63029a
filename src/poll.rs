//! The per-source poll loop: list, diff, fetch, record, advance, sleep.
//!
//! One [`PollLoop`] owns one source's [`StateTracker`]. Fetches run with
//! bounded concurrency, but their results are applied to the tracker by the
//! loop alone, in completion order, so no lock is held across a network
//! call. The watermark moves once per cycle and only after every fetch of
//! the cycle has settled.

use std::collections::HashSet;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::{future, stream, StreamExt};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::events::{Event, EventLog, MessageLog};
use crate::fetch::{FetchError, FetchedFile, Fetcher};
use crate::source::{ListedMessage, RemoteItem, Source, SourceError};
use crate::state::{CycleStats, StateError, StateTracker, Watermark};
use crate::types::{ErrorClass, SourceKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    Idle,
    Listing,
    Fetching,
}

/// Errors that end a poll loop. Everything else is handled inside a cycle.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("listing failed: {0}")]
    List(#[source] SourceError),

    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    State(#[from] StateError),
}

impl PollError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PollError::List(e) => e.class(),
            PollError::Fetch(e) => e.class(),
            PollError::State(e) => e.class(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: Duration,
    /// Fetches in flight at once, 1 to 4.
    pub concurrency: usize,
    pub dry_run: bool,
    /// List from the beginning this often instead of from the watermark,
    /// catching items whose timestamp predates it (newly shared Drive
    /// files). `None` always lists from the watermark.
    pub full_rescan: Option<Duration>,
    /// Shared progress display; `None` hides the bars.
    pub progress: Option<MultiProgress>,
}

/// What one cycle did.
#[derive(Debug, Default)]
pub struct CycleOutcome {
    pub stats: CycleStats,
    pub watermark_advanced: bool,
    /// Set when listing failed transiently; the cycle fetched nothing.
    pub list_error: Option<String>,
    /// Minimum wait before the next listing, from a rate-limit hint.
    pub backoff: Option<Duration>,
}

/// Result of the fetch phase of one cycle.
#[derive(Debug, Default)]
struct Settled {
    fatal: Option<FetchError>,
    /// Oldest `modified_at` among deferred items.
    earliest_deferred: Option<DateTime<Utc>>,
}

pub struct PollLoop {
    source: Arc<dyn Source>,
    tracker: StateTracker,
    fetcher: Fetcher,
    events: EventLog,
    messages: Option<MessageLog>,
    config: PollConfig,
    phase: PollPhase,
    last_full_listing: Option<Instant>,
    /// Local paths already recorded for some item of this source.
    owned_paths: HashSet<PathBuf>,
}

impl PollLoop {
    pub async fn new(
        source: Arc<dyn Source>,
        tracker: StateTracker,
        fetcher: Fetcher,
        events: EventLog,
        messages: Option<MessageLog>,
        config: PollConfig,
    ) -> Result<Self, PollError> {
        debug_assert_eq!(source.kind(), tracker.source());
        let owned_paths = tracker
            .db()
            .get_fetched(Some(tracker.source()))
            .await?
            .into_iter()
            .filter_map(|r| r.local_path)
            .collect();
        Ok(Self {
            source,
            tracker,
            fetcher,
            events,
            messages,
            config,
            phase: PollPhase::Idle,
            last_full_listing: None,
            owned_paths,
        })
    }

    pub fn kind(&self) -> SourceKind {
        self.source.kind()
    }

    #[cfg(test)]
    pub fn phase(&self) -> PollPhase {
        self.phase
    }

    #[cfg(test)]
    pub fn tracker(&self) -> &StateTracker {
        &self.tracker
    }

    fn set_phase(&mut self, next: PollPhase) {
        if self.phase != next {
            tracing::trace!(source = %self.kind(), from = ?self.phase, to = ?next, "Phase");
            self.phase = next;
        }
    }

    fn full_listing_due(&self) -> bool {
        match (self.config.full_rescan, self.last_full_listing) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(every), Some(last)) => last.elapsed() >= every,
        }
    }

    /// Run cycles until `shutdown` fires, or once. Returns only on a
    /// graceful stop or a fatal error.
    pub async fn run(mut self, shutdown: CancellationToken, once: bool) -> Result<(), PollError> {
        let kind = self.kind();
        tracing::info!(
            source = %kind,
            interval_secs = self.config.interval.as_secs(),
            concurrency = self.config.concurrency,
            watermark = %self.tracker.watermark(),
            "Poll loop started"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            let outcome = self.run_cycle(&shutdown).await?;
            if once {
                tracing::info!(
                    source = %kind,
                    fetched = outcome.stats.fetched,
                    skipped = outcome.stats.skipped,
                    deferred = outcome.stats.deferred,
                    watermark_advanced = outcome.watermark_advanced,
                    list_error = outcome.list_error.as_deref().unwrap_or("none"),
                    "Single cycle finished"
                );
                break;
            }
            if outcome.stats.interrupted {
                break;
            }

            let wait = outcome
                .backoff
                .map_or(self.config.interval, |b| b.max(self.config.interval));
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        tracing::info!(source = %kind, "Poll loop stopped");
        Ok(())
    }

    /// One full cycle. Fatal errors are returned; transient listing errors
    /// and per-item failures are reported in the outcome.
    pub async fn run_cycle(&mut self, shutdown: &CancellationToken) -> Result<CycleOutcome, PollError> {
        let kind = self.kind();
        let started = Instant::now();
        let cycle_id = self.tracker.db().start_cycle(kind).await?;
        let mut outcome = CycleOutcome::default();

        self.set_phase(PollPhase::Listing);
        let watermark = self.tracker.watermark();
        let full = self.full_listing_due() && watermark.cursor.is_some();
        let list_from = if full {
            tracing::debug!(source = %kind, "Full listing");
            Watermark::zero(kind)
        } else {
            watermark
        };
        let listing = match self.source.list_since(&list_from).await {
            Ok(listing) => listing,
            Err(e) => {
                self.set_phase(PollPhase::Idle);
                self.tracker
                    .db()
                    .complete_cycle(cycle_id, &outcome.stats)
                    .await?;
                if e.class() == ErrorClass::Fatal {
                    tracing::error!(source = %kind, error = %e, "Listing failed, stopping");
                    return Err(PollError::List(e));
                }
                tracing::warn!(
                    source = %kind,
                    watermark = %watermark,
                    error = %e,
                    "Listing failed, will retry next cycle"
                );
                outcome.backoff = e.backoff_hint();
                outcome.list_error = Some(e.to_string());
                return Ok(outcome);
            }
        };
        if self.config.full_rescan.is_some() && (full || watermark.cursor.is_none()) {
            self.last_full_listing = Some(Instant::now());
        }
        // A full listing may end below the current watermark.
        let next_watermark = if listing.next_watermark.is_before(&watermark) {
            watermark
        } else {
            listing.next_watermark
        };
        outcome.stats.listed = listing.items.len();
        tracing::debug!(
            source = %kind,
            items = listing.items.len(),
            messages = listing.messages.len(),
            "Listed"
        );

        outcome.stats.messages_logged = self.log_messages(&listing.messages).await?;

        // Diff against the tracker and settle policy skips up front.
        let mut queue: Vec<(RemoteItem, PathBuf)> = Vec::new();
        let mut reserved: HashSet<PathBuf> = HashSet::new();
        for item in listing.items {
            if !self.tracker.is_new(&item) {
                continue;
            }
            if let Err(e) = self.fetcher.precheck(&item) {
                if self.config.dry_run {
                    tracing::info!("[DRY RUN] Would skip {} ({})", item.name, e.skip_reason());
                    continue;
                }
                self.tracker.begin(&item);
                self.settle_skip(&item, &e).await?;
                outcome.stats.skipped += 1;
                continue;
            }
            let dest = self.fetcher.destination(&item, |p| {
                self.owned_paths.contains(p) || reserved.contains(p)
            });
            if self.config.dry_run {
                tracing::info!("[DRY RUN] Would fetch {} to {}", item.name, dest.display());
                continue;
            }
            reserved.insert(dest.clone());
            self.tracker.begin(&item);
            queue.push((item, dest));
        }

        if self.config.dry_run {
            self.set_phase(PollPhase::Idle);
            self.tracker
                .db()
                .complete_cycle(cycle_id, &outcome.stats)
                .await?;
            return Ok(outcome);
        }

        self.set_phase(PollPhase::Fetching);
        let settled = self.fetch_all(queue, shutdown, &mut outcome.stats).await?;
        self.set_phase(PollPhase::Idle);

        if let Some(e) = settled.fatal {
            outcome.stats.interrupted = true;
            self.tracker
                .db()
                .complete_cycle(cycle_id, &outcome.stats)
                .await?;
            tracing::error!(source = %kind, error = %e, "Fetch failed fatally, stopping");
            return Err(PollError::Fetch(e));
        }

        if outcome.stats.interrupted {
            tracing::info!(source = %kind, "Cycle interrupted, watermark left at {}", watermark);
        } else {
            outcome.watermark_advanced = self
                .tracker
                .advance_watermark(next_watermark, settled.earliest_deferred)
                .await?;
        }

        self.tracker
            .db()
            .complete_cycle(cycle_id, &outcome.stats)
            .await?;

        let s = &outcome.stats;
        if s.fetched + s.skipped + s.deferred > 0 || s.messages_logged > 0 {
            tracing::info!(
                source = %kind,
                listed = s.listed,
                fetched = s.fetched,
                skipped = s.skipped,
                deferred = s.deferred,
                messages = s.messages_logged,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Cycle complete"
            );
        } else {
            tracing::debug!(source = %kind, listed = s.listed, "Nothing new");
        }
        Ok(outcome)
    }

    /// Fetch the queued items with bounded concurrency and settle each
    /// result. A fatal result is returned after in-flight fetches drain.
    async fn fetch_all(
        &mut self,
        queue: Vec<(RemoteItem, PathBuf)>,
        shutdown: &CancellationToken,
        stats: &mut CycleStats,
    ) -> Result<Settled, PollError> {
        let mut settled = Settled::default();
        if queue.is_empty() {
            return Ok(settled);
        }
        let kind = self.kind();
        let mut not_started: HashSet<String> = queue.iter().map(|(i, _)| i.id.clone()).collect();
        let pb = create_progress_bar(self.config.progress.as_ref(), queue.len() as u64, kind);

        // Cancelled by the stop signal or by a fatal result; either way no
        // new fetch starts, and the ones in flight run to completion.
        let stop = shutdown.child_token();
        let gate = stop.clone();
        let source = self.source.clone();
        let fetcher = &self.fetcher;
        let results = stream::iter(queue)
            .take_while(move |_| future::ready(!gate.is_cancelled()))
            .map(|(item, dest)| {
                let source = source.clone();
                async move {
                    let result = fetcher.fetch(source.as_ref(), &item, &dest).await;
                    (item, result)
                }
            })
            .buffer_unordered(self.config.concurrency.max(1));
        tokio::pin!(results);

        while let Some((item, result)) = results.next().await {
            not_started.remove(&item.id);
            pb.set_message(item.name.clone());
            match result {
                Ok(fetched) => {
                    settle_fetched(&mut self.tracker, &self.events, &item, &fetched).await?;
                    pb.suspend(|| {
                        tracing::info!(
                            source = %kind,
                            item_id = %item.id,
                            path = %fetched.path.display(),
                            "Fetched {}",
                            item.name
                        )
                    });
                    self.owned_paths.insert(fetched.path);
                    stats.fetched += 1;
                }
                Err(e) => match e.class() {
                    ErrorClass::Skip => {
                        let reason = e.skip_reason();
                        self.tracker.record_skip(&item, &reason).await?;
                        pb.suspend(|| {
                            tracing::warn!(source = %kind, item_id = %item.id, reason = %reason, "Skipped {}", item.name)
                        });
                        self.events
                            .emit(Event::Skipped {
                                source: kind,
                                item_id: item.id.clone(),
                                name: item.name.clone(),
                                reason,
                            })
                            .await;
                        stats.skipped += 1;
                    }
                    ErrorClass::Transient => {
                        self.tracker.release(&item.id);
                        pb.suspend(|| {
                            tracing::warn!(source = %kind, item_id = %item.id, error = %e, "Deferred {}", item.name)
                        });
                        self.events
                            .emit(Event::Deferred {
                                source: kind,
                                item_id: item.id.clone(),
                                name: item.name.clone(),
                                error: e.to_string(),
                            })
                            .await;
                        stats.deferred += 1;
                        settled.earliest_deferred =
                            Some(earliest(settled.earliest_deferred, item.modified_at));
                    }
                    ErrorClass::Fatal => {
                        self.tracker.release(&item.id);
                        stop.cancel();
                        if settled.fatal.is_none() {
                            settled.fatal = Some(e);
                        }
                    }
                },
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        for id in &not_started {
            self.tracker.release(id);
        }
        if !not_started.is_empty() && settled.fatal.is_none() {
            tracing::info!(
                source = %kind,
                remaining = not_started.len(),
                "Stop requested, not starting remaining fetches"
            );
            stats.interrupted = true;
        }
        Ok(settled)
    }

    async fn settle_skip(&mut self, item: &RemoteItem, e: &FetchError) -> Result<(), PollError> {
        let reason = e.skip_reason();
        self.tracker.record_skip(item, &reason).await?;
        tracing::warn!(
            source = %item.source,
            item_id = %item.id,
            reason = %reason,
            "Skipped {}",
            item.name
        );
        self.events
            .emit(Event::Skipped {
                source: item.source,
                item_id: item.id.clone(),
                name: item.name.clone(),
                reason,
            })
            .await;
        Ok(())
    }

    /// Append unseen messages to the message log and raise trigger events.
    async fn log_messages(&mut self, messages: &[ListedMessage]) -> Result<usize, PollError> {
        if self.config.dry_run {
            return Ok(0);
        }
        let kind = self.kind();
        let mut logged = 0;
        for message in messages {
            let key = message.key();
            if self.tracker.is_message_logged(&key) {
                continue;
            }
            if let Some(log) = &self.messages {
                if let Err(e) = log.append(message).await {
                    tracing::warn!(source = %kind, key = %key, error = %e, "Failed to write message log");
                    continue;
                }
            }
            if let Some(trigger) = &message.trigger {
                tracing::info!(
                    source = %kind,
                    channel = %message.channel,
                    kind = ?trigger.kind,
                    "Trigger: {}",
                    trigger.details
                );
                self.events
                    .emit(Event::Trigger {
                        source: kind,
                        channel: message.channel.clone(),
                        ts: message.ts.clone(),
                        user: message.user.clone(),
                        kind: trigger.kind,
                        details: trigger.details.clone(),
                        text: message.text.clone(),
                        permalink: message.permalink.clone(),
                    })
                    .await;
            }
            self.tracker.mark_message_logged(key).await?;
            logged += 1;
        }
        Ok(logged)
    }
}

async fn settle_fetched(
    tracker: &mut StateTracker,
    events: &EventLog,
    item: &RemoteItem,
    fetched: &FetchedFile,
) -> Result<(), PollError> {
    tracker
        .record(
            item,
            fetched.path.clone(),
            fetched.size,
            fetched.checksum.clone(),
        )
        .await?;
    events
        .emit(Event::Fetched {
            source: item.source,
            item_id: item.id.clone(),
            name: item.name.clone(),
            path: fetched.path.display().to_string(),
            size: fetched.size,
            checksum: fetched.checksum.clone(),
            adopted: fetched.adopted,
        })
        .await;
    Ok(())
}

/// Progress bar for one fetch phase, hidden without a display or a TTY.
fn create_progress_bar(progress: Option<&MultiProgress>, total: u64, kind: SourceKind) -> ProgressBar {
    let Some(multi) = progress else {
        return ProgressBar::hidden();
    };
    if !std::io::stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = multi.add(ProgressBar::new(total));
    if let Ok(style) = ProgressStyle::with_template(
        "{prefix:>5} [{elapsed_precise}] [{bar:30.cyan/blue}] {pos}/{len} {wide_msg}",
    ) {
        pb.set_style(style.progress_chars("=> "));
    }
    pb.set_prefix(kind.as_str());
    pb
}

fn earliest(a: Option<DateTime<Utc>>, b: DateTime<Utc>) -> DateTime<Utc> {
    a.map_or(b, |t| t.min(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::paths;
    use crate::fetch::tests::config;
    use crate::source::tests::{item, ts};
    use crate::source::triggers::{Trigger, TriggerKind};
    use crate::source::{Download, Listing};
    use crate::state::{SqliteStateDb, StateDb};
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::path::Path;
    use std::sync::Mutex;

    /// In-memory remote: items carry their body; listing is inclusive of
    /// the watermark like the real sources.
    #[derive(Default)]
    struct FakeSource {
        items: Mutex<Vec<(RemoteItem, Vec<u8>)>>,
        messages: Mutex<Vec<ListedMessage>>,
        list_errors: Mutex<VecDeque<SourceError>>,
        broken: Mutex<HashSet<String>>,
        opens: Mutex<HashMap<String, u32>>,
    }

    impl FakeSource {
        fn put(&self, id: &str, secs: i64, body: &str) {
            let mut it = item(id, secs);
            it.size = Some(body.len() as u64);
            self.items.lock().unwrap().push((it, body.as_bytes().to_vec()));
        }

        fn put_item(&self, it: RemoteItem, body: &str) {
            self.items.lock().unwrap().push((it, body.as_bytes().to_vec()));
        }

        fn opens(&self, id: &str) -> u32 {
            self.opens.lock().unwrap().get(id).copied().unwrap_or(0)
        }

        fn total_opens(&self) -> u32 {
            self.opens.lock().unwrap().values().sum()
        }
    }

    #[async_trait]
    impl Source for FakeSource {
        fn kind(&self) -> SourceKind {
            SourceKind::Drive
        }

        async fn check_auth(&self) -> Result<(), SourceError> {
            Ok(())
        }

        async fn list_since(&self, w: &Watermark) -> Result<Listing, SourceError> {
            if let Some(e) = self.list_errors.lock().unwrap().pop_front() {
                return Err(e);
            }
            let after = |t: DateTime<Utc>| w.cursor.map_or(true, |c| t >= c);
            let items = self
                .items
                .lock()
                .unwrap()
                .iter()
                .filter(|(i, _)| after(i.modified_at))
                .map(|(i, _)| i.clone())
                .collect();
            let messages = self
                .messages
                .lock()
                .unwrap()
                .iter()
                .filter(|m| after(m.posted_at))
                .cloned()
                .collect();
            Ok(Listing::new(*w, items, messages))
        }

        async fn open(&self, item: &RemoteItem) -> Result<Download, SourceError> {
            *self.opens.lock().unwrap().entry(item.id.clone()).or_default() += 1;
            if self.broken.lock().unwrap().contains(&item.id) {
                return Err(SourceError::HttpStatus {
                    status: 503,
                    context: "test".into(),
                });
            }
            let body = self
                .items
                .lock()
                .unwrap()
                .iter()
                .find(|(i, _)| i.id == item.id)
                .map(|(_, b)| b.clone())
                .ok_or_else(|| SourceError::HttpStatus {
                    status: 404,
                    context: "test".into(),
                })?;
            Ok(Download {
                content_length: Some(body.len() as u64),
                body: Box::pin(stream::iter(vec![Ok(body)])),
            })
        }
    }

    struct Harness {
        dir: tempfile::TempDir,
        db: Arc<dyn StateDb>,
        source: Arc<FakeSource>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                db: Arc::new(SqliteStateDb::open_in_memory().unwrap()),
                source: Arc::new(FakeSource::default()),
            }
        }

        fn kb(&self) -> PathBuf {
            self.dir.path().join("kb").join("drive")
        }

        fn events_path(&self) -> PathBuf {
            self.dir.path().join("events.jsonl")
        }

        /// A fresh loop over the same database, as after a restart.
        async fn poll_loop(&self, dry_run: bool, concurrency: usize) -> PollLoop {
            self.poll_loop_with(poll_config(dry_run, concurrency)).await
        }

        async fn poll_loop_with(&self, poll: PollConfig) -> PollLoop {
            let tracker = StateTracker::load(SourceKind::Drive, self.db.clone())
                .await
                .unwrap();
            PollLoop::new(
                self.source.clone(),
                tracker,
                Fetcher::new(config(&self.kb())),
                EventLog::new(self.events_path()),
                Some(MessageLog::new(self.dir.path().join("messages.jsonl"))),
                poll,
            )
            .await
            .unwrap()
        }

        fn events(&self) -> Vec<serde_json::Value> {
            std::fs::read_to_string(self.events_path())
                .unwrap_or_default()
                .lines()
                .map(|l| serde_json::from_str(l).unwrap())
                .collect()
        }

        fn file(&self, it: &RemoteItem) -> PathBuf {
            self.kb().join(paths::name_id7(it))
        }
    }

    fn poll_config(dry_run: bool, concurrency: usize) -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(10),
            concurrency,
            dry_run,
            full_rescan: None,
            progress: None,
        }
    }

    fn files_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .map(|rd| {
                rd.filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    #[tokio::test]
    async fn new_items_are_fetched_exactly_once() {
        let h = Harness::new();
        h.source.put("A", 10, "aaaa");
        h.source.put("B", 20, "bbbb");
        let mut pl = h.poll_loop(false, 2).await;
        let token = CancellationToken::new();

        let first = pl.run_cycle(&token).await.unwrap();
        assert_eq!(first.stats.fetched, 2);
        assert!(first.watermark_advanced);
        assert_eq!(pl.tracker().watermark().cursor, Some(ts(20)));

        h.source.put("C", 30, "cccc");
        let second = pl.run_cycle(&token).await.unwrap();
        // B is listed again (inclusive cursor) but not fetched again.
        assert_eq!(second.stats.listed, 2);
        assert_eq!(second.stats.fetched, 1);
        assert_eq!(h.source.opens("A"), 1);
        assert_eq!(h.source.opens("B"), 1);
        assert_eq!(h.source.opens("C"), 1);
        assert_eq!(pl.tracker().watermark().cursor, Some(ts(30)));
        assert_eq!(pl.phase(), PollPhase::Idle);

        let c = item("C", 30);
        assert_eq!(std::fs::read(h.file(&c)).unwrap(), b"cccc");
        let fetched = h.db.get_fetched(Some(SourceKind::Drive)).await.unwrap();
        assert_eq!(fetched.len(), 3);
    }

    #[tokio::test]
    async fn restart_fetches_nothing_twice() {
        let h = Harness::new();
        h.source.put("A", 10, "aaaa");
        let token = CancellationToken::new();
        h.poll_loop(false, 1).await.run_cycle(&token).await.unwrap();

        let mut restarted = h.poll_loop(false, 1).await;
        let outcome = restarted.run_cycle(&token).await.unwrap();
        assert_eq!(outcome.stats.fetched, 0);
        assert!(!outcome.watermark_advanced);
        assert_eq!(h.source.total_opens(), 1);
    }

    #[tokio::test]
    async fn cold_restarts_produce_identical_file_sets() {
        let mut h = Harness::new();
        h.source.put("A", 10, "aaaa");
        h.source.put("B", 20, "bbbb");
        let mut doc = item("D", 30);
        doc.name = "Plan".into();
        doc.kind = crate::source::ItemKind::NativeDoc;
        doc.size = None;
        h.source.put_item(doc, "docx");
        let token = CancellationToken::new();
        let snapshot = |dir: &Path| -> Vec<(String, Vec<u8>)> {
            files_in(dir)
                .into_iter()
                .map(|n| {
                    let body = std::fs::read(dir.join(&n)).unwrap();
                    (n, body)
                })
                .collect()
        };

        h.poll_loop(false, 2).await.run_cycle(&token).await.unwrap();
        let first = snapshot(&h.kb());
        assert_eq!(first.len(), 3);

        // Empty directory, empty state, same remote.
        std::fs::remove_dir_all(h.kb()).unwrap();
        h.db = Arc::new(SqliteStateDb::open_in_memory().unwrap());
        let outcome = h.poll_loop(false, 2).await.run_cycle(&token).await.unwrap();
        assert_eq!(outcome.stats.fetched, 3);
        assert_eq!(snapshot(&h.kb()), first);
        assert_eq!(h.source.total_opens(), 6);

        // Empty state over the populated directory adopts every file.
        h.db = Arc::new(SqliteStateDb::open_in_memory().unwrap());
        let outcome = h.poll_loop(false, 2).await.run_cycle(&token).await.unwrap();
        assert_eq!(outcome.stats.fetched, 3);
        assert_eq!(snapshot(&h.kb()), first);
        assert_eq!(h.source.total_opens(), 6);
    }

    #[tokio::test]
    async fn overlong_remote_name_is_fetched_under_capped_name() {
        let h = Harness::new();
        let mut long = item("L1", 10);
        long.name = format!("{}.pdf", "a".repeat(300));
        h.source.put_item(long.clone(), "llll");
        let token = CancellationToken::new();

        let outcome = h.poll_loop(false, 1).await.run_cycle(&token).await.unwrap();
        assert_eq!(outcome.stats.fetched, 1);
        assert!(outcome.watermark_advanced);
        let names = files_in(&h.kb());
        assert_eq!(names.len(), 1);
        assert!(names[0].len() <= paths::MAX_FILE_NAME_BYTES);
        assert!(names[0].ends_with("_L1.pdf"));
        assert_eq!(std::fs::read(h.file(&long)).unwrap(), b"llll");

        let outcome = h.poll_loop(false, 1).await.run_cycle(&token).await.unwrap();
        assert_eq!(outcome.stats.fetched, 0);
        assert_eq!(h.source.opens("L1"), 1);
    }

    #[tokio::test]
    async fn full_rescan_finds_items_older_than_watermark() {
        let h = Harness::new();
        h.source.put("A", 100, "aaaa");
        let token = CancellationToken::new();

        let mut incremental = h.poll_loop(false, 1).await;
        incremental.run_cycle(&token).await.unwrap();
        assert_eq!(incremental.tracker().watermark().cursor, Some(ts(100)));

        // Shared late, but modified before the watermark.
        h.source.put("S", 40, "ssss");
        let outcome = incremental.run_cycle(&token).await.unwrap();
        assert_eq!(outcome.stats.fetched, 0);

        let mut rescanning = h
            .poll_loop_with(PollConfig {
                full_rescan: Some(Duration::from_secs(3600)),
                ..poll_config(false, 1)
            })
            .await;
        let outcome = rescanning.run_cycle(&token).await.unwrap();
        assert_eq!(outcome.stats.listed, 2);
        assert_eq!(outcome.stats.fetched, 1);
        assert_eq!(h.source.opens("S"), 1);
        assert_eq!(h.source.opens("A"), 1);
        assert_eq!(rescanning.tracker().watermark().cursor, Some(ts(100)));

        // Not due again within the interval.
        let outcome = rescanning.run_cycle(&token).await.unwrap();
        assert_eq!(outcome.stats.listed, 1);
    }

    #[tokio::test]
    async fn crash_before_rename_leaves_part_that_is_replaced() {
        let h = Harness::new();
        h.source.put("D", 10, "dddd");
        let d = item("D", 10);
        let dest = h.file(&d);
        std::fs::create_dir_all(h.kb()).unwrap();
        std::fs::write(paths::part_path(&dest), b"dd").unwrap();

        let mut pl = h.poll_loop(false, 1).await;
        pl.run_cycle(&CancellationToken::new()).await.unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"dddd");
        assert_eq!(files_in(&h.kb()), vec![paths::name_id7(&d)]);
        assert_eq!(h.source.opens("D"), 1);
    }

    #[tokio::test]
    async fn crash_after_rename_adopts_file_on_disk() {
        let h = Harness::new();
        h.source.put("D", 10, "dddd");
        let d = item("D", 10);
        std::fs::create_dir_all(h.kb()).unwrap();
        std::fs::write(h.file(&d), b"dddd").unwrap();

        let mut pl = h.poll_loop(false, 1).await;
        let outcome = pl.run_cycle(&CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.stats.fetched, 1);
        assert_eq!(h.source.opens("D"), 0);
        let events = h.events();
        assert_eq!(events[0]["event"], "fetched");
        assert_eq!(events[0]["adopted"], true);
    }

    #[tokio::test]
    async fn oversize_skip_is_persisted_across_restart() {
        let h = Harness::new();
        h.source.put("E", 10, &"x".repeat(150));
        let token = CancellationToken::new();

        let outcome = h.poll_loop(false, 1).await.run_cycle(&token).await.unwrap();
        assert_eq!(outcome.stats.skipped, 1);
        assert!(outcome.watermark_advanced);

        let outcome = h.poll_loop(false, 1).await.run_cycle(&token).await.unwrap();
        assert_eq!(outcome.stats.skipped, 0);
        assert_eq!(h.source.total_opens(), 0);
        let skips: Vec<_> = h
            .events()
            .into_iter()
            .filter(|e| e["event"] == "skipped")
            .collect();
        assert_eq!(skips.len(), 1);
        assert!(files_in(&h.kb()).is_empty());

        // Clearing skips makes it eligible again; still too big.
        assert_eq!(h.db.reset_skipped(Some(SourceKind::Drive)).await.unwrap(), 1);
        let outcome = h.poll_loop(false, 1).await.run_cycle(&token).await.unwrap();
        assert_eq!(outcome.stats.skipped, 1);
    }

    #[tokio::test]
    async fn empty_remote_file_is_skipped() {
        let h = Harness::new();
        let ghost = item("ghost", 10);
        h.source.put_item(ghost.clone(), "");

        let outcome = h
            .poll_loop(false, 1)
            .await
            .run_cycle(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.stats.skipped, 1);
        assert_eq!(h.source.opens("ghost"), 1);
        assert!(!h.file(&ghost).exists());
        let skipped = h.db.get_skipped(Some(SourceKind::Drive)).await.unwrap();
        assert_eq!(skipped[0].reason.as_deref(), Some("empty file"));
    }

    #[tokio::test]
    async fn auth_failure_on_listing_is_fatal() {
        let h = Harness::new();
        h.source.put("A", 10, "aaaa");
        h.source
            .list_errors
            .lock()
            .unwrap()
            .push_back(SourceError::Auth("token revoked".into()));

        let mut pl = h.poll_loop(false, 1).await;
        let err = pl.run_cycle(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, PollError::List(SourceError::Auth(_))));
        assert_eq!(err.class(), ErrorClass::Fatal);
        assert_eq!(pl.tracker().watermark(), Watermark::zero(SourceKind::Drive));
        assert_eq!(h.source.total_opens(), 0);
    }

    #[tokio::test]
    async fn transient_listing_failure_keeps_watermark() {
        let h = Harness::new();
        h.source.put("A", 10, "aaaa");
        h.source
            .list_errors
            .lock()
            .unwrap()
            .push_back(SourceError::RateLimited {
                context: "files.list".into(),
                retry_after: Some(Duration::from_secs(7)),
            });

        let mut pl = h.poll_loop(false, 1).await;
        let token = CancellationToken::new();
        let outcome = pl.run_cycle(&token).await.unwrap();
        assert!(outcome.list_error.is_some());
        assert_eq!(outcome.backoff, Some(Duration::from_secs(7)));
        assert_eq!(pl.tracker().watermark(), Watermark::zero(SourceKind::Drive));

        let outcome = pl.run_cycle(&token).await.unwrap();
        assert_eq!(outcome.stats.fetched, 1);
    }

    #[tokio::test]
    async fn deferred_item_holds_watermark_until_fetched() {
        let h = Harness::new();
        h.source.put("A", 10, "aaaa");
        h.source.put("B", 20, "bbbb");
        h.source.put("C", 30, "cccc");
        h.source.broken.lock().unwrap().insert("B".into());

        let mut pl = h.poll_loop(false, 3).await;
        let token = CancellationToken::new();
        let outcome = pl.run_cycle(&token).await.unwrap();
        assert_eq!(outcome.stats.fetched, 2);
        assert_eq!(outcome.stats.deferred, 1);
        assert_eq!(pl.tracker().watermark().cursor, Some(ts(20)));
        assert_eq!(h.source.opens("B"), 3);
        assert!(h.events().iter().any(|e| e["event"] == "deferred"));

        h.source.broken.lock().unwrap().clear();
        let outcome = pl.run_cycle(&token).await.unwrap();
        assert_eq!(outcome.stats.fetched, 1);
        assert_eq!(pl.tracker().watermark().cursor, Some(ts(30)));
        assert_eq!(h.source.opens("A"), 1);
        assert_eq!(h.source.opens("C"), 1);
    }

    #[tokio::test]
    async fn cancelled_cycle_starts_no_fetch_and_keeps_watermark() {
        let h = Harness::new();
        h.source.put("A", 10, "aaaa");
        let mut pl = h.poll_loop(false, 1).await;
        let token = CancellationToken::new();
        token.cancel();

        let outcome = pl.run_cycle(&token).await.unwrap();
        assert!(outcome.stats.interrupted);
        assert_eq!(h.source.total_opens(), 0);
        assert_eq!(pl.tracker().outstanding(), 0);
        assert_eq!(pl.tracker().watermark(), Watermark::zero(SourceKind::Drive));
    }

    #[tokio::test]
    async fn run_returns_when_already_cancelled() {
        let h = Harness::new();
        h.source.put("A", 10, "aaaa");
        let token = CancellationToken::new();
        token.cancel();
        h.poll_loop(false, 1).await.run(token, false).await.unwrap();
        assert_eq!(h.source.total_opens(), 0);
    }

    #[tokio::test]
    async fn run_once_completes_a_single_cycle() {
        let h = Harness::new();
        h.source.put("A", 10, "aaaa");
        h.poll_loop(false, 1)
            .await
            .run(CancellationToken::new(), true)
            .await
            .unwrap();
        assert_eq!(h.source.opens("A"), 1);
        assert_eq!(
            h.db.get_watermark(SourceKind::Drive).await.unwrap().cursor,
            Some(ts(10))
        );
    }

    #[tokio::test]
    async fn dry_run_changes_nothing() {
        let h = Harness::new();
        h.source.put("A", 10, "aaaa");
        h.source.put("E", 20, &"x".repeat(150));
        let mut pl = h.poll_loop(true, 1).await;

        let outcome = pl.run_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.stats.listed, 2);
        assert_eq!(outcome.stats.fetched, 0);
        assert!(!outcome.watermark_advanced);
        assert_eq!(h.source.total_opens(), 0);
        assert!(files_in(&h.kb()).is_empty());
        assert!(h.db.load_known_ids(SourceKind::Drive).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_fetches_all_settle() {
        let h = Harness::new();
        for i in 0..12 {
            h.source.put(&format!("F{:02}", i), 10 + i, "data");
        }
        let mut pl = h.poll_loop(false, 4).await;
        let outcome = pl.run_cycle(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.stats.fetched, 12);
        assert_eq!(pl.tracker().outstanding(), 0);
        assert_eq!(pl.tracker().watermark().cursor, Some(ts(21)));
        assert_eq!(files_in(&h.kb()).len(), 12);
    }

    #[tokio::test]
    async fn name_policy_collision_falls_back_to_id_suffix() {
        let h = Harness::new();
        let tracker = StateTracker::load(SourceKind::Drive, h.db.clone())
            .await
            .unwrap();
        let mut cfg = config(&h.kb());
        cfg.name_policy = crate::types::FileNamePolicy::Name;
        let mut pl = PollLoop::new(
            h.source.clone(),
            tracker,
            Fetcher::new(cfg),
            EventLog::new(h.events_path()),
            None,
            poll_config(false, 2),
        )
        .await
        .unwrap();

        let mut first = item("X1", 10);
        first.name = "report.pdf".into();
        let mut second = item("X2", 20);
        second.name = "report.pdf".into();
        h.source.put_item(first, "one!");
        h.source.put_item(second.clone(), "two!");

        pl.run_cycle(&CancellationToken::new()).await.unwrap();
        let names = files_in(&h.kb());
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"report.pdf".to_string()));
        assert!(names.contains(&paths::name_id7(&second)));
    }

    #[tokio::test]
    async fn messages_are_logged_once_and_triggers_emitted() {
        let h = Harness::new();
        h.source.messages.lock().unwrap().extend([
            ListedMessage {
                channel: "C1".into(),
                ts: "10.000000".into(),
                user: Some("U1".into()),
                text: "hello".into(),
                posted_at: ts(10),
                file_count: 0,
                trigger: None,
                permalink: None,
            },
            ListedMessage {
                channel: "C1".into(),
                ts: "20.000000".into(),
                user: Some("U1".into()),
                text: "todo: ship it".into(),
                posted_at: ts(20),
                file_count: 0,
                trigger: Some(Trigger {
                    kind: TriggerKind::PatternMatch,
                    details: "Contains todo/note/reminder pattern".into(),
                }),
                permalink: None,
            },
        ]);
        let mut pl = h.poll_loop(false, 1).await;
        let token = CancellationToken::new();

        let outcome = pl.run_cycle(&token).await.unwrap();
        assert_eq!(outcome.stats.messages_logged, 2);
        assert_eq!(pl.tracker().watermark().cursor, Some(ts(20)));

        // The newest message is listed again at the inclusive cursor.
        let outcome = pl.run_cycle(&token).await.unwrap();
        assert_eq!(outcome.stats.messages_logged, 0);

        let log = std::fs::read_to_string(h.dir.path().join("messages.jsonl")).unwrap();
        assert_eq!(log.lines().count(), 2);
        let triggers: Vec<_> = h
            .events()
            .into_iter()
            .filter(|e| e["event"] == "trigger")
            .collect();
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0]["kind"], "pattern_match");
    }
}
