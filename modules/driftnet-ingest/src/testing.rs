// Test mocks for the ingest core.
//
// Three mocks matching the three trait boundaries:
// - MockHistory (HistoryStore) — stateful in-memory record store
// - MockFetcher (MediaFetcher) — HashMap-based reference→bytes
// - CollectSink (RecordSink) — accumulates accepted records
//
// Plus helpers for constructing IncomingUnit, MediaItem and AssembledRecord
// fixtures. No network, no database.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use driftnet_common::{
    aggregate_media_kind, AssembledRecord, FingerprintSet, HistoryWindow, IncomingUnit, MediaItem,
    MediaKind, SourceId, StoredRecord, VerdictTier,
};
use driftnet_fingerprint::effective_text;

use crate::traits::{HistoryStore, MediaFetcher, RecordSink};

// ---------------------------------------------------------------------------
// Fixture helpers
// ---------------------------------------------------------------------------

pub fn unit(source: SourceId, seq: i64, text: &str) -> IncomingUnit {
    IncomingUnit {
        source,
        seq,
        text: (!text.is_empty()).then(|| text.to_string()),
        media: None,
        correlation_key: None,
        arrived_at: Utc::now(),
    }
}

pub fn unit_with_key(source: SourceId, seq: i64, text: &str, key: &str) -> IncomingUnit {
    let mut u = unit(source, seq, text);
    u.correlation_key = Some(key.to_string());
    u
}

/// A unit carrying an unfingerprinted photo reference, as it would arrive
/// from a source before the pipeline fetches and hashes the bytes.
pub fn unit_with_media(source: SourceId, seq: i64, text: &str, reference: &str) -> IncomingUnit {
    let mut u = unit(source, seq, text);
    u.media = Some(MediaItem {
        reference: reference.to_string(),
        kind: MediaKind::Photo,
        fingerprints: FingerprintSet::default(),
    });
    u
}

/// A photo media item with only an exact digest.
pub fn photo(reference: &str, exact: &str) -> MediaItem {
    MediaItem {
        reference: reference.to_string(),
        kind: MediaKind::Photo,
        fingerprints: FingerprintSet::exact_only(exact.to_string()),
    }
}

/// A photo media item with exact and perceptual digests.
pub fn photo_with_digests(
    reference: &str,
    exact: &str,
    perceptual: &[(&str, &str)],
) -> MediaItem {
    let mut item = photo(reference, exact);
    for (family, digest) in perceptual {
        item.fingerprints
            .perceptual
            .insert((*family).to_string(), (*digest).to_string());
    }
    item
}

/// A media-less record posted now.
pub fn record(source: SourceId, text: &str) -> AssembledRecord {
    record_at(source, text, Utc::now(), None)
}

/// A record with one media item posted now; the content digest is the
/// item's exact digest.
pub fn record_with_media(source: SourceId, text: &str, item: MediaItem) -> AssembledRecord {
    record_at(source, text, Utc::now(), Some(item))
}

pub fn record_at(
    source: SourceId,
    text: &str,
    posted_at: DateTime<Utc>,
    media: Option<MediaItem>,
) -> AssembledRecord {
    let media: Vec<MediaItem> = media.into_iter().collect();
    let content_digest = media
        .first()
        .map(|m| m.fingerprints.exact.clone())
        .filter(|d| !d.is_empty());
    AssembledRecord {
        id: Uuid::new_v4(),
        source,
        correlation_key: None,
        text: text.to_string(),
        media_kind: aggregate_media_kind(&media),
        media,
        content_digest,
        is_combined: false,
        posted_at,
    }
}

// ---------------------------------------------------------------------------
// MockHistory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub id: Uuid,
    pub tier: VerdictTier,
    pub matched: Uuid,
    pub score: f64,
}

struct StoredEntry {
    record: AssembledRecord,
    cleaned_text: String,
    rejected: bool,
}

/// Stateful in-memory history. `set_failing(true)` makes every query return
/// an error, for fail-open tests; inserts keep working.
#[derive(Default)]
pub struct MockHistory {
    entries: Mutex<Vec<StoredEntry>>,
    rejections: Mutex<Vec<Rejection>>,
    fail_queries: AtomicBool,
}

impl MockHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate with a record, as if it had been ingested earlier.
    pub fn seed(&self, record: AssembledRecord) {
        let cleaned_text = effective_text(&record.text);
        self.entries
            .lock()
            .expect("mock history lock poisoned")
            .push(StoredEntry {
                record,
                cleaned_text,
                rejected: false,
            });
    }

    /// Pre-populate with an already-rejected record.
    pub fn seed_rejected(&self, record: AssembledRecord) {
        self.seed(record);
        let mut entries = self.entries.lock().expect("mock history lock poisoned");
        if let Some(last) = entries.last_mut() {
            last.rejected = true;
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_queries.store(failing, Ordering::SeqCst);
    }

    pub fn rejections(&self) -> Vec<Rejection> {
        self.rejections
            .lock()
            .expect("mock history lock poisoned")
            .clone()
    }

    pub fn stored_count(&self) -> usize {
        self.entries
            .lock()
            .expect("mock history lock poisoned")
            .len()
    }

    fn check_failing(&self) -> Result<()> {
        if self.fail_queries.load(Ordering::SeqCst) {
            bail!("history store unavailable");
        }
        Ok(())
    }
}

fn view(entry: &StoredEntry) -> StoredRecord {
    StoredRecord {
        id: entry.record.id,
        source: entry.record.source,
        posted_at: entry.record.posted_at,
    }
}

fn eligible(entry: &StoredEntry, window: HistoryWindow, exclude_rejected: bool) -> bool {
    window.contains(entry.record.posted_at) && !(exclude_rejected && entry.rejected)
}

#[async_trait]
impl HistoryStore for MockHistory {
    async fn find_by_digest(
        &self,
        digests: &[String],
        window: HistoryWindow,
        exclude_rejected: bool,
    ) -> Result<Vec<StoredRecord>> {
        self.check_failing()?;
        let entries = self.entries.lock().expect("mock history lock poisoned");
        Ok(entries
            .iter()
            .filter(|e| eligible(e, window, exclude_rejected))
            .filter(|e| {
                e.record
                    .content_digest
                    .as_ref()
                    .is_some_and(|d| digests.contains(d))
                    || e.record
                        .media
                        .iter()
                        .any(|m| digests.contains(&m.fingerprints.exact))
            })
            .map(view)
            .collect())
    }

    async fn find_by_perceptual(
        &self,
        family: &str,
        window: HistoryWindow,
        exclude_rejected: bool,
    ) -> Result<Vec<(StoredRecord, String)>> {
        self.check_failing()?;
        let entries = self.entries.lock().expect("mock history lock poisoned");
        let mut out = Vec::new();
        for entry in entries.iter().filter(|e| eligible(e, window, exclude_rejected)) {
            for media in &entry.record.media {
                if let Some(digest) = media.fingerprints.digest(family) {
                    out.push((view(entry), digest.to_string()));
                }
            }
        }
        Ok(out)
    }

    async fn find_by_text(
        &self,
        window: HistoryWindow,
        exclude_rejected: bool,
    ) -> Result<Vec<(StoredRecord, String)>> {
        self.check_failing()?;
        let entries = self.entries.lock().expect("mock history lock poisoned");
        Ok(entries
            .iter()
            .filter(|e| eligible(e, window, exclude_rejected))
            .filter(|e| !e.cleaned_text.is_empty())
            .map(|e| (view(e), e.cleaned_text.clone()))
            .collect())
    }

    async fn find_by_correlation_key(
        &self,
        source: SourceId,
        key: &str,
    ) -> Result<Option<StoredRecord>> {
        self.check_failing()?;
        let entries = self.entries.lock().expect("mock history lock poisoned");
        Ok(entries
            .iter()
            .find(|e| {
                e.record.source == source && e.record.correlation_key.as_deref() == Some(key)
            })
            .map(view))
    }

    async fn insert(&self, record: &AssembledRecord) -> Result<Uuid> {
        let id = record.id;
        self.seed(record.clone());
        Ok(id)
    }

    async fn annotate_rejected(
        &self,
        id: Uuid,
        tier: VerdictTier,
        matched: Uuid,
        score: f64,
    ) -> Result<()> {
        let mut entries = self.entries.lock().expect("mock history lock poisoned");
        if let Some(entry) = entries.iter_mut().find(|e| e.record.id == id) {
            entry.rejected = true;
        }
        self.rejections
            .lock()
            .expect("mock history lock poisoned")
            .push(Rejection {
                id,
                tier,
                matched,
                score,
            });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// HashMap-based media fetcher. Returns `Err` for unregistered references.
/// Builder pattern: `.on(reference, bytes)`.
#[derive(Default)]
pub struct MockFetcher {
    bytes: HashMap<String, Vec<u8>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, reference: &str, bytes: Vec<u8>) -> Self {
        self.bytes.insert(reference.to_string(), bytes);
        self
    }
}

#[async_trait]
impl MediaFetcher for MockFetcher {
    async fn fetch(&self, reference: &str) -> Result<Vec<u8>> {
        match self.bytes.get(reference) {
            Some(b) => Ok(b.clone()),
            None => bail!("unknown media reference: {reference}"),
        }
    }
}

// ---------------------------------------------------------------------------
// CollectSink
// ---------------------------------------------------------------------------

/// Accumulates every record the pipeline hands downstream.
#[derive(Default)]
pub struct CollectSink {
    accepted: Mutex<Vec<AssembledRecord>>,
}

impl CollectSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accepted(&self) -> Vec<AssembledRecord> {
        self.accepted
            .lock()
            .expect("collect sink lock poisoned")
            .clone()
    }
}

#[async_trait]
impl RecordSink for CollectSink {
    async fn accept(&self, record: &AssembledRecord) -> Result<()> {
        self.accepted
            .lock()
            .expect("collect sink lock poisoned")
            .push(record.clone());
        Ok(())
    }
}
