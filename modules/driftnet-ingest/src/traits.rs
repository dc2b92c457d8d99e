// Trait abstractions for the ingest core's collaborators.
//
// HistoryStore — persisted-record queries and writes (the core never sees
//   storage internals).
// MediaFetcher — opaque byte fetch for a media reference, used only to
//   compute fingerprints.
// RecordSink — where records that survive the cascade are handed off.
//
// These enable deterministic testing with MockHistory, MockFetcher and
// CollectSink: no network, no database.

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use driftnet_common::{
    AssembledRecord, HistoryWindow, SourceId, StoredRecord, VerdictTier,
};

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Records whose single-item or combined content digest equals any of
    /// `digests`, posted within `window`, across all sources.
    async fn find_by_digest(
        &self,
        digests: &[String],
        window: HistoryWindow,
        exclude_rejected: bool,
    ) -> Result<Vec<StoredRecord>>;

    /// All (record, digest) pairs for one perceptual family within `window`.
    async fn find_by_perceptual(
        &self,
        family: &str,
        window: HistoryWindow,
        exclude_rejected: bool,
    ) -> Result<Vec<(StoredRecord, String)>>;

    /// All (record, cleaned-text cache) pairs with non-empty text within
    /// `window`. Includes same-source records.
    async fn find_by_text(
        &self,
        window: HistoryWindow,
        exclude_rejected: bool,
    ) -> Result<Vec<(StoredRecord, String)>>;

    /// The record already assembled for this (source, correlation key), if
    /// any. Assembly uses this to supersede re-deliveries.
    async fn find_by_correlation_key(
        &self,
        source: SourceId,
        key: &str,
    ) -> Result<Option<StoredRecord>>;

    /// Persist a record. Atomic at the storage layer.
    async fn insert(&self, record: &AssembledRecord) -> Result<Uuid>;

    /// Mark a persisted record rejected as a duplicate of `matched`.
    async fn annotate_rejected(
        &self,
        id: Uuid,
        tier: VerdictTier,
        matched: Uuid,
        score: f64,
    ) -> Result<()>;
}

#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Fetch the raw bytes behind a media reference.
    async fn fetch(&self, reference: &str) -> Result<Vec<u8>>;
}

#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Take ownership of a record that is not a duplicate.
    async fn accept(&self, record: &AssembledRecord) -> Result<()>;
}
