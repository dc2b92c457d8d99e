use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Origin-assigned numeric id of a channel/feed the unit arrived from.
pub type SourceId = i64;

// --- Media ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    /// Anything else, and the aggregate tag for a mixed group with no photo
    /// or video to prefer.
    Other,
}

/// Exact digest plus zero or more perceptual digests, keyed by family name.
///
/// The perceptual map is a typed family → fixed-width-hex encoding; digests
/// are never round-tripped through stringified structures.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FingerprintSet {
    /// sha256 over the raw bytes, lowercase hex. Always present for media.
    pub exact: String,
    /// Family name ("phash", "dhash", "ahash") → 16-char hex digest.
    /// Empty when the bytes could not be decoded (degraded item).
    #[serde(default)]
    pub perceptual: BTreeMap<String, String>,
}

impl FingerprintSet {
    pub fn exact_only(exact: String) -> Self {
        Self {
            exact,
            perceptual: BTreeMap::new(),
        }
    }

    pub fn digest(&self, family: &str) -> Option<&str> {
        self.perceptual.get(family).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaItem {
    /// Opaque transport reference; only the media fetcher interprets it.
    pub reference: String,
    pub kind: MediaKind,
    pub fingerprints: FingerprintSet,
}

/// Aggregate media-type tag for a group: the single kind if uniform,
/// otherwise prefer Photo over Video over declaring the group mixed (Other).
pub fn aggregate_media_kind(media: &[MediaItem]) -> Option<MediaKind> {
    let first = media.first()?.kind;
    if media.iter().all(|m| m.kind == first) {
        return Some(first);
    }
    if media.iter().any(|m| m.kind == MediaKind::Photo) {
        Some(MediaKind::Photo)
    } else if media.iter().any(|m| m.kind == MediaKind::Video) {
        Some(MediaKind::Video)
    } else {
        Some(MediaKind::Other)
    }
}

// --- Ingestion units ---

/// One raw fragment as delivered by the origin transport. Immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingUnit {
    pub source: SourceId,
    /// Per-source sequence id assigned by the origin.
    pub seq: i64,
    pub text: Option<String>,
    pub media: Option<MediaItem>,
    /// Present only when the origin marks this fragment as part of a
    /// multi-part post.
    pub correlation_key: Option<String>,
    pub arrived_at: DateTime<Utc>,
}

impl IncomingUnit {
    /// The correlation key, with malformed (empty/whitespace) keys treated
    /// as absent so the unit falls back to singleton emission.
    pub fn correlation_key(&self) -> Option<&str> {
        self.correlation_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }
}

// --- Assembled records ---

/// The unit of work handed to the duplicate-detection cascade and, when it
/// survives, to downstream collaborators. Built exactly once per
/// (source, correlation key) or per un-correlated unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssembledRecord {
    pub id: Uuid,
    pub source: SourceId,
    pub correlation_key: Option<String>,
    /// Merged text, newline-joined in arrival order.
    pub text: String,
    /// Media in per-unit arrival order.
    pub media: Vec<MediaItem>,
    pub media_kind: Option<MediaKind>,
    /// Single item's exact digest, or for combined records the digest over
    /// the sorted per-item exact digests.
    pub content_digest: Option<String>,
    pub is_combined: bool,
    /// Earliest arrival timestamp across the group.
    pub posted_at: DateTime<Utc>,
}

impl AssembledRecord {
    /// True if any media item carries at least one perceptual digest.
    pub fn has_perceptual(&self) -> bool {
        self.media.iter().any(|m| !m.fingerprints.perceptual.is_empty())
    }

    pub fn has_media(&self) -> bool {
        !self.media.is_empty()
    }
}

/// Slim view of a persisted record, as returned by history queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: Uuid,
    pub source: SourceId,
    pub posted_at: DateTime<Utc>,
}

// --- Verdicts ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictTier {
    None,
    Visual,
    Exact,
    Text,
}

impl VerdictTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerdictTier::None => "none",
            VerdictTier::Visual => "visual",
            VerdictTier::Exact => "exact",
            VerdictTier::Text => "text",
        }
    }
}

/// Outcome of the cascade for one record. Produced exactly once, never
/// retried. `degraded` distinguishes "genuinely not a duplicate" from
/// "inconclusive because a history query failed" (fail-open).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateVerdict {
    pub tier: VerdictTier,
    pub matched: Option<Uuid>,
    /// Similarity 0–100.
    pub score: f64,
    /// The lookback window of the tier that decided (0 for `None`).
    pub window_hours: i64,
    pub degraded: bool,
}

impl DuplicateVerdict {
    pub fn none() -> Self {
        Self {
            tier: VerdictTier::None,
            matched: None,
            score: 0.0,
            window_hours: 0,
            degraded: false,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        self.tier != VerdictTier::None
    }
}

// --- History windows ---

/// Inclusive on both ends: a candidate exactly on the boundary matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl HistoryWindow {
    /// `hours` back from `from` up to `from` itself.
    pub fn lookback(from: DateTime<Utc>, hours: i64) -> Self {
        Self {
            start: from - Duration::hours(hours),
            end: from,
        }
    }

    /// `hours` either side of `center` — candidates may be slightly newer
    /// than the record, tolerating clock skew and out-of-order arrival.
    pub fn around(center: DateTime<Utc>, hours: i64) -> Self {
        Self {
            start: center - Duration::hours(hours),
            end: center + Duration::hours(hours),
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }
}
