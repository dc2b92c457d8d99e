//! Cascading duplicate detection over assembled records.
//!
//! Three tiers in fixed priority order, first positive verdict wins:
//!
//! 1. Visual — perceptual digests, 96 h window. Re-posted images are
//!    routinely re-encoded, cropped, or watermarked, which defeats exact
//!    hashing but preserves perceptual structure, so this runs first.
//!    Byte-identical content is caught here too and reported as `exact`.
//! 2. Exact — single or combined content digest, 72 h window. Cheapest and
//!    authoritative when applicable.
//! 3. Text — cleaned-text similarity, ±48 h window (candidates may be
//!    slightly newer, tolerating clock skew). Highest false-positive risk
//!    and cost, so it runs last. Same-source candidates are included.
//!
//! A failing history query fails open: the tier is inconclusive, the
//! cascade continues, and the verdict carries `degraded = true` so callers
//! can tell "not a duplicate" from "couldn't check".

use std::sync::Arc;

use tracing::warn;

use driftnet_common::{
    AssembledRecord, DuplicateVerdict, HistoryWindow, IngestConfig, StoredRecord, VerdictTier,
};
use driftnet_fingerprint::{effective_text, hamming, similarity_cleaned, FAMILY_PHASH, FAMILY_PRIORITY};

use crate::traits::HistoryStore;

const DIGEST_BITS: f64 = 64.0;

pub struct Cascade {
    history: Arc<dyn HistoryStore>,
    visual_window_hours: i64,
    exact_window_hours: i64,
    text_window_hours: i64,
    primary_hamming_threshold: u32,
    fallback_hamming_threshold: u32,
    text_threshold: f64,
}

impl Cascade {
    pub fn new(config: &IngestConfig, history: Arc<dyn HistoryStore>) -> Self {
        Self {
            history,
            visual_window_hours: config.visual_window_hours,
            exact_window_hours: config.exact_window_hours,
            text_window_hours: config.text_window_hours,
            primary_hamming_threshold: config.primary_hamming_threshold,
            fallback_hamming_threshold: config.fallback_hamming_threshold,
            text_threshold: config.text_threshold,
        }
    }

    /// Run the cascade for one record. Pure with respect to record and
    /// history state; runs exactly once per record, never retried.
    pub async fn check(&self, record: &AssembledRecord) -> DuplicateVerdict {
        let mut degraded = false;

        if record.has_perceptual() {
            if let Some(mut verdict) = self.check_visual(record, &mut degraded).await {
                verdict.degraded = degraded;
                return verdict;
            }
        }

        if record.has_media() {
            if let Some(mut verdict) = self.check_exact(record, &mut degraded).await {
                verdict.degraded = degraded;
                return verdict;
            }
        }

        if !record.text.trim().is_empty() {
            if let Some(mut verdict) = self.check_text(record, &mut degraded).await {
                verdict.degraded = degraded;
                return verdict;
            }
        }

        let mut verdict = DuplicateVerdict::none();
        verdict.degraded = degraded;
        verdict
    }

    /// Tier 1: perceptual similarity, with a byte-identity short-circuit.
    async fn check_visual(
        &self,
        record: &AssembledRecord,
        degraded: &mut bool,
    ) -> Option<DuplicateVerdict> {
        let window = HistoryWindow::lookback(record.posted_at, self.visual_window_hours);

        // Step 1: exact-digest equality inside the visual window. A
        // byte-identical repost needs no Hamming comparison and is reported
        // under the exact tier.
        let digests = exact_digest_candidates(record);
        if !digests.is_empty() {
            match self.history.find_by_digest(&digests, window, true).await {
                Ok(matches) => {
                    if let Some(hit) = matches.first() {
                        return Some(DuplicateVerdict {
                            tier: VerdictTier::Exact,
                            matched: Some(hit.id),
                            score: 100.0,
                            window_hours: self.visual_window_hours,
                            degraded: false,
                        });
                    }
                }
                Err(e) => {
                    warn!(error = %e, "visual tier digest lookup failed; failing open");
                    *degraded = true;
                }
            }
        }

        // Step 2: Hamming distance per family, primary family first. The
        // best accepted score across all candidates and families wins.
        let mut best: Option<(StoredRecord, f64)> = None;
        for family in FAMILY_PRIORITY {
            let mine: Vec<&str> = record
                .media
                .iter()
                .filter_map(|m| m.fingerprints.digest(family))
                .collect();
            if mine.is_empty() {
                continue;
            }
            let threshold = if family == FAMILY_PHASH {
                self.primary_hamming_threshold
            } else {
                self.fallback_hamming_threshold
            };

            let candidates = match self.history.find_by_perceptual(family, window, true).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(family, error = %e, "perceptual lookup failed; failing open");
                    *degraded = true;
                    continue;
                }
            };

            for (candidate, theirs) in candidates {
                for mine_digest in &mine {
                    let Some(distance) = hamming(mine_digest, &theirs) else {
                        continue;
                    };
                    if distance > threshold {
                        continue;
                    }
                    let score = 100.0 * (1.0 - f64::from(distance) / DIGEST_BITS);
                    if best.as_ref().is_none_or(|(_, b)| score > *b) {
                        best = Some((candidate.clone(), score));
                    }
                }
            }
        }

        best.map(|(matched, score)| DuplicateVerdict {
            tier: VerdictTier::Visual,
            matched: Some(matched.id),
            score,
            window_hours: self.visual_window_hours,
            degraded: false,
        })
    }

    /// Tier 2: single-item or combined content digest.
    async fn check_exact(
        &self,
        record: &AssembledRecord,
        degraded: &mut bool,
    ) -> Option<DuplicateVerdict> {
        let digest = record.content_digest.clone()?;
        let window = HistoryWindow::lookback(record.posted_at, self.exact_window_hours);
        match self.history.find_by_digest(&[digest], window, true).await {
            Ok(matches) => matches.first().map(|hit| DuplicateVerdict {
                tier: VerdictTier::Exact,
                matched: Some(hit.id),
                score: 100.0,
                window_hours: self.exact_window_hours,
                degraded: false,
            }),
            Err(e) => {
                warn!(error = %e, "exact tier lookup failed; failing open");
                *degraded = true;
                None
            }
        }
    }

    /// Tier 3: cleaned-text similarity against cached cleaned candidates.
    async fn check_text(
        &self,
        record: &AssembledRecord,
        degraded: &mut bool,
    ) -> Option<DuplicateVerdict> {
        let mine = effective_text(&record.text);
        if mine.is_empty() {
            return None;
        }
        let window = HistoryWindow::around(record.posted_at, self.text_window_hours);
        let candidates = match self.history.find_by_text(window, true).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "text tier lookup failed; failing open");
                *degraded = true;
                return None;
            }
        };

        let mut best: Option<(StoredRecord, f64)> = None;
        for (candidate, cleaned) in candidates {
            let similarity = similarity_cleaned(&mine, &cleaned);
            if similarity < self.text_threshold {
                continue;
            }
            if best.as_ref().is_none_or(|(_, b)| similarity > *b) {
                best = Some((candidate, similarity));
            }
        }

        best.map(|(matched, similarity)| DuplicateVerdict {
            tier: VerdictTier::Text,
            matched: Some(matched.id),
            score: similarity * 100.0,
            window_hours: self.text_window_hours,
            degraded: false,
        })
    }
}

/// Exact digests carried by a record: every media item's own digest plus the
/// single/combined content digest.
fn exact_digest_candidates(record: &AssembledRecord) -> Vec<String> {
    let mut digests: Vec<String> = record
        .media
        .iter()
        .map(|m| m.fingerprints.exact.clone())
        .filter(|d| !d.is_empty())
        .collect();
    if let Some(combined) = &record.content_digest {
        if !digests.contains(combined) {
            digests.push(combined.clone());
        }
    }
    digests.dedup();
    digests
}
