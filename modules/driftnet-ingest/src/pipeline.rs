//! Thin orchestrator: fingerprint incoming media, feed units to assembly,
//! run every assembled record through the cascade, and either annotate a
//! duplicate or hand the record downstream.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, Semaphore};
use tracing::{info, warn};
use uuid::Uuid;

use driftnet_common::{
    AssembledRecord, DuplicateVerdict, FingerprintSet, IncomingUnit, IngestConfig,
};
use driftnet_fingerprint::{exact_digest, perceptual_digests};

use crate::assembly::{Assembler, Regime};
use crate::cascade::Cascade;
use crate::traits::{HistoryStore, MediaFetcher, RecordSink};

/// What happened to a record that finished the pipeline.
#[derive(Debug)]
pub enum IngestOutcome {
    /// Not a duplicate; persisted and handed to the sink.
    Accepted { id: Uuid, verdict: DuplicateVerdict },
    /// Duplicate; persisted and annotated rejected, not forwarded.
    Duplicate { id: Uuid, verdict: DuplicateVerdict },
}

impl IngestOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, IngestOutcome::Duplicate { .. })
    }

    pub fn verdict(&self) -> &DuplicateVerdict {
        match self {
            IngestOutcome::Accepted { verdict, .. } => verdict,
            IngestOutcome::Duplicate { verdict, .. } => verdict,
        }
    }
}

pub struct Pipeline {
    assembler: Assembler,
    cascade: Cascade,
    history: Arc<dyn HistoryStore>,
    fetcher: Arc<dyn MediaFetcher>,
    sink: Arc<dyn RecordSink>,
    /// Bounds concurrent CPU-bound hashing so it can't starve group timers.
    fingerprint_permits: Arc<Semaphore>,
}

impl Pipeline {
    /// Build the pipeline and spawn the emission worker that processes
    /// groups closed by assembly deadlines.
    pub fn new(
        config: &IngestConfig,
        history: Arc<dyn HistoryStore>,
        fetcher: Arc<dyn MediaFetcher>,
        sink: Arc<dyn RecordSink>,
    ) -> Arc<Self> {
        let (emit_tx, mut emit_rx) = mpsc::channel::<AssembledRecord>(64);
        let pipeline = Arc::new(Self {
            assembler: Assembler::new(config, Arc::clone(&history), emit_tx),
            cascade: Cascade::new(config, Arc::clone(&history)),
            history,
            fetcher,
            sink,
            fingerprint_permits: Arc::new(Semaphore::new(config.fingerprint_workers.max(1))),
        });

        let worker = Arc::clone(&pipeline);
        tokio::spawn(async move {
            while let Some(record) = emit_rx.recv().await {
                if let Err(e) = worker.process_record(record).await {
                    warn!(error = %e, "assembled record processing failed");
                }
            }
        });
        pipeline
    }

    /// Assembly handle, for the external sweep trigger, stats, and shutdown.
    pub fn assembler(&self) -> &Assembler {
        &self.assembler
    }

    /// Ingest one unit. Singleton records are processed inline and their
    /// outcome returned; buffered units return `None` and their group's
    /// record is processed by the emission worker when the deadline fires.
    pub async fn ingest(
        &self,
        mut unit: IncomingUnit,
        regime: Regime,
    ) -> Result<Option<IngestOutcome>> {
        if let Some(media) = unit.media.as_mut() {
            if media.fingerprints.exact.is_empty() {
                media.fingerprints = self.fingerprint_media(&media.reference).await;
            }
        }
        match self.assembler.submit(unit, regime).await? {
            Some(record) => Ok(Some(self.process_record(record).await?)),
            None => Ok(None),
        }
    }

    /// Fetch bytes and compute the fingerprint set for one media reference.
    /// Fetch or decode failure degrades rather than failing the unit.
    async fn fingerprint_media(&self, reference: &str) -> FingerprintSet {
        let bytes = match self.fetcher.fetch(reference).await {
            Ok(b) => b,
            Err(e) => {
                warn!(reference, error = %e, "media fetch failed; item carries no fingerprints");
                return FingerprintSet::default();
            }
        };
        let exact = exact_digest(&bytes);

        let _permit = self.fingerprint_permits.clone().acquire_owned().await.ok();
        match tokio::task::spawn_blocking(move || perceptual_digests(&bytes)).await {
            Ok(Ok(perceptual)) => FingerprintSet { exact, perceptual },
            Ok(Err(e)) => {
                warn!(reference, error = %e, "perceptual digests failed; degrading to exact only");
                FingerprintSet::exact_only(exact)
            }
            Err(e) => {
                warn!(reference, error = %e, "fingerprint task failed; degrading to exact only");
                FingerprintSet::exact_only(exact)
            }
        }
    }

    /// Cascade, persist, and route one assembled record. Detection runs
    /// exactly once; a rejection is an annotation, not a retry.
    async fn process_record(&self, record: AssembledRecord) -> Result<IngestOutcome> {
        let verdict = self.cascade.check(&record).await;
        let id = self.history.insert(&record).await?;

        if let Some(matched) = verdict.matched.filter(|_| verdict.is_duplicate()) {
            info!(
                record = %id,
                matched = %matched,
                tier = verdict.tier.as_str(),
                score = verdict.score,
                "duplicate detected; annotating rejected"
            );
            self.history
                .annotate_rejected(id, verdict.tier, matched, verdict.score)
                .await?;
            return Ok(IngestOutcome::Duplicate { id, verdict });
        }

        self.sink.accept(&record).await?;
        Ok(IngestOutcome::Accepted { id, verdict })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{unit, unit_with_key, unit_with_media, CollectSink, MockFetcher, MockHistory};
    use driftnet_common::VerdictTier;
    use image::{ImageFormat, RgbImage};
    use std::io::Cursor;
    use std::time::Duration;

    fn png_bytes() -> Vec<u8> {
        let img = RgbImage::from_fn(64, 64, |x, y| {
            let v = ((x * 255 / 64 + y * 255 / 64) / 2) as u8;
            image::Rgb([v, 255 - v, v / 2])
        });
        let mut buf = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    struct Harness {
        pipeline: Arc<Pipeline>,
        history: Arc<MockHistory>,
        sink: Arc<CollectSink>,
    }

    fn harness(fetcher: MockFetcher) -> Harness {
        let history = Arc::new(MockHistory::new());
        let sink = Arc::new(CollectSink::new());
        let pipeline = Pipeline::new(
            &IngestConfig::default(),
            Arc::clone(&history) as Arc<dyn HistoryStore>,
            Arc::new(fetcher),
            Arc::clone(&sink) as Arc<dyn RecordSink>,
        );
        Harness {
            pipeline,
            history,
            sink,
        }
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn new_singleton_is_accepted_and_forwarded() {
        let h = harness(MockFetcher::new());
        let outcome = h
            .pipeline
            .ingest(unit(1, 1, "First report of the road closure downtown"), Regime::Live)
            .await
            .unwrap()
            .expect("singleton resolves inline");
        assert!(!outcome.is_duplicate());
        assert_eq!(h.sink.accepted().len(), 1);
        assert_eq!(h.history.stored_count(), 1);
    }

    #[tokio::test]
    async fn duplicate_text_is_annotated_not_forwarded() {
        let h = harness(MockFetcher::new());
        h.pipeline
            .ingest(unit(1, 1, "Volunteers needed for the weekend river cleanup"), Regime::Live)
            .await
            .unwrap();
        let outcome = h
            .pipeline
            .ingest(unit(2, 9, "Weekend river cleanup volunteers needed for the"), Regime::Live)
            .await
            .unwrap()
            .expect("singleton resolves inline");

        assert!(outcome.is_duplicate());
        assert_eq!(outcome.verdict().tier, VerdictTier::Text);
        let rejections = h.history.rejections();
        assert_eq!(rejections.len(), 1);
        assert_eq!(h.sink.accepted().len(), 1, "only the original is forwarded");
    }

    #[tokio::test]
    async fn exact_repost_across_sources_is_rejected() {
        let bytes = png_bytes();
        let h = harness(
            MockFetcher::new()
                .on("m1", bytes.clone())
                .on("m2", bytes),
        );

        let first = h
            .pipeline
            .ingest(unit_with_media(1, 1, "", "m1"), Regime::Live)
            .await
            .unwrap()
            .expect("inline");
        assert!(!first.is_duplicate());

        let second = h
            .pipeline
            .ingest(unit_with_media(2, 1, "", "m2"), Regime::Live)
            .await
            .unwrap()
            .expect("inline");
        assert!(second.is_duplicate());
        assert_eq!(second.verdict().tier, VerdictTier::Exact);
        assert!((second.verdict().score - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn fetch_failure_degrades_and_still_ingests() {
        let h = harness(MockFetcher::new());
        let outcome = h
            .pipeline
            .ingest(
                unit_with_media(1, 1, "caption text for the broken media post", "missing"),
                Regime::Live,
            )
            .await
            .unwrap()
            .expect("inline");
        assert!(!outcome.is_duplicate());
        assert_eq!(h.sink.accepted().len(), 1);
    }

    #[tokio::test]
    async fn undecodable_media_degrades_to_exact_only() {
        let h = harness(
            MockFetcher::new()
                .on("m1", b"definitely not an image".to_vec())
                .on("m2", b"definitely not an image".to_vec()),
        );
        h.pipeline
            .ingest(unit_with_media(1, 1, "", "m1"), Regime::Live)
            .await
            .unwrap();
        // Perceptual tier is unavailable, but the exact digest still catches
        // the byte-identical repost.
        let second = h
            .pipeline
            .ingest(unit_with_media(2, 1, "", "m2"), Regime::Live)
            .await
            .unwrap()
            .expect("inline");
        assert!(second.is_duplicate());
        assert_eq!(second.verdict().tier, VerdictTier::Exact);
    }

    #[tokio::test(start_paused = true)]
    async fn album_flows_through_emission_worker() {
        let h = harness(MockFetcher::new());
        h.pipeline
            .ingest(unit_with_key(1, 1, "part one", "album-9"), Regime::Backfill)
            .await
            .unwrap();
        h.pipeline
            .ingest(unit_with_key(1, 2, "part two", "album-9"), Regime::Backfill)
            .await
            .unwrap();

        tokio::time::advance(Duration::from_millis(600)).await;
        settle().await;

        let accepted = h.sink.accepted();
        assert_eq!(accepted.len(), 1);
        assert!(accepted[0].is_combined);
        assert_eq!(accepted[0].text, "part one\npart two");
        assert_eq!(h.history.stored_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn redelivery_after_assembly_is_superseded() {
        let h = harness(MockFetcher::new());
        h.pipeline
            .ingest(unit_with_key(1, 1, "only part", "album-x"), Regime::Backfill)
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(600)).await;
        settle().await;
        assert_eq!(h.history.stored_count(), 1);

        let outcome = h
            .pipeline
            .ingest(unit_with_key(1, 1, "only part", "album-x"), Regime::Backfill)
            .await
            .unwrap();
        assert!(outcome.is_none(), "re-delivered unit is a no-op");
        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(h.history.stored_count(), 1, "no second record for the key");
        assert_eq!(
            h.pipeline.assembler().stats().superseded.load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }
}
