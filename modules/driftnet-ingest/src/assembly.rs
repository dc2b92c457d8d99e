//! Message assembly: buckets incoming units by (source, correlation key) and
//! emits one assembled record per bucket once it is judged complete.
//!
//! Two timing regimes, selected by the caller per call:
//! - Live: every arrival re-arms the debounce deadline, so a group closes
//!   only after a quiet period with no new arrivals.
//! - Backfill: the deadline is armed once on first arrival and never reset;
//!   backfill delivers units already ordered and batched.
//!
//! Deadlines are modeled as a per-group generation counter rather than a
//! cancellation primitive: arming a new deadline bumps the generation, and a
//! firing timer is honored only if its captured generation still matches.
//! The generation check and the group-map mutation happen under one lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use driftnet_common::{
    aggregate_media_kind, AssembledRecord, IncomingUnit, IngestConfig, SourceId,
};
use driftnet_fingerprint::combined_digest;

use crate::traits::HistoryStore;

/// Which timing regime a submitted unit belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regime {
    /// Bursty, out-of-order delivery from the origin transport.
    Live,
    /// Ordered, batched re-ingestion of historical content.
    Backfill,
}

type GroupKey = (SourceId, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupState {
    /// Buffering units, deadline armed.
    Open,
    /// A record for this key already exists in history; the key is parked
    /// and further units are dropped.
    Superseded,
}

struct PendingGroup {
    units: Vec<IncomingUnit>,
    state: GroupState,
    /// Bumped on every live-regime arrival; a deadline fires only if its
    /// captured generation still matches.
    generation: u64,
    /// Earliest arrival, used by the staleness sweep.
    opened_at: DateTime<Utc>,
}

/// Counters surfaced for observability; the sweep and shutdown counts are
/// anomaly signals, not routine totals.
#[derive(Debug, Default)]
pub struct AssemblyStats {
    pub emitted: AtomicU64,
    pub singletons: AtomicU64,
    pub superseded: AtomicU64,
    pub swept_stale: AtomicU64,
    pub discarded_at_shutdown: AtomicU64,
}

impl std::fmt::Display for AssemblyStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "emitted={} singletons={} superseded={} swept_stale={} discarded_at_shutdown={}",
            self.emitted.load(Ordering::Relaxed),
            self.singletons.load(Ordering::Relaxed),
            self.superseded.load(Ordering::Relaxed),
            self.swept_stale.load(Ordering::Relaxed),
            self.discarded_at_shutdown.load(Ordering::Relaxed),
        )
    }
}

pub struct Assembler {
    groups: Arc<Mutex<HashMap<GroupKey, PendingGroup>>>,
    history: Arc<dyn HistoryStore>,
    emit_tx: mpsc::Sender<AssembledRecord>,
    stats: Arc<AssemblyStats>,
    live_debounce: Duration,
    backfill_grace: Duration,
    stale_ceiling: Duration,
}

impl Assembler {
    pub fn new(
        config: &IngestConfig,
        history: Arc<dyn HistoryStore>,
        emit_tx: mpsc::Sender<AssembledRecord>,
    ) -> Self {
        Self {
            groups: Arc::new(Mutex::new(HashMap::new())),
            history,
            emit_tx,
            stats: Arc::new(AssemblyStats::default()),
            live_debounce: config.live_debounce,
            backfill_grace: config.backfill_grace,
            stale_ceiling: config.stale_ceiling,
        }
    }

    pub fn stats(&self) -> &AssemblyStats {
        &self.stats
    }

    /// Submit one unit. Un-correlated units produce a singleton record
    /// immediately; correlated units buffer and the assembled record is
    /// delivered later on the emission channel.
    pub async fn submit(
        &self,
        unit: IncomingUnit,
        regime: Regime,
    ) -> anyhow::Result<Option<AssembledRecord>> {
        let Some(key) = unit.correlation_key().map(str::to_string) else {
            self.stats.singletons.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(build_record(unit.source, None, vec![unit])));
        };
        let key: GroupKey = (unit.source, key);

        // Existing group: append (and re-arm under the live regime).
        {
            let mut groups = self.groups.lock().expect("group map lock poisoned");
            if let Some(group) = groups.get_mut(&key) {
                match group.state {
                    GroupState::Superseded => {
                        self.stats.superseded.fetch_add(1, Ordering::Relaxed);
                        return Ok(None);
                    }
                    GroupState::Open => {
                        group.units.push(unit);
                        if regime == Regime::Live {
                            group.generation += 1;
                            let generation = group.generation;
                            drop(groups);
                            self.arm_deadline(key, generation, self.live_debounce);
                        }
                        return Ok(None);
                    }
                }
            }
        }

        // New key: a record may already exist in history (overlapping
        // live/backfill ingestion of the same content). Query outside the
        // lock; storage failure degrades to "no record" so ingestion keeps
        // flowing.
        let already_assembled = match self
            .history
            .find_by_correlation_key(unit.source, &key.1)
            .await
        {
            Ok(existing) => existing.is_some(),
            Err(e) => {
                warn!(source = unit.source, key = %key.1, error = %e,
                    "correlation-key lookup failed; assuming no existing record");
                false
            }
        };

        let mut groups = self.groups.lock().expect("group map lock poisoned");
        if groups.contains_key(&key) {
            // Another arrival won the race while we were querying; retry via
            // the existing-group path.
            drop(groups);
            return Box::pin(self.submit(unit, regime)).await;
        }

        if already_assembled {
            info!(source = unit.source, key = %key.1, "correlation key already assembled; superseding");
            self.stats.superseded.fetch_add(1, Ordering::Relaxed);
            groups.insert(
                key,
                PendingGroup {
                    units: Vec::new(),
                    state: GroupState::Superseded,
                    generation: 0,
                    opened_at: unit.arrived_at,
                },
            );
            return Ok(None);
        }

        let opened_at = unit.arrived_at;
        groups.insert(
            key.clone(),
            PendingGroup {
                units: vec![unit],
                state: GroupState::Open,
                generation: 1,
                opened_at,
            },
        );
        drop(groups);

        let delay = match regime {
            Regime::Live => self.live_debounce,
            Regime::Backfill => self.backfill_grace,
        };
        self.arm_deadline(key, 1, delay);
        Ok(None)
    }

    /// Spawn a deadline task for `key` at `generation`. Stale generations
    /// (a newer deadline was armed, or the group is gone) are no-ops.
    fn arm_deadline(&self, key: GroupKey, generation: u64, delay: Duration) {
        let groups = Arc::clone(&self.groups);
        let emit_tx = self.emit_tx.clone();
        let stats = Arc::clone(&self.stats);
        // Create the timer before spawning so the deadline is measured from
        // arming time, not from when the task is first polled.
        let sleep = tokio::time::sleep(delay);
        tokio::spawn(async move {
            sleep.await;
            let record = {
                let mut map = groups.lock().expect("group map lock poisoned");
                let current = map
                    .get(&key)
                    .is_some_and(|g| g.state == GroupState::Open && g.generation == generation);
                if !current {
                    return;
                }
                map.remove(&key).map(|g| {
                    let units = g.units.len();
                    (build_record(key.0, Some(key.1.clone()), g.units), units)
                })
            };
            if let Some((record, units)) = record {
                stats.emitted.fetch_add(1, Ordering::Relaxed);
                info!(source = key.0, key = %key.1, units, "group assembled");
                if emit_tx.send(record).await.is_err() {
                    warn!(source = key.0, key = %key.1, "emission channel closed; record dropped");
                }
            }
        });
    }

    /// Remove any pending group whose earliest unit is older than the safety
    /// ceiling, regardless of state. Invoked by an external scheduler; this
    /// bounds memory when a deadline is lost, which is an anomaly, not a
    /// routine path.
    pub fn sweep_stale(&self, now: DateTime<Utc>) -> usize {
        let ceiling = chrono::Duration::from_std(self.stale_ceiling)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let mut groups = self.groups.lock().expect("group map lock poisoned");
        let stale: Vec<GroupKey> = groups
            .iter()
            .filter(|(_, g)| now - g.opened_at > ceiling)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            if let Some(group) = groups.remove(key) {
                warn!(
                    source = key.0,
                    key = %key.1,
                    units = group.units.len(),
                    state = ?group.state,
                    "stale pending group swept past safety ceiling"
                );
            }
        }
        self.stats
            .swept_stale
            .fetch_add(stale.len() as u64, Ordering::Relaxed);
        stale.len()
    }

    /// Discard all pending groups. Units not yet debounced are lost; this is
    /// documented, accepted shutdown behavior — not silent.
    pub fn shutdown(&self) {
        let mut groups = self.groups.lock().expect("group map lock poisoned");
        let open = groups
            .values()
            .filter(|g| g.state == GroupState::Open)
            .count();
        if open > 0 {
            warn!(open_groups = open, "shutdown discarding not-yet-assembled groups");
        }
        self.stats
            .discarded_at_shutdown
            .fetch_add(open as u64, Ordering::Relaxed);
        groups.clear();
    }
}

/// Build an assembled record from a group's units: arrival order, merged
/// text, media concatenated in per-unit order, aggregate media kind, and a
/// single or combined content digest.
fn build_record(
    source: SourceId,
    correlation_key: Option<String>,
    mut units: Vec<IncomingUnit>,
) -> AssembledRecord {
    units.sort_by_key(|u| u.arrived_at);

    let text = units
        .iter()
        .filter_map(|u| u.text.as_deref())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    let media: Vec<_> = units.iter().filter_map(|u| u.media.clone()).collect();
    let exacts: Vec<&str> = media
        .iter()
        .map(|m| m.fingerprints.exact.as_str())
        .filter(|d| !d.is_empty())
        .collect();
    let content_digest = match exacts.len() {
        0 => None,
        1 => Some(exacts[0].to_string()),
        _ => Some(combined_digest(&exacts)),
    };

    let posted_at = units
        .iter()
        .map(|u| u.arrived_at)
        .min()
        .unwrap_or_else(Utc::now);

    AssembledRecord {
        id: Uuid::new_v4(),
        source,
        correlation_key,
        text,
        media_kind: aggregate_media_kind(&media),
        media,
        content_digest,
        is_combined: units.len() > 1,
        posted_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{photo, unit, unit_with_key, MockHistory};
    use std::time::Duration;

    fn assembler(
        history: Arc<MockHistory>,
    ) -> (Assembler, mpsc::Receiver<AssembledRecord>) {
        let (tx, rx) = mpsc::channel(16);
        let asm = Assembler::new(&IngestConfig::default(), history, tx);
        (asm, rx)
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn uncorrelated_unit_returns_singleton_immediately() {
        let (asm, _rx) = assembler(Arc::new(MockHistory::new()));
        let record = asm
            .submit(unit(7, 1, "hello"), Regime::Live)
            .await
            .unwrap()
            .expect("singleton should be returned inline");
        assert_eq!(record.source, 7);
        assert_eq!(record.text, "hello");
        assert!(!record.is_combined);
        assert_eq!(asm.stats().singletons.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn malformed_correlation_key_is_singleton() {
        let (asm, _rx) = assembler(Arc::new(MockHistory::new()));
        let mut u = unit(7, 1, "hello");
        u.correlation_key = Some("  ".to_string());
        let record = asm.submit(u, Regime::Live).await.unwrap();
        assert!(record.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn live_debounce_closes_after_quiet_period() {
        let (asm, mut rx) = assembler(Arc::new(MockHistory::new()));
        // Arrivals at t = 0, 1, 2, 3 s with a 5 s debounce.
        for seq in 0..4 {
            let buffered = asm
                .submit(unit_with_key(1, seq, &format!("part {seq}"), "album-1"), Regime::Live)
                .await
                .unwrap();
            assert!(buffered.is_none());
            if seq < 3 {
                tokio::time::advance(Duration::from_secs(1)).await;
            }
        }

        // t = 7.9 s: the three earlier deadlines have fired as stale no-ops,
        // the live one has not.
        tokio::time::advance(Duration::from_millis(4900)).await;
        settle().await;
        assert!(rx.try_recv().is_err(), "no emission before the quiet period ends");

        // t = 8.1 s: 5 s after the last arrival.
        tokio::time::advance(Duration::from_millis(200)).await;
        settle().await;
        let record = rx.try_recv().expect("emission after quiet period");
        assert_eq!(record.text, "part 0\npart 1\npart 2\npart 3");
        assert!(record.is_combined);
        assert_eq!(asm.stats().emitted.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backfill_deadline_is_fixed_from_first_arrival() {
        let (asm, mut rx) = assembler(Arc::new(MockHistory::new()));
        for (seq, offset_ms) in [(0i64, 0u64), (1, 200), (2, 200)] {
            tokio::time::advance(Duration::from_millis(offset_ms)).await;
            asm.submit(unit_with_key(1, seq, &format!("p{seq}"), "g"), Regime::Backfill)
                .await
                .unwrap();
        }
        // t = 0.4 s; the 0.5 s deadline measured from the first arrival has
        // not been pushed back by the later units.
        tokio::time::advance(Duration::from_millis(150)).await;
        settle().await;
        let record = rx.try_recv().expect("group closes 0.5s after first arrival");
        assert_eq!(record.text, "p0\np1\np2");
    }

    #[tokio::test(start_paused = true)]
    async fn backfill_straggler_starts_new_group_when_history_is_empty() {
        let history = Arc::new(MockHistory::new());
        let (asm, mut rx) = assembler(history);
        asm.submit(unit_with_key(1, 0, "first", "g"), Regime::Backfill)
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(600)).await;
        settle().await;
        assert!(rx.try_recv().is_ok(), "first group emitted");

        // Straggler at t = 0.6 s: nothing was persisted for this key, so a
        // fresh group opens under the same key.
        asm.submit(unit_with_key(1, 1, "late", "g"), Regime::Backfill)
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(600)).await;
        settle().await;
        let second = rx.try_recv().expect("straggler forms a second group");
        assert_eq!(second.text, "late");
    }

    #[tokio::test(start_paused = true)]
    async fn straggler_superseded_once_record_is_in_history() {
        let history = Arc::new(MockHistory::new());
        let (asm, mut rx) = assembler(Arc::clone(&history));
        asm.submit(unit_with_key(1, 0, "first", "g"), Regime::Backfill)
            .await
            .unwrap();
        tokio::time::advance(Duration::from_millis(600)).await;
        settle().await;
        let record = rx.try_recv().expect("first group emitted");
        history.seed(record);

        let outcome = asm
            .submit(unit_with_key(1, 1, "late", "g"), Regime::Backfill)
            .await
            .unwrap();
        assert!(outcome.is_none());
        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert!(rx.try_recv().is_err(), "superseded key must not emit");
        assert_eq!(asm.stats().superseded.load(Ordering::Relaxed), 1);

        // Re-delivery stays parked without another history query round-trip.
        asm.submit(unit_with_key(1, 2, "later still", "g"), Regime::Backfill)
            .await
            .unwrap();
        assert_eq!(asm.stats().superseded.load(Ordering::Relaxed), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn media_group_gets_combined_digest() {
        let (asm, mut rx) = assembler(Arc::new(MockHistory::new()));
        let mut a = unit_with_key(1, 0, "", "album");
        a.media = Some(photo("m1", "d1"));
        let mut b = unit_with_key(1, 1, "", "album");
        b.media = Some(photo("m2", "d2"));
        asm.submit(a, Regime::Backfill).await.unwrap();
        asm.submit(b, Regime::Backfill).await.unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;

        let record = rx.try_recv().expect("album emitted");
        assert_eq!(record.media.len(), 2);
        assert!(record.is_combined);
        assert_eq!(
            record.content_digest.as_deref(),
            Some(combined_digest(["d1", "d2"]).as_str())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_stale_groups_and_counts_anomaly() {
        let (asm, mut rx) = assembler(Arc::new(MockHistory::new()));
        let u = unit_with_key(1, 0, "orphan", "g");
        let opened_at = u.arrived_at;
        asm.submit(u, Regime::Live).await.unwrap();

        // Simulate a lost timer: sweep with wall time past the ceiling
        // before the virtual-time deadline ever fires.
        let swept = asm.sweep_stale(opened_at + chrono::Duration::seconds(301));
        assert_eq!(swept, 1);
        assert_eq!(asm.stats().swept_stale.load(Ordering::Relaxed), 1);

        // The deadline that later fires finds no group and emits nothing.
        tokio::time::advance(Duration::from_secs(6)).await;
        settle().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_discards_open_groups() {
        let (asm, mut rx) = assembler(Arc::new(MockHistory::new()));
        asm.submit(unit_with_key(1, 0, "in flight", "g"), Regime::Live)
            .await
            .unwrap();
        asm.shutdown();
        assert_eq!(asm.stats().discarded_at_shutdown.load(Ordering::Relaxed), 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        settle().await;
        assert!(rx.try_recv().is_err(), "discarded group must not emit");
    }

    #[tokio::test(start_paused = true)]
    async fn units_merged_in_arrival_order_even_if_submitted_out_of_order() {
        let (asm, mut rx) = assembler(Arc::new(MockHistory::new()));
        let t0 = Utc::now();
        let mut first = unit_with_key(1, 1, "second half", "g");
        first.arrived_at = t0 + chrono::Duration::milliseconds(50);
        let mut second = unit_with_key(1, 0, "first half", "g");
        second.arrived_at = t0;
        asm.submit(first, Regime::Backfill).await.unwrap();
        asm.submit(second, Regime::Backfill).await.unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;

        let record = rx.try_recv().expect("emitted");
        assert_eq!(record.text, "first half\nsecond half");
        assert_eq!(record.posted_at, t0);
    }
}
