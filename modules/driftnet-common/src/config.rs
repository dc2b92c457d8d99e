use std::env;
use std::time::Duration;

/// Tuning knobs for assembly and the dedup cascade, loaded from environment
/// variables with production defaults. Tests construct this directly.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Live-regime debounce: a group closes after this long with no new
    /// arrivals.
    pub live_debounce: Duration,
    /// Backfill-regime grace: a group closes this long after its first
    /// arrival, regardless of later arrivals.
    pub backfill_grace: Duration,
    /// Safety ceiling for the staleness sweep: any pending group older than
    /// this is removed and counted as an anomaly.
    pub stale_ceiling: Duration,

    /// Lookback for the visual (perceptual) tier, hours.
    pub visual_window_hours: i64,
    /// Lookback for the exact/combined digest tier, hours.
    pub exact_window_hours: i64,
    /// Half-width of the symmetric text tier window, hours.
    pub text_window_hours: i64,

    /// Max Hamming distance accepted for the primary perceptual family.
    pub primary_hamming_threshold: u32,
    /// Max Hamming distance accepted for fallback families.
    pub fallback_hamming_threshold: u32,
    /// Minimum text similarity (0–1) accepted by the text tier.
    pub text_threshold: f64,

    /// Bound on concurrent fingerprint computations.
    pub fingerprint_workers: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            live_debounce: Duration::from_secs(5),
            backfill_grace: Duration::from_millis(500),
            stale_ceiling: Duration::from_secs(300),
            visual_window_hours: 96,
            exact_window_hours: 72,
            text_window_hours: 48,
            primary_hamming_threshold: 10,
            fallback_hamming_threshold: 12,
            text_threshold: 0.75,
            fingerprint_workers: 4,
        }
    }
}

impl IngestConfig {
    /// Load from environment variables, falling back to defaults for any
    /// that are unset or unparseable.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            live_debounce: env_secs_f64("DRIFTNET_LIVE_DEBOUNCE_SECS")
                .unwrap_or(d.live_debounce),
            backfill_grace: env_secs_f64("DRIFTNET_BACKFILL_GRACE_SECS")
                .unwrap_or(d.backfill_grace),
            stale_ceiling: env_secs_f64("DRIFTNET_STALE_CEILING_SECS")
                .unwrap_or(d.stale_ceiling),
            visual_window_hours: env_parse("DRIFTNET_VISUAL_WINDOW_HOURS")
                .unwrap_or(d.visual_window_hours),
            exact_window_hours: env_parse("DRIFTNET_EXACT_WINDOW_HOURS")
                .unwrap_or(d.exact_window_hours),
            text_window_hours: env_parse("DRIFTNET_TEXT_WINDOW_HOURS")
                .unwrap_or(d.text_window_hours),
            primary_hamming_threshold: env_parse("DRIFTNET_PRIMARY_HAMMING")
                .unwrap_or(d.primary_hamming_threshold),
            fallback_hamming_threshold: env_parse("DRIFTNET_FALLBACK_HAMMING")
                .unwrap_or(d.fallback_hamming_threshold),
            text_threshold: env_parse("DRIFTNET_TEXT_THRESHOLD")
                .unwrap_or(d.text_threshold),
            fingerprint_workers: env_parse("DRIFTNET_FINGERPRINT_WORKERS")
                .unwrap_or(d.fingerprint_workers),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "unparseable config value; using default");
            None
        }
    }
}

fn env_secs_f64(key: &str) -> Option<Duration> {
    env_parse::<f64>(key)
        .filter(|s| s.is_finite() && *s >= 0.0)
        .map(Duration::from_secs_f64)
}
