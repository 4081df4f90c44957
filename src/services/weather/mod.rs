//! Weather consensus aggregation.
//!
//! Near-term rainfall is fetched from every registered source in parallel.
//! Each fetch attempt is timeout-bounded and retried with capped exponential
//! backoff; the whole fan-out has its own deadline and keeps whatever arrived.
//! A failed source falls back to its last good value while that is younger
//! than the cache TTL.
//!
//! Contributions are weighted by `reliability × 0.5^(age / half_life)` and
//! combined into a weighted median. Status is `OK` at quorum with only fresh
//! values, `DEGRADED` below quorum or with any cached value, `UNAVAILABLE`
//! with no contributor at all (and then no number is produced).

pub mod open_meteo;
pub mod sources;
pub mod yr;

use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use utoipa::ToSchema;

use crate::config::{AppConfig, WeatherConfig};
use crate::domain::{ConsensusEstimate, ConsensusStatus};

pub use open_meteo::OpenMeteoSource;
pub use sources::SimulatedSource;
pub use yr::YrSource;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SourceFetchError {
    #[error("request timed out after {0} ms")]
    Timeout(u64),
    #[error("request failed: {0}")]
    Http(String),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("response could not be parsed: {0}")]
    Parse(String),
    #[error("no rainfall value for the requested hour")]
    NoData,
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

/// Rain expected over the next hour at one location, as reported by a source.
#[derive(Debug, Clone, PartialEq)]
pub struct RainForecast {
    pub rain_next_hour_mm: f64,
    /// When the value was produced; staleness is measured from here.
    pub observed_at: DateTime<Utc>,
}

/// A pluggable near-term rainfall provider.
pub trait WeatherSource: Send + Sync {
    fn id(&self) -> &str;

    fn fetch(&self, latitude: f64, longitude: f64) -> BoxFuture<'_, Result<RainForecast, SourceFetchError>>;
}

/// The node and coordinates a consensus is computed for.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusTarget {
    pub node_id: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// One source's contribution to a consensus.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct WeatherSample {
    pub source_id: String,
    pub ts: DateTime<Utc>,
    pub rain_next_hour_mm: f64,
    pub quality_score: f64,
    /// Served from cache after the live fetch failed
    pub from_cache: bool,
}

/// A consensus together with the samples that produced it.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ConsensusReport {
    pub estimate: ConsensusEstimate,
    pub samples: Vec<WeatherSample>,
}

/// Cache key: source id plus coordinates rounded to four decimals.
type CacheKey = (String, i64, i64);

fn cache_key(source_id: &str, latitude: f64, longitude: f64) -> CacheKey {
    (
        source_id.to_string(),
        (latitude * 1e4).round() as i64,
        (longitude * 1e4).round() as i64,
    )
}

#[derive(Debug, Clone)]
struct CachedForecast {
    forecast: RainForecast,
    fetched_at: DateTime<Utc>,
}

struct RegisteredSource {
    source: Arc<dyn WeatherSource>,
    reliability: f64,
}

/// Registry of weather sources plus the last-good-value cache.
pub struct WeatherAggregator {
    sources: Vec<RegisteredSource>,
    cfg: WeatherConfig,
    cache: Mutex<HashMap<CacheKey, CachedForecast>>,
}

impl WeatherAggregator {
    pub fn new(cfg: WeatherConfig) -> Self {
        Self {
            sources: Vec::new(),
            cfg,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Add a source; its reliability weight comes from the rules.
    pub fn register(&mut self, source: Arc<dyn WeatherSource>) {
        let reliability = self.cfg.reliability_of(source.id());
        tracing::info!("Registered weather source '{}' (reliability {})", source.id(), reliability);
        self.sources.push(RegisteredSource { source, reliability });
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.source.id().to_string()).collect()
    }

    /// Consensus rainfall for `target` at `now`.
    ///
    /// Observations older than `horizon_cutoff` do not count.
    pub async fn consensus(
        &self,
        target: &ConsensusTarget,
        now: DateTime<Utc>,
        horizon_cutoff: Duration,
    ) -> ConsensusEstimate {
        self.consensus_report(target, now, horizon_cutoff).await.estimate
    }

    pub async fn consensus_report(
        &self,
        target: &ConsensusTarget,
        now: DateTime<Utc>,
        horizon_cutoff: Duration,
    ) -> ConsensusReport {
        let mut outcomes = self.fetch_all(target).await;

        let mut samples = Vec::with_capacity(self.sources.len());
        for reg in &self.sources {
            let id = reg.source.id();
            let key = cache_key(id, target.latitude, target.longitude);
            let (forecast, from_cache) = match outcomes.remove(id) {
                Some(Ok(forecast)) => {
                    self.remember(key, &forecast, now);
                    (forecast, false)
                }
                failure => {
                    let reason = match failure {
                        Some(Err(e)) => e.to_string(),
                        _ => "overall deadline passed".to_string(),
                    };
                    match self.cached(&key, now) {
                        Some(cached) => {
                            tracing::warn!(
                                "Weather source '{}' failed for {} ({}), using cached value",
                                id,
                                target.node_id,
                                reason
                            );
                            (cached, true)
                        }
                        None => {
                            tracing::warn!(
                                "Weather source '{}' failed for {} ({}), excluded this cycle",
                                id,
                                target.node_id,
                                reason
                            );
                            continue;
                        }
                    }
                }
            };

            if let Some(sample) = self.score(id, reg.reliability, &forecast, from_cache, now, horizon_cutoff) {
                samples.push(sample);
            }
        }

        let estimate = combine(&target.node_id, now, &samples, self.cfg.quorum);
        ConsensusReport { estimate, samples }
    }

    /// Fan out to every source; sources still pending at the deadline are
    /// simply absent from the result.
    async fn fetch_all(&self, target: &ConsensusTarget) -> HashMap<String, Result<RainForecast, SourceFetchError>> {
        let deadline = tokio::time::Instant::now()
            + std::time::Duration::from_millis(self.cfg.overall_timeout_ms);

        let mut pending: FuturesUnordered<_> = self
            .sources
            .iter()
            .map(|reg| {
                let source = reg.source.clone();
                let cfg = &self.cfg;
                async move {
                    let result = fetch_with_retry(source.as_ref(), target.latitude, target.longitude, cfg).await;
                    (source.id().to_string(), result)
                }
            })
            .collect();

        let mut outcomes = HashMap::new();
        loop {
            match tokio::time::timeout_at(deadline, pending.next()).await {
                Ok(Some((id, result))) => {
                    outcomes.insert(id, result);
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        "Weather fan-out deadline reached for {} with {} source(s) pending",
                        target.node_id,
                        pending.len()
                    );
                    break;
                }
            }
        }
        outcomes
    }

    fn remember(&self, key: CacheKey, forecast: &RainForecast, now: DateTime<Utc>) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(
            key,
            CachedForecast {
                forecast: forecast.clone(),
                fetched_at: now,
            },
        );
    }

    fn cached(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<RainForecast> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .get(key)
            .filter(|c| now - c.fetched_at <= Duration::seconds(self.cfg.cache_ttl_secs))
            .map(|c| c.forecast.clone())
    }

    /// Sanitize a value and weigh it; `None` drops the source for this cycle.
    fn score(
        &self,
        source_id: &str,
        reliability: f64,
        forecast: &RainForecast,
        from_cache: bool,
        now: DateTime<Utc>,
        horizon_cutoff: Duration,
    ) -> Option<WeatherSample> {
        let raw = forecast.rain_next_hour_mm;
        if !raw.is_finite() {
            tracing::warn!("Weather source '{}' returned non-finite rainfall, dropped", source_id);
            return None;
        }
        if raw > self.cfg.max_plausible_mm {
            tracing::warn!(
                "Weather source '{}' reported {} mm/h, above {} mm/h, dropped as outlier",
                source_id,
                raw,
                self.cfg.max_plausible_mm
            );
            return None;
        }
        let value = raw.max(0.0);

        let age = (now - forecast.observed_at).max(Duration::zero());
        if age > horizon_cutoff {
            tracing::debug!("Weather source '{}' observation is {}s old, excluded", source_id, age.num_seconds());
            return None;
        }

        let half_life = self.cfg.staleness_half_life_secs.max(1) as f64;
        let quality = reliability * 0.5_f64.powf(age.num_milliseconds() as f64 / 1000.0 / half_life);
        if quality <= 0.0 || !quality.is_finite() {
            return None;
        }

        Some(WeatherSample {
            source_id: source_id.to_string(),
            ts: forecast.observed_at,
            rain_next_hour_mm: value,
            quality_score: quality,
            from_cache,
        })
    }
}

/// Backoff before retry number `attempt + 1`.
fn backoff(cfg: &WeatherConfig, attempt: u32) -> std::time::Duration {
    let ms = cfg
        .backoff_base_ms
        .saturating_mul(1u64 << attempt.min(20))
        .min(cfg.backoff_max_ms);
    std::time::Duration::from_millis(ms)
}

async fn fetch_with_retry(
    source: &dyn WeatherSource,
    latitude: f64,
    longitude: f64,
    cfg: &WeatherConfig,
) -> Result<RainForecast, SourceFetchError> {
    let attempt_timeout = std::time::Duration::from_millis(cfg.attempt_timeout_ms);
    let mut last_error = SourceFetchError::Unavailable("no attempt made".to_string());

    for attempt in 0..cfg.max_attempts {
        match tokio::time::timeout(attempt_timeout, source.fetch(latitude, longitude)).await {
            Ok(Ok(forecast)) => return Ok(forecast),
            Ok(Err(e)) => last_error = e,
            Err(_) => last_error = SourceFetchError::Timeout(cfg.attempt_timeout_ms),
        }
        tracing::debug!(
            "Weather source '{}' attempt {}/{} failed: {}",
            source.id(),
            attempt + 1,
            cfg.max_attempts,
            last_error
        );
        if attempt + 1 < cfg.max_attempts {
            tokio::time::sleep(backoff(cfg, attempt)).await;
        }
    }
    Err(last_error)
}

/// Weighted median and spread over the scored samples.
fn combine(node_id: &str, now: DateTime<Utc>, samples: &[WeatherSample], quorum: usize) -> ConsensusEstimate {
    if samples.is_empty() {
        return ConsensusEstimate::unavailable(node_id, now);
    }

    let weighted: Vec<(f64, f64)> = samples
        .iter()
        .map(|s| (s.rain_next_hour_mm, s.quality_score))
        .collect();
    let values: Vec<f64> = weighted.iter().map(|(v, _)| *v).collect();

    let any_cached = samples.iter().any(|s| s.from_cache);
    let status = if samples.len() >= quorum && !any_cached {
        ConsensusStatus::Ok
    } else {
        ConsensusStatus::Degraded
    };

    ConsensusEstimate {
        ts: now,
        node_id: node_id.to_string(),
        value: weighted_median(weighted),
        spread: Some(population_std(&values)),
        contributing_sources: samples.iter().map(|s| s.source_id.clone()).collect(),
        status,
    }
}

/// Value where cumulative weight first reaches half the total. When it lands
/// exactly on the half, the two straddling values are averaged.
pub(crate) fn weighted_median(mut items: Vec<(f64, f64)>) -> Option<f64> {
    items.retain(|(v, w)| v.is_finite() && w.is_finite() && *w > 0.0);
    if items.is_empty() {
        return None;
    }
    items.sort_by(|a, b| a.0.total_cmp(&b.0));

    let total: f64 = items.iter().map(|(_, w)| w).sum();
    let half = total / 2.0;
    let mut cumulative = 0.0;
    for (i, (value, weight)) in items.iter().enumerate() {
        cumulative += weight;
        if (cumulative - half).abs() <= 1e-12 * total {
            return Some(match items.get(i + 1) {
                Some((next, _)) => (value + next) / 2.0,
                None => *value,
            });
        }
        if cumulative > half {
            return Some(*value);
        }
    }
    items.last().map(|(v, _)| *v)
}

pub(crate) fn population_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
}

/// Build the aggregator from the enabled source names.
pub fn build_aggregator(config: &AppConfig, cfg: WeatherConfig) -> WeatherAggregator {
    let mut aggregator = WeatherAggregator::new(cfg);
    for name in &config.weather_sources {
        let source: Arc<dyn WeatherSource> = match name.as_str() {
            "yr" => Arc::new(YrSource::new(&config.yr_user_agent)),
            "open_meteo" => Arc::new(OpenMeteoSource::new()),
            "simulator" => Arc::new(SimulatedSource::constant("simulator", config.simulator_rain_mm)),
            other => {
                tracing::warn!("Unknown weather source '{}' in WEATHER_SOURCES, skipped", other);
                continue;
            }
        };
        aggregator.register(source);
    }
    if aggregator.sources.is_empty() {
        tracing::warn!("No weather sources enabled; every consensus will be UNAVAILABLE");
    }
    aggregator
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> WeatherConfig {
        WeatherConfig {
            attempt_timeout_ms: 200,
            backoff_base_ms: 1,
            backoff_max_ms: 4,
            overall_timeout_ms: 2_000,
            ..WeatherConfig::default()
        }
    }

    fn target() -> ConsensusTarget {
        ConsensusTarget {
            node_id: "CM-01".to_string(),
            latitude: 9.4351,
            longitude: 105.4632,
        }
    }

    fn now() -> DateTime<Utc> {
        "2025-11-03T02:00:00Z".parse().unwrap()
    }

    fn aggregator(sources: Vec<SimulatedSource>) -> WeatherAggregator {
        let mut agg = WeatherAggregator::new(fast_config());
        for s in sources {
            agg.register(Arc::new(s));
        }
        agg
    }

    #[test]
    fn test_weighted_median() {
        assert_eq!(weighted_median(vec![]), None);
        assert_eq!(weighted_median(vec![(3.0, 1.0)]), Some(3.0));
        assert_eq!(weighted_median(vec![(1.0, 1.0), (2.0, 1.0), (9.0, 1.0)]), Some(2.0));
        // Heavy low value dominates
        assert_eq!(weighted_median(vec![(1.0, 5.0), (2.0, 1.0), (9.0, 1.0)]), Some(1.0));
        // Exactly half: average of the straddling pair
        assert_eq!(weighted_median(vec![(4.0, 1.0), (2.0, 1.0)]), Some(3.0));
    }

    #[test]
    fn test_population_std() {
        assert_eq!(population_std(&[5.0]), 0.0);
        assert!((population_std(&[2.0, 4.0]) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_backoff_is_capped() {
        let cfg = WeatherConfig::default();
        assert_eq!(backoff(&cfg, 0).as_millis(), 500);
        assert_eq!(backoff(&cfg, 1).as_millis(), 1000);
        assert_eq!(backoff(&cfg, 5).as_millis(), 4000);
    }

    #[tokio::test]
    async fn test_consensus_with_one_failing_source() {
        let agg = aggregator(vec![
            SimulatedSource::constant("a", 4.0),
            SimulatedSource::constant("b", 6.0),
            SimulatedSource::failing("c"),
        ]);
        let est = agg.consensus(&target(), now(), Duration::hours(1)).await;
        assert_eq!(est.status, ConsensusStatus::Ok);
        assert_eq!(est.contributing_sources, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(est.value, Some(5.0));
        assert_eq!(est.spread, Some(1.0));
    }

    #[tokio::test]
    async fn test_all_failing_past_ttl_is_unavailable() {
        let a = Arc::new(SimulatedSource::scripted("a", vec![Some(3.0), None]));
        let b = Arc::new(SimulatedSource::scripted("b", vec![Some(5.0), None]));
        let mut agg = WeatherAggregator::new(WeatherConfig {
            max_attempts: 1,
            ..fast_config()
        });
        agg.register(a);
        agg.register(b);

        let first = agg.consensus(&target(), now(), Duration::hours(1)).await;
        assert_eq!(first.status, ConsensusStatus::Ok);

        // Cache entries are 301 s old: beyond the 300 s TTL
        let later = now() + Duration::seconds(301);
        let est = agg.consensus(&target(), later, Duration::hours(1)).await;
        assert_eq!(est.status, ConsensusStatus::Unavailable);
        assert_eq!(est.value, None);
        assert!(est.contributing_sources.is_empty());
    }

    #[tokio::test]
    async fn test_failure_inside_ttl_serves_cache_degraded() {
        let a = Arc::new(SimulatedSource::scripted("a", vec![Some(3.0), None]));
        let b = Arc::new(SimulatedSource::constant("b", 5.0));
        let mut agg = WeatherAggregator::new(WeatherConfig {
            max_attempts: 1,
            ..fast_config()
        });
        agg.register(a);
        agg.register(b);

        agg.consensus(&target(), now(), Duration::hours(1)).await;
        let report = agg
            .consensus_report(&target(), now() + Duration::seconds(60), Duration::hours(1))
            .await;
        assert_eq!(report.estimate.status, ConsensusStatus::Degraded);
        assert_eq!(report.samples.len(), 2);
        assert!(report.samples.iter().any(|s| s.source_id == "a" && s.from_cache));
    }

    #[tokio::test]
    async fn test_below_quorum_is_degraded() {
        let agg = aggregator(vec![SimulatedSource::constant("a", 2.0)]);
        let est = agg.consensus(&target(), now(), Duration::hours(1)).await;
        assert_eq!(est.status, ConsensusStatus::Degraded);
        assert_eq!(est.value, Some(2.0));
    }

    #[tokio::test]
    async fn test_values_are_clamped_and_outliers_dropped() {
        let agg = aggregator(vec![
            SimulatedSource::constant("neg", -1.0),
            SimulatedSource::constant("huge", 250.0),
            SimulatedSource::constant("ok", 0.0),
        ]);
        let report = agg.consensus_report(&target(), now(), Duration::hours(1)).await;
        assert_eq!(report.estimate.contributing_sources, vec!["neg".to_string(), "ok".to_string()]);
        assert_eq!(report.estimate.value, Some(0.0));
    }

    #[tokio::test]
    async fn test_staleness_weights_and_cutoff() {
        let fresh = SimulatedSource::constant("fresh", 10.0).observed_at(now());
        let old = SimulatedSource::constant("old", 2.0).observed_at(now() - Duration::minutes(20));
        let ancient = SimulatedSource::constant("ancient", 50.0).observed_at(now() - Duration::hours(2));
        let agg = aggregator(vec![fresh, old, ancient]);

        let report = agg.consensus_report(&target(), now(), Duration::hours(1)).await;
        assert_eq!(report.samples.len(), 2);
        let old_sample = report.samples.iter().find(|s| s.source_id == "old").unwrap();
        // Two half-lives
        assert!((old_sample.quality_score - 0.25).abs() < 1e-9);
        assert_eq!(report.estimate.value, Some(10.0));
    }

    #[tokio::test]
    async fn test_hanging_source_hits_deadline() {
        let mut agg = WeatherAggregator::new(WeatherConfig {
            attempt_timeout_ms: 5_000,
            overall_timeout_ms: 100,
            ..fast_config()
        });
        agg.register(Arc::new(SimulatedSource::constant("a", 1.0)));
        agg.register(Arc::new(SimulatedSource::hanging("slow")));

        let est = agg.consensus(&target(), now(), Duration::hours(1)).await;
        assert_eq!(est.contributing_sources, vec!["a".to_string()]);
        assert_eq!(est.status, ConsensusStatus::Degraded);
    }
}
