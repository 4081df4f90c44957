//! Background re-evaluation scheduler.
//!
//! Forecasts and alerts are normally driven by incoming telemetry. A quiet node
//! would then keep its last forecast even while the rain outlook changes, so
//! this loop asks every known node to re-evaluate at a fixed cadence. Nodes
//! are re-evaluated concurrently; a cycle lasts as long as its slowest node.
//!
//! State is in-memory (`Arc<RwLock<SchedulerState>>`) and exposed by the
//! status endpoint.

use chrono::{DateTime, Duration, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use utoipa::ToSchema;

use super::pipeline::{EvaluationSummary, NodeRouter, PipelineError};
use crate::domain::ConsensusStatus;

/// Shortest cadence accepted from configuration (seconds).
const SCHEDULER_MIN_INTERVAL_SECS: u64 = 10;

/// Last evaluation outcome of a single node.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct NodeEvaluationStatus {
    pub node_id: String,
    pub last_evaluated_at: DateTime<Utc>,
    /// "evaluated", "skipped", or "error: ..."
    pub last_result: String,
    pub consensus_status: Option<ConsensusStatus>,
    pub forecasts: usize,
    pub alerts: usize,
    pub buffered_writes: usize,
}

/// Global scheduler state, read by the status endpoint.
#[derive(Debug, Clone)]
pub struct SchedulerState {
    pub active: bool,
    pub interval_secs: u64,
    pub next_wakeup_at: Option<DateTime<Utc>>,
    pub last_cycle_completed_at: Option<DateTime<Utc>>,
    pub last_cycle_duration_ms: Option<u64>,
    pub total_cycles: u64,
    pub nodes: Vec<NodeEvaluationStatus>,
}

impl SchedulerState {
    pub fn new(interval_secs: u64) -> Self {
        Self {
            active: true,
            interval_secs: effective_interval(interval_secs),
            next_wakeup_at: None,
            last_cycle_completed_at: None,
            last_cycle_duration_ms: None,
            total_cycles: 0,
            nodes: Vec::new(),
        }
    }
}

/// Shared scheduler state handle.
pub type SharedSchedulerState = Arc<RwLock<SchedulerState>>;

fn effective_interval(interval_secs: u64) -> u64 {
    interval_secs.max(SCHEDULER_MIN_INTERVAL_SECS)
}

fn node_status(
    node_id: String,
    now: DateTime<Utc>,
    result: Result<EvaluationSummary, PipelineError>,
) -> NodeEvaluationStatus {
    match result {
        Ok(summary) => NodeEvaluationStatus {
            node_id,
            last_evaluated_at: now,
            last_result: if summary.skipped { "skipped" } else { "evaluated" }.to_string(),
            consensus_status: summary.consensus_status,
            forecasts: summary.forecasts,
            alerts: summary.alerts,
            buffered_writes: summary.buffered_writes,
        },
        Err(e) => {
            tracing::error!("Scheduler: re-evaluation of {} failed: {}", node_id, e);
            NodeEvaluationStatus {
                node_id,
                last_evaluated_at: now,
                last_result: format!("error: {}", e),
                consensus_status: None,
                forecasts: 0,
                alerts: 0,
                buffered_writes: 0,
            }
        }
    }
}

/// Re-evaluate every known node once at `now`.
pub async fn run_cycle(router: &NodeRouter, state: &SharedSchedulerState, now: DateTime<Utc>) {
    let started = std::time::Instant::now();
    let mut pending: FuturesUnordered<_> = router
        .known_nodes()
        .into_iter()
        .map(|node_id| async move {
            let result = router.reevaluate(&node_id, now).await;
            node_status(node_id, now, result)
        })
        .collect();

    let mut statuses = Vec::with_capacity(pending.len());
    while let Some(status) = pending.next().await {
        statuses.push(status);
    }
    statuses.sort_by(|a, b| a.node_id.cmp(&b.node_id));

    let duration_ms = started.elapsed().as_millis() as u64;
    tracing::debug!(
        "Scheduler: evaluated {} node(s) in {} ms",
        statuses.len(),
        duration_ms
    );

    let mut s = state.write().await;
    s.nodes = statuses;
    s.total_cycles += 1;
    s.last_cycle_completed_at = Some(Utc::now());
    s.last_cycle_duration_ms = Some(duration_ms);
}

/// Run the scheduler. This function never returns (runs until process exit).
///
/// Should be spawned via `tokio::spawn(run_scheduler(...))`.
pub async fn run_scheduler(router: Arc<NodeRouter>, state: SharedSchedulerState) {
    let interval_secs = state.read().await.interval_secs;
    tracing::info!("Evaluation scheduler started (every {} s)", interval_secs);

    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; nodes have just been registered
    ticker.tick().await;

    loop {
        state.write().await.next_wakeup_at = Some(Utc::now() + Duration::seconds(interval_secs as i64));
        ticker.tick().await;
        run_cycle(&router, &state, Utc::now()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RulesConfig, WeatherConfig};
    use crate::db::store::{MemoryStore, Store};
    use crate::domain::TelemetryRecord;
    use crate::services::hydraulic::ProfileRegistry;
    use crate::services::pipeline::PipelineContext;
    use crate::services::weather::{SimulatedSource, WeatherAggregator};

    fn t0() -> DateTime<Utc> {
        "2025-11-03T02:00:00Z".parse().unwrap()
    }

    fn router(store: Arc<MemoryStore>) -> NodeRouter {
        let mut aggregator = WeatherAggregator::new(WeatherConfig::default());
        aggregator.register(Arc::new(SimulatedSource::constant("sim", 1.0).observed_at(t0())));
        router_with(store, aggregator)
    }

    fn router_with(store: Arc<MemoryStore>, aggregator: WeatherAggregator) -> NodeRouter {
        NodeRouter::new(PipelineContext::new(
            store,
            Arc::new(ProfileRegistry::new()),
            Arc::new(aggregator),
            Arc::new(RulesConfig::default()),
        ))
    }

    #[test]
    fn test_interval_has_a_floor() {
        assert_eq!(SchedulerState::new(1).interval_secs, SCHEDULER_MIN_INTERVAL_SECS);
        assert_eq!(SchedulerState::new(600).interval_secs, 600);
    }

    #[tokio::test]
    async fn test_cycle_evaluates_known_nodes() {
        let store = Arc::new(MemoryStore::new());
        let router = router(store.clone());
        router
            .submit(TelemetryRecord {
                ts: t0(),
                node_id: "CM-02".to_string(),
                dist_m: 0.8,
                rain_bin: Some(0),
                batt_v: None,
                sensor_height_above_crest_m: Some(0.95),
                schema_version: 2,
            })
            .await
            .unwrap();

        let state: SharedSchedulerState = Arc::new(RwLock::new(SchedulerState::new(600)));
        run_cycle(&router, &state, t0() + Duration::minutes(10)).await;

        let s = state.read().await;
        assert_eq!(s.total_cycles, 1);
        assert_eq!(s.nodes.len(), 1);
        assert_eq!(s.nodes[0].node_id, "CM-02");
        assert_eq!(s.nodes[0].last_result, "evaluated");
        // One source against a quorum of two
        assert_eq!(s.nodes[0].consensus_status, Some(ConsensusStatus::Degraded));

        let forecasts = store
            .forecast_range("CM-02", t0(), t0() + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(forecasts.len(), 4);
    }

    #[tokio::test]
    async fn test_cycle_with_no_nodes() {
        let router = router(Arc::new(MemoryStore::new()));
        let state: SharedSchedulerState = Arc::new(RwLock::new(SchedulerState::new(600)));
        run_cycle(&router, &state, t0()).await;
        let s = state.read().await;
        assert_eq!(s.total_cycles, 1);
        assert!(s.nodes.is_empty());
    }

    #[tokio::test]
    async fn test_cycle_runs_nodes_concurrently() {
        let mut aggregator = WeatherAggregator::new(WeatherConfig {
            overall_timeout_ms: 600,
            ..WeatherConfig::default()
        });
        aggregator.register(Arc::new(SimulatedSource::hanging("stuck")));
        let router = router_with(Arc::new(MemoryStore::new()), aggregator);
        for node_id in ["CM-03", "CM-01", "CM-02"] {
            router.register(node_id);
        }

        let state: SharedSchedulerState = Arc::new(RwLock::new(SchedulerState::new(600)));
        let started = std::time::Instant::now();
        run_cycle(&router, &state, t0()).await;
        // Each node waits out the weather deadline once
        assert!(started.elapsed() < std::time::Duration::from_millis(1200));

        let s = state.read().await;
        let ids: Vec<&str> = s.nodes.iter().map(|n| n.node_id.as_str()).collect();
        assert_eq!(ids, vec!["CM-01", "CM-02", "CM-03"]);
        assert!(s.nodes.iter().all(|n| n.last_result == "evaluated"));
    }
}
