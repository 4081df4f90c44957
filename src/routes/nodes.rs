//! Per-node read-only endpoints.
//!
//! - GET /api/v1/nodes/:node_id/telemetry?from&to
//! - GET /api/v1/nodes/:node_id/forecasts?from&to
//! - GET /api/v1/nodes/:node_id/alerts?from&to
//! - GET /api/v1/nodes/:node_id/profile
//! - GET /api/v1/nodes/:node_id/consensus

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{Duration, Utc};
use std::sync::Arc;

use super::RangeQuery;
use crate::config::RulesConfig;
use crate::db::store::Store;
use crate::domain::{AlertEvent, ForecastRecord, HqProfile, TelemetryObservation};
use crate::errors::{AppError, ErrorResponse};
use crate::services::hydraulic::ProfileRegistry;
use crate::services::pipeline::consensus_target;
use crate::services::weather::{ConsensusReport, WeatherAggregator};

/// Shared state for the node endpoints.
#[derive(Clone)]
pub(crate) struct NodesState {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) profiles: Arc<ProfileRegistry>,
    pub(crate) aggregator: Arc<WeatherAggregator>,
    pub(crate) rules: Arc<RulesConfig>,
}

/// Accepted telemetry of a node with derived values and QC flags.
#[utoipa::path(
    get,
    path = "/api/v1/nodes/{node_id}/telemetry",
    tag = "Nodes",
    params(
        ("node_id" = String, Path, description = "Sensor node id"),
        RangeQuery,
    ),
    responses(
        (status = 200, description = "Observations, oldest first", body = Vec<TelemetryObservation>),
        (status = 400, description = "Invalid range", body = ErrorResponse),
        (status = 503, description = "Store unavailable", body = ErrorResponse),
    )
)]
pub async fn get_node_telemetry(
    State(state): State<NodesState>,
    Path(node_id): Path<String>,
    Query(range): Query<RangeQuery>,
) -> Result<Json<Vec<TelemetryObservation>>, AppError> {
    let (from, to) = range.resolve(Utc::now())?;
    Ok(Json(state.store.telemetry_range(&node_id, from, to).await?))
}

/// Forecast records of a node, every horizon.
#[utoipa::path(
    get,
    path = "/api/v1/nodes/{node_id}/forecasts",
    tag = "Nodes",
    params(
        ("node_id" = String, Path, description = "Sensor node id"),
        RangeQuery,
    ),
    responses(
        (status = 200, description = "Forecasts, oldest first", body = Vec<ForecastRecord>),
        (status = 400, description = "Invalid range", body = ErrorResponse),
        (status = 503, description = "Store unavailable", body = ErrorResponse),
    )
)]
pub async fn get_node_forecasts(
    State(state): State<NodesState>,
    Path(node_id): Path<String>,
    Query(range): Query<RangeQuery>,
) -> Result<Json<Vec<ForecastRecord>>, AppError> {
    let (from, to) = range.resolve(Utc::now())?;
    Ok(Json(state.store.forecast_range(&node_id, from, to).await?))
}

/// Alert events raised within the range.
#[utoipa::path(
    get,
    path = "/api/v1/nodes/{node_id}/alerts",
    tag = "Nodes",
    params(
        ("node_id" = String, Path, description = "Sensor node id"),
        RangeQuery,
    ),
    responses(
        (status = 200, description = "Alert events by raise time", body = Vec<AlertEvent>),
        (status = 400, description = "Invalid range", body = ErrorResponse),
        (status = 503, description = "Store unavailable", body = ErrorResponse),
    )
)]
pub async fn get_node_alerts(
    State(state): State<NodesState>,
    Path(node_id): Path<String>,
    Query(range): Query<RangeQuery>,
) -> Result<Json<Vec<AlertEvent>>, AppError> {
    let (from, to) = range.resolve(Utc::now())?;
    Ok(Json(state.store.alert_range(&node_id, from, to).await?))
}

/// The active H–Q profile of a node.
#[utoipa::path(
    get,
    path = "/api/v1/nodes/{node_id}/profile",
    tag = "Calibration",
    params(
        ("node_id" = String, Path, description = "Sensor node id"),
    ),
    responses(
        (status = 200, description = "Active profile", body = HqProfile),
        (status = 404, description = "Node has never been calibrated", body = ErrorResponse),
    )
)]
pub async fn get_node_profile(
    State(state): State<NodesState>,
    Path(node_id): Path<String>,
) -> Result<Json<HqProfile>, AppError> {
    state
        .profiles
        .get(&node_id)
        .map(|p| Json(p.as_ref().clone()))
        .ok_or_else(|| AppError::NotFound(format!("No calibration profile for node {}", node_id)))
}

/// Current rainfall consensus at the node's site, with per-source samples.
///
/// Fetches live; a status of `UNAVAILABLE` carries no value.
#[utoipa::path(
    get,
    path = "/api/v1/nodes/{node_id}/consensus",
    tag = "Weather",
    params(
        ("node_id" = String, Path, description = "Sensor node id"),
    ),
    responses(
        (status = 200, description = "Consensus and contributing samples", body = ConsensusReport),
    )
)]
pub async fn get_node_consensus(
    State(state): State<NodesState>,
    Path(node_id): Path<String>,
) -> Json<ConsensusReport> {
    let target = consensus_target(&state.rules, &node_id);
    let cutoff = Duration::seconds(state.rules.weather.horizon_cutoff_secs);
    Json(state.aggregator.consensus_report(&target, Utc::now(), cutoff).await)
}
