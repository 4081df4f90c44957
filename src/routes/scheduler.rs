//! Re-evaluation scheduler status.
//!
//! GET /api/v1/scheduler/status: the background loop's cadence and last cycle,
//! with a health digest (overdue cycle, failing nodes, writes waiting for the
//! store). `?node_id=` narrows the per-node list to one node.

use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::errors::{AppError, ErrorResponse};
use crate::services::scheduler::{NodeEvaluationStatus, SchedulerState, SharedSchedulerState};

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct SchedulerStatusQuery {
    /// Only report this node
    pub node_id: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SchedulerStatus {
    pub active: bool,
    pub interval_secs: u64,
    pub next_wakeup_at: Option<DateTime<Utc>>,
    /// The expected wakeup is more than one interval in the past
    pub overdue: bool,
    pub last_cycle_completed_at: Option<DateTime<Utc>>,
    pub last_cycle_duration_ms: Option<u64>,
    pub total_cycles: u64,
    /// Listed nodes whose last re-evaluation failed
    pub failing_nodes: usize,
    /// Writes the listed nodes hold until the store is back
    pub buffered_writes: usize,
    pub nodes: Vec<NodeEvaluationStatus>,
}

impl SchedulerStatus {
    fn build(state: &SchedulerState, node_id: Option<&str>, now: DateTime<Utc>) -> Result<Self, AppError> {
        let nodes: Vec<NodeEvaluationStatus> = match node_id {
            Some(id) => {
                let node = state
                    .nodes
                    .iter()
                    .find(|n| n.node_id == id)
                    .ok_or_else(|| AppError::NotFound(format!("Node {} has not been scheduled", id)))?;
                vec![node.clone()]
            }
            None => state.nodes.clone(),
        };

        let grace = Duration::seconds(state.interval_secs as i64);
        Ok(Self {
            active: state.active,
            interval_secs: state.interval_secs,
            next_wakeup_at: state.next_wakeup_at,
            overdue: state.active && state.next_wakeup_at.is_some_and(|at| now - at > grace),
            last_cycle_completed_at: state.last_cycle_completed_at,
            last_cycle_duration_ms: state.last_cycle_duration_ms,
            total_cycles: state.total_cycles,
            failing_nodes: nodes.iter().filter(|n| n.last_result.starts_with("error")).count(),
            buffered_writes: nodes.iter().map(|n| n.buffered_writes).sum(),
            nodes,
        })
    }
}

/// Current scheduler status.
#[utoipa::path(
    get,
    path = "/api/v1/scheduler/status",
    tag = "Scheduler",
    params(SchedulerStatusQuery),
    responses(
        (status = 200, description = "Current scheduler status", body = SchedulerStatus),
        (status = 404, description = "Node not covered by the last cycle", body = ErrorResponse),
    )
)]
pub async fn get_scheduler_status(
    State(state): State<SharedSchedulerState>,
    Query(query): Query<SchedulerStatusQuery>,
) -> Result<Json<SchedulerStatus>, AppError> {
    let s = state.read().await;
    Ok(Json(SchedulerStatus::build(&s, query.node_id.as_deref(), Utc::now())?))
}
