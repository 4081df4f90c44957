use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::db::store::Store;
use crate::services::pipeline::NodeRouter;

/// Shared state for the health endpoint.
#[derive(Clone)]
pub(crate) struct HealthState {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) router: Arc<NodeRouter>,
}

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Service status ("ok" when healthy, "degraded" when the store is unreachable)
    pub status: String,
    /// API version
    pub version: String,
    /// Whether the store is reachable
    pub database: bool,
    /// Nodes with a running pipeline
    pub active_nodes: usize,
    /// Enabled weather sources
    pub weather_sources: Vec<String>,
    /// Version of the loaded rules
    pub rules_version: u32,
}

/// Health check endpoint.
///
/// Returns the API status and version. Verifies store connectivity.
/// Returns status "degraded" (still 200) if the store is unreachable,
/// so load balancers can distinguish partial failures.
#[utoipa::path(
    get,
    path = "/api/v1/health",
    tag = "Health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
    )
)]
pub async fn health_check(State(state): State<HealthState>) -> Json<HealthResponse> {
    let db_ok = state.store.ping().await.is_ok();
    let ctx = state.router.context();

    Json(HealthResponse {
        status: if db_ok {
            "ok".to_string()
        } else {
            "degraded".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        database: db_ok,
        active_nodes: state.router.known_nodes().len(),
        weather_sources: ctx.aggregator.source_ids(),
        rules_version: ctx.rules.version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RulesConfig, WeatherConfig};
    use crate::db::store::MemoryStore;
    use crate::services::hydraulic::ProfileRegistry;
    use crate::services::pipeline::PipelineContext;
    use crate::services::weather::WeatherAggregator;

    fn state(store: Arc<MemoryStore>) -> HealthState {
        let router = NodeRouter::new(PipelineContext::new(
            store.clone(),
            Arc::new(ProfileRegistry::new()),
            Arc::new(WeatherAggregator::new(WeatherConfig::default())),
            Arc::new(RulesConfig::default()),
        ));
        HealthState {
            store,
            router: Arc::new(router),
        }
    }

    #[tokio::test]
    async fn test_health_ok() {
        let Json(health) = health_check(State(state(Arc::new(MemoryStore::new())))).await;
        assert_eq!(health.status, "ok");
        assert!(health.database);
        assert_eq!(health.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(health.rules_version, 1);
    }

    #[tokio::test]
    async fn test_health_degraded_when_store_down() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let Json(health) = health_check(State(state(store))).await;
        assert_eq!(health.status, "degraded");
        assert!(!health.database);
    }
}
