//! Device registry endpoint.
//!
//! GET /api/v1/devices: every node seen so far with its last report.

use axum::extract::State;
use axum::Json;
use std::sync::Arc;

use crate::db::store::Store;
use crate::domain::DeviceRecord;
use crate::errors::{AppError, ErrorResponse};

/// List registered devices.
#[utoipa::path(
    get,
    path = "/api/v1/devices",
    tag = "Nodes",
    responses(
        (status = 200, description = "Devices ordered by node id", body = Vec<DeviceRecord>),
        (status = 503, description = "Store unavailable", body = ErrorResponse),
    )
)]
pub async fn list_devices(State(store): State<Arc<dyn Store>>) -> Result<Json<Vec<DeviceRecord>>, AppError> {
    Ok(Json(store.list_devices().await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::store::MemoryStore;
    use chrono::Utc;

    #[tokio::test]
    async fn test_lists_upserted_devices() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store
            .upsert_device(&DeviceRecord {
                node_id: "CM-01".to_string(),
                last_seen: Utc::now(),
                batt_v: Some(4.1),
                sensor_height_above_crest_m: Some(0.95),
                status: "ok".to_string(),
            })
            .await
            .unwrap();

        let Json(devices) = list_devices(State(store)).await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].batt_v, Some(4.1));
    }
}
