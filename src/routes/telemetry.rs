//! Telemetry ingress.
//!
//! POST /api/v1/telemetry with the node payload as JSON. The body is read raw
//! so that every malformed payload is reported as a schema error (400).

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use std::sync::Arc;

use crate::errors::{AppError, ErrorResponse};
use crate::services::ingest::{self, TelemetryPayload};
use crate::services::pipeline::{IngestReceipt, NodeRouter};

/// Push one telemetry record.
///
/// Returns once the record has passed QC and is persisted (or buffered while
/// the store is unavailable). Forecasting and alerting follow asynchronously.
#[utoipa::path(
    post,
    path = "/api/v1/telemetry",
    tag = "Telemetry",
    request_body = TelemetryPayload,
    responses(
        (status = 202, description = "Record accepted", body = IngestReceipt),
        (status = 400, description = "Malformed payload", body = ErrorResponse),
        (status = 409, description = "Timestamp not after the node's last accepted record", body = ErrorResponse),
        (status = 503, description = "Node pipeline unavailable", body = ErrorResponse),
    )
)]
pub async fn post_telemetry(
    State(router): State<Arc<NodeRouter>>,
    body: Bytes,
) -> Result<(StatusCode, Json<IngestReceipt>), AppError> {
    let record = ingest::normalize(&body)
        .inspect_err(|e| tracing::warn!("Rejected telemetry payload: {}", e))?;
    let receipt = router.submit(record).await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}
