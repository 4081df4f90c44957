//! Calibration import.
//!
//! POST /api/v1/nodes/:node_id/calibration with (H, Q) samples, either a JSON
//! array of `{"H": .., "Q": ..}` objects or a delimited table with an `H,Q`
//! header. A successful fit becomes the node's active profile.

use axum::extract::{Path, State};
use axum::Json;
use std::sync::Arc;

use crate::errors::{AppError, ErrorResponse};
use crate::services::calibration::{self, CalibrationReport, CalibrationService};

/// Fit and activate a head→discharge profile.
#[utoipa::path(
    post,
    path = "/api/v1/nodes/{node_id}/calibration",
    tag = "Calibration",
    params(
        ("node_id" = String, Path, description = "Sensor node id"),
    ),
    request_body(content = String, description = "Samples as CSV (`H,Q` header) or a JSON array", content_type = "text/csv"),
    responses(
        (status = 200, description = "Fit accepted and activated", body = CalibrationReport),
        (status = 400, description = "Samples could not be read", body = ErrorResponse),
        (status = 409, description = "A fit for this node is already running", body = ErrorResponse),
        (status = 422, description = "Too few usable samples or R² below the minimum", body = ErrorResponse),
        (status = 503, description = "Profile could not be persisted", body = ErrorResponse),
    )
)]
pub async fn post_calibration(
    State(service): State<Arc<CalibrationService>>,
    Path(node_id): Path<String>,
    body: String,
) -> Result<Json<CalibrationReport>, AppError> {
    let samples = calibration::parse_samples(&body)?;
    tracing::info!("Calibration import for {}: {} sample row(s)", node_id, samples.len());
    Ok(Json(service.calibrate(&node_id, samples).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RulesConfig;
    use crate::db::store::MemoryStore;
    use crate::services::hydraulic::ProfileRegistry;

    fn service() -> (Arc<CalibrationService>, Arc<ProfileRegistry>) {
        let profiles = Arc::new(ProfileRegistry::new());
        let service = CalibrationService::new(
            Arc::new(MemoryStore::new()),
            profiles.clone(),
            Arc::new(RulesConfig::default()),
        );
        (Arc::new(service), profiles)
    }

    #[tokio::test]
    async fn test_exact_power_law_csv() {
        let (service, profiles) = service();
        // Q = 2 · (H − 0.1)^1.5
        let body: String = std::iter::once("H,Q".to_string())
            .chain((1..=8).map(|i| {
                let h = 0.1 + 0.05 * i as f64;
                format!("{:.3},{:.6}", h, 2.0 * (h - 0.1_f64).powf(1.5))
            }))
            .collect::<Vec<_>>()
            .join("\n");

        let Json(report) = post_calibration(State(service), Path("CM-01".to_string()), body)
            .await
            .unwrap();
        assert!(report.fit.r_squared > 0.99);
        assert!((profiles.get("CM-01").unwrap().b - 1.5).abs() < 0.05);
    }

    #[tokio::test]
    async fn test_too_few_samples_is_unprocessable() {
        let (service, profiles) = service();
        let err = post_calibration(
            State(service),
            Path("CM-01".to_string()),
            "H,Q\n0.2,0.1\n0.3,0.3\n".to_string(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Unprocessable(_)));
        assert!(profiles.get("CM-01").is_none());
    }

    #[tokio::test]
    async fn test_unreadable_body_is_bad_request() {
        let (service, _) = service();
        let err = post_calibration(State(service), Path("CM-01".to_string()), "not a table".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }
}
