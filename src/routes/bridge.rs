//! Subscribe-transport bridge.
//!
//! POST /api/v1/bridge/{topic}: a broker's webhook or bridge plugin forwards
//! each message here with its full topic, e.g.
//! `/api/v1/bridge/flood/nodes/CM-01/telemetry`.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

use crate::errors::{AppError, ErrorResponse};
use crate::services::pipeline::IngestReceipt;
use crate::services::subscribe::TopicPublisher;

/// Deliver one message received on a subscribed topic.
#[utoipa::path(
    post,
    path = "/api/v1/bridge/{topic}",
    tag = "Telemetry",
    params(
        ("topic" = String, Path, description = "Full topic, `<namespace>/nodes/<node_id>/telemetry`"),
    ),
    request_body(content = String, description = "Telemetry payload JSON", content_type = "application/json"),
    responses(
        (status = 202, description = "Message accepted", body = IngestReceipt),
        (status = 400, description = "Topic or payload rejected", body = ErrorResponse),
        (status = 409, description = "Timestamp not after the node's last accepted record", body = ErrorResponse),
        (status = 503, description = "Subscription consumer unavailable", body = ErrorResponse),
    )
)]
pub async fn post_bridge_message(
    State(publisher): State<TopicPublisher>,
    Path(topic): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<IngestReceipt>), AppError> {
    let topic = topic.trim_start_matches('/').to_string();
    let receipt = publisher.deliver(topic, body.to_vec()).await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RulesConfig, WeatherConfig};
    use crate::db::store::MemoryStore;
    use crate::services::hydraulic::ProfileRegistry;
    use crate::services::pipeline::{NodeRouter, PipelineContext};
    use crate::services::subscribe;
    use crate::services::weather::WeatherAggregator;
    use std::sync::Arc;

    fn publisher() -> TopicPublisher {
        let router = Arc::new(NodeRouter::new(PipelineContext::new(
            Arc::new(MemoryStore::new()),
            Arc::new(ProfileRegistry::new()),
            Arc::new(WeatherAggregator::new(WeatherConfig::default())),
            Arc::new(RulesConfig::default()),
        )));
        let (publisher, rx) = subscribe::channel();
        tokio::spawn(subscribe::run_subscriber("flood".to_string(), router, rx));
        publisher
    }

    const PAYLOAD: &[u8] =
        br#"{"ts":"2025-11-03T02:00:00Z","node_id":"CM-07","s":{"dist_m":1.2},"meta":{"sensor_height_above_crest_m":1.5}}"#;

    #[tokio::test]
    async fn test_bridge_accepts_matching_topic() {
        let (status, Json(receipt)) = post_bridge_message(
            State(publisher()),
            Path("flood/nodes/CM-07/telemetry".to_string()),
            Bytes::from_static(PAYLOAD),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(receipt.node_id, "CM-07");
    }

    #[tokio::test]
    async fn test_bridge_rejects_foreign_topic() {
        let err = post_bridge_message(
            State(publisher()),
            Path("flood/nodes/CM-08/telemetry".to_string()),
            Bytes::from_static(PAYLOAD),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }
}
