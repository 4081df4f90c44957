//! Ingestion normalizer.
//!
//! Turns raw telemetry bytes from either transport into a typed
//! `TelemetryRecord`. Payload shape:
//!
//! ```json
//! {
//!   "ts": "2025-11-03T09:15:00+07:00",
//!   "node_id": "CM-01",
//!   "s": { "dist_m": 0.83, "rain_bin": 1, "batt_v": 4.92 },
//!   "meta": { "sensor_height_above_crest_m": 0.95 },
//!   "ver": 2
//! }
//! ```
//!
//! Malformed payloads are rejected with a `SchemaError` and never reach QC.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use thiserror::Error;
use utoipa::ToSchema;

use crate::domain::TelemetryRecord;

/// Newest payload version this service understands.
pub const SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SchemaError {
    #[error("payload is not valid telemetry JSON: {0}")]
    Malformed(String),
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("topic '{0}' does not match <namespace>/nodes/<node_id>/telemetry")]
    InvalidTopic(String),
    #[error("topic names node '{topic_node}' but payload names '{payload_node}'")]
    NodeMismatch {
        topic_node: String,
        payload_node: String,
    },
}

/// Telemetry payload as sent by sensor nodes.
#[derive(Debug, Deserialize, ToSchema)]
pub struct TelemetryPayload {
    /// RFC 3339 timestamp with an explicit offset
    #[schema(example = "2025-11-03T09:15:00+07:00")]
    pub ts: Option<String>,
    #[schema(example = "CM-01")]
    pub node_id: Option<String>,
    pub s: Option<SensorReadings>,
    #[serde(default)]
    pub meta: Option<PayloadMeta>,
    #[serde(default)]
    #[schema(example = 2)]
    pub ver: Option<u32>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SensorReadings {
    /// Distance from sensor to water surface, metres
    pub dist_m: Option<f64>,
    /// Rain gauge tipping state, 0 or 1
    #[serde(default)]
    pub rain_bin: Option<i64>,
    #[serde(default)]
    pub batt_v: Option<f64>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct PayloadMeta {
    #[serde(default)]
    pub sensor_height_above_crest_m: Option<f64>,
}

/// Parse and validate one raw payload.
pub fn normalize(raw: &[u8]) -> Result<TelemetryRecord, SchemaError> {
    let payload: TelemetryPayload =
        serde_json::from_slice(raw).map_err(|e| SchemaError::Malformed(e.to_string()))?;
    normalize_payload(payload)
}

/// Validate an already-deserialized payload.
pub fn normalize_payload(payload: TelemetryPayload) -> Result<TelemetryRecord, SchemaError> {
    let ts_raw = payload.ts.ok_or(SchemaError::MissingField("ts"))?;
    let ts = parse_timestamp(&ts_raw)?;

    let node_id = payload
        .node_id
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .ok_or(SchemaError::MissingField("node_id"))?;
    if node_id.contains('/') || node_id.chars().any(char::is_whitespace) {
        return Err(SchemaError::InvalidField {
            field: "node_id",
            reason: "must not contain '/' or whitespace".to_string(),
        });
    }

    let s = payload.s.ok_or(SchemaError::MissingField("s"))?;
    let dist_m = s.dist_m.ok_or(SchemaError::MissingField("s.dist_m"))?;
    non_negative("s.dist_m", dist_m)?;

    let rain_bin = match s.rain_bin {
        None => None,
        Some(v @ (0 | 1)) => Some(v as u8),
        Some(v) => {
            return Err(SchemaError::InvalidField {
                field: "s.rain_bin",
                reason: format!("expected 0 or 1, got {}", v),
            })
        }
    };

    if let Some(v) = s.batt_v {
        non_negative("s.batt_v", v)?;
    }

    let sensor_height = payload.meta.and_then(|m| m.sensor_height_above_crest_m);
    if let Some(v) = sensor_height {
        non_negative("meta.sensor_height_above_crest_m", v)?;
    }

    let schema_version = payload.ver.unwrap_or(SCHEMA_VERSION);
    if schema_version == 0 || schema_version > SCHEMA_VERSION {
        return Err(SchemaError::InvalidField {
            field: "ver",
            reason: format!("unsupported schema version {}", schema_version),
        });
    }

    Ok(TelemetryRecord {
        ts,
        node_id,
        dist_m,
        rain_bin,
        batt_v: s.batt_v,
        sensor_height_above_crest_m: sensor_height,
        schema_version,
    })
}

/// Extract the node id from `<namespace>/nodes/<node_id>/telemetry`.
pub fn node_from_topic<'a>(namespace: &str, topic: &'a str) -> Result<&'a str, SchemaError> {
    let invalid = || SchemaError::InvalidTopic(topic.to_string());
    let rest = topic
        .strip_prefix(namespace)
        .and_then(|r| r.strip_prefix("/nodes/"))
        .ok_or_else(invalid)?;
    let node = rest.strip_suffix("/telemetry").ok_or_else(invalid)?;
    if node.is_empty() || node.contains('/') {
        return Err(invalid());
    }
    Ok(node)
}

/// Normalize a message received on a subscribe topic.
///
/// The topic's node id must agree with the payload's.
pub fn normalize_topic_message(
    namespace: &str,
    topic: &str,
    raw: &[u8],
) -> Result<TelemetryRecord, SchemaError> {
    let topic_node = node_from_topic(namespace, topic)?;
    let record = normalize(raw)?;
    if record.node_id != topic_node {
        return Err(SchemaError::NodeMismatch {
            topic_node: topic_node.to_string(),
            payload_node: record.node_id,
        });
    }
    Ok(record)
}

/// Reject records stamped further ahead of `now` than the allowed skew.
///
/// A node with a runaway clock would otherwise push its last accepted
/// timestamp into the future and lock out every later record.
pub fn check_clock_skew(record: &TelemetryRecord, now: DateTime<Utc>, max_skew: Duration) -> Result<(), SchemaError> {
    let limit = now + max_skew;
    if record.ts > limit {
        return Err(SchemaError::InvalidField {
            field: "ts",
            reason: format!("{} is ahead of the service clock (latest accepted {})", record.ts, limit),
        });
    }
    Ok(())
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, SchemaError> {
    // RFC 3339 requires an offset, so naive timestamps fail here
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SchemaError::InvalidField {
            field: "ts",
            reason: format!("'{}' is not an RFC 3339 timestamp with offset ({})", raw, e),
        })
}

fn non_negative(field: &'static str, v: f64) -> Result<(), SchemaError> {
    if !v.is_finite() || v < 0.0 {
        return Err(SchemaError::InvalidField {
            field,
            reason: format!("expected a non-negative finite number, got {}", v),
        });
    }
    Ok(())
}
