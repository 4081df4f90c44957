//! Domain types shared across the pipeline stages.
//!
//! Everything here is plain data: records accepted from the field, the values
//! derived from them, and the events the alert state machine emits. Mutable
//! per-node working state lives in `services::pipeline`, not here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;
use uuid::Uuid;

/// A normalized telemetry record from one sensor node.
///
/// Immutable once accepted. Per node, `ts` strictly increases across accepted
/// records.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct TelemetryRecord {
    /// Measurement instant (the payload's offset is applied, stored as UTC)
    pub ts: DateTime<Utc>,
    pub node_id: String,
    /// Distance from the ultrasonic sensor down to the water surface, metres
    pub dist_m: f64,
    /// Rain gauge tipping state (0 or 1)
    pub rain_bin: Option<u8>,
    /// Battery voltage
    pub batt_v: Option<f64>,
    /// Sensor mounting height above the weir crest, metres (overrides the registry)
    pub sensor_height_above_crest_m: Option<f64>,
    pub schema_version: u32,
}

/// Quality-control tag attached to a telemetry record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QcFlag {
    OutOfRangeDist,
    NegH,
    SpikesH,
    OutOfRangeQ,
}

impl QcFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            QcFlag::OutOfRangeDist => "OUT_OF_RANGE_DIST",
            QcFlag::NegH => "NEG_H",
            QcFlag::SpikesH => "SPIKES_H",
            QcFlag::OutOfRangeQ => "OUT_OF_RANGE_Q",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "OUT_OF_RANGE_DIST" => Some(QcFlag::OutOfRangeDist),
            "NEG_H" => Some(QcFlag::NegH),
            "SPIKES_H" => Some(QcFlag::SpikesH),
            "OUT_OF_RANGE_Q" => Some(QcFlag::OutOfRangeQ),
            _ => None,
        }
    }
}

/// Ordered, duplicate-free set of QC flags.
///
/// Stored as a `|`-joined string (e.g. `"OUT_OF_RANGE_DIST|NEG_H"`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct QcFlags(Vec<QcFlag>);

impl QcFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, flag: QcFlag) {
        if let Err(pos) = self.0.binary_search(&flag) {
            self.0.insert(pos, flag);
        }
    }

    pub fn contains(&self, flag: QcFlag) -> bool {
        self.0.binary_search(&flag).is_ok()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QcFlag> {
        self.0.iter()
    }

    /// Parse the stored `|`-joined form. Unknown tags are dropped.
    pub fn from_joined(s: &str) -> Self {
        let mut flags = Self::new();
        for part in s.split('|').filter(|p| !p.is_empty()) {
            match QcFlag::parse(part) {
                Some(f) => flags.insert(f),
                None => tracing::warn!("Ignoring unknown QC flag '{}'", part),
            }
        }
        flags
    }
}

impl fmt::Display for QcFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<&str> = self.0.iter().map(QcFlag::as_str).collect();
        write!(f, "{}", joined.join("|"))
    }
}

/// The active head→discharge calibration for a node: `Q = a · (H − H0)^b`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct HqProfile {
    pub node_id: String,
    pub a: f64,
    pub b: f64,
    pub h0_m: f64,
    pub r_squared: f64,
    pub rmse: f64,
    pub fitted_at: DateTime<Utc>,
}

/// Hydraulic quantities derived from one distance reading.
///
/// `h_m` is `None` when no sensor height is known for the node. `q_m3s` is
/// `None` (undefined, not zero) when the node has no active profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, ToSchema)]
pub struct HydraulicState {
    pub h_m: Option<f64>,
    pub h_eff_m: Option<f64>,
    pub q_m3s: Option<f64>,
}

/// A telemetry record together with everything derived from it on acceptance.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct TelemetryObservation {
    pub record: TelemetryRecord,
    pub hydraulic: HydraulicState,
    /// Head change against the sample ~10 minutes earlier, metres
    pub dh_10m: Option<f64>,
    pub flags: QcFlags,
}

/// Health of a consensus estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsensusStatus {
    Ok,
    Degraded,
    Unavailable,
}

impl ConsensusStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsensusStatus::Ok => "OK",
            ConsensusStatus::Degraded => "DEGRADED",
            ConsensusStatus::Unavailable => "UNAVAILABLE",
        }
    }
}

/// Quality-weighted rainfall consensus across weather sources.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct ConsensusEstimate {
    pub ts: DateTime<Utc>,
    pub node_id: String,
    /// Rain expected over the next hour, mm. Absent when `UNAVAILABLE`.
    pub value: Option<f64>,
    pub spread: Option<f64>,
    pub contributing_sources: Vec<String>,
    pub status: ConsensusStatus,
}

impl ConsensusEstimate {
    pub fn unavailable(node_id: &str, ts: DateTime<Utc>) -> Self {
        Self {
            ts,
            node_id: node_id.to_string(),
            value: None,
            spread: None,
            contributing_sources: Vec::new(),
            status: ConsensusStatus::Unavailable,
        }
    }
}

/// Confidence tag on a forecast record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Normal,
    Degraded,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Normal => "normal",
            Confidence::Degraded => "degraded",
        }
    }
}

/// Flood-risk forecast for one node and horizon at one evaluation instant.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct ForecastRecord {
    pub node_id: String,
    /// Lead time in hours
    pub horizon_h: u32,
    pub ts: DateTime<Utc>,
    pub probability: f64,
    pub predicted_q_m3s: Option<f64>,
    pub confidence: Confidence,
    pub consensus_status: ConsensusStatus,
}

/// Alert severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
pub enum AlertLevel {
    Normal,
    Early,
    High,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Normal => "Normal",
            AlertLevel::Early => "Early",
            AlertLevel::High => "High",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Normal" => Some(AlertLevel::Normal),
            "Early" => Some(AlertLevel::Early),
            "High" => Some(AlertLevel::High),
            _ => None,
        }
    }
}

/// A committed alert transition.
///
/// Promotions and downgrades open a new event (`raised_at` set). Demotion to
/// `Normal` re-emits the open event with `cleared_at` set, under the same id.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct AlertEvent {
    pub id: Uuid,
    pub node_id: String,
    pub horizon_h: u32,
    pub level: AlertLevel,
    pub previous_level: AlertLevel,
    pub raised_at: DateTime<Utc>,
    pub cleared_at: Option<DateTime<Utc>>,
    /// Which rule committed the transition
    pub reason: String,
}

/// Device registry entry, refreshed on every accepted record.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct DeviceRecord {
    pub node_id: String,
    pub last_seen: DateTime<Utc>,
    pub batt_v: Option<f64>,
    pub sensor_height_above_crest_m: Option<f64>,
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qc_flags_sorted_and_deduplicated() {
        let mut flags = QcFlags::new();
        flags.insert(QcFlag::SpikesH);
        flags.insert(QcFlag::OutOfRangeDist);
        flags.insert(QcFlag::SpikesH);
        assert_eq!(flags.to_string(), "OUT_OF_RANGE_DIST|SPIKES_H");
    }

    #[test]
    fn test_qc_flags_from_joined() {
        let flags = QcFlags::from_joined("NEG_H|BOGUS|OUT_OF_RANGE_Q");
        assert!(flags.contains(QcFlag::NegH));
        assert!(flags.contains(QcFlag::OutOfRangeQ));
        assert!(!flags.contains(QcFlag::SpikesH));
        assert!(QcFlags::from_joined("").is_empty());
    }

    #[test]
    fn test_alert_level_ordering() {
        assert!(AlertLevel::Normal < AlertLevel::Early);
        assert!(AlertLevel::Early < AlertLevel::High);
        assert_eq!(AlertLevel::parse("High"), Some(AlertLevel::High));
        assert_eq!(AlertLevel::parse("high"), None);
    }

    #[test]
    fn test_qc_flags_serialize_as_tag_list() {
        let mut flags = QcFlags::new();
        flags.insert(QcFlag::NegH);
        let json = serde_json::to_value(&flags).unwrap();
        assert_eq!(json, serde_json::json!(["NEG_H"]));
    }
}
