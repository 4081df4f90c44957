use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::FromRow;
use uuid::Uuid;

use crate::domain::{
    AlertEvent, AlertLevel, Confidence, ConsensusStatus, DeviceRecord, ForecastRecord,
    HqProfile, HydraulicState, QcFlags, TelemetryObservation, TelemetryRecord,
};
use crate::helpers::{dec_to_f64, opt_dec_to_f64};

/// An accepted telemetry record with its derived hydraulic values and QC flags.
#[derive(Debug, Clone, FromRow)]
pub struct TelemetryRow {
    pub node_id: String,
    pub ts: DateTime<Utc>,
    pub dist_m: Decimal,
    pub rain_bin: Option<i16>,
    pub batt_v: Option<Decimal>,
    pub sensor_height_above_crest_m: Option<Decimal>,
    pub schema_version: i32,
    pub h_m: Option<Decimal>,
    pub h_eff_m: Option<Decimal>,
    pub q_m3s: Option<Decimal>,
    pub dh_10m: Option<Decimal>,
    /// `|`-joined QC flags, empty when clean
    pub flags: String,
}

impl From<TelemetryRow> for TelemetryObservation {
    fn from(r: TelemetryRow) -> Self {
        Self {
            record: TelemetryRecord {
                ts: r.ts,
                node_id: r.node_id,
                dist_m: dec_to_f64(r.dist_m),
                rain_bin: r.rain_bin.map(|v| v.clamp(0, 1) as u8),
                batt_v: opt_dec_to_f64(r.batt_v),
                sensor_height_above_crest_m: opt_dec_to_f64(r.sensor_height_above_crest_m),
                schema_version: r.schema_version.max(0) as u32,
            },
            hydraulic: HydraulicState {
                h_m: opt_dec_to_f64(r.h_m),
                h_eff_m: opt_dec_to_f64(r.h_eff_m),
                q_m3s: opt_dec_to_f64(r.q_m3s),
            },
            dh_10m: opt_dec_to_f64(r.dh_10m),
            flags: QcFlags::from_joined(&r.flags),
        }
    }
}

/// One forecast evaluation for a (node, horizon).
#[derive(Debug, Clone, FromRow)]
#[allow(dead_code)] // id/created_at populated by FromRow, not surfaced in the domain record
pub struct ForecastRow {
    pub id: Uuid,
    pub node_id: String,
    pub horizon_h: i32,
    pub ts: DateTime<Utc>,
    pub probability: Decimal,
    pub predicted_q_m3s: Option<Decimal>,
    pub confidence: String,
    pub consensus_status: String,
    pub created_at: DateTime<Utc>,
}

impl From<ForecastRow> for ForecastRecord {
    fn from(r: ForecastRow) -> Self {
        Self {
            node_id: r.node_id,
            horizon_h: r.horizon_h.max(0) as u32,
            ts: r.ts,
            probability: dec_to_f64(r.probability),
            predicted_q_m3s: opt_dec_to_f64(r.predicted_q_m3s),
            confidence: if r.confidence == "normal" {
                Confidence::Normal
            } else {
                Confidence::Degraded
            },
            consensus_status: match r.consensus_status.as_str() {
                "OK" => ConsensusStatus::Ok,
                "DEGRADED" => ConsensusStatus::Degraded,
                _ => ConsensusStatus::Unavailable,
            },
        }
    }
}

/// A fitted H–Q profile. The newest row per node is the active one.
#[derive(Debug, Clone, FromRow)]
pub struct HqProfileRow {
    pub node_id: String,
    pub a: Decimal,
    pub b: Decimal,
    pub h0_m: Decimal,
    pub r_squared: Decimal,
    pub rmse: Decimal,
    pub fitted_at: DateTime<Utc>,
}

impl From<HqProfileRow> for HqProfile {
    fn from(r: HqProfileRow) -> Self {
        Self {
            node_id: r.node_id,
            a: dec_to_f64(r.a),
            b: dec_to_f64(r.b),
            h0_m: dec_to_f64(r.h0_m),
            r_squared: dec_to_f64(r.r_squared),
            rmse: dec_to_f64(r.rmse),
            fitted_at: r.fitted_at,
        }
    }
}

/// A committed alert transition; `cleared_at` is filled in place on clear.
#[derive(Debug, Clone, FromRow)]
pub struct AlertRow {
    pub id: Uuid,
    pub node_id: String,
    pub horizon_h: i32,
    pub level: String,
    pub previous_level: String,
    pub raised_at: DateTime<Utc>,
    pub cleared_at: Option<DateTime<Utc>>,
    pub reason: String,
}

impl From<AlertRow> for AlertEvent {
    fn from(r: AlertRow) -> Self {
        let parse_level = |s: &str| {
            AlertLevel::parse(s).unwrap_or_else(|| {
                tracing::warn!("Unknown alert level '{}' in row {}, reading as Normal", s, r.id);
                AlertLevel::Normal
            })
        };
        Self {
            id: r.id,
            node_id: r.node_id.clone(),
            horizon_h: r.horizon_h.max(0) as u32,
            level: parse_level(&r.level),
            previous_level: parse_level(&r.previous_level),
            raised_at: r.raised_at,
            cleared_at: r.cleared_at,
            reason: r.reason.clone(),
        }
    }
}

/// Device registry row.
#[derive(Debug, Clone, FromRow)]
pub struct DeviceRow {
    pub node_id: String,
    pub last_seen: DateTime<Utc>,
    pub batt_v: Option<Decimal>,
    pub sensor_height_above_crest_m: Option<Decimal>,
    pub status: String,
}

impl From<DeviceRow> for DeviceRecord {
    fn from(r: DeviceRow) -> Self {
        Self {
            node_id: r.node_id,
            last_seen: r.last_seen,
            batt_v: opt_dec_to_f64(r.batt_v),
            sensor_height_above_crest_m: opt_dec_to_f64(r.sensor_height_above_crest_m),
            status: r.status,
        }
    }
}
