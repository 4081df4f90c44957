use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use super::models::{AlertRow, DeviceRow, ForecastRow, HqProfileRow, TelemetryRow};
use crate::domain::{AlertEvent, DeviceRecord, ForecastRecord, HqProfile, TelemetryObservation};
use crate::helpers::{f64_to_decimal, opt_f64_to_decimal};

/// Value for a NOT NULL numeric column. Non-finite values fail the statement.
fn required(column: &str, v: f64) -> Result<Decimal, sqlx::Error> {
    f64_to_decimal(v).ok_or_else(|| sqlx::Error::Encode(format!("{} is not finite ({})", column, v).into()))
}

/// Insert an accepted telemetry record (append-only).
///
/// A replayed (node_id, ts) is ignored so a buffered write can be retried safely.
pub async fn insert_telemetry(pool: &PgPool, obs: &TelemetryObservation) -> Result<(), sqlx::Error> {
    let rec = &obs.record;
    sqlx::query(
        "INSERT INTO telemetry (
            id, node_id, ts, dist_m, rain_bin, batt_v, sensor_height_above_crest_m,
            schema_version, h_m, h_eff_m, q_m3s, dh_10m, flags, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, NOW())
        ON CONFLICT (node_id, ts) DO NOTHING",
    )
    .bind(Uuid::new_v4())
    .bind(&rec.node_id)
    .bind(rec.ts)
    .bind(required("dist_m", rec.dist_m)?)
    .bind(rec.rain_bin.map(i16::from))
    .bind(opt_f64_to_decimal(rec.batt_v))
    .bind(opt_f64_to_decimal(rec.sensor_height_above_crest_m))
    .bind(rec.schema_version as i32)
    .bind(opt_f64_to_decimal(obs.hydraulic.h_m))
    .bind(opt_f64_to_decimal(obs.hydraulic.h_eff_m))
    .bind(opt_f64_to_decimal(obs.hydraulic.q_m3s))
    .bind(opt_f64_to_decimal(obs.dh_10m))
    .bind(obs.flags.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

/// Telemetry for a node within `[from, to]`, oldest first.
pub async fn get_telemetry_range(
    pool: &PgPool,
    node_id: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<TelemetryRow>, sqlx::Error> {
    sqlx::query_as::<_, TelemetryRow>(
        "SELECT node_id, ts, dist_m, rain_bin, batt_v, sensor_height_above_crest_m,
                schema_version, h_m, h_eff_m, q_m3s, dh_10m, flags
         FROM telemetry
         WHERE node_id = $1 AND ts >= $2 AND ts <= $3
         ORDER BY ts ASC",
    )
    .bind(node_id)
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await
}

/// The newest telemetry row of a node.
pub async fn get_latest_telemetry(pool: &PgPool, node_id: &str) -> Result<Option<TelemetryRow>, sqlx::Error> {
    sqlx::query_as::<_, TelemetryRow>(
        "SELECT node_id, ts, dist_m, rain_bin, batt_v, sensor_height_above_crest_m,
                schema_version, h_m, h_eff_m, q_m3s, dh_10m, flags
         FROM telemetry
         WHERE node_id = $1
         ORDER BY ts DESC
         LIMIT 1",
    )
    .bind(node_id)
    .fetch_optional(pool)
    .await
}

/// Insert a forecast record (append-only).
pub async fn insert_forecast(pool: &PgPool, f: &ForecastRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO forecasts (
            id, node_id, horizon_h, ts, probability, predicted_q_m3s,
            confidence, consensus_status, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())",
    )
    .bind(Uuid::new_v4())
    .bind(&f.node_id)
    .bind(f.horizon_h as i32)
    .bind(f.ts)
    .bind(required("probability", f.probability)?)
    .bind(opt_f64_to_decimal(f.predicted_q_m3s))
    .bind(f.confidence.as_str())
    .bind(f.consensus_status.as_str())
    .execute(pool)
    .await?;
    Ok(())
}

/// Forecasts for a node within `[from, to]`, ordered by time then horizon.
pub async fn get_forecast_range(
    pool: &PgPool,
    node_id: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<ForecastRow>, sqlx::Error> {
    sqlx::query_as::<_, ForecastRow>(
        "SELECT id, node_id, horizon_h, ts, probability, predicted_q_m3s,
                confidence, consensus_status, created_at
         FROM forecasts
         WHERE node_id = $1 AND ts >= $2 AND ts <= $3
         ORDER BY ts ASC, horizon_h ASC",
    )
    .bind(node_id)
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await
}

/// Append a fitted profile. The newest `fitted_at` per node is the active one.
pub async fn insert_hq_profile(pool: &PgPool, p: &HqProfile) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO hq_profiles (id, node_id, a, b, h0_m, r_squared, rmse, fitted_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(Uuid::new_v4())
    .bind(&p.node_id)
    .bind(required("a", p.a)?)
    .bind(required("b", p.b)?)
    .bind(required("h0_m", p.h0_m)?)
    .bind(required("r_squared", p.r_squared)?)
    .bind(required("rmse", p.rmse)?)
    .bind(p.fitted_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// The active (newest) profile of every node.
pub async fn get_active_hq_profiles(pool: &PgPool) -> Result<Vec<HqProfileRow>, sqlx::Error> {
    sqlx::query_as::<_, HqProfileRow>(
        "SELECT DISTINCT ON (node_id) node_id, a, b, h0_m, r_squared, rmse, fitted_at
         FROM hq_profiles
         ORDER BY node_id, fitted_at DESC",
    )
    .fetch_all(pool)
    .await
}

/// Insert an alert event, or record its clear time if it already exists.
pub async fn upsert_alert(pool: &PgPool, e: &AlertEvent) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO alerts (id, node_id, horizon_h, level, previous_level, raised_at, cleared_at, reason)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
         ON CONFLICT (id) DO UPDATE SET cleared_at = EXCLUDED.cleared_at",
    )
    .bind(e.id)
    .bind(&e.node_id)
    .bind(e.horizon_h as i32)
    .bind(e.level.as_str())
    .bind(e.previous_level.as_str())
    .bind(e.raised_at)
    .bind(e.cleared_at)
    .bind(&e.reason)
    .execute(pool)
    .await?;
    Ok(())
}

/// Alerts for a node raised or cleared within `[from, to]`.
pub async fn get_alert_range(
    pool: &PgPool,
    node_id: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<AlertRow>, sqlx::Error> {
    sqlx::query_as::<_, AlertRow>(
        "SELECT id, node_id, horizon_h, level, previous_level, raised_at, cleared_at, reason
         FROM alerts
         WHERE node_id = $1
           AND ((raised_at >= $2 AND raised_at <= $3)
                OR (cleared_at >= $2 AND cleared_at <= $3))
         ORDER BY raised_at ASC",
    )
    .bind(node_id)
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await
}

/// Alerts of a node that are still open, oldest first.
pub async fn get_open_alerts(pool: &PgPool, node_id: &str) -> Result<Vec<AlertRow>, sqlx::Error> {
    sqlx::query_as::<_, AlertRow>(
        "SELECT id, node_id, horizon_h, level, previous_level, raised_at, cleared_at, reason
         FROM alerts
         WHERE node_id = $1 AND cleared_at IS NULL
         ORDER BY raised_at ASC",
    )
    .bind(node_id)
    .fetch_all(pool)
    .await
}

/// Insert or refresh a device registry entry.
///
/// A missing sensor height in the update keeps the previously known one.
pub async fn upsert_device(pool: &PgPool, d: &DeviceRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO devices (node_id, last_seen, batt_v, sensor_height_above_crest_m, status)
         VALUES ($1, $2, $3, $4, $5)
         ON CONFLICT (node_id) DO UPDATE SET
            last_seen = EXCLUDED.last_seen,
            batt_v = EXCLUDED.batt_v,
            sensor_height_above_crest_m = COALESCE(
                EXCLUDED.sensor_height_above_crest_m, devices.sensor_height_above_crest_m),
            status = EXCLUDED.status",
    )
    .bind(&d.node_id)
    .bind(d.last_seen)
    .bind(opt_f64_to_decimal(d.batt_v))
    .bind(opt_f64_to_decimal(d.sensor_height_above_crest_m))
    .bind(&d.status)
    .execute(pool)
    .await?;
    Ok(())
}

/// All registered devices, ordered by node id.
pub async fn list_devices(pool: &PgPool) -> Result<Vec<DeviceRow>, sqlx::Error> {
    sqlx::query_as::<_, DeviceRow>(
        "SELECT node_id, last_seen, batt_v, sensor_height_above_crest_m, status
         FROM devices
         ORDER BY node_id",
    )
    .fetch_all(pool)
    .await
}
