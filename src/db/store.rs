//! Persistence contract for the pipeline.
//!
//! The core needs only insert and range-query semantics over five collections
//! (telemetry, forecasts, calibration profiles, alerts, device registry).
//! Durability and indexing belong to the backing store. Two backends exist:
//! `PgStore` over sqlx/PostgreSQL and `MemoryStore` for tests and DB-less runs.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

use super::queries;
use crate::domain::{AlertEvent, DeviceRecord, ForecastRecord, HqProfile, TelemetryObservation};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Value rejected by the store: {0}")]
    Rejected(String),
}

impl PersistenceError {
    /// False when the write itself is unstorable and retrying cannot help.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            PersistenceError::Rejected(_) | PersistenceError::Database(sqlx::Error::Encode(_))
        )
    }
}

type StoreResult<'a, T> = BoxFuture<'a, Result<T, PersistenceError>>;

/// Insert-and-range-query access to the five pipeline collections.
///
/// Range bounds are inclusive on both ends.
pub trait Store: Send + Sync {
    fn insert_telemetry<'a>(&'a self, obs: &'a TelemetryObservation) -> StoreResult<'a, ()>;

    fn telemetry_range<'a>(
        &'a self,
        node_id: &'a str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<'a, Vec<TelemetryObservation>>;

    /// The newest accepted record of a node, however old.
    fn latest_telemetry<'a>(&'a self, node_id: &'a str) -> StoreResult<'a, Option<TelemetryObservation>>;

    fn insert_forecast<'a>(&'a self, forecast: &'a ForecastRecord) -> StoreResult<'a, ()>;

    fn forecast_range<'a>(
        &'a self,
        node_id: &'a str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<'a, Vec<ForecastRecord>>;

    fn insert_profile<'a>(&'a self, profile: &'a HqProfile) -> StoreResult<'a, ()>;

    /// The newest profile of every node.
    fn active_profiles(&self) -> StoreResult<'_, Vec<HqProfile>>;

    /// Insert an alert event, or update `cleared_at` of an existing one.
    fn upsert_alert<'a>(&'a self, event: &'a AlertEvent) -> StoreResult<'a, ()>;

    fn alert_range<'a>(
        &'a self,
        node_id: &'a str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<'a, Vec<AlertEvent>>;

    /// Alert events of a node that have not been cleared.
    fn open_alerts<'a>(&'a self, node_id: &'a str) -> StoreResult<'a, Vec<AlertEvent>>;

    fn upsert_device<'a>(&'a self, device: &'a DeviceRecord) -> StoreResult<'a, ()>;

    fn list_devices(&self) -> StoreResult<'_, Vec<DeviceRecord>>;

    /// Cheap connectivity check for the health endpoint.
    fn ping(&self) -> StoreResult<'_, ()>;
}

// ---------------------------------------------------------------------------
// PostgreSQL
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl Store for PgStore {
    fn insert_telemetry<'a>(&'a self, obs: &'a TelemetryObservation) -> StoreResult<'a, ()> {
        async move { Ok(queries::insert_telemetry(&self.pool, obs).await?) }.boxed()
    }

    fn telemetry_range<'a>(
        &'a self,
        node_id: &'a str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<'a, Vec<TelemetryObservation>> {
        async move {
            let rows = queries::get_telemetry_range(&self.pool, node_id, from, to).await?;
            Ok(rows.into_iter().map(TelemetryObservation::from).collect())
        }
        .boxed()
    }

    fn latest_telemetry<'a>(&'a self, node_id: &'a str) -> StoreResult<'a, Option<TelemetryObservation>> {
        async move {
            let row = queries::get_latest_telemetry(&self.pool, node_id).await?;
            Ok(row.map(TelemetryObservation::from))
        }
        .boxed()
    }

    fn insert_forecast<'a>(&'a self, forecast: &'a ForecastRecord) -> StoreResult<'a, ()> {
        async move { Ok(queries::insert_forecast(&self.pool, forecast).await?) }.boxed()
    }

    fn forecast_range<'a>(
        &'a self,
        node_id: &'a str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<'a, Vec<ForecastRecord>> {
        async move {
            let rows = queries::get_forecast_range(&self.pool, node_id, from, to).await?;
            Ok(rows.into_iter().map(ForecastRecord::from).collect())
        }
        .boxed()
    }

    fn insert_profile<'a>(&'a self, profile: &'a HqProfile) -> StoreResult<'a, ()> {
        async move { Ok(queries::insert_hq_profile(&self.pool, profile).await?) }.boxed()
    }

    fn active_profiles(&self) -> StoreResult<'_, Vec<HqProfile>> {
        async move {
            let rows = queries::get_active_hq_profiles(&self.pool).await?;
            Ok(rows.into_iter().map(HqProfile::from).collect())
        }
        .boxed()
    }

    fn upsert_alert<'a>(&'a self, event: &'a AlertEvent) -> StoreResult<'a, ()> {
        async move { Ok(queries::upsert_alert(&self.pool, event).await?) }.boxed()
    }

    fn alert_range<'a>(
        &'a self,
        node_id: &'a str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<'a, Vec<AlertEvent>> {
        async move {
            let rows = queries::get_alert_range(&self.pool, node_id, from, to).await?;
            Ok(rows.into_iter().map(AlertEvent::from).collect())
        }
        .boxed()
    }

    fn open_alerts<'a>(&'a self, node_id: &'a str) -> StoreResult<'a, Vec<AlertEvent>> {
        async move {
            let rows = queries::get_open_alerts(&self.pool, node_id).await?;
            Ok(rows.into_iter().map(AlertEvent::from).collect())
        }
        .boxed()
    }

    fn upsert_device<'a>(&'a self, device: &'a DeviceRecord) -> StoreResult<'a, ()> {
        async move { Ok(queries::upsert_device(&self.pool, device).await?) }.boxed()
    }

    fn list_devices(&self) -> StoreResult<'_, Vec<DeviceRecord>> {
        async move {
            let rows = queries::list_devices(&self.pool).await?;
            Ok(rows.into_iter().map(DeviceRecord::from).collect())
        }
        .boxed()
    }

    fn ping(&self) -> StoreResult<'_, ()> {
        async move {
            sqlx::query_scalar::<_, i32>("SELECT 1")
                .fetch_one(&self.pool)
                .await?;
            Ok(())
        }
        .boxed()
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Tables {
    telemetry: Vec<TelemetryObservation>,
    forecasts: Vec<ForecastRecord>,
    profiles: Vec<HqProfile>,
    alerts: Vec<AlertEvent>,
    devices: HashMap<String, DeviceRecord>,
}

/// Process-local store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail until switched back, to exercise retry paths.
    #[cfg(test)]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, PersistenceError> {
        self.tables
            .lock()
            .map_err(|_| PersistenceError::Unavailable("memory store lock poisoned".to_string()))
    }

    fn writable(&self) -> Result<MutexGuard<'_, Tables>, PersistenceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("memory store offline".to_string()));
        }
        self.tables()
    }
}

fn in_range(ts: DateTime<Utc>, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
    ts >= from && ts <= to
}

/// NOT NULL numeric columns refuse what NUMERIC cannot hold.
fn finite(column: &str, v: f64) -> Result<(), PersistenceError> {
    if v.is_finite() {
        Ok(())
    } else {
        Err(PersistenceError::Rejected(format!("{} is not finite ({})", column, v)))
    }
}

impl Store for MemoryStore {
    fn insert_telemetry<'a>(&'a self, obs: &'a TelemetryObservation) -> StoreResult<'a, ()> {
        async move {
            finite("dist_m", obs.record.dist_m)?;
            let mut t = self.writable()?;
            let duplicate = t.telemetry.iter().any(|o| {
                o.record.node_id == obs.record.node_id && o.record.ts == obs.record.ts
            });
            if !duplicate {
                t.telemetry.push(obs.clone());
            }
            Ok(())
        }
        .boxed()
    }

    fn telemetry_range<'a>(
        &'a self,
        node_id: &'a str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<'a, Vec<TelemetryObservation>> {
        async move {
            let t = self.tables()?;
            let mut rows: Vec<TelemetryObservation> = t
                .telemetry
                .iter()
                .filter(|o| o.record.node_id == node_id && in_range(o.record.ts, from, to))
                .cloned()
                .collect();
            rows.sort_by_key(|o| o.record.ts);
            Ok(rows)
        }
        .boxed()
    }

    fn latest_telemetry<'a>(&'a self, node_id: &'a str) -> StoreResult<'a, Option<TelemetryObservation>> {
        async move {
            let t = self.tables()?;
            Ok(t.telemetry
                .iter()
                .filter(|o| o.record.node_id == node_id)
                .max_by_key(|o| o.record.ts)
                .cloned())
        }
        .boxed()
    }

    fn insert_forecast<'a>(&'a self, forecast: &'a ForecastRecord) -> StoreResult<'a, ()> {
        async move {
            finite("probability", forecast.probability)?;
            self.writable()?.forecasts.push(forecast.clone());
            Ok(())
        }
        .boxed()
    }

    fn forecast_range<'a>(
        &'a self,
        node_id: &'a str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<'a, Vec<ForecastRecord>> {
        async move {
            let t = self.tables()?;
            let mut rows: Vec<ForecastRecord> = t
                .forecasts
                .iter()
                .filter(|f| f.node_id == node_id && in_range(f.ts, from, to))
                .cloned()
                .collect();
            rows.sort_by_key(|f| (f.ts, f.horizon_h));
            Ok(rows)
        }
        .boxed()
    }

    fn insert_profile<'a>(&'a self, profile: &'a HqProfile) -> StoreResult<'a, ()> {
        async move {
            self.writable()?.profiles.push(profile.clone());
            Ok(())
        }
        .boxed()
    }

    fn active_profiles(&self) -> StoreResult<'_, Vec<HqProfile>> {
        async move {
            let t = self.tables()?;
            let mut newest: HashMap<&str, &HqProfile> = HashMap::new();
            for p in &t.profiles {
                match newest.get(p.node_id.as_str()) {
                    Some(existing) if existing.fitted_at >= p.fitted_at => {}
                    _ => {
                        newest.insert(p.node_id.as_str(), p);
                    }
                }
            }
            let mut profiles: Vec<HqProfile> = newest.into_values().cloned().collect();
            profiles.sort_by(|a, b| a.node_id.cmp(&b.node_id));
            Ok(profiles)
        }
        .boxed()
    }

    fn upsert_alert<'a>(&'a self, event: &'a AlertEvent) -> StoreResult<'a, ()> {
        async move {
            let mut t = self.writable()?;
            match t.alerts.iter_mut().find(|e| e.id == event.id) {
                Some(existing) => existing.cleared_at = event.cleared_at,
                None => t.alerts.push(event.clone()),
            }
            Ok(())
        }
        .boxed()
    }

    fn alert_range<'a>(
        &'a self,
        node_id: &'a str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<'a, Vec<AlertEvent>> {
        async move {
            let t = self.tables()?;
            let mut rows: Vec<AlertEvent> = t
                .alerts
                .iter()
                .filter(|e| {
                    e.node_id == node_id
                        && (in_range(e.raised_at, from, to)
                            || e.cleared_at.is_some_and(|c| in_range(c, from, to)))
                })
                .cloned()
                .collect();
            rows.sort_by_key(|e| e.raised_at);
            Ok(rows)
        }
        .boxed()
    }

    fn open_alerts<'a>(&'a self, node_id: &'a str) -> StoreResult<'a, Vec<AlertEvent>> {
        async move {
            let t = self.tables()?;
            let mut rows: Vec<AlertEvent> = t
                .alerts
                .iter()
                .filter(|e| e.node_id == node_id && e.cleared_at.is_none())
                .cloned()
                .collect();
            rows.sort_by_key(|e| e.raised_at);
            Ok(rows)
        }
        .boxed()
    }

    fn upsert_device<'a>(&'a self, device: &'a DeviceRecord) -> StoreResult<'a, ()> {
        async move {
            let mut t = self.writable()?;
            let height = device.sensor_height_above_crest_m.or_else(|| {
                t.devices
                    .get(&device.node_id)
                    .and_then(|d| d.sensor_height_above_crest_m)
            });
            let mut updated = device.clone();
            updated.sensor_height_above_crest_m = height;
            t.devices.insert(device.node_id.clone(), updated);
            Ok(())
        }
        .boxed()
    }

    fn list_devices(&self) -> StoreResult<'_, Vec<DeviceRecord>> {
        async move {
            let t = self.tables()?;
            let mut devices: Vec<DeviceRecord> = t.devices.values().cloned().collect();
            devices.sort_by(|a, b| a.node_id.cmp(&b.node_id));
            Ok(devices)
        }
        .boxed()
    }

    fn ping(&self) -> StoreResult<'_, ()> {
        async move {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(PersistenceError::Unavailable("memory store offline".to_string()));
            }
            Ok(())
        }
        .boxed()
    }
}
