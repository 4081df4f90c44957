//! Hydraulic model: distance reading → head → discharge.
//!
//! `H = sensor_height_above_crest − dist`, `H_eff = max(0, H − H0)` and
//! `Q = a · H_eff^b`. Q stays undefined (not zero) until the node has a
//! fitted profile. Fitting lives in `services::calibration`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::config::NodeSite;
use crate::domain::{HqProfile, HydraulicState, TelemetryRecord};

/// Pick the sensor mounting height for a record.
///
/// The record's own `meta` wins, then the device registry's last known value,
/// then the configured site value.
pub fn resolve_sensor_height(
    record: &TelemetryRecord,
    registry_height: Option<f64>,
    site: &NodeSite,
) -> Option<f64> {
    record
        .sensor_height_above_crest_m
        .or(registry_height)
        .or(site.sensor_height_above_crest_m)
}

/// Discharge for an effective head. Zero at or below the crest.
pub fn discharge(a: f64, b: f64, h_eff: f64) -> f64 {
    if h_eff <= 0.0 {
        return 0.0;
    }
    a * h_eff.powf(b)
}

/// Live-path computation for one reading.
///
/// Without a sensor height nothing can be derived. Without a profile the
/// head is taken relative to the crest (`H0 = 0`) and Q is `None`.
pub fn compute(dist_m: f64, sensor_height: Option<f64>, profile: Option<&HqProfile>) -> HydraulicState {
    let Some(height) = sensor_height else {
        return HydraulicState::default();
    };
    let h = height - dist_m;
    let h0 = profile.map(|p| p.h0_m).unwrap_or(0.0);
    let h_eff = (h - h0).max(0.0);
    HydraulicState {
        h_m: Some(h),
        h_eff_m: Some(h_eff),
        q_m3s: profile.map(|p| discharge(p.a, p.b, h_eff)),
    }
}

/// Active H–Q profiles, one per node.
///
/// Readers get an `Arc` snapshot, so a swap during calibration is seen
/// entirely or not at all.
#[derive(Debug, Default)]
pub struct ProfileRegistry {
    profiles: RwLock<HashMap<String, Arc<HqProfile>>>,
}

impl ProfileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from persisted profiles at startup.
    pub fn load(&self, profiles: Vec<HqProfile>) -> usize {
        let mut map = self.profiles.write().unwrap_or_else(|e| e.into_inner());
        for p in profiles {
            map.insert(p.node_id.clone(), Arc::new(p));
        }
        map.len()
    }

    pub fn get(&self, node_id: &str) -> Option<Arc<HqProfile>> {
        self.profiles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(node_id)
            .cloned()
    }

    /// Make `profile` the active one for its node.
    pub fn replace(&self, profile: HqProfile) {
        let mut map = self.profiles.write().unwrap_or_else(|e| e.into_inner());
        map.insert(profile.node_id.clone(), Arc::new(profile));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn profile(a: f64, b: f64, h0: f64) -> HqProfile {
        HqProfile {
            node_id: "CM-01".to_string(),
            a,
            b,
            h0_m: h0,
            r_squared: 0.99,
            rmse: 0.01,
            fitted_at: Utc::now(),
        }
    }

    #[test]
    fn test_reference_reading() {
        let p = profile(2.0, 1.5, 0.0);
        let state = compute(0.83, Some(0.95), Some(&p));
        assert!((state.h_m.unwrap() - 0.12).abs() < 1e-9);
        assert!((state.h_eff_m.unwrap() - 0.12).abs() < 1e-9);
        // 2 · 0.12^1.5 = 0.08314
        assert!((state.q_m3s.unwrap() - 0.0831).abs() < 1e-4);
    }

    #[test]
    fn test_no_profile_leaves_discharge_undefined() {
        let state = compute(0.83, Some(0.95), None);
        assert!((state.h_eff_m.unwrap() - 0.12).abs() < 1e-9);
        assert_eq!(state.q_m3s, None);
    }

    #[test]
    fn test_below_offset_gives_zero_discharge() {
        let p = profile(2.0, 1.5, 0.2);
        let state = compute(0.83, Some(0.95), Some(&p));
        assert_eq!(state.h_eff_m, Some(0.0));
        assert_eq!(state.q_m3s, Some(0.0));
    }

    #[test]
    fn test_no_sensor_height() {
        assert_eq!(compute(0.83, None, None), HydraulicState::default());
    }

    #[test]
    fn test_sensor_height_precedence() {
        let mut rec = TelemetryRecord {
            ts: Utc::now(),
            node_id: "CM-01".to_string(),
            dist_m: 0.8,
            rain_bin: None,
            batt_v: None,
            sensor_height_above_crest_m: Some(1.1),
            schema_version: 2,
        };
        let site = NodeSite {
            sensor_height_above_crest_m: Some(0.9),
            ..NodeSite::default()
        };
        assert_eq!(resolve_sensor_height(&rec, Some(1.0), &site), Some(1.1));
        rec.sensor_height_above_crest_m = None;
        assert_eq!(resolve_sensor_height(&rec, Some(1.0), &site), Some(1.0));
        assert_eq!(resolve_sensor_height(&rec, None, &site), Some(0.9));
        assert_eq!(resolve_sensor_height(&rec, None, &NodeSite::default()), None);
    }

    #[test]
    fn test_registry_replace_swaps_snapshot() {
        let registry = ProfileRegistry::new();
        assert!(registry.get("CM-01").is_none());
        registry.load(vec![profile(1.0, 1.5, 0.0)]);
        let before = registry.get("CM-01").unwrap();
        registry.replace(profile(2.0, 1.5, 0.0));
        // An earlier snapshot stays intact
        assert_eq!(before.a, 1.0);
        assert_eq!(registry.get("CM-01").unwrap().a, 2.0);
    }
}
