//! Horizon risk forecasting.
//!
//! Per configured horizon the flood probability is a logistic score over the
//! node's hydraulic state and the rainfall consensus:
//!
//! `p = σ(β0 + β_head·H_eff + β_rise·max(0, ΔH_10m) + β_rain·rain + β_q·Q)`
//!
//! Horizons are scored independently. An input that is missing contributes
//! nothing and marks the record `degraded`; a consensus that is not `OK` does
//! the same. Evaluation is a pure function of its inputs.

use chrono::{DateTime, Duration, Utc};

use super::hydraulic::discharge;
use super::qc::NodeHistory;
use crate::config::{FlaggedPolicy, ForecastConfig, HorizonModel};
use crate::domain::{
    Confidence, ConsensusEstimate, ConsensusStatus, ForecastRecord, HqProfile, TelemetryObservation,
};

/// Ten-minute rise steps per hour, for projecting the rise rate.
const STEPS_PER_HOUR: f64 = 6.0;

/// The signals a forecast is scored on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForecastInputs {
    pub h_eff_m: Option<f64>,
    pub rise_10m: Option<f64>,
    pub rain_mm: Option<f64>,
    pub q_m3s: Option<f64>,
    /// Scale on the hydraulic terms (below 1 for down-weighted flagged data)
    pub hydraulic_weight: f64,
}

/// Forecast records of one evaluation plus the inputs they were scored on.
#[derive(Debug, Clone)]
pub struct ForecastOutcome {
    pub records: Vec<ForecastRecord>,
    pub inputs: ForecastInputs,
}

#[derive(Debug, Clone)]
pub struct ForecastEngine {
    cfg: ForecastConfig,
}

impl ForecastEngine {
    pub fn new(cfg: ForecastConfig) -> Self {
        Self { cfg }
    }

    /// Pick the observation to score on and derive the inputs from it.
    ///
    /// H_eff and Q are recomputed with the current profile, so a calibration
    /// published after a record arrived applies from the next evaluation. An
    /// observation older than `max_observation_age_min` at `ts` leaves the
    /// hydraulic inputs missing.
    pub fn inputs(
        &self,
        ts: DateTime<Utc>,
        history: &NodeHistory,
        profile: Option<&HqProfile>,
        consensus: &ConsensusEstimate,
    ) -> ForecastInputs {
        let (obs, weight) = self.select(history);
        let max_age = Duration::minutes(self.cfg.max_observation_age_min);
        let obs = obs.filter(|o| {
            let fresh = ts - o.record.ts <= max_age;
            if !fresh {
                tracing::debug!(
                    "Newest usable observation for {} is from {}, too old at {}",
                    o.record.node_id,
                    o.record.ts,
                    ts
                );
            }
            fresh
        });
        let h_eff = obs
            .and_then(|o| o.hydraulic.h_m)
            .map(|h| (h - profile.map_or(0.0, |p| p.h0_m)).max(0.0));

        ForecastInputs {
            h_eff_m: h_eff,
            rise_10m: obs.and_then(|o| o.dh_10m),
            rain_mm: consensus.value,
            q_m3s: profile.zip(h_eff).map(|(p, h)| discharge(p.a, p.b, h)),
            hydraulic_weight: weight,
        }
    }

    fn select<'h>(&self, history: &'h NodeHistory) -> (Option<&'h TelemetryObservation>, f64) {
        let Some(latest) = history.latest() else {
            return (None, 1.0);
        };
        if latest.flags.is_empty() {
            return (Some(latest), 1.0);
        }
        match self.cfg.flagged_policy {
            FlaggedPolicy::Include => (Some(latest), 1.0),
            FlaggedPolicy::DownWeight => (Some(latest), self.cfg.flagged_weight),
            FlaggedPolicy::Exclude => (history.last_unflagged(), 1.0),
        }
    }

    /// Score one horizon. Returns the probability and whether any weighted
    /// input was missing.
    pub fn predict(&self, model: &HorizonModel, inputs: &ForecastInputs) -> (f64, bool) {
        let w = inputs.hydraulic_weight;
        let mut missing = false;
        let mut z = model.intercept;

        let mut term = |coefficient: f64, value: Option<f64>| {
            if coefficient == 0.0 {
                return;
            }
            match value {
                Some(v) => z += coefficient * v,
                None => missing = true,
            }
        };
        term(model.w_head, inputs.h_eff_m.map(|h| h * w));
        term(model.w_rise, inputs.rise_10m.map(|r| r.max(0.0) * w));
        term(model.w_rain, inputs.rain_mm);
        term(model.w_discharge, inputs.q_m3s.map(|q| q * w));

        (sigmoid(z), missing)
    }

    /// Discharge at the horizon, projecting the rise rate over at most
    /// `projection_cap_h`.
    fn predicted_q(&self, model: &HorizonModel, inputs: &ForecastInputs, profile: Option<&HqProfile>) -> Option<f64> {
        let profile = profile?;
        let h_eff = inputs.h_eff_m?;
        let lead_h = (model.horizon_h as f64).min(self.cfg.projection_cap_h);
        let projected = (h_eff + inputs.rise_10m.unwrap_or(0.0) * STEPS_PER_HOUR * lead_h).max(0.0);
        Some(discharge(profile.a, profile.b, projected))
    }

    /// One record per configured horizon.
    pub fn evaluate(
        &self,
        node_id: &str,
        ts: DateTime<Utc>,
        history: &NodeHistory,
        profile: Option<&HqProfile>,
        consensus: &ConsensusEstimate,
    ) -> ForecastOutcome {
        let inputs = self.inputs(ts, history, profile, consensus);
        let consensus_ok = consensus.status == ConsensusStatus::Ok;

        let records = self
            .cfg
            .horizons
            .iter()
            .map(|model| {
                let (probability, missing) = self.predict(model, &inputs);
                ForecastRecord {
                    node_id: node_id.to_string(),
                    horizon_h: model.horizon_h,
                    ts,
                    probability,
                    predicted_q_m3s: self.predicted_q(model, &inputs, profile),
                    confidence: if missing || !consensus_ok {
                        Confidence::Degraded
                    } else {
                        Confidence::Normal
                    },
                    consensus_status: consensus.status,
                }
            })
            .collect();

        ForecastOutcome { records, inputs }
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{HydraulicState, QcFlag, QcFlags, TelemetryRecord};
    use chrono::Duration;

    fn ts(min: i64) -> DateTime<Utc> {
        "2025-11-03T02:00:00Z".parse::<DateTime<Utc>>().unwrap() + Duration::minutes(min)
    }

    fn obs(min: i64, h: f64, dh: Option<f64>) -> TelemetryObservation {
        TelemetryObservation {
            record: TelemetryRecord {
                ts: ts(min),
                node_id: "CM-01".to_string(),
                dist_m: 1.0 - h,
                rain_bin: Some(0),
                batt_v: None,
                sensor_height_above_crest_m: Some(1.0),
                schema_version: 2,
            },
            hydraulic: HydraulicState {
                h_m: Some(h),
                h_eff_m: Some(h.max(0.0)),
                q_m3s: None,
            },
            dh_10m: dh,
            flags: QcFlags::new(),
        }
    }

    fn consensus(value: Option<f64>, status: ConsensusStatus) -> ConsensusEstimate {
        ConsensusEstimate {
            ts: ts(20),
            node_id: "CM-01".to_string(),
            value,
            spread: value.map(|_| 0.0),
            contributing_sources: vec!["a".to_string(), "b".to_string()],
            status,
        }
    }

    fn history(samples: Vec<TelemetryObservation>) -> NodeHistory {
        let mut h = NodeHistory::new(Duration::minutes(60));
        for s in samples {
            h.push(s);
        }
        h
    }

    fn profile() -> HqProfile {
        HqProfile {
            node_id: "CM-01".to_string(),
            a: 2.0,
            b: 1.5,
            h0_m: 0.1,
            r_squared: 0.98,
            rmse: 0.01,
            fitted_at: ts(0),
        }
    }

    #[test]
    fn test_probability_follows_logistic_score() {
        let engine = ForecastEngine::new(ForecastConfig::default());
        let model = &ForecastConfig::default().horizons[0];
        let inputs = ForecastInputs {
            h_eff_m: Some(0.5),
            rise_10m: Some(0.04),
            rain_mm: Some(10.0),
            q_m3s: None,
            hydraulic_weight: 1.0,
        };
        let (p, missing) = engine.predict(model, &inputs);
        // −4 + 6·0.5 + 25·0.04 + 0.12·10 = 1.2
        assert!((p - sigmoid(1.2)).abs() < 1e-12);
        assert!(!missing);
    }

    #[test]
    fn test_falling_water_does_not_raise_risk() {
        let engine = ForecastEngine::new(ForecastConfig::default());
        let model = &ForecastConfig::default().horizons[0];
        let base = ForecastInputs {
            h_eff_m: Some(0.3),
            rise_10m: Some(0.0),
            rain_mm: Some(0.0),
            q_m3s: None,
            hydraulic_weight: 1.0,
        };
        let falling = ForecastInputs { rise_10m: Some(-0.2), ..base };
        assert_eq!(engine.predict(model, &base).0, engine.predict(model, &falling).0);
    }

    #[test]
    fn test_evaluation_is_idempotent() {
        let engine = ForecastEngine::new(ForecastConfig::default());
        let hist = history(vec![obs(0, 0.3, None), obs(10, 0.35, Some(0.05))]);
        let est = consensus(Some(4.0), ConsensusStatus::Ok);
        let p = profile();

        let first = engine.evaluate("CM-01", ts(10), &hist, Some(&p), &est);
        let second = engine.evaluate("CM-01", ts(10), &hist, Some(&p), &est);
        assert_eq!(first.records, second.records);
        assert_eq!(first.records.len(), 2);
        assert_eq!(first.records[0].horizon_h, 6);
        assert_eq!(first.records[1].horizon_h, 12);
        assert!(first.records.iter().all(|r| r.confidence == Confidence::Normal));
    }

    #[test]
    fn test_unavailable_consensus_degrades_without_number() {
        let engine = ForecastEngine::new(ForecastConfig::default());
        let hist = history(vec![obs(0, 0.3, Some(0.0))]);
        let outcome = engine.evaluate(
            "CM-01",
            ts(0),
            &hist,
            None,
            &ConsensusEstimate::unavailable("CM-01", ts(0)),
        );
        assert_eq!(outcome.inputs.rain_mm, None);
        for r in &outcome.records {
            assert_eq!(r.confidence, Confidence::Degraded);
            assert_eq!(r.consensus_status, ConsensusStatus::Unavailable);
            assert_eq!(r.predicted_q_m3s, None);
        }
    }

    #[test]
    fn test_degraded_consensus_marks_record() {
        let engine = ForecastEngine::new(ForecastConfig::default());
        let hist = history(vec![obs(0, 0.3, Some(0.0))]);
        let outcome = engine.evaluate("CM-01", ts(0), &hist, None, &consensus(Some(1.0), ConsensusStatus::Degraded));
        assert!(outcome.records.iter().all(|r| r.confidence == Confidence::Degraded));
    }

    #[test]
    fn test_head_only_without_profile() {
        let engine = ForecastEngine::new(ForecastConfig::default());
        let hist = history(vec![obs(0, 0.3, Some(0.0))]);
        let inputs = engine.inputs(ts(0), &hist, None, &consensus(Some(0.0), ConsensusStatus::Ok));
        assert_eq!(inputs.h_eff_m, Some(0.3));
        assert_eq!(inputs.q_m3s, None);
    }

    #[test]
    fn test_predicted_q_projects_rise() {
        let engine = ForecastEngine::new(ForecastConfig::default());
        let hist = history(vec![obs(0, 0.3, Some(0.01))]);
        let p = profile();
        let outcome = engine.evaluate("CM-01", ts(0), &hist, Some(&p), &consensus(Some(0.0), ConsensusStatus::Ok));
        // H_eff 0.2 plus 0.01·6 over the capped one hour
        let expected = discharge(2.0, 1.5, 0.26);
        for r in &outcome.records {
            assert!((r.predicted_q_m3s.unwrap() - expected).abs() < 1e-9);
        }
    }

    #[test]
    fn test_flagged_policies() {
        let clean = obs(0, 0.3, Some(0.0));
        let mut flagged = obs(10, 0.9, Some(0.6));
        flagged.flags.insert(QcFlag::SpikesH);
        let hist = history(vec![clean, flagged]);
        let est = consensus(Some(0.0), ConsensusStatus::Ok);

        let with = |policy| {
            ForecastEngine::new(ForecastConfig {
                flagged_policy: policy,
                ..ForecastConfig::default()
            })
            .inputs(ts(10), &hist, None, &est)
        };

        let include = with(FlaggedPolicy::Include);
        assert_eq!(include.h_eff_m, Some(0.9));
        assert_eq!(include.hydraulic_weight, 1.0);

        let down = with(FlaggedPolicy::DownWeight);
        assert_eq!(down.h_eff_m, Some(0.9));
        assert_eq!(down.hydraulic_weight, 0.5);

        let exclude = with(FlaggedPolicy::Exclude);
        assert_eq!(exclude.h_eff_m, Some(0.3));
        assert_eq!(exclude.rise_10m, Some(0.0));
    }

    #[test]
    fn test_silent_node_loses_hydraulic_terms() {
        let engine = ForecastEngine::new(ForecastConfig::default());
        let hist = history(vec![obs(0, 0.5, Some(0.02))]);
        let est = consensus(Some(0.0), ConsensusStatus::Ok);

        let fresh = engine.evaluate("CM-01", ts(60), &hist, None, &est);
        assert_eq!(fresh.inputs.h_eff_m, Some(0.5));
        assert!(fresh.records.iter().all(|r| r.confidence == Confidence::Normal));

        let stale = engine.evaluate("CM-01", ts(61), &hist, None, &est);
        assert_eq!(stale.inputs.h_eff_m, None);
        assert_eq!(stale.inputs.rise_10m, None);
        assert!(stale.records.iter().all(|r| r.confidence == Confidence::Degraded));
        assert!(stale.records[0].probability < fresh.records[0].probability);
    }

    #[test]
    fn test_missing_rise_marks_degraded() {
        let engine = ForecastEngine::new(ForecastConfig::default());
        let hist = history(vec![obs(0, 0.3, None)]);
        let outcome = engine.evaluate("CM-01", ts(0), &hist, None, &consensus(Some(0.0), ConsensusStatus::Ok));
        assert!(outcome.records.iter().all(|r| r.confidence == Confidence::Degraded));
    }
}
