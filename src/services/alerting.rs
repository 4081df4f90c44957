//! Alert state machine, one session per (node, horizon).
//!
//! Levels move one step at a time: `Normal → Early → High` and back. A level
//! change is first a candidate; it commits only after holding continuously for
//! the debounce interval, and any evaluation that does not support it cancels
//! it. Demotion needs the triggering metric to fall below
//! `threshold × (1 − hysteresis)`. Time comes from the evaluated inputs only.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::config::AlertConfig;
use crate::domain::{AlertEvent, AlertLevel};

/// Signals one evaluation is judged on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlertInput {
    pub ts: DateTime<Utc>,
    pub probability: f64,
    pub rise_10m: Option<f64>,
    pub rain_mm: Option<f64>,
}

/// A committed transition.
///
/// `superseded` is the previously open event, closed at the same instant, when
/// the level changed between `Early` and `High`.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertTransition {
    pub event: AlertEvent,
    pub superseded: Option<AlertEvent>,
}

#[derive(Debug, Clone)]
pub struct AlertSession {
    node_id: String,
    horizon_h: u32,
    confirmed: AlertLevel,
    pending: Option<(AlertLevel, DateTime<Utc>)>,
    open_event: Option<AlertEvent>,
    last_eval: Option<DateTime<Utc>>,
}

impl AlertSession {
    pub fn new(node_id: &str, horizon_h: u32) -> Self {
        Self {
            node_id: node_id.to_string(),
            horizon_h,
            confirmed: AlertLevel::Normal,
            pending: None,
            open_event: None,
            last_eval: None,
        }
    }

    /// Resume a session from an event that is still open in the store.
    ///
    /// The session starts at the event's level with nothing pending, and
    /// ignores evaluations not after the event was raised.
    pub fn restore(event: AlertEvent) -> Self {
        Self {
            node_id: event.node_id.clone(),
            horizon_h: event.horizon_h,
            confirmed: event.level,
            pending: None,
            last_eval: Some(event.raised_at),
            open_event: Some(event),
        }
    }

    pub fn confirmed(&self) -> AlertLevel {
        self.confirmed
    }

    pub fn pending(&self) -> Option<(AlertLevel, DateTime<Utc>)> {
        self.pending
    }

    /// Feed one evaluation. Returns the transition it committed, if any.
    pub fn evaluate(&mut self, cfg: &AlertConfig, input: &AlertInput) -> Option<AlertTransition> {
        if self.last_eval.is_some_and(|last| input.ts <= last) {
            tracing::debug!(
                "Ignoring alert evaluation for {}/{}h at {}: not after the previous one",
                self.node_id,
                self.horizon_h,
                input.ts
            );
            return None;
        }
        self.last_eval = Some(input.ts);

        let (candidate, reason) = candidate(cfg, self.confirmed, input);
        if candidate == self.confirmed {
            self.pending = None;
            return None;
        }

        let since = match self.pending {
            Some((level, since)) if level == candidate => since,
            _ => {
                self.pending = Some((candidate, input.ts));
                input.ts
            }
        };
        if input.ts - since < Duration::minutes(cfg.debounce_min) {
            return None;
        }

        Some(self.commit(candidate, reason, input.ts))
    }

    fn commit(&mut self, level: AlertLevel, reason: String, ts: DateTime<Utc>) -> AlertTransition {
        let previous = self.confirmed;
        self.confirmed = level;
        self.pending = None;

        let closed = self.open_event.take().map(|mut e| {
            e.cleared_at = Some(ts);
            e
        });

        if level == AlertLevel::Normal {
            let event = closed.unwrap_or_else(|| {
                // Only reachable if the open event was lost; record the clear on its own
                self.new_event(AlertLevel::Normal, previous, reason.clone(), ts, Some(ts))
            });
            tracing::info!("Alert cleared for {}/{}h: {}", self.node_id, self.horizon_h, reason);
            return AlertTransition {
                event,
                superseded: None,
            };
        }

        let event = self.new_event(level, previous, reason, ts, None);
        tracing::info!(
            "Alert {:?} → {:?} for {}/{}h: {}",
            previous,
            level,
            self.node_id,
            self.horizon_h,
            event.reason
        );
        self.open_event = Some(event.clone());
        AlertTransition {
            event,
            superseded: closed,
        }
    }

    fn new_event(
        &self,
        level: AlertLevel,
        previous: AlertLevel,
        reason: String,
        raised_at: DateTime<Utc>,
        cleared_at: Option<DateTime<Utc>>,
    ) -> AlertEvent {
        AlertEvent {
            id: Uuid::new_v4(),
            node_id: self.node_id.clone(),
            horizon_h: self.horizon_h,
            level,
            previous_level: previous,
            raised_at,
            cleared_at,
            reason,
        }
    }
}

/// Early trigger with every threshold scaled by `scale`.
fn early_reason(cfg: &AlertConfig, input: &AlertInput, scale: f64) -> Option<String> {
    let threshold = cfg.early_probability * scale;
    if input.probability >= threshold {
        return Some(format!("probability {:.3} >= {:.3}", input.probability, threshold));
    }
    let rise_threshold = cfg.early_rise_m * scale;
    let rain_threshold = cfg.early_rain_mm * scale;
    match (input.rise_10m, input.rain_mm) {
        (Some(rise), Some(rain)) if rise >= rise_threshold && rain >= rain_threshold => Some(format!(
            "rise {:.3} m >= {:.3} m with rain {:.1} mm >= {:.1} mm",
            rise, rise_threshold, rain, rain_threshold
        )),
        _ => None,
    }
}

/// The level this evaluation argues for, one step from `confirmed` at most.
fn candidate(cfg: &AlertConfig, confirmed: AlertLevel, input: &AlertInput) -> (AlertLevel, String) {
    let band = 1.0 - cfg.hysteresis;
    match confirmed {
        AlertLevel::Normal => match early_reason(cfg, input, 1.0) {
            Some(reason) => (AlertLevel::Early, reason),
            None => (AlertLevel::Normal, String::new()),
        },
        AlertLevel::Early => {
            if input.probability >= cfg.high_probability {
                return (
                    AlertLevel::High,
                    format!("probability {:.3} >= {:.3}", input.probability, cfg.high_probability),
                );
            }
            match early_reason(cfg, input, band) {
                Some(_) => (AlertLevel::Early, String::new()),
                None => (
                    AlertLevel::Normal,
                    format!(
                        "probability {:.3} and rise/rain below the {:.0}% hysteresis band",
                        input.probability,
                        cfg.hysteresis * 100.0
                    ),
                ),
            }
        }
        AlertLevel::High => {
            let floor = cfg.high_probability * band;
            if input.probability < floor {
                (
                    AlertLevel::Early,
                    format!("probability {:.3} < {:.3}", input.probability, floor),
                )
            } else {
                (AlertLevel::High, String::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        "2025-11-03T02:00:00Z".parse().unwrap()
    }

    fn at(min: i64, probability: f64) -> AlertInput {
        AlertInput {
            ts: t0() + Duration::minutes(min),
            probability,
            rise_10m: Some(0.0),
            rain_mm: Some(0.0),
        }
    }

    fn run(session: &mut AlertSession, inputs: &[AlertInput]) -> Vec<AlertTransition> {
        let cfg = AlertConfig::default();
        inputs.iter().filter_map(|i| session.evaluate(&cfg, i)).collect()
    }

    #[test]
    fn test_oscillation_commits_nothing() {
        let mut s = AlertSession::new("CM-01", 6);
        let inputs: Vec<AlertInput> = (0..=5)
            .map(|i| at(i * 2, if i % 2 == 0 { 0.55 } else { 0.62 }))
            .collect();
        assert!(run(&mut s, &inputs).is_empty());
        assert_eq!(s.confirmed(), AlertLevel::Normal);
    }

    #[test]
    fn test_held_trigger_commits_exactly_once() {
        let mut s = AlertSession::new("CM-01", 6);
        let inputs: Vec<AlertInput> = (0..=8).map(|i| at(i * 5, 0.65)).collect();
        let transitions = run(&mut s, &inputs);
        assert_eq!(transitions.len(), 1);
        let e = &transitions[0].event;
        assert_eq!(e.level, AlertLevel::Early);
        assert_eq!(e.previous_level, AlertLevel::Normal);
        assert_eq!(e.raised_at, t0() + Duration::minutes(30));
        assert_eq!(e.cleared_at, None);
    }

    #[test]
    fn test_restored_session_clears_the_open_event() {
        let mut first = AlertSession::new("CM-01", 6);
        let raised = run(&mut first, &(0..=6).map(|i| at(i * 5, 0.65)).collect::<Vec<_>>());
        let open = raised[0].event.clone();

        let mut resumed = AlertSession::restore(open.clone());
        assert_eq!(resumed.confirmed(), AlertLevel::Early);
        // Still high: no duplicate raise, and stale inputs are ignored
        assert!(run(&mut resumed, &[at(20, 0.65), at(40, 0.65)]).is_empty());

        let cleared = run(&mut resumed, &[at(50, 0.2), at(80, 0.2)]);
        assert_eq!(cleared.len(), 1);
        assert_eq!(cleared[0].event.id, open.id);
        assert_eq!(cleared[0].event.cleared_at, Some(t0() + Duration::minutes(80)));
        assert_eq!(resumed.confirmed(), AlertLevel::Normal);
    }

    #[test]
    fn test_not_yet_held_long_enough() {
        let mut s = AlertSession::new("CM-01", 6);
        assert!(run(&mut s, &[at(0, 0.65), at(29, 0.65)]).is_empty());
        assert_eq!(s.pending().map(|(l, _)| l), Some(AlertLevel::Early));
    }

    #[test]
    fn test_reversal_resets_the_timer() {
        let mut s = AlertSession::new("CM-01", 6);
        let transitions = run(
            &mut s,
            &[at(0, 0.65), at(20, 0.4), at(25, 0.65), at(50, 0.65), at(55, 0.65)],
        );
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].event.raised_at, t0() + Duration::minutes(55));
    }

    #[test]
    fn test_rise_and_rain_trigger() {
        let mut s = AlertSession::new("CM-01", 6);
        let surge = |min| AlertInput {
            ts: t0() + Duration::minutes(min),
            probability: 0.1,
            rise_10m: Some(0.09),
            rain_mm: Some(12.0),
        };
        let transitions = run(&mut s, &[surge(0), surge(30)]);
        assert_eq!(transitions.len(), 1);
        assert!(transitions[0].event.reason.starts_with("rise"));

        // Rise alone is not enough
        let mut s = AlertSession::new("CM-01", 6);
        let rise_only = |min| AlertInput {
            rain_mm: Some(2.0),
            ..surge(min)
        };
        assert!(run(&mut s, &[rise_only(0), rise_only(30)]).is_empty());
    }

    #[test]
    fn test_hysteresis_band_holds_early() {
        let mut s = AlertSession::new("CM-01", 6);
        run(&mut s, &[at(0, 0.65), at(30, 0.65)]);
        assert_eq!(s.confirmed(), AlertLevel::Early);
        // 0.57 is below 0.60 but above 0.60 × 0.92 = 0.552
        let inputs: Vec<AlertInput> = (7..=20).map(|i| at(i * 5, 0.57)).collect();
        assert!(run(&mut s, &inputs).is_empty());
        assert_eq!(s.confirmed(), AlertLevel::Early);
    }

    #[test]
    fn test_rise_and_rain_keep_early_inside_band() {
        let mut s = AlertSession::new("CM-01", 6);
        run(&mut s, &[at(0, 0.65), at(30, 0.65)]);
        let wet = |min| AlertInput {
            ts: t0() + Duration::minutes(min),
            probability: 0.3,
            rise_10m: Some(0.075),
            rain_mm: Some(9.5),
        };
        assert!(run(&mut s, &[wet(40), wet(80)]).is_empty());
        assert_eq!(s.confirmed(), AlertLevel::Early);
    }

    #[test]
    fn test_clear_reemits_open_event() {
        let mut s = AlertSession::new("CM-01", 6);
        let raised = run(&mut s, &[at(0, 0.65), at(30, 0.65)]).remove(0).event;
        let cleared = run(&mut s, &[at(40, 0.5), at(70, 0.5)]);
        assert_eq!(cleared.len(), 1);
        let e = &cleared[0].event;
        assert_eq!(e.id, raised.id);
        assert_eq!(e.level, AlertLevel::Early);
        assert_eq!(e.raised_at, raised.raised_at);
        assert_eq!(e.cleared_at, Some(t0() + Duration::minutes(70)));
        assert_eq!(s.confirmed(), AlertLevel::Normal);
    }

    #[test]
    fn test_high_only_via_early() {
        let mut s = AlertSession::new("CM-01", 12);
        let first = run(&mut s, &[at(0, 0.9), at(30, 0.9)]);
        assert_eq!(first[0].event.level, AlertLevel::Early);

        let second = run(&mut s, &[at(35, 0.9), at(65, 0.9)]);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].event.level, AlertLevel::High);
        assert_eq!(second[0].event.previous_level, AlertLevel::Early);
        let superseded = second[0].superseded.as_ref().unwrap();
        assert_eq!(superseded.id, first[0].event.id);
        assert_eq!(superseded.cleared_at, Some(t0() + Duration::minutes(65)));
    }

    #[test]
    fn test_high_demotes_to_early_below_band() {
        let mut s = AlertSession::new("CM-01", 12);
        run(&mut s, &[at(0, 0.9), at(30, 0.9), at(35, 0.9), at(65, 0.9)]);
        assert_eq!(s.confirmed(), AlertLevel::High);
        // 0.66 is inside the band (0.70 × 0.92 = 0.644)
        assert!(run(&mut s, &[at(70, 0.66), at(110, 0.66)]).is_empty());
        let down = run(&mut s, &[at(115, 0.62), at(145, 0.62)]);
        assert_eq!(down[0].event.level, AlertLevel::Early);
        assert_eq!(down[0].event.previous_level, AlertLevel::High);
    }

    #[test]
    fn test_stale_evaluations_ignored() {
        let mut s = AlertSession::new("CM-01", 6);
        run(&mut s, &[at(10, 0.65)]);
        // Earlier and equal timestamps do not advance or reset anything
        assert!(run(&mut s, &[at(5, 0.1), at(10, 0.1)]).is_empty());
        assert_eq!(s.pending().map(|(l, _)| l), Some(AlertLevel::Early));
        assert_eq!(run(&mut s, &[at(40, 0.65)]).len(), 1);
    }

    #[test]
    fn test_zero_debounce_commits_immediately() {
        let cfg = AlertConfig {
            debounce_min: 0,
            ..AlertConfig::default()
        };
        let mut s = AlertSession::new("CM-01", 6);
        assert!(s.evaluate(&cfg, &at(0, 0.65)).is_some());
    }
}
