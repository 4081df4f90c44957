//! Quality control.
//!
//! Rules tag records, they never drop them. Each rule is evaluated on its own:
//!
//! - `OUT_OF_RANGE_DIST`: distance outside `[dist_min, dist_max]`
//! - `NEG_H`: head below `neg_h_min`
//! - `SPIKES_H`: `|ΔH|` against the sample nearest `t − lookback` reaches `spike_delta`
//! - `OUT_OF_RANGE_Q`: discharge negative or above `q_max`
//!
//! Head rules are skipped when the head is unknown, the discharge rule when
//! the node has no profile.

use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

use crate::config::QcConfig;
use crate::domain::{HydraulicState, QcFlag, QcFlags, TelemetryObservation};

/// Slack on threshold comparisons so values that are equal on paper compare equal.
const EPSILON: f64 = 1e-9;

/// Recent accepted observations of one node, oldest first.
#[derive(Debug, Clone)]
pub struct NodeHistory {
    window: Duration,
    samples: VecDeque<TelemetryObservation>,
}

impl NodeHistory {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    pub fn latest(&self) -> Option<&TelemetryObservation> {
        self.samples.back()
    }

    pub fn last_ts(&self) -> Option<DateTime<Utc>> {
        self.latest().map(|o| o.record.ts)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Append and drop samples older than the window. The caller guarantees
    /// timestamps increase.
    pub fn push(&mut self, obs: TelemetryObservation) {
        let cutoff = obs.record.ts - self.window;
        self.samples.push_back(obs);
        while self
            .samples
            .front()
            .is_some_and(|o| o.record.ts < cutoff)
        {
            self.samples.pop_front();
        }
    }

    /// The sample closest to `target`, if one lies within `tolerance`.
    pub fn nearest(&self, target: DateTime<Utc>, tolerance: Duration) -> Option<&TelemetryObservation> {
        self.samples
            .iter()
            .filter(|o| (o.record.ts - target).abs() <= tolerance)
            .min_by_key(|o| (o.record.ts - target).abs())
    }

    /// Most recent sample without QC flags.
    pub fn last_unflagged(&self) -> Option<&TelemetryObservation> {
        self.samples.iter().rev().find(|o| o.flags.is_empty())
    }
}

/// Head change against the sample nearest `ts − lookback`.
///
/// `None` when the current head is unknown or no reference sample with a
/// known head lies inside the tolerance window.
pub fn head_change(
    cfg: &QcConfig,
    history: &NodeHistory,
    ts: DateTime<Utc>,
    h_m: Option<f64>,
) -> Option<f64> {
    let h = h_m?;
    let target = ts - Duration::minutes(cfg.spike_lookback_min);
    let reference = history.nearest(target, Duration::minutes(cfg.spike_tolerance_min))?;
    Some(h - reference.hydraulic.h_m?)
}

/// Apply every rule to one reading.
pub fn evaluate(cfg: &QcConfig, dist_m: f64, hydraulic: &HydraulicState, dh_10m: Option<f64>) -> QcFlags {
    let mut flags = QcFlags::new();

    if dist_m < cfg.dist_min_m - EPSILON || dist_m > cfg.dist_max_m + EPSILON {
        flags.insert(QcFlag::OutOfRangeDist);
    }
    if hydraulic.h_m.is_some_and(|h| h < cfg.neg_h_min_m - EPSILON) {
        flags.insert(QcFlag::NegH);
    }
    if dh_10m.is_some_and(|dh| dh.abs() >= cfg.spike_delta_m - EPSILON) {
        flags.insert(QcFlag::SpikesH);
    }
    if hydraulic
        .q_m3s
        .is_some_and(|q| q < 0.0 || q > cfg.q_max_m3s || !q.is_finite())
    {
        flags.insert(QcFlag::OutOfRangeQ);
    }

    flags
}
