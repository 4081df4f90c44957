//! Offline H–Q calibration.
//!
//! An operator submits measured (H, Q) pairs for a node; the fit produces
//! `a`, `b` and `H0` for `Q = a · (H − H0)^b`. Levenberg–Marquardt runs first,
//! seeded from a log-space grid search over `H0`; when it does not converge
//! to valid parameters the grid result is used as-is. A rejected fit never
//! touches the active profile.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use utoipa::ToSchema;

use super::hydraulic::{discharge, ProfileRegistry};
use crate::config::{CalibrationConfig, RulesConfig};
use crate::db::store::{PersistenceError, Store};
use crate::domain::HqProfile;

/// Initial LM damping.
const LM_LAMBDA_INIT: f64 = 1e-3;
/// Damping beyond which no descent direction is left.
const LM_LAMBDA_MAX: f64 = 1e16;
/// Relative SSE decrease below which the fit counts as converged.
const LM_SSE_TOLERANCE: f64 = 1e-10;
/// Relative parameter step below which the fit counts as converged.
const LM_STEP_TOLERANCE: f64 = 1e-8;

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("invalid calibration data: {reason} ({usable} usable samples)")]
    InvalidCalibrationData { usable: usize, reason: String },
    #[error("poor fit: R² {r_squared:.3} is below the minimum {min_r_squared:.3}")]
    PoorFit { r_squared: f64, min_r_squared: f64 },
    #[error("calibration import failed: {0}")]
    Import(String),
    #[error("a calibration is already running for node {0}")]
    InProgress(String),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("calibration task aborted: {0}")]
    Aborted(String),
}

/// One measured head/discharge pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CalibrationSample {
    /// Head above the crest, metres
    #[serde(rename = "H", alias = "h", alias = "h_m")]
    pub h_m: f64,
    /// Measured discharge, m³/s
    #[serde(rename = "Q", alias = "q", alias = "q_m3s")]
    pub q_m3s: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FitMethod {
    LevenbergMarquardt,
    LogGrid,
}

/// Fitted parameters with goodness of fit in linear Q space.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct HqFit {
    pub a: f64,
    pub b: f64,
    pub h0_m: f64,
    pub r_squared: f64,
    pub rmse: f64,
    pub n_samples: usize,
    pub method: FitMethod,
}

/// Result of a successful calibration, returned to the operator.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CalibrationReport {
    pub node_id: String,
    #[serde(flatten)]
    pub fit: HqFit,
    pub fitted_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Import
// ---------------------------------------------------------------------------

/// Parse an operator upload: a JSON array of `{H, Q}` objects, or a table
/// whose header has `H` and `Q` columns separated by `,`, `;` or tab.
///
/// Empty cells become NaN and are dropped by the fit.
pub fn parse_samples(body: &str) -> Result<Vec<CalibrationSample>, CalibrationError> {
    let trimmed = body.trim_start_matches('\u{feff}').trim();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed)
            .map_err(|e| CalibrationError::Import(format!("invalid JSON samples: {}", e)));
    }
    parse_table(trimmed)
}

fn parse_table(text: &str) -> Result<Vec<CalibrationSample>, CalibrationError> {
    let mut lines = text
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty());

    let (_, header) = lines
        .next()
        .ok_or_else(|| CalibrationError::Import("empty upload".to_string()))?;
    let delimiter = [',', ';', '\t']
        .into_iter()
        .find(|d| header.contains(*d))
        .ok_or_else(|| CalibrationError::Import("header must contain H and Q columns".to_string()))?;

    let columns: Vec<String> = header
        .split(delimiter)
        .map(|c| clean_cell(c).to_lowercase())
        .collect();
    let find = |names: &[&str]| columns.iter().position(|c| names.contains(&c.as_str()));
    let (h_idx, q_idx) = match (find(&["h", "h_m"]), find(&["q", "q_m3s"])) {
        (Some(h), Some(q)) => (h, q),
        _ => {
            return Err(CalibrationError::Import(
                "header must contain H and Q columns".to_string(),
            ))
        }
    };

    let mut samples = Vec::new();
    for (idx, line) in lines {
        let cells: Vec<&str> = line.split(delimiter).collect();
        let cell = |i: usize| parse_cell(cells.get(i).copied(), delimiter, idx + 1);
        samples.push(CalibrationSample {
            h_m: cell(h_idx)?,
            q_m3s: cell(q_idx)?,
        });
    }
    Ok(samples)
}

fn clean_cell(cell: &str) -> &str {
    cell.trim().trim_matches('"').trim()
}

fn parse_cell(cell: Option<&str>, delimiter: char, line: usize) -> Result<f64, CalibrationError> {
    let raw = cell.map(clean_cell).unwrap_or("");
    if raw.is_empty() {
        return Ok(f64::NAN);
    }
    // Semicolon-separated exports commonly use a decimal comma
    let normalized = if delimiter == ';' {
        raw.replace(',', ".")
    } else {
        raw.to_string()
    };
    normalized
        .parse::<f64>()
        .map_err(|_| CalibrationError::Import(format!("line {}: '{}' is not a number", line, raw)))
}

// ---------------------------------------------------------------------------
// Fit
// ---------------------------------------------------------------------------

/// Fit `Q = a · (H − H0)^b` to the usable samples.
pub fn fit_hq(samples: &[CalibrationSample], cfg: &CalibrationConfig) -> Result<HqFit, CalibrationError> {
    let (h, q): (Vec<f64>, Vec<f64>) = samples
        .iter()
        .filter(|s| s.h_m.is_finite() && s.q_m3s.is_finite() && s.h_m > 0.0 && s.q_m3s > 0.0)
        .map(|s| (s.h_m, s.q_m3s))
        .unzip();

    if h.len() < cfg.min_samples {
        return Err(CalibrationError::InvalidCalibrationData {
            usable: h.len(),
            reason: format!("at least {} samples with H > 0 and Q > 0 are required", cfg.min_samples),
        });
    }

    let grid = log_grid_fit(&h, &q, cfg.h0_grid_step_m).ok_or_else(|| {
        CalibrationError::InvalidCalibrationData {
            usable: h.len(),
            reason: "H values do not vary".to_string(),
        }
    })?;

    let (params, method) = match levenberg_marquardt(&h, &q, grid, cfg.max_iterations) {
        Some(p) => (p, FitMethod::LevenbergMarquardt),
        None => {
            tracing::debug!("LM fit did not converge, using log-grid result");
            (grid, FitMethod::LogGrid)
        }
    };

    let [a, b, h0] = params;
    let (r_squared, rmse) = linear_goodness(&h, &q, &params);
    if !(r_squared >= cfg.min_r_squared) {
        return Err(CalibrationError::PoorFit {
            r_squared,
            min_r_squared: cfg.min_r_squared,
        });
    }

    Ok(HqFit {
        a,
        b,
        h0_m: h0,
        r_squared,
        rmse,
        n_samples: h.len(),
        method,
    })
}

/// Best log-space OLS over `H0 ∈ [0, min H)`, by log-space R².
fn log_grid_fit(h: &[f64], q: &[f64], step: f64) -> Option<[f64; 3]> {
    let h_min = h.iter().copied().fold(f64::INFINITY, f64::min);
    let log_q: Vec<f64> = q.iter().map(|v| v.ln()).collect();

    let mut best: Option<([f64; 3], f64)> = None;
    let mut i = 0u64;
    loop {
        let h0 = i as f64 * step;
        if h0 >= h_min {
            break;
        }
        i += 1;

        let log_h: Vec<f64> = h.iter().map(|v| (v - h0).ln()).collect();
        let Some((a, b, r2)) = log_ols(&log_h, &log_q) else {
            continue;
        };
        if best.map_or(true, |(_, best_r2)| r2 > best_r2) {
            best = Some(([a, b, h0], r2));
        }
    }
    best.map(|(p, _)| p)
}

/// `ln q = ln a + b · ln h`; returns `(a, b, R²)`.
fn log_ols(x: &[f64], y: &[f64]) -> Option<(f64, f64, f64)> {
    let n = x.len() as f64;
    let x_mean = x.iter().sum::<f64>() / n;
    let y_mean = y.iter().sum::<f64>() / n;
    let sxx: f64 = x.iter().map(|v| (v - x_mean).powi(2)).sum();
    let sxy: f64 = x.iter().zip(y).map(|(xv, yv)| (xv - x_mean) * (yv - y_mean)).sum();
    if sxx <= 0.0 || !sxx.is_finite() {
        return None;
    }
    let b = sxy / sxx;
    let log_a = y_mean - b * x_mean;

    let ss_res: f64 = x.iter().zip(y).map(|(xv, yv)| (yv - (log_a + b * xv)).powi(2)).sum();
    let ss_tot: f64 = y.iter().map(|v| (v - y_mean).powi(2)).sum();
    let r2 = if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { 0.0 };
    Some((log_a.exp(), b, r2))
}

fn valid_params(p: &[f64; 3], h_min: f64) -> bool {
    p.iter().all(|v| v.is_finite()) && p[0] > 0.0 && p[1] > 0.0 && p[2] < h_min
}

fn sse(h: &[f64], q: &[f64], p: &[f64; 3]) -> f64 {
    h.iter()
        .zip(q)
        .map(|(hv, qv)| (qv - p[0] * (hv - p[2]).powf(p[1])).powi(2))
        .sum()
}

/// Damped Gauss–Newton on `(a, b, H0)` in linear space.
///
/// Returns `None` when the iteration budget runs out first.
fn levenberg_marquardt(h: &[f64], q: &[f64], seed: [f64; 3], max_iterations: usize) -> Option<[f64; 3]> {
    let h_min = h.iter().copied().fold(f64::INFINITY, f64::min);
    if !valid_params(&seed, h_min) {
        return None;
    }
    let mut p = seed;
    let mut current = sse(h, q, &p);
    let mut lambda = LM_LAMBDA_INIT;

    for _ in 0..max_iterations {
        let (jtj, jtr) = normal_equations(h, q, &p);

        let mut accepted = None;
        while lambda <= LM_LAMBDA_MAX {
            let mut damped = jtj;
            for (i, row) in damped.iter_mut().enumerate() {
                row[i] += lambda * jtj[i][i].max(1e-12);
            }
            if let Some(step) = solve3(damped, jtr) {
                let candidate = [p[0] + step[0], p[1] + step[1], p[2] + step[2]];
                if valid_params(&candidate, h_min) {
                    let next = sse(h, q, &candidate);
                    if next.is_finite() && next < current {
                        accepted = Some((candidate, next, step));
                        lambda = (lambda / 10.0).max(1e-12);
                        break;
                    }
                }
            }
            lambda *= 10.0;
        }

        // No step reduces the error: p is a local minimum
        let Some((candidate, next, step)) = accepted else {
            return Some(p);
        };

        let sse_converged = current - next <= LM_SSE_TOLERANCE * current;
        let step_converged = (0..3).all(|i| step[i].abs() / (p[i].abs() + 1e-8) < LM_STEP_TOLERANCE);
        p = candidate;
        current = next;
        if sse_converged || step_converged {
            return Some(p);
        }
    }
    None
}

/// `JᵀJ` and `Jᵀr` for the model Jacobian at `p`.
fn normal_equations(h: &[f64], q: &[f64], p: &[f64; 3]) -> ([[f64; 3]; 3], [f64; 3]) {
    let [a, b, h0] = *p;
    let mut jtj = [[0.0; 3]; 3];
    let mut jtr = [0.0; 3];
    for (hv, qv) in h.iter().zip(q) {
        let d = hv - h0;
        let d_b = d.powf(b);
        let j = [d_b, a * d_b * d.ln(), -a * b * d.powf(b - 1.0)];
        let r = qv - a * d_b;
        for i in 0..3 {
            jtr[i] += j[i] * r;
            for k in 0..3 {
                jtj[i][k] += j[i] * j[k];
            }
        }
    }
    (jtj, jtr)
}

/// Gaussian elimination with partial pivoting.
fn solve3(mut m: [[f64; 3]; 3], mut v: [f64; 3]) -> Option<[f64; 3]> {
    for col in 0..3 {
        let pivot = (col..3).max_by(|&x, &y| m[x][col].abs().total_cmp(&m[y][col].abs()))?;
        if m[pivot][col].abs() < 1e-300 {
            return None;
        }
        m.swap(col, pivot);
        v.swap(col, pivot);
        for row in col + 1..3 {
            let f = m[row][col] / m[col][col];
            for k in col..3 {
                m[row][k] -= f * m[col][k];
            }
            v[row] -= f * v[col];
        }
    }
    let mut x = [0.0; 3];
    for row in (0..3).rev() {
        let tail: f64 = (row + 1..3).map(|k| m[row][k] * x[k]).sum();
        x[row] = (v[row] - tail) / m[row][row];
    }
    x.iter().all(|v| v.is_finite()).then_some(x)
}

/// R² and RMSE of the fitted curve against Q in linear space.
fn linear_goodness(h: &[f64], q: &[f64], p: &[f64; 3]) -> (f64, f64) {
    let n = q.len() as f64;
    let mean = q.iter().sum::<f64>() / n;
    let ss_res: f64 = h
        .iter()
        .zip(q)
        .map(|(hv, qv)| (qv - discharge(p[0], p[1], hv - p[2])).powi(2))
        .sum();
    let ss_tot: f64 = q.iter().map(|v| (v - mean).powi(2)).sum();
    let r2 = if ss_tot > 0.0 { 1.0 - ss_res / ss_tot } else { 0.0 };
    (r2, (ss_res / n).sqrt())
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Runs fits per node, persists the result and swaps the active profile.
pub struct CalibrationService {
    store: Arc<dyn Store>,
    profiles: Arc<ProfileRegistry>,
    rules: Arc<RulesConfig>,
    running: Mutex<HashSet<String>>,
}

/// Marks a node's fit as running until dropped.
struct RunningFit<'a> {
    running: &'a Mutex<HashSet<String>>,
    node_id: String,
}

impl Drop for RunningFit<'_> {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.node_id);
    }
}

impl CalibrationService {
    pub fn new(store: Arc<dyn Store>, profiles: Arc<ProfileRegistry>, rules: Arc<RulesConfig>) -> Self {
        Self {
            store,
            profiles,
            rules,
            running: Mutex::new(HashSet::new()),
        }
    }

    fn begin(&self, node_id: &str) -> Result<RunningFit<'_>, CalibrationError> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if !running.insert(node_id.to_string()) {
            return Err(CalibrationError::InProgress(node_id.to_string()));
        }
        Ok(RunningFit {
            running: &self.running,
            node_id: node_id.to_string(),
        })
    }

    /// Fit, persist, then publish. Any failure keeps the previous profile.
    pub async fn calibrate(
        &self,
        node_id: &str,
        samples: Vec<CalibrationSample>,
    ) -> Result<CalibrationReport, CalibrationError> {
        let _running = self.begin(node_id)?;

        let cfg = self.rules.calibration.clone();
        let submitted = samples.len();
        let fit = tokio::task::spawn_blocking(move || fit_hq(&samples, &cfg))
            .await
            .map_err(|e| CalibrationError::Aborted(e.to_string()))?
            .inspect_err(|e| tracing::warn!("Calibration for {} rejected: {}", node_id, e))?;

        let fitted_at = Utc::now();
        let profile = HqProfile {
            node_id: node_id.to_string(),
            a: fit.a,
            b: fit.b,
            h0_m: fit.h0_m,
            r_squared: fit.r_squared,
            rmse: fit.rmse,
            fitted_at,
        };
        self.store.insert_profile(&profile).await?;
        self.profiles.replace(profile);

        tracing::info!(
            "Calibrated {}: a={:.4} b={:.4} H0={:.4} R²={:.4} ({} of {} samples, {:?})",
            node_id,
            fit.a,
            fit.b,
            fit.h0_m,
            fit.r_squared,
            fit.n_samples,
            submitted,
            fit.method
        );

        Ok(CalibrationReport {
            node_id: node_id.to_string(),
            fit,
            fitted_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::store::MemoryStore;

    /// Deterministic normal deviates for synthetic noise.
    struct Lcg(u64);

    impl Lcg {
        fn uniform(&mut self) -> f64 {
            self.0 = self
                .0
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (self.0 >> 11) as f64 / (1u64 << 53) as f64
        }

        fn gaussian(&mut self) -> f64 {
            let u1 = self.uniform().max(1e-12);
            let u2 = self.uniform();
            (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
        }
    }

    fn synthetic(n: usize, noise: f64) -> Vec<CalibrationSample> {
        let mut rng = Lcg(42);
        (0..n)
            .map(|i| {
                let h = 0.15 + i as f64 * (0.85 / (n - 1) as f64);
                let q = 2.0 * (h - 0.1_f64).powf(1.5) * (1.0 + noise * rng.gaussian());
                CalibrationSample { h_m: h, q_m3s: q }
            })
            .collect()
    }

    fn within(actual: f64, expected: f64, tolerance: f64) -> bool {
        (actual - expected).abs() <= tolerance * expected.abs()
    }

    #[test]
    fn test_fit_recovers_parameters_from_noisy_data() {
        let fit = fit_hq(&synthetic(40, 0.02), &CalibrationConfig::default()).unwrap();
        assert!(within(fit.a, 2.0, 0.10), "a = {}", fit.a);
        assert!(within(fit.b, 1.5, 0.10), "b = {}", fit.b);
        assert!(within(fit.h0_m, 0.1, 0.10), "H0 = {}", fit.h0_m);
        assert!(fit.r_squared > 0.95);
        assert_eq!(fit.n_samples, 40);
        assert_eq!(fit.method, FitMethod::LevenbergMarquardt);
    }

    #[test]
    fn test_grid_fallback_when_lm_does_not_run() {
        let cfg = CalibrationConfig {
            max_iterations: 0,
            ..CalibrationConfig::default()
        };
        let fit = fit_hq(&synthetic(30, 0.0), &cfg).unwrap();
        assert_eq!(fit.method, FitMethod::LogGrid);
        assert!((fit.h0_m - 0.1).abs() < 0.002);
        assert!(within(fit.b, 1.5, 0.02));
        assert!(fit.r_squared > 0.99);
    }

    #[test]
    fn test_unusable_samples_are_dropped() {
        let mut samples = synthetic(4, 0.0);
        samples.push(CalibrationSample { h_m: f64::NAN, q_m3s: 1.0 });
        samples.push(CalibrationSample { h_m: 0.5, q_m3s: 0.0 });
        samples.push(CalibrationSample { h_m: -0.1, q_m3s: 1.0 });
        let err = fit_hq(&samples, &CalibrationConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            CalibrationError::InvalidCalibrationData { usable: 4, .. }
        ));
    }

    #[test]
    fn test_constant_head_is_invalid() {
        let samples: Vec<CalibrationSample> = (0..6)
            .map(|i| CalibrationSample { h_m: 0.4, q_m3s: 1.0 + i as f64 })
            .collect();
        assert!(matches!(
            fit_hq(&samples, &CalibrationConfig::default()),
            Err(CalibrationError::InvalidCalibrationData { .. })
        ));
    }

    #[test]
    fn test_uncorrelated_data_is_poor_fit() {
        let samples: Vec<CalibrationSample> = (0..10)
            .map(|i| CalibrationSample {
                h_m: 0.2 + 0.1 * i as f64,
                q_m3s: if i % 2 == 0 { 1.0 } else { 5.0 },
            })
            .collect();
        assert!(matches!(
            fit_hq(&samples, &CalibrationConfig::default()),
            Err(CalibrationError::PoorFit { .. })
        ));
    }

    #[test]
    fn test_parse_csv_with_mixed_case_header() {
        let body = "time,h,Q\n1,0.2,0.1\n2,0.3,\n3,0.4,0.5\n";
        let samples = parse_samples(body).unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0], CalibrationSample { h_m: 0.2, q_m3s: 0.1 });
        assert!(samples[1].q_m3s.is_nan());
    }

    #[test]
    fn test_parse_semicolon_with_decimal_comma() {
        let samples = parse_samples("H;Q\n0,25;0,12\n").unwrap();
        assert_eq!(samples, vec![CalibrationSample { h_m: 0.25, q_m3s: 0.12 }]);
    }

    #[test]
    fn test_parse_json_samples() {
        let samples = parse_samples(r#"[{"H": 0.3, "Q": 0.2}, {"h": 0.4, "q": 0.3}]"#).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].h_m, 0.4);
    }

    #[test]
    fn test_parse_rejects_missing_columns_and_bad_numbers() {
        assert!(matches!(parse_samples("a,b\n1,2"), Err(CalibrationError::Import(_))));
        assert!(matches!(parse_samples("H,Q\n0.2,abc"), Err(CalibrationError::Import(_))));
        assert!(matches!(parse_samples(""), Err(CalibrationError::Import(_))));
    }

    fn service() -> (CalibrationService, Arc<ProfileRegistry>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let profiles = Arc::new(ProfileRegistry::new());
        let svc = CalibrationService::new(store.clone(), profiles.clone(), Arc::new(RulesConfig::default()));
        (svc, profiles, store)
    }

    #[tokio::test]
    async fn test_calibrate_persists_and_publishes() {
        let (svc, profiles, store) = service();
        let report = svc.calibrate("CM-01", synthetic(40, 0.02)).await.unwrap();
        assert_eq!(report.node_id, "CM-01");

        let active = profiles.get("CM-01").unwrap();
        assert_eq!(active.a, report.fit.a);
        assert_eq!(store.active_profiles().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_poor_fit_keeps_previous_profile() {
        let (svc, profiles, _) = service();
        svc.calibrate("CM-01", synthetic(40, 0.02)).await.unwrap();
        let before = profiles.get("CM-01").unwrap();

        let noise: Vec<CalibrationSample> = (0..10)
            .map(|i| CalibrationSample {
                h_m: 0.2 + 0.1 * i as f64,
                q_m3s: if i % 2 == 0 { 1.0 } else { 5.0 },
            })
            .collect();
        let err = svc.calibrate("CM-01", noise).await.unwrap_err();
        assert!(matches!(err, CalibrationError::PoorFit { .. }));
        assert_eq!(*profiles.get("CM-01").unwrap(), *before);
    }

    #[tokio::test]
    async fn test_failed_store_keeps_previous_profile() {
        let (svc, profiles, store) = service();
        store.set_unavailable(true);
        let err = svc.calibrate("CM-01", synthetic(40, 0.02)).await.unwrap_err();
        assert!(matches!(err, CalibrationError::Persistence(_)));
        assert!(profiles.get("CM-01").is_none());
    }

    #[test]
    fn test_concurrent_fit_for_same_node_is_refused() {
        let (svc, _, _) = service();
        let guard = svc.begin("CM-01").unwrap();
        assert!(matches!(svc.begin("CM-01"), Err(CalibrationError::InProgress(_))));
        assert!(svc.begin("CM-02").is_ok());
        drop(guard);
        assert!(svc.begin("CM-01").is_ok());
    }
}
