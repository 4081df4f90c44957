use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use utoipa::ToSchema;

/// Application configuration, parsed from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// PostgreSQL URL. When unset the service runs on the in-memory store.
    pub database_url: Option<String>,
    pub yr_user_agent: String,
    pub port: u16,
    /// Optional JSON rules file; built-in defaults are used when unset.
    pub rules_path: Option<String>,
    /// First segment of subscribe topics: `<namespace>/nodes/<node_id>/telemetry`.
    pub topic_namespace: String,
    /// Enabled weather sources, e.g. `yr,open_meteo,simulator`.
    pub weather_sources: Vec<String>,
    /// Constant rainfall reported by the simulated source, mm.
    pub simulator_rain_mm: f64,
    pub default_latitude: Option<f64>,
    pub default_longitude: Option<f64>,
    /// Cadence of the background re-evaluation loop.
    pub eval_interval_secs: u64,
    pub json_logs: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            yr_user_agent: std::env::var("YR_USER_AGENT").unwrap_or_else(|_| {
                "FloodAlertApi/0.1 flood-alert-api".to_string()
            }),
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .expect("PORT must be a valid u16"),
            rules_path: std::env::var("RULES_PATH").ok().filter(|s| !s.is_empty()),
            topic_namespace: std::env::var("TOPIC_NAMESPACE")
                .unwrap_or_else(|_| "flood".to_string()),
            weather_sources: parse_list(
                &std::env::var("WEATHER_SOURCES").unwrap_or_else(|_| "simulator".to_string()),
            ),
            simulator_rain_mm: std::env::var("SIMULATOR_RAIN_MM")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0),
            default_latitude: std::env::var("DEFAULT_LATITUDE")
                .ok()
                .and_then(|v| v.parse().ok()),
            default_longitude: std::env::var("DEFAULT_LONGITUDE")
                .ok()
                .and_then(|v| v.parse().ok()),
            eval_interval_secs: std::env::var("EVAL_INTERVAL_SECS")
                .unwrap_or_else(|_| "600".to_string())
                .parse()
                .expect("EVAL_INTERVAL_SECS must be a positive integer"),
            json_logs: std::env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        }
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

// ---------------------------------------------------------------------------
// Rules: loaded once at startup, shared read-only via Arc
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading rules file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Rules file is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid rules: {0}")]
    Invalid(String),
}

/// Versioned thresholds and model coefficients for the whole pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct RulesConfig {
    pub version: u32,
    pub ingest: IngestConfig,
    pub qc: QcConfig,
    pub calibration: CalibrationConfig,
    pub weather: WeatherConfig,
    pub forecast: ForecastConfig,
    pub alert: AlertConfig,
    /// Site used for nodes without an entry in `nodes`.
    pub default_site: NodeSite,
    pub nodes: HashMap<String, NodeSite>,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            version: 1,
            ingest: IngestConfig::default(),
            qc: QcConfig::default(),
            calibration: CalibrationConfig::default(),
            weather: WeatherConfig::default(),
            forecast: ForecastConfig::default(),
            alert: AlertConfig::default(),
            default_site: NodeSite::default(),
            nodes: HashMap::new(),
        }
    }
}

impl RulesConfig {
    /// Load rules from a JSON file, or fall back to defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let rules = match path {
            Some(p) => {
                let contents = std::fs::read_to_string(p)?;
                serde_json::from_str::<RulesConfig>(&contents)?
            }
            None => RulesConfig::default(),
        };
        rules.validate()?;
        Ok(rules)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let a = &self.alert;
        for (name, p) in [
            ("early_probability", a.early_probability),
            ("high_probability", a.high_probability),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(ConfigError::Invalid(format!("{} must be within [0, 1]", name)));
            }
        }
        if a.early_probability > a.high_probability {
            return Err(ConfigError::Invalid(
                "early_probability must not exceed high_probability".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&a.hysteresis) {
            return Err(ConfigError::Invalid("hysteresis must be within [0, 1)".to_string()));
        }
        if self.ingest.max_clock_skew_secs < 0 {
            return Err(ConfigError::Invalid("ingest.max_clock_skew_secs must not be negative".to_string()));
        }
        if self.forecast.max_observation_age_min <= 0 {
            return Err(ConfigError::Invalid("forecast.max_observation_age_min must be positive".to_string()));
        }
        if self.qc.dist_min_m >= self.qc.dist_max_m {
            return Err(ConfigError::Invalid("qc.dist_min_m must be below dist_max_m".to_string()));
        }
        if self.forecast.horizons.is_empty() {
            return Err(ConfigError::Invalid("at least one forecast horizon is required".to_string()));
        }
        if self.weather.max_attempts == 0 {
            return Err(ConfigError::Invalid("weather.max_attempts must be at least 1".to_string()));
        }
        if self.calibration.h0_grid_step_m <= 0.0 {
            return Err(ConfigError::Invalid("calibration.h0_grid_step_m must be positive".to_string()));
        }
        Ok(())
    }

    pub fn site_for(&self, node_id: &str) -> &NodeSite {
        self.nodes.get(node_id).unwrap_or(&self.default_site)
    }
}

/// Acceptance limits applied before QC.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct IngestConfig {
    /// How far a record's timestamp may run ahead of the service clock.
    pub max_clock_skew_secs: i64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_clock_skew_secs: 300,
        }
    }
}

/// Quality-control thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct QcConfig {
    pub dist_min_m: f64,
    pub dist_max_m: f64,
    pub neg_h_min_m: f64,
    pub spike_delta_m: f64,
    pub spike_lookback_min: i64,
    /// How far the reference sample may sit from `t − lookback`.
    pub spike_tolerance_min: i64,
    pub q_max_m3s: f64,
    /// How much per-node history the pipeline keeps for lookbacks.
    pub history_window_min: i64,
}

impl Default for QcConfig {
    fn default() -> Self {
        Self {
            dist_min_m: 0.05,
            dist_max_m: 5.0,
            neg_h_min_m: -0.02,
            spike_delta_m: 0.15,
            spike_lookback_min: 10,
            spike_tolerance_min: 5,
            q_max_m3s: 1000.0,
            history_window_min: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct CalibrationConfig {
    pub min_r_squared: f64,
    pub min_samples: usize,
    pub h0_grid_step_m: f64,
    pub max_iterations: usize,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            min_r_squared: 0.5,
            min_samples: 5,
            h0_grid_step_m: 0.001,
            max_iterations: 500,
        }
    }
}

/// Weather aggregation timing, caching and scoring.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct WeatherConfig {
    pub attempt_timeout_ms: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Deadline for the whole fan-out; sources still pending are skipped.
    pub overall_timeout_ms: u64,
    pub cache_ttl_secs: i64,
    pub staleness_half_life_secs: i64,
    /// Oldest observation accepted into a consensus.
    pub horizon_cutoff_secs: i64,
    /// Contributing sources needed for an `OK` consensus.
    pub quorum: usize,
    pub max_plausible_mm: f64,
    /// Per-source reliability weight; sources not listed weigh 1.0.
    pub reliability: HashMap<String, f64>,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: 4_000,
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 4_000,
            overall_timeout_ms: 10_000,
            cache_ttl_secs: 300,
            staleness_half_life_secs: 600,
            horizon_cutoff_secs: 3_600,
            quorum: 2,
            max_plausible_mm: 200.0,
            reliability: HashMap::new(),
        }
    }
}

impl WeatherConfig {
    pub fn reliability_of(&self, source_id: &str) -> f64 {
        self.reliability.get(source_id).copied().unwrap_or(1.0)
    }
}

/// How the forecast engine treats QC-flagged records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FlaggedPolicy {
    Include,
    DownWeight,
    Exclude,
}

/// Logistic scoring coefficients for one horizon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct HorizonModel {
    pub horizon_h: u32,
    pub intercept: f64,
    /// Per metre of effective head
    pub w_head: f64,
    /// Per metre of rise over 10 minutes
    pub w_rise: f64,
    /// Per mm of rain expected next hour
    pub w_rain: f64,
    /// Per m³/s of discharge
    #[serde(default)]
    pub w_discharge: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct ForecastConfig {
    pub horizons: Vec<HorizonModel>,
    pub flagged_policy: FlaggedPolicy,
    /// Scale on hydraulic terms under `down_weight`.
    pub flagged_weight: f64,
    /// Longest lead over which the rise rate is extrapolated for `predicted_q`.
    pub projection_cap_h: f64,
    /// Observations older than this at evaluation time no longer feed the
    /// hydraulic terms.
    pub max_observation_age_min: i64,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            horizons: vec![
                HorizonModel {
                    horizon_h: 6,
                    intercept: -4.0,
                    w_head: 6.0,
                    w_rise: 25.0,
                    w_rain: 0.12,
                    w_discharge: 0.0,
                },
                HorizonModel {
                    horizon_h: 12,
                    intercept: -3.6,
                    w_head: 5.0,
                    w_rise: 20.0,
                    w_rain: 0.15,
                    w_discharge: 0.0,
                },
            ],
            flagged_policy: FlaggedPolicy::DownWeight,
            flagged_weight: 0.5,
            projection_cap_h: 1.0,
            max_observation_age_min: 60,
        }
    }
}

/// Alert promotion thresholds, hysteresis band and debounce.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct AlertConfig {
    pub early_probability: f64,
    pub early_rise_m: f64,
    pub early_rain_mm: f64,
    pub high_probability: f64,
    /// Fractional dead-band below a threshold before demotion (0.08 = 8%).
    pub hysteresis: f64,
    pub debounce_min: i64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            early_probability: 0.60,
            early_rise_m: 0.08,
            early_rain_mm: 10.0,
            high_probability: 0.70,
            hysteresis: 0.08,
            debounce_min: 30,
        }
    }
}

/// Where a node sits, for weather lookups, and its mounting height.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct NodeSite {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub sensor_height_above_crest_m: Option<f64>,
}

impl Default for NodeSite {
    fn default() -> Self {
        Self {
            latitude: 9.4351,
            longitude: 105.4632,
            sensor_height_above_crest_m: None,
        }
    }
}
