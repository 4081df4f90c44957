//! Open-Meteo hourly precipitation source.
//!
//! Requests the hourly `precipitation` series in GMT and reads the value for
//! the hour containing now.

use chrono::{DateTime, DurationRound, NaiveDateTime, TimeDelta, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Deserialize;

use super::{RainForecast, SourceFetchError, WeatherSource};

const OPEN_METEO_API_URL: &str = "https://api.open-meteo.com/v1/forecast";

#[derive(Debug, Clone)]
pub struct OpenMeteoSource {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct OpenMeteoResponse {
    hourly: OpenMeteoHourly,
}

#[derive(Debug, Deserialize)]
struct OpenMeteoHourly {
    time: Vec<String>,
    precipitation: Vec<Option<f64>>,
}

impl Default for OpenMeteoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenMeteoSource {
    pub fn new() -> Self {
        Self::with_base_url(OPEN_METEO_API_URL)
    }

    pub fn with_base_url(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .build()
            .expect("Failed to build HTTP client");
        Self {
            client,
            base_url: base_url.to_string(),
        }
    }

    async fn fetch_rain(&self, lat: f64, lon: f64) -> Result<RainForecast, SourceFetchError> {
        let url = format!(
            "{}?latitude={:.4}&longitude={:.4}&hourly=precipitation&timezone=GMT&forecast_days=2",
            self.base_url, lat, lon
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SourceFetchError::Http(format!("Open-Meteo request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(SourceFetchError::Status(response.status().as_u16()));
        }

        let body: OpenMeteoResponse = response
            .json()
            .await
            .map_err(|e| SourceFetchError::Parse(format!("Open-Meteo JSON parse error: {}", e)))?;

        let now = Utc::now();
        Ok(RainForecast {
            rain_next_hour_mm: rain_for_hour(&body.hourly, now)?,
            observed_at: now,
        })
    }
}

/// The series value for the hour containing `now`.
fn rain_for_hour(hourly: &OpenMeteoHourly, now: DateTime<Utc>) -> Result<f64, SourceFetchError> {
    let hour = now
        .duration_trunc(TimeDelta::hours(1))
        .map_err(|e| SourceFetchError::Parse(e.to_string()))?
        .naive_utc();

    let idx = hourly
        .time
        .iter()
        .position(|t| NaiveDateTime::parse_from_str(t, "%Y-%m-%dT%H:%M").is_ok_and(|t| t == hour))
        .ok_or(SourceFetchError::NoData)?;

    hourly
        .precipitation
        .get(idx)
        .copied()
        .flatten()
        .ok_or(SourceFetchError::NoData)
}

impl WeatherSource for OpenMeteoSource {
    fn id(&self) -> &str {
        "open_meteo"
    }

    fn fetch(&self, latitude: f64, longitude: f64) -> BoxFuture<'_, Result<RainForecast, SourceFetchError>> {
        self.fetch_rain(latitude, longitude).boxed()
    }
}
