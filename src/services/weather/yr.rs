//! yr.no Locationforecast 2.0 rainfall source.
//!
//! Reads `next_1_hours.details.precipitation_amount` from the timeseries entry
//! closest to now. Falls back to the hourly average of `next_6_hours` when the
//! one-hour block is missing (far end of the series).
//! See: https://api.met.no/weatherapi/locationforecast/2.0/documentation

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;

use super::{RainForecast, SourceFetchError, WeatherSource};

const YR_API_URL: &str = "https://api.met.no/weatherapi/locationforecast/2.0/compact";

/// Entries further than this from now are not a usable "next hour".
const MAX_ENTRY_OFFSET_SECS: i64 = 90 * 60;

#[derive(Debug, Clone)]
pub struct YrSource {
    client: reqwest::Client,
    user_agent: String,
    base_url: String,
}

// --- yr.no JSON response types ---

#[derive(Debug, Deserialize)]
struct YrResponse {
    properties: YrProperties,
}

#[derive(Debug, Deserialize)]
struct YrProperties {
    timeseries: Vec<YrTimeseries>,
}

#[derive(Debug, Deserialize)]
struct YrTimeseries {
    time: DateTime<Utc>,
    data: YrData,
}

#[derive(Debug, Deserialize)]
struct YrData {
    next_1_hours: Option<YrPeriod>,
    next_6_hours: Option<YrPeriod>,
}

#[derive(Debug, Deserialize)]
struct YrPeriod {
    details: Option<YrPeriodDetails>,
}

#[derive(Debug, Deserialize)]
struct YrPeriodDetails {
    precipitation_amount: Option<f64>,
}

impl YrSource {
    pub fn new(user_agent: &str) -> Self {
        Self::with_base_url(user_agent, YR_API_URL)
    }

    pub fn with_base_url(user_agent: &str, base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .build()
            .expect("Failed to build HTTP client");
        Self {
            client,
            user_agent: user_agent.to_string(),
            base_url: base_url.to_string(),
        }
    }

    async fn fetch_rain(&self, lat: f64, lon: f64) -> Result<RainForecast, SourceFetchError> {
        // Limit to 4 decimal places per yr.no terms of service
        let url = format!("{}?lat={:.4}&lon={:.4}", self.base_url, lat, lon);

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&self.user_agent)
                .map_err(|e| SourceFetchError::Http(format!("invalid User-Agent: {}", e)))?,
        );

        let response = self
            .client
            .get(&url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| SourceFetchError::Http(format!("yr.no request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(SourceFetchError::Status(response.status().as_u16()));
        }

        let body: YrResponse = response
            .json()
            .await
            .map_err(|e| SourceFetchError::Parse(format!("yr.no JSON parse error: {}", e)))?;

        let now = Utc::now();
        let rain = rain_next_hour(&body, now)?;
        Ok(RainForecast {
            rain_next_hour_mm: rain,
            observed_at: now,
        })
    }
}

/// Rain over the hour following the entry closest to `now`.
fn rain_next_hour(body: &YrResponse, now: DateTime<Utc>) -> Result<f64, SourceFetchError> {
    let closest = body
        .properties
        .timeseries
        .iter()
        .min_by_key(|ts| (ts.time - now).num_seconds().unsigned_abs())
        .ok_or(SourceFetchError::NoData)?;

    if (closest.time - now).num_seconds().abs() > MAX_ENTRY_OFFSET_SECS {
        return Err(SourceFetchError::NoData);
    }

    let amount = |p: &Option<YrPeriod>| {
        p.as_ref()
            .and_then(|p| p.details.as_ref())
            .and_then(|d| d.precipitation_amount)
    };

    amount(&closest.data.next_1_hours)
        .or_else(|| amount(&closest.data.next_6_hours).map(|six| six / 6.0))
        .ok_or(SourceFetchError::NoData)
}

impl WeatherSource for YrSource {
    fn id(&self) -> &str {
        "yr"
    }

    fn fetch(&self, latitude: f64, longitude: f64) -> BoxFuture<'_, Result<RainForecast, SourceFetchError>> {
        self.fetch_rain(latitude, longitude).boxed()
    }
}
