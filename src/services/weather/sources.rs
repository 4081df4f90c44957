//! Deterministic in-process weather source.
//!
//! Used when no network provider is configured, and by tests to script
//! exact source behaviour.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::VecDeque;
use std::sync::Mutex;

use super::{RainForecast, SourceFetchError, WeatherSource};

#[derive(Debug)]
enum Behaviour {
    Constant(f64),
    /// One entry per fetch; `None` fails that fetch. Exhausted scripts fail.
    Scripted(Mutex<VecDeque<Option<f64>>>),
    Failing,
    /// Never resolves, to exercise timeouts.
    Hanging,
}

#[derive(Debug)]
pub struct SimulatedSource {
    id: String,
    behaviour: Behaviour,
    observed_at: Option<DateTime<Utc>>,
}

impl SimulatedSource {
    fn with(id: &str, behaviour: Behaviour) -> Self {
        Self {
            id: id.to_string(),
            behaviour,
            observed_at: None,
        }
    }

    pub fn constant(id: &str, rain_mm: f64) -> Self {
        Self::with(id, Behaviour::Constant(rain_mm))
    }

    pub fn scripted(id: &str, script: Vec<Option<f64>>) -> Self {
        Self::with(id, Behaviour::Scripted(Mutex::new(script.into())))
    }

    pub fn failing(id: &str) -> Self {
        Self::with(id, Behaviour::Failing)
    }

    pub fn hanging(id: &str) -> Self {
        Self::with(id, Behaviour::Hanging)
    }

    /// Report a fixed observation time instead of the fetch instant.
    pub fn observed_at(mut self, ts: DateTime<Utc>) -> Self {
        self.observed_at = Some(ts);
        self
    }

    fn next_value(&self) -> Result<f64, SourceFetchError> {
        match &self.behaviour {
            Behaviour::Constant(v) => Ok(*v),
            Behaviour::Scripted(script) => script
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front()
                .flatten()
                .ok_or_else(|| SourceFetchError::Unavailable(format!("{} scripted failure", self.id))),
            Behaviour::Failing | Behaviour::Hanging => {
                Err(SourceFetchError::Unavailable(format!("{} is offline", self.id)))
            }
        }
    }
}

impl WeatherSource for SimulatedSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn fetch(&self, _latitude: f64, _longitude: f64) -> BoxFuture<'_, Result<RainForecast, SourceFetchError>> {
        if matches!(self.behaviour, Behaviour::Hanging) {
            return futures::future::pending().boxed();
        }
        let result = self.next_value().map(|rain| RainForecast {
            rain_next_hour_mm: rain,
            observed_at: self.observed_at.unwrap_or_else(Utc::now),
        });
        futures::future::ready(result).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_source_follows_script() {
        let src = SimulatedSource::scripted("s", vec![Some(1.5), None, Some(2.0)]);
        assert_eq!(src.fetch(0.0, 0.0).await.unwrap().rain_next_hour_mm, 1.5);
        assert!(src.fetch(0.0, 0.0).await.is_err());
        assert_eq!(src.fetch(0.0, 0.0).await.unwrap().rain_next_hour_mm, 2.0);
        // Exhausted
        assert!(src.fetch(0.0, 0.0).await.is_err());
    }

    #[tokio::test]
    async fn test_fixed_observation_time() {
        let ts: DateTime<Utc> = "2025-11-03T02:00:00Z".parse().unwrap();
        let src = SimulatedSource::constant("s", 3.0).observed_at(ts);
        let forecast = src.fetch(0.0, 0.0).await.unwrap();
        assert_eq!(forecast.observed_at, ts);
        assert_eq!(src.id(), "s");
    }
}
