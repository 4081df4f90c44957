pub mod bridge;
pub mod calibration;
pub mod devices;
pub mod health;
pub mod nodes;
pub mod scheduler;
pub mod telemetry;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use utoipa::IntoParams;

use crate::errors::AppError;

/// Window returned when `from` is omitted (hours).
const DEFAULT_RANGE_HOURS: i64 = 24;

/// Widest window a single range query may span (days).
const MAX_RANGE_DAYS: i64 = 31;

/// Inclusive time range for the egress endpoints.
#[derive(Debug, Deserialize, IntoParams)]
pub struct RangeQuery {
    /// Range start, RFC 3339 (defaults to 24 hours before `to`)
    pub from: Option<DateTime<Utc>>,
    /// Range end, RFC 3339 (defaults to now)
    pub to: Option<DateTime<Utc>>,
}

impl RangeQuery {
    pub fn resolve(&self, now: DateTime<Utc>) -> Result<(DateTime<Utc>, DateTime<Utc>), AppError> {
        let to = self.to.unwrap_or(now);
        let from = self.from.unwrap_or(to - Duration::hours(DEFAULT_RANGE_HOURS));
        if from > to {
            return Err(AppError::BadRequest("'from' must not be after 'to'".to_string()));
        }
        if to - from > Duration::days(MAX_RANGE_DAYS) {
            return Err(AppError::BadRequest(format!(
                "range must not exceed {} days",
                MAX_RANGE_DAYS
            )));
        }
        Ok((from, to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn now() -> DateTime<Utc> {
        "2025-11-03T02:00:00Z".parse().unwrap()
    }

    #[test]
    fn test_range_defaults_to_last_day() {
        let q = RangeQuery { from: None, to: None };
        let (from, to) = assert_ok!(q.resolve(now()));
        assert_eq!(to, now());
        assert_eq!(from, now() - Duration::hours(24));
    }

    #[test]
    fn test_range_rejects_inverted_and_wide() {
        let inverted = RangeQuery {
            from: Some(now()),
            to: Some(now() - Duration::hours(1)),
        };
        assert!(matches!(inverted.resolve(now()), Err(AppError::BadRequest(_))));

        let wide = RangeQuery {
            from: Some(now() - Duration::days(40)),
            to: None,
        };
        assert_err!(wide.resolve(now()));
    }
}
