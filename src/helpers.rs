//! Shared helpers for Decimal ↔ f64 conversions at the storage boundary.
//!
//! The pipeline computes in `f64`; PostgreSQL stores measurements as NUMERIC.
//! Non-finite inputs (NaN, ±Inf) have no NUMERIC form and convert to `None`.
//! Optional columns store that as NULL; required columns refuse the row.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

/// Convert an f64 to Decimal preserving full precision.
pub(crate) fn f64_to_decimal(v: f64) -> Option<Decimal> {
    if !v.is_finite() {
        tracing::warn!("Non-finite value {} has no decimal form", v);
        return None;
    }
    Some(Decimal::from_f64(v).unwrap_or_else(|| Decimal::new(v as i64, 0)))
}

/// Convert an optional f64 to Decimal. Non-finite values map to `None`.
pub(crate) fn opt_f64_to_decimal(v: Option<f64>) -> Option<Decimal> {
    v.and_then(f64_to_decimal)
}

/// Convert a Decimal to f64, defaulting to 0.0 for values that can't be represented.
pub(crate) fn dec_to_f64(d: Decimal) -> f64 {
    d.to_f64().unwrap_or(0.0)
}

/// Convert an Option<Decimal> to Option<f64>.
pub(crate) fn opt_dec_to_f64(d: Option<Decimal>) -> Option<f64> {
    d.and_then(|v| v.to_f64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_f64_to_decimal_normal() {
        let d = f64_to_decimal(0.83).unwrap();
        assert!((dec_to_f64(d) - 0.83).abs() < 1e-9);
        assert_eq!(f64_to_decimal(0.0), Some(Decimal::ZERO));
    }

    #[test]
    fn test_f64_to_decimal_nan() {
        assert_eq!(f64_to_decimal(f64::NAN), None);
    }

    #[test]
    fn test_f64_to_decimal_infinity() {
        assert_eq!(f64_to_decimal(f64::INFINITY), None);
        assert_eq!(f64_to_decimal(f64::NEG_INFINITY), None);
    }

    #[test]
    fn test_opt_f64_to_decimal() {
        assert_eq!(opt_f64_to_decimal(None), None);
        assert_eq!(opt_f64_to_decimal(Some(f64::NAN)), None);
        let d = opt_f64_to_decimal(Some(4.92)).unwrap();
        assert!((dec_to_f64(d) - 4.92).abs() < 1e-9);
    }

    #[test]
    fn test_dec_to_f64() {
        let d = Decimal::from_str("0.12").unwrap();
        assert!((dec_to_f64(d) - 0.12).abs() < 1e-12);
        assert_eq!(dec_to_f64(Decimal::ZERO), 0.0);
    }

    #[test]
    fn test_opt_dec_to_f64() {
        assert_eq!(opt_dec_to_f64(None), None);
        let d = Decimal::from_str("-0.03").unwrap();
        assert!((opt_dec_to_f64(Some(d)).unwrap() + 0.03).abs() < 1e-12);
    }
}
