//! Renewal date calculation
//!
//! Pure calendar arithmetic for billing periods. Month and year additions
//! clamp to the last valid day of the target month (2024-01-31 + 1 month
//! = 2024-02-29), which is the `chrono::Months` behavior; the tests below
//! pin it.

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};

/// Billing interval unit for a recurring plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Day,
    Week,
    Month,
    Year,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Day => "day",
            BillingInterval::Week => "week",
            BillingInterval::Month => "month",
            BillingInterval::Year => "year",
        }
    }

    /// Parse from the interval strings the commerce layer stores
    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "day" | "days" => Ok(BillingInterval::Day),
            "week" | "weeks" => Ok(BillingInterval::Week),
            "month" | "months" => Ok(BillingInterval::Month),
            "year" | "years" => Ok(BillingInterval::Year),
            other => Err(BillingError::InvalidInterval(format!(
                "unknown interval unit '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Compute the next billing timestamp from an anchor.
///
/// Adds `interval_count` units of `interval` to `anchor`. Rejects
/// `interval_count < 1`; overflow past the representable date range is an
/// `InvalidInterval` error rather than a panic.
pub fn next_billing_timestamp(
    anchor: DateTime<Utc>,
    interval: BillingInterval,
    interval_count: u32,
) -> BillingResult<DateTime<Utc>> {
    if interval_count < 1 {
        return Err(BillingError::InvalidInterval(
            "interval_count must be >= 1".to_string(),
        ));
    }

    let next = match interval {
        BillingInterval::Day => anchor.checked_add_signed(Duration::days(i64::from(interval_count))),
        BillingInterval::Week => {
            anchor.checked_add_signed(Duration::weeks(i64::from(interval_count)))
        }
        BillingInterval::Month => anchor.checked_add_months(Months::new(interval_count)),
        BillingInterval::Year => {
            // Years are 12-month blocks so Feb 29 anchors clamp the same way
            let months = interval_count.checked_mul(12).ok_or_else(|| {
                BillingError::InvalidInterval(format!(
                    "interval_count {} years out of range",
                    interval_count
                ))
            })?;
            anchor.checked_add_months(Months::new(months))
        }
    };

    next.ok_or_else(|| {
        BillingError::InvalidInterval(format!(
            "{} {}(s) from {} is out of range",
            interval_count, interval, anchor
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 10, 30, 0).unwrap()
    }

    #[test]
    fn test_month_end_clamps_to_leap_february() {
        // Jan 31 + 1 month clamps to the last valid day of February
        let next = next_billing_timestamp(utc(2024, 1, 31), BillingInterval::Month, 1).unwrap();
        assert_eq!(next, utc(2024, 2, 29));
    }

    #[test]
    fn test_month_end_clamps_to_non_leap_february() {
        let next = next_billing_timestamp(utc(2023, 1, 31), BillingInterval::Month, 1).unwrap();
        assert_eq!(next, utc(2023, 2, 28));
    }

    #[test]
    fn test_mid_month_addition_is_exact() {
        let next = next_billing_timestamp(utc(2024, 3, 15), BillingInterval::Month, 1).unwrap();
        assert_eq!(next, utc(2024, 4, 15));
    }

    #[test]
    fn test_multi_month_interval() {
        let next = next_billing_timestamp(utc(2024, 1, 31), BillingInterval::Month, 3).unwrap();
        assert_eq!(next, utc(2024, 4, 30));
    }

    #[test]
    fn test_week_interval() {
        let next = next_billing_timestamp(utc(2024, 1, 1), BillingInterval::Week, 2).unwrap();
        assert_eq!(next, utc(2024, 1, 15));
    }

    #[test]
    fn test_day_interval() {
        let next = next_billing_timestamp(utc(2024, 2, 28), BillingInterval::Day, 2).unwrap();
        assert_eq!(next, utc(2024, 3, 1));
    }

    #[test]
    fn test_year_from_leap_day_clamps() {
        let next = next_billing_timestamp(utc(2024, 2, 29), BillingInterval::Year, 1).unwrap();
        assert_eq!(next, utc(2025, 2, 28));
    }

    #[test]
    fn test_zero_count_rejected() {
        let result = next_billing_timestamp(utc(2024, 1, 1), BillingInterval::Month, 0);
        assert!(matches!(result, Err(BillingError::InvalidInterval(_))));
    }

    #[test]
    fn test_time_of_day_preserved() {
        let anchor = Utc.with_ymd_and_hms(2024, 5, 10, 23, 59, 59).unwrap();
        let next = next_billing_timestamp(anchor, BillingInterval::Month, 1).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 6, 10, 23, 59, 59).unwrap());
    }

    #[test]
    fn test_interval_parse_roundtrip() {
        for unit in ["day", "week", "month", "year"] {
            assert_eq!(BillingInterval::parse(unit).unwrap().as_str(), unit);
        }
        assert!(BillingInterval::parse("fortnight").is_err());
    }
}
