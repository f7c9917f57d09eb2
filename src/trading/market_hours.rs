//! Trading-session windows used to pace the scheduler.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;

use crate::models::Market;

/// Local session bounds (inclusive) and timezone for a market.
fn session(market: Market) -> Option<(Tz, NaiveTime, NaiveTime)> {
    match market {
        // Pre-market through after-hours
        Market::Us => Some((
            chrono_tz::America::New_York,
            NaiveTime::from_hms_opt(4, 0, 0)?,
            NaiveTime::from_hms_opt(20, 0, 0)?,
        )),
        Market::Hk => Some((
            chrono_tz::Asia::Hong_Kong,
            NaiveTime::from_hms_opt(9, 30, 0)?,
            NaiveTime::from_hms_opt(16, 0, 0)?,
        )),
        Market::Unknown => None,
    }
}

/// Whether `market` is inside its trading session at `now`.
pub fn is_open(market: Market, now: DateTime<Utc>) -> bool {
    let Some((tz, open, close)) = session(market) else {
        return false;
    };

    let local = now.with_timezone(&tz);
    if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }

    let time = local.time();
    time >= open && time <= close
}

/// Short interval while any of `markets` trades, idle interval otherwise.
pub fn poll_interval(
    markets: &HashSet<Market>,
    now: DateTime<Utc>,
    active: Duration,
    idle: Duration,
) -> Duration {
    if markets.iter().any(|m| is_open(*m, now)) {
        active
    } else {
        idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_us_session_bounds() {
        // Wednesday 2024-07-10, New York is UTC-4
        assert!(is_open(Market::Us, utc(2024, 7, 10, 8, 0)));
        assert!(!is_open(Market::Us, utc(2024, 7, 10, 7, 59)));
        assert!(is_open(Market::Us, utc(2024, 7, 11, 0, 0)));
        assert!(!is_open(Market::Us, utc(2024, 7, 11, 0, 1)));
    }

    #[test]
    fn test_hk_session_bounds() {
        // Hong Kong is UTC+8
        assert!(is_open(Market::Hk, utc(2024, 7, 10, 1, 30)));
        assert!(!is_open(Market::Hk, utc(2024, 7, 10, 1, 29)));
        assert!(is_open(Market::Hk, utc(2024, 7, 10, 8, 0)));
        assert!(!is_open(Market::Hk, utc(2024, 7, 10, 8, 1)));
    }

    #[test]
    fn test_weekend_closed() {
        // Saturday 2024-07-13, midday in both markets
        assert!(!is_open(Market::Us, utc(2024, 7, 13, 16, 0)));
        assert!(!is_open(Market::Hk, utc(2024, 7, 13, 4, 0)));
        assert!(!is_open(Market::Unknown, utc(2024, 7, 10, 16, 0)));
    }

    #[test]
    fn test_interval_selection() {
        let active = Duration::from_secs(30);
        let idle = Duration::from_secs(3600);
        let both = HashSet::from([Market::Us, Market::Hk]);
        let hk = HashSet::from([Market::Hk]);

        // 03:00 UTC Wednesday: HK open, US closed
        let now = utc(2024, 7, 10, 3, 0);
        assert_eq!(poll_interval(&both, now, active, idle), active);
        assert_eq!(poll_interval(&HashSet::from([Market::Us]), now, active, idle), idle);

        // 12:00 UTC: HK closed
        assert_eq!(poll_interval(&hk, utc(2024, 7, 10, 12, 0), active, idle), idle);
        assert_eq!(poll_interval(&HashSet::new(), now, active, idle), idle);
    }
}
