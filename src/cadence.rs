//! Market-hour aware sleep controller.
//!
//! Generalizes `shared/smart_sleep.py`'s `get_market_status`/`get_sleep_seconds`
//! (New York session window, active/passive cadence) with the `sleep_mode`
//! override and offset-aligned candle wakeups that the Python reference
//! lacks.

use crate::models::SleepMode;
use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use chrono_tz::America::New_York;
use chrono_tz::Tz;

pub const ACTIVE_SECONDS: i64 = 300;
pub const PASSIVE_SECONDS: i64 = 3600;

const MARKET_OPEN_HOUR: u32 = 9;
const MARKET_OPEN_MINUTE: u32 = 30;
const MARKET_CLOSE_HOUR: u32 = 16;
const MARKET_CLOSE_MINUTE: u32 = 0;

/// True if `now` falls within a regular weekday session, exclusive of the
/// closing instant itself.
pub fn is_session_open(now: DateTime<Utc>) -> bool {
    let ny = now.with_timezone(&New_York);
    if ny.weekday().num_days_from_monday() >= 5 {
        return false;
    }
    let open = ny
        .date_naive()
        .and_hms_opt(MARKET_OPEN_HOUR, MARKET_OPEN_MINUTE, 0)
        .unwrap();
    let close = ny
        .date_naive()
        .and_hms_opt(MARKET_CLOSE_HOUR, MARKET_CLOSE_MINUTE, 0)
        .unwrap();
    let naive = ny.naive_local();
    naive >= open && naive < close
}

/// Seconds until the next session open, walking forward day by day (caps at
/// one week so a clock anomaly can't spin forever).
fn seconds_until_open(now: DateTime<Utc>) -> i64 {
    let ny: chrono::DateTime<Tz> = now.with_timezone(&New_York);
    for day_offset in 0..8i64 {
        let candidate_date = ny.date_naive() + Duration::days(day_offset);
        if candidate_date.weekday().num_days_from_monday() >= 5 {
            continue;
        }
        let open_naive = candidate_date
            .and_hms_opt(MARKET_OPEN_HOUR, MARKET_OPEN_MINUTE, 0)
            .unwrap();
        if let Some(open_ny) = New_York.from_local_datetime(&open_naive).single() {
            let open_utc = open_ny.with_timezone(&Utc);
            let delta = (open_utc - now).num_seconds();
            if delta > 0 {
                return delta;
            }
        }
    }
    PASSIVE_SECONDS
}

/// Seconds a caller in AUTO mode should sleep before its next cycle.
pub fn auto_sleep_seconds(now: DateTime<Utc>) -> i64 {
    if is_session_open(now) {
        ACTIVE_SECONDS
    } else {
        seconds_until_open(now).min(PASSIVE_SECONDS)
    }
}

/// Seconds to sleep given the current override mode.
pub fn sleep_seconds(now: DateTime<Utc>, mode: SleepMode) -> i64 {
    match mode {
        SleepMode::ForceAwake => ACTIVE_SECONDS,
        SleepMode::ForceSleep => PASSIVE_SECONDS,
        SleepMode::Auto => auto_sleep_seconds(now),
    }
}

/// Seconds until the next `interval_seconds`-aligned boundary past the Unix
/// epoch, plus `offset_seconds`. Used to stagger workers off the same
/// candle close (e.g. indicators at +20s, strategy at +40s).
pub fn sleep_to_next_candle(now: DateTime<Utc>, interval_seconds: i64, offset_seconds: i64) -> i64 {
    let epoch = now.timestamp();
    let next_boundary = ((epoch / interval_seconds) + 1) * interval_seconds + offset_seconds;
    (next_boundary - epoch).max(1)
}

/// Sleeps in one-second increments, polling `mode_fn` each second. If the
/// override flips to FORCE_AWAKE partway through a sleep that was longer
/// than the active cadence, returns early. Short sleeps (<= active cadence)
/// always run to completion.
pub async fn smart_sleep<F>(total_seconds: i64, mut mode_fn: F)
where
    F: FnMut() -> SleepMode,
{
    let interruptible = total_seconds > ACTIVE_SECONDS;
    let mut remaining = total_seconds.max(0);
    while remaining > 0 {
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        remaining -= 1;
        if interruptible && mode_fn() == SleepMode::ForceAwake {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ny_instant(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        New_York
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn session_open_excludes_close_instant() {
        // Wednesday 2024-06-12
        assert!(is_session_open(ny_instant(2024, 6, 12, 9, 30)));
        assert!(is_session_open(ny_instant(2024, 6, 12, 15, 59)));
        assert!(!is_session_open(ny_instant(2024, 6, 12, 16, 0)));
        assert!(!is_session_open(ny_instant(2024, 6, 12, 9, 29)));
    }

    #[test]
    fn session_closed_on_weekend() {
        // Saturday 2024-06-15
        assert!(!is_session_open(ny_instant(2024, 6, 15, 10, 0)));
    }

    #[test]
    fn auto_sleep_active_during_session() {
        assert_eq!(auto_sleep_seconds(ny_instant(2024, 6, 12, 10, 0)), ACTIVE_SECONDS);
    }

    #[test]
    fn auto_sleep_waits_for_open_when_close_enough() {
        let secs = auto_sleep_seconds(ny_instant(2024, 6, 12, 9, 0));
        assert!(secs > 0 && secs <= PASSIVE_SECONDS);
    }

    #[test]
    fn force_awake_overrides_closed_market() {
        assert_eq!(
            sleep_seconds(ny_instant(2024, 6, 15, 10, 0), SleepMode::ForceAwake),
            ACTIVE_SECONDS
        );
    }

    #[test]
    fn force_sleep_overrides_open_market() {
        assert_eq!(
            sleep_seconds(ny_instant(2024, 6, 12, 10, 0), SleepMode::ForceSleep),
            PASSIVE_SECONDS
        );
    }
}
