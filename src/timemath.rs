use chrono::{DateTime, Datelike, Duration, NaiveDate, Offset, TimeZone, Utc};
use chrono_tz::Tz;

/// Day names as stored on schedules, Monday first (matches
/// `Weekday::num_days_from_monday`).
pub const DAY_NAMES: [&str; 7] = ["MON", "TUE", "WED", "THU", "FRI", "SAT", "SUN"];

pub fn day_index(name: &str) -> Option<usize> {
    DAY_NAMES.iter().position(|d| *d == name)
}

/// Parse a wall-clock `"HH:MM"` string.
pub fn parse_hhmm(s: &str) -> Option<(u32, u32)> {
    let (h, m) = s.split_once(':')?;
    if h.len() != 2 || m.len() != 2 {
        return None;
    }
    let hour: u32 = h.parse().ok()?;
    let min: u32 = m.parse().ok()?;
    if hour > 23 || min > 59 {
        return None;
    }
    Some((hour, min))
}

/// Convert a local wall-clock `"HH:MM"` in an IANA zone to the UTC `"HH:MM"`
/// in effect on `date`, normalised modulo 24 h.
///
/// The offset is looked up per date, not per now, so an arrive-by stored in
/// winter still produces the correct UTC in summer. An unknown zone falls back
/// to the local time as-is (at most a one-hour error for the next run, which
/// beats dropping the route).
pub fn local_time_to_utc(hhmm: &str, zone: &str, date: NaiveDate) -> String {
    let Some((hour, min)) = parse_hhmm(hhmm) else {
        tracing::warn!("invalid local time {hhmm:?}, passing through unchanged");
        return hhmm.to_string();
    };
    let tz: Tz = match zone.parse() {
        Ok(tz) => tz,
        Err(_) => {
            tracing::warn!("unknown timezone {zone:?}, treating {hhmm} as UTC");
            return format!("{hour:02}:{min:02}");
        }
    };

    // Noon avoids the clock-change window itself; the offset on the date is
    // what matters.
    let noon = date.and_hms_opt(12, 0, 0).expect("noon is always valid");
    let offset_mins = match tz.from_local_datetime(&noon).earliest() {
        Some(dt) => dt.offset().fix().local_minus_utc() / 60,
        None => 0,
    };

    let utc_total = (hour as i32 * 60 + min as i32 - offset_mins).rem_euclid(1440);
    format!("{:02}:{:02}", utc_total / 60, utc_total % 60)
}

/// Resolve the next calendar date falling on the named day, strictly after
/// `today`: offsets wrap 1..7, so today's own day name maps one week out.
pub fn next_date_for_day(day: &str, today: NaiveDate) -> Option<NaiveDate> {
    let target = day_index(day)? as i64;
    let current = today.weekday().num_days_from_monday() as i64;
    let mut ahead = (target - current).rem_euclid(7);
    if ahead == 0 {
        ahead = 7;
    }
    Some(today + Duration::days(ahead))
}

/// Time until the next `hour:00:00Z`, strictly in the future.
pub fn next_run_delay(hour: u32, now: DateTime<Utc>) -> std::time::Duration {
    let today_run = now
        .date_naive()
        .and_hms_opt(hour, 0, 0)
        .expect("configured hour out of range")
        .and_utc();
    let next = if today_run > now {
        today_run
    } else {
        today_run + Duration::days(1)
    };
    (next - now).to_std().expect("next run is in the future")
}

/// Format an instant as the store's timestamp shape (`%Y-%m-%dT%H:%M:%SZ`).
pub fn iso_utc(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}
