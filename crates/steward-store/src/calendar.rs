// Calendar fire-time math. All wall-clock arithmetic goes through IANA
// zone tables; cursors and fires are stored as UTC instants.
use chrono::{DateTime, Datelike, Duration, LocalResult, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

use steward_types::{RunTimeSpec, ScheduleMode};

/// How far back a calendar schedule may catch up a missed fire.
pub const CALENDAR_CATCHUP_MINUTES: i64 = 180;

pub fn parse_time_of_day(raw: &str) -> Option<(u32, u32)> {
    let (hour_str, minute_str) = raw.trim().split_once(':')?;
    let hour: u32 = hour_str.parse().ok()?;
    let minute: u32 = minute_str.parse().ok()?;
    if hour <= 23 && minute <= 59 {
        Some((hour, minute))
    } else {
        None
    }
}

fn weekday_token(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "mon",
        Weekday::Tue => "tue",
        Weekday::Wed => "wed",
        Weekday::Thu => "thu",
        Weekday::Fri => "fri",
        Weekday::Sat => "sat",
        Weekday::Sun => "sun",
    }
}

fn weekday_allowed(days: &[String], weekday: Weekday) -> bool {
    days.is_empty() || days.iter().any(|day| day == weekday_token(weekday))
}

/// Resolve a local wall time to a UTC instant. Ambiguous times (fall-back)
/// take the earlier instant; nonexistent times (spring-forward gap) resolve
/// to nothing for that day.
fn local_fire(
    zone: Tz,
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
) -> Option<DateTime<Utc>> {
    match zone.with_ymd_and_hms(year, month, day, hour, minute, 0) {
        LocalResult::Single(instant) => Some(instant.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => None,
    }
}

fn parse_zone(name: &str) -> Option<Tz> {
    name.trim().parse::<Tz>().ok()
}

/// Most recent fire at or before `now` within the last week.
pub fn most_recent_calendar_fire(
    now: DateTime<Utc>,
    timezone_name: &str,
    time_of_day: &str,
    days_of_week: &[String],
) -> Option<DateTime<Utc>> {
    let zone = parse_zone(timezone_name)?;
    let (hour, minute) = parse_time_of_day(time_of_day)?;
    let local_now = now.with_timezone(&zone);

    for delta in 0..8i64 {
        let date = local_now.date_naive() - Duration::days(delta);
        let Some(candidate) = local_fire(zone, date.year(), date.month(), date.day(), hour, minute)
        else {
            continue;
        };
        if candidate > now {
            continue;
        }
        if !weekday_allowed(days_of_week, date.weekday()) {
            continue;
        }
        return Some(candidate);
    }
    None
}

/// Next fire strictly after a prior fire instant.
pub fn next_calendar_fire_after(
    fire: DateTime<Utc>,
    timezone_name: &str,
    time_of_day: &str,
    days_of_week: &[String],
) -> Option<DateTime<Utc>> {
    let zone = parse_zone(timezone_name)?;
    let (hour, minute) = parse_time_of_day(time_of_day)?;
    let local_fire_date = fire.with_timezone(&zone).date_naive();

    for delta in 1..15i64 {
        let date = local_fire_date + Duration::days(delta);
        if !weekday_allowed(days_of_week, date.weekday()) {
            continue;
        }
        let Some(candidate) = local_fire(zone, date.year(), date.month(), date.day(), hour, minute)
        else {
            continue;
        };
        if candidate > fire {
            return Some(candidate);
        }
    }
    None
}

/// Next fire at or after `now`.
pub fn next_calendar_fire_on_or_after(
    now: DateTime<Utc>,
    timezone_name: &str,
    time_of_day: &str,
    days_of_week: &[String],
) -> Option<DateTime<Utc>> {
    let zone = parse_zone(timezone_name)?;
    let (hour, minute) = parse_time_of_day(time_of_day)?;
    let local_now = now.with_timezone(&zone);

    for delta in 0..15i64 {
        let date = local_now.date_naive() + Duration::days(delta);
        if !weekday_allowed(days_of_week, date.weekday()) {
            continue;
        }
        let Some(candidate) = local_fire(zone, date.year(), date.month(), date.day(), hour, minute)
        else {
            continue;
        };
        if candidate >= now {
            return Some(candidate);
        }
    }
    None
}

/// Earliest upcoming fire across a schedule's run-time specs.
pub fn next_calendar_fire_for_specs(
    run_times: &[RunTimeSpec],
    days_of_week: &[String],
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    run_times
        .iter()
        .filter(|spec| spec.enabled)
        .filter_map(|spec| {
            next_calendar_fire_on_or_after(now, &spec.timezone, &spec.time_of_day, days_of_week)
        })
        .min()
}

/// Advance the run cursor one fire past `cursor` for either mode.
pub fn next_fire_after_cursor(
    mode: ScheduleMode,
    cursor: DateTime<Utc>,
    frequency_minutes: Option<i64>,
    run_times: &[RunTimeSpec],
    days_of_week: &[String],
) -> Option<DateTime<Utc>> {
    match mode {
        ScheduleMode::Frequency => {
            let minutes = frequency_minutes.filter(|minutes| *minutes > 0)?;
            Some(cursor + Duration::minutes(minutes))
        }
        ScheduleMode::Calendar => run_times
            .iter()
            .filter(|spec| spec.enabled)
            .filter_map(|spec| {
                next_calendar_fire_after(cursor, &spec.timezone, &spec.time_of_day, days_of_week)
            })
            .min(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn spec(time_of_day: &str, timezone: &str) -> RunTimeSpec {
        RunTimeSpec {
            time_of_day: time_of_day.to_string(),
            timezone: timezone.to_string(),
            enabled: true,
        }
    }

    #[test]
    fn frequency_cursor_advances_by_minutes() {
        let cursor = Utc.with_ymd_and_hms(2026, 2, 16, 0, 0, 0).unwrap();
        let next = next_fire_after_cursor(ScheduleMode::Frequency, cursor, Some(10), &[], &[]);
        assert_eq!(next, Some(Utc.with_ymd_and_hms(2026, 2, 16, 0, 10, 0).unwrap()));
    }

    #[test]
    fn weekday_filter_skips_disallowed_days() {
        // 2026-02-20 is a Friday; the schedule only allows Mondays at 02:00 UTC.
        let friday = Utc.with_ymd_and_hms(2026, 2, 20, 2, 5, 0).unwrap();
        let days = vec!["mon".to_string()];
        let recent = most_recent_calendar_fire(friday, "UTC", "02:00", &days);
        // Most recent allowed fire is the previous Monday.
        assert_eq!(
            recent,
            Some(Utc.with_ymd_and_hms(2026, 2, 16, 2, 0, 0).unwrap())
        );

        let monday = Utc.with_ymd_and_hms(2026, 2, 23, 2, 5, 0).unwrap();
        let recent = most_recent_calendar_fire(monday, "UTC", "02:00", &days).unwrap();
        assert_eq!(recent, Utc.with_ymd_and_hms(2026, 2, 23, 2, 0, 0).unwrap());
    }

    #[test]
    fn dst_spring_forward_shifts_utc_offset_once() {
        // Berlin switches to CEST on 2026-03-29: 03:00 local moves from
        // UTC+1 to UTC+2 across the boundary.
        let before = Utc.with_ymd_and_hms(2026, 3, 28, 2, 0, 0).unwrap(); // 03:00 CET
        let next = next_calendar_fire_after(before, "Europe/Berlin", "03:00", &[]).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 29, 1, 0, 0).unwrap()); // 03:00 CEST

        let after = next_calendar_fire_after(next, "Europe/Berlin", "03:00", &[]).unwrap();
        assert_eq!(after, Utc.with_ymd_and_hms(2026, 3, 30, 1, 0, 0).unwrap());
    }

    #[test]
    fn dst_gap_time_is_skipped_for_that_day() {
        // 02:30 does not exist in Berlin on 2026-03-29.
        let cursor = Utc.with_ymd_and_hms(2026, 3, 28, 1, 30, 0).unwrap(); // 02:30 CET
        let next = next_calendar_fire_after(cursor, "Europe/Berlin", "02:30", &[]).unwrap();
        // The next existing 02:30 is on the 30th (UTC+2).
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 30, 0, 30, 0).unwrap());
    }

    #[test]
    fn specs_pick_earliest_upcoming_fire() {
        let now = Utc.with_ymd_and_hms(2026, 2, 16, 1, 0, 0).unwrap();
        let specs = vec![spec("09:00", "UTC"), spec("02:00", "UTC")];
        let next = next_calendar_fire_for_specs(&specs, &[], now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 2, 16, 2, 0, 0).unwrap());
    }

    #[test]
    fn invalid_zone_or_time_yields_none() {
        let now = Utc.with_ymd_and_hms(2026, 2, 16, 1, 0, 0).unwrap();
        assert!(most_recent_calendar_fire(now, "Not/AZone", "02:00", &[]).is_none());
        assert!(most_recent_calendar_fire(now, "UTC", "25:00", &[]).is_none());
    }
}
