use chrono::{DateTime, Utc};
use chrono_tz::Tz;

/// Parse an IANA zone name, falling back to UTC for anything unknown.
pub fn parse_zone(timezone: Option<&str>) -> Tz {
    timezone
        .and_then(|name| name.trim().parse::<Tz>().ok())
        .unwrap_or(chrono_tz::UTC)
}

/// Day key (`YYYY-MM-DD`) for an instant in the configured timezone.
pub fn day_key_for(instant: DateTime<Utc>, timezone: Option<&str>) -> String {
    let zone = parse_zone(timezone);
    instant.with_timezone(&zone).format("%Y-%m-%d").to_string()
}

/// Day key for the current instant in the configured timezone.
pub fn local_day_key(timezone: Option<&str>) -> String {
    day_key_for(Utc::now(), timezone)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn day_key_respects_timezone() {
        // 2026-02-16 02:30 UTC is still 2026-02-15 in Los Angeles.
        let instant = Utc.with_ymd_and_hms(2026, 2, 16, 2, 30, 0).unwrap();
        assert_eq!(day_key_for(instant, Some("UTC")), "2026-02-16");
        assert_eq!(
            day_key_for(instant, Some("America/Los_Angeles")),
            "2026-02-15"
        );
    }

    #[test]
    fn unknown_zone_falls_back_to_utc() {
        let instant = Utc.with_ymd_and_hms(2026, 2, 16, 2, 30, 0).unwrap();
        assert_eq!(day_key_for(instant, Some("Not/AZone")), "2026-02-16");
    }
}
