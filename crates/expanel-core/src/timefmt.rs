use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};

/// Parses the timestamp formats the backend is known to emit:
/// RFC-3339 with zone or offset, and two offset-naive legacy forms that are
/// interpreted in the host's local zone.
pub fn parse_instant(input: &str) -> Option<DateTime<Utc>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return local_to_utc(naive);
        }
    }
    None
}

fn local_to_utc(naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}

/// Elapsed time since `input`, bucketed for display:
/// minutes under an hour ("45m"), hours+minutes under a day ("1h 30m"),
/// days+hours beyond ("2d 2h").
pub fn since_description(input: &str) -> Option<String> {
    since_description_at(input, Utc::now())
}

pub fn since_description_at(input: &str, now: DateTime<Utc>) -> Option<String> {
    let instant = parse_instant(input)?;
    let total_minutes = (now - instant).num_minutes().max(0);
    let total_hours = total_minutes / 60;
    let days = total_hours / 24;
    let hours = total_hours - days * 24;
    let minutes = total_minutes - total_hours * 60;

    Some(if total_minutes < 60 {
        format!("{total_minutes}m")
    } else if total_hours < 24 {
        format!("{total_hours}h {minutes}m")
    } else {
        format!("{days}d {hours}h")
    })
}

/// Normalizes a backend timestamp to the local zone for display.
/// Unparseable input passes through trimmed; blank input yields `fallback`.
pub fn format_local(input: &str, fallback: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return fallback.to_string();
    }
    match parse_instant(trimmed) {
        Some(instant) => instant
            .with_timezone(&Local)
            .format("%Y-%m-%dT%H:%M:%S")
            .to_string(),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 7, 12, 0, 0).single().expect("valid now")
    }

    #[test]
    fn parses_rfc3339_with_offset() {
        let parsed = parse_instant("2026-08-07T09:30:00-03:00").expect("parse");
        assert_eq!(parsed, Utc.with_ymd_and_hms(2026, 8, 7, 12, 30, 0).single().unwrap());
    }

    #[test]
    fn parses_offset_naive_forms_in_local_zone() {
        let naive = NaiveDate::from_ymd_opt(2026, 3, 1)
            .unwrap()
            .and_hms_opt(10, 30, 0)
            .unwrap();
        let expected = Local
            .from_local_datetime(&naive)
            .earliest()
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(parse_instant("2026-03-01 10:30:00"), Some(expected));
        assert_eq!(parse_instant("2026-03-01T10:30:00"), Some(expected));
    }

    #[test]
    fn rejects_blank_and_garbage() {
        assert_eq!(parse_instant(""), None);
        assert_eq!(parse_instant("   "), None);
        assert_eq!(parse_instant("yesterday"), None);
    }

    #[test]
    fn since_buckets_minutes_hours_days() {
        let now = fixed_now();
        let at = |delta: Duration| (now - delta).to_rfc3339();

        assert_eq!(
            since_description_at(&at(Duration::minutes(45)), now).as_deref(),
            Some("45m")
        );
        assert_eq!(
            since_description_at(&at(Duration::minutes(90)), now).as_deref(),
            Some("1h 30m")
        );
        assert_eq!(
            since_description_at(&at(Duration::hours(50)), now).as_deref(),
            Some("2d 2h")
        );
    }

    #[test]
    fn since_clamps_future_timestamps_to_zero() {
        let now = fixed_now();
        let input = (now + Duration::minutes(10)).to_rfc3339();
        assert_eq!(since_description_at(&input, now).as_deref(), Some("0m"));
    }

    #[test]
    fn format_local_passes_through_garbage_and_falls_back_on_blank() {
        assert_eq!(format_local("", "n/d"), "n/d");
        assert_eq!(format_local("  ", "n/d"), "n/d");
        assert_eq!(format_local("not-a-date", "n/d"), "not-a-date");
    }

    #[test]
    fn format_local_renders_local_wall_clock() {
        let naive = NaiveDate::from_ymd_opt(2026, 8, 7)
            .unwrap()
            .and_hms_opt(9, 15, 0)
            .unwrap();
        let instant = Local
            .from_local_datetime(&naive)
            .earliest()
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            format_local(&instant.to_rfc3339(), "n/d"),
            "2026-08-07T09:15:00"
        );
    }
}
