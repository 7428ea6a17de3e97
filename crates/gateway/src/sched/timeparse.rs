//! Human time expression parser.
//!
//! Accepts relative forms ("in 15 minutes"), day anchors ("tomorrow 9am",
//! "tonight"), bare clock times ("at 17:30", "9pm"), and ISO-8601. Always
//! returns a result variant; a parse failure never crosses the scheduler
//! boundary as a panic.

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};

use hb_domain::error::{Error, Result};

/// Parse a scheduling expression relative to `now`, interpreting local
/// times in `tz`. Returns a UTC instant strictly in the future of `now`
/// for day-anchored and clock forms.
pub fn parse_when(input: &str, now: DateTime<Utc>, tz: chrono_tz::Tz) -> Result<DateTime<Utc>> {
    let text = input.trim().to_lowercase();
    if text.is_empty() {
        return Err(Error::Parse("empty time expression".into()));
    }

    // ISO-8601 first: unambiguous.
    if let Ok(dt) = DateTime::parse_from_rfc3339(input.trim()) {
        return Ok(dt.with_timezone(&Utc));
    }

    if let Some(rest) = text.strip_prefix("in ") {
        return parse_relative(rest, now);
    }

    if let Some(rest) = text.strip_prefix("tomorrow") {
        let time = parse_clock(rest.trim()).unwrap_or_else(|| NaiveTime::from_hms_opt(9, 0, 0).unwrap());
        let local_date = (now.with_timezone(&tz) + Duration::days(1)).date_naive();
        return to_utc(local_date.and_time(time), tz);
    }

    if text == "tonight" {
        let time = NaiveTime::from_hms_opt(20, 0, 0).unwrap();
        let local_now = now.with_timezone(&tz);
        let mut candidate = local_now.date_naive().and_time(time);
        if to_utc(candidate, tz)? <= now {
            candidate += Duration::days(1);
        }
        return to_utc(candidate, tz);
    }

    // "at 9am", "at 17:30", or a bare clock time.
    let clock_text = text.strip_prefix("at ").unwrap_or(&text);
    if let Some(time) = parse_clock(clock_text) {
        let local_now = now.with_timezone(&tz);
        let mut candidate = local_now.date_naive().and_time(time);
        if to_utc(candidate, tz)? <= now {
            candidate += Duration::days(1);
        }
        return to_utc(candidate, tz);
    }

    Err(Error::Parse(format!("unrecognized time expression: {input:?}")))
}

fn parse_relative(rest: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let mut parts = rest.split_whitespace();
    let amount: i64 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Parse(format!("bad relative amount in {rest:?}")))?;
    let unit = parts.next().unwrap_or("minutes");
    let delta = match unit.trim_end_matches('s') {
        "second" | "sec" => Duration::seconds(amount),
        "minute" | "min" => Duration::minutes(amount),
        "hour" | "hr" => Duration::hours(amount),
        "day" => Duration::days(amount),
        "week" => Duration::weeks(amount),
        other => return Err(Error::Parse(format!("unknown unit {other:?}"))),
    };
    if delta <= Duration::zero() {
        return Err(Error::Parse(format!("non-positive delay in {rest:?}")));
    }
    Ok(now + delta)
}

/// "9am", "9:30pm", "17:30", "07:05".
fn parse_clock(text: &str) -> Option<NaiveTime> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    let (body, pm_offset) = if let Some(b) = text.strip_suffix("pm") {
        (b.trim(), Some(12u32))
    } else if let Some(b) = text.strip_suffix("am") {
        (b.trim(), Some(0u32))
    } else {
        (text, None)
    };

    let (h, m) = match body.split_once(':') {
        Some((h, m)) => (h.parse::<u32>().ok()?, m.parse::<u32>().ok()?),
        None => (body.parse::<u32>().ok()?, 0),
    };
    let h = match pm_offset {
        Some(offset) => {
            if h == 0 || h > 12 {
                return None;
            }
            (h % 12) + offset
        }
        None => h,
    };
    NaiveTime::from_hms_opt(h, m, 0)
}

fn to_utc(local: chrono::NaiveDateTime, tz: chrono_tz::Tz) -> Result<DateTime<Utc>> {
    match tz.from_local_datetime(&local) {
        chrono::LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
        chrono::LocalResult::Ambiguous(earliest, _) => Ok(earliest.with_timezone(&Utc)),
        chrono::LocalResult::None => {
            // DST gap: nudge forward an hour.
            let nudged = local + Duration::hours(1);
            match tz.from_local_datetime(&nudged) {
                chrono::LocalResult::Single(dt) => Ok(dt.with_timezone(&Utc)),
                _ => Err(Error::Parse("time falls in a DST gap".into())),
            }
        }
    }
}
