//! Date window resolution in the São Paulo reference zone.

use chrono::{
    DateTime, Days, Duration, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, TimeZone, Utc,
};
use chrono_tz::Tz;
use leadsync_core::DateRange;
use thiserror::Error;

pub const REFERENCE_TZ: Tz = chrono_tz::America::Sao_Paulo;

const AUVO_DATE_FORMAT: &str = "%Y-%m-%d";
const NAIVE_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S%.f"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid timestamp `{0}`")]
pub struct InvalidTimestamp(pub String);

/// Calendar date of `timestamp` in the reference zone. Offsets are converted;
/// naive inputs are already local.
pub fn local_date(timestamp: &str) -> Result<NaiveDate, InvalidTimestamp> {
    let raw = timestamp.trim();
    if let Ok(instant) = DateTime::parse_from_rfc3339(raw) {
        return Ok(instant.with_timezone(&REFERENCE_TZ).date_naive());
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(naive.date());
        }
    }
    NaiveDate::parse_from_str(raw, AUVO_DATE_FORMAT).map_err(|_| InvalidTimestamp(raw.to_string()))
}

/// `dateEnd` is the local day of `timestamp`, `dateStart` the day before.
pub fn resolve_date_range(timestamp: &str) -> Result<DateRange, InvalidTimestamp> {
    let end = local_date(timestamp)?;
    let start = end
        .checked_sub_days(Days::new(1))
        .ok_or_else(|| InvalidTimestamp(timestamp.to_string()))?;
    Ok(DateRange {
        date_start: start.format(AUVO_DATE_FORMAT).to_string(),
        date_end: end.format(AUVO_DATE_FORMAT).to_string(),
    })
}

/// "Now" in the reference zone, e.g. `2025-12-10T16:50:46.529-03:00`.
pub fn current_timestamp() -> String {
    format_local(Utc::now())
}

pub fn format_local(instant: DateTime<Utc>) -> String {
    instant
        .with_timezone(&REFERENCE_TZ)
        .to_rfc3339_opts(SecondsFormat::Millis, false)
}

/// Instant of local midnight for the reference-zone day containing `now`.
pub fn start_of_local_day(now: DateTime<Utc>) -> DateTime<Utc> {
    let midnight = now
        .with_timezone(&REFERENCE_TZ)
        .date_naive()
        .and_time(NaiveTime::MIN);
    // Historical DST transitions in this zone happened at midnight.
    REFERENCE_TZ
        .from_local_datetime(&midnight)
        .earliest()
        .or_else(|| {
            REFERENCE_TZ
                .from_local_datetime(&(midnight + Duration::hours(1)))
                .earliest()
        })
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or(now)
}
