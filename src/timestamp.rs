//! FIX UTC timestamp handling.
//!
//! FIX 4.4 renders UTCTimestamp fields (e.g. SendingTime, tag 52) as
//! `YYYYMMDD-HH:MM:SS` or `YYYYMMDD-HH:MM:SS.mmm`. Parsing accepts exactly
//! those two shapes and nothing else.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimestampError {
    #[error("timestamp does not match YYYYMMDD-HH:MM:SS[.mmm]: {0:?}")]
    Malformed(String),

    #[error("calendar component out of range: {0:?}")]
    OutOfRange(String),
}

/// Formats a UTC instant in FIX wire form.
///
/// With `millis` set, the fractional part is always three digits, truncated
/// from any higher-resolution input.
pub fn format_timestamp(t: DateTime<Utc>, millis: bool) -> String {
    if millis {
        t.format("%Y%m%d-%H:%M:%S%.3f").to_string()
    } else {
        t.format("%Y%m%d-%H:%M:%S").to_string()
    }
}

/// The current instant, formatted for a SendingTime (52) header field.
pub fn now_timestamp(millis: bool) -> String {
    format_timestamp(Utc::now(), millis)
}

/// Parses a FIX UTCTimestamp, pinned to UTC.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, TimestampError> {
    let bytes = s.as_bytes();
    let millis = match bytes.len() {
        17 => false,
        21 => true,
        _ => return Err(TimestampError::Malformed(s.to_string())),
    };

    let separators_ok = bytes[8] == b'-'
        && bytes[11] == b':'
        && bytes[14] == b':'
        && (!millis || bytes[17] == b'.');
    if !separators_ok {
        return Err(TimestampError::Malformed(s.to_string()));
    }

    let year = digits(s, 0, 4)?;
    let month = digits(s, 4, 6)?;
    let day = digits(s, 6, 8)?;
    let hour = digits(s, 9, 11)?;
    let minute = digits(s, 12, 14)?;
    let second = digits(s, 15, 17)?;
    let milli = if millis { digits(s, 18, 21)? } else { 0 };

    let date = NaiveDate::from_ymd_opt(year as i32, month, day)
        .ok_or_else(|| TimestampError::OutOfRange(s.to_string()))?;
    let time = chrono::NaiveTime::from_hms_milli_opt(hour, minute, second, milli)
        .ok_or_else(|| TimestampError::OutOfRange(s.to_string()))?;

    Ok(Utc.from_utc_datetime(&NaiveDateTime::new(date, time)))
}

fn digits(s: &str, start: usize, end: usize) -> Result<u32, TimestampError> {
    let part = &s[start..end];
    if !part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TimestampError::Malformed(s.to_string()));
    }
    part.parse()
        .map_err(|_| TimestampError::Malformed(s.to_string()))
}
