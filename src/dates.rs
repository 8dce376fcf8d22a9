//! Date handling
//!
//! The command line and log messages use day/month/year text. The store keeps
//! ISO-8601 text so that string comparison matches chronological order.

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};

/// Day/month/year format used at the CLI and in log entries.
pub const DMY_FORMAT: &str = "%d/%m/%Y";

/// Timestamp format stored in `call_analysis.attend_date_time`.
pub const STORE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Date format stored in `call_predictions.prediction_date`.
pub const STORE_DATE_FORMAT: &str = "%Y-%m-%d";

/// Parse a `dd/mm/yyyy` date.
pub fn parse_dmy(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s.trim(), DMY_FORMAT)
        .map_err(|e| format!("Invalid date '{}' (expected dd/mm/yyyy): {}", s, e))
}

pub fn format_dmy(date: NaiveDate) -> String {
    date.format(DMY_FORMAT).to_string()
}

pub fn to_store_date(date: NaiveDate) -> String {
    date.format(STORE_DATE_FORMAT).to_string()
}

pub fn to_store_timestamp(ts: NaiveDateTime) -> String {
    ts.format(STORE_TIMESTAMP_FORMAT).to_string()
}

/// Parse a stored timestamp. Accepts a bare date or an ISO `T` separator as well.
pub fn parse_store_timestamp(s: &str) -> Result<NaiveDateTime, String> {
    let s = s.trim();
    NaiveDateTime::parse_from_str(s, STORE_TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
        .or_else(|_| {
            NaiveDate::parse_from_str(s, STORE_DATE_FORMAT).map(|d| d.and_time(NaiveTime::MIN))
        })
        .map_err(|e| format!("Invalid timestamp '{}': {}", s, e))
}

/// First instant of `date`.
pub fn start_of_day(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
}

/// First instant after `date`, so `[start_of_day(a), end_exclusive(b))` covers both days whole.
pub fn end_exclusive(date: NaiveDate) -> NaiveDateTime {
    start_of_day(date + Duration::days(1))
}
