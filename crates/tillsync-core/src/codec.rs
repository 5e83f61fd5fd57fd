//! Normalization of dates, amounts and timestamps coming from the write path
//! or from spreadsheet cells.
//!
//! Everything here is total: malformed input degrades to a usable default
//! (today's business date, `0.0`, `None`) instead of failing. Spreadsheet
//! cells arrive as `serde_json::Value` because the remote service hands back
//! strings, numbers and booleans interchangeably.

use chrono::{DateTime, Days, FixedOffset, NaiveDate, NaiveDateTime, Offset, SecondsFormat, Utc};
use serde_json::Value;

/// Largest spreadsheet serial we accept (9999-12-31).
const MAX_SERIAL_DAY: f64 = 2_958_465.0;

/// Resolves "today" for the business in a fixed UTC offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusinessClock {
    offset: FixedOffset,
    pinned: Option<NaiveDate>,
}

impl Default for BusinessClock {
    fn default() -> Self {
        Self::utc()
    }
}

impl BusinessClock {
    /// Clock in UTC.
    #[must_use]
    pub fn utc() -> Self {
        Self {
            offset: Utc.fix(),
            pinned: None,
        }
    }

    /// Clock at `minutes` east of UTC. Out-of-range offsets fall back to UTC.
    #[must_use]
    pub fn with_offset_minutes(minutes: i32) -> Self {
        let offset = minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| Utc.fix());
        Self {
            offset,
            pinned: None,
        }
    }

    /// Clock whose "today" never moves. Used by tests and replays.
    #[must_use]
    pub fn pinned(date: NaiveDate) -> Self {
        Self {
            offset: Utc.fix(),
            pinned: Some(date),
        }
    }

    #[must_use]
    pub fn offset_minutes(&self) -> i32 {
        self.offset.local_minus_utc() / 60
    }

    /// Current business day.
    #[must_use]
    pub fn today(&self) -> NaiveDate {
        self.pinned
            .unwrap_or_else(|| Utc::now().with_timezone(&self.offset).date_naive())
    }

    /// Current business day as `YYYY-MM-DD`.
    #[must_use]
    pub fn today_iso(&self) -> String {
        self.today().format("%Y-%m-%d").to_string()
    }
}

/// Current UTC instant truncated to whole milliseconds.
///
/// Timestamps round-trip through spreadsheet cells at millisecond precision,
/// so anything finer would make every pass see a "newer" local copy.
#[must_use]
pub fn now_ms() -> DateTime<Utc> {
    truncate_ms(Utc::now())
}

/// Drop sub-millisecond precision from a timestamp.
#[must_use]
pub fn truncate_ms(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}

/// Render a timestamp the way it is stored in ledgers and mirror cells.
#[must_use]
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Normalize a business date to `YYYY-MM-DD`.
///
/// Accepts empty input (today), spreadsheet serial day numbers, `dd/mm/yyyy`,
/// `yyyy/mm/dd` and anything that starts with an ISO date.
#[must_use]
pub fn parse_date(input: &Value, clock: &BusinessClock) -> String {
    let parsed = match input {
        Value::Number(n) => n.as_f64().and_then(serial_to_date),
        Value::String(s) => parse_date_text(s),
        _ => None,
    };
    parsed.map_or_else(
        || clock.today_iso(),
        |date| date.format("%Y-%m-%d").to_string(),
    )
}

/// [`parse_date`] for plain strings.
#[must_use]
pub fn parse_date_str(input: &str, clock: &BusinessClock) -> String {
    parse_date(&Value::String(input.to_string()), clock)
}

fn parse_date_text(raw: &str) -> Option<NaiveDate> {
    let text = ascii_digits(raw.trim());
    if text.is_empty() {
        return None;
    }

    if text.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return text.parse::<f64>().ok().and_then(serial_to_date);
    }

    if text.contains('/') {
        let parts: Vec<&str> = text.split('/').map(str::trim).collect();
        return match parts[..] {
            [year, month, day] if year.len() == 4 => {
                NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, day.parse().ok()?)
            }
            [day, month, year] => {
                let day: u32 = day.parse().ok()?;
                let month: u32 = month.parse().ok()?;
                let mut year: i32 = year.get(..4).unwrap_or(year).parse().ok()?;
                if year < 100 {
                    year += 2000;
                }
                NaiveDate::from_ymd_opt(year, month, day)
            }
            _ => None,
        };
    }

    let prefix = text.get(..10)?;
    NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok()
}

/// Convert a spreadsheet serial day count (days since 1899-12-30) to a date.
/// Fractional parts (time of day) are ignored.
#[must_use]
pub fn serial_to_date(serial: f64) -> Option<NaiveDate> {
    if !serial.is_finite() || !(1.0..=MAX_SERIAL_DAY).contains(&serial) {
        return None;
    }
    let days = serial.floor() as u64;
    NaiveDate::from_ymd_opt(1899, 12, 30)?.checked_add_days(Days::new(days))
}

/// Normalize an amount to `f64`. Never fails; garbage becomes `0.0`.
#[must_use]
pub fn parse_amount(input: &Value) -> f64 {
    match input {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()).unwrap_or(0.0),
        Value::String(s) => parse_amount_str(s),
        _ => 0.0,
    }
}

/// [`parse_amount`] for plain strings.
#[must_use]
pub fn parse_amount_str(raw: &str) -> f64 {
    let mut cleaned = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '0'..='9' | '.' => cleaned.push(ch),
            // Arabic decimal separator
            '\u{066B}' => cleaned.push('.'),
            '-' | '\u{2212}' if cleaned.is_empty() => cleaned.push('-'),
            _ => {
                if let Some(digit) = localized_digit(ch) {
                    cleaned.push(digit);
                }
                // Grouping separators, currency symbols and whitespace drop out.
            }
        }
    }
    cleaned
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

fn localized_digit(ch: char) -> Option<char> {
    let code = ch as u32;
    let base = match code {
        0x0660..=0x0669 => 0x0660,
        0x06F0..=0x06F9 => 0x06F0,
        _ => return None,
    };
    char::from_digit(code - base, 10)
}

/// Map localized digits to ASCII, leaving everything else intact.
#[must_use]
pub fn ascii_digits(raw: &str) -> String {
    raw.chars().map(|c| localized_digit(c).unwrap_or(c)).collect()
}

/// Parse a timestamp cell: RFC 3339, `YYYY-MM-DD HH:MM:SS` (taken as UTC) or
/// a spreadsheet serial with a fractional day.
#[must_use]
pub fn parse_timestamp(input: &Value) -> Option<DateTime<Utc>> {
    match input {
        Value::String(s) => parse_timestamp_str(s),
        Value::Number(n) => n.as_f64().and_then(serial_to_timestamp),
        _ => None,
    }
}

fn parse_timestamp_str(raw: &str) -> Option<DateTime<Utc>> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(truncate_ms(ts.with_timezone(&Utc)));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%d/%m/%Y %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, fmt) {
            return Some(truncate_ms(naive.and_utc()));
        }
    }
    if text.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return text.parse::<f64>().ok().and_then(serial_to_timestamp);
    }
    None
}

fn serial_to_timestamp(serial: f64) -> Option<DateTime<Utc>> {
    let date = serial_to_date(serial)?;
    let millis = (serial.fract() * 86_400_000.0).round() as i64;
    let midnight = date.and_hms_opt(0, 0, 0)?.and_utc();
    midnight.checked_add_signed(chrono::TimeDelta::try_milliseconds(millis)?)
}

/// Render a cell as trimmed text.
#[must_use]
pub fn cell_text(input: &Value) -> String {
    match input {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        Value::Bool(b) => (if *b { "TRUE" } else { "FALSE" }).to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn clock() -> BusinessClock {
        BusinessClock::pinned(NaiveDate::from_ymd_opt(2024, 5, 6).unwrap())
    }

    #[test]
    fn amount_with_grouping_separator() {
        assert_eq!(parse_amount(&json!("1,234.50")), 1234.5);
    }

    #[test]
    fn amount_with_arabic_indic_digits_and_decimal() {
        assert_eq!(parse_amount(&json!("١٢٣٤٫٥٠")), 1234.5);
        assert_eq!(parse_amount(&json!("۱۲۳۴٫۵")), 1234.5);
        assert_eq!(parse_amount(&json!("١٬٢٣٤")), 1234.0);
    }

    #[test]
    fn amount_native_number_unchanged() {
        assert_eq!(parse_amount(&json!(1234.5)), 1234.5);
        assert_eq!(parse_amount(&json!(-3)), -3.0);
    }

    #[test]
    fn amount_strips_currency_and_spaces() {
        assert_eq!(parse_amount(&json!("KES 2 500")), 2500.0);
        assert_eq!(parse_amount(&json!("-12.5")), -12.5);
    }

    #[test]
    fn amount_garbage_is_zero() {
        assert_eq!(parse_amount(&json!("")), 0.0);
        assert_eq!(parse_amount(&json!("abc")), 0.0);
        assert_eq!(parse_amount(&json!("1.2.3")), 0.0);
        assert_eq!(parse_amount(&Value::Null), 0.0);
        assert_eq!(parse_amount(&json!(true)), 0.0);
        assert_eq!(parse_amount_str("--"), 0.0);
    }

    #[test]
    fn date_slash_format() {
        assert_eq!(parse_date(&json!("31/01/2024"), &clock()), "2024-01-31");
        assert_eq!(parse_date(&json!("1/2/2024"), &clock()), "2024-02-01");
        assert_eq!(parse_date(&json!("05/06/24"), &clock()), "2024-06-05");
    }

    #[test]
    fn date_serial_number() {
        assert_eq!(parse_date(&json!(45000), &clock()), "2023-03-15");
        assert_eq!(parse_date(&json!(45000.75), &clock()), "2023-03-15");
        assert_eq!(parse_date(&json!("45000"), &clock()), "2023-03-15");
        assert_eq!(parse_date(&json!(25569), &clock()), "1970-01-01");
    }

    #[test]
    fn date_iso_prefix() {
        assert_eq!(
            parse_date(&json!("2024-03-09T10:11:12.000Z"), &clock()),
            "2024-03-09"
        );
        assert_eq!(parse_date(&json!("2024-03-09"), &clock()), "2024-03-09");
    }

    #[test]
    fn date_empty_or_garbage_is_today() {
        assert_eq!(parse_date(&json!(""), &clock()), "2024-05-06");
        assert_eq!(parse_date(&Value::Null, &clock()), "2024-05-06");
        assert_eq!(parse_date(&json!("yesterday"), &clock()), "2024-05-06");
        assert_eq!(parse_date(&json!("31/02/2024"), &clock()), "2024-05-06");
        assert_eq!(parse_date(&json!(-4), &clock()), "2024-05-06");
    }

    #[test]
    fn date_with_year_first_slashes() {
        assert_eq!(parse_date(&json!("2024/01/31"), &clock()), "2024-01-31");
        assert_eq!(parse_date(&json!("2024/1/5"), &clock()), "2024-01-05");
        assert_eq!(parse_date(&json!("2024/31/01"), &clock()), "2024-05-06");
        assert_eq!(parse_date(&json!("31/01/2024"), &clock()), "2024-01-31");
    }

    #[test]
    fn date_with_localized_digits() {
        assert_eq!(parse_date(&json!("٣١/٠١/٢٠٢٤"), &clock()), "2024-01-31");
    }

    #[test]
    fn clock_offset_is_clamped() {
        assert_eq!(BusinessClock::with_offset_minutes(180).offset_minutes(), 180);
        assert_eq!(BusinessClock::with_offset_minutes(-300).offset_minutes(), -300);
        assert_eq!(
            BusinessClock::with_offset_minutes(100_000).offset_minutes(),
            0
        );
    }

    #[test]
    fn timestamps_parse_and_truncate() {
        let ts = parse_timestamp(&json!("2024-01-31T10:00:00.123456Z")).unwrap();
        assert_eq!(format_timestamp(&ts), "2024-01-31T10:00:00.123Z");

        let ts = parse_timestamp(&json!("2024-01-31 10:00:00")).unwrap();
        assert_eq!(format_timestamp(&ts), "2024-01-31T10:00:00.000Z");

        let ts = parse_timestamp(&json!(45000.5)).unwrap();
        assert_eq!(format_timestamp(&ts), "2023-03-15T12:00:00.000Z");

        assert!(parse_timestamp(&json!("")).is_none());
        assert!(parse_timestamp(&json!("soon")).is_none());
    }

    #[test]
    fn now_ms_has_no_sub_millisecond_part() {
        let now = now_ms();
        assert_eq!(now.timestamp_subsec_nanos() % 1_000_000, 0);
    }

    #[test]
    fn cell_text_renders_scalars() {
        assert_eq!(cell_text(&json!("  a ")), "a");
        assert_eq!(cell_text(&json!(12.5)), "12.5");
        assert_eq!(cell_text(&json!(true)), "TRUE");
        assert_eq!(cell_text(&Value::Null), "");
    }
}
