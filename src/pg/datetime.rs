//! Date and time codecs.
//!
//! Binary values count from the PostgreSQL epoch, 2000-01-01 00:00:00:
//! days for `date`, microseconds for the timestamp types. `infinity` and
//! `-infinity` are carried as the extreme wire values and map onto the
//! chrono `MAX`/`MIN` constants.

use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, BytesMut};
use chrono::{
    DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc,
};

use super::types::fixed;
use crate::error::{Error, Result};

/// `num_days_from_ce()` of 2000-01-01
const EPOCH_DAYS_FROM_CE: i32 = 730_120;

const USECS_PER_SEC: i64 = 1_000_000;
const USECS_PER_MINUTE: i64 = 60 * USECS_PER_SEC;
const USECS_PER_HOUR: i64 = 60 * USECS_PER_MINUTE;
const USECS_PER_DAY: i64 = 24 * USECS_PER_HOUR;

const TIME_FORMAT: &str = "%H:%M:%S%.f";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

fn invalid(what: &str, s: &str) -> Error {
    Error::Type(format!("Invalid {}: {:?}", what, s))
}

/// Strip a trailing ` BC` era marker.
fn split_era(s: &str) -> (&str, bool) {
    match s.trim().strip_suffix(" BC") {
        Some(rest) => (rest, true),
        None => (s.trim(), false),
    }
}

/// Proleptic year of a `BC` year (1 BC is year 0).
fn from_bc<T: Datelike>(value: T, bc: bool) -> Option<T> {
    if bc {
        value.with_year(1 - value.year())
    } else {
        Some(value)
    }
}

/// Text form of a date-bearing value, with the era marker for years <= 0.
fn format_with_era<T: Datelike + Copy>(value: T, render: impl Fn(T) -> String) -> String {
    if value.year() > 0 {
        return render(value);
    }
    match value.with_year(1 - value.year()) {
        Some(ad) => format!("{} BC", render(ad)),
        None => render(value),
    }
}

// ============================================================================
// date
// ============================================================================

pub fn decode_date(data: &[u8]) -> Result<NaiveDate> {
    let days = i32::from_be_bytes(fixed(data, "DATE")?);
    match days {
        i32::MAX => Ok(NaiveDate::MAX),
        i32::MIN => Ok(NaiveDate::MIN),
        _ => days
            .checked_add(EPOCH_DAYS_FROM_CE)
            .and_then(NaiveDate::from_num_days_from_ce_opt)
            .ok_or_else(|| Error::Type(format!("DATE out of range: {} days", days))),
    }
}

pub fn encode_date(date: NaiveDate, buf: &mut BytesMut) {
    let days = if date == NaiveDate::MAX {
        i32::MAX
    } else if date == NaiveDate::MIN {
        i32::MIN
    } else {
        date.num_days_from_ce() - EPOCH_DAYS_FROM_CE
    };
    buf.put_i32(days);
}

pub fn parse_date(s: &str) -> Result<NaiveDate> {
    match s.trim() {
        "infinity" => return Ok(NaiveDate::MAX),
        "-infinity" => return Ok(NaiveDate::MIN),
        _ => {}
    }
    let (body, bc) = split_era(s);
    NaiveDate::parse_from_str(body, "%Y-%m-%d")
        .ok()
        .and_then(|d| from_bc(d, bc))
        .ok_or_else(|| invalid("DATE", s))
}

pub fn format_date(date: NaiveDate) -> String {
    if date == NaiveDate::MAX {
        return "infinity".to_string();
    }
    if date == NaiveDate::MIN {
        return "-infinity".to_string();
    }
    format_with_era(date, |d| d.format("%Y-%m-%d").to_string())
}

// ============================================================================
// time / timetz
// ============================================================================

fn time_from_micros(micros: i64) -> Result<NaiveTime> {
    if !(0..USECS_PER_DAY).contains(&micros) {
        return Err(Error::Type(format!("TIME out of range: {} us", micros)));
    }
    let secs = (micros / USECS_PER_SEC) as u32;
    let nanos = ((micros % USECS_PER_SEC) * 1_000) as u32;
    NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
        .ok_or_else(|| Error::Type(format!("TIME out of range: {} us", micros)))
}

fn time_to_micros(time: NaiveTime) -> i64 {
    time.num_seconds_from_midnight() as i64 * USECS_PER_SEC + (time.nanosecond() / 1_000) as i64
}

pub fn decode_time(data: &[u8]) -> Result<NaiveTime> {
    time_from_micros(i64::from_be_bytes(fixed(data, "TIME")?))
}

pub fn encode_time(time: NaiveTime, buf: &mut BytesMut) {
    buf.put_i64(time_to_micros(time));
}

pub fn parse_time(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), TIME_FORMAT).map_err(|_| invalid("TIME", s))
}

pub fn format_time(time: NaiveTime) -> String {
    time.format(TIME_FORMAT).to_string()
}

/// The zone is sent as seconds *west* of UTC.
pub fn decode_timetz(data: &[u8]) -> Result<(NaiveTime, FixedOffset)> {
    if data.len() != 12 {
        return Err(Error::Type(format!("Invalid TIMETZ length: {}", data.len())));
    }
    let time = decode_time(&data[..8])?;
    let zone = i32::from_be_bytes(fixed(&data[8..], "TIMETZ")?);
    let offset = zone
        .checked_neg()
        .and_then(FixedOffset::east_opt)
        .ok_or_else(|| Error::Type(format!("TIMETZ zone out of range: {}", zone)))?;
    Ok((time, offset))
}

pub fn encode_timetz(time: NaiveTime, offset: FixedOffset, buf: &mut BytesMut) {
    encode_time(time, buf);
    buf.put_i32(-offset.local_minus_utc());
}

fn parse_offset(s: &str) -> Option<FixedOffset> {
    let (sign, body) = match s.as_bytes().first()? {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => return None,
    };
    let mut secs = 0;
    let mut parts = body.split(':');
    for unit in [3600, 60, 1] {
        match parts.next() {
            Some(p) => secs += p.parse::<i32>().ok()? * unit,
            None => break,
        }
    }
    if parts.next().is_some() {
        return None;
    }
    FixedOffset::east_opt(sign * secs)
}

fn format_offset(offset: FixedOffset) -> String {
    let total = offset.local_minus_utc();
    let sign = if total < 0 { '-' } else { '+' };
    let total = total.abs();
    let (h, m, s) = (total / 3600, total / 60 % 60, total % 60);
    match (m, s) {
        (0, 0) => format!("{}{:02}", sign, h),
        (_, 0) => format!("{}{:02}:{:02}", sign, h, m),
        _ => format!("{}{:02}:{:02}:{:02}", sign, h, m, s),
    }
}

pub fn parse_timetz(s: &str) -> Result<(NaiveTime, FixedOffset)> {
    let trimmed = s.trim();
    let pos = trimmed
        .rfind(|c: char| c == '+' || c == '-')
        .filter(|p| *p > 0)
        .ok_or_else(|| invalid("TIMETZ", s))?;
    let time = parse_time(&trimmed[..pos])?;
    let offset = parse_offset(&trimmed[pos..]).ok_or_else(|| invalid("TIMETZ", s))?;
    Ok((time, offset))
}

pub fn format_timetz(time: NaiveTime, offset: FixedOffset) -> String {
    format!("{}{}", format_time(time), format_offset(offset))
}

// ============================================================================
// timestamp / timestamptz
// ============================================================================

fn timestamp_from_micros(micros: i64) -> Result<NaiveDateTime> {
    let days = micros.div_euclid(USECS_PER_DAY);
    let time = time_from_micros(micros.rem_euclid(USECS_PER_DAY))?;
    i32::try_from(days)
        .ok()
        .and_then(|d| d.checked_add(EPOCH_DAYS_FROM_CE))
        .and_then(NaiveDate::from_num_days_from_ce_opt)
        .map(|date| date.and_time(time))
        .ok_or_else(|| Error::Type(format!("TIMESTAMP out of range: {} us", micros)))
}

fn timestamp_to_micros(ts: NaiveDateTime) -> Result<i64> {
    let days = (ts.date().num_days_from_ce() - EPOCH_DAYS_FROM_CE) as i64;
    days.checked_mul(USECS_PER_DAY)
        .and_then(|d| d.checked_add(time_to_micros(ts.time())))
        .ok_or_else(|| Error::Type(format!("TIMESTAMP out of range: {}", ts)))
}

pub fn decode_timestamp(data: &[u8]) -> Result<NaiveDateTime> {
    match i64::from_be_bytes(fixed(data, "TIMESTAMP")?) {
        i64::MAX => Ok(NaiveDateTime::MAX),
        i64::MIN => Ok(NaiveDateTime::MIN),
        micros => timestamp_from_micros(micros),
    }
}

pub fn encode_timestamp(ts: NaiveDateTime, buf: &mut BytesMut) -> Result<()> {
    let micros = if ts == NaiveDateTime::MAX {
        i64::MAX
    } else if ts == NaiveDateTime::MIN {
        i64::MIN
    } else {
        timestamp_to_micros(ts)?
    };
    buf.put_i64(micros);
    Ok(())
}

pub fn parse_timestamp(s: &str) -> Result<NaiveDateTime> {
    match s.trim() {
        "infinity" => return Ok(NaiveDateTime::MAX),
        "-infinity" => return Ok(NaiveDateTime::MIN),
        _ => {}
    }
    let (body, bc) = split_era(s);
    NaiveDateTime::parse_from_str(body, TIMESTAMP_FORMAT)
        .ok()
        .and_then(|ts| from_bc(ts, bc))
        .ok_or_else(|| invalid("TIMESTAMP", s))
}

pub fn format_timestamp(ts: NaiveDateTime) -> String {
    if ts == NaiveDateTime::MAX {
        return "infinity".to_string();
    }
    if ts == NaiveDateTime::MIN {
        return "-infinity".to_string();
    }
    format_with_era(ts, |t| t.format(TIMESTAMP_FORMAT).to_string())
}

pub fn decode_timestamptz(data: &[u8]) -> Result<DateTime<Utc>> {
    match i64::from_be_bytes(fixed(data, "TIMESTAMPTZ")?) {
        i64::MAX => Ok(DateTime::<Utc>::MAX_UTC),
        i64::MIN => Ok(DateTime::<Utc>::MIN_UTC),
        micros => timestamp_from_micros(micros).map(|ts| Utc.from_utc_datetime(&ts)),
    }
}

pub fn encode_timestamptz(ts: DateTime<Utc>, buf: &mut BytesMut) -> Result<()> {
    let micros = if ts == DateTime::<Utc>::MAX_UTC {
        i64::MAX
    } else if ts == DateTime::<Utc>::MIN_UTC {
        i64::MIN
    } else {
        timestamp_to_micros(ts.naive_utc())?
    };
    buf.put_i64(micros);
    Ok(())
}

pub fn parse_timestamptz(s: &str) -> Result<DateTime<Utc>> {
    match s.trim() {
        "infinity" => return Ok(DateTime::<Utc>::MAX_UTC),
        "-infinity" => return Ok(DateTime::<Utc>::MIN_UTC),
        _ => {}
    }
    let (body, bc) = split_era(s);
    DateTime::parse_from_str(body, "%Y-%m-%d %H:%M:%S%.f%#z")
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
        .and_then(|ts| from_bc(ts, bc))
        .ok_or_else(|| invalid("TIMESTAMPTZ", s))
}

/// Rendered in UTC.
pub fn format_timestamptz(ts: DateTime<Utc>) -> String {
    if ts == DateTime::<Utc>::MAX_UTC {
        return "infinity".to_string();
    }
    if ts == DateTime::<Utc>::MIN_UTC {
        return "-infinity".to_string();
    }
    format_with_era(ts.naive_utc(), |t| {
        format!("{}+00", t.format(TIMESTAMP_FORMAT))
    })
}

// ============================================================================
// interval
// ============================================================================

/// A PostgreSQL `interval`. The three fields are independent, as on the
/// server: a month is not a fixed number of days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interval {
    pub months: i32,
    pub days: i32,
    pub microseconds: i64,
}

impl Interval {
    pub fn new(months: i32, days: i32, microseconds: i64) -> Self {
        Self {
            months,
            days,
            microseconds,
        }
    }

    pub fn decode_binary(data: &[u8]) -> Result<Self> {
        if data.len() != 16 {
            return Err(Error::Type(format!("Invalid INTERVAL length: {}", data.len())));
        }
        Ok(Self {
            microseconds: i64::from_be_bytes(fixed(&data[..8], "INTERVAL")?),
            days: i32::from_be_bytes(fixed(&data[8..12], "INTERVAL")?),
            months: i32::from_be_bytes(fixed(&data[12..], "INTERVAL")?),
        })
    }

    pub fn encode_binary(&self, buf: &mut BytesMut) {
        buf.put_i64(self.microseconds);
        buf.put_i32(self.days);
        buf.put_i32(self.months);
    }

    fn parse_clock(token: &str) -> Option<i64> {
        let (negative, body) = match token.as_bytes().first()? {
            b'-' => (true, &token[1..]),
            b'+' => (false, &token[1..]),
            _ => (false, token),
        };
        let mut parts = body.split(':');
        let hours: i64 = parts.next()?.parse().ok()?;
        let minutes: i64 = parts.next()?.parse().ok()?;
        let seconds = match parts.next() {
            Some(s) => parse_seconds(s)?,
            None => 0,
        };
        if parts.next().is_some() || minutes >= 60 || seconds >= 60 * USECS_PER_SEC {
            return None;
        }
        // Summed with the sign applied so that i64::MIN stays reachable
        let sign = if negative { -1 } else { 1 };
        hours
            .checked_mul(USECS_PER_HOUR)?
            .checked_mul(sign)?
            .checked_add(sign * (minutes * USECS_PER_MINUTE + seconds))
    }
}

/// Unsigned `SS[.ffffff]` to microseconds, without going through a float.
fn parse_seconds(s: &str) -> Option<i64> {
    let (whole, frac) = s.split_once('.').unwrap_or((s, ""));
    if frac.len() > 6 || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let whole: i64 = whole.parse().ok()?;
    let frac: i64 = if frac.is_empty() {
        0
    } else {
        format!("{:0<6}", frac).parse().ok()?
    };
    whole.checked_mul(USECS_PER_SEC)?.checked_add(frac)
}

impl FromStr for Interval {
    type Err = Error;

    /// Parses the `postgres` interval style, e.g.
    /// `1 year 2 mons -3 days +04:05:06.789`.
    fn from_str(s: &str) -> Result<Self> {
        let fail = || invalid("INTERVAL", s);
        let mut interval = Interval::default();
        let mut tokens = s.split_whitespace().peekable();
        let mut ago = false;

        while let Some(token) = tokens.next() {
            if token.contains(':') {
                let micros = Self::parse_clock(token).ok_or_else(fail)?;
                interval.microseconds = interval
                    .microseconds
                    .checked_add(micros)
                    .ok_or_else(fail)?;
                continue;
            }
            if token == "ago" {
                ago = true;
                continue;
            }
            if token == "@" {
                continue;
            }

            let unit = tokens.next().ok_or_else(fail)?.to_ascii_lowercase();
            let unit = unit.strip_suffix('s').unwrap_or(&unit);
            if matches!(unit, "sec" | "second") {
                let (negative, body) = match token.strip_prefix('-') {
                    Some(rest) => (true, rest),
                    None => (false, token.trim_start_matches('+')),
                };
                let micros = parse_seconds(body).ok_or_else(fail)?;
                let micros = if negative { -micros } else { micros };
                interval.microseconds =
                    interval.microseconds.checked_add(micros).ok_or_else(fail)?;
                continue;
            }

            let n: i64 = token.parse().map_err(|_| fail())?;
            let add = |field: i32, scale: i64| {
                n.checked_mul(scale)
                    .and_then(|v| v.checked_add(field as i64))
                    .and_then(|v| i32::try_from(v).ok())
                    .ok_or_else(fail)
            };
            match unit {
                "year" => interval.months = add(interval.months, 12)?,
                "mon" | "month" => interval.months = add(interval.months, 1)?,
                "week" => interval.days = add(interval.days, 7)?,
                "day" => interval.days = add(interval.days, 1)?,
                "hour" => {
                    interval.microseconds = n
                        .checked_mul(USECS_PER_HOUR)
                        .and_then(|v| v.checked_add(interval.microseconds))
                        .ok_or_else(fail)?
                }
                "min" | "minute" => {
                    interval.microseconds = n
                        .checked_mul(USECS_PER_MINUTE)
                        .and_then(|v| v.checked_add(interval.microseconds))
                        .ok_or_else(fail)?
                }
                _ => return Err(fail()),
            }
        }

        if ago {
            interval = Interval {
                months: interval.months.checked_neg().ok_or_else(fail)?,
                days: interval.days.checked_neg().ok_or_else(fail)?,
                microseconds: interval.microseconds.checked_neg().ok_or_else(fail)?,
            };
        }
        Ok(interval)
    }
}

impl fmt::Display for Interval {
    /// Renders the `postgres` interval style, the server's default output.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        let mut is_before = false;
        let mut is_zero = true;

        let fields = [
            (self.months / 12, "year"),
            (self.months % 12, "mon"),
            (self.days, "day"),
        ];
        for (value, unit) in fields {
            if value == 0 {
                continue;
            }
            if !is_zero {
                out.push(' ');
            }
            let sign = if is_before && value > 0 { "+" } else { "" };
            let plural = if value != 1 { "s" } else { "" };
            out.push_str(&format!("{}{} {}{}", sign, value, unit, plural));
            is_before |= value < 0;
            is_zero = false;
        }

        let time = self.microseconds;
        if is_zero || time != 0 {
            let magnitude = time.unsigned_abs();
            let hours = magnitude / USECS_PER_HOUR as u64;
            let minutes = magnitude / USECS_PER_MINUTE as u64 % 60;
            let seconds = magnitude / USECS_PER_SEC as u64 % 60;
            let fraction = magnitude % USECS_PER_SEC as u64;

            if !is_zero {
                out.push(' ');
            }
            if time < 0 {
                out.push('-');
            } else if is_before {
                out.push('+');
            }
            out.push_str(&format!("{:02}:{:02}:{:02}", hours, minutes, seconds));
            if fraction != 0 {
                let digits = format!("{:06}", fraction);
                out.push('.');
                out.push_str(digits.trim_end_matches('0'));
            }
        }

        f.write_str(&out)
    }
}
