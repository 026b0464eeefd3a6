//! Text format of `timestamp`, `timestamptz` and `date`.
//!
//! The grammar is `YYYY-MM-DD HH:MM:SS[.fffffffff][±HH[:MM[:SS]]][ BC]`.
//! Years may have more than four digits. Year 0 and earlier are printed
//! as `1 - year` with a ` BC` suffix, the way the server prints them.
//!
//! The server's `infinity` and `-infinity` have no chrono counterpart.
//! [`enable_infinity_ts`] maps them to caller-chosen sentinel values in
//! both directions until [`disable_infinity_ts`] is called.

use std::fmt::Write as _;
use std::sync::{PoisonError, RwLock};

use chrono::{
    DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc,
};

use crate::error::{Error, Result};
use crate::protocol::types::{Oid, oid};

use super::{FromWireValue, ToWireValue};

#[derive(Debug, Clone, Copy)]
struct Sentinels {
    neg: NaiveDateTime,
    pos: NaiveDateTime,
}

static INFINITY_TS: RwLock<Option<Sentinels>> = RwLock::new(None);

/// Map `-infinity` to `neg` and `infinity` to `pos` (both read as UTC for timestamptz).
///
/// Values at or before `neg` encode as `-infinity`, values at or after `pos`
/// as `infinity`. Calling again replaces the previous pair.
pub fn enable_infinity_ts(neg: NaiveDateTime, pos: NaiveDateTime) -> Result<()> {
    if neg >= pos {
        return Err(Error::InvalidUsage(
            "infinity timestamp: negative sentinel must be before the positive one".into(),
        ));
    }
    let mut guard = INFINITY_TS.write().unwrap_or_else(PoisonError::into_inner);
    *guard = Some(Sentinels { neg, pos });
    Ok(())
}

/// Stop mapping `infinity`; decoding it into chrono types fails again.
pub fn disable_infinity_ts() {
    let mut guard = INFINITY_TS.write().unwrap_or_else(PoisonError::into_inner);
    *guard = None;
}

fn sentinels() -> Option<Sentinels> {
    *INFINITY_TS.read().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Infinity {
    Neg,
    Pos,
}

fn infinity_literal(bytes: &[u8]) -> Option<Infinity> {
    match bytes {
        b"infinity" => Some(Infinity::Pos),
        b"-infinity" => Some(Infinity::Neg),
        _ => None,
    }
}

/// True when `bytes` is an infinity literal that no sentinel maps.
pub(crate) fn is_unmapped_infinity(bytes: &[u8]) -> bool {
    infinity_literal(bytes).is_some() && sentinels().is_none()
}

fn infinity_value(which: Infinity) -> Result<NaiveDateTime> {
    match (sentinels(), which) {
        (Some(s), Infinity::Neg) => Ok(s.neg),
        (Some(s), Infinity::Pos) => Ok(s.pos),
        (None, _) => Err(Error::Decode(
            "infinity timestamp without sentinels, see enable_infinity_ts".into(),
        )),
    }
}

fn infinity_for(utc: NaiveDateTime) -> Option<&'static str> {
    let s = sentinels()?;
    if utc <= s.neg {
        Some("-infinity")
    } else if utc >= s.pos {
        Some("infinity")
    } else {
        None
    }
}

struct Cursor<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0 }
    }

    fn error(&self, what: &str) -> Error {
        Error::Decode(format!(
            "invalid {} {:?} at offset {}",
            what,
            String::from_utf8_lossy(self.input),
            self.pos
        ))
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn eat(&mut self, b: u8) -> bool {
        if self.peek() == Some(b) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, b: u8, what: &str) -> Result<()> {
        if self.eat(b) { Ok(()) } else { Err(self.error(what)) }
    }

    /// Between `min` and `max` ASCII digits.
    fn digits(&mut self, min: usize, max: usize, what: &str) -> Result<(i64, usize)> {
        let start = self.pos;
        let mut value: i64 = 0;
        while self.pos - start < max {
            match self.peek() {
                Some(d @ b'0'..=b'9') => {
                    value = value * 10 + i64::from(d - b'0');
                    self.pos += 1;
                }
                _ => break,
            }
        }
        let n = self.pos - start;
        if n < min {
            return Err(self.error(what));
        }
        Ok((value, n))
    }

    fn finish(&self, what: &str) -> Result<()> {
        if self.pos == self.input.len() { Ok(()) } else { Err(self.error(what)) }
    }

    fn date(&mut self, bc: bool) -> Result<NaiveDate> {
        let (year, _) = self.digits(4, 9, "date")?;
        self.expect(b'-', "date")?;
        let (month, _) = self.digits(2, 2, "date")?;
        self.expect(b'-', "date")?;
        let (day, _) = self.digits(2, 2, "date")?;
        let year = if bc { 1 - year } else { year };
        i32::try_from(year)
            .ok()
            .and_then(|y| NaiveDate::from_ymd_opt(y, month as u32, day as u32))
            .ok_or_else(|| self.error("date"))
    }

    fn time(&mut self) -> Result<NaiveTime> {
        let (hour, _) = self.digits(2, 2, "time")?;
        self.expect(b':', "time")?;
        let (minute, _) = self.digits(2, 2, "time")?;
        self.expect(b':', "time")?;
        let (second, _) = self.digits(2, 2, "time")?;
        let mut nanos = 0;
        if self.eat(b'.') {
            let (frac, n) = self.digits(1, 9, "fractional seconds")?;
            nanos = frac * 10_i64.pow(9 - n as u32);
        }
        NaiveTime::from_hms_nano_opt(hour as u32, minute as u32, second as u32, nanos as u32)
            .ok_or_else(|| self.error("time"))
    }

    fn offset(&mut self) -> Result<FixedOffset> {
        let sign = match self.peek() {
            Some(b'+') => 1,
            Some(b'-') => -1,
            _ => return Err(self.error("time zone offset")),
        };
        self.pos += 1;
        let (hours, _) = self.digits(2, 2, "time zone offset")?;
        let mut secs = hours * 3600;
        if self.eat(b':') {
            let (minutes, _) = self.digits(2, 2, "time zone offset")?;
            secs += minutes * 60;
            if self.eat(b':') {
                let (seconds, _) = self.digits(2, 2, "time zone offset")?;
                secs += seconds;
            }
        }
        FixedOffset::east_opt((sign * secs) as i32).ok_or_else(|| self.error("time zone offset"))
    }

    fn date_time_separator(&mut self) -> Result<()> {
        if self.eat(b' ') || self.eat(b'T') {
            Ok(())
        } else {
            Err(self.error("timestamp"))
        }
    }
}

fn strip_bc(input: &[u8]) -> (&[u8], bool) {
    match input.strip_suffix(b" BC") {
        Some(body) => (body, true),
        None => (input, false),
    }
}

/// Parse the text form of `timestamp`.
pub fn parse_timestamp(input: &[u8]) -> Result<NaiveDateTime> {
    if let Some(which) = infinity_literal(input) {
        return infinity_value(which);
    }
    let (body, bc) = strip_bc(input);
    let mut cur = Cursor::new(body);
    let date = cur.date(bc)?;
    cur.date_time_separator()?;
    let time = cur.time()?;
    cur.finish("timestamp")?;
    Ok(date.and_time(time))
}

/// Parse the text form of `timestamptz`.
pub fn parse_timestamptz(input: &[u8]) -> Result<DateTime<FixedOffset>> {
    if let Some(which) = infinity_literal(input) {
        let utc = infinity_value(which)?;
        return Ok(Utc.from_utc_datetime(&utc).fixed_offset());
    }
    let (body, bc) = strip_bc(input);
    let mut cur = Cursor::new(body);
    let date = cur.date(bc)?;
    cur.date_time_separator()?;
    let time = cur.time()?;
    let offset = cur.offset()?;
    cur.finish("timestamptz")?;
    offset
        .from_local_datetime(&date.and_time(time))
        .single()
        .ok_or_else(|| cur.error("timestamptz"))
}

/// Parse the text form of `date`.
pub fn parse_date(input: &[u8]) -> Result<NaiveDate> {
    if let Some(which) = infinity_literal(input) {
        return infinity_value(which).map(|ts| ts.date());
    }
    let (body, bc) = strip_bc(input);
    let mut cur = Cursor::new(body);
    let date = cur.date(bc)?;
    cur.finish("date")?;
    Ok(date)
}

/// Returns whether the year needs a ` BC` suffix.
fn write_date(out: &mut String, date: NaiveDate) -> bool {
    let year = date.year();
    let (year, bc) = if year <= 0 { (1 - year, true) } else { (year, false) };
    let _ = write!(out, "{:04}-{:02}-{:02}", year, date.month(), date.day());
    bc
}

fn write_time(out: &mut String, time: NaiveTime) {
    let _ = write!(
        out,
        "{:02}:{:02}:{:02}",
        time.hour(),
        time.minute(),
        time.second()
    );
    let nanos = time.nanosecond() % 1_000_000_000;
    if nanos != 0 {
        let frac = format!("{nanos:09}");
        out.push('.');
        out.push_str(frac.trim_end_matches('0'));
    }
}

fn write_offset(out: &mut String, offset: FixedOffset) {
    let secs = offset.local_minus_utc();
    let sign = if secs < 0 { '-' } else { '+' };
    let secs = secs.unsigned_abs();
    let (h, m, s) = (secs / 3600, secs / 60 % 60, secs % 60);
    let _ = write!(out, "{sign}{h:02}:{m:02}");
    if s != 0 {
        let _ = write!(out, ":{s:02}");
    }
}

/// Text form of a `timestamp` value.
pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    if let Some(inf) = infinity_for(*ts) {
        return inf.to_string();
    }
    let mut out = String::with_capacity(32);
    let bc = write_date(&mut out, ts.date());
    out.push(' ');
    write_time(&mut out, ts.time());
    if bc {
        out.push_str(" BC");
    }
    out
}

/// Text form of a `timestamptz` value, keeping its offset.
pub fn format_timestamptz(ts: &DateTime<FixedOffset>) -> String {
    if let Some(inf) = infinity_for(ts.naive_utc()) {
        return inf.to_string();
    }
    let local = ts.naive_local();
    let mut out = String::with_capacity(40);
    let bc = write_date(&mut out, local.date());
    out.push(' ');
    write_time(&mut out, local.time());
    write_offset(&mut out, *ts.offset());
    if bc {
        out.push_str(" BC");
    }
    out
}

/// Text form of a `date` value.
pub fn format_date(date: &NaiveDate) -> String {
    if let Some(inf) = infinity_for(date.and_time(NaiveTime::MIN)) {
        return inf.to_string();
    }
    let mut out = String::with_capacity(16);
    if write_date(&mut out, *date) {
        out.push_str(" BC");
    }
    out
}

fn check_oid(oid: Oid, expected: Oid, target: &str) -> Result<()> {
    if oid == expected {
        Ok(())
    } else {
        Err(Error::Decode(format!("cannot decode oid {} as {}", oid, target)))
    }
}

fn no_binary(oid: Oid) -> Error {
    Error::Unsupported(format!("binary format for oid {}", oid))
}

impl FromWireValue<'_> for NaiveDateTime {
    fn from_text(oid: Oid, bytes: &[u8]) -> Result<Self> {
        check_oid(oid, oid::TIMESTAMP, "NaiveDateTime")?;
        parse_timestamp(bytes)
    }

    fn from_binary(oid: Oid, _bytes: &[u8]) -> Result<Self> {
        Err(no_binary(oid))
    }
}

impl FromWireValue<'_> for DateTime<FixedOffset> {
    fn from_text(oid: Oid, bytes: &[u8]) -> Result<Self> {
        check_oid(oid, oid::TIMESTAMPTZ, "DateTime<FixedOffset>")?;
        parse_timestamptz(bytes)
    }

    fn from_binary(oid: Oid, _bytes: &[u8]) -> Result<Self> {
        Err(no_binary(oid))
    }
}

impl FromWireValue<'_> for DateTime<Utc> {
    fn from_text(oid: Oid, bytes: &[u8]) -> Result<Self> {
        DateTime::<FixedOffset>::from_text(oid, bytes).map(|ts| ts.with_timezone(&Utc))
    }

    fn from_binary(oid: Oid, _bytes: &[u8]) -> Result<Self> {
        Err(no_binary(oid))
    }
}

impl FromWireValue<'_> for NaiveDate {
    fn from_text(oid: Oid, bytes: &[u8]) -> Result<Self> {
        check_oid(oid, oid::DATE, "NaiveDate")?;
        parse_date(bytes)
    }

    fn from_binary(oid: Oid, _bytes: &[u8]) -> Result<Self> {
        Err(no_binary(oid))
    }
}

impl ToWireValue for NaiveDateTime {
    fn natural_oid(&self) -> Oid {
        oid::TIMESTAMP
    }

    fn write_text(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(format_timestamp(self).as_bytes());
        Ok(())
    }
}

impl ToWireValue for DateTime<FixedOffset> {
    fn natural_oid(&self) -> Oid {
        oid::TIMESTAMPTZ
    }

    fn write_text(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(format_timestamptz(self).as_bytes());
        Ok(())
    }
}

impl ToWireValue for DateTime<Utc> {
    fn natural_oid(&self) -> Oid {
        oid::TIMESTAMPTZ
    }

    fn write_text(&self, buf: &mut Vec<u8>) -> Result<()> {
        self.fixed_offset().write_text(buf)
    }
}

impl ToWireValue for NaiveDate {
    fn natural_oid(&self) -> Oid {
        oid::DATE
    }

    fn write_text(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(format_date(self).as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32, nanos: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_nano_opt(h, mi, s, nanos)
            .unwrap()
    }

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(
            parse_timestamp(b"2024-02-29 13:04:05.123456").unwrap(),
            ts(2024, 2, 29, 13, 4, 5, 123_456_000)
        );
        assert_eq!(
            parse_timestamp(b"12345-01-02 00:00:00").unwrap(),
            ts(12345, 1, 2, 0, 0, 0, 0)
        );
        assert_eq!(
            parse_timestamp(b"0044-03-15 12:00:00 BC").unwrap(),
            ts(-43, 3, 15, 12, 0, 0, 0)
        );
        assert!(parse_timestamp(b"2024-02-30 00:00:00").is_err());
        assert!(parse_timestamp(b"2024-01-01 00:00:00+08").is_err());
        assert!(parse_timestamp(b"2024-01-01").is_err());
    }

    #[test]
    fn test_parse_timestamptz() {
        let parsed = parse_timestamptz(b"2024-01-01 08:00:00+08").unwrap();
        assert_eq!(parsed.naive_utc(), ts(2024, 1, 1, 0, 0, 0, 0));
        assert_eq!(parsed.offset().local_minus_utc(), 8 * 3600);

        let parsed = parse_timestamptz(b"1900-01-01 00:00:00+05:53:28").unwrap();
        assert_eq!(parsed.offset().local_minus_utc(), 5 * 3600 + 53 * 60 + 28);

        let parsed = parse_timestamptz(b"2020-06-01 10:00:00.5-03:30").unwrap();
        assert_eq!(parsed.naive_utc(), ts(2020, 6, 1, 13, 30, 0, 500_000_000));
    }

    #[test]
    fn test_format() {
        assert_eq!(
            format_timestamp(&ts(2024, 2, 29, 13, 4, 5, 120_000_000)),
            "2024-02-29 13:04:05.12"
        );
        assert_eq!(format_timestamp(&ts(0, 1, 1, 0, 0, 0, 0)), "0001-01-01 00:00:00 BC");
        assert_eq!(format_timestamp(&ts(10000, 1, 1, 0, 0, 0, 0)), "10000-01-01 00:00:00");

        let offset = FixedOffset::west_opt(3 * 3600 + 30 * 60).unwrap();
        let value = offset.from_local_datetime(&ts(2020, 6, 1, 10, 0, 0, 0)).unwrap();
        assert_eq!(format_timestamptz(&value), "2020-06-01 10:00:00-03:30");
        assert_eq!(parse_timestamptz(format_timestamptz(&value).as_bytes()).unwrap(), value);

        let date = NaiveDate::from_ymd_opt(-1, 12, 31).unwrap();
        assert_eq!(format_date(&date), "0002-12-31 BC");
        assert_eq!(parse_date(b"0002-12-31 BC").unwrap(), date);
    }

    // One test touches the process-wide sentinels so parallel tests cannot race on them.
    #[test]
    fn test_infinity_sentinels() {
        assert!(parse_timestamp(b"infinity").is_err());
        assert!(is_unmapped_infinity(b"-infinity"));

        let neg = ts(-4000, 1, 1, 0, 0, 0, 0);
        let pos = ts(9000, 1, 1, 0, 0, 0, 0);
        assert!(matches!(
            enable_infinity_ts(pos, neg),
            Err(Error::InvalidUsage(_))
        ));
        enable_infinity_ts(neg, pos).unwrap();

        assert_eq!(parse_timestamp(b"-infinity").unwrap(), neg);
        assert_eq!(parse_timestamptz(b"infinity").unwrap().naive_utc(), pos);
        assert_eq!(format_timestamp(&ts(9999, 1, 1, 0, 0, 0, 0)), "infinity");
        assert_eq!(format_timestamp(&neg), "-infinity");
        assert_eq!(format_timestamp(&ts(2000, 1, 1, 0, 0, 0, 0)), "2000-01-01 00:00:00");
        assert!(!is_unmapped_infinity(b"infinity"));

        disable_infinity_ts();
        assert!(parse_timestamp(b"infinity").is_err());
        assert_eq!(format_timestamp(&pos), "9000-01-01 00:00:00");
    }
}
