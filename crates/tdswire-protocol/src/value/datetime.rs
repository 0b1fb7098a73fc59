//! Date and time wire formats.
//!
//! | Type | Layout |
//! |------|--------|
//! | `DATE` | 3-byte day count since 0001-01-01 |
//! | `TIME(n)` | 3/4/5-byte count of `10^-n` second units since midnight |
//! | `DATETIME2(n)` | `TIME(n)` then `DATE` |
//! | `DATETIMEOFFSET(n)` | UTC `DATETIME2(n)` then an `i16` minute offset |
//! | `DATETIME` | `i32` days since 1900-01-01, `u32` 1/300 s ticks |
//! | `SMALLDATETIME` | `u16` days since 1900-01-01, `u16` minutes |

use bytes::BufMut;
use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Timelike,
};
use tdswire_types::TypeError;

use crate::error::{DecodeResult, ProtocolError};

/// `num_days_from_ce` of 1900-01-01.
const DAYS_CE_TO_1900: i32 = 693_596;

const NANOS_PER_SEC: u64 = 1_000_000_000;

const TICKS_PER_DAY: u32 = 300 * 86_400;

/// Byte width of a time-of-day value at `scale`.
#[must_use]
pub const fn time_len(scale: u8) -> usize {
    match scale {
        0..=2 => 3,
        3..=4 => 4,
        _ => 5,
    }
}

fn invalid(msg: impl Into<String>) -> ProtocolError {
    ProtocolError::Type(TypeError::InvalidDateTime(msg.into()))
}

fn le_uint(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .rev()
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

fn pow10(exp: u8) -> u64 {
    10u64.pow(u32::from(exp))
}

/// Decode a 3-byte DATE.
pub fn decode_date(bytes: &[u8]) -> DecodeResult<NaiveDate> {
    if bytes.len() != 3 {
        return Err(ProtocolError::InvalidValueLength {
            type_name: "date",
            length: bytes.len(),
        }
        .into());
    }
    let days = le_uint(bytes) as i32;
    NaiveDate::from_num_days_from_ce_opt(days + 1)
        .ok_or_else(|| invalid(format!("day {days} out of range")).into())
}

/// Encode a DATE.
pub fn encode_date(dst: &mut impl BufMut, date: NaiveDate) -> Result<(), ProtocolError> {
    let days = date.num_days_from_ce() - 1;
    if days < 0 {
        return Err(invalid(format!("{date} precedes 0001-01-01")));
    }
    let b = (days as u32).to_le_bytes();
    dst.put_slice(&b[..3]);
    Ok(())
}

/// Decode a TIME body of `time_len(scale)` bytes.
pub fn decode_time(bytes: &[u8], scale: u8) -> DecodeResult<NaiveTime> {
    if bytes.len() != time_len(scale) || scale > 7 {
        return Err(ProtocolError::InvalidValueLength {
            type_name: "time",
            length: bytes.len(),
        }
        .into());
    }
    let units = le_uint(bytes);
    let nanos = units * pow10(9 - scale);
    let secs = nanos / NANOS_PER_SEC;
    let frac = nanos % NANOS_PER_SEC;
    NaiveTime::from_num_seconds_from_midnight_opt(secs as u32, frac as u32)
        .ok_or_else(|| invalid(format!("{secs} seconds past midnight")).into())
}

/// Encode a TIME at `scale`, truncating sub-unit precision.
pub fn encode_time(dst: &mut impl BufMut, time: NaiveTime, scale: u8) {
    let nanos = u64::from(time.num_seconds_from_midnight()) * NANOS_PER_SEC
        + u64::from(time.nanosecond().min(999_999_999));
    let units = nanos / pow10(9 - scale.min(7));
    let b = units.to_le_bytes();
    dst.put_slice(&b[..time_len(scale)]);
}

/// Decode a DATETIME2 body.
pub fn decode_datetime2(bytes: &[u8], scale: u8) -> DecodeResult<NaiveDateTime> {
    let t = time_len(scale);
    if bytes.len() != t + 3 {
        return Err(ProtocolError::InvalidValueLength {
            type_name: "datetime2",
            length: bytes.len(),
        }
        .into());
    }
    let time = decode_time(&bytes[..t], scale)?;
    let date = decode_date(&bytes[t..])?;
    Ok(date.and_time(time))
}

/// Encode a DATETIME2.
pub fn encode_datetime2(
    dst: &mut impl BufMut,
    dt: NaiveDateTime,
    scale: u8,
) -> Result<(), ProtocolError> {
    encode_time(dst, dt.time(), scale);
    encode_date(dst, dt.date())
}

/// Decode a DATETIMEOFFSET body.
pub fn decode_datetimeoffset(bytes: &[u8], scale: u8) -> DecodeResult<DateTime<FixedOffset>> {
    let t = time_len(scale);
    if bytes.len() != t + 5 {
        return Err(ProtocolError::InvalidValueLength {
            type_name: "datetimeoffset",
            length: bytes.len(),
        }
        .into());
    }
    let utc = decode_datetime2(&bytes[..t + 3], scale)?;
    let minutes = i16::from_le_bytes([bytes[t + 3], bytes[t + 4]]);
    let offset = FixedOffset::east_opt(i32::from(minutes) * 60)
        .ok_or_else(|| invalid(format!("offset {minutes} minutes")))?;
    Ok(DateTime::from_naive_utc_and_offset(utc, offset))
}

/// Encode a DATETIMEOFFSET.
pub fn encode_datetimeoffset(
    dst: &mut impl BufMut,
    dt: DateTime<FixedOffset>,
    scale: u8,
) -> Result<(), ProtocolError> {
    encode_datetime2(dst, dt.naive_utc(), scale)?;
    dst.put_i16_le((dt.offset().local_minus_utc() / 60) as i16);
    Ok(())
}

fn date_from_1900(days: i32) -> DecodeResult<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(DAYS_CE_TO_1900 + days)
        .ok_or_else(|| invalid(format!("day {days} since 1900 out of range")).into())
}

/// Decode an 8-byte DATETIME.
pub fn decode_datetime(bytes: [u8; 8]) -> DecodeResult<NaiveDateTime> {
    let days = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let ticks = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if ticks >= TICKS_PER_DAY {
        return Err(invalid(format!("{ticks} ticks exceed one day")).into());
    }
    // 1/300 s rounded to the nearest millisecond.
    let millis = (u64::from(ticks) * 10 + 1) / 3;
    let date = date_from_1900(days)?;
    Ok(date.and_time(NaiveTime::MIN) + Duration::milliseconds(millis as i64))
}

/// Encode a DATETIME, rounding to the nearest 1/300 s.
pub fn encode_datetime(dst: &mut impl BufMut, dt: NaiveDateTime) -> Result<(), ProtocolError> {
    let mut days = dt.date().num_days_from_ce() - DAYS_CE_TO_1900;
    let nanos = u64::from(dt.time().num_seconds_from_midnight()) * NANOS_PER_SEC
        + u64::from(dt.time().nanosecond().min(999_999_999));
    let mut ticks = ((nanos * 3 + 5_000_000) / 10_000_000) as u32;
    if ticks >= TICKS_PER_DAY {
        ticks -= TICKS_PER_DAY;
        days += 1;
    }
    dst.put_i32_le(days);
    dst.put_u32_le(ticks);
    Ok(())
}

/// Decode a 4-byte SMALLDATETIME.
pub fn decode_smalldatetime(bytes: [u8; 4]) -> DecodeResult<NaiveDateTime> {
    let days = u16::from_le_bytes([bytes[0], bytes[1]]);
    let minutes = u16::from_le_bytes([bytes[2], bytes[3]]);
    if minutes >= 1440 {
        return Err(invalid(format!("{minutes} minutes exceed one day")).into());
    }
    let date = date_from_1900(i32::from(days))?;
    Ok(date.and_time(NaiveTime::MIN) + Duration::minutes(i64::from(minutes)))
}

/// Encode a SMALLDATETIME, rounding to the nearest minute.
pub fn encode_smalldatetime(dst: &mut impl BufMut, dt: NaiveDateTime) -> Result<(), ProtocolError> {
    let rounded = dt + Duration::seconds(30);
    let days = rounded.date().num_days_from_ce() - DAYS_CE_TO_1900;
    let days = u16::try_from(days).map_err(|_| invalid(format!("{dt} outside smalldatetime range")))?;
    let minutes = rounded.time().num_seconds_from_midnight() / 60;
    dst.put_u16_le(days);
    dst.put_u16_le(minutes as u16);
    Ok(())
}
