/// MySQL Binary Protocol Value Types
use std::fmt;

use crate::constant::ColumnType;
use crate::error::{Error, Result};
use crate::protocol::primitive::*;
use zerocopy::byteorder::little_endian::{U16 as U16LE, U32 as U32LE};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

const MICROS_PER_SECOND: u64 = 1_000_000;
const MICROS_PER_DAY: u64 = 86_400 * MICROS_PER_SECOND;

/// A typed value of the binary protocol.
///
/// Prepared-statement parameters decode into it, and text resultset cells are parsed into it
/// before being re-encoded for `COM_STMT_EXECUTE` responses.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    /// TINYINT, SMALLINT, MEDIUMINT, INT, BIGINT, YEAR
    Int(i64),
    /// The unsigned variants of the integer types
    UInt(u64),
    Float(f32),
    Double(f64),
    /// String, BLOB, DECIMAL, JSON, ENUM, SET, BIT, GEOMETRY
    Bytes(Vec<u8>),
    Date(Date),
    DateTime(DateTime),
    Time(Time),
}

impl Value {
    /// Parse a single binary protocol value based on column type and signedness
    ///
    /// Returns the parsed value and the remaining bytes
    pub fn read_binary(column_type: ColumnType, unsigned: bool, data: &[u8]) -> Result<(Self, &[u8])> {
        match column_type {
            ColumnType::MYSQL_TYPE_NULL => Ok((Value::Null, data)),

            ColumnType::MYSQL_TYPE_TINY | ColumnType::MYSQL_TYPE_BOOL => {
                let (val, rest) = read_int_1(data)?;
                let value = if unsigned {
                    Value::UInt(val as u64)
                } else {
                    Value::Int(val as i8 as i64)
                };
                Ok((value, rest))
            }

            ColumnType::MYSQL_TYPE_SHORT | ColumnType::MYSQL_TYPE_YEAR => {
                let (val, rest) = read_int_2(data)?;
                let value = if unsigned {
                    Value::UInt(val as u64)
                } else {
                    Value::Int(val as i16 as i64)
                };
                Ok((value, rest))
            }

            ColumnType::MYSQL_TYPE_INT24 | ColumnType::MYSQL_TYPE_LONG => {
                let (val, rest) = read_int_4(data)?;
                let value = if unsigned {
                    Value::UInt(val as u64)
                } else {
                    Value::Int(val as i32 as i64)
                };
                Ok((value, rest))
            }

            ColumnType::MYSQL_TYPE_LONGLONG => {
                let (val, rest) = read_int_8(data)?;
                let value = if unsigned {
                    Value::UInt(val)
                } else {
                    Value::Int(val as i64)
                };
                Ok((value, rest))
            }

            ColumnType::MYSQL_TYPE_FLOAT => {
                let (val, rest) = read_float_4(data)?;
                Ok((Value::Float(val), rest))
            }

            ColumnType::MYSQL_TYPE_DOUBLE => {
                let (val, rest) = read_float_8(data)?;
                Ok((Value::Double(val), rest))
            }

            ColumnType::MYSQL_TYPE_DATE | ColumnType::MYSQL_TYPE_NEWDATE => {
                let (datetime, rest) = DateTime::read_binary(data)?;
                Ok((Value::Date(datetime.date()), rest))
            }

            ColumnType::MYSQL_TYPE_DATETIME
            | ColumnType::MYSQL_TYPE_TIMESTAMP
            | ColumnType::MYSQL_TYPE_TIMESTAMP2
            | ColumnType::MYSQL_TYPE_DATETIME2 => {
                let (datetime, rest) = DateTime::read_binary(data)?;
                Ok((Value::DateTime(datetime), rest))
            }

            ColumnType::MYSQL_TYPE_TIME | ColumnType::MYSQL_TYPE_TIME2 => {
                let (time, rest) = Time::read_binary(data)?;
                Ok((Value::Time(time), rest))
            }

            ty if ty.is_string_family() => {
                let (bytes, rest) = read_string_lenenc(data)?;
                Ok((Value::Bytes(bytes.to_vec()), rest))
            }

            ty => Err(Error::UnsupportedFieldType(ty as u8)),
        }
    }

    /// Encode this value as a binary protocol value of `column_type`
    pub fn write_binary(&self, out: &mut Vec<u8>, column_type: ColumnType) -> Result<()> {
        let invalid = || Error::InvalidValue {
            column_type,
            value: self.to_string(),
        };

        match column_type {
            ColumnType::MYSQL_TYPE_NULL => Ok(()),

            ColumnType::MYSQL_TYPE_TINY | ColumnType::MYSQL_TYPE_BOOL => {
                let byte = match *self {
                    Value::Int(v) => i8::try_from(v).map_err(|_| invalid())? as u8,
                    Value::UInt(v) => u8::try_from(v).map_err(|_| invalid())?,
                    _ => return Err(invalid()),
                };
                write_int_1(out, byte);
                Ok(())
            }

            ColumnType::MYSQL_TYPE_SHORT | ColumnType::MYSQL_TYPE_YEAR => {
                let v = match *self {
                    Value::Int(v) => i16::try_from(v).map_err(|_| invalid())? as u16,
                    Value::UInt(v) => u16::try_from(v).map_err(|_| invalid())?,
                    _ => return Err(invalid()),
                };
                write_int_2(out, v);
                Ok(())
            }

            ColumnType::MYSQL_TYPE_INT24 | ColumnType::MYSQL_TYPE_LONG => {
                let v = match *self {
                    Value::Int(v) => i32::try_from(v).map_err(|_| invalid())? as u32,
                    Value::UInt(v) => u32::try_from(v).map_err(|_| invalid())?,
                    _ => return Err(invalid()),
                };
                write_int_4(out, v);
                Ok(())
            }

            ColumnType::MYSQL_TYPE_LONGLONG => {
                let v = match *self {
                    Value::Int(v) => v as u64,
                    Value::UInt(v) => v,
                    _ => return Err(invalid()),
                };
                write_int_8(out, v);
                Ok(())
            }

            ColumnType::MYSQL_TYPE_FLOAT => {
                let v = match *self {
                    Value::Float(v) => v,
                    Value::Double(v) => v as f32,
                    Value::Int(v) => v as f32,
                    Value::UInt(v) => v as f32,
                    _ => return Err(invalid()),
                };
                write_float_4(out, v);
                Ok(())
            }

            ColumnType::MYSQL_TYPE_DOUBLE => {
                let v = match *self {
                    Value::Float(v) => v as f64,
                    Value::Double(v) => v,
                    Value::Int(v) => v as f64,
                    Value::UInt(v) => v as f64,
                    _ => return Err(invalid()),
                };
                write_float_8(out, v);
                Ok(())
            }

            ColumnType::MYSQL_TYPE_DATE | ColumnType::MYSQL_TYPE_NEWDATE => {
                match self {
                    Value::Date(date) => date.write_binary(out),
                    Value::DateTime(datetime) => datetime.date().write_binary(out),
                    _ => return Err(invalid()),
                }
                Ok(())
            }

            ColumnType::MYSQL_TYPE_DATETIME
            | ColumnType::MYSQL_TYPE_TIMESTAMP
            | ColumnType::MYSQL_TYPE_TIMESTAMP2
            | ColumnType::MYSQL_TYPE_DATETIME2 => {
                match self {
                    Value::DateTime(datetime) => datetime.write_binary(out),
                    Value::Date(date) => DateTime::from(*date).write_binary(out),
                    _ => return Err(invalid()),
                }
                Ok(())
            }

            ColumnType::MYSQL_TYPE_TIME | ColumnType::MYSQL_TYPE_TIME2 => match self {
                Value::Time(time) => {
                    time.write_binary(out);
                    Ok(())
                }
                _ => Err(invalid()),
            },

            ty if ty.is_string_family() => {
                match self {
                    Value::Bytes(bytes) => write_bytes_lenenc(out, bytes),
                    Value::Null => return Err(invalid()),
                    other => write_string_lenenc(out, &other.to_string()),
                }
                Ok(())
            }

            ty => Err(Error::UnsupportedFieldType(ty as u8)),
        }
    }

    /// Parse a text protocol cell into the value of a `column_type` column
    pub fn from_text(column_type: ColumnType, unsigned: bool, text: &[u8]) -> Result<Self> {
        let invalid = || Error::InvalidValue {
            column_type,
            value: String::from_utf8_lossy(text).into_owned(),
        };

        match column_type {
            ColumnType::MYSQL_TYPE_NULL => Ok(Value::Null),

            ColumnType::MYSQL_TYPE_TINY
            | ColumnType::MYSQL_TYPE_BOOL
            | ColumnType::MYSQL_TYPE_SHORT
            | ColumnType::MYSQL_TYPE_YEAR
            | ColumnType::MYSQL_TYPE_INT24
            | ColumnType::MYSQL_TYPE_LONG
            | ColumnType::MYSQL_TYPE_LONGLONG => {
                let text = to_str(text).map_err(|_| invalid())?.trim();
                if unsigned {
                    text.parse().map(Value::UInt).map_err(|_| invalid())
                } else {
                    text.parse().map(Value::Int).map_err(|_| invalid())
                }
            }

            ColumnType::MYSQL_TYPE_FLOAT => {
                let text = to_str(text).map_err(|_| invalid())?.trim();
                text.parse().map(Value::Float).map_err(|_| invalid())
            }

            ColumnType::MYSQL_TYPE_DOUBLE => {
                let text = to_str(text).map_err(|_| invalid())?.trim();
                text.parse().map(Value::Double).map_err(|_| invalid())
            }

            ColumnType::MYSQL_TYPE_DATE | ColumnType::MYSQL_TYPE_NEWDATE => {
                let text = to_str(text).map_err(|_| invalid())?;
                DateTime::parse_text(text)
                    .map(|datetime| Value::Date(datetime.date()))
                    .ok_or_else(invalid)
            }

            ColumnType::MYSQL_TYPE_DATETIME
            | ColumnType::MYSQL_TYPE_TIMESTAMP
            | ColumnType::MYSQL_TYPE_TIMESTAMP2
            | ColumnType::MYSQL_TYPE_DATETIME2 => {
                let text = to_str(text).map_err(|_| invalid())?;
                DateTime::parse_text(text)
                    .map(Value::DateTime)
                    .ok_or_else(invalid)
            }

            ColumnType::MYSQL_TYPE_TIME | ColumnType::MYSQL_TYPE_TIME2 => {
                let text = to_str(text).map_err(|_| invalid())?;
                Time::parse_text(text).map(Value::Time).ok_or_else(invalid)
            }

            ty if ty.is_string_family() => Ok(Value::Bytes(text.to_vec())),

            ty => Err(Error::UnsupportedFieldType(ty as u8)),
        }
    }

    /// The column type this value is sent as when no other type is imposed
    pub fn natural_type(&self) -> (ColumnType, bool) {
        match self {
            Value::Null => (ColumnType::MYSQL_TYPE_NULL, false),
            Value::Int(_) => (ColumnType::MYSQL_TYPE_LONGLONG, false),
            Value::UInt(_) => (ColumnType::MYSQL_TYPE_LONGLONG, true),
            Value::Float(_) => (ColumnType::MYSQL_TYPE_FLOAT, false),
            Value::Double(_) => (ColumnType::MYSQL_TYPE_DOUBLE, false),
            Value::Bytes(_) => (ColumnType::MYSQL_TYPE_VAR_STRING, false),
            Value::Date(_) => (ColumnType::MYSQL_TYPE_DATE, false),
            Value::DateTime(_) => (ColumnType::MYSQL_TYPE_DATETIME, false),
            Value::Time(_) => (ColumnType::MYSQL_TYPE_TIME, false),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Render as an SQL literal, quoting and escaping strings and temporal values.
    ///
    /// Bytes that are not valid UTF-8 become a hex literal `X'..'`, so binary data survives intact.
    pub fn to_sql_literal(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Int(_) | Value::UInt(_) | Value::Float(_) | Value::Double(_) => self.to_string(),
            Value::Bytes(bytes) => match simdutf8::basic::from_utf8(bytes) {
                Ok(text) => quote(text),
                Err(_) => format!("X'{}'", hex::encode_upper(bytes)),
            },
            Value::Date(_) | Value::DateTime(_) | Value::Time(_) => quote(&self.to_string()),
        }
    }
}

fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('\'');
    for c in text.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\0' => out.push_str("\\0"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\x1a' => out.push_str("\\Z"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Int(v) => write!(f, "{v}"),
            Value::UInt(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Bytes(v) => f.write_str(&String::from_utf8_lossy(v)),
            Value::Date(v) => v.fmt(f),
            Value::DateTime(v) => v.fmt(f),
            Value::Time(v) => v.fmt(f),
        }
    }
}

// ============================================================================
// Temporal Types
// ============================================================================

/// TIMESTAMP - 4 bytes (DATE/DATETIME/TIMESTAMP with date only)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, IntoBytes)]
pub struct Timestamp4 {
    pub year: U16LE,
    pub month: u8,
    pub day: u8,
}

/// TIMESTAMP - 7 bytes (DATE/DATETIME/TIMESTAMP without microseconds)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, IntoBytes)]
pub struct Timestamp7 {
    pub year: U16LE,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

/// TIMESTAMP - 11 bytes (DATE/DATETIME/TIMESTAMP with microseconds)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, IntoBytes)]
pub struct Timestamp11 {
    pub year: U16LE,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub microsecond: U32LE,
}

/// TIME - 8 bytes
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, IntoBytes)]
pub struct Time8 {
    pub is_negative: u8,
    pub days: U32LE,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

/// TIME - 12 bytes: is_negative (1), days (4 LE), hour (1), minute (1), second (1), microsecond (4 LE)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, IntoBytes)]
pub struct Time12 {
    pub is_negative: u8,
    pub days: U32LE,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub microsecond: U32LE,
}

fn cast<T: FromBytes + KnownLayout + Immutable>(data: &[u8]) -> Result<(&T, &[u8])> {
    T::ref_from_prefix(data).map_err(|_| Error::UnexpectedEof)
}

/// DATE value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Date {
    pub year: u16,
    pub month: u8,
    pub day: u8,
}

impl Date {
    pub fn new(year: u16, month: u8, day: u8) -> Self {
        Self { year, month, day }
    }

    /// DATE is always sent with length 4
    pub fn write_binary(&self, out: &mut Vec<u8>) {
        write_int_1(out, 4);
        let ts = Timestamp4 {
            year: U16LE::new(self.year),
            month: self.month,
            day: self.day,
        };
        out.extend_from_slice(ts.as_bytes());
    }
}

impl fmt::Display for Date {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

/// DATETIME / TIMESTAMP value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub microsecond: u32,
}

impl From<Date> for DateTime {
    fn from(date: Date) -> Self {
        Self {
            year: date.year,
            month: date.month,
            day: date.day,
            ..Self::default()
        }
    }
}

impl DateTime {
    pub fn date(&self) -> Date {
        Date::new(self.year, self.month, self.day)
    }

    /// Decode a length-prefixed temporal record; accepts lengths 0, 4, 7 and 11
    pub fn read_binary(data: &[u8]) -> Result<(Self, &[u8])> {
        let (len, rest) = read_int_1(data)?;
        match len {
            0 => Ok((Self::default(), rest)),
            4 => {
                let (ts, rest) = cast::<Timestamp4>(rest)?;
                Ok((
                    Self {
                        year: ts.year.get(),
                        month: ts.month,
                        day: ts.day,
                        ..Self::default()
                    },
                    rest,
                ))
            }
            7 => {
                let (ts, rest) = cast::<Timestamp7>(rest)?;
                Ok((
                    Self {
                        year: ts.year.get(),
                        month: ts.month,
                        day: ts.day,
                        hour: ts.hour,
                        minute: ts.minute,
                        second: ts.second,
                        microsecond: 0,
                    },
                    rest,
                ))
            }
            11 => {
                let (ts, rest) = cast::<Timestamp11>(rest)?;
                Ok((
                    Self {
                        year: ts.year.get(),
                        month: ts.month,
                        day: ts.day,
                        hour: ts.hour,
                        minute: ts.minute,
                        second: ts.second,
                        microsecond: ts.microsecond.get(),
                    },
                    rest,
                ))
            }
            _ => Err(Error::InvalidPacket),
        }
    }

    /// Encode with the shortest length that keeps every non-zero field
    pub fn write_binary(&self, out: &mut Vec<u8>) {
        let has_time = self.hour != 0 || self.minute != 0 || self.second != 0;
        if self.microsecond != 0 {
            write_int_1(out, 11);
            let ts = Timestamp11 {
                year: U16LE::new(self.year),
                month: self.month,
                day: self.day,
                hour: self.hour,
                minute: self.minute,
                second: self.second,
                microsecond: U32LE::new(self.microsecond),
            };
            out.extend_from_slice(ts.as_bytes());
        } else if has_time {
            write_int_1(out, 7);
            let ts = Timestamp7 {
                year: U16LE::new(self.year),
                month: self.month,
                day: self.day,
                hour: self.hour,
                minute: self.minute,
                second: self.second,
            };
            out.extend_from_slice(ts.as_bytes());
        } else if self.year != 0 || self.month != 0 || self.day != 0 {
            self.date().write_binary(out);
        } else {
            write_int_1(out, 0);
        }
    }

    /// Parse `YYYY-MM-DD[( |T)HH:MM:SS[.ffffff]]`
    pub fn parse_text(text: &str) -> Option<Self> {
        let text = text.trim();
        let (date, time) = match text.split_once(|c| c == ' ' || c == 'T') {
            Some((date, time)) => (date, Some(time)),
            None => (text, None),
        };

        let mut parts = date.split('-');
        let year = parts.next()?.parse().ok()?;
        let month: u8 = parts.next()?.parse().ok()?;
        let day: u8 = parts.next()?.parse().ok()?;
        if parts.next().is_some() || month > 12 || day > 31 {
            return None;
        }

        let mut datetime = Self {
            year,
            month,
            day,
            ..Self::default()
        };
        if let Some(time) = time {
            let (hms, frac) = split_fraction(time)?;
            let mut parts = hms.split(':');
            datetime.hour = parts.next()?.parse().ok()?;
            datetime.minute = parts.next()?.parse().ok()?;
            datetime.second = parts.next()?.parse().ok()?;
            if parts.next().is_some()
                || datetime.hour > 23
                || datetime.minute > 59
                || datetime.second > 59
            {
                return None;
            }
            datetime.microsecond = frac;
        }
        Some(datetime)
    }
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:02}:{:02}:{:02}",
            self.date(),
            self.hour,
            self.minute,
            self.second
        )?;
        if self.microsecond != 0 {
            write!(f, ".{:06}", self.microsecond)?;
        }
        Ok(())
    }
}

/// Split `HH:MM:SS[.ffffff]`, returning the fraction scaled to microseconds
fn split_fraction(text: &str) -> Option<(&str, u32)> {
    match text.split_once('.') {
        None => Some((text, 0)),
        Some((hms, frac)) => {
            if frac.is_empty() || frac.len() > 6 || !frac.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let value: u32 = frac.parse().ok()?;
            Some((hms, value * 10u32.pow(6 - frac.len() as u32)))
        }
    }
}

/// TIME value: a signed duration in microseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Time {
    micros: i64,
}

/// Sign and magnitude fields of a TIME value as they appear on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeParts {
    pub negative: bool,
    pub days: u32,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub microsecond: u32,
}

impl Time {
    pub fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    pub fn as_micros(&self) -> i64 {
        self.micros
    }

    /// Fails when a field is out of range or the duration does not fit in `i64` microseconds
    pub fn from_parts(parts: TimeParts) -> Result<Self> {
        if parts.hour > 23
            || parts.minute > 59
            || parts.second > 59
            || u64::from(parts.microsecond) >= MICROS_PER_SECOND
        {
            return Err(invalid_time(&parts));
        }
        let seconds = u64::from(parts.hour) * 3_600
            + u64::from(parts.minute) * 60
            + u64::from(parts.second);
        let magnitude = u64::from(parts.days)
            .checked_mul(MICROS_PER_DAY)
            .and_then(|micros| micros.checked_add(seconds * MICROS_PER_SECOND))
            .and_then(|micros| micros.checked_add(u64::from(parts.microsecond)))
            .and_then(|micros| i64::try_from(micros).ok())
            .ok_or_else(|| invalid_time(&parts))?;
        Ok(Self {
            micros: if parts.negative { -magnitude } else { magnitude },
        })
    }

    /// Negate first, then split the magnitude into days / h / m / s / us
    pub fn to_parts(&self) -> TimeParts {
        let magnitude = self.micros.unsigned_abs();
        let days = magnitude / MICROS_PER_DAY;
        let rem = magnitude % MICROS_PER_DAY;
        let seconds = rem / MICROS_PER_SECOND;
        TimeParts {
            negative: self.micros < 0,
            days: days as u32,
            hour: (seconds / 3_600) as u8,
            minute: (seconds / 60 % 60) as u8,
            second: (seconds % 60) as u8,
            microsecond: (rem % MICROS_PER_SECOND) as u32,
        }
    }

    /// Decode a length-prefixed TIME record; accepts lengths 0, 8 and 12
    pub fn read_binary(data: &[u8]) -> Result<(Self, &[u8])> {
        let (len, rest) = read_int_1(data)?;
        let (parts, rest) = match len {
            0 => return Ok((Self::default(), rest)),
            8 => {
                let (t, rest) = cast::<Time8>(rest)?;
                let parts = TimeParts {
                    negative: t.is_negative != 0,
                    days: t.days.get(),
                    hour: t.hour,
                    minute: t.minute,
                    second: t.second,
                    microsecond: 0,
                };
                (parts, rest)
            }
            12 => {
                let (t, rest) = cast::<Time12>(rest)?;
                let parts = TimeParts {
                    negative: t.is_negative != 0,
                    days: t.days.get(),
                    hour: t.hour,
                    minute: t.minute,
                    second: t.second,
                    microsecond: t.microsecond.get(),
                };
                (parts, rest)
            }
            _ => return Err(Error::InvalidPacket),
        };
        Ok((Self::from_parts(parts)?, rest))
    }

    pub fn write_binary(&self, out: &mut Vec<u8>) {
        if self.micros == 0 {
            write_int_1(out, 0);
            return;
        }
        let parts = self.to_parts();
        if parts.microsecond == 0 {
            write_int_1(out, 8);
            let t = Time8 {
                is_negative: parts.negative as u8,
                days: U32LE::new(parts.days),
                hour: parts.hour,
                minute: parts.minute,
                second: parts.second,
            };
            out.extend_from_slice(t.as_bytes());
        } else {
            write_int_1(out, 12);
            let t = Time12 {
                is_negative: parts.negative as u8,
                days: U32LE::new(parts.days),
                hour: parts.hour,
                minute: parts.minute,
                second: parts.second,
                microsecond: U32LE::new(parts.microsecond),
            };
            out.extend_from_slice(t.as_bytes());
        }
    }

    /// Parse `[-][D ]HHH:MM:SS[.ffffff]`; hours may exceed 23
    pub fn parse_text(text: &str) -> Option<Self> {
        let text = text.trim();
        let (negative, text) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text),
        };
        let (days, text) = match text.split_once(' ') {
            Some((days, rest)) => (days.parse::<u64>().ok()?, rest),
            None => (0, text),
        };
        let (hms, frac) = split_fraction(text)?;
        let mut parts = hms.split(':');
        let hours: u64 = parts.next()?.parse().ok()?;
        let minutes: u64 = parts.next()?.parse().ok()?;
        let seconds: u64 = parts.next()?.parse().ok()?;
        if parts.next().is_some() || minutes > 59 || seconds > 59 {
            return None;
        }
        let total_seconds = days
            .checked_mul(24)?
            .checked_add(hours)?
            .checked_mul(3_600)?
            .checked_add(minutes * 60 + seconds)?;
        let magnitude = total_seconds
            .checked_mul(MICROS_PER_SECOND)?
            .checked_add(frac as u64)?;
        let magnitude = i64::try_from(magnitude).ok()?;
        Some(Self {
            micros: if negative { -magnitude } else { magnitude },
        })
    }
}

fn invalid_time(parts: &TimeParts) -> Error {
    Error::InvalidValue {
        column_type: ColumnType::MYSQL_TYPE_TIME,
        value: format!(
            "{}{} {}:{}:{}.{}",
            if parts.negative { "-" } else { "" },
            parts.days,
            parts.hour,
            parts.minute,
            parts.second,
            parts.microsecond
        ),
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let magnitude = self.micros.unsigned_abs();
        let seconds = magnitude / MICROS_PER_SECOND;
        if self.micros < 0 {
            f.write_str("-")?;
        }
        write!(
            f,
            "{:02}:{:02}:{:02}",
            seconds / 3_600,
            seconds / 60 % 60,
            seconds % 60
        )?;
        let micros = magnitude % MICROS_PER_SECOND;
        if micros != 0 {
            write!(f, ".{micros:06}")?;
        }
        Ok(())
    }
}

// ============================================================================
// NULL Bitmap
// ============================================================================

/// NULL bitmap for binary protocol
///
/// In MySQL binary protocol, NULL values are indicated by a bitmap where each bit
/// represents whether a column is NULL (1 = NULL, 0 = not NULL).
///
/// For result sets (COM_STMT_EXECUTE response), the bitmap has an offset of 2 bits.
/// For prepared statement parameters, the offset is 0 bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NullBitmap {
    num_fields: usize,
    offset: usize,
    bytes: Vec<u8>,
}

impl NullBitmap {
    pub const RESULT_SET_OFFSET: usize = 2;
    pub const PARAMETER_OFFSET: usize = 0;

    /// Byte length for `num_fields` fields starting at bit `offset`, never less than one
    pub fn byte_len(num_fields: usize, offset: usize) -> usize {
        (num_fields + offset).div_ceil(8).max(1)
    }

    /// All-clear bitmap
    pub fn new(num_fields: usize, offset: usize) -> Self {
        Self {
            num_fields,
            offset,
            bytes: vec![0; Self::byte_len(num_fields, offset)],
        }
    }

    pub fn for_result_set(num_fields: usize) -> Self {
        Self::new(num_fields, Self::RESULT_SET_OFFSET)
    }

    pub fn for_parameters(num_fields: usize) -> Self {
        Self::new(num_fields, Self::PARAMETER_OFFSET)
    }

    /// Read a bitmap from the front of `data`
    pub fn read(data: &[u8], num_fields: usize, offset: usize) -> Result<(Self, &[u8])> {
        let (bytes, rest) = read_string_fix(data, Self::byte_len(num_fields, offset))?;
        Ok((
            Self {
                num_fields,
                offset,
                bytes: bytes.to_vec(),
            },
            rest,
        ))
    }

    pub fn num_fields(&self) -> usize {
        self.num_fields
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Mark field `idx` as NULL or not; indexes past `num_fields` are ignored
    pub fn set_null(&mut self, idx: usize, is_null: bool) {
        if idx >= self.num_fields {
            return;
        }
        let bit_pos = idx + self.offset;
        let mask = 1 << (bit_pos & 7);
        if is_null {
            self.bytes[bit_pos >> 3] |= mask;
        } else {
            self.bytes[bit_pos >> 3] &= !mask;
        }
    }

    /// Check if the column at the given index is NULL
    pub fn is_null(&self, idx: usize) -> bool {
        if idx >= self.num_fields {
            return false;
        }
        let bit_pos = idx + self.offset;
        (self.bytes[bit_pos >> 3] & (1 << (bit_pos & 7))) != 0
    }

    /// Get the raw bitmap bytes
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

// ============================================================================
// Parameters
// ============================================================================

/// A value bound to a prepared-statement placeholder, kept in its wire encoding
/// and decoded on demand
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub column_type: ColumnType,
    pub unsigned: bool,
    /// Binary protocol encoding of the value, `None` for NULL
    pub raw: Option<Vec<u8>>,
}

impl Parameter {
    pub fn null(column_type: ColumnType) -> Self {
        Self {
            column_type,
            unsigned: false,
            raw: None,
        }
    }

    /// Parameter whose data arrived through COM_STMT_SEND_LONG_DATA
    pub fn long_data(column_type: ColumnType, data: &[u8]) -> Self {
        let column_type = if column_type.is_string_family() {
            column_type
        } else {
            ColumnType::MYSQL_TYPE_BLOB
        };
        let mut raw = Vec::with_capacity(data.len() + 9);
        write_bytes_lenenc(&mut raw, data);
        Self {
            column_type,
            unsigned: false,
            raw: Some(raw),
        }
    }

    /// Encode a value under its natural column type
    pub fn from_value(value: &Value) -> Result<Self> {
        let (column_type, unsigned) = value.natural_type();
        if value.is_null() {
            return Ok(Self::null(column_type));
        }
        let mut raw = Vec::new();
        value.write_binary(&mut raw, column_type)?;
        Ok(Self {
            column_type,
            unsigned,
            raw: Some(raw),
        })
    }

    /// Take one parameter value off the front of a COM_STMT_EXECUTE value block
    pub fn read(column_type: ColumnType, unsigned: bool, data: &[u8]) -> Result<(Self, &[u8])> {
        let (_, rest) = Value::read_binary(column_type, unsigned, data)?;
        let consumed = data.len() - rest.len();
        Ok((
            Self {
                column_type,
                unsigned,
                raw: Some(data[..consumed].to_vec()),
            },
            rest,
        ))
    }

    pub fn value(&self) -> Result<Value> {
        match &self.raw {
            None => Ok(Value::Null),
            Some(raw) => {
                let (value, _) = Value::read_binary(self.column_type, self.unsigned, raw)?;
                Ok(value)
            }
        }
    }
}
