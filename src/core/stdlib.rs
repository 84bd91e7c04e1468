//! # Standard Library Types
//!
//! Native stand-ins for the Python standard-library values that show up in
//! pickles: `datetime` values and their time zones, `decimal.Decimal`,
//! `complex` and `array.array`.
//!
//! Dates and times map onto [`chrono`]. Decoding accepts the packed byte
//! state CPython writes as well as the positional integer form. Encoding
//! always writes the integer form, which Python 2 and 3 both read.
//!
//! | Python                         | Native                     |
//! |--------------------------------|----------------------------|
//! | `datetime.datetime`            | [`PyDateTime`]             |
//! | `datetime.date`                | [`NaiveDate`]              |
//! | `datetime.time`                | [`NaiveTime`]              |
//! | `datetime.timedelta`           | [`TimeDelta`]              |
//! | `datetime.timezone`, `pytz.*`, `dateutil.tz.*` | [`PyTimeZone`] |
//! | `decimal.Decimal`              | [`PyDecimal`]              |
//! | `complex`                      | [`PyComplex`]              |
//! | `array.array`                  | [`PyArray`]                |

use crate::core::registry::{Registry, RegistryBuilder};
use crate::core::value::{ClassDict, ClassRef, NativeValue, Value};
use crate::error::{ProtocolError, Result};
use chrono::{
    DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Timelike,
};
use num_bigint::BigInt;
use num_traits::ToPrimitive;
use std::fmt;
use std::str::FromStr;

type FactoryResult = std::result::Result<Value, String>;

const MICROS_PER_SECOND: i64 = 1_000_000;
const MICROS_PER_DAY: i64 = 86_400 * MICROS_PER_SECOND;

/// Typecodes `array.array` accepts.
pub const ARRAY_TYPECODES: &str = "bBuwhHiIlLqQfd";

pub(crate) fn install(builder: &mut RegistryBuilder) {
    builder.add_factory("datetime.datetime", datetime);
    builder.add_factory("datetime.date", date);
    builder.add_factory("datetime.time", time);
    builder.add_factory("datetime.timedelta", timedelta);
    builder.add_factory("datetime.timezone", fixed_timezone);
    builder.add_factory("pytz._UTC", utc);
    builder.add_factory("pytz._p", named_timezone);
    builder.add_factory("pytz.timezone", named_timezone);
    builder.add_factory("dateutil.tz.tzutc", utc);
    builder.add_factory("dateutil.tz.tz.tzutc", utc);
    builder.add_factory("dateutil.tz.tzfile", zoneinfo_file);
    builder.add_factory("dateutil.tz.tz.tzfile", zoneinfo_file);
    builder.add_factory("dateutil.zoneinfo.gettz", named_timezone);
    builder.add_factory("zoneinfo.ZoneInfo._unpickle", named_timezone);
    builder.add_factory("decimal.Decimal", decimal);
    builder.add_factory("builtins.complex", complex);
    builder.add_factory("__builtin__.complex", complex);
    builder.add_factory("array.array", array);
    builder.add_factory("array._array_reconstructor", array_reconstructor);

    builder.add_encoder(|dt: &PyDateTime| Ok(dt.to_value()));
    builder.add_encoder(|dt: &NaiveDateTime| Ok(PyDateTime::naive(*dt).to_value()));
    builder.add_encoder(|dt: &DateTime<FixedOffset>| Ok(PyDateTime::from(*dt).to_value()));
    builder.add_encoder(|d: &NaiveDate| Ok(date_value(d)));
    builder.add_encoder(|t: &NaiveTime| Ok(time_value(t)));
    builder.add_encoder::<TimeDelta, _>(timedelta_value);
    builder.add_encoder(|tz: &PyTimeZone| Ok(tz.to_value()));
    builder.add_encoder(|d: &PyDecimal| Ok(record("decimal.Decimal", vec![Value::from(d.as_str())])));
    builder.add_encoder(|c: &PyComplex| {
        Ok(record("builtins.complex", vec![Value::Float(c.real), Value::Float(c.imag)]))
    });
    builder.add_encoder(|a: &PyArray| Ok(a.to_value()));
}

fn record(class: &str, args: Vec<Value>) -> Value {
    Value::object(ClassDict::with_args(class, args))
}

// ============================================================================
// Date and time
// ============================================================================

/// A `datetime.datetime`: wall-clock time plus an optional zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PyDateTime {
    pub local: NaiveDateTime,
    pub tzinfo: Option<PyTimeZone>,
}

impl PyDateTime {
    pub fn naive(local: NaiveDateTime) -> Self {
        Self { local, tzinfo: None }
    }

    pub fn with_tzinfo(local: NaiveDateTime, tzinfo: PyTimeZone) -> Self {
        Self {
            local,
            tzinfo: Some(tzinfo),
        }
    }

    /// The absolute instant, when the zone has a fixed offset.
    ///
    /// Named zones need a zone database to resolve and yield `None`.
    pub fn to_fixed(&self) -> Option<DateTime<FixedOffset>> {
        let offset = self.tzinfo.as_ref()?.fixed_offset()?;
        self.local.and_local_timezone(offset).single()
    }

    /// `YYYY-MM-DDTHH:MM:SS[.ffffff][+HH:MM]`, as Python's `isoformat`.
    pub fn isoformat(&self) -> String {
        let mut text = format!(
            "{}T{}",
            iso_date(&self.local.date()),
            iso_time(&self.local.time())
        );
        if let Some(offset) = self.tzinfo.as_ref().and_then(PyTimeZone::fixed_offset) {
            text.push_str(&iso_offset(offset));
        }
        text
    }

    fn to_value(&self) -> Value {
        let (date, time) = (self.local.date(), self.local.time());
        let mut args = vec![
            Value::from(date.year()),
            Value::Int(i64::from(date.month())),
            Value::Int(i64::from(date.day())),
            Value::Int(i64::from(time.hour())),
            Value::Int(i64::from(time.minute())),
            Value::Int(i64::from(time.second())),
            Value::Int(i64::from(micros_of(&time))),
        ];
        if let Some(tz) = &self.tzinfo {
            args.push(Value::native(tz.clone()));
        }
        record("datetime.datetime", args)
    }
}

impl From<DateTime<FixedOffset>> for PyDateTime {
    fn from(dt: DateTime<FixedOffset>) -> Self {
        Self::with_tzinfo(dt.naive_local(), PyTimeZone::Fixed(*dt.offset()))
    }
}

impl fmt::Display for PyDateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.isoformat())
    }
}

/// A `tzinfo` carried by a datetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PyTimeZone {
    Utc,
    Fixed(FixedOffset),
    /// IANA zone name, e.g. `Europe/Amsterdam`.
    Named(String),
}

impl PyTimeZone {
    pub fn fixed_offset(&self) -> Option<FixedOffset> {
        match self {
            PyTimeZone::Utc => FixedOffset::east_opt(0),
            PyTimeZone::Fixed(offset) => Some(*offset),
            PyTimeZone::Named(name) if is_utc_name(name) => FixedOffset::east_opt(0),
            PyTimeZone::Named(_) => None,
        }
    }

    fn to_value(&self) -> Value {
        match self {
            PyTimeZone::Utc => record("datetime.timezone", vec![Value::native(TimeDelta::zero())]),
            PyTimeZone::Fixed(offset) => {
                let delta = TimeDelta::seconds(i64::from(offset.local_minus_utc()));
                record("datetime.timezone", vec![Value::native(delta)])
            }
            PyTimeZone::Named(name) => record("pytz.timezone", vec![Value::from(name.as_str())]),
        }
    }
}

impl fmt::Display for PyTimeZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PyTimeZone::Utc => f.write_str("UTC"),
            PyTimeZone::Fixed(offset) => f.write_str(&iso_offset(*offset)),
            PyTimeZone::Named(name) => f.write_str(name),
        }
    }
}

fn is_utc_name(name: &str) -> bool {
    matches!(name, "UTC" | "Etc/UTC" | "utc")
}

fn micros_of(time: &NaiveTime) -> u32 {
    // a leap second carries its overflow in the nanoseconds
    (time.nanosecond() % 1_000_000_000) / 1_000
}

fn iso_date(date: &NaiveDate) -> String {
    format!("{:04}-{:02}-{:02}", date.year(), date.month(), date.day())
}

fn iso_time(time: &NaiveTime) -> String {
    let micros = micros_of(time);
    let base = format!("{:02}:{:02}:{:02}", time.hour(), time.minute(), time.second());
    if micros == 0 {
        base
    } else {
        format!("{base}.{micros:06}")
    }
}

fn iso_offset(offset: FixedOffset) -> String {
    let seconds = offset.local_minus_utc();
    let sign = if seconds < 0 { '-' } else { '+' };
    let seconds = seconds.unsigned_abs();
    format!("{sign}{:02}:{:02}", seconds / 3600, (seconds % 3600) / 60)
}

fn date_value(date: &NaiveDate) -> Value {
    record(
        "datetime.date",
        vec![
            Value::from(date.year()),
            Value::Int(i64::from(date.month())),
            Value::Int(i64::from(date.day())),
        ],
    )
}

fn time_value(time: &NaiveTime) -> Value {
    record(
        "datetime.time",
        vec![
            Value::Int(i64::from(time.hour())),
            Value::Int(i64::from(time.minute())),
            Value::Int(i64::from(time.second())),
            Value::Int(i64::from(micros_of(time))),
        ],
    )
}

fn timedelta_value(delta: &TimeDelta) -> Result<Value> {
    let (days, seconds, micros) = timedelta_parts(delta)
        .ok_or_else(|| ProtocolError::Encode(format!("timedelta {delta} out of range")))?;
    Ok(record(
        "datetime.timedelta",
        vec![Value::Int(days), Value::Int(seconds), Value::Int(micros)],
    ))
}

/// Python's normalized `(days, seconds, microseconds)`; only `days` is negative.
pub fn timedelta_parts(delta: &TimeDelta) -> Option<(i64, i64, i64)> {
    let total = delta.num_microseconds()?;
    let days = total.div_euclid(MICROS_PER_DAY);
    let rest = total.rem_euclid(MICROS_PER_DAY);
    Some((days, rest / MICROS_PER_SECOND, rest % MICROS_PER_SECOND))
}

/// Packed state bytes; protocol 0 delivers them as latin-1 text.
fn state_bytes(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::Bytes(b) | Value::ByteArray(b) => Some(b.clone()),
        Value::String(s) => s.chars().map(|c| u8::try_from(u32::from(c)).ok()).collect(),
        _ => None,
    }
}

fn int_args(args: &[Value]) -> std::result::Result<Vec<i64>, String> {
    args.iter()
        .map(|arg| {
            arg.as_i64()
                .ok_or_else(|| format!("expected an integer, got '{}'", arg.type_name()))
        })
        .collect()
}

fn tz_arg(value: &Value) -> std::result::Result<Option<PyTimeZone>, String> {
    match value {
        Value::None => Ok(None),
        other => other
            .as_native::<PyTimeZone>()
            .cloned()
            .map(Some)
            .ok_or_else(|| format!("unsupported tzinfo of type '{}'", other.type_name())),
    }
}

fn ymd(year: i64, month: i64, day: i64) -> std::result::Result<NaiveDate, String> {
    let invalid = || format!("invalid date {year}-{month}-{day}");
    let (Ok(y), Ok(m), Ok(d)) = (i32::try_from(year), u32::try_from(month), u32::try_from(day))
    else {
        return Err(invalid());
    };
    NaiveDate::from_ymd_opt(y, m, d).ok_or_else(invalid)
}

fn hms_micro(hour: i64, minute: i64, second: i64, micro: i64) -> std::result::Result<NaiveTime, String> {
    let invalid = || format!("invalid time {hour}:{minute}:{second}.{micro}");
    if !(0..MICROS_PER_SECOND).contains(&micro) {
        return Err(invalid());
    }
    let (Ok(h), Ok(m), Ok(s), Ok(us)) = (
        u32::try_from(hour),
        u32::try_from(minute),
        u32::try_from(second),
        u32::try_from(micro),
    ) else {
        return Err(invalid());
    };
    NaiveTime::from_hms_micro_opt(h, m, s, us).ok_or_else(invalid)
}

fn packed_micros(bytes: &[u8]) -> i64 {
    bytes.iter().fold(0, |acc, &b| (acc << 8) | i64::from(b))
}

// datetime(state[, tz]) or datetime(year, month, day[, hour[, minute[, second[, us[, tz]]]]])
fn datetime(_: &Registry, _: &ClassRef, args: Vec<Value>) -> FactoryResult {
    if let Some(state) = args.first().and_then(state_bytes) {
        let tzinfo = match args.as_slice() {
            [_] => None,
            [_, tz] => tz_arg(tz)?,
            _ => return Err(format!("expected 1 or 2 arguments, got {}", args.len())),
        };
        let &[yhi, ylo, month, day, hour, minute, second, ref micros @ ..] = state.as_slice() else {
            return Err(format!("expected a 10-byte state, got {} bytes", state.len()));
        };
        if micros.len() != 3 {
            return Err(format!("expected a 10-byte state, got {} bytes", state.len()));
        }
        // the high bit of the month is the fold flag
        let date = ymd(
            i64::from(yhi) * 256 + i64::from(ylo),
            i64::from(month & 0x7f),
            i64::from(day),
        )?;
        let time = hms_micro(
            i64::from(hour),
            i64::from(minute),
            i64::from(second),
            packed_micros(micros),
        )?;
        return Ok(Value::native(PyDateTime {
            local: date.and_time(time),
            tzinfo,
        }));
    }

    if !(3..=8).contains(&args.len()) {
        return Err(format!("expected 1, 2 or 3 to 8 arguments, got {}", args.len()));
    }
    let (fields, tzinfo) = match args.split_at(args.len().min(7)) {
        (fields, [tz]) => (fields, tz_arg(tz)?),
        (fields, _) => (fields, None),
    };
    let mut parts = int_args(fields)?;
    parts.resize(7, 0);
    let date = ymd(parts[0], parts[1], parts[2])?;
    let time = hms_micro(parts[3], parts[4], parts[5], parts[6])?;
    Ok(Value::native(PyDateTime {
        local: date.and_time(time),
        tzinfo,
    }))
}

// date(state) or date(year, month, day)
fn date(_: &Registry, _: &ClassRef, args: Vec<Value>) -> FactoryResult {
    let parsed = match args.as_slice() {
        [state] => {
            let state = state_bytes(state).ok_or("expected a packed date state")?;
            match *state.as_slice() {
                [yhi, ylo, month, day] => ymd(
                    i64::from(yhi) * 256 + i64::from(ylo),
                    i64::from(month),
                    i64::from(day),
                )?,
                _ => return Err(format!("expected a 4-byte state, got {} bytes", state.len())),
            }
        }
        [_, _, _] => {
            let parts = int_args(&args)?;
            ymd(parts[0], parts[1], parts[2])?
        }
        _ => return Err(format!("expected 1 or 3 arguments, got {}", args.len())),
    };
    Ok(Value::native(parsed))
}

// time(state[, tz]) or time([hour[, minute[, second[, us[, tz]]]]]); the zone is not kept
fn time(_: &Registry, _: &ClassRef, args: Vec<Value>) -> FactoryResult {
    if let Some(state) = args.first().and_then(state_bytes) {
        if let [_, tz] = args.as_slice() {
            tz_arg(tz)?;
        } else if args.len() != 1 {
            return Err(format!("expected 1 or 2 arguments, got {}", args.len()));
        }
        let &[hour, minute, second, ref micros @ ..] = state.as_slice() else {
            return Err(format!("expected a 6-byte state, got {} bytes", state.len()));
        };
        if micros.len() != 3 {
            return Err(format!("expected a 6-byte state, got {} bytes", state.len()));
        }
        // the high bit of the hour is the fold flag
        let parsed = hms_micro(
            i64::from(hour & 0x7f),
            i64::from(minute),
            i64::from(second),
            packed_micros(micros),
        )?;
        return Ok(Value::native(parsed));
    }

    if args.len() > 5 {
        return Err(format!("expected at most 5 arguments, got {}", args.len()));
    }
    let fields = match args.split_at(args.len().min(4)) {
        (fields, [tz]) => {
            tz_arg(tz)?;
            fields
        }
        (fields, _) => fields,
    };
    let mut parts = int_args(fields)?;
    parts.resize(4, 0);
    Ok(Value::native(hms_micro(parts[0], parts[1], parts[2], parts[3])?))
}

// timedelta(days, seconds, microseconds)
fn timedelta(_: &Registry, _: &ClassRef, args: Vec<Value>) -> FactoryResult {
    if args.len() > 3 {
        return Err(format!("expected at most 3 arguments, got {}", args.len()));
    }
    let mut parts = int_args(&args)?;
    parts.resize(3, 0);
    let total = parts[0]
        .checked_mul(MICROS_PER_DAY)
        .zip(parts[1].checked_mul(MICROS_PER_SECOND))
        .and_then(|(days, seconds)| days.checked_add(seconds))
        .and_then(|micros| micros.checked_add(parts[2]))
        .ok_or_else(|| format!("timedelta {parts:?} out of range"))?;
    Ok(Value::native(TimeDelta::microseconds(total)))
}

// timezone(offset[, name])
fn fixed_timezone(_: &Registry, _: &ClassRef, args: Vec<Value>) -> FactoryResult {
    let offset = match args.as_slice() {
        [offset] | [offset, _] => offset
            .as_native::<TimeDelta>()
            .ok_or("expected a timedelta offset")?,
        _ => return Err(format!("expected 1 or 2 arguments, got {}", args.len())),
    };
    let seconds = offset.num_seconds();
    if seconds == 0 {
        return Ok(Value::native(PyTimeZone::Utc));
    }
    i32::try_from(seconds)
        .ok()
        .and_then(FixedOffset::east_opt)
        .map(|offset| Value::native(PyTimeZone::Fixed(offset)))
        .ok_or_else(|| format!("offset of {seconds}s is not a valid utc offset"))
}

fn utc(_: &Registry, _: &ClassRef, _: Vec<Value>) -> FactoryResult {
    Ok(Value::native(PyTimeZone::Utc))
}

// pytz._p(zone, utcoffset, dst, tzname), pytz.timezone(zone), gettz(zone)
fn named_timezone(_: &Registry, _: &ClassRef, args: Vec<Value>) -> FactoryResult {
    let zone = args
        .first()
        .and_then(Value::as_str)
        .ok_or("expected a zone name as the first argument")?;
    if is_utc_name(zone) {
        return Ok(Value::native(PyTimeZone::Utc));
    }
    Ok(Value::native(PyTimeZone::Named(zone.to_string())))
}

// tzfile("/usr/share/zoneinfo/Europe/Amsterdam")
fn zoneinfo_file(registry: &Registry, class: &ClassRef, args: Vec<Value>) -> FactoryResult {
    let path = match args.as_slice() {
        [path, ..] => path.as_str().ok_or("expected a zoneinfo path")?,
        [] => return Err("expected a zoneinfo path".to_string()),
    };
    let zone = path
        .split_once("zoneinfo/")
        .map(|(_, zone)| zone)
        .filter(|zone| !zone.is_empty())
        .ok_or_else(|| format!("cannot find a zone name in path {path}"))?;
    named_timezone(registry, class, vec![Value::from(zone)])
}

// ============================================================================
// Decimal and complex
// ============================================================================

/// A `decimal.Decimal`, kept as its exact decimal text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PyDecimal(String);

impl PyDecimal {
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if is_decimal_literal(text) {
            Ok(Self(text.to_string()))
        } else {
            Err(ProtocolError::Decode(format!(
                "invalid literal for Decimal: {text:?}"
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Nearest float; `None` for signalling NaN.
    pub fn to_f64(&self) -> Option<f64> {
        self.0.parse().ok()
    }
}

impl FromStr for PyDecimal {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl From<i64> for PyDecimal {
    fn from(i: i64) -> Self {
        Self(i.to_string())
    }
}

impl fmt::Display for PyDecimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_decimal_literal(text: &str) -> bool {
    let digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    let body = text.strip_prefix(['+', '-']).unwrap_or(text).to_ascii_lowercase();
    if matches!(body.as_str(), "inf" | "infinity") {
        return true;
    }
    if let Some(payload) = body.strip_prefix("nan").or_else(|| body.strip_prefix("snan")) {
        return digits(payload);
    }
    let (mantissa, exponent) = match body.split_once('e') {
        Some((mantissa, exponent)) => (mantissa, Some(exponent)),
        None => (body.as_str(), None),
    };
    let (whole, fraction) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    let mantissa_ok = digits(whole) && digits(fraction) && !(whole.is_empty() && fraction.is_empty());
    let exponent_ok = exponent.map_or(true, |e| {
        let e = e.strip_prefix(['+', '-']).unwrap_or(e);
        !e.is_empty() && digits(e)
    });
    mantissa_ok && exponent_ok
}

fn decimal(_: &Registry, _: &ClassRef, args: Vec<Value>) -> FactoryResult {
    let parsed = match args.as_slice() {
        [] => PyDecimal::from(0),
        [Value::String(text)] | [Value::String(text), _] => {
            PyDecimal::parse(text).map_err(|e| e.to_string())?
        }
        [Value::Int(i)] | [Value::Int(i), _] => PyDecimal::from(*i),
        [Value::BigInt(b)] | [Value::BigInt(b), _] => PyDecimal(b.to_string()),
        [other, ..] => {
            return Err(format!(
                "conversion from '{}' to Decimal is not supported",
                other.type_name()
            ))
        }
    };
    Ok(Value::native(parsed))
}

/// A Python `complex`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PyComplex {
    pub real: f64,
    pub imag: f64,
}

impl PyComplex {
    pub fn new(real: f64, imag: f64) -> Self {
        Self { real, imag }
    }

    pub fn magnitude(&self) -> f64 {
        self.real.hypot(self.imag)
    }
}

impl fmt::Display for PyComplex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.imag.is_sign_negative() { '-' } else { '+' };
        write!(f, "({}{sign}{}j)", self.real, self.imag.abs())
    }
}

fn complex(_: &Registry, _: &ClassRef, args: Vec<Value>) -> FactoryResult {
    let number = |value: &Value| {
        value
            .as_f64()
            .ok_or_else(|| format!("complex() argument must be a number, not '{}'", value.type_name()))
    };
    let parsed = match args.as_slice() {
        [] => PyComplex::default(),
        [real] => PyComplex::new(number(real)?, 0.0),
        [real, imag] => PyComplex::new(number(real)?, number(imag)?),
        _ => return Err(format!("expected at most 2 arguments, got {}", args.len())),
    };
    Ok(Value::native(parsed))
}

// ============================================================================
// Arrays
// ============================================================================

/// An `array.array`: a typecode plus homogeneous items.
///
/// Integer typecodes hold [`Value::Int`] (or [`Value::BigInt`] beyond
/// `i64`), `f` and `d` hold [`Value::Float`], `u` and `w` hold
/// one-character strings.
#[derive(Debug, Clone, PartialEq)]
pub struct PyArray {
    pub typecode: char,
    pub items: Vec<Value>,
}

impl PyArray {
    pub fn new(typecode: char, items: Vec<Value>) -> Result<Self> {
        if !ARRAY_TYPECODES.contains(typecode) {
            return Err(ProtocolError::Decode(format!("invalid array typecode {typecode:?}")));
        }
        for item in &items {
            check_item(typecode, item).map_err(ProtocolError::Decode)?;
        }
        Ok(Self { typecode, items })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn to_value(&self) -> Value {
        record(
            "array.array",
            vec![Value::from(self.typecode.to_string()), Value::list(self.items.clone())],
        )
    }
}

fn int_range(typecode: char) -> Option<(i128, i128)> {
    Some(match typecode {
        'b' => (i128::from(i8::MIN), i128::from(i8::MAX)),
        'B' => (0, i128::from(u8::MAX)),
        'h' => (i128::from(i16::MIN), i128::from(i16::MAX)),
        'H' => (0, i128::from(u16::MAX)),
        'i' => (i128::from(i32::MIN), i128::from(i32::MAX)),
        'I' => (0, i128::from(u32::MAX)),
        'l' | 'q' => (i128::from(i64::MIN), i128::from(i64::MAX)),
        'L' | 'Q' => (0, i128::from(u64::MAX)),
        _ => return None,
    })
}

fn check_item(typecode: char, item: &Value) -> std::result::Result<(), String> {
    match typecode {
        'u' | 'w' => match item.as_str() {
            Some(s) if s.chars().count() == 1 => Ok(()),
            _ => Err(format!("array item must be a unicode character, not '{}'", item.type_name())),
        },
        'f' | 'd' => match item {
            Value::Float(_) | Value::Int(_) => Ok(()),
            other => Err(format!("array item must be a float, not '{}'", other.type_name())),
        },
        _ => {
            let value = match item {
                Value::Int(i) => i128::from(*i),
                Value::BigInt(b) => b.to_i128().ok_or("array item out of range")?,
                other => {
                    return Err(format!("array item must be an integer, not '{}'", other.type_name()))
                }
            };
            let (low, high) = int_range(typecode).ok_or("invalid array typecode")?;
            if (low..=high).contains(&value) {
                Ok(())
            } else {
                Err(format!("array item {value} out of range for typecode {typecode:?}"))
            }
        }
    }
}

fn typecode_arg(value: &Value) -> std::result::Result<char, String> {
    let text = value.as_str().ok_or("expected a typecode string")?;
    let mut chars = text.chars();
    match (chars.next(), chars.next()) {
        (Some(code), None) => Ok(code),
        _ => Err(format!("invalid array typecode {text:?}")),
    }
}

// array(typecode, items)
fn array(_: &Registry, _: &ClassRef, args: Vec<Value>) -> FactoryResult {
    let (typecode, initializer) = match args.as_slice() {
        [code] => (typecode_arg(code)?, None),
        [code, items] => (typecode_arg(code)?, Some(items)),
        _ => return Err(format!("expected 1 or 2 arguments, got {}", args.len())),
    };
    let items = match initializer {
        None => Vec::new(),
        Some(Value::String(text)) if matches!(typecode, 'u' | 'w') => {
            text.chars().map(|c| Value::from(c.to_string())).collect()
        }
        Some(Value::String(_) | Value::Bytes(_)) => {
            return Err("arrays pickled as a string of machine values are not supported".to_string())
        }
        Some(items) => items
            .elements()
            .ok_or_else(|| format!("'{}' object is not iterable", items.type_name()))?,
    };
    PyArray::new(typecode, items)
        .map(Value::native)
        .map_err(|e| e.to_string())
}

#[derive(Clone, Copy)]
enum MachineFormat {
    Unsigned(usize),
    Signed(usize),
    Float(usize),
    Utf16,
    Utf32,
}

fn machine_format(code: i64) -> Option<MachineFormat> {
    Some(match code {
        0 => MachineFormat::Unsigned(1),
        1 => MachineFormat::Signed(1),
        2 | 3 => MachineFormat::Unsigned(2),
        4 | 5 => MachineFormat::Signed(2),
        6 | 7 => MachineFormat::Unsigned(4),
        8 | 9 => MachineFormat::Signed(4),
        10 | 11 => MachineFormat::Unsigned(8),
        12 | 13 => MachineFormat::Signed(8),
        14 | 15 => MachineFormat::Float(4),
        16 | 17 => MachineFormat::Float(8),
        18 | 19 => MachineFormat::Utf16,
        20 | 21 => MachineFormat::Utf32,
        _ => return None,
    })
}

// _array_reconstructor(array, typecode, machine_format, data)
fn array_reconstructor(_: &Registry, _: &ClassRef, args: Vec<Value>) -> FactoryResult {
    let [_, code, format, data] = args.as_slice() else {
        return Err(format!("expected 4 arguments, got {}", args.len()));
    };
    let typecode = typecode_arg(code)?;
    let machine_code = format.as_i64().ok_or("expected an integer machine format")?;
    let data = data.as_bytes().ok_or("expected the array data as bytes")?;
    let items = decode_machine_values(typecode, machine_code, data)?;
    PyArray::new(typecode, items)
        .map(Value::native)
        .map_err(|e| e.to_string())
}

/// Decode the raw items of a pickled array.
///
/// Even machine format codes from 2 upwards are little endian, odd ones big endian.
pub fn decode_machine_values(
    typecode: char,
    machine_code: i64,
    data: &[u8],
) -> std::result::Result<Vec<Value>, String> {
    let format = machine_format(machine_code)
        .ok_or_else(|| format!("unknown array machine format {machine_code}"))?;
    let text = matches!(typecode, 'u' | 'w');
    let float = matches!(typecode, 'f' | 'd');
    let consistent = match format {
        MachineFormat::Utf16 | MachineFormat::Utf32 => text,
        MachineFormat::Float(_) => float,
        MachineFormat::Unsigned(_) | MachineFormat::Signed(_) => !text && !float,
    };
    if !consistent {
        return Err(format!(
            "machine format {machine_code} does not match typecode {typecode:?}"
        ));
    }

    let width = match format {
        MachineFormat::Unsigned(w) | MachineFormat::Signed(w) | MachineFormat::Float(w) => w,
        MachineFormat::Utf16 => 2,
        MachineFormat::Utf32 => 4,
    };
    if data.len() % width != 0 {
        return Err(format!("{} bytes of data do not divide into {width}-byte items", data.len()));
    }
    let big_endian = machine_code >= 2 && machine_code % 2 == 1;
    let words = data.chunks_exact(width).map(|chunk| {
        let ordered = |acc: u64, b: &u8| (acc << 8) | u64::from(*b);
        if big_endian {
            chunk.iter().fold(0, ordered)
        } else {
            chunk.iter().rev().fold(0, ordered)
        }
    });

    match format {
        MachineFormat::Unsigned(_) => Ok(words
            .map(|raw| i64::try_from(raw).map_or_else(|_| Value::from(BigInt::from(raw)), Value::Int))
            .collect()),
        MachineFormat::Signed(w) => {
            let shift = 64 - 8 * w as u32;
            Ok(words.map(|raw| Value::Int(((raw << shift) as i64) >> shift)).collect())
        }
        MachineFormat::Float(4) => Ok(words
            .map(|raw| Value::Float(f64::from(f32::from_bits(raw as u32))))
            .collect()),
        MachineFormat::Float(_) => Ok(words.map(|raw| Value::Float(f64::from_bits(raw))).collect()),
        MachineFormat::Utf16 => {
            let units: Vec<u16> = words.map(|raw| raw as u16).collect();
            char::decode_utf16(units)
                .map(|c| {
                    c.map(|c| Value::from(c.to_string()))
                        .map_err(|e| format!("invalid utf-16 array data: {e}"))
                })
                .collect()
        }
        MachineFormat::Utf32 => words
            .map(|raw| {
                u32::try_from(raw)
                    .ok()
                    .and_then(char::from_u32)
                    .map(|c| Value::from(c.to_string()))
                    .ok_or_else(|| format!("invalid utf-32 code point {raw:#x}"))
            })
            .collect(),
    }
}

// ============================================================================
// Text codecs
// ============================================================================

/// The form Python's text serializers write for a standard-library value.
///
/// Datetimes become ISO 8601 strings, timedeltas their total seconds,
/// decimals their text and arrays plain lists.
pub fn text_form(native: &NativeValue) -> Option<Value> {
    if let Some(dt) = native.downcast_ref::<PyDateTime>() {
        return Some(Value::from(dt.isoformat()));
    }
    if let Some(dt) = native.downcast_ref::<NaiveDateTime>() {
        return Some(Value::from(PyDateTime::naive(*dt).isoformat()));
    }
    if let Some(dt) = native.downcast_ref::<DateTime<FixedOffset>>() {
        return Some(Value::from(PyDateTime::from(*dt).isoformat()));
    }
    if let Some(date) = native.downcast_ref::<NaiveDate>() {
        return Some(Value::from(iso_date(date)));
    }
    if let Some(time) = native.downcast_ref::<NaiveTime>() {
        return Some(Value::from(iso_time(time)));
    }
    if let Some(delta) = native.downcast_ref::<TimeDelta>() {
        let micros = delta.num_microseconds()?;
        return Some(Value::Float(micros as f64 / MICROS_PER_SECOND as f64));
    }
    if let Some(tz) = native.downcast_ref::<PyTimeZone>() {
        return Some(Value::from(tz.to_string()));
    }
    if let Some(decimal) = native.downcast_ref::<PyDecimal>() {
        return Some(Value::from(decimal.as_str()));
    }
    if let Some(c) = native.downcast_ref::<PyComplex>() {
        return Some(Value::tuple(vec![Value::Float(c.real), Value::Float(c.imag)]));
    }
    native
        .downcast_ref::<PyArray>()
        .map(|array| Value::list(array.items.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn construct(qualified: &str, args: Vec<Value>) -> Result<Value> {
        let (module, name) = qualified.rsplit_once('.').expect("qualified name");
        Registry::default().construct(&ClassRef::new(module, name), args)
    }

    #[test]
    fn test_datetime_from_packed_state() {
        let state = Value::Bytes(b"\x07\xe8\x03\x0f\r-\x1e\x01\xe2@".to_vec());
        let value = construct("datetime.datetime", vec![state]).expect("datetime");
        let dt = value.as_native::<PyDateTime>().expect("native datetime");
        assert_eq!(dt.isoformat(), "2024-03-15T13:45:30.123456");
        assert_eq!(dt.tzinfo, None);
    }

    #[test]
    fn test_datetime_fold_bit_ignored() {
        let state = Value::Bytes(b"\x07\xe8\x83\x0f\r-\x1e\x00\x00\x00".to_vec());
        let value = construct("datetime.datetime", vec![state]).expect("datetime");
        assert_eq!(value.as_native::<PyDateTime>().expect("native").local.month(), 3);
    }

    #[test]
    fn test_datetime_from_integers_with_zone() {
        let args = vec![
            Value::Int(2021),
            Value::Int(12),
            Value::Int(31),
            Value::Int(23),
            Value::Int(59),
            Value::Int(58),
            Value::Int(0),
            Value::native(PyTimeZone::Fixed(FixedOffset::east_opt(-5 * 3600).expect("offset"))),
        ];
        let value = construct("datetime.datetime", args).expect("datetime");
        let dt = value.as_native::<PyDateTime>().expect("native");
        assert_eq!(dt.isoformat(), "2021-12-31T23:59:58-05:00");
        assert_eq!(dt.to_fixed().expect("fixed").timestamp(), 1_641_013_198);
    }

    #[test]
    fn test_invalid_dates_rejected() {
        assert!(construct("datetime.date", vec![Value::Int(2023), Value::Int(2), Value::Int(29)]).is_err());
        assert!(construct("datetime.datetime", vec![Value::Bytes(vec![0; 9])]).is_err());
        assert!(construct("datetime.time", vec![Value::Int(24)]).is_err());
    }

    #[test]
    fn test_timedelta_normalization() {
        let value = construct(
            "datetime.timedelta",
            vec![Value::Int(-1), Value::Int(3600), Value::Int(5)],
        )
        .expect("timedelta");
        let delta = value.as_native::<TimeDelta>().expect("native");
        assert_eq!(delta.num_seconds(), -86_400 + 3600);
        assert_eq!(timedelta_parts(delta), Some((-1, 3600, 5)));
        assert_eq!(timedelta_parts(&TimeDelta::microseconds(-1)), Some((-1, 86_399, 999_999)));
        assert!(construct("datetime.timedelta", vec![Value::Int(i64::MAX)]).is_err());
    }

    #[test]
    fn test_time_zones() {
        let utc = construct("pytz._UTC", vec![]).expect("utc");
        assert_eq!(utc.as_native::<PyTimeZone>(), Some(&PyTimeZone::Utc));

        let args = vec![
            Value::from("Europe/Amsterdam"),
            Value::Int(3600),
            Value::Int(0),
            Value::from("CET"),
        ];
        let named = construct("pytz._p", args).expect("pytz");
        assert_eq!(
            named.as_native::<PyTimeZone>(),
            Some(&PyTimeZone::Named("Europe/Amsterdam".into()))
        );

        let file = construct(
            "dateutil.tz.tzfile",
            vec![Value::from("/usr/share/zoneinfo/America/New_York")],
        )
        .expect("tzfile");
        assert_eq!(file.as_native::<PyTimeZone>().map(ToString::to_string).as_deref(), Some("America/New_York"));
        assert!(construct("dateutil.tz.tzfile", vec![Value::from("/tmp/zone")]).is_err());

        let two_hours = Value::native(TimeDelta::seconds(7200));
        let fixed = construct("datetime.timezone", vec![two_hours]).expect("timezone");
        assert_eq!(fixed.as_native::<PyTimeZone>().map(ToString::to_string).as_deref(), Some("+02:00"));
    }

    #[test]
    fn test_decimal_literals() {
        for ok in ["12345.6789", "-1.5E+10", ".5", "5.", "NaN", "-Infinity", "sNaN12", "1e-7"] {
            assert!(PyDecimal::parse(ok).is_ok(), "{ok}");
        }
        for bad in ["", ".", "1.2.3", "e5", "1e", "0x10", "NaNa"] {
            assert!(PyDecimal::parse(bad).is_err(), "{bad}");
        }
        assert_eq!(PyDecimal::parse("2.5").expect("decimal").to_f64(), Some(2.5));
    }

    #[test]
    fn test_complex_display() {
        assert_eq!(PyComplex::new(1.5, -2.0).to_string(), "(1.5-2j)");
        assert_eq!(PyComplex::new(0.0, 1.0).to_string(), "(0+1j)");
        assert_eq!(PyComplex::new(3.0, 4.0).magnitude(), 5.0);
    }

    #[test]
    fn test_machine_values() {
        let ints = decode_machine_values('i', 8, b"\x01\x00\x00\x00\xfd\xff\xff\xff").expect("ints");
        assert_eq!(ints, vec![Value::Int(1), Value::Int(-3)]);

        let shorts = decode_machine_values('H', 3, b"\x01\x02").expect("big endian");
        assert_eq!(shorts, vec![Value::Int(0x0102)]);

        let big = decode_machine_values('Q', 10, &[0xff; 8]).expect("u64");
        assert_eq!(big, vec![Value::from(BigInt::from(u64::MAX))]);

        let text = decode_machine_values('u', 20, b"h\x00\x00\x00\xe9\x00\x00\x00").expect("utf-32");
        assert_eq!(text, vec![Value::from("h"), Value::from("\u{e9}")]);

        assert!(decode_machine_values('i', 8, b"\x01\x00").is_err());
        assert!(decode_machine_values('d', 8, &[0; 8]).is_err());
        assert!(decode_machine_values('i', 22, &[]).is_err());
    }

    #[test]
    fn test_array_item_ranges() {
        assert!(PyArray::new('B', vec![Value::Int(255)]).is_ok());
        assert!(PyArray::new('B', vec![Value::Int(256)]).is_err());
        assert!(PyArray::new('u', vec![Value::from("ab")]).is_err());
        assert!(PyArray::new('z', vec![]).is_err());
    }

    #[test]
    fn test_text_forms() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 15).expect("date");
        let dt = PyDateTime::with_tzinfo(
            date.and_hms_opt(8, 0, 0).expect("time"),
            PyTimeZone::Utc,
        );
        assert_eq!(
            text_form(&NativeValue::new(dt)),
            Some(Value::from("2024-03-15T08:00:00+00:00"))
        );
        assert_eq!(text_form(&NativeValue::new(date)), Some(Value::from("2024-03-15")));
        assert_eq!(
            text_form(&NativeValue::new(TimeDelta::milliseconds(1500))),
            Some(Value::Float(1.5))
        );
        assert_eq!(text_form(&NativeValue::new(PyDecimal::from(7))), Some(Value::from("7")));
    }
}
