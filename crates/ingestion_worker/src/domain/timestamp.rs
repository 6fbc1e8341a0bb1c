use crate::domain::{NormalizeError, NormalizeResult};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Number, Value};

/// Epoch values above this are milliseconds, everything else is seconds.
pub const EPOCH_MILLIS_THRESHOLD: i64 = 10_000_000_000;

const OFFSET_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%dT%H:%M%z",
    "%Y-%m-%d %H:%M%z",
];

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Coerce a raw payload timestamp into a UTC instant.
///
/// Accepted forms:
/// * integers and floats as epoch seconds, or epoch milliseconds when above
///   [`EPOCH_MILLIS_THRESHOLD`]
/// * ISO-8601 strings with `Z` or a numeric offset
/// * ISO-8601 strings without an offset, read as UTC
/// * strings made only of digits, handled like the equivalent integer
pub fn coerce_timestamp(value: &Value) -> NormalizeResult<DateTime<Utc>> {
    match value {
        Value::Number(n) => from_number(n),
        Value::String(s) => from_string(s),
        other => Err(NormalizeError::InvalidTimestamp(format!(
            "expected a number or string, got {}",
            json_type_name(other)
        ))),
    }
}

fn from_number(n: &Number) -> NormalizeResult<DateTime<Utc>> {
    if let Some(i) = n.as_i64() {
        return from_epoch_int(i);
    }
    match n.as_f64() {
        Some(f) => from_epoch_float(f),
        None => Err(NormalizeError::InvalidTimestamp(format!(
            "unrepresentable number {}",
            n
        ))),
    }
}

fn from_epoch_int(v: i64) -> NormalizeResult<DateTime<Utc>> {
    let parsed = if v > EPOCH_MILLIS_THRESHOLD {
        DateTime::from_timestamp_millis(v)
    } else {
        DateTime::from_timestamp(v, 0)
    };
    parsed.ok_or_else(|| {
        NormalizeError::InvalidTimestamp(format!("epoch value {} is out of range", v))
    })
}

fn from_epoch_float(v: f64) -> NormalizeResult<DateTime<Utc>> {
    if !v.is_finite() {
        return Err(NormalizeError::InvalidTimestamp(format!(
            "epoch value {} is not finite",
            v
        )));
    }

    // Split before scaling so millisecond inputs keep their sub-second digits
    let (secs, nanos) = if v > EPOCH_MILLIS_THRESHOLD as f64 {
        let secs = (v / 1000.0).floor();
        (secs, ((v - secs * 1000.0) * 1_000_000.0).round())
    } else {
        let secs = v.floor();
        (secs, ((v - secs) * 1_000_000_000.0).round())
    };
    let (secs, nanos) = if nanos >= 1_000_000_000.0 {
        (secs + 1.0, 0.0)
    } else {
        (secs, nanos.max(0.0))
    };

    if secs < i64::MIN as f64 || secs > i64::MAX as f64 {
        return Err(NormalizeError::InvalidTimestamp(format!(
            "epoch value {} is out of range",
            v
        )));
    }

    DateTime::from_timestamp(secs as i64, nanos as u32).ok_or_else(|| {
        NormalizeError::InvalidTimestamp(format!("epoch value {} is out of range", v))
    })
}

fn from_string(raw: &str) -> NormalizeResult<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(NormalizeError::InvalidTimestamp(
            "empty timestamp string".to_string(),
        ));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    let with_offset = match s.strip_suffix('Z').or_else(|| s.strip_suffix('z')) {
        Some(stripped) => format!("{}+00:00", stripped),
        None => s.to_string(),
    };
    for format in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(&with_offset, format) {
            return Ok(dt.with_timezone(&Utc));
        }
    }

    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(naive.and_utc());
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }

    if s.bytes().all(|b| b.is_ascii_digit()) {
        let epoch = s.parse::<i64>().map_err(|_| {
            NormalizeError::InvalidTimestamp(format!("epoch string '{}' is out of range", s))
        })?;
        return from_epoch_int(epoch);
    }

    Err(NormalizeError::InvalidTimestamp(format!(
        "unrecognized timestamp '{}'",
        s
    )))
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
