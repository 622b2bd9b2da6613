//! Time-series points and their InfluxDB line protocol form.
//!
//! ```text
//! deviceValues,deviceId=d1 value=24.34 1700000000000000000
//! ```

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::domain::Measurement;

/// Measurement name for device readings.
pub const DEVICE_VALUES: &str = "deviceValues";
pub const DEVICE_ID_TAG: &str = "deviceId";
pub const VALUE_FIELD: &str = "value";

/// A value that can be stored in a point field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    String(String),
    Boolean(bool),
}

impl FieldValue {
    /// Render for line protocol: integers get an `i` suffix, strings are quoted.
    pub fn to_line_protocol(&self) -> String {
        match self {
            FieldValue::Float(v) => format!("{}", v),
            FieldValue::Integer(v) => format!("{}i", v),
            FieldValue::String(v) => {
                let escaped = v.replace('\\', "\\\\").replace('"', "\\\"");
                format!("\"{}\"", escaped)
            }
            FieldValue::Boolean(v) => v.to_string(),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line_protocol())
    }
}

/// One time-series record.
///
/// Tags and fields are kept in ordered maps so rendering is canonical.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub timestamp: DateTime<Utc>,
}

impl Point {
    pub fn new(measurement: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp,
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// `deviceValues,deviceId=<id> value=<v>` stamped with `timestamp`.
    pub fn from_measurement(measurement: &Measurement, timestamp: DateTime<Utc>) -> Self {
        Self::new(DEVICE_VALUES, timestamp)
            .tag(DEVICE_ID_TAG, measurement.device_id.as_str())
            .field(VALUE_FIELD, FieldValue::Float(measurement.value))
    }

    /// Nanoseconds since the Unix epoch, saturating outside the i64 range.
    pub fn timestamp_nanos(&self) -> i64 {
        self.timestamp.timestamp_nanos_opt().unwrap_or(i64::MAX)
    }

    /// Render as one line of line protocol, or `None` for a point with no
    /// fields (the store rejects those).
    pub fn to_line_protocol(&self) -> Option<String> {
        if self.fields.is_empty() {
            return None;
        }

        let mut line = escape_measurement(&self.measurement);
        for (key, value) in &self.tags {
            line.push(',');
            line.push_str(&escape_key(key));
            line.push('=');
            line.push_str(&escape_key(value));
        }

        line.push(' ');
        for (i, (key, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                line.push(',');
            }
            line.push_str(&escape_key(key));
            line.push('=');
            line.push_str(&value.to_line_protocol());
        }

        line.push(' ');
        line.push_str(&self.timestamp_nanos().to_string());
        Some(line)
    }
}

/// Measurement names escape commas and spaces.
fn escape_measurement(s: &str) -> String {
    s.replace(',', "\\,").replace(' ', "\\ ")
}

/// Tag keys, tag values, and field keys escape commas, equals signs, and spaces.
fn escape_key(s: &str) -> String {
    s.replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.timestamp_nanos(1_700_000_000_123_456_789)
    }

    #[test]
    fn test_device_point_shape() {
        let point = Point::from_measurement(&Measurement::new("d1", 24.34), ts());
        assert_eq!(point.measurement, "deviceValues");
        assert_eq!(point.tags.get("deviceId").map(String::as_str), Some("d1"));
        assert_eq!(point.fields.get("value"), Some(&FieldValue::Float(24.34)));
        assert_eq!(
            point.to_line_protocol().unwrap(),
            "deviceValues,deviceId=d1 value=24.34 1700000000123456789"
        );
    }

    #[test]
    fn test_escaping() {
        let point = Point::new("cpu load,x", ts())
            .tag("host name", "a=b,c")
            .field("free text", FieldValue::String(r#"say "hi" \o/"#.to_string()));
        assert_eq!(
            point.to_line_protocol().unwrap(),
            r#"cpu\ load\,x,host\ name=a\=b\,c free\ text="say \"hi\" \\o/" 1700000000123456789"#
        );
    }

    #[test]
    fn test_tags_and_fields_are_sorted() {
        let point = Point::new("m", ts())
            .tag("zone", "z")
            .tag("app", "a")
            .field("b", FieldValue::Integer(2))
            .field("a", FieldValue::Boolean(true));
        assert_eq!(
            point.to_line_protocol().unwrap(),
            "m,app=a,zone=z a=true,b=2i 1700000000123456789"
        );
    }

    #[test]
    fn test_point_without_fields_does_not_render() {
        assert!(Point::new("m", ts()).tag("k", "v").to_line_protocol().is_none());
    }
}
