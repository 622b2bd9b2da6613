//! Wire format for measurements: a JSON object `{"Id": ..., "Value": ...}`.

use std::str::FromStr;

use crate::domain::Measurement;
use crate::{Error, Result};

/// Content type stamped on published messages.
///
/// The body is JSON either way; `TextPlain` exists for consumers that still
/// expect the legacy label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentType {
    #[default]
    Json,
    TextPlain,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::TextPlain => "text/plain",
        }
    }
}

impl FromStr for ContentType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "application/json" | "json" => Ok(Self::Json),
            "text/plain" | "text" => Ok(Self::TextPlain),
            other => Err(Error::config(format!("unsupported content type: {other}"))),
        }
    }
}

pub fn encode_measurement(measurement: &Measurement) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(measurement)?)
}

pub fn decode_measurement(body: &[u8]) -> Result<Measurement> {
    serde_json::from_slice(body).map_err(|e| Error::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_wire_payload() {
        let m = decode_measurement(br#"{"Id":"5f1b2c","Value":24.34}"#).unwrap();
        assert_eq!(m, Measurement::new("5f1b2c", 24.34));
    }

    #[test]
    fn test_encode_then_decode_preserves_pair() {
        let original = Measurement::new("d1", -3.75);
        let decoded = decode_measurement(&encode_measurement(&original).unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_decode_garbage_is_decode_error() {
        let err = decode_measurement(b"\x00not-json").unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
        let err = decode_measurement(br#"{"Id":"d1"}"#).unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[test]
    fn test_content_type_parse() {
        assert_eq!("text/plain".parse::<ContentType>().unwrap(), ContentType::TextPlain);
        assert_eq!(ContentType::default().as_str(), "application/json");
        assert!("application/xml".parse::<ContentType>().is_err());
    }
}
