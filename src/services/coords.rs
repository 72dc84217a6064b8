//! Coordinate parsing
//!
//! Upstream rows encode locations in several ways:
//! - structured objects: `{"lat": 23.8, "lng": 90.4}` or `{"latitude": .., "longitude": ..}`,
//!   with numbers or numeric strings as values
//! - JSON text of such an object: `"{\"lat\":23.8,\"lng\":90.4}"`
//! - comma-separated pairs: `"23.8, 90.4"`
//!
//! Everything else is a [`ParseError`] carrying the raw value. The parser is
//! pure and never panics.

use crate::domain::error::ParseError;
use crate::domain::types::LocationSample;
use serde_json::{Map, Value};

/// Parse a raw JSON value into a validated location
pub fn parse(raw: &Value) -> Result<LocationSample, ParseError> {
    match raw {
        Value::Object(map) => parse_object(map, || raw.to_string()),
        Value::String(s) => parse_str(s),
        _ => Err(ParseError::UnsupportedShape { raw: raw.to_string() }),
    }
}

/// Parse a textual location (JSON object text or `lat,lng`)
pub fn parse_str(raw: &str) -> Result<LocationSample, ParseError> {
    let text = raw.trim();

    if text.starts_with('{') || text.starts_with('"') {
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => return parse_object(&map, || raw.to_string()),
            // Double-encoded string; unwrap one level and try again
            Ok(Value::String(inner)) if inner.trim() != text => return parse_str(&inner),
            _ => {}
        }
    }

    let mut tokens = text.split(',');
    let (Some(lat), Some(lng), None) = (tokens.next(), tokens.next(), tokens.next()) else {
        return Err(ParseError::UnsupportedShape { raw: raw.to_string() });
    };

    match (coerce_str(lat), coerce_str(lng)) {
        (Some(latitude), Some(longitude)) => validate(latitude, longitude, || raw.to_string()),
        _ => Err(ParseError::NotNumeric { raw: raw.to_string() }),
    }
}

fn parse_object(
    map: &Map<String, Value>,
    raw: impl Fn() -> String,
) -> Result<LocationSample, ParseError> {
    let pair = match (map.get("lat"), map.get("lng")) {
        (Some(lat), Some(lng)) => Some((lat, lng)),
        _ => match (map.get("latitude"), map.get("longitude")) {
            (Some(lat), Some(lng)) => Some((lat, lng)),
            _ => None,
        },
    };

    let Some((lat, lng)) = pair else {
        return Err(ParseError::UnsupportedShape { raw: raw() });
    };

    match (coerce(lat), coerce(lng)) {
        (Some(latitude), Some(longitude)) => validate(latitude, longitude, raw),
        _ => Err(ParseError::NotNumeric { raw: raw() }),
    }
}

/// Numeric coercion: JSON numbers and numeric strings, finite values only
fn coerce(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()),
        Value::String(s) => coerce_str(s),
        _ => None,
    }
}

fn coerce_str(token: &str) -> Option<f64> {
    token.trim().parse::<f64>().ok().filter(|f| f.is_finite())
}

fn validate(
    latitude: f64,
    longitude: f64,
    raw: impl Fn() -> String,
) -> Result<LocationSample, ParseError> {
    LocationSample::new(latitude, longitude).ok_or_else(|| ParseError::OutOfRange {
        raw: raw(),
        latitude,
        longitude,
    })
}
