//! Service metadata (`/api/config`) and its validation.

use chrono_tz::Tz;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

/// Validated configuration metadata of the remote service.
///
/// The raw object is kept whole so the runtime sees every key the service
/// reported; the fields required for scheduling are parsed once up front.
#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    raw: Map<String, Value>,
    latitude: f64,
    longitude: f64,
    elevation: f64,
    time_zone: Tz,
}

impl Metadata {
    /// Validate a decoded `/api/config` body.
    ///
    /// `latitude`, `longitude` and `elevation` must be numbers or numeric
    /// strings; `time_zone` must name a zone in the tz database.
    pub fn validate(value: Value) -> Result<Self, MetadataError> {
        let Value::Object(raw) = value else {
            return Err(MetadataError::NotAnObject);
        };

        let latitude = numeric(&raw, "latitude")?;
        let longitude = numeric(&raw, "longitude")?;
        let elevation = numeric(&raw, "elevation")?;

        let zone = raw
            .get("time_zone")
            .ok_or(MetadataError::Missing("time_zone"))?;
        let time_zone = zone
            .as_str()
            .and_then(|name| name.parse::<Tz>().ok())
            .ok_or_else(|| MetadataError::UnknownTimeZone(display(zone)))?;

        Ok(Self {
            raw,
            latitude,
            longitude,
            elevation,
            time_zone,
        })
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    pub fn elevation(&self) -> f64 {
        self.elevation
    }

    pub fn time_zone(&self) -> Tz {
        self.time_zone
    }

    /// Version string reported by the service, if present.
    pub fn version(&self) -> Option<&str> {
        self.raw.get("version").and_then(Value::as_str)
    }

    /// Look up any key of the raw metadata.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.raw.get(key)
    }
}

impl Serialize for Metadata {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.raw.serialize(serializer)
    }
}

fn numeric(raw: &Map<String, Value>, key: &'static str) -> Result<f64, MetadataError> {
    let value = raw.get(key).ok_or(MetadataError::Missing(key))?;
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| MetadataError::InvalidNumber {
        field: key,
        value: display(value),
    })
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Metadata that cannot be used yet.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MetadataError {
    #[error("metadata is not a JSON object")]
    NotAnObject,
    #[error("value for '{0}' not found in metadata")]
    Missing(&'static str),
    #[error("invalid value for '{field}' ('{value}') in metadata")]
    InvalidNumber { field: &'static str, value: String },
    #[error("invalid value for 'time_zone' ('{0}') in metadata")]
    UnknownTimeZone(String),
}

impl MetadataError {
    /// The metadata key at fault, if any.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Self::NotAnObject => None,
            Self::Missing(field) | Self::InvalidNumber { field, .. } => Some(field),
            Self::UnknownTimeZone(_) => Some("time_zone"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn string_coordinates_pass() {
        let meta = Metadata::validate(json!({
            "latitude": "51.5",
            "longitude": "-0.1",
            "elevation": "11",
            "time_zone": "Europe/London"
        }))
        .unwrap();
        assert_eq!(meta.latitude(), 51.5);
        assert_eq!(meta.longitude(), -0.1);
        assert_eq!(meta.elevation(), 11.0);
        assert_eq!(meta.time_zone(), chrono_tz::Europe::London);
    }

    #[test]
    fn numeric_coordinates_pass_and_keep_extra_keys() {
        let meta = Metadata::validate(json!({
            "latitude": 40.7,
            "longitude": -74,
            "elevation": 10,
            "time_zone": "America/New_York",
            "version": "0.80.1",
            "unit_system": {"length": "km"}
        }))
        .unwrap();
        assert_eq!(meta.version(), Some("0.80.1"));
        assert!(meta.get("unit_system").is_some());
        let round = serde_json::to_value(&meta).unwrap();
        assert_eq!(round["version"], "0.80.1");
    }

    #[test]
    fn missing_elevation_fails() {
        let err = Metadata::validate(json!({
            "latitude": "51.5",
            "longitude": "-0.1",
            "time_zone": "Europe/London"
        }))
        .unwrap_err();
        assert_eq!(err, MetadataError::Missing("elevation"));
        assert_eq!(err.field(), Some("elevation"));
    }

    #[test]
    fn non_numeric_latitude_fails() {
        let err = Metadata::validate(json!({
            "latitude": "north",
            "longitude": 0,
            "elevation": 0,
            "time_zone": "UTC"
        }))
        .unwrap_err();
        assert_eq!(err.field(), Some("latitude"));
    }

    #[test]
    fn unknown_time_zone_fails() {
        let err = Metadata::validate(json!({
            "latitude": 0,
            "longitude": 0,
            "elevation": 0,
            "time_zone": "Mars/Olympus_Mons"
        }))
        .unwrap_err();
        assert_eq!(err, MetadataError::UnknownTimeZone("Mars/Olympus_Mons".into()));
    }

    #[test]
    fn non_object_fails() {
        assert_eq!(
            Metadata::validate(json!([1, 2])),
            Err(MetadataError::NotAnObject)
        );
    }
}
