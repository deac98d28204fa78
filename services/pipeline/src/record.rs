//! Telemetry record wire shape and validation.
//!
//! Every message on the telemetry topic is a JSON object. Validation is done
//! field by field so a rejection names the offending field, and one bad
//! record never affects its neighbours in a batch.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Why a raw payload could not be turned into a [`TelemetryRecord`]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Payload is not a JSON object: {0}")]
    Malformed(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid value for {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// A validated telemetry record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Device identifier
    pub device_uuid: Uuid,
    /// Reported X position
    pub x_coord: f64,
    /// Reported Y position
    pub y_coord: f64,
    /// Time reported by the device, if any
    #[serde(default)]
    pub device_time: Option<DateTime<Utc>>,
    /// Time assigned by the ingesting edge
    pub system_time_utc: DateTime<Utc>,
}

impl TelemetryRecord {
    /// Validate a raw message payload
    pub fn from_slice(payload: &[u8]) -> Result<Self, ValidationError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| ValidationError::Malformed(e.to_string()))?;
        Self::from_value(&value)
    }

    /// Validate an already-parsed JSON value
    pub fn from_value(value: &Value) -> Result<Self, ValidationError> {
        let object = value
            .as_object()
            .ok_or_else(|| ValidationError::Malformed(format!("expected object, got {}", kind(value))))?;

        Ok(Self {
            device_uuid: device_uuid(object)?,
            x_coord: coordinate(object, "x_coord")?,
            y_coord: coordinate(object, "y_coord")?,
            device_time: optional_timestamp(object, "device_time")?,
            system_time_utc: optional_timestamp(object, "system_time_utc")?
                .ok_or(ValidationError::MissingField("system_time_utc"))?,
        })
    }

    /// Effective event time: the device clock when reported, else the edge clock
    pub fn event_time(&self) -> DateTime<Utc> {
        self.device_time.unwrap_or(self.system_time_utc)
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn device_uuid(object: &Map<String, Value>) -> Result<Uuid, ValidationError> {
    let field = "device_uuid";
    match object.get(field) {
        None | Some(Value::Null) => Err(ValidationError::MissingField(field)),
        Some(Value::String(raw)) => {
            Uuid::parse_str(raw.trim()).map_err(|e| ValidationError::InvalidField {
                field,
                reason: e.to_string(),
            })
        }
        Some(other) => Err(ValidationError::InvalidField {
            field,
            reason: format!("expected string, got {}", kind(other)),
        }),
    }
}

fn coordinate(object: &Map<String, Value>, field: &'static str) -> Result<f64, ValidationError> {
    match object.get(field) {
        None | Some(Value::Null) => Err(ValidationError::MissingField(field)),
        Some(Value::Number(number)) => number
            .as_f64()
            .filter(|v| v.is_finite())
            .ok_or_else(|| ValidationError::InvalidField {
                field,
                reason: format!("{} is not a finite number", number),
            }),
        Some(other) => Err(ValidationError::InvalidField {
            field,
            reason: format!("expected number, got {}", kind(other)),
        }),
    }
}

fn optional_timestamp(
    object: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<DateTime<Utc>>, ValidationError> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(raw)) => parse_timestamp(raw)
            .map(Some)
            .ok_or_else(|| ValidationError::InvalidField {
                field,
                reason: format!("'{}' is not an RFC 3339 timestamp", raw),
            }),
        Some(other) => Err(ValidationError::InvalidField {
            field,
            reason: format!("expected timestamp string, got {}", kind(other)),
        }),
    }
}

/// Parse an RFC 3339 timestamp; a timestamp without an offset is taken as UTC
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}
