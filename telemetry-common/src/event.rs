//! Wire schema of the telemetry and deletion topics, and the validator that
//! splits raw telemetry payloads into valid events and dead-letter payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const PURGE_ACTION: &str = "PURGE";

/// A validated thermostat reading. Only the validator constructs these, so a
/// `TelemetryEvent` always satisfies the validity invariant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEvent {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub data: SensorReading,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorReading {
    pub current_temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heating_status: Option<bool>,
}

impl TelemetryEvent {
    /// Encode back to the inbound wire shape, omitting absent optional fields.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn heating_status(&self) -> bool {
        self.data.heating_status.unwrap_or(false)
    }
}

/// The permissive shape we parse into before checking the invariant, so that
/// a missing field is a validation failure and not a parse failure.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTelemetryEvent {
    device_id: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    data: Option<RawSensorReading>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSensorReading {
    current_temperature: Option<f64>,
    target_temperature: Option<f64>,
    heating_status: Option<bool>,
}

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("payload is not a valid telemetry document: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("deviceId is missing or blank")]
    BlankDeviceId,
    #[error("deviceId contains a NUL byte")]
    NulInDeviceId,
    #[error("timestamp is missing")]
    MissingTimestamp,
    #[error("data is missing")]
    MissingReading,
    #[error("data.currentTemperature is missing")]
    MissingCurrentTemperature,
}

impl ValidationError {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationError::Malformed(_) => "malformed",
            ValidationError::BlankDeviceId => "blank_device_id",
            ValidationError::NulInDeviceId => "nul_in_device_id",
            ValidationError::MissingTimestamp => "missing_timestamp",
            ValidationError::MissingReading => "missing_reading",
            ValidationError::MissingCurrentTemperature => "missing_current_temperature",
        }
    }
}

/// Outcome of validating one inbound payload: exactly one of the two outputs.
#[derive(Debug)]
pub enum Validation {
    Valid(TelemetryEvent),
    DeadLetter {
        payload: Vec<u8>,
        reason: ValidationError,
    },
}

/// Validate a raw payload. Total over all byte input: malformed encodings and
/// invariant violations both come back as `Validation::DeadLetter` carrying the
/// unmodified payload.
pub fn validate(payload: &[u8]) -> Validation {
    match parse(payload) {
        Ok(event) => {
            metrics::counter!("telemetry_valid").increment(1);
            Validation::Valid(event)
        }
        Err(reason) => {
            metrics::counter!("telemetry_invalid", "reason" => reason.as_str()).increment(1);
            Validation::DeadLetter {
                payload: payload.to_vec(),
                reason,
            }
        }
    }
}

fn parse(payload: &[u8]) -> Result<TelemetryEvent, ValidationError> {
    let raw: RawTelemetryEvent = serde_json::from_slice(payload)?;

    let device_id = match raw.device_id {
        Some(id) if !id.trim().is_empty() => id,
        _ => return Err(ValidationError::BlankDeviceId),
    };
    if device_id.contains('\0') {
        return Err(ValidationError::NulInDeviceId);
    }
    let timestamp = raw.timestamp.ok_or(ValidationError::MissingTimestamp)?;
    let data = raw.data.ok_or(ValidationError::MissingReading)?;
    let current_temperature = data
        .current_temperature
        .ok_or(ValidationError::MissingCurrentTemperature)?;

    Ok(TelemetryEvent {
        device_id,
        timestamp,
        data: SensorReading {
            current_temperature,
            target_temperature: data.target_temperature,
            heating_status: data.heating_status,
        },
    })
}

/// A request to erase a device's history. Anything that does not parse is
/// treated the same as a request with a non-PURGE action: it is ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionRequest {
    pub device_id: Option<String>,
    pub action: Option<String>,
}

impl DeletionRequest {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        serde_json::from_slice(payload).ok()
    }

    pub fn is_purge(&self) -> bool {
        self.action.as_deref() == Some(PURGE_ACTION)
    }
}
