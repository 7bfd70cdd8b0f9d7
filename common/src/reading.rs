//! The per-tick sensor reading, its upload wire format, and the server
//! response classification.

use serde::Serialize;

use crate::config::DeviceIdentity;

/// One sampling tick's output. The heart rate is always present (real or
/// simulated); the temperature is `None` exactly when the probe was absent
/// or returned an out-of-range value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    pub temperature_c: Option<f32>,
    pub heart_rate_bpm: u16,
    pub temperature_real: bool,
    pub heart_rate_real: bool,
}

/// Body of the monitoring POST. Field names are fixed by the backend
/// schema; a missing temperature serializes as `null`, never as 0.
#[derive(Debug, Serialize)]
pub struct UploadPayload<'a> {
    pub collar_id: &'a str,
    pub temperatura: Option<f32>,
    pub nombre_vaca: &'a str,
    pub pulsaciones: u16,
    pub mac_collar: &'a str,
}

impl<'a> UploadPayload<'a> {
    pub fn new(reading: &SensorReading, identity: &'a DeviceIdentity) -> Self {
        Self {
            collar_id: &identity.collar_id,
            temperatura: reading.temperature_c,
            nombre_vaca: &identity.cow_name,
            pulsaciones: reading.heart_rate_bpm,
            mac_collar: &identity.mac_address,
        }
    }
}

/// Classified server response to an upload. Only logging keys off the
/// distinction; nothing here triggers a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Accepted(u16),
    /// 401: the API key is wrong. Operator action, not a retry, fixes this.
    Unauthorized,
    /// 400: the payload did not match the schema; a firmware bug.
    InvalidPayload,
    /// 500: the backend fell over.
    ServerError,
    Rejected(u16),
}

impl UploadOutcome {
    pub fn from_status(status: u16) -> Self {
        match status {
            200..=299 => Self::Accepted(status),
            401 => Self::Unauthorized,
            400 => Self::InvalidPayload,
            500 => Self::ServerError,
            other => Self::Rejected(other),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

impl core::fmt::Display for UploadOutcome {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Accepted(code) => write!(f, "accepted (HTTP {code})"),
            Self::Unauthorized => write!(f, "unauthorized: check the API key"),
            Self::InvalidPayload => write!(f, "rejected as invalid payload"),
            Self::ServerError => write!(f, "server error"),
            Self::Rejected(code) => write!(f, "rejected (HTTP {code})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            collar_id: "collar-007".to_string(),
            cow_name: "Sofia".to_string(),
            mac_address: "AA:BB:CC:DD:EE:FF".to_string(),
        }
    }

    #[test]
    fn payload_serializes_with_backend_field_names() {
        let reading = SensorReading {
            temperature_c: Some(38.5),
            heart_rate_bpm: 72,
            temperature_real: true,
            heart_rate_real: true,
        };
        let identity = identity();
        let json = serde_json::to_string(&UploadPayload::new(&reading, &identity)).unwrap();

        assert_eq!(
            json,
            r#"{"collar_id":"collar-007","temperatura":38.5,"nombre_vaca":"Sofia","pulsaciones":72,"mac_collar":"AA:BB:CC:DD:EE:FF"}"#
        );
    }

    #[test]
    fn missing_temperature_encodes_as_null() {
        let reading = SensorReading {
            temperature_c: None,
            heart_rate_bpm: 65,
            temperature_real: false,
            heart_rate_real: false,
        };
        let identity = identity();
        let json = serde_json::to_string(&UploadPayload::new(&reading, &identity)).unwrap();

        assert!(json.contains(r#""temperatura":null"#));
        assert!(!json.contains(r#""temperatura":0"#));
    }

    #[test]
    fn statuses_classify_distinctly() {
        assert_eq!(UploadOutcome::from_status(200), UploadOutcome::Accepted(200));
        assert_eq!(UploadOutcome::from_status(204), UploadOutcome::Accepted(204));
        assert_eq!(UploadOutcome::from_status(401), UploadOutcome::Unauthorized);
        assert_eq!(UploadOutcome::from_status(400), UploadOutcome::InvalidPayload);
        assert_eq!(UploadOutcome::from_status(500), UploadOutcome::ServerError);
        assert_eq!(UploadOutcome::from_status(503), UploadOutcome::Rejected(503));

        assert!(UploadOutcome::from_status(200).is_success());
        assert!(!UploadOutcome::from_status(401).is_success());
        assert_ne!(UploadOutcome::from_status(401), UploadOutcome::from_status(400));
    }
}
