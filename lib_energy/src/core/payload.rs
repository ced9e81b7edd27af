//! # Payload Decoding
//!
//! Turns a raw MQTT message into a [`Sample`]. The wire format is a JSON
//! record:
//!
//! ```json
//! {"utctimestamp": 1700000000, "measures": {"Load_0_30001": 1520.0, "Load_0_30000": 310.5}}
//! ```
//!
//! A device's cumulative reading is the sum of the configured registers
//! divided by the configured divisor (raw Wh to kWh with the default 1000).

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

use crate::configs::{DecodeStrictness, PayloadProfile, RELEVANCE_MARKER};

/// One decoded reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Seconds since the Unix epoch.
    pub utc_timestamp: i64,
    /// Cumulative counter value in kWh.
    pub cumulative_kwh: f64,
}

/// A sample together with the per-register values it was built from.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedReading {
    pub sample: Sample,
    /// `(register key, kWh)` for every register that contributed.
    pub registers: Vec<(String, f64)>,
    /// Configured registers absent from a leniently decoded record.
    pub unavailable: Vec<String>,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not a valid reading record: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("register '{0}' is missing from measures")]
    MissingRegister(String),
    #[error("register '{0}' is not numeric")]
    NonNumericRegister(String),
    #[error("none of the configured registers are present")]
    NoRegisters,
    #[error("topic '{0}' does not name a device")]
    NoDevice(String),
}

#[derive(Deserialize)]
struct RawRecord {
    utctimestamp: i64,
    measures: HashMap<String, Value>,
}

/// True when the topic belongs to the consumption feed.
pub fn is_relevant(topic: &str) -> bool {
    topic.contains(RELEVANCE_MARKER)
}

/// Device name: the path segment right after `energy/consumption/`.
pub fn device_from_topic(topic: &str) -> Result<&str, DecodeError> {
    let start = topic
        .find(RELEVANCE_MARKER)
        .map(|i| i + RELEVANCE_MARKER.len())
        .ok_or_else(|| DecodeError::NoDevice(topic.to_string()))?;
    let rest = &topic[start..];
    let name = rest.split('/').next().unwrap_or_default();
    if name.is_empty() {
        return Err(DecodeError::NoDevice(topic.to_string()));
    }
    Ok(name)
}

/// Decodes a payload according to `profile`.
pub fn decode_payload(payload: &[u8], profile: &PayloadProfile) -> Result<DecodedReading, DecodeError> {
    let record: RawRecord = serde_json::from_slice(payload)?;

    let mut registers = Vec::with_capacity(profile.register_keys.len());
    let mut unavailable = Vec::new();

    for key in &profile.register_keys {
        match record.measures.get(key).map(Value::as_f64) {
            Some(Some(raw)) => registers.push((key.clone(), raw / profile.divisor)),
            Some(None) if profile.strictness == DecodeStrictness::Strict => {
                return Err(DecodeError::NonNumericRegister(key.clone()));
            }
            None if profile.strictness == DecodeStrictness::Strict => {
                return Err(DecodeError::MissingRegister(key.clone()));
            }
            _ => unavailable.push(key.clone()),
        }
    }

    if registers.is_empty() {
        return Err(DecodeError::NoRegisters);
    }

    let cumulative_kwh = registers.iter().map(|(_, kwh)| kwh).sum();
    Ok(DecodedReading {
        sample: Sample {
            utc_timestamp: record.utctimestamp,
            cumulative_kwh,
        },
        registers,
        unavailable,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lenient() -> PayloadProfile {
        PayloadProfile {
            strictness: DecodeStrictness::Lenient,
            ..PayloadProfile::default()
        }
    }

    #[test]
    fn test_sums_and_scales_configured_registers() {
        let payload = json!({
            "utctimestamp": 1_700_000_000,
            "measures": {"Load_0_30001": 1500.0, "Load_0_30000": 250, "Other": 9.0}
        })
        .to_string();
        let reading = decode_payload(payload.as_bytes(), &PayloadProfile::default()).unwrap();
        assert_eq!(reading.sample.utc_timestamp, 1_700_000_000);
        assert!((reading.sample.cumulative_kwh - 1.75).abs() < 1e-12);
        assert_eq!(reading.registers.len(), 2);
        assert!(reading.unavailable.is_empty());
    }

    #[test]
    fn test_single_register_deployment() {
        let profile = PayloadProfile::new(vec!["Load_0_30001".into()], 1000.0, DecodeStrictness::Strict).unwrap();
        let payload = br#"{"utctimestamp": 60, "measures": {"Load_0_30001": 4200}}"#;
        let reading = decode_payload(payload, &profile).unwrap();
        assert!((reading.sample.cumulative_kwh - 4.2).abs() < 1e-12);
    }

    #[test]
    fn test_malformed_payload_is_rejected() {
        let err = decode_payload(b"{not json", &PayloadProfile::default()).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));

        let err = decode_payload(br#"{"measures": {}}"#, &PayloadProfile::default()).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn test_strict_rejects_missing_register() {
        let payload = br#"{"utctimestamp": 1, "measures": {"Load_0_30001": 10}}"#;
        let err = decode_payload(payload, &PayloadProfile::default()).unwrap_err();
        assert!(matches!(err, DecodeError::MissingRegister(k) if k == "Load_0_30000"));
    }

    #[test]
    fn test_strict_rejects_non_numeric_register() {
        let payload = br#"{"utctimestamp": 1, "measures": {"Load_0_30001": "n/a", "Load_0_30000": 1}}"#;
        let err = decode_payload(payload, &PayloadProfile::default()).unwrap_err();
        assert!(matches!(err, DecodeError::NonNumericRegister(k) if k == "Load_0_30001"));
    }

    #[test]
    fn test_lenient_tolerates_partial_record() {
        let payload = br#"{"utctimestamp": 1, "measures": {"Load_0_30000": 2000}}"#;
        let reading = decode_payload(payload, &lenient()).unwrap();
        assert!((reading.sample.cumulative_kwh - 2.0).abs() < 1e-12);
        assert_eq!(reading.unavailable, vec!["Load_0_30001".to_string()]);
    }

    #[test]
    fn test_lenient_still_needs_one_register() {
        let payload = br#"{"utctimestamp": 1, "measures": {}}"#;
        let err = decode_payload(payload, &lenient()).unwrap_err();
        assert!(matches!(err, DecodeError::NoRegisters));
    }

    #[test]
    fn test_device_from_topic() {
        let topic = "energy/consumption/gw-07/message/data/71435500-6791-11ce-97c6-313131303230";
        assert_eq!(device_from_topic(topic).unwrap(), "gw-07");
        assert!(is_relevant(topic));

        assert!(matches!(device_from_topic("energy/consumption//message"), Err(DecodeError::NoDevice(_))));
        assert!(matches!(device_from_topic("energy/production/gw-07"), Err(DecodeError::NoDevice(_))));
        assert!(!is_relevant("energy/production/gw-07/message"));
    }
}
