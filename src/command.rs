//! Command and status payloads exchanged over MQTT.
//!
//! Inbound commands are parsed tolerantly: a malformed payload or an
//! unknown action is reported as an error for the caller to log and
//! discard, never to crash on. Out-of-range speeds are clamped to [0, 100]
//! rather than rejected; clamping lives in one place ([`clamp_speed`]) so
//! the policy can be revisited without hunting call sites.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Highest accepted speed, in percent.
pub const MAX_SPEED: u8 = 100;

/// Default speed applied to a `start` command that carries none.
pub const DEFAULT_START_SPEED: u8 = 50;

#[derive(Debug, Error)]
pub enum CommandParseError {
    #[error("malformed command payload")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown action {0:?}")]
    UnknownAction(String),

    #[error("setSpeed command without a speed")]
    MissingSpeed,
}

/// A control command addressed to this train.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start { speed: Option<u8> },
    Stop,
    SetSpeed { speed: u8 },
    EmergencyStop,
}

/// On-the-wire shape: `{"action": "...", "speed": n}`. Speed arrives as a
/// float so senders that serialize `50.0` still parse.
#[derive(Debug, Deserialize)]
struct WireCommand {
    action: String,
    #[serde(default)]
    speed: Option<f64>,
}

impl Command {
    /// Parses a raw MQTT payload. Errors are diagnostic only; the caller
    /// logs and drops the message.
    pub fn parse(payload: &[u8]) -> Result<Self, CommandParseError> {
        let wire: WireCommand = serde_json::from_slice(payload)?;

        match wire.action.as_str() {
            "start" => Ok(Self::Start {
                speed: wire.speed.map(clamp_speed),
            }),
            "stop" => Ok(Self::Stop),
            "setSpeed" => match wire.speed {
                Some(speed) => Ok(Self::SetSpeed {
                    speed: clamp_speed(speed),
                }),
                None => Err(CommandParseError::MissingSpeed),
            },
            "emergencyStop" => Ok(Self::EmergencyStop),
            other => Err(CommandParseError::UnknownAction(other.to_string())),
        }
    }
}

/// Clamps a requested speed to [0, 100]. NaN maps to 0.
pub fn clamp_speed(raw: f64) -> u8 {
    if raw.is_nan() {
        return 0;
    }
    raw.clamp(0.0, MAX_SPEED as f64).round() as u8
}

/// Outbound status sample published to the status topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub train_id: String,
    pub speed: u8,
    pub voltage: f64,
    pub current: f64,
    pub position: String,
    /// Unix time in seconds at sampling.
    pub timestamp: u64,
    pub emergency: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusReport {
    /// Initial sample for a freshly assigned train: stationary, nominal
    /// supply voltage, position not yet known.
    pub fn new(train_id: impl Into<String>) -> Self {
        Self {
            train_id: train_id.into(),
            speed: 0,
            voltage: 12.0,
            current: 0.0,
            position: "unknown".to_string(),
            timestamp: unix_now(),
            emergency: false,
            error: None,
        }
    }

    /// Stamps the sample with the current time before publishing.
    pub fn touch(&mut self) {
        self.timestamp = unix_now();
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn parses_every_action() {
        assert_eq!(
            Command::parse(br#"{"action": "start"}"#).unwrap(),
            Command::Start { speed: None }
        );
        assert_eq!(
            Command::parse(br#"{"action": "start", "speed": 30}"#).unwrap(),
            Command::Start { speed: Some(30) }
        );
        assert_eq!(
            Command::parse(br#"{"action": "stop"}"#).unwrap(),
            Command::Stop
        );
        assert_eq!(
            Command::parse(br#"{"action": "setSpeed", "speed": 75.0}"#).unwrap(),
            Command::SetSpeed { speed: 75 }
        );
        assert_eq!(
            Command::parse(br#"{"action": "emergencyStop"}"#).unwrap(),
            Command::EmergencyStop
        );
    }

    #[test]
    fn out_of_range_speeds_are_clamped() {
        assert_eq!(
            Command::parse(br#"{"action": "setSpeed", "speed": 250}"#).unwrap(),
            Command::SetSpeed { speed: 100 }
        );
        assert_eq!(
            Command::parse(br#"{"action": "setSpeed", "speed": -10}"#).unwrap(),
            Command::SetSpeed { speed: 0 }
        );
    }

    #[test]
    fn malformed_and_unknown_payloads_are_errors() {
        assert!(matches!(
            Command::parse(b"not json"),
            Err(CommandParseError::Malformed(_))
        ));
        assert!(matches!(
            Command::parse(br#"{"action": "launch"}"#),
            Err(CommandParseError::UnknownAction(_))
        ));
        assert!(matches!(
            Command::parse(br#"{"action": "setSpeed"}"#),
            Err(CommandParseError::MissingSpeed)
        ));
    }

    #[test]
    fn status_report_defaults_and_serialization() {
        let report = StatusReport::new("t1");
        assert_eq!(report.speed, 0);
        assert_eq!(report.voltage, 12.0);
        assert_eq!(report.current, 0.0);
        assert_eq!(report.position, "unknown");
        assert!(!report.emergency);

        // The error field stays off the wire while empty.
        let json = serde_json::to_string(&report).unwrap();
        assert!(!json.contains("error"));
        assert!(json.contains("\"train_id\":\"t1\""));

        let round: StatusReport = serde_json::from_str(&json).unwrap();
        assert_eq!(round, report);
    }

    proptest! {
        #[test]
        fn clamp_always_lands_in_range(raw in proptest::num::f64::ANY) {
            let clamped = clamp_speed(raw);
            prop_assert!(clamped <= MAX_SPEED);
        }

        #[test]
        fn in_range_speeds_pass_through(speed in 0u8..=100) {
            let payload = format!(r#"{{"action": "setSpeed", "speed": {speed}}}"#);
            prop_assert_eq!(
                Command::parse(payload.as_bytes()).unwrap(),
                Command::SetSpeed { speed }
            );
        }
    }
}
