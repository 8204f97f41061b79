// src/communication/status.rs - GRBL real-time status reports
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Controller state as shown to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineState {
    Idle,
    Run,
    Hold,
    Jog,
    Alarm,
    Door,
    Check,
    Home,
    Sleep,
    /// No open link.
    Disconnected,
    /// Link open, no status report received yet.
    Connecting,
}

impl FromStr for MachineState {
    type Err = StatusError;

    /// Parse a reported state name. Substates (`Hold:0`, `Door:1`) keep only the name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.split(':').next().unwrap_or_default();
        match name {
            "Idle" => Ok(Self::Idle),
            "Run" => Ok(Self::Run),
            "Hold" => Ok(Self::Hold),
            "Jog" => Ok(Self::Jog),
            "Alarm" => Ok(Self::Alarm),
            "Door" => Ok(Self::Door),
            "Check" => Ok(Self::Check),
            "Home" => Ok(Self::Home),
            "Sleep" => Ok(Self::Sleep),
            _ => Err(StatusError::UnknownState(s.to_string())),
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StatusError {
    #[error("status frame must be enclosed in '<' and '>': {0}")]
    MissingDelimiters(String),
    #[error("unknown machine state '{0}'")]
    UnknownState(String),
    #[error("status frame has no MPos/WPos field")]
    MissingPosition,
    #[error("malformed field '{0}'")]
    MalformedField(String),
}

/// Last known machine telemetry. Always replaced as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineStatus {
    pub state: MachineState,
    pub position: [f64; 3],
    pub feed: f64,
    pub spindle: f64,
}

impl MachineStatus {
    pub fn disconnected() -> Self {
        Self::with_state(MachineState::Disconnected)
    }

    pub fn connecting() -> Self {
        Self::with_state(MachineState::Connecting)
    }

    fn with_state(state: MachineState) -> Self {
        Self { state, position: [0.0; 3], feed: 0.0, spindle: 0.0 }
    }

    /// Parse `<State|MPos:x,y,z|FS:feed,spindle>`. `WPos` is accepted in place of `MPos`.
    /// Unknown fields are ignored.
    pub fn parse(frame: &str) -> Result<Self, StatusError> {
        let body = frame
            .trim()
            .strip_prefix('<')
            .and_then(|s| s.strip_suffix('>'))
            .ok_or_else(|| StatusError::MissingDelimiters(frame.to_string()))?;

        let mut fields = body.split('|');
        let state: MachineState = fields.next().unwrap_or_default().parse()?;

        let mut position = None;
        let mut feed = 0.0;
        let mut spindle = 0.0;
        for field in fields {
            if let Some(pos) = field.strip_prefix("MPos:").or_else(|| field.strip_prefix("WPos:")) {
                let values = parse_numbers(field, pos)?;
                let &[x, y, z] = values.as_slice() else {
                    return Err(StatusError::MalformedField(field.to_string()));
                };
                position = Some([x, y, z]);
            } else if let Some(fs) = field.strip_prefix("FS:") {
                let values = parse_numbers(field, fs)?;
                let &[f, s] = values.as_slice() else {
                    return Err(StatusError::MalformedField(field.to_string()));
                };
                feed = f;
                spindle = s;
            } else if let Some(f) = field.strip_prefix("F:") {
                let &[f] = parse_numbers(field, f)?.as_slice() else {
                    return Err(StatusError::MalformedField(field.to_string()));
                };
                feed = f;
            }
        }

        Ok(Self {
            state,
            position: position.ok_or(StatusError::MissingPosition)?,
            feed,
            spindle,
        })
    }
}

impl Default for MachineStatus {
    fn default() -> Self {
        Self::disconnected()
    }
}

/// Comma separated finite numbers; `NaN` and `inf` are rejected.
fn parse_numbers(field: &str, list: &str) -> Result<Vec<f64>, StatusError> {
    list.split(',')
        .map(|v| match v.trim().parse::<f64>() {
            Ok(n) if n.is_finite() => Ok(n),
            _ => Err(StatusError::MalformedField(field.to_string())),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_idle_frame() {
        let status = MachineStatus::parse("<Idle|MPos:1.000,2.000,3.000|FS:500,1000>").unwrap();
        assert_eq!(status.state, MachineState::Idle);
        assert_eq!(status.position, [1.0, 2.0, 3.0]);
        assert_eq!(status.feed, 500.0);
        assert_eq!(status.spindle, 1000.0);
    }

    #[test]
    fn test_parse_wpos_and_extra_fields() {
        let status = MachineStatus::parse("<Hold:0|WPos:-1.5,0.000,12.25|Bf:15,128|FS:0,0|WCO:0,0,0|Ov:100,100,100>").unwrap();
        assert_eq!(status.state, MachineState::Hold);
        assert_eq!(status.position, [-1.5, 0.0, 12.25]);
    }

    #[test]
    fn test_parse_feed_only_field() {
        let status = MachineStatus::parse("<Jog|MPos:0,0,0|F:1200>").unwrap();
        assert_eq!(status.state, MachineState::Jog);
        assert_eq!(status.feed, 1200.0);
        assert_eq!(status.spindle, 0.0);
    }

    #[test]
    fn test_rejects_malformed_frames() {
        assert!(matches!(
            MachineStatus::parse("<Idle|MPos:1,2,3|FS:0,0"),
            Err(StatusError::MissingDelimiters(_))
        ));
        assert!(matches!(MachineStatus::parse("Idle|MPos:1,2,3>"), Err(StatusError::MissingDelimiters(_))));
        assert!(matches!(MachineStatus::parse("<Dancing|MPos:1,2,3>"), Err(StatusError::UnknownState(_))));
        assert!(matches!(MachineStatus::parse("<Idle|FS:0,0>"), Err(StatusError::MissingPosition)));
        assert!(matches!(MachineStatus::parse("<Idle|MPos:1,x,3>"), Err(StatusError::MalformedField(_))));
        assert!(matches!(MachineStatus::parse("<Idle|MPos:1,2>"), Err(StatusError::MalformedField(_))));
        assert!(matches!(MachineStatus::parse("<>"), Err(StatusError::UnknownState(_))));
    }

    #[test]
    fn test_rejects_non_finite_numbers() {
        assert!(matches!(MachineStatus::parse("<Idle|MPos:NaN,inf,0>"), Err(StatusError::MalformedField(_))));
        assert!(matches!(MachineStatus::parse("<Idle|MPos:0,0,0|FS:-inf,0>"), Err(StatusError::MalformedField(_))));
        assert!(matches!(MachineStatus::parse("<Idle|MPos:0,0,0|F:nan>"), Err(StatusError::MalformedField(_))));
    }

    #[test]
    fn test_state_names() {
        assert_eq!("Door:1".parse::<MachineState>().unwrap(), MachineState::Door);
        assert_eq!("Sleep".parse::<MachineState>().unwrap(), MachineState::Sleep);
        assert_eq!(MachineState::Alarm.to_string(), "Alarm");
        assert_eq!(MachineStatus::default().state, MachineState::Disconnected);
    }
}
