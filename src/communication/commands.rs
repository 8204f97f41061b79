// src/communication/commands.rs - GRBL control commands
use std::fmt;

use serde::{Deserialize, Serialize};

/// Single-byte commands that GRBL acts on immediately, outside the line buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealtimeCommand {
    /// `?`
    StatusQuery,
    /// 0x85, feed hold / jog cancel.
    FeedHold,
    /// `~`
    CycleStart,
    /// 0x18 (ctrl-x)
    SoftReset,
}

impl RealtimeCommand {
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::StatusQuery => b'?',
            Self::FeedHold => 0x85,
            Self::CycleStart => b'~',
            Self::SoftReset => 0x18,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Line commands issued by the operator panel.
#[derive(Debug, Clone, PartialEq)]
pub enum MachineCommand {
    /// `$H`
    Home,
    /// `$X`, clear an alarm lock.
    Unlock,
    /// `$$`
    DumpSettings,
    /// Set work zero at the current position.
    ZeroWorkOffset,
    /// Incremental jog in mm.
    Jog { axis: Axis, delta: f64, feed: f64 },
    /// Console input, sent as typed.
    Raw(String),
}

impl MachineCommand {
    /// Text of the command without line terminator.
    pub fn to_line(&self) -> String {
        match self {
            Self::Home => "$H".to_string(),
            Self::Unlock => "$X".to_string(),
            Self::DumpSettings => "$$".to_string(),
            Self::ZeroWorkOffset => "G10 L20 P1 X0 Y0 Z0".to_string(),
            Self::Jog { axis, delta, feed } => format!("$J=G91 G21 {axis}{delta:+} F{feed}"),
            Self::Raw(line) => line.clone(),
        }
    }
}
