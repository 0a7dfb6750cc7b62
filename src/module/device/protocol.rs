//! Wire format of the sorting controller.
//!
//! Inbound: newline-terminated ASCII tokens. Outbound: single ASCII
//! bytes. The link layer transports these verbatim and never interprets
//! command semantics.

use crate::module::grading::SortCommand;

/// Inbound message kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMsg {
    /// "B" - the infra-red beam was broken by a piece entering the zone.
    BeamBroken,
    /// "L:<int>" - beam cleared, payload is the blocked duration in ms.
    DurationReport(u32),
    /// Anything else, passed through for display.
    StatusText(String),
}

impl InboundMsg {
    /// Parse one trimmed inbound line.
    ///
    /// Returns `None` for empty lines and for "L:" payloads that do not
    /// carry a readable integer (dropped by the caller with a log line).
    pub fn parse(line: &str) -> Option<InboundMsg> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        if line == "B" {
            return Some(InboundMsg::BeamBroken);
        }
        if let Some(payload) = line.strip_prefix("L:") {
            return match payload.trim().parse::<u32>() {
                Ok(ms) => Some(InboundMsg::DurationReport(ms)),
                Err(_) => None,
            };
        }
        Some(InboundMsg::StatusText(line.to_string()))
    }
}

/// Outbound commands.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceCommand {
    /// Select a sort gate.
    Gate(SortCommand),
    /// Run the conveyor continuously.
    Continuous,
    /// Arm the beam trigger.
    Trigger,
    /// Stop the conveyor.
    Stop,
}

impl DeviceCommand {
    /// Byte sent on the wire.
    pub fn to_byte(self) -> u8 {
        match self {
            DeviceCommand::Gate(cmd) => cmd.to_byte(),
            DeviceCommand::Continuous => b'C',
            DeviceCommand::Trigger => b'T',
            DeviceCommand::Stop => b'X',
        }
    }
}
