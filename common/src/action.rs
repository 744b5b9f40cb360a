use serde::{Deserialize, Serialize};

use crate::topics::Channel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Output {
    ExtractionPump,
    RepositionPump,
    BufferPump,
    RanValve,
}

impl Output {
    pub const ALL: [Output; 4] = [
        Self::ExtractionPump,
        Self::RepositionPump,
        Self::BufferPump,
        Self::RanValve,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExtractionPump => "EXTRACTION_PUMP",
            Self::RepositionPump => "REPOSITION_PUMP",
            Self::BufferPump => "BUFFER_PUMP",
            Self::RanValve => "RAN_VALVE",
        }
    }

    pub fn channel(self) -> Channel {
        match self {
            Self::ExtractionPump => Channel::ExtractionPump,
            Self::RepositionPump => Channel::RepositionPump,
            Self::BufferPump => Channel::BufferPump,
            Self::RanValve => Channel::RanValve,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Critical,
    Success,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
            Self::Success => "success",
        }
    }

    pub fn is_error_class(self) -> bool {
        matches!(self, Self::Error | Self::Critical)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryValue {
    Int(i64),
    Float(f32),
    Flag(bool),
    Text(String),
}

impl TelemetryValue {
    pub fn to_payload(&self) -> String {
        match self {
            Self::Int(value) => value.to_string(),
            Self::Float(value) => format!("{value:.2}"),
            Self::Flag(value) => if *value { "1" } else { "0" }.to_string(),
            Self::Text(value) => value.clone(),
        }
    }
}

/// Side effects requested by the engine. The firmware shell executes them in
/// order; the engine never touches hardware or the network itself.
#[derive(Debug, Clone, PartialEq)]
pub enum TpaAction {
    SetOutput { output: Output, on: bool },
    Publish { channel: Channel, value: TelemetryValue },
    Log { level: LogLevel, message: String },
}

impl TpaAction {
    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        Self::Log {
            level,
            message: message.into(),
        }
    }

    pub fn publish(channel: Channel, value: TelemetryValue) -> Self {
        Self::Publish { channel, value }
    }

    pub fn is_error_log(&self) -> bool {
        matches!(self, Self::Log { level, .. } if level.is_error_class())
    }
}

/// Drives an output and mirrors its new state to the dashboard.
pub(crate) fn drive(output: Output, on: bool, actions: &mut Vec<TpaAction>) {
    actions.push(TpaAction::SetOutput { output, on });
    actions.push(TpaAction::publish(output.channel(), TelemetryValue::Flag(on)));
}

pub(crate) fn publish_code(channel: Channel, code: u8, actions: &mut Vec<TpaAction>) {
    actions.push(TpaAction::publish(channel, TelemetryValue::Int(code.into())));
}
