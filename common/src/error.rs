use thiserror::Error;

use crate::action::LogLevel;

/// Why a flow or cycle declined to start. The engine reports these as log
/// actions; the shell maps them onto HTTP status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StartRefusal {
    #[error("computed pump duration is zero, check volume settings")]
    ZeroDuration,
    #[error("service mode is active, actuators are locked out")]
    ServiceMode,
    #[error("cycle already in progress ({0})")]
    Busy(&'static str),
}

impl StartRefusal {
    pub fn log_level(self) -> LogLevel {
        match self {
            Self::ZeroDuration => LogLevel::Error,
            Self::ServiceMode | Self::Busy(_) => LogLevel::Warning,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SettingsError {
    #[error("aquarium volume {0} L out of range (0, 5000]")]
    TotalVolume(f32),
    #[error("extraction percent {0} out of range (0, 50]")]
    ExtractionPercent(f32),
    #[error("reposition volume {0} L is not a number")]
    RepositionVolume(f32),
    #[error("buffer volume {0} mL out of range 0-999")]
    BufferVolume(i32),
    #[error("schedule hour {0} out of range 0-23")]
    ScheduleHour(i32),
    #[error("schedule minute {0} out of range 0-59")]
    ScheduleMinute(i32),
    #[error("schedule day {0} out of range 1-31")]
    ScheduleDay(i32),
    #[error("schedule frequency {0} out of range 0-3")]
    ScheduleFrequency(i32),
    #[error("unknown setting '{0}'")]
    UnknownField(String),
    #[error("invalid value '{value}' for {field}")]
    Unparseable { field: &'static str, value: String },
}
