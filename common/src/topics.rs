pub const TOPIC_CONTROLLER_STATE: &str = "aquarium/controller/state";
pub const TOPIC_CONTROLLER_EVENT: &str = "aquarium/controller/event";
pub const TOPIC_CONTROLLER_STATUS: &str = "aquarium/controller/status";

pub const TOPIC_CMD_TPA_START: &str = "aquarium/cmnd/tpa/start";
pub const TOPIC_CMD_TPA_SCHEDULE: &str = "aquarium/cmnd/tpa/schedule";
pub const TOPIC_CMD_BUFFER_START: &str = "aquarium/cmnd/buffer/start";
pub const TOPIC_CMD_ALERT_RESET: &str = "aquarium/cmnd/alert/reset";
pub const TOPIC_CMD_INPUT: &str = "aquarium/cmnd/input";
pub const TOPIC_CMD_SETTINGS_PREFIX: &str = "aquarium/cmnd/settings/";

/// Dashboard telemetry channels. Each maps to one retained topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    MasterState,
    ExtractionState,
    RepositionState,
    RefillState,
    BufferState,
    ExtractionPump,
    RepositionPump,
    BufferPump,
    RanValve,
    AquariumVolume,
    ExtractionPercent,
    ExtractionVolume,
    RepositionVolume,
    BufferVolume,
    LevelPercent,
    RefillAlert,
    ServiceMode,
    ScheduleEnabled,
    ScheduleDay,
    ScheduleHour,
    ScheduleMinute,
    ScheduleFrequency,
}

impl Channel {
    pub fn topic(self) -> &'static str {
        match self {
            Self::MasterState => "aquarium/tpa/master_state",
            Self::ExtractionState => "aquarium/tpa/extraction_state",
            Self::RepositionState => "aquarium/tpa/reposition_state",
            Self::RefillState => "aquarium/tpa/refill_state",
            Self::BufferState => "aquarium/tpa/buffer_state",
            Self::ExtractionPump => "aquarium/actuator/extraction_pump",
            Self::RepositionPump => "aquarium/actuator/reposition_pump",
            Self::BufferPump => "aquarium/actuator/buffer_pump",
            Self::RanValve => "aquarium/actuator/ran_valve",
            Self::AquariumVolume => "aquarium/settings/aquarium_volume",
            Self::ExtractionPercent => "aquarium/settings/extraction_percent",
            Self::ExtractionVolume => "aquarium/tpa/extraction_volume",
            Self::RepositionVolume => "aquarium/settings/reposition_volume",
            Self::BufferVolume => "aquarium/settings/buffer_volume",
            Self::LevelPercent => "aquarium/ran/level_percent",
            Self::RefillAlert => "aquarium/ran/refill_alert",
            Self::ServiceMode => "aquarium/settings/service_mode",
            Self::ScheduleEnabled => "aquarium/schedule/enabled",
            Self::ScheduleDay => "aquarium/schedule/day",
            Self::ScheduleHour => "aquarium/schedule/hour",
            Self::ScheduleMinute => "aquarium/schedule/minute",
            Self::ScheduleFrequency => "aquarium/schedule/frequency",
        }
    }
}
