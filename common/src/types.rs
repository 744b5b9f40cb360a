use serde::{Deserialize, Serialize};

/// Top-level phase of a water change cycle.
///
/// The numeric `code()` is what the dashboard receives and is stable across
/// releases; it must not be derived from declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TpaMasterState {
    Idle,
    ExtractionRunning,
    RepositionRunning,
    RefillRunning,
    BufferDosing,
    Completed,
}

impl TpaMasterState {
    pub fn code(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::ExtractionRunning => 1,
            Self::RepositionRunning => 2,
            Self::RefillRunning => 3,
            Self::BufferDosing => 4,
            Self::Completed => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::ExtractionRunning => "EXTRACTION_RUNNING",
            Self::RepositionRunning => "REPOSITION_RUNNING",
            Self::RefillRunning => "REFILL_RUNNING",
            Self::BufferDosing => "BUFFER_DOSING",
            Self::Completed => "COMPLETED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExtractionState {
    Idle,
    Running,
    Finished,
}

impl ExtractionState {
    pub fn code(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Running => 1,
            Self::Finished => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepositionState {
    Idle,
    WaitSafetyPause,
    TransferRanToAquarium,
    Finished,
}

impl RepositionState {
    pub fn code(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::WaitSafetyPause => 1,
            Self::TransferRanToAquarium => 2,
            Self::Finished => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::WaitSafetyPause => "WAIT_SAFETY_PAUSE",
            Self::TransferRanToAquarium => "TRANSFER_RAN_TO_AQUARIUM",
            Self::Finished => "FINISHED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefillState {
    Idle,
    StartDelay,
    Filling,
    Finished,
}

impl RefillState {
    pub fn code(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::StartDelay => 1,
            Self::Filling => 2,
            Self::Finished => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::StartDelay => "START_DELAY",
            Self::Filling => "FILLING",
            Self::Finished => "FINISHED",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BufferDosingState {
    #[default]
    Idle,
    Dosing,
    Finished,
}

impl BufferDosingState {
    pub fn code(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Dosing => 1,
            Self::Finished => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Dosing => "DOSING",
            Self::Finished => "FINISHED",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    #[serde(rename = "masterState")]
    pub master_state: &'static str,
    #[serde(rename = "masterStateCode")]
    pub master_state_code: u8,
    #[serde(rename = "extractionState")]
    pub extraction_state: &'static str,
    #[serde(rename = "repositionState")]
    pub reposition_state: &'static str,
    #[serde(rename = "refillState")]
    pub refill_state: &'static str,
    #[serde(rename = "bufferState")]
    pub buffer_state: &'static str,
    #[serde(rename = "aquariumVolumeL")]
    pub aquarium_volume_l: f32,
    #[serde(rename = "extractionPercent")]
    pub extraction_percent: f32,
    #[serde(rename = "extractionVolumeL")]
    pub extraction_volume_l: f32,
    #[serde(rename = "extractionDurationMs")]
    pub extraction_duration_ms: u64,
    #[serde(rename = "repositionVolumeL")]
    pub reposition_volume_l: f32,
    #[serde(rename = "bufferVolumeMl")]
    pub buffer_volume_ml: u16,
    #[serde(rename = "extractionPumpOn")]
    pub extraction_pump_on: bool,
    #[serde(rename = "ranLevelFull")]
    pub ran_level_full: bool,
    #[serde(rename = "ranLevelPercent")]
    pub ran_level_percent: u8,
    #[serde(rename = "refillAlert")]
    pub refill_alert: bool,
    #[serde(rename = "serviceMode")]
    pub service_mode: bool,
    #[serde(rename = "cloudConnected")]
    pub cloud_connected: bool,
    #[serde(rename = "scheduleEnabled")]
    pub schedule_enabled: bool,
    #[serde(rename = "scheduleDay")]
    pub schedule_day: u8,
    #[serde(rename = "scheduleHour")]
    pub schedule_hour: u8,
    #[serde(rename = "scheduleMinute")]
    pub schedule_minute: u8,
    #[serde(rename = "scheduleFrequency")]
    pub schedule_frequency: &'static str,
    #[serde(rename = "lastRunEpoch")]
    pub last_run_epoch: Option<i64>,
    #[serde(rename = "nextLocalRunEpoch")]
    pub next_local_run_epoch: Option<i64>,
    #[serde(rename = "cyclesCompleted")]
    pub cycles_completed: u32,
    #[serde(rename = "timeSynced")]
    pub time_synced: bool,
    pub timezone: String,
}

/// Compact snapshot published on the retained state topic.
#[derive(Debug, Clone, Serialize)]
pub struct TpaStatePayload {
    pub state: &'static str,
    #[serde(rename = "stateCode")]
    pub state_code: u8,
    #[serde(rename = "extractionVolumeL")]
    pub extraction_volume_l: f32,
    #[serde(rename = "repositionVolumeL")]
    pub reposition_volume_l: f32,
    #[serde(rename = "bufferVolumeMl")]
    pub buffer_volume_ml: u16,
    #[serde(rename = "levelPercent")]
    pub level_percent: u8,
    #[serde(rename = "refillAlert")]
    pub refill_alert: bool,
    #[serde(rename = "serviceMode")]
    pub service_mode: bool,
}
