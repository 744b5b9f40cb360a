pub mod action;
pub mod buffer;
pub mod config;
pub mod error;
pub mod extraction;
pub mod pump;
pub mod refill;
pub mod reposition;
pub mod schedule;
pub mod settings;
pub mod topics;
pub mod tpa;
pub mod types;
pub mod ui;

pub use action::{LogLevel, Output, TelemetryValue, TpaAction};
pub use config::{NetworkConfig, PersistedSettings, PinConfig, RuntimeConfig, TpaConfig};
pub use error::{SettingsError, StartRefusal};
pub use pump::PumpTiming;
pub use schedule::{LocalSchedule, LocalScheduler, ScheduleFrequency};
pub use settings::{SettingField, SettingUpdate};
pub use topics::*;
pub use tpa::{TpaEngine, TriggerSource};
pub use types::{
    BufferDosingState, ControllerStatus, ExtractionState, RefillState, RepositionState,
    TpaMasterState, TpaStatePayload,
};
pub use ui::{InputEvent, LocalUi, PeripheralRequest, UiResponse};
