use std::str::FromStr;

use crate::{
    action::{LogLevel, TpaAction},
    settings::SettingUpdate,
    tpa::TpaEngine,
};

pub const PAGE_COUNT: u8 = 4;
const REPOSITION_STEP_L: f32 = 0.1;
const BUFFER_STEP_ML: i32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    PageTap,
    PageLongPress,
    UpTap,
    DownTap,
    AlertResetTap,
    AlertResetLongPress,
    RtcResetTap,
    PhCalLongPress,
    ServiceModeLongPress,
}

impl InputEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PageTap => "page_tap",
            Self::PageLongPress => "page_long_press",
            Self::UpTap => "up_tap",
            Self::DownTap => "down_tap",
            Self::AlertResetTap => "alert_reset_tap",
            Self::AlertResetLongPress => "alert_reset_long_press",
            Self::RtcResetTap => "rtc_reset_tap",
            Self::PhCalLongPress => "ph_cal_long_press",
            Self::ServiceModeLongPress => "service_mode_long_press",
        }
    }
}

impl FromStr for InputEvent {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let event = match value.trim().to_ascii_lowercase().as_str() {
            "page_tap" => Self::PageTap,
            "page_long_press" => Self::PageLongPress,
            "up_tap" => Self::UpTap,
            "down_tap" => Self::DownTap,
            "alert_reset_tap" => Self::AlertResetTap,
            "alert_reset_long_press" => Self::AlertResetLongPress,
            "rtc_reset_tap" => Self::RtcResetTap,
            "ph_cal_long_press" => Self::PhCalLongPress,
            "service_mode_long_press" => Self::ServiceModeLongPress,
            other => return Err(format!("unknown input event '{other}'")),
        };
        Ok(event)
    }
}

/// Field selected on the schedule page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleField {
    Day,
    Hour,
    Minute,
    Frequency,
    Save,
}

impl ScheduleField {
    fn next(self) -> Option<Self> {
        match self {
            Self::Day => Some(Self::Hour),
            Self::Hour => Some(Self::Minute),
            Self::Minute => Some(Self::Frequency),
            Self::Frequency => Some(Self::Save),
            Self::Save => None,
        }
    }
}

/// Requests for collaborators outside the engine (sensors, RTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeripheralRequest {
    ResetSensorMinMax,
    ResetRtcAlert,
    StartPhCalibration,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UiResponse {
    pub actions: Vec<TpaAction>,
    pub request: Option<PeripheralRequest>,
}

impl UiResponse {
    fn actions(actions: Vec<TpaAction>) -> Self {
        Self {
            actions,
            request: None,
        }
    }

    fn request(request: PeripheralRequest, message: &str) -> Self {
        Self {
            actions: vec![TpaAction::log(LogLevel::Info, message)],
            request: Some(request),
        }
    }
}

/// Page and edit-mode state of the front-panel display.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalUi {
    page: u8,
    schedule_field: Option<ScheduleField>,
    reposition_editing: bool,
    buffer_editing: bool,
}

impl LocalUi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(&self) -> u8 {
        self.page
    }

    pub fn schedule_field(&self) -> Option<ScheduleField> {
        self.schedule_field
    }

    pub fn is_editing(&self) -> bool {
        self.schedule_field.is_some() || self.reposition_editing || self.buffer_editing
    }

    pub fn handle(&mut self, event: InputEvent, engine: &mut TpaEngine) -> UiResponse {
        match event {
            InputEvent::PageLongPress => {
                self.exit_edit_modes(engine);
                self.page = (self.page + 1) % PAGE_COUNT;
                UiResponse::default()
            }
            InputEvent::PageTap => {
                self.page_tap(engine);
                UiResponse::default()
            }
            InputEvent::UpTap => UiResponse::actions(self.adjust(engine, 1)),
            InputEvent::DownTap => UiResponse::actions(self.adjust(engine, -1)),
            InputEvent::AlertResetTap => UiResponse::actions(engine.reset_alerts()),
            InputEvent::ServiceModeLongPress => UiResponse::actions(engine.toggle_service_mode()),
            InputEvent::AlertResetLongPress => UiResponse::request(
                PeripheralRequest::ResetSensorMinMax,
                "Sensor min/max values reset",
            ),
            InputEvent::RtcResetTap => {
                UiResponse::request(PeripheralRequest::ResetRtcAlert, "RTC power-loss alert reset")
            }
            InputEvent::PhCalLongPress => {
                UiResponse::request(PeripheralRequest::StartPhCalibration, "pH calibration started")
            }
        }
    }

    fn page_tap(&mut self, engine: &mut TpaEngine) {
        match self.page {
            1 => {
                self.schedule_field = match self.schedule_field {
                    None => Some(ScheduleField::Day),
                    Some(ScheduleField::Save) => {
                        engine.mark_config_dirty();
                        None
                    }
                    Some(field) => field.next(),
                };
            }
            2 => {
                if self.reposition_editing {
                    engine.mark_config_dirty();
                }
                self.reposition_editing = !self.reposition_editing;
            }
            3 => {
                if self.buffer_editing {
                    engine.mark_config_dirty();
                }
                self.buffer_editing = !self.buffer_editing;
            }
            _ => {}
        }
    }

    fn exit_edit_modes(&mut self, engine: &mut TpaEngine) {
        if self.reposition_editing || self.buffer_editing {
            engine.mark_config_dirty();
        }
        self.schedule_field = None;
        self.reposition_editing = false;
        self.buffer_editing = false;
    }

    fn adjust(&mut self, engine: &mut TpaEngine, direction: i32) -> Vec<TpaAction> {
        let Some(update) = self.step_update(engine, direction) else {
            return Vec::new();
        };
        let (_, actions) = engine.apply_setting(update);
        actions
    }

    fn step_update(&self, engine: &TpaEngine, direction: i32) -> Option<SettingUpdate> {
        let settings = engine.settings();
        let schedule = &settings.schedule;
        match self.page {
            1 => match self.schedule_field? {
                ScheduleField::Day => {
                    let max = i32::from(schedule.frequency.max_day());
                    let day = i32::from(schedule.day).min(max);
                    Some(SettingUpdate::ScheduleDay(wrap(day - 1, direction, max) + 1))
                }
                ScheduleField::Hour => Some(SettingUpdate::ScheduleHour(wrap(
                    schedule.hour.into(),
                    direction,
                    24,
                ))),
                ScheduleField::Minute => Some(SettingUpdate::ScheduleMinute(wrap(
                    schedule.minute.into(),
                    direction,
                    60,
                ))),
                ScheduleField::Frequency => Some(SettingUpdate::ScheduleFrequency(wrap(
                    schedule.frequency.code().into(),
                    direction,
                    4,
                ))),
                ScheduleField::Save => None,
            },
            2 if self.reposition_editing => {
                let stepped = settings.reposition_volume_l + REPOSITION_STEP_L * direction as f32;
                // Round to the step so repeated presses do not drift.
                Some(SettingUpdate::RepositionVolume((stepped * 10.0).round() / 10.0))
            }
            3 if self.buffer_editing => {
                let stepped = i32::from(settings.buffer_volume_ml) + BUFFER_STEP_ML * direction;
                Some(SettingUpdate::BufferVolume(stepped.clamp(0, 999)))
            }
            _ => None,
        }
    }
}

fn wrap(value: i32, direction: i32, modulus: i32) -> i32 {
    (value + direction).rem_euclid(modulus)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{PersistedSettings, TpaConfig},
        schedule::ScheduleFrequency,
    };

    fn engine() -> TpaEngine {
        TpaEngine::new(TpaConfig::default(), PersistedSettings::default())
    }

    #[test]
    fn long_press_cycles_pages_and_exits_edit_modes() {
        let mut ui = LocalUi::new();
        let mut engine = engine();

        ui.handle(InputEvent::PageLongPress, &mut engine);
        assert_eq!(ui.page(), 1);
        ui.handle(InputEvent::PageTap, &mut engine);
        assert!(ui.is_editing());

        ui.handle(InputEvent::PageLongPress, &mut engine);
        assert_eq!(ui.page(), 2);
        assert!(!ui.is_editing());

        ui.handle(InputEvent::PageLongPress, &mut engine);
        ui.handle(InputEvent::PageLongPress, &mut engine);
        assert_eq!(ui.page(), 0);
    }

    #[test]
    fn schedule_fields_wrap_around() {
        let mut ui = LocalUi::new();
        let mut engine = engine();
        ui.handle(InputEvent::PageLongPress, &mut engine);

        // Day: 1 wraps down to 7 for weekly schedules.
        ui.handle(InputEvent::PageTap, &mut engine);
        assert_eq!(ui.schedule_field(), Some(ScheduleField::Day));
        ui.handle(InputEvent::DownTap, &mut engine);
        assert_eq!(engine.settings().schedule.day, 7);
        ui.handle(InputEvent::UpTap, &mut engine);
        assert_eq!(engine.settings().schedule.day, 1);

        // Hour: 10 -> ... -> 23 -> 0.
        ui.handle(InputEvent::PageTap, &mut engine);
        for _ in 0..14 {
            ui.handle(InputEvent::UpTap, &mut engine);
        }
        assert_eq!(engine.settings().schedule.hour, 0);

        // Minute: 0 wraps down to 59.
        ui.handle(InputEvent::PageTap, &mut engine);
        ui.handle(InputEvent::DownTap, &mut engine);
        assert_eq!(engine.settings().schedule.minute, 59);

        // Frequency: weekly -> daily -> monthly.
        ui.handle(InputEvent::PageTap, &mut engine);
        ui.handle(InputEvent::DownTap, &mut engine);
        ui.handle(InputEvent::DownTap, &mut engine);
        assert_eq!(
            engine.settings().schedule.frequency,
            ScheduleFrequency::Monthly
        );
    }

    #[test]
    fn leaving_save_field_persists() {
        let mut ui = LocalUi::new();
        let mut engine = engine();
        ui.handle(InputEvent::PageLongPress, &mut engine);

        for _ in 0..5 {
            ui.handle(InputEvent::PageTap, &mut engine);
        }
        assert_eq!(ui.schedule_field(), Some(ScheduleField::Save));
        assert!(!engine.take_config_dirty());

        ui.handle(InputEvent::UpTap, &mut engine);
        assert!(!engine.take_config_dirty());

        ui.handle(InputEvent::PageTap, &mut engine);
        assert_eq!(ui.schedule_field(), None);
        assert!(engine.take_config_dirty());
    }

    #[test]
    fn reposition_page_steps_by_tenth_liter() {
        let mut ui = LocalUi::new();
        let mut engine = engine();
        ui.handle(InputEvent::PageLongPress, &mut engine);
        ui.handle(InputEvent::PageLongPress, &mut engine);

        // Not editing yet: buttons do nothing.
        ui.handle(InputEvent::UpTap, &mut engine);
        assert_eq!(engine.reposition_volume_l(), 10.0);

        ui.handle(InputEvent::PageTap, &mut engine);
        ui.handle(InputEvent::UpTap, &mut engine);
        ui.handle(InputEvent::UpTap, &mut engine);
        assert!((engine.reposition_volume_l() - 10.2).abs() < 1e-4);
        ui.handle(InputEvent::DownTap, &mut engine);
        assert!((engine.reposition_volume_l() - 10.1).abs() < 1e-4);
    }

    #[test]
    fn buffer_page_steps_by_ten_millilitres() {
        let mut ui = LocalUi::new();
        let mut engine = engine();
        for _ in 0..3 {
            ui.handle(InputEvent::PageLongPress, &mut engine);
        }
        ui.handle(InputEvent::PageTap, &mut engine);

        ui.handle(InputEvent::DownTap, &mut engine);
        assert_eq!(engine.settings().buffer_volume_ml, 0);
        ui.handle(InputEvent::UpTap, &mut engine);
        ui.handle(InputEvent::UpTap, &mut engine);
        assert_eq!(engine.settings().buffer_volume_ml, 20);
    }

    #[test]
    fn service_mode_long_press_toggles_with_warning() {
        let mut ui = LocalUi::new();
        let mut engine = engine();

        let response = ui.handle(InputEvent::ServiceModeLongPress, &mut engine);
        assert!(engine.service_mode());
        assert!(response.actions.iter().any(|action| matches!(
            action,
            TpaAction::Log {
                level: LogLevel::Warning,
                ..
            }
        )));

        ui.handle(InputEvent::ServiceModeLongPress, &mut engine);
        assert!(!engine.service_mode());
    }

    #[test]
    fn peripheral_buttons_are_forwarded() {
        let mut ui = LocalUi::new();
        let mut engine = engine();

        let response = ui.handle(InputEvent::PhCalLongPress, &mut engine);

        assert_eq!(response.request, Some(PeripheralRequest::StartPhCalibration));
    }

    #[test]
    fn parses_event_names() {
        assert_eq!("up_tap".parse::<InputEvent>(), Ok(InputEvent::UpTap));
        assert!("sideways".parse::<InputEvent>().is_err());
    }
}
