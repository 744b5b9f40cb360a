use chrono::{DateTime, FixedOffset};

use crate::{
    action::{publish_code, LogLevel, TelemetryValue, TpaAction},
    buffer::BufferDosingFlow,
    config::{PersistedSettings, TpaConfig},
    error::{SettingsError, StartRefusal},
    extraction::ExtractionFlow,
    pump::{extraction_volume_liters, PumpTiming},
    refill::RefillFlow,
    reposition::RepositionFlow,
    schedule::{LocalScheduler, ScheduleFrequency},
    settings::{SettingField, SettingUpdate},
    topics::Channel,
    types::{ControllerStatus, TpaMasterState, TpaStatePayload},
};

const MIN_REPOSITION_L: f32 = 0.1;
const MAX_REPOSITION_FACTOR: f32 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Manual,
    Cloud,
    LocalSchedule,
}

impl TriggerSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Cloud => "cloud",
            Self::LocalSchedule => "local schedule",
        }
    }
}

/// Water change orchestrator.
///
/// Owns the four flows and sequences extraction, reposition and reservoir
/// refill. Buffer dosing is a separate phase started on its own. The engine
/// performs no I/O: every call returns the actions the firmware must carry
/// out.
#[derive(Debug, Clone)]
pub struct TpaEngine {
    pub config: TpaConfig,
    settings: PersistedSettings,
    timing: PumpTiming,

    state: TpaMasterState,
    extraction: ExtractionFlow,
    reposition: RepositionFlow,
    refill: RefillFlow,
    buffer: BufferDosingFlow,
    scheduler: LocalScheduler,

    extraction_volume_l: f32,
    extraction_duration_ms: u64,

    level_full: bool,
    cloud_connected: bool,
    // Latched on refill timeout; cleared only by `reset_alerts`.
    refill_alert: bool,
    config_dirty: bool,

    last_trigger: Option<TriggerSource>,
    cycles_completed: u32,
}

impl TpaEngine {
    pub fn new(mut config: TpaConfig, mut settings: PersistedSettings) -> Self {
        config.sanitize();
        settings.sanitize();
        let timing = PumpTiming::new(config.pump_flow_rate_ml_per_sec);
        let mut engine = Self {
            timing,
            state: TpaMasterState::Idle,
            extraction: ExtractionFlow::new(),
            reposition: RepositionFlow::new(config.safety_pause_ms),
            refill: RefillFlow::new(config.refill_timeout_ms),
            buffer: BufferDosingFlow::new(),
            scheduler: LocalScheduler::new(config.schedule_cooldown_ms),
            extraction_volume_l: 0.0,
            extraction_duration_ms: 0,
            level_full: false,
            cloud_connected: false,
            refill_alert: false,
            config_dirty: false,
            last_trigger: None,
            cycles_completed: 0,
            config,
            settings,
        };
        engine.recompute_volumes();
        engine
    }

    pub fn settings(&self) -> &PersistedSettings {
        &self.settings
    }

    pub fn state(&self) -> TpaMasterState {
        self.state
    }

    pub fn extraction_volume_l(&self) -> f32 {
        self.extraction_volume_l
    }

    pub fn extraction_duration_ms(&self) -> u64 {
        self.extraction_duration_ms
    }

    pub fn reposition_volume_l(&self) -> f32 {
        self.settings.reposition_volume_l
    }

    pub fn is_extraction_pumping(&self) -> bool {
        self.extraction.is_pumping()
    }

    pub fn refill_alert(&self) -> bool {
        self.refill_alert
    }

    pub fn service_mode(&self) -> bool {
        self.settings.service_mode
    }

    pub fn level_full(&self) -> bool {
        self.level_full
    }

    pub fn cloud_connected(&self) -> bool {
        self.cloud_connected
    }

    pub fn last_trigger(&self) -> Option<TriggerSource> {
        self.last_trigger
    }

    pub fn cycles_completed(&self) -> u32 {
        self.cycles_completed
    }

    pub fn update_level_sensor(&mut self, full: bool) {
        self.level_full = full;
    }

    pub fn set_cloud_connected(&mut self, connected: bool) {
        self.cloud_connected = connected;
    }

    /// Returns and clears the pending-save flag.
    pub fn take_config_dirty(&mut self) -> bool {
        std::mem::take(&mut self.config_dirty)
    }

    pub fn mark_config_dirty(&mut self) {
        self.config_dirty = true;
    }

    pub fn next_local_run_epoch(&self, now: Option<DateTime<FixedOffset>>) -> Option<i64> {
        if self.cloud_connected {
            return None;
        }
        now.and_then(|now| self.scheduler.next_run_epoch(&self.settings.schedule, now))
    }

    /// One pass of the control loop. `now` is the wall-clock time sampled once
    /// for this pass, `None` until the clock is synced.
    pub fn tick(&mut self, now_ms: u64, now: Option<DateTime<FixedOffset>>) -> Vec<TpaAction> {
        let mut actions = Vec::new();

        match self.state {
            TpaMasterState::Idle => self.check_local_schedule(now_ms, now, &mut actions),
            TpaMasterState::ExtractionRunning => {
                self.extraction.tick(now_ms, &mut actions);
                if self.extraction.is_finished() {
                    self.extraction.reset(&mut actions);
                    let transfer_ms = self.timing.duration_ms(self.settings.reposition_volume_l);
                    self.reposition.start(transfer_ms, now_ms, &mut actions);
                    self.set_state(TpaMasterState::RepositionRunning, &mut actions);
                }
            }
            TpaMasterState::RepositionRunning => {
                self.reposition.tick(now_ms, &mut actions);
                if self.reposition.is_finished() {
                    self.reposition.reset(&mut actions);
                    self.refill.start(
                        self.settings.service_mode,
                        self.level_full,
                        now_ms,
                        &mut actions,
                    );
                    self.set_state(TpaMasterState::RefillRunning, &mut actions);
                }
            }
            TpaMasterState::RefillRunning => {
                self.refill.tick(self.level_full, now_ms, &mut actions);
                if self.refill.timed_out() {
                    self.refill_alert = true;
                }
                actions.push(TpaAction::publish(
                    Channel::RefillAlert,
                    TelemetryValue::Flag(self.refill_alert),
                ));
                if self.refill.is_finished() {
                    self.refill.reset(&mut actions);
                    self.cycles_completed = self.cycles_completed.saturating_add(1);
                    actions.push(TpaAction::log(LogLevel::Success, "TPA cycle complete"));
                    self.set_state(TpaMasterState::Completed, &mut actions);
                }
            }
            TpaMasterState::BufferDosing => {
                self.buffer.tick(now_ms, &mut actions);
                if self.buffer.is_finished() {
                    self.buffer.reset(&mut actions);
                    self.set_state(TpaMasterState::Completed, &mut actions);
                }
            }
            TpaMasterState::Completed => self.set_state(TpaMasterState::Idle, &mut actions),
        }

        actions
    }

    pub fn trigger_cycle(
        &mut self,
        source: TriggerSource,
        now_ms: u64,
    ) -> (Result<(), StartRefusal>, Vec<TpaAction>) {
        let mut actions = Vec::new();
        let result = self.start_cycle(source, now_ms, &mut actions);
        (result, actions)
    }

    pub fn trigger_buffer_dosing(&mut self, now_ms: u64) -> (Result<(), StartRefusal>, Vec<TpaAction>) {
        let mut actions = Vec::new();
        if let Err(refusal) = self.ensure_idle("buffer dosing", &mut actions) {
            return (Err(refusal), actions);
        }

        let result = self.buffer.start(
            self.settings.buffer_volume_ml,
            &self.timing,
            self.settings.service_mode,
            now_ms,
            &mut actions,
        );
        if result.is_ok() {
            self.set_state(TpaMasterState::BufferDosing, &mut actions);
        }
        (result, actions)
    }

    /// Applies one setting. Rejected values leave the setting untouched and
    /// echo the retained value back to the dashboard.
    pub fn apply_setting(
        &mut self,
        update: SettingUpdate,
    ) -> (Result<bool, SettingsError>, Vec<TpaAction>) {
        let mut actions = Vec::new();
        let field = update.field();

        if let Err(err) = update.validate() {
            actions.push(TpaAction::log(LogLevel::Error, format!("Setting rejected: {err}")));
            actions.push(self.echo(field));
            return (Err(err), actions);
        }

        let changed = match update {
            SettingUpdate::TotalVolume(liters) => {
                let changed = replace_f32(&mut self.settings.aquarium_volume_l, liters);
                changed | self.recompute_volumes()
            }
            SettingUpdate::ExtractionPercent(percent) => {
                let changed = replace_f32(&mut self.settings.extraction_percent, percent);
                changed | self.recompute_volumes()
            }
            SettingUpdate::RepositionVolume(liters) => {
                let max = (self.extraction_volume_l * MAX_REPOSITION_FACTOR).max(MIN_REPOSITION_L);
                let clamped = liters.clamp(MIN_REPOSITION_L, max);
                if (clamped - liters).abs() > f32::EPSILON {
                    actions.push(TpaAction::log(
                        LogLevel::Warning,
                        format!("Reposition volume {liters:.2} L clamped to {clamped:.2} L"),
                    ));
                }
                replace_f32(&mut self.settings.reposition_volume_l, clamped)
            }
            SettingUpdate::BufferVolume(ml) => {
                replace(&mut self.settings.buffer_volume_ml, ml as u16)
            }
            SettingUpdate::ScheduleEnabled(enabled) => {
                replace(&mut self.settings.schedule.enabled, enabled)
            }
            SettingUpdate::ScheduleHour(hour) => {
                replace(&mut self.settings.schedule.hour, hour as u8)
            }
            SettingUpdate::ScheduleMinute(minute) => {
                replace(&mut self.settings.schedule.minute, minute as u8)
            }
            SettingUpdate::ScheduleDay(day) => replace(&mut self.settings.schedule.day, day as u8),
            SettingUpdate::ScheduleFrequency(code) => match ScheduleFrequency::from_code(code) {
                Some(frequency) => replace(&mut self.settings.schedule.frequency, frequency),
                None => false,
            },
            SettingUpdate::ServiceMode(on) => {
                let changed = replace(&mut self.settings.service_mode, on);
                if changed {
                    actions.push(TpaAction::log(
                        LogLevel::Warning,
                        if on {
                            "Service mode enabled, actuators locked out"
                        } else {
                            "Service mode disabled"
                        },
                    ));
                }
                changed
            }
        };

        if changed {
            self.config_dirty = true;
        }
        actions.push(self.echo(field));
        if matches!(
            field,
            SettingField::TotalVolume | SettingField::ExtractionPercent
        ) {
            actions.push(TpaAction::publish(
                Channel::ExtractionVolume,
                TelemetryValue::Float(self.extraction_volume_l),
            ));
            actions.push(self.echo(SettingField::RepositionVolume));
        }

        (Ok(changed), actions)
    }

    pub fn toggle_service_mode(&mut self) -> Vec<TpaAction> {
        let (_, actions) = self.apply_setting(SettingUpdate::ServiceMode(!self.settings.service_mode));
        actions
    }

    pub fn reset_alerts(&mut self) -> Vec<TpaAction> {
        self.refill_alert = false;
        vec![
            TpaAction::publish(Channel::RefillAlert, TelemetryValue::Flag(false)),
            TpaAction::log(LogLevel::Info, "Critical alerts cleared"),
        ]
    }

    /// Full telemetry snapshot, sent when the dashboard link comes up.
    pub fn sync_actions(&self) -> Vec<TpaAction> {
        let mut actions = Vec::new();
        publish_code(Channel::MasterState, self.state.code(), &mut actions);
        publish_code(Channel::ExtractionState, self.extraction.state().code(), &mut actions);
        publish_code(Channel::RepositionState, self.reposition.state().code(), &mut actions);
        publish_code(Channel::RefillState, self.refill.state().code(), &mut actions);
        publish_code(Channel::BufferState, self.buffer.state().code(), &mut actions);
        actions.push(TpaAction::publish(
            Channel::ExtractionPump,
            TelemetryValue::Flag(self.extraction.is_pumping()),
        ));
        actions.push(TpaAction::publish(
            Channel::ExtractionVolume,
            TelemetryValue::Float(self.extraction_volume_l),
        ));
        for field in SettingField::ALL {
            actions.push(self.echo(field));
        }
        actions.push(TpaAction::publish(
            Channel::LevelPercent,
            TelemetryValue::Int(self.level_percent().into()),
        ));
        actions.push(TpaAction::publish(
            Channel::RefillAlert,
            TelemetryValue::Flag(self.refill_alert),
        ));
        actions
    }

    pub fn status(
        &self,
        now: Option<DateTime<FixedOffset>>,
        time_synced: bool,
        timezone: &str,
    ) -> ControllerStatus {
        let schedule = &self.settings.schedule;
        ControllerStatus {
            master_state: self.state.as_str(),
            master_state_code: self.state.code(),
            extraction_state: self.extraction.state().as_str(),
            reposition_state: self.reposition.state().as_str(),
            refill_state: self.refill.state().as_str(),
            buffer_state: self.buffer.state().as_str(),
            aquarium_volume_l: self.settings.aquarium_volume_l,
            extraction_percent: self.settings.extraction_percent,
            extraction_volume_l: self.extraction_volume_l,
            extraction_duration_ms: self.extraction_duration_ms,
            reposition_volume_l: self.settings.reposition_volume_l,
            buffer_volume_ml: self.settings.buffer_volume_ml,
            extraction_pump_on: self.extraction.is_pumping(),
            ran_level_full: self.level_full,
            ran_level_percent: self.level_percent(),
            refill_alert: self.refill_alert,
            service_mode: self.settings.service_mode,
            cloud_connected: self.cloud_connected,
            schedule_enabled: schedule.enabled,
            schedule_day: schedule.day,
            schedule_hour: schedule.hour,
            schedule_minute: schedule.minute,
            schedule_frequency: schedule.frequency.as_str(),
            last_run_epoch: schedule.last_run_epoch,
            next_local_run_epoch: self.next_local_run_epoch(now),
            cycles_completed: self.cycles_completed,
            time_synced,
            timezone: timezone.to_string(),
        }
    }

    pub fn state_payload(&self) -> TpaStatePayload {
        TpaStatePayload {
            state: self.state.as_str(),
            state_code: self.state.code(),
            extraction_volume_l: self.extraction_volume_l,
            reposition_volume_l: self.settings.reposition_volume_l,
            buffer_volume_ml: self.settings.buffer_volume_ml,
            level_percent: self.level_percent(),
            refill_alert: self.refill_alert,
            service_mode: self.settings.service_mode,
        }
    }

    fn level_percent(&self) -> u8 {
        if self.level_full {
            100
        } else {
            0
        }
    }

    fn check_local_schedule(
        &mut self,
        now_ms: u64,
        now: Option<DateTime<FixedOffset>>,
        actions: &mut Vec<TpaAction>,
    ) {
        if !self.scheduler.should_fire(
            &self.settings.schedule,
            self.extraction.is_pumping(),
            self.cloud_connected,
            now_ms,
            now,
        ) {
            return;
        }

        actions.push(TpaAction::log(
            LogLevel::Warning,
            "Local schedule triggered TPA (offline)",
        ));
        self.scheduler
            .record_run(&mut self.settings.schedule, now_ms, now);
        self.config_dirty = true;
        let _ = self.start_cycle(TriggerSource::LocalSchedule, now_ms, actions);
    }

    fn start_cycle(
        &mut self,
        source: TriggerSource,
        now_ms: u64,
        actions: &mut Vec<TpaAction>,
    ) -> Result<(), StartRefusal> {
        self.ensure_idle("TPA cycle", actions)?;

        if self.recompute_volumes() {
            self.config_dirty = true;
        }
        actions.push(TpaAction::log(
            LogLevel::Info,
            format!("TPA cycle requested ({})", source.as_str()),
        ));
        self.extraction.start(
            self.extraction_volume_l,
            self.extraction_duration_ms,
            self.settings.service_mode,
            now_ms,
            actions,
        )?;

        self.last_trigger = Some(source);
        self.set_state(TpaMasterState::ExtractionRunning, actions);
        Ok(())
    }

    fn ensure_idle(&self, what: &str, actions: &mut Vec<TpaAction>) -> Result<(), StartRefusal> {
        if self.state == TpaMasterState::Idle {
            return Ok(());
        }
        let refusal = StartRefusal::Busy(self.state.as_str());
        actions.push(TpaAction::log(
            refusal.log_level(),
            format!("Ignoring {what} request: {refusal}"),
        ));
        Err(refusal)
    }

    /// Recomputes extraction volume and duration. A reposition volume that
    /// was unset or equal to the previous extraction volume follows it.
    /// Returns whether the reposition volume changed.
    fn recompute_volumes(&mut self) -> bool {
        let previous = self.extraction_volume_l;
        self.extraction_volume_l = extraction_volume_liters(
            self.settings.aquarium_volume_l,
            self.settings.extraction_percent,
        );
        self.extraction_duration_ms = self.timing.duration_ms(self.extraction_volume_l);

        let reposition = self.settings.reposition_volume_l;
        let next = if reposition <= 0.0 || (reposition - previous).abs() < 1e-4 {
            self.extraction_volume_l
        } else {
            let max = (self.extraction_volume_l * MAX_REPOSITION_FACTOR).max(MIN_REPOSITION_L);
            reposition.clamp(MIN_REPOSITION_L, max)
        };
        replace_f32(&mut self.settings.reposition_volume_l, next)
    }

    fn set_state(&mut self, state: TpaMasterState, actions: &mut Vec<TpaAction>) {
        if self.state == state {
            return;
        }
        self.state = state;
        publish_code(Channel::MasterState, state.code(), actions);
    }

    fn echo(&self, field: SettingField) -> TpaAction {
        let settings = &self.settings;
        let (channel, value) = match field {
            SettingField::TotalVolume => (
                Channel::AquariumVolume,
                TelemetryValue::Float(settings.aquarium_volume_l),
            ),
            SettingField::ExtractionPercent => (
                Channel::ExtractionPercent,
                TelemetryValue::Float(settings.extraction_percent),
            ),
            SettingField::RepositionVolume => (
                Channel::RepositionVolume,
                TelemetryValue::Float(settings.reposition_volume_l),
            ),
            SettingField::BufferVolume => (
                Channel::BufferVolume,
                TelemetryValue::Int(settings.buffer_volume_ml.into()),
            ),
            SettingField::ScheduleEnabled => (
                Channel::ScheduleEnabled,
                TelemetryValue::Flag(settings.schedule.enabled),
            ),
            SettingField::ScheduleHour => (
                Channel::ScheduleHour,
                TelemetryValue::Int(settings.schedule.hour.into()),
            ),
            SettingField::ScheduleMinute => (
                Channel::ScheduleMinute,
                TelemetryValue::Int(settings.schedule.minute.into()),
            ),
            SettingField::ScheduleDay => (
                Channel::ScheduleDay,
                TelemetryValue::Int(settings.schedule.day.into()),
            ),
            SettingField::ScheduleFrequency => (
                Channel::ScheduleFrequency,
                TelemetryValue::Int(settings.schedule.frequency.code().into()),
            ),
            SettingField::ServiceMode => (
                Channel::ServiceMode,
                TelemetryValue::Flag(settings.service_mode),
            ),
        };
        TpaAction::publish(channel, value)
    }
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

fn replace_f32(slot: &mut f32, value: f32) -> bool {
    if (*slot - value).abs() <= f32::EPSILON {
        return false;
    }
    *slot = value;
    true
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::action::Output;

    fn engine() -> TpaEngine {
        TpaEngine::new(TpaConfig::default(), PersistedSettings::default())
    }

    fn small_engine(refill_timeout_ms: u64) -> TpaEngine {
        let config = TpaConfig {
            refill_timeout_ms,
            ..TpaConfig::default()
        };
        let settings = PersistedSettings {
            aquarium_volume_l: 10.0,
            extraction_percent: 10.0,
            ..PersistedSettings::default()
        };
        TpaEngine::new(config, settings)
    }

    fn master_codes(actions: &[TpaAction]) -> Vec<i64> {
        actions
            .iter()
            .filter_map(|action| match action {
                TpaAction::Publish {
                    channel: Channel::MasterState,
                    value: TelemetryValue::Int(code),
                } => Some(*code),
                _ => None,
            })
            .collect()
    }

    fn outputs(actions: &[TpaAction]) -> Vec<(Output, bool)> {
        actions
            .iter()
            .filter_map(|action| match action {
                TpaAction::SetOutput { output, on } => Some((*output, *on)),
                _ => None,
            })
            .collect()
    }

    fn sunday_morning() -> DateTime<FixedOffset> {
        FixedOffset::west_opt(3 * 3600)
            .unwrap()
            .with_ymd_and_hms(2026, 1, 4, 10, 0, 0)
            .unwrap()
    }

    #[test]
    fn full_cycle_runs_in_order() {
        let mut engine = engine();
        assert_eq!(engine.extraction_volume_l(), 10.0);
        assert_eq!(engine.extraction_duration_ms(), 1_000_000);
        assert_eq!(engine.reposition_volume_l(), 10.0);

        let mut log = Vec::new();
        let (result, actions) = engine.trigger_cycle(TriggerSource::Manual, 0);
        assert_eq!(result, Ok(()));
        assert_eq!(engine.state(), TpaMasterState::ExtractionRunning);
        log.extend(actions);

        log.extend(engine.tick(999_999, None));
        assert_eq!(engine.state(), TpaMasterState::ExtractionRunning);
        log.extend(engine.tick(1_000_000, None));
        assert_eq!(engine.state(), TpaMasterState::RepositionRunning);

        log.extend(engine.tick(1_005_000, None));
        log.extend(engine.tick(2_005_000, None));
        assert_eq!(engine.state(), TpaMasterState::RefillRunning);

        log.extend(engine.tick(2_005_200, None));
        engine.update_level_sensor(true);
        log.extend(engine.tick(2_005_400, None));
        assert_eq!(engine.state(), TpaMasterState::Completed);

        log.extend(engine.tick(2_005_600, None));
        assert_eq!(engine.state(), TpaMasterState::Idle);

        assert_eq!(master_codes(&log), vec![1, 2, 3, 5, 0]);
        assert_eq!(engine.cycles_completed(), 1);
        assert_eq!(engine.last_trigger(), Some(TriggerSource::Manual));

        let switched_on: Vec<Output> = outputs(&log)
            .into_iter()
            .filter_map(|(output, on)| on.then_some(output))
            .collect();
        assert_eq!(
            switched_on,
            vec![Output::ExtractionPump, Output::RepositionPump, Output::RanValve]
        );
    }

    #[test]
    fn trigger_outside_idle_is_rejected() {
        let mut engine = engine();
        let _ = engine.trigger_cycle(TriggerSource::Manual, 0);

        let (result, actions) = engine.trigger_cycle(TriggerSource::Cloud, 10);

        assert_eq!(result, Err(StartRefusal::Busy("EXTRACTION_RUNNING")));
        assert_eq!(engine.state(), TpaMasterState::ExtractionRunning);
        assert_eq!(
            actions,
            vec![TpaAction::log(
                LogLevel::Warning,
                "Ignoring TPA cycle request: cycle already in progress (EXTRACTION_RUNNING)"
            )]
        );
    }

    fn assert_busy(engine: &mut TpaEngine, now_ms: u64) {
        let state = engine.state();
        let attempts = [
            engine.trigger_cycle(TriggerSource::Manual, now_ms),
            engine.trigger_cycle(TriggerSource::Cloud, now_ms),
            engine.trigger_buffer_dosing(now_ms),
        ];

        for (result, actions) in attempts {
            assert_eq!(result, Err(StartRefusal::Busy(state.as_str())));
            assert_eq!(engine.state(), state);
            assert!(outputs(&actions).is_empty());
            assert_eq!(actions.len(), 1);
            assert!(matches!(
                actions[0],
                TpaAction::Log {
                    level: LogLevel::Warning,
                    ..
                }
            ));
        }
    }

    #[test]
    fn every_busy_state_refuses_new_work() {
        let mut engine = engine();
        let _ = engine.apply_setting(SettingUpdate::BufferVolume(50));

        let _ = engine.trigger_cycle(TriggerSource::Manual, 0);
        assert_eq!(engine.state(), TpaMasterState::ExtractionRunning);
        assert_busy(&mut engine, 10);

        let _ = engine.tick(1_000_000, None);
        assert_eq!(engine.state(), TpaMasterState::RepositionRunning);
        assert_busy(&mut engine, 1_000_010);

        let _ = engine.tick(1_005_000, None);
        let _ = engine.tick(2_005_000, None);
        assert_eq!(engine.state(), TpaMasterState::RefillRunning);
        assert_busy(&mut engine, 2_005_010);

        let _ = engine.tick(2_005_200, None);
        engine.update_level_sensor(true);
        let _ = engine.tick(2_005_400, None);
        assert_eq!(engine.state(), TpaMasterState::Completed);
        assert_busy(&mut engine, 2_005_410);

        let _ = engine.tick(2_005_600, None);
        assert_eq!(engine.state(), TpaMasterState::Idle);

        let (result, _) = engine.trigger_buffer_dosing(2_006_000);
        assert_eq!(result, Ok(()));
        assert_eq!(engine.state(), TpaMasterState::BufferDosing);
        assert_busy(&mut engine, 2_006_010);
    }

    #[test]
    fn cycle_start_marks_reclamped_reposition_dirty() {
        let mut engine = engine();
        engine.settings.reposition_volume_l = 40.0;
        let _ = engine.take_config_dirty();

        let (result, _) = engine.trigger_cycle(TriggerSource::Manual, 0);

        assert_eq!(result, Ok(()));
        assert_eq!(engine.reposition_volume_l(), 15.0);
        assert!(engine.take_config_dirty());
    }

    #[test]
    fn service_mode_refuses_cycle_and_stays_idle() {
        let mut engine = engine();
        let _ = engine.apply_setting(SettingUpdate::ServiceMode(true));

        let (result, actions) = engine.trigger_cycle(TriggerSource::Manual, 0);

        assert_eq!(result, Err(StartRefusal::ServiceMode));
        assert_eq!(engine.state(), TpaMasterState::Idle);
        assert!(outputs(&actions).is_empty());
    }

    #[test]
    fn refill_timeout_latches_system_alert_until_reset() {
        let mut engine = small_engine(1_000);
        let _ = engine.trigger_cycle(TriggerSource::Manual, 0);
        let _ = engine.tick(100_000, None);
        let _ = engine.tick(105_000, None);
        let _ = engine.tick(205_000, None);
        assert_eq!(engine.state(), TpaMasterState::RefillRunning);

        let _ = engine.tick(205_200, None);
        let actions = engine.tick(206_200, None);
        assert!(outputs(&actions).contains(&(Output::RanValve, false)));
        assert_eq!(engine.state(), TpaMasterState::Completed);
        assert!(engine.refill_alert());

        let _ = engine.tick(206_400, None);
        assert_eq!(engine.state(), TpaMasterState::Idle);
        assert!(engine.refill_alert());

        let actions = engine.reset_alerts();
        assert!(!engine.refill_alert());
        assert!(actions.contains(&TpaAction::publish(
            Channel::RefillAlert,
            TelemetryValue::Flag(false)
        )));
    }

    #[test]
    fn buffer_dosing_is_an_independent_phase() {
        let mut engine = engine();
        let _ = engine.apply_setting(SettingUpdate::BufferVolume(20));

        let (result, actions) = engine.trigger_buffer_dosing(0);
        assert_eq!(result, Ok(()));
        assert_eq!(engine.state(), TpaMasterState::BufferDosing);
        assert!(outputs(&actions).contains(&(Output::BufferPump, true)));

        let _ = engine.tick(1_999, None);
        assert_eq!(engine.state(), TpaMasterState::BufferDosing);
        let actions = engine.tick(2_000, None);
        assert!(outputs(&actions).contains(&(Output::BufferPump, false)));
        assert_eq!(engine.state(), TpaMasterState::Completed);

        let _ = engine.tick(2_200, None);
        assert_eq!(engine.state(), TpaMasterState::Idle);
    }

    #[test]
    fn rejected_setting_keeps_value_and_echoes_it() {
        let mut engine = engine();

        let (result, actions) = engine.apply_setting(SettingUpdate::TotalVolume(6_000.0));

        assert_eq!(result, Err(SettingsError::TotalVolume(6_000.0)));
        assert_eq!(engine.settings().aquarium_volume_l, 100.0);
        assert!(!engine.take_config_dirty());
        assert_eq!(actions.iter().filter(|a| a.is_error_log()).count(), 1);
        assert!(actions.contains(&TpaAction::publish(
            Channel::AquariumVolume,
            TelemetryValue::Float(100.0)
        )));
    }

    #[test]
    fn volume_change_recomputes_and_marks_dirty() {
        let mut engine = engine();

        let (result, _) = engine.apply_setting(SettingUpdate::ExtractionPercent(20.0));

        assert_eq!(result, Ok(true));
        assert_eq!(engine.extraction_volume_l(), 20.0);
        assert_eq!(engine.extraction_duration_ms(), 2_000_000);
        // Reposition followed the extraction volume.
        assert_eq!(engine.reposition_volume_l(), 20.0);
        assert!(engine.take_config_dirty());
        assert!(!engine.take_config_dirty());
    }

    #[test]
    fn reposition_volume_is_clamped_and_echoed() {
        let mut engine = engine();

        let (result, actions) = engine.apply_setting(SettingUpdate::RepositionVolume(40.0));

        assert_eq!(result, Ok(true));
        assert_eq!(engine.reposition_volume_l(), 15.0);
        assert!(actions.contains(&TpaAction::publish(
            Channel::RepositionVolume,
            TelemetryValue::Float(15.0)
        )));
    }

    #[test]
    fn local_schedule_fires_only_offline() {
        let mut engine = engine();
        let _ = engine.apply_setting(SettingUpdate::ScheduleEnabled(true));
        let _ = engine.apply_setting(SettingUpdate::ScheduleDay(1));
        let _ = engine.apply_setting(SettingUpdate::ScheduleHour(10));
        let _ = engine.apply_setting(SettingUpdate::ScheduleMinute(0));
        let _ = engine.take_config_dirty();

        engine.set_cloud_connected(true);
        let _ = engine.tick(1_000, Some(sunday_morning()));
        assert_eq!(engine.state(), TpaMasterState::Idle);

        engine.set_cloud_connected(false);
        let actions = engine.tick(1_200, Some(sunday_morning()));
        assert_eq!(engine.state(), TpaMasterState::ExtractionRunning);
        assert_eq!(engine.last_trigger(), Some(TriggerSource::LocalSchedule));
        assert_eq!(
            engine.settings().schedule.last_run_epoch,
            Some(sunday_morning().timestamp())
        );
        assert!(engine.take_config_dirty());
        assert!(actions.contains(&TpaAction::log(
            LogLevel::Warning,
            "Local schedule triggered TPA (offline)"
        )));
    }

    #[test]
    fn sync_publishes_current_state() {
        let engine = engine();
        let actions = engine.sync_actions();

        assert!(actions.contains(&TpaAction::publish(
            Channel::MasterState,
            TelemetryValue::Int(0)
        )));
        assert!(actions.contains(&TpaAction::publish(
            Channel::ExtractionVolume,
            TelemetryValue::Float(10.0)
        )));
        assert!(actions.contains(&TpaAction::publish(
            Channel::ScheduleFrequency,
            TelemetryValue::Int(1)
        )));
    }
}
