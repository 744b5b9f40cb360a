use serde::{Deserialize, Serialize};

use crate::{action::Output, schedule::LocalSchedule};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TpaConfig {
    pub pump_flow_rate_ml_per_sec: f32,
    pub safety_pause_ms: u64,
    pub refill_timeout_ms: u64,
    pub schedule_cooldown_ms: u64,
    pub state_publish_interval_ms: u64,
    pub settings_save_debounce_ms: u64,
}

impl Default for TpaConfig {
    fn default() -> Self {
        Self {
            pump_flow_rate_ml_per_sec: 10.0,
            safety_pause_ms: 5_000,
            refill_timeout_ms: 2_000_000,
            schedule_cooldown_ms: 23 * 60 * 60 * 1000,
            state_publish_interval_ms: 10_000,
            settings_save_debounce_ms: 5_000,
        }
    }
}

impl TpaConfig {
    pub fn sanitize(&mut self) {
        if !self.pump_flow_rate_ml_per_sec.is_finite() || self.pump_flow_rate_ml_per_sec <= 0.0 {
            self.pump_flow_rate_ml_per_sec = 10.0;
        }
        if self.refill_timeout_ms == 0 {
            self.refill_timeout_ms = 2_000_000;
        }
        self.state_publish_interval_ms = self.state_publish_interval_ms.max(1_000);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSettings {
    pub aquarium_volume_l: f32,
    pub extraction_percent: f32,
    pub reposition_volume_l: f32,
    pub buffer_volume_ml: u16,
    #[serde(default)]
    pub service_mode: bool,
    #[serde(default)]
    pub schedule: LocalSchedule,
}

impl Default for PersistedSettings {
    fn default() -> Self {
        Self {
            aquarium_volume_l: 100.0,
            extraction_percent: 10.0,
            reposition_volume_l: 0.0,
            buffer_volume_ml: 0,
            service_mode: false,
            schedule: LocalSchedule::default(),
        }
    }
}

impl PersistedSettings {
    pub fn sanitize(&mut self) {
        if !self.aquarium_volume_l.is_finite() || self.aquarium_volume_l <= 0.0 {
            self.aquarium_volume_l = 100.0;
        }
        self.aquarium_volume_l = self.aquarium_volume_l.min(5000.0);

        if !self.extraction_percent.is_finite() || self.extraction_percent <= 0.0 {
            self.extraction_percent = 10.0;
        }
        self.extraction_percent = self.extraction_percent.min(50.0);

        if !self.reposition_volume_l.is_finite() || self.reposition_volume_l < 0.0 {
            self.reposition_volume_l = 0.0;
        }
        self.buffer_volume_ml = self.buffer_volume_ml.min(999);
        self.schedule.sanitize();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputPin {
    pub gpio: i32,
    pub active_low: bool,
}

/// GPIO assignment. Relay boards switch on a low level; the extraction pump
/// driver switches on high.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PinConfig {
    pub extraction_pump: OutputPin,
    pub reposition_pump: OutputPin,
    pub buffer_pump: OutputPin,
    pub ran_valve: OutputPin,
    pub level_sensor: i32,
    pub level_full_when_low: bool,
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            extraction_pump: OutputPin {
                gpio: 25,
                active_low: false,
            },
            reposition_pump: OutputPin {
                gpio: 23,
                active_low: true,
            },
            buffer_pump: OutputPin {
                gpio: 28,
                active_low: true,
            },
            ran_valve: OutputPin {
                gpio: 24,
                active_low: true,
            },
            level_sensor: 26,
            level_full_when_low: true,
        }
    }
}

impl PinConfig {
    pub fn output(&self, output: Output) -> OutputPin {
        match output {
            Output::ExtractionPump => self.extraction_pump,
            Output::RepositionPump => self.reposition_pump,
            Output::BufferPump => self.buffer_pump,
            Output::RanValve => self.ran_valve,
        }
    }

    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        for (pin, fallback) in [
            (&mut self.extraction_pump, defaults.extraction_pump),
            (&mut self.reposition_pump, defaults.reposition_pump),
            (&mut self.buffer_pump, defaults.buffer_pump),
            (&mut self.ran_valve, defaults.ran_valve),
        ] {
            if !(0..=48).contains(&pin.gpio) {
                *pin = fallback;
            }
        }
        if !(0..=48).contains(&self.level_sensor) {
            self.level_sensor = defaults.level_sensor;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub tpa: TpaConfig,
    pub settings: PersistedSettings,
    pub timezone: String,
    pub network: NetworkConfig,
    #[serde(default)]
    pub pins: PinConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tpa: TpaConfig::default(),
            settings: PersistedSettings::default(),
            timezone: "America/Sao_Paulo".to_string(),
            network: NetworkConfig::default(),
            pins: PinConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.tpa.sanitize();
        self.settings.sanitize();
        self.pins.sanitize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_restores_usable_settings() {
        let mut settings = PersistedSettings {
            aquarium_volume_l: -5.0,
            extraction_percent: 80.0,
            reposition_volume_l: f32::NAN,
            buffer_volume_ml: 4_000,
            ..PersistedSettings::default()
        };
        settings.sanitize();

        assert_eq!(settings.aquarium_volume_l, 100.0);
        assert_eq!(settings.extraction_percent, 50.0);
        assert_eq!(settings.reposition_volume_l, 0.0);
        assert_eq!(settings.buffer_volume_ml, 999);
    }

    #[test]
    fn runtime_config_loads_without_pins_section() {
        let mut value = serde_json::to_value(RuntimeConfig::default()).unwrap();
        value.as_object_mut().unwrap().remove("pins");

        let config: RuntimeConfig = serde_json::from_value(value).unwrap();

        assert_eq!(config.pins, PinConfig::default());
        assert_eq!(config.timezone, "America/Sao_Paulo");
    }
}
