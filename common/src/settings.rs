use crate::{error::SettingsError, topics::TOPIC_CMD_SETTINGS_PREFIX};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingField {
    TotalVolume,
    ExtractionPercent,
    RepositionVolume,
    BufferVolume,
    ScheduleEnabled,
    ScheduleHour,
    ScheduleMinute,
    ScheduleDay,
    ScheduleFrequency,
    ServiceMode,
}

impl SettingField {
    pub const ALL: [SettingField; 10] = [
        Self::TotalVolume,
        Self::ExtractionPercent,
        Self::RepositionVolume,
        Self::BufferVolume,
        Self::ScheduleEnabled,
        Self::ScheduleHour,
        Self::ScheduleMinute,
        Self::ScheduleDay,
        Self::ScheduleFrequency,
        Self::ServiceMode,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TotalVolume => "total_volume",
            Self::ExtractionPercent => "extraction_percent",
            Self::RepositionVolume => "reposition_volume",
            Self::BufferVolume => "buffer_volume",
            Self::ScheduleEnabled => "schedule_enabled",
            Self::ScheduleHour => "schedule_hour",
            Self::ScheduleMinute => "schedule_minute",
            Self::ScheduleDay => "schedule_day",
            Self::ScheduleFrequency => "schedule_frequency",
            Self::ServiceMode => "service_mode",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|field| field.as_str() == name)
    }

    pub fn from_topic(topic: &str) -> Option<Self> {
        topic
            .strip_prefix(TOPIC_CMD_SETTINGS_PREFIX)
            .and_then(Self::from_name)
    }

    pub fn command_topic(self) -> String {
        format!("{TOPIC_CMD_SETTINGS_PREFIX}{}", self.as_str())
    }
}

/// One user-initiated change, as received from the dashboard, HTTP or the
/// local buttons.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SettingUpdate {
    TotalVolume(f32),
    ExtractionPercent(f32),
    RepositionVolume(f32),
    BufferVolume(i32),
    ScheduleEnabled(bool),
    ScheduleHour(i32),
    ScheduleMinute(i32),
    ScheduleDay(i32),
    ScheduleFrequency(i32),
    ServiceMode(bool),
}

impl SettingUpdate {
    pub fn field(&self) -> SettingField {
        match self {
            Self::TotalVolume(_) => SettingField::TotalVolume,
            Self::ExtractionPercent(_) => SettingField::ExtractionPercent,
            Self::RepositionVolume(_) => SettingField::RepositionVolume,
            Self::BufferVolume(_) => SettingField::BufferVolume,
            Self::ScheduleEnabled(_) => SettingField::ScheduleEnabled,
            Self::ScheduleHour(_) => SettingField::ScheduleHour,
            Self::ScheduleMinute(_) => SettingField::ScheduleMinute,
            Self::ScheduleDay(_) => SettingField::ScheduleDay,
            Self::ScheduleFrequency(_) => SettingField::ScheduleFrequency,
            Self::ServiceMode(_) => SettingField::ServiceMode,
        }
    }

    /// Range checks only. The reposition volume is clamped by the engine
    /// because its bound depends on the current extraction volume.
    pub fn validate(&self) -> Result<(), SettingsError> {
        match *self {
            Self::TotalVolume(v) if !(v.is_finite() && v > 0.0 && v <= 5000.0) => {
                Err(SettingsError::TotalVolume(v))
            }
            Self::ExtractionPercent(p) if !(p.is_finite() && p > 0.0 && p <= 50.0) => {
                Err(SettingsError::ExtractionPercent(p))
            }
            Self::RepositionVolume(v) if !v.is_finite() => Err(SettingsError::RepositionVolume(v)),
            Self::BufferVolume(ml) if !(0..=999).contains(&ml) => {
                Err(SettingsError::BufferVolume(ml))
            }
            Self::ScheduleHour(h) if !(0..=23).contains(&h) => Err(SettingsError::ScheduleHour(h)),
            Self::ScheduleMinute(m) if !(0..=59).contains(&m) => {
                Err(SettingsError::ScheduleMinute(m))
            }
            Self::ScheduleDay(d) if !(1..=31).contains(&d) => Err(SettingsError::ScheduleDay(d)),
            Self::ScheduleFrequency(f) if !(0..=3).contains(&f) => {
                Err(SettingsError::ScheduleFrequency(f))
            }
            _ => Ok(()),
        }
    }

    pub fn parse(field: SettingField, raw: &str) -> Result<Self, SettingsError> {
        let raw = raw.trim();
        let unparseable = || SettingsError::Unparseable {
            field: field.as_str(),
            value: raw.to_string(),
        };
        let float = || raw.parse::<f32>().map_err(|_| unparseable());
        // Dashboards send whole numbers as "7.0". Anything that does not
        // round to a representable integer is rejected with the raw text.
        let int = || match raw.parse::<i32>() {
            Ok(value) => Ok(value),
            Err(_) => raw
                .parse::<f64>()
                .ok()
                .map(f64::round)
                .filter(|v| v.is_finite() && (f64::from(i32::MIN)..=f64::from(i32::MAX)).contains(v))
                .map(|v| v as i32)
                .ok_or_else(unparseable),
        };

        let update = match field {
            SettingField::TotalVolume => Self::TotalVolume(float()?),
            SettingField::ExtractionPercent => Self::ExtractionPercent(float()?),
            SettingField::RepositionVolume => Self::RepositionVolume(float()?),
            SettingField::BufferVolume => Self::BufferVolume(int()?),
            SettingField::ScheduleEnabled => {
                Self::ScheduleEnabled(parse_flag(raw).ok_or_else(unparseable)?)
            }
            SettingField::ScheduleHour => Self::ScheduleHour(int()?),
            SettingField::ScheduleMinute => Self::ScheduleMinute(int()?),
            SettingField::ScheduleDay => Self::ScheduleDay(int()?),
            SettingField::ScheduleFrequency => Self::ScheduleFrequency(int()?),
            SettingField::ServiceMode => {
                Self::ServiceMode(parse_flag(raw).ok_or_else(unparseable)?)
            }
        };
        Ok(update)
    }
}

pub fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "on" | "true" => Some(true),
        "0" | "off" | "false" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_ranges() {
        assert!(SettingUpdate::TotalVolume(5000.0).validate().is_ok());
        assert_eq!(
            SettingUpdate::TotalVolume(0.0).validate(),
            Err(SettingsError::TotalVolume(0.0))
        );
        assert!(SettingUpdate::TotalVolume(5000.5).validate().is_err());
        assert!(SettingUpdate::ExtractionPercent(50.0).validate().is_ok());
        assert!(SettingUpdate::ExtractionPercent(51.0).validate().is_err());
        assert!(SettingUpdate::BufferVolume(999).validate().is_ok());
        assert!(SettingUpdate::BufferVolume(1000).validate().is_err());
        assert!(SettingUpdate::BufferVolume(-1).validate().is_err());
        assert!(SettingUpdate::ScheduleHour(24).validate().is_err());
        assert!(SettingUpdate::ScheduleMinute(59).validate().is_ok());
        assert!(SettingUpdate::ScheduleDay(0).validate().is_err());
        assert!(SettingUpdate::ScheduleDay(31).validate().is_ok());
        assert!(SettingUpdate::ScheduleFrequency(4).validate().is_err());
        assert!(SettingUpdate::RepositionVolume(f32::NAN).validate().is_err());
    }

    #[test]
    fn parses_from_topic_payloads() {
        let field = SettingField::from_topic("aquarium/cmnd/settings/buffer_volume").unwrap();
        assert_eq!(field, SettingField::BufferVolume);
        assert_eq!(
            SettingUpdate::parse(field, "25"),
            Ok(SettingUpdate::BufferVolume(25))
        );
        assert_eq!(
            SettingUpdate::parse(SettingField::ServiceMode, "on"),
            Ok(SettingUpdate::ServiceMode(true))
        );
        assert_eq!(
            SettingUpdate::parse(SettingField::ScheduleHour, "7.0"),
            Ok(SettingUpdate::ScheduleHour(7))
        );
        assert!(SettingUpdate::parse(SettingField::TotalVolume, "lots").is_err());
        assert_eq!(SettingField::from_topic("aquarium/cmnd/settings/nope"), None);
    }

    #[test]
    fn non_finite_integer_payloads_are_rejected() {
        for field in [
            SettingField::ScheduleHour,
            SettingField::ScheduleMinute,
            SettingField::ScheduleFrequency,
            SettingField::BufferVolume,
        ] {
            for raw in ["NaN", "nan", "inf", "-inf"] {
                assert_eq!(
                    SettingUpdate::parse(field, raw),
                    Err(SettingsError::Unparseable {
                        field: field.as_str(),
                        value: raw.to_string(),
                    })
                );
            }
        }
    }

    #[test]
    fn out_of_range_integer_keeps_raw_text_in_error() {
        let err = SettingUpdate::parse(SettingField::ScheduleHour, "1e12").unwrap_err();

        assert_eq!(
            err,
            SettingsError::Unparseable {
                field: "schedule_hour",
                value: "1e12".to_string(),
            }
        );
        assert!(err.to_string().contains("1e12"));
    }
}
