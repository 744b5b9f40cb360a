use chrono::{DateTime, Datelike, Duration, FixedOffset, TimeZone, Timelike};
use serde::{Deserialize, Serialize};

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleFrequency {
    Daily,
    Weekly,
    Biweekly,
    Monthly,
}

impl ScheduleFrequency {
    pub fn code(self) -> u8 {
        match self {
            Self::Daily => 0,
            Self::Weekly => 1,
            Self::Biweekly => 2,
            Self::Monthly => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Daily),
            1 => Some(Self::Weekly),
            2 => Some(Self::Biweekly),
            3 => Some(Self::Monthly),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Biweekly => "biweekly",
            Self::Monthly => "monthly",
        }
    }

    /// Upper bound of the `day` field: weekday (1 = Sunday) or day of month.
    pub fn max_day(self) -> u8 {
        match self {
            Self::Monthly => 31,
            _ => 7,
        }
    }
}

/// Offline fallback schedule, persisted with the rest of the settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalSchedule {
    pub enabled: bool,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub frequency: ScheduleFrequency,
    #[serde(rename = "lastRunEpoch", default)]
    pub last_run_epoch: Option<i64>,
}

impl Default for LocalSchedule {
    fn default() -> Self {
        Self {
            enabled: false,
            day: 1,
            hour: 10,
            minute: 0,
            frequency: ScheduleFrequency::Weekly,
            last_run_epoch: None,
        }
    }
}

impl LocalSchedule {
    pub fn sanitize(&mut self) {
        self.day = self.day.clamp(1, 31);
        self.hour = self.hour.min(23);
        self.minute = self.minute.min(59);
    }

    fn matches_day(&self, at: DateTime<FixedOffset>) -> bool {
        match self.frequency {
            ScheduleFrequency::Daily => true,
            ScheduleFrequency::Weekly => self.matches_weekday(at),
            ScheduleFrequency::Biweekly => {
                self.matches_weekday(at)
                    && self.last_run_epoch.map_or(true, |last| {
                        at.timestamp() - last > BIWEEKLY_MIN_DAYS * SECONDS_PER_DAY
                    })
            }
            ScheduleFrequency::Monthly => at.day() == u32::from(self.day),
        }
    }

    fn matches_weekday(&self, at: DateTime<FixedOffset>) -> bool {
        at.weekday().number_from_sunday() == u32::from(self.day)
    }
}

const BIWEEKLY_MIN_DAYS: i64 = 13;

/// Decides when the offline schedule fires. Only consulted while the cloud
/// link is down; the dashboard owns scheduling otherwise.
#[derive(Debug, Clone)]
pub struct LocalScheduler {
    cooldown_ms: u64,
    last_run_ms: Option<u64>,
}

impl LocalScheduler {
    pub fn new(cooldown_ms: u64) -> Self {
        Self {
            cooldown_ms,
            last_run_ms: None,
        }
    }

    pub fn last_run_ms(&self) -> Option<u64> {
        self.last_run_ms
    }

    pub fn should_fire(
        &self,
        schedule: &LocalSchedule,
        extraction_pump_on: bool,
        cloud_connected: bool,
        now_ms: u64,
        now: Option<DateTime<FixedOffset>>,
    ) -> bool {
        if !schedule.enabled || extraction_pump_on || cloud_connected {
            return false;
        }

        let Some(now) = now else {
            return false;
        };

        if self.in_cooldown(schedule, now_ms, now) {
            return false;
        }

        now.hour() == u32::from(schedule.hour)
            && now.minute() == u32::from(schedule.minute)
            && schedule.matches_day(now)
    }

    pub fn record_run(
        &mut self,
        schedule: &mut LocalSchedule,
        now_ms: u64,
        now: Option<DateTime<FixedOffset>>,
    ) {
        self.last_run_ms = Some(now_ms);
        if let Some(now) = now {
            schedule.last_run_epoch = Some(now.timestamp());
        }
    }

    pub fn next_run_epoch(
        &self,
        schedule: &LocalSchedule,
        now: DateTime<FixedOffset>,
    ) -> Option<i64> {
        if !schedule.enabled {
            return None;
        }

        // Two months covers every monthly day that exists at least once.
        for day_offset in 0..62i64 {
            let date = now.date_naive() + Duration::days(day_offset);
            let Some(naive) =
                date.and_hms_opt(u32::from(schedule.hour), u32::from(schedule.minute), 0)
            else {
                continue;
            };
            let Some(candidate) = now.offset().from_local_datetime(&naive).single() else {
                continue;
            };
            if candidate <= now {
                continue;
            }
            if schedule.matches_day(candidate) {
                return Some(candidate.timestamp());
            }
        }

        None
    }

    fn in_cooldown(&self, schedule: &LocalSchedule, now_ms: u64, now: DateTime<FixedOffset>) -> bool {
        match (self.last_run_ms, schedule.last_run_epoch) {
            (Some(last_ms), _) => now_ms.saturating_sub(last_ms) < self.cooldown_ms,
            (None, Some(last_epoch)) => {
                let elapsed_s = now.timestamp().saturating_sub(last_epoch);
                elapsed_s >= 0 && (elapsed_s as u64).saturating_mul(1000) < self.cooldown_ms
            }
            (None, None) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COOLDOWN_MS: u64 = 23 * 60 * 60 * 1000;

    fn fixed_time(day: u32, hour: u32, minute: u32) -> DateTime<FixedOffset> {
        FixedOffset::west_opt(3 * 3600)
            .unwrap()
            .with_ymd_and_hms(2026, 1, day, hour, minute, 0)
            .unwrap()
    }

    fn weekly_sunday() -> LocalSchedule {
        LocalSchedule {
            enabled: true,
            day: 1,
            hour: 10,
            minute: 30,
            frequency: ScheduleFrequency::Weekly,
            last_run_epoch: None,
        }
    }

    #[test]
    fn weekly_fires_on_matching_sunday_minute() {
        let scheduler = LocalScheduler::new(COOLDOWN_MS);
        let schedule = weekly_sunday();

        // Jan 4, 2026 is a Sunday; Jan 5 is a Monday.
        assert!(scheduler.should_fire(&schedule, false, false, 0, Some(fixed_time(4, 10, 30))));
        assert!(!scheduler.should_fire(&schedule, false, false, 0, Some(fixed_time(4, 10, 31))));
        assert!(!scheduler.should_fire(&schedule, false, false, 0, Some(fixed_time(5, 10, 30))));
    }

    #[test]
    fn never_fires_while_cloud_connected_or_pumping() {
        let scheduler = LocalScheduler::new(COOLDOWN_MS);
        let schedule = weekly_sunday();
        let now = Some(fixed_time(4, 10, 30));

        assert!(!scheduler.should_fire(&schedule, false, true, 0, now));
        assert!(!scheduler.should_fire(&schedule, true, false, 0, now));
    }

    #[test]
    fn never_fires_without_wall_clock() {
        let scheduler = LocalScheduler::new(COOLDOWN_MS);
        assert!(!scheduler.should_fire(&weekly_sunday(), false, false, 0, None));
    }

    #[test]
    fn cooldown_blocks_second_daily_run() {
        let mut scheduler = LocalScheduler::new(COOLDOWN_MS);
        let mut schedule = LocalSchedule {
            frequency: ScheduleFrequency::Daily,
            ..weekly_sunday()
        };
        let first = fixed_time(4, 10, 30);
        assert!(scheduler.should_fire(&schedule, false, false, 1_000, Some(first)));
        scheduler.record_run(&mut schedule, 1_000, Some(first));
        assert_eq!(schedule.last_run_epoch, Some(first.timestamp()));

        // Same wall-clock minute seen again shortly after.
        assert!(!scheduler.should_fire(&schedule, false, false, 31_000, Some(first)));
        // Next day matches again once 23 h have passed.
        let next_day = fixed_time(5, 10, 30);
        assert!(scheduler.should_fire(
            &schedule,
            false,
            false,
            1_000 + 24 * 60 * 60 * 1000,
            Some(next_day)
        ));
    }

    #[test]
    fn persisted_epoch_gates_after_restart() {
        let scheduler = LocalScheduler::new(COOLDOWN_MS);
        let now = fixed_time(4, 10, 30);
        let schedule = LocalSchedule {
            frequency: ScheduleFrequency::Daily,
            last_run_epoch: Some(now.timestamp() - 60),
            ..weekly_sunday()
        };

        assert!(!scheduler.should_fire(&schedule, false, false, 5_000, Some(now)));
    }

    #[test]
    fn biweekly_requires_thirteen_days() {
        let scheduler = LocalScheduler::new(COOLDOWN_MS);
        let now = fixed_time(18, 10, 30); // Sunday
        let mut schedule = LocalSchedule {
            frequency: ScheduleFrequency::Biweekly,
            last_run_epoch: Some(fixed_time(11, 10, 30).timestamp()),
            ..weekly_sunday()
        };
        assert!(!scheduler.should_fire(&schedule, false, false, 0, Some(now)));

        schedule.last_run_epoch = Some(fixed_time(4, 10, 30).timestamp());
        assert!(scheduler.should_fire(&schedule, false, false, 0, Some(now)));
    }

    #[test]
    fn monthly_matches_day_of_month() {
        let scheduler = LocalScheduler::new(COOLDOWN_MS);
        let schedule = LocalSchedule {
            day: 15,
            frequency: ScheduleFrequency::Monthly,
            ..weekly_sunday()
        };

        assert!(scheduler.should_fire(&schedule, false, false, 0, Some(fixed_time(15, 10, 30))));
        assert!(!scheduler.should_fire(&schedule, false, false, 0, Some(fixed_time(16, 10, 30))));
    }

    #[test]
    fn next_run_finds_following_sunday() {
        let scheduler = LocalScheduler::new(COOLDOWN_MS);
        let now = fixed_time(5, 9, 0);

        let next = scheduler.next_run_epoch(&weekly_sunday(), now);

        assert_eq!(next, Some(fixed_time(11, 10, 30).timestamp()));
    }

    #[test]
    fn frequency_codes_are_stable() {
        for code in 0..4 {
            let frequency = ScheduleFrequency::from_code(code).unwrap();
            assert_eq!(i32::from(frequency.code()), code);
        }
        assert_eq!(ScheduleFrequency::from_code(4), None);
    }
}
