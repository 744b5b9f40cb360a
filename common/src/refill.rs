use crate::{
    action::{drive, publish_code, LogLevel, Output, TelemetryValue, TpaAction},
    topics::Channel,
    types::RefillState,
};

/// Opens the reservoir valve until the level switch reads full, or until the
/// safety timeout forces it closed.
#[derive(Debug, Clone)]
pub struct RefillFlow {
    timeout_ms: u64,
    state: RefillState,
    start_ms: u64,
    // Per-attempt latch, cleared by `reset`.
    alert_sent: bool,
}

impl RefillFlow {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            timeout_ms,
            state: RefillState::Idle,
            start_ms: 0,
            alert_sent: false,
        }
    }

    pub fn state(&self) -> RefillState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state == RefillState::Finished
    }

    pub fn timed_out(&self) -> bool {
        self.alert_sent
    }

    pub fn start(
        &mut self,
        service_mode: bool,
        level_full: bool,
        now_ms: u64,
        actions: &mut Vec<TpaAction>,
    ) {
        if service_mode {
            actions.push(TpaAction::log(
                LogLevel::Warning,
                "Reservoir refill skipped: service mode active",
            ));
            self.set_state(RefillState::Finished, actions);
            return;
        }

        if level_full {
            actions.push(TpaAction::log(
                LogLevel::Info,
                "Reservoir already full, skipping refill",
            ));
            self.set_state(RefillState::Finished, actions);
            return;
        }

        self.start_ms = now_ms;
        self.set_state(RefillState::StartDelay, actions);
        actions.push(TpaAction::log(LogLevel::Info, "Reservoir refill starting"));
    }

    pub fn tick(&mut self, level_full: bool, now_ms: u64, actions: &mut Vec<TpaAction>) {
        if matches!(self.state, RefillState::Idle | RefillState::Finished) {
            return;
        }

        match self.state {
            RefillState::StartDelay => {
                drive(Output::RanValve, true, actions);
                self.set_state(RefillState::Filling, actions);
            }
            RefillState::Filling if level_full => {
                drive(Output::RanValve, false, actions);
                self.set_state(RefillState::Finished, actions);
                actions.push(TpaAction::log(
                    LogLevel::Info,
                    "Reservoir refill complete: level reached",
                ));
            }
            RefillState::Filling if now_ms.saturating_sub(self.start_ms) >= self.timeout_ms => {
                drive(Output::RanValve, false, actions);
                self.set_state(RefillState::Finished, actions);
                if !self.alert_sent {
                    self.alert_sent = true;
                    actions.push(TpaAction::log(
                        LogLevel::Critical,
                        "Reservoir refill timed out, valve closed",
                    ));
                }
            }
            _ => {}
        }

        actions.push(TpaAction::publish(
            Channel::LevelPercent,
            TelemetryValue::Int(if level_full { 100 } else { 0 }),
        ));
    }

    pub fn reset(&mut self, actions: &mut Vec<TpaAction>) {
        drive(Output::RanValve, false, actions);
        self.alert_sent = false;
        self.start_ms = 0;
        self.set_state(RefillState::Idle, actions);
    }

    fn set_state(&mut self, state: RefillState, actions: &mut Vec<TpaAction>) {
        if self.state != state {
            self.state = state;
            publish_code(Channel::RefillState, state.code(), actions);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valve_commands(actions: &[TpaAction]) -> Vec<bool> {
        actions
            .iter()
            .filter_map(|action| match action {
                TpaAction::SetOutput {
                    output: Output::RanValve,
                    on,
                } => Some(*on),
                _ => None,
            })
            .collect()
    }

    fn critical_count(actions: &[TpaAction]) -> usize {
        actions
            .iter()
            .filter(|action| {
                matches!(
                    action,
                    TpaAction::Log {
                        level: LogLevel::Critical,
                        ..
                    }
                )
            })
            .count()
    }

    #[test]
    fn full_reservoir_skips_refill() {
        let mut flow = RefillFlow::new(2_000_000);
        let mut actions = Vec::new();

        flow.start(false, true, 0, &mut actions);
        flow.tick(true, 200, &mut actions);

        assert!(flow.is_finished());
        assert!(valve_commands(&actions).is_empty());
    }

    #[test]
    fn service_mode_skips_refill_with_warning() {
        let mut flow = RefillFlow::new(2_000_000);
        let mut actions = Vec::new();

        flow.start(true, false, 0, &mut actions);

        assert!(flow.is_finished());
        assert!(actions.iter().any(|action| matches!(
            action,
            TpaAction::Log {
                level: LogLevel::Warning,
                ..
            }
        )));
    }

    #[test]
    fn closes_valve_when_level_reached() {
        let mut flow = RefillFlow::new(2_000_000);
        let mut actions = Vec::new();

        flow.start(false, false, 0, &mut actions);
        flow.tick(false, 200, &mut actions);
        assert_eq!(flow.state(), RefillState::Filling);
        flow.tick(false, 400, &mut actions);
        flow.tick(true, 600, &mut actions);

        assert_eq!(valve_commands(&actions), vec![true, false]);
        assert!(flow.is_finished());
        assert!(!flow.timed_out());
    }

    #[test]
    fn timeout_forces_valve_closed_and_alerts_once() {
        let mut flow = RefillFlow::new(2_000_000);
        let mut actions = Vec::new();

        flow.start(false, false, 0, &mut actions);
        flow.tick(false, 200, &mut actions);
        flow.tick(false, 1_999_999, &mut actions);
        assert_eq!(flow.state(), RefillState::Filling);

        flow.tick(false, 2_000_000, &mut actions);
        for step in 1..10 {
            flow.tick(false, 2_000_000 + step * 200, &mut actions);
        }

        assert_eq!(valve_commands(&actions), vec![true, false]);
        assert!(flow.is_finished());
        assert!(flow.timed_out());
        assert_eq!(critical_count(&actions), 1);
    }

    #[test]
    fn reset_clears_latch_and_closes_valve() {
        let mut flow = RefillFlow::new(1_000);
        let mut actions = Vec::new();
        flow.start(false, false, 0, &mut actions);
        flow.tick(false, 0, &mut actions);
        flow.tick(false, 1_000, &mut actions);
        assert!(flow.timed_out());

        actions.clear();
        flow.reset(&mut actions);

        assert!(!flow.timed_out());
        assert_eq!(flow.state(), RefillState::Idle);
        assert_eq!(valve_commands(&actions), vec![false]);
    }

    #[test]
    fn publishes_level_each_active_pass() {
        let mut flow = RefillFlow::new(2_000_000);
        let mut actions = Vec::new();
        flow.start(false, false, 0, &mut actions);

        actions.clear();
        flow.tick(false, 200, &mut actions);

        assert!(actions.contains(&TpaAction::publish(
            Channel::LevelPercent,
            TelemetryValue::Int(0)
        )));

        actions.clear();
        flow.tick(true, 400, &mut actions);
        assert!(actions.contains(&TpaAction::publish(
            Channel::LevelPercent,
            TelemetryValue::Int(100)
        )));
    }
}
