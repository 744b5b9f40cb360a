use crate::{
    action::{drive, publish_code, LogLevel, Output, TpaAction},
    topics::Channel,
    types::RepositionState,
};

/// Returns fresh water from the reservoir to the tank after a safety pause.
#[derive(Debug, Clone)]
pub struct RepositionFlow {
    safety_pause_ms: u64,
    state: RepositionState,
    phase_start_ms: u64,
    transfer_ms: u64,
}

impl RepositionFlow {
    pub fn new(safety_pause_ms: u64) -> Self {
        Self {
            safety_pause_ms,
            state: RepositionState::Idle,
            phase_start_ms: 0,
            transfer_ms: 0,
        }
    }

    pub fn state(&self) -> RepositionState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state == RepositionState::Finished
    }

    pub fn start(&mut self, transfer_ms: u64, now_ms: u64, actions: &mut Vec<TpaAction>) {
        if !matches!(
            self.state,
            RepositionState::Idle | RepositionState::Finished
        ) {
            actions.push(TpaAction::log(
                LogLevel::Error,
                "Reposition start requested while already running",
            ));
            return;
        }

        self.transfer_ms = transfer_ms;
        self.phase_start_ms = now_ms;
        self.set_state(RepositionState::WaitSafetyPause, actions);
        actions.push(TpaAction::log(
            LogLevel::Info,
            format!(
                "Reposition starting after {} s safety pause ({:.1} s transfer)",
                self.safety_pause_ms / 1000,
                transfer_ms as f64 / 1000.0
            ),
        ));
    }

    pub fn tick(&mut self, now_ms: u64, actions: &mut Vec<TpaAction>) {
        let elapsed = now_ms.saturating_sub(self.phase_start_ms);
        match self.state {
            RepositionState::WaitSafetyPause if elapsed >= self.safety_pause_ms => {
                self.phase_start_ms = now_ms;
                drive(Output::RepositionPump, true, actions);
                self.set_state(RepositionState::TransferRanToAquarium, actions);
                actions.push(TpaAction::log(LogLevel::Info, "Reposition pump on"));
            }
            RepositionState::TransferRanToAquarium if elapsed >= self.transfer_ms => {
                drive(Output::RepositionPump, false, actions);
                self.set_state(RepositionState::Finished, actions);
                actions.push(TpaAction::log(LogLevel::Info, "Reposition complete"));
            }
            _ => {}
        }
    }

    pub fn reset(&mut self, actions: &mut Vec<TpaAction>) {
        drive(Output::RepositionPump, false, actions);
        self.phase_start_ms = 0;
        self.transfer_ms = 0;
        self.set_state(RepositionState::Idle, actions);
    }

    fn set_state(&mut self, state: RepositionState, actions: &mut Vec<TpaAction>) {
        if self.state != state {
            self.state = state;
            publish_code(Channel::RepositionState, state.code(), actions);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pump_commands(actions: &[TpaAction]) -> Vec<bool> {
        actions
            .iter()
            .filter_map(|action| match action {
                TpaAction::SetOutput {
                    output: Output::RepositionPump,
                    on,
                } => Some(*on),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn waits_safety_pause_then_transfers() {
        let mut flow = RepositionFlow::new(5_000);
        let mut actions = Vec::new();

        flow.start(100_000, 0, &mut actions);
        assert_eq!(flow.state(), RepositionState::WaitSafetyPause);
        assert!(pump_commands(&actions).is_empty());

        actions.clear();
        flow.tick(4_999, &mut actions);
        assert_eq!(flow.state(), RepositionState::WaitSafetyPause);

        flow.tick(5_000, &mut actions);
        assert_eq!(flow.state(), RepositionState::TransferRanToAquarium);
        assert_eq!(pump_commands(&actions), vec![true]);

        actions.clear();
        flow.tick(104_999, &mut actions);
        assert!(pump_commands(&actions).is_empty());

        flow.tick(105_000, &mut actions);
        assert_eq!(pump_commands(&actions), vec![false]);
        assert!(flow.is_finished());
    }

    #[test]
    fn start_while_running_logs_error() {
        let mut flow = RepositionFlow::new(5_000);
        let mut actions = Vec::new();
        flow.start(10_000, 0, &mut actions);

        actions.clear();
        flow.start(10_000, 1_000, &mut actions);

        assert_eq!(actions.iter().filter(|a| a.is_error_log()).count(), 1);
        assert_eq!(flow.state(), RepositionState::WaitSafetyPause);
    }

    #[test]
    fn reset_is_idempotent_and_stops_pump() {
        let mut flow = RepositionFlow::new(5_000);
        let mut actions = Vec::new();

        flow.reset(&mut actions);
        flow.reset(&mut actions);

        assert_eq!(pump_commands(&actions), vec![false, false]);
        assert_eq!(flow.state(), RepositionState::Idle);
    }
}
