use crate::{
    action::{drive, publish_code, LogLevel, Output, TpaAction},
    error::StartRefusal,
    pump::PumpTiming,
    topics::Channel,
    types::BufferDosingState,
};

/// Time-based dosing of buffer solution into the reservoir.
#[derive(Debug, Clone, Default)]
pub struct BufferDosingFlow {
    state: BufferDosingState,
    start_ms: u64,
    duration_ms: u64,
}

impl BufferDosingFlow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> BufferDosingState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state == BufferDosingState::Finished
    }

    pub fn start(
        &mut self,
        volume_ml: u16,
        timing: &PumpTiming,
        service_mode: bool,
        now_ms: u64,
        actions: &mut Vec<TpaAction>,
    ) -> Result<(), StartRefusal> {
        if volume_ml == 0 {
            actions.push(TpaAction::log(
                LogLevel::Info,
                "Buffer dosing skipped: volume is zero",
            ));
            self.set_state(BufferDosingState::Finished, actions);
            return Ok(());
        }

        if service_mode {
            let refusal = StartRefusal::ServiceMode;
            actions.push(TpaAction::log(
                refusal.log_level(),
                format!("Buffer pump blocked: {refusal}"),
            ));
            return Err(refusal);
        }

        self.duration_ms = timing.duration_ms_for_ml(f64::from(volume_ml));
        self.start_ms = now_ms;
        drive(Output::BufferPump, true, actions);
        self.set_state(BufferDosingState::Dosing, actions);
        actions.push(TpaAction::log(
            LogLevel::Info,
            format!(
                "Buffer dosing started: {volume_ml} mL over {:.1} s",
                self.duration_ms as f64 / 1000.0
            ),
        ));
        Ok(())
    }

    pub fn tick(&mut self, now_ms: u64, actions: &mut Vec<TpaAction>) {
        if self.state != BufferDosingState::Dosing {
            return;
        }
        if now_ms.saturating_sub(self.start_ms) < self.duration_ms {
            return;
        }

        drive(Output::BufferPump, false, actions);
        self.set_state(BufferDosingState::Finished, actions);
        actions.push(TpaAction::log(LogLevel::Info, "Buffer dosing complete"));
    }

    pub fn reset(&mut self, actions: &mut Vec<TpaAction>) {
        drive(Output::BufferPump, false, actions);
        self.start_ms = 0;
        self.duration_ms = 0;
        self.set_state(BufferDosingState::Idle, actions);
    }

    fn set_state(&mut self, state: BufferDosingState, actions: &mut Vec<TpaAction>) {
        if self.state != state {
            self.state = state;
            publish_code(Channel::BufferState, state.code(), actions);
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
                    output: Output::BufferPump,
                    on,
                } => Some(*on),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn zero_volume_finishes_without_pump() {
        let mut flow = BufferDosingFlow::new();
        let mut actions = Vec::new();

        let result = flow.start(0, &PumpTiming::default(), false, 0, &mut actions);

        assert_eq!(result, Ok(()));
        assert!(flow.is_finished());
        assert!(pump_commands(&actions).is_empty());
    }

    #[test]
    fn doses_for_computed_duration() {
        let mut flow = BufferDosingFlow::new();
        let mut actions = Vec::new();

        flow.start(50, &PumpTiming::default(), false, 1_000, &mut actions)
            .unwrap();
        assert_eq!(flow.state(), BufferDosingState::Dosing);
        assert_eq!(pump_commands(&actions), vec![true]);

        flow.tick(5_999, &mut actions);
        assert_eq!(flow.state(), BufferDosingState::Dosing);

        flow.tick(6_000, &mut actions);
        assert!(flow.is_finished());
        assert_eq!(pump_commands(&actions), vec![true, false]);
    }

    #[test]
    fn service_mode_blocks_pump() {
        let mut flow = BufferDosingFlow::new();
        let mut actions = Vec::new();

        let result = flow.start(50, &PumpTiming::default(), true, 0, &mut actions);

        assert_eq!(result, Err(StartRefusal::ServiceMode));
        assert_eq!(flow.state(), BufferDosingState::Idle);
        assert!(pump_commands(&actions).is_empty());
    }
}
