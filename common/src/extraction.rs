use crate::{
    action::{drive, publish_code, LogLevel, Output, TpaAction},
    error::StartRefusal,
    topics::Channel,
    types::ExtractionState,
};

/// Runs the extraction pump for a precomputed duration. Polled from the
/// control loop; never blocks.
#[derive(Debug, Clone)]
pub struct ExtractionFlow {
    state: ExtractionState,
    start_ms: Option<u64>,
    duration_ms: u64,
    pumping: bool,
}

impl Default for ExtractionFlow {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtractionFlow {
    pub fn new() -> Self {
        Self {
            state: ExtractionState::Idle,
            start_ms: None,
            duration_ms: 0,
            pumping: false,
        }
    }

    pub fn state(&self) -> ExtractionState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state == ExtractionState::Finished
    }

    pub fn is_pumping(&self) -> bool {
        self.pumping
    }

    pub fn remaining_ms(&self, now_ms: u64) -> u64 {
        match self.start_ms {
            Some(start) if self.state == ExtractionState::Running => {
                self.duration_ms.saturating_sub(now_ms.saturating_sub(start))
            }
            _ => 0,
        }
    }

    pub fn start(
        &mut self,
        volume_l: f32,
        duration_ms: u64,
        service_mode: bool,
        now_ms: u64,
        actions: &mut Vec<TpaAction>,
    ) -> Result<(), StartRefusal> {
        let refusal = if duration_ms == 0 {
            Some(StartRefusal::ZeroDuration)
        } else if service_mode {
            Some(StartRefusal::ServiceMode)
        } else {
            None
        };

        if let Some(refusal) = refusal {
            actions.push(TpaAction::log(
                refusal.log_level(),
                format!("Extraction refused: {refusal}"),
            ));
            return Err(refusal);
        }

        drive(Output::ExtractionPump, true, actions);
        self.pumping = true;
        self.start_ms = Some(now_ms);
        self.duration_ms = duration_ms;
        self.set_state(ExtractionState::Running, actions);
        actions.push(TpaAction::log(
            LogLevel::Info,
            format!(
                "Extraction started: {volume_l:.2} L over {:.1} s",
                duration_ms as f64 / 1000.0
            ),
        ));
        Ok(())
    }

    pub fn tick(&mut self, now_ms: u64, actions: &mut Vec<TpaAction>) {
        if self.state != ExtractionState::Running {
            return;
        }
        let Some(start) = self.start_ms else {
            return;
        };
        if now_ms.saturating_sub(start) < self.duration_ms {
            return;
        }

        drive(Output::ExtractionPump, false, actions);
        self.pumping = false;
        self.set_state(ExtractionState::Finished, actions);
        actions.push(TpaAction::log(LogLevel::Success, "Extraction complete"));
    }

    pub fn reset(&mut self, actions: &mut Vec<TpaAction>) {
        drive(Output::ExtractionPump, false, actions);
        self.pumping = false;
        self.start_ms = None;
        self.duration_ms = 0;
        self.set_state(ExtractionState::Idle, actions);
    }

    fn set_state(&mut self, state: ExtractionState, actions: &mut Vec<TpaAction>) {
        if self.state != state {
            self.state = state;
            publish_code(Channel::ExtractionState, state.code(), actions);
        }
    }
}
