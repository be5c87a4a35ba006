use crate::error::Stage;
use crate::runner::CaseState;
use std::time::Instant;

pub trait CaseObserver {
    fn on_state_changed(&mut self, case: &str, state: &CaseState);
    fn on_stage_finished(&mut self, case: &str, stage: Stage, start_instant: Instant, end_instant: Instant);
}

impl CaseObserver for () {
    fn on_state_changed(&mut self, _case: &str, _state: &CaseState) {}
    fn on_stage_finished(
        &mut self,
        _case: &str,
        _stage: Stage,
        _start_instant: Instant,
        _end_instant: Instant,
    ) {
    }
}

/// Records every transition, in order.
#[derive(Debug, Default, Clone)]
pub struct StateRecorder {
    pub states: Vec<CaseState>,
    pub stages: Vec<Stage>,
}

impl CaseObserver for StateRecorder {
    fn on_state_changed(&mut self, _case: &str, state: &CaseState) {
        self.states.push(*state);
    }

    fn on_stage_finished(&mut self, _case: &str, stage: Stage, _start_instant: Instant, _end_instant: Instant) {
        self.stages.push(stage);
    }
}
