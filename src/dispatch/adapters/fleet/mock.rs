//! Scripted fleet API for offline runs and tests.
//!
//! Accepted missions get sequential ids `M1`, `M2`, ... unless a submit
//! outcome is scripted. Detail answers come from a per-mission script first,
//! then from the mission's stored navigation state, else "not found".

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{
    FleetApi, FleetError, FleetFuture, MissionDetail, MissionRequest, SubmitOutcome,
    VehicleCommand,
};

#[derive(Default)]
struct MockState {
    next_id: u64,
    submit_script: VecDeque<Result<SubmitOutcome, FleetError>>,
    detail_script: HashMap<String, VecDeque<Result<Option<MissionDetail>, FleetError>>>,
    states: HashMap<String, i64>,
    auto_complete: bool,
    submitted: Vec<MissionRequest>,
    detail_calls: Vec<String>,
    commands: Vec<(String, VehicleCommand)>,
}

#[derive(Clone, Default)]
pub struct MockFleetApi {
    state: Arc<Mutex<MockState>>,
}

impl MockFleetApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Missions without a stored state report Completed when polled.
    pub fn with_auto_complete(self) -> Self {
        self.state.lock().auto_complete = true;
        self
    }

    pub fn script_submit(&self, outcome: Result<SubmitOutcome, FleetError>) {
        self.state.lock().submit_script.push_back(outcome);
    }

    pub fn script_detail(
        &self,
        mission_id: &str,
        outcomes: impl IntoIterator<Item = Result<Option<MissionDetail>, FleetError>>,
    ) {
        self.state
            .lock()
            .detail_script
            .entry(mission_id.to_string())
            .or_default()
            .extend(outcomes);
    }

    pub fn set_state(&self, mission_id: &str, navigation_state: i64) {
        self.state
            .lock()
            .states
            .insert(mission_id.to_string(), navigation_state);
    }

    pub fn forget(&self, mission_id: &str) {
        self.state.lock().states.remove(mission_id);
    }

    pub fn submitted(&self) -> Vec<MissionRequest> {
        self.state.lock().submitted.clone()
    }

    pub fn detail_calls(&self) -> Vec<String> {
        self.state.lock().detail_calls.clone()
    }

    pub fn commands(&self) -> Vec<(String, VehicleCommand)> {
        self.state.lock().commands.clone()
    }

    fn submit(&self, request: &MissionRequest) -> Result<SubmitOutcome, FleetError> {
        let mut state = self.state.lock();
        state.submitted.push(request.clone());
        if let Some(outcome) = state.submit_script.pop_front() {
            if let Ok(SubmitOutcome::Accepted { mission_id }) = &outcome {
                state.states.entry(mission_id.clone()).or_insert(1);
            }
            return outcome;
        }
        state.next_id += 1;
        let mission_id = format!("M{}", state.next_id);
        if !state.auto_complete {
            state.states.insert(mission_id.clone(), 1);
        }
        Ok(SubmitOutcome::Accepted { mission_id })
    }

    fn detail(&self, mission_id: &str) -> Result<Option<MissionDetail>, FleetError> {
        let mut state = self.state.lock();
        state.detail_calls.push(mission_id.to_string());
        if let Some(outcome) = state
            .detail_script
            .get_mut(mission_id)
            .and_then(|queue| queue.pop_front())
        {
            return outcome;
        }
        let navigation_state = match state.states.get(mission_id) {
            Some(code) => *code,
            None if state.auto_complete => 4,
            None => return Ok(None),
        };
        Ok(Some(MissionDetail {
            mission_id: mission_id.to_string(),
            navigation_state,
            vehicle: None,
        }))
    }
}

impl FleetApi for MockFleetApi {
    fn submit_mission<'a>(&'a self, request: &'a MissionRequest) -> FleetFuture<'a, SubmitOutcome> {
        Box::pin(async move { self.submit(request) })
    }

    fn mission_detail<'a>(&'a self, mission_id: &'a str) -> FleetFuture<'a, Option<MissionDetail>> {
        Box::pin(async move { self.detail(mission_id) })
    }

    fn vehicle_command<'a>(
        &'a self,
        vehicle: &'a str,
        command: &'a VehicleCommand,
    ) -> FleetFuture<'a, ()> {
        Box::pin(async move {
            self.state
                .lock()
                .commands
                .push((vehicle.to_string(), command.clone()));
            Ok(())
        })
    }
}
