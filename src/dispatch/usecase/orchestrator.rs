//! Mission orchestrator: registry of active processes and the poll loop
//! that advances them.
//!
//! Constraints:
//! - a tick never overlaps another tick; an overlapping call returns at once
//! - processes are driven one after another inside a tick
//! - every locked rack is unlocked exactly once, on the terminal transition
//! - nothing is submitted to the fleet API once a process is cancelled
//! - terminal processes stay visible until the start of the next tick

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::dispatch::adapters::fleet::{
    FleetApi, MissionParameters, MissionRequest, SubmitOutcome, VehicleCommand,
};
use crate::dispatch::adapters::modbus::ModbusGateway;
use crate::dispatch::adapters::plc::PlcPort;
use crate::dispatch::adapters::store::RackStore;
use crate::dispatch::adapters::ui::{SnapshotSink, ToastLevel, UiPorts};
use crate::dispatch::core::config::OrchestratorConfig;
use crate::dispatch::core::model::{
    MissionProcess, MissionStatus, MissionStepDefinition, ProcessContext, ProcessId,
    ProcessPhase, ProcessSnapshot, RackId, StepRole,
};
use crate::dispatch::core::sub_op::{SubOperation, TransferSource};
use crate::dispatch::error::{Classify, OrchestratorError};

use super::executor::SubOperationExecutor;
use super::policy::{MissVerdict, PlcRetryPolicy, RetryPolicy, WaitPolicy};

/// Collaborators the orchestrator drives.
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub fleet: Arc<dyn FleetApi>,
    pub plc: Arc<dyn PlcPort>,
    pub gateway: Arc<dyn ModbusGateway>,
    pub store: Arc<dyn RackStore>,
    pub ui: UiPorts,
}

/// Latest snapshot per process, forwarded to the UI sink.
struct SnapshotBoard {
    latest: Mutex<HashMap<ProcessId, ProcessSnapshot>>,
    downstream: Arc<dyn SnapshotSink>,
}

impl SnapshotSink for SnapshotBoard {
    fn publish(&self, snapshot: &ProcessSnapshot) {
        self.latest
            .lock()
            .insert(snapshot.process_id, snapshot.clone());
        self.downstream.publish(snapshot);
    }
}

struct ProcessHandle {
    cancel_tx: watch::Sender<bool>,
    process: Arc<tokio::sync::Mutex<MissionProcess>>,
}

struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct MissionOrchestrator {
    fleet: Arc<dyn FleetApi>,
    executor: SubOperationExecutor,
    board: Arc<SnapshotBoard>,
    ui: UiPorts,
    config: OrchestratorConfig,
    retry: RetryPolicy,
    processes: Mutex<HashMap<ProcessId, ProcessHandle>>,
    ticking: AtomicBool,
}

impl MissionOrchestrator {
    pub fn new(deps: OrchestratorDeps, config: OrchestratorConfig) -> Self {
        let board = Arc::new(SnapshotBoard {
            latest: Mutex::new(HashMap::new()),
            downstream: Arc::clone(&deps.ui.snapshots),
        });
        let ui = UiPorts {
            snapshots: board.clone(),
            ..deps.ui
        };
        let executor = SubOperationExecutor::new(
            deps.plc,
            deps.gateway,
            deps.store,
            ui.clone(),
            WaitPolicy::from_config(&config),
        );
        Self {
            fleet: deps.fleet,
            executor,
            board,
            ui,
            retry: RetryPolicy::from_config(&config),
            config,
            processes: Mutex::new(HashMap::new()),
            ticking: AtomicBool::new(false),
        }
    }

    /// Bounds the retries of PLC sub-operations hit by transient errors.
    pub fn with_plc_retry(mut self, policy: PlcRetryPolicy) -> Self {
        self.executor.set_plc_retry(policy);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Registers a process, locks `locked_racks` and submits step 0 before
    /// returning. A failed first submission leaves the process FAILED (and
    /// its racks unlocked) rather than returning an error.
    pub async fn initiate_process(
        &self,
        process_type: &str,
        steps: Vec<MissionStepDefinition>,
        locked_racks: Vec<RackId>,
        context: Option<ProcessContext>,
    ) -> Result<ProcessId, OrchestratorError> {
        self.register(process_type, steps, locked_racks, Vec::new(), context)
            .await
    }

    /// `held` racks are already locked and change owner without a store write.
    async fn register(
        &self,
        process_type: &str,
        steps: Vec<MissionStepDefinition>,
        to_lock: Vec<RackId>,
        held: Vec<RackId>,
        context: Option<ProcessContext>,
    ) -> Result<ProcessId, OrchestratorError> {
        if steps.is_empty() {
            return Err(OrchestratorError::EmptySteps);
        }
        for (i, step) in steps.iter().enumerate() {
            step.validate()
                .map_err(|source| OrchestratorError::InvalidStep { step: i, source })?;
        }

        let id = Uuid::new_v4();
        self.lock_racks(&to_lock).await?;
        let mut locked_racks = to_lock.clone();
        locked_racks.extend(held);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut process = MissionProcess::new(
            id,
            process_type,
            steps,
            locked_racks,
            context.unwrap_or_default(),
            cancel_rx,
        );
        self.board.publish(process.refresh_snapshot(None));

        let process = Arc::new(tokio::sync::Mutex::new(process));
        let duplicate = {
            let mut guard = self.processes.lock();
            if guard.contains_key(&id) {
                true
            } else {
                guard.insert(
                    id,
                    ProcessHandle {
                        cancel_tx,
                        process: Arc::clone(&process),
                    },
                );
                false
            }
        };
        if duplicate {
            self.unlock_racks(&to_lock).await;
            return Err(OrchestratorError::DuplicateProcess(id));
        }
        info!("[agv][proc] id={id} type={process_type} registered");

        let mut guard = process.lock().await;
        self.submit_current(&mut guard).await;
        Ok(id)
    }

    async fn lock_racks(&self, racks: &[RackId]) -> Result<(), OrchestratorError> {
        let store = self.executor.store();
        for (i, rack_id) in racks.iter().enumerate() {
            match store.set_lock(*rack_id, true).await {
                Ok(true) => self.ui.notifier.lock_state_changed(*rack_id, true),
                Ok(false) => warn!("[agv][proc] lock: rack {rack_id} not found"),
                Err(e) => {
                    self.unlock_racks(&racks[..i]).await;
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    async fn unlock_racks(&self, racks: &[RackId]) {
        for rack_id in racks {
            if let Ok(true) = self.executor.store().set_lock(*rack_id, false).await {
                self.ui.notifier.lock_state_changed(*rack_id, false);
            }
        }
    }

    /// Signals cancellation; the process fails on its next tick, or at once
    /// if it is inside a wait.
    pub fn cancel_process(&self, id: ProcessId) -> Result<(), OrchestratorError> {
        let guard = self.processes.lock();
        let handle = guard
            .get(&id)
            .ok_or(OrchestratorError::ProcessNotFound(id))?;
        handle.cancel_tx.send_replace(true);
        info!("[agv][proc] id={id} cancel requested");
        Ok(())
    }

    pub async fn extract_vehicle(&self, vehicle: &str) -> Result<(), OrchestratorError> {
        self.fleet
            .vehicle_command(vehicle, &VehicleCommand::extract())
            .await?;
        info!("[agv][fleet] vehicle {vehicle} extracted");
        Ok(())
    }

    pub fn snapshot(&self, id: ProcessId) -> Option<ProcessSnapshot> {
        self.board.latest.lock().get(&id).cloned()
    }

    pub fn snapshots(&self) -> Vec<ProcessSnapshot> {
        let mut all: Vec<ProcessSnapshot> = self.board.latest.lock().values().cloned().collect();
        all.sort_by_key(|s| s.updated_at_utc);
        all
    }

    /// Registered processes that have not reached a terminal phase.
    pub fn active_count(&self) -> usize {
        let ids: Vec<ProcessId> = self.processes.lock().keys().copied().collect();
        let latest = self.board.latest.lock();
        ids.iter()
            .filter(|id| {
                latest
                    .get(id)
                    .map_or(true, |s| s.phase == ProcessPhase::Active)
            })
            .count()
    }

    /// Registered processes, terminal ones included until reaped.
    pub fn registered_count(&self) -> usize {
        self.processes.lock().len()
    }

    /// One pass over the registry. Returns false when another tick was
    /// still running and this call did nothing.
    pub async fn tick(&self) -> bool {
        if self.ticking.swap(true, Ordering::AcqRel) {
            debug!("[agv][tick] previous tick still running, skipped");
            return false;
        }
        let _guard = TickGuard(&self.ticking);

        self.reap();

        let mut handles: Vec<(ProcessId, Arc<tokio::sync::Mutex<MissionProcess>>)> = self
            .processes
            .lock()
            .iter()
            .map(|(id, h)| (*id, Arc::clone(&h.process)))
            .collect();
        handles.sort_by_key(|(id, _)| *id);

        for (_, process) in handles {
            let mut process = process.lock().await;
            self.drive(&mut process).await;
        }
        true
    }

    fn reap(&self) {
        let mut reaped = Vec::new();
        self.processes.lock().retain(|id, handle| {
            let terminal = handle
                .process
                .try_lock()
                .map(|p| p.phase.is_terminal())
                .unwrap_or(false);
            if terminal {
                reaped.push(*id);
            }
            !terminal
        });
        if reaped.is_empty() {
            return;
        }
        let mut latest = self.board.latest.lock();
        for id in reaped {
            latest.remove(&id);
            debug!("[agv][proc] id={id} reaped");
        }
    }

    async fn drive(&self, p: &mut MissionProcess) {
        if p.phase.is_terminal() {
            return;
        }
        if p.is_cancelled() {
            self.fail(p, "cancelled".to_string()).await;
            return;
        }
        if let Some(until) = p.backoff_until {
            if Instant::now() < until {
                return;
            }
            p.backoff_until = None;
        }

        match p.outstanding_mission_id.clone() {
            Some(mission_id) => self.poll_outstanding(p, mission_id).await,
            None => self.submit_current(p).await,
        }
    }

    async fn poll_outstanding(&self, p: &mut MissionProcess, mission_id: String) {
        match self.fleet.mission_detail(&mission_id).await {
            Ok(Some(detail)) => {
                p.miss_count = 0;
                match detail.status() {
                    Some(status) if status.is_terminal_success() => {
                        self.complete_step(p, mission_id).await;
                    }
                    Some(status) if status.is_terminal_failure() => {
                        p.status = status;
                        let reason = format!("mission {mission_id} {}", status.label());
                        self.fail_step(p, reason).await;
                    }
                    Some(status) => {
                        if status != p.status {
                            debug!(
                                "[agv][proc] id={} step={} mission={mission_id} {}",
                                p.id,
                                p.step_index,
                                status.label()
                            );
                            p.status = status;
                            self.publish(p);
                        }
                    }
                    None => warn!(
                        "[agv][proc] id={} mission={mission_id} unknown navigation state {}",
                        p.id, detail.navigation_state
                    ),
                }
            }
            Ok(None) => {
                self.record_miss(p, format!("mission {mission_id} not found"))
                    .await;
            }
            Err(e) if e.class().is_retryable() => {
                self.record_miss(p, format!("mission {mission_id} detail: {e}"))
                    .await;
            }
            Err(e) => {
                self.fail(p, format!("mission {mission_id} detail: {e}")).await;
            }
        }
    }

    async fn record_miss(&self, p: &mut MissionProcess, reason: String) {
        match self.retry.record_miss(&mut p.miss_count, Instant::now()) {
            MissVerdict::RetryAfter(until) => {
                warn!(
                    "[agv][proc] id={} miss {}/{}: {reason}",
                    p.id, p.miss_count, self.retry.max_misses
                );
                p.backoff_until = Some(until);
            }
            MissVerdict::GiveUp => {
                let reason = format!("{reason} ({} consecutive misses)", p.miss_count);
                self.fail(p, reason).await;
            }
        }
    }

    async fn complete_step(&self, p: &mut MissionProcess, mission_id: String) {
        info!(
            "[agv][proc] id={} step={} mission={mission_id} completed",
            p.id, p.step_index
        );
        p.status = MissionStatus::Completed;
        p.outstanding_mission_id = None;
        p.completed_mission_id = Some(mission_id);

        let post_ops = p
            .current_step()
            .map(|s| s.post_ops.clone())
            .unwrap_or_default();
        if let Err(e) = self.executor.run_all(p, &post_ops).await {
            let reason = format!("step {} post-operations: {e}", p.step_index);
            self.fail(p, reason).await;
            return;
        }

        p.step_index += 1;
        p.pre_ops_done_for = None;
        if p.step_index >= p.steps.len() {
            p.phase = ProcessPhase::Finished;
            self.finalize(p).await;
        } else {
            self.publish(p);
        }
    }

    async fn submit_current(&self, p: &mut MissionProcess) {
        if p.phase.is_terminal() || p.outstanding_mission_id.is_some() {
            return;
        }
        let Some(step) = p.current_step().cloned() else {
            p.phase = ProcessPhase::Finished;
            self.finalize(p).await;
            return;
        };
        if p.is_cancelled() {
            self.fail(p, "cancelled".to_string()).await;
            return;
        }

        if p.pre_ops_done_for != Some(p.step_index) {
            if let Some(address) = step.guard_input {
                if let Err(e) = self.executor.check_guard(address, true).await {
                    let reason = format!("step {} guard: {e}", p.step_index);
                    self.fail(p, reason).await;
                    return;
                }
            }
            if let Err(e) = self.executor.run_all(p, &step.pre_ops).await {
                let reason = format!("step {} pre-operations: {e}", p.step_index);
                self.fail(p, reason).await;
                return;
            }
            p.pre_ops_done_for = Some(p.step_index);
        }

        if p.is_cancelled() {
            self.fail(p, "cancelled".to_string()).await;
            return;
        }

        let request = self.build_request(p, &step);
        debug!(
            "[agv][proc] id={} step={} submit type={} {} -> {} linked={:?}",
            p.id,
            p.step_index,
            request.mission_type,
            request.from_node,
            request.to_node,
            request.parameters.linked_mission
        );
        match self.fleet.submit_mission(&request).await {
            Ok(SubmitOutcome::Accepted { mission_id }) => {
                info!(
                    "[agv][proc] id={} step={} mission={mission_id} accepted",
                    p.id, p.step_index
                );
                p.outstanding_mission_id = Some(mission_id);
                p.status = MissionStatus::Accepted;
                p.miss_count = 0;
                self.publish(p);
            }
            Ok(SubmitOutcome::Rejected { reason }) => {
                p.status = MissionStatus::Rejected;
                let reason = format!("step {} rejected: {reason}", p.step_index);
                self.fail(p, reason).await;
            }
            Err(e) if e.class().is_retryable() => {
                self.record_miss(p, format!("step {} submit: {e}", p.step_index))
                    .await;
            }
            Err(e) => {
                let reason = format!("step {} submit: {e}", p.step_index);
                self.fail(p, reason).await;
            }
        }
    }

    fn build_request(&self, p: &MissionProcess, step: &MissionStepDefinition) -> MissionRequest {
        let now = Utc::now();
        MissionRequest {
            requestor: p
                .context
                .requestor
                .clone()
                .unwrap_or_else(|| self.config.requestor.clone()),
            mission_type: step.mission_type.clone(),
            from_node: step.from_node.clone(),
            to_node: step.to_node.clone(),
            cardinality: "1".to_string(),
            priority: step.priority,
            deadline: now + chrono::Duration::minutes(self.config.deadline_minutes),
            dispatch_time: now,
            parameters: MissionParameters {
                payload: step.payload.clone(),
                is_linkable: step.linkable,
                linked_mission: p.linked_mission_for_current(),
                link_wait_timeout: step.link_wait_timeout_secs,
            },
        }
    }

    /// Failure of the outstanding mission itself; a failed drop-off may be
    /// rerouted before the process fails.
    async fn fail_step(&self, p: &mut MissionProcess, reason: String) {
        p.outstanding_mission_id = None;
        if let Some(step) = p.current_step().cloned() {
            if self.config.reroute_on_drop_failure && step.role == StepRole::DropOff {
                if let Some(to_rack) = step.to_rack {
                    self.try_reroute(p, &step, to_rack).await;
                }
            }
        }
        self.fail(p, reason).await;
    }

    async fn try_reroute(&self, p: &mut MissionProcess, step: &MissionStepDefinition, to_rack: RackId) {
        let store = self.executor.store();
        let area = match store.get_rack(to_rack).await {
            Ok(Some(rack)) => rack.area,
            Ok(None) => {
                warn!("[agv][proc] id={} reroute: rack {to_rack} not found", p.id);
                return;
            }
            Err(e) => {
                warn!("[agv][proc] id={} reroute: {e}", p.id);
                return;
            }
        };
        let alternative = match store.find_empty_rack(&area).await {
            Ok(Some(rack)) if rack.id != to_rack => rack,
            Ok(_) => {
                self.ui.notifier.toast(
                    ToastLevel::Warning,
                    &format!("no empty rack left in area {area} for rerouting"),
                );
                return;
            }
            Err(e) => {
                warn!("[agv][proc] id={} reroute: {e}", p.id);
                return;
            }
        };

        let mut follow_up = step.clone();
        follow_up.description = format!("{} (reroute to {})", step.description, alternative.node);
        follow_up.to_node = alternative.node.clone();
        follow_up.to_rack = Some(alternative.id);
        follow_up.linkable = false;
        follow_up.pre_ops.clear();
        for op in &mut follow_up.post_ops {
            if let SubOperation::RackTransfer { destination, .. } = op {
                if *destination == to_rack {
                    *destination = alternative.id;
                }
            }
        }

        // Source racks still holding the goods move to the follow-up process.
        let mut handed_over = Vec::new();
        for op in &follow_up.post_ops {
            if let SubOperation::RackTransfer {
                source: TransferSource::Rack(src),
                ..
            } = op
            {
                if p.locked_racks.contains(src) && !p.released_racks.contains(src) {
                    p.released_racks.insert(*src);
                    handed_over.push(*src);
                }
            }
        }

        let context = ProcessContext {
            signal_coil: None,
            requestor: p.context.requestor.clone(),
            scratch: p.scratch.clone(),
        };
        let process_type = format!("{}-reroute", p.process_type);
        let result = self
            .register(
                &process_type,
                vec![follow_up],
                vec![alternative.id],
                handed_over.clone(),
                Some(context),
            )
            .await;
        match result {
            Ok(new_id) => {
                info!(
                    "[agv][proc] id={} rerouted {to_rack} -> {} as {new_id}",
                    p.id, alternative.id
                );
                self.ui.notifier.toast(
                    ToastLevel::Info,
                    &format!("drop-off rerouted to {}", alternative.node),
                );
            }
            Err(e) => {
                warn!("[agv][proc] id={} reroute failed: {e}", p.id);
                for src in &handed_over {
                    p.released_racks.remove(src);
                }
            }
        }
    }

    async fn fail(&self, p: &mut MissionProcess, reason: String) {
        error!(
            "[agv][proc] id={} type={} step={} failed: {reason}",
            p.id, p.process_type, p.step_index
        );
        p.phase = ProcessPhase::Failed;
        if !p.status.is_terminal_failure() {
            p.status = MissionStatus::Failed;
        }
        p.outstanding_mission_id = None;
        p.failure_reason = Some(reason);
        self.finalize(p).await;
    }

    /// Single exit for both outcomes: unlock, coil-off, toast, final snapshot.
    async fn finalize(&self, p: &mut MissionProcess) {
        if !p.locks_released {
            p.locks_released = true;
            let store = self.executor.store();
            for rack_id in p.locked_racks.clone() {
                if !p.released_racks.insert(rack_id) {
                    continue;
                }
                match store.set_lock(rack_id, false).await {
                    Ok(true) => self.ui.notifier.lock_state_changed(rack_id, false),
                    Ok(false) => warn!("[agv][proc] id={} unlock: rack {rack_id} not found", p.id),
                    Err(e) => error!("[agv][proc] id={} unlock rack {rack_id}: {e}", p.id),
                }
            }
        }

        if let Some(coil) = p.context.signal_coil {
            if let Err(e) = self.executor.gateway().write_coil(coil, false).await {
                error!("[agv][proc] id={} coil {coil} off: {e}", p.id);
            }
        }

        match p.phase {
            ProcessPhase::Finished => {
                info!("[agv][proc] id={} type={} finished", p.id, p.process_type);
                self.ui.notifier.toast(
                    ToastLevel::Info,
                    &format!("{} finished", p.process_type),
                );
            }
            _ => {
                let reason = p.failure_reason.clone().unwrap_or_default();
                self.ui.notifier.toast(
                    ToastLevel::Error,
                    &format!("{} failed: {reason}", p.process_type),
                );
            }
        }
        self.publish(p);
    }

    fn publish(&self, p: &mut MissionProcess) {
        self.board.publish(p.refresh_snapshot(None));
    }

    /// Drives `tick` on the configured period until stopped.
    pub fn spawn_poll_loop(self: &Arc<Self>) -> PollLoopHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let orchestrator = Arc::clone(self);
        let period = self.config.poll_interval();

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                        let current = Arc::clone(&orchestrator);
                        if let Err(e) = tokio::spawn(async move { current.tick().await }).await {
                            error!("[agv][tick] tick aborted: {e}");
                        }
                    }
                }
            }
            debug!("[agv][tick] poll loop stopped");
        });

        PollLoopHandle { stop_tx, join }
    }
}

pub struct PollLoopHandle {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl PollLoopHandle {
    /// Returns false when the loop did not exit within one second (a tick
    /// still in progress keeps running to completion).
    pub async fn stop(self) -> bool {
        let _ = self.stop_tx.send(true);
        match tokio::time::timeout(Duration::from_secs(1), self.join).await {
            Ok(join_result) => join_result.is_ok(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::dispatch::adapters::fleet::mock::MockFleetApi;
    use crate::dispatch::adapters::fleet::FleetError;
    use crate::dispatch::adapters::modbus::mock::MemoryGateway;
    use crate::dispatch::adapters::plc::mock::MemoryPlc;
    use crate::dispatch::adapters::store::memory::MemoryRackStore;
    use crate::dispatch::adapters::store::Rack;
    use crate::dispatch::adapters::ui::MemoryConsole;

    fn orchestrator(fleet: MockFleetApi, store: MemoryRackStore) -> (Arc<MissionOrchestrator>, MemoryConsole) {
        let console = MemoryConsole::new();
        let deps = OrchestratorDeps {
            fleet: Arc::new(fleet),
            plc: Arc::new(MemoryPlc::new()),
            gateway: Arc::new(MemoryGateway::new()),
            store: Arc::new(store),
            ui: UiPorts::from_console(&console),
        };
        let config = OrchestratorConfig {
            retry_backoff_ms: 0,
            ..OrchestratorConfig::default()
        };
        (Arc::new(MissionOrchestrator::new(deps, config)), console)
    }

    fn step(n: usize) -> MissionStepDefinition {
        MissionStepDefinition::new(format!("step {n}"), "move", "A", "B", "AGV01")
    }

    #[tokio::test]
    async fn initiate_rejects_empty_and_invalid_steps() {
        let (orch, _) = orchestrator(MockFleetApi::new(), MemoryRackStore::new());
        assert_eq!(
            orch.initiate_process("t", vec![], vec![], None).await,
            Err(OrchestratorError::EmptySteps)
        );

        let bad = step(0).with_post(SubOperation::SetFlag {
            name: String::new(),
            value: true,
        });
        assert!(matches!(
            orch.initiate_process("t", vec![bad], vec![], None).await,
            Err(OrchestratorError::InvalidStep { step: 0, .. })
        ));
        assert_eq!(orch.registered_count(), 0);
    }

    #[tokio::test]
    async fn initiate_locks_racks_and_submits_step_zero() {
        let fleet = MockFleetApi::new();
        let store = MemoryRackStore::with_racks([Rack {
            id: 5,
            visible: true,
            ..Rack::default()
        }]);
        let (orch, console) = orchestrator(fleet.clone(), store.clone());

        let id = orch
            .initiate_process("t", vec![step(0)], vec![5], None)
            .await
            .unwrap();

        assert!(store.rack(5).unwrap().locked);
        assert_eq!(console.lock_events(), vec![(5, true)]);
        assert_eq!(fleet.submitted().len(), 1);
        let snap = orch.snapshot(id).unwrap();
        assert_eq!(snap.status, MissionStatus::Accepted);
        assert_eq!(snap.mission_id.as_deref(), Some("M1"));
        assert_eq!(orch.active_count(), 1);
    }

    #[tokio::test]
    async fn overlapping_tick_is_skipped() {
        let (orch, _) = orchestrator(MockFleetApi::new(), MemoryRackStore::new());
        orch.ticking.store(true, Ordering::Release);
        assert!(!orch.tick().await);
        orch.ticking.store(false, Ordering::Release);
        assert!(orch.tick().await);
    }

    #[tokio::test]
    async fn transient_submit_error_is_retried_without_rerunning_pre_ops() {
        let fleet = MockFleetApi::new().with_auto_complete();
        fleet.script_submit(Err(FleetError::Transport {
            message: "connection reset".to_string(),
        }));
        let (orch, _) = orchestrator(fleet.clone(), MemoryRackStore::new());

        let first = step(0).with_pre(SubOperation::set_flag("pre", true).unwrap());
        let id = orch
            .initiate_process("t", vec![first], vec![], None)
            .await
            .unwrap();
        assert_eq!(orch.snapshot(id).unwrap().phase, ProcessPhase::Active);
        assert_eq!(orch.snapshot(id).unwrap().mission_id, None);

        orch.tick().await; // resubmits
        assert_eq!(fleet.submitted().len(), 2);
        orch.tick().await; // polls, auto-complete finishes
        assert_eq!(orch.snapshot(id).unwrap().phase, ProcessPhase::Finished);
    }

    #[tokio::test]
    async fn rejected_submission_fails_and_unlocks() {
        let fleet = MockFleetApi::new();
        fleet.script_submit(Ok(SubmitOutcome::Rejected {
            reason: "no vehicle".to_string(),
        }));
        let store = MemoryRackStore::with_racks([Rack {
            id: 3,
            ..Rack::default()
        }]);
        let (orch, console) = orchestrator(fleet, store.clone());

        let id = orch
            .initiate_process("t", vec![step(0)], vec![3], None)
            .await
            .unwrap();
        let snap = orch.snapshot(id).unwrap();
        assert_eq!(snap.phase, ProcessPhase::Failed);
        assert_eq!(snap.status, MissionStatus::Rejected);
        assert!(!store.rack(3).unwrap().locked);
        assert_eq!(store.lock_events(), vec![(3, true), (3, false)]);
        assert!(console
            .toasts()
            .iter()
            .any(|t| t.level == ToastLevel::Error));

        orch.tick().await;
        assert_eq!(orch.registered_count(), 0);
        assert!(orch.snapshot(id).is_none());
    }

    #[tokio::test]
    async fn extract_vehicle_passes_command_through() {
        let fleet = MockFleetApi::new();
        let (orch, _) = orchestrator(fleet.clone(), MemoryRackStore::new());
        orch.extract_vehicle("AGV07").await.unwrap();
        let commands = fleet.commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].0, "AGV07");
        assert_eq!(commands[0].1.name, "extract");
    }

    #[tokio::test]
    async fn cancel_unknown_process_is_an_error() {
        let (orch, _) = orchestrator(MockFleetApi::new(), MemoryRackStore::new());
        let id = Uuid::from_u128(42);
        assert_eq!(
            orch.cancel_process(id),
            Err(OrchestratorError::ProcessNotFound(id))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn poll_loop_ticks_until_stopped() {
        let fleet = MockFleetApi::new().with_auto_complete();
        let (orch, _) = orchestrator(fleet.clone(), MemoryRackStore::new());
        let id = orch
            .initiate_process("t", vec![step(0), step(1)], vec![], None)
            .await
            .unwrap();

        let handle = orch.spawn_poll_loop();
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(handle.stop().await);

        assert_eq!(fleet.submitted().len(), 2);
        assert!(orch.snapshot(id).map_or(true, |s| s.phase == ProcessPhase::Finished));
    }
}
