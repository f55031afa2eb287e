//! Mission data model: statuses, step definitions, processes and snapshots.
//!
//! Constraints:
//! - a process holds at most one outstanding (submitted, unresolved) mission id
//! - `step_index` never decreases while the process is active
//! - locked racks are released exactly once, on the terminal transition

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use super::sub_op::{SubOpValidationError, SubOperation};

pub type RackId = i64;
pub type ProcessId = Uuid;

/// Mission state as reported by the fleet API (`navigationstate`), plus the
/// local-only `Pending`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissionStatus {
    Pending,
    Received,
    Accepted,
    Rejected,
    Started,
    Completed,
    Cancelled,
    Failed,
}

impl MissionStatus {
    pub fn from_navigation_state(code: i64) -> Option<Self> {
        match code {
            0 => Some(MissionStatus::Received),
            1 => Some(MissionStatus::Accepted),
            2 => Some(MissionStatus::Rejected),
            3 => Some(MissionStatus::Started),
            4 => Some(MissionStatus::Completed),
            5 => Some(MissionStatus::Cancelled),
            7 => Some(MissionStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal_success(self) -> bool {
        self == MissionStatus::Completed
    }

    pub fn is_terminal_failure(self) -> bool {
        matches!(
            self,
            MissionStatus::Rejected | MissionStatus::Cancelled | MissionStatus::Failed
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            MissionStatus::Pending => "PENDING",
            MissionStatus::Received => "RECEIVED",
            MissionStatus::Accepted => "ACCEPTED",
            MissionStatus::Rejected => "REJECTED",
            MissionStatus::Started => "STARTED",
            MissionStatus::Completed => "COMPLETED",
            MissionStatus::Cancelled => "CANCELLED",
            MissionStatus::Failed => "FAILED",
        }
    }
}

/// Lifecycle of a whole process, independent of the current mission status.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProcessPhase {
    Active,
    Finished,
    Failed,
}

impl ProcessPhase {
    pub fn is_terminal(self) -> bool {
        self != ProcessPhase::Active
    }
}

/// Role of a step in a transport; only `DropOff` steps are eligible for reroute.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum StepRole {
    #[default]
    Transfer,
    Pickup,
    DropOff,
}

/// The three values shared between sub-operations and the operator UI.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub enum ScratchKey {
    BulletType,
    LotNo,
    BoxCount,
}

impl ScratchKey {
    pub const ALL: [ScratchKey; 3] = [ScratchKey::BulletType, ScratchKey::LotNo, ScratchKey::BoxCount];
}

/// Per-process scratch values; the only channel between sub-operations.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Scratch {
    pub bullet_type: String,
    pub lot_no: String,
    pub box_count: i32,
}

impl Scratch {
    pub fn text(&self, key: ScratchKey) -> String {
        match key {
            ScratchKey::BulletType => self.bullet_type.clone(),
            ScratchKey::LotNo => self.lot_no.clone(),
            ScratchKey::BoxCount => self.box_count.to_string(),
        }
    }

    /// Integer view of a field; text fields must parse.
    pub fn int(&self, key: ScratchKey) -> Option<i32> {
        match key {
            ScratchKey::BoxCount => Some(self.box_count),
            ScratchKey::BulletType => self.bullet_type.trim().parse().ok(),
            ScratchKey::LotNo => self.lot_no.trim().parse().ok(),
        }
    }

    /// Returns false when `value` is not an integer and `key` is `BoxCount`.
    pub fn set_text(&mut self, key: ScratchKey, value: &str) -> bool {
        match key {
            ScratchKey::BulletType => self.bullet_type = value.to_string(),
            ScratchKey::LotNo => self.lot_no = value.to_string(),
            ScratchKey::BoxCount => {
                let Ok(parsed) = value.trim().parse() else {
                    return false;
                };
                self.box_count = parsed;
            }
        }
        true
    }

    pub fn set_int(&mut self, key: ScratchKey, value: i32) {
        match key {
            ScratchKey::BulletType => self.bullet_type = value.to_string(),
            ScratchKey::LotNo => self.lot_no = value.to_string(),
            ScratchKey::BoxCount => self.box_count = value,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MissionStepDefinition {
    pub description: String,
    pub mission_type: String,
    pub from_node: String,
    pub to_node: String,
    pub priority: i32,
    /// Vehicle the mission is addressed to.
    pub payload: String,
    #[serde(default)]
    pub linkable: bool,
    #[serde(default)]
    pub link_wait_timeout_secs: u32,
    /// Discrete input that must be on before the mission is submitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard_input: Option<u16>,
    #[serde(default)]
    pub role: StepRole,
    /// Rack the vehicle drops at; used to reroute a failed drop-off.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_rack: Option<RackId>,
    #[serde(default)]
    pub pre_ops: Vec<SubOperation>,
    #[serde(default)]
    pub post_ops: Vec<SubOperation>,
}

impl MissionStepDefinition {
    pub fn new(
        description: impl Into<String>,
        mission_type: impl Into<String>,
        from_node: impl Into<String>,
        to_node: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            description: description.into(),
            mission_type: mission_type.into(),
            from_node: from_node.into(),
            to_node: to_node.into(),
            priority: 0,
            payload: payload.into(),
            linkable: false,
            link_wait_timeout_secs: 0,
            guard_input: None,
            role: StepRole::Transfer,
            to_rack: None,
            pre_ops: Vec::new(),
            post_ops: Vec::new(),
        }
    }

    pub fn linkable(mut self, wait_timeout_secs: u32) -> Self {
        self.linkable = true;
        self.link_wait_timeout_secs = wait_timeout_secs;
        self
    }

    pub fn with_role(mut self, role: StepRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_to_rack(mut self, rack_id: RackId) -> Self {
        self.to_rack = Some(rack_id);
        self
    }

    pub fn with_guard(mut self, address: u16) -> Self {
        self.guard_input = Some(address);
        self
    }

    pub fn with_pre(mut self, op: SubOperation) -> Self {
        self.pre_ops.push(op);
        self
    }

    pub fn with_post(mut self, op: SubOperation) -> Self {
        self.post_ops.push(op);
        self
    }

    pub fn validate(&self) -> Result<(), SubOpValidationError> {
        self.pre_ops
            .iter()
            .chain(self.post_ops.iter())
            .try_for_each(SubOperation::validate)
    }
}

/// Optional caller context attached at `initiate_process`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessContext {
    /// Coil that raised the request; switched off when the process ends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_coil: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requestor: Option<String>,
    /// Scratch values seeded before step 0.
    #[serde(default)]
    pub scratch: Scratch,
}

/// Denormalized progress view pushed to observers.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSnapshot {
    pub process_id: ProcessId,
    pub process_type: String,
    pub phase: ProcessPhase,
    pub status: MissionStatus,
    pub status_text: String,
    pub percent: u8,
    pub current_step_text: String,
    pub sub_op_text: String,
    pub mission_id: Option<String>,
    pub flags: BTreeMap<String, bool>,
    pub updated_at_utc: DateTime<Utc>,
}

#[derive(Debug)]
pub struct MissionProcess {
    pub id: ProcessId,
    pub process_type: String,
    pub steps: Vec<MissionStepDefinition>,
    pub step_index: usize,
    pub status: MissionStatus,
    pub phase: ProcessPhase,
    /// Submitted, not yet resolved mission id.
    pub outstanding_mission_id: Option<String>,
    /// Mission id of the most recently completed step.
    pub completed_mission_id: Option<String>,
    pub locked_racks: Vec<RackId>,
    /// Racks already unlocked by a copy-and-clear before the terminal transition.
    pub released_racks: HashSet<RackId>,
    pub locks_released: bool,
    pub scratch: Scratch,
    pub flags: BTreeMap<String, bool>,
    pub context: ProcessContext,
    pub cancel_rx: watch::Receiver<bool>,
    /// Consecutive transport errors / "mission not found" answers.
    pub miss_count: u32,
    pub backoff_until: Option<tokio::time::Instant>,
    /// Step whose pre-operations already ran (so a submit retry skips them).
    pub pre_ops_done_for: Option<usize>,
    pub failure_reason: Option<String>,
    pub snapshot: ProcessSnapshot,
    pub created_at_utc: DateTime<Utc>,
}

impl MissionProcess {
    pub fn new(
        id: ProcessId,
        process_type: impl Into<String>,
        steps: Vec<MissionStepDefinition>,
        locked_racks: Vec<RackId>,
        context: ProcessContext,
        cancel_rx: watch::Receiver<bool>,
    ) -> Self {
        let process_type = process_type.into();
        let now = Utc::now();
        let snapshot = ProcessSnapshot {
            process_id: id,
            process_type: process_type.clone(),
            phase: ProcessPhase::Active,
            status: MissionStatus::Pending,
            status_text: MissionStatus::Pending.label().to_string(),
            percent: 0,
            current_step_text: steps
                .first()
                .map(|s| s.description.clone())
                .unwrap_or_default(),
            sub_op_text: String::new(),
            mission_id: None,
            flags: BTreeMap::new(),
            updated_at_utc: now,
        };
        Self {
            id,
            process_type,
            steps,
            step_index: 0,
            status: MissionStatus::Pending,
            phase: ProcessPhase::Active,
            outstanding_mission_id: None,
            completed_mission_id: None,
            locked_racks,
            released_racks: HashSet::new(),
            locks_released: false,
            scratch: context.scratch.clone(),
            flags: BTreeMap::new(),
            context,
            cancel_rx,
            miss_count: 0,
            backoff_until: None,
            pre_ops_done_for: None,
            failure_reason: None,
            snapshot,
            created_at_utc: now,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    pub fn current_step(&self) -> Option<&MissionStepDefinition> {
        self.steps.get(self.step_index)
    }

    /// `linkedMission` for the step about to be submitted: the previous
    /// step's completed mission id iff that step was linkable.
    pub fn linked_mission_for_current(&self) -> Option<String> {
        let previous = self.step_index.checked_sub(1)?;
        if self.steps.get(previous)?.linkable {
            self.completed_mission_id.clone()
        } else {
            None
        }
    }

    pub fn percent(&self) -> u8 {
        if self.steps.is_empty() || self.phase == ProcessPhase::Finished {
            return 100;
        }
        ((self.step_index.min(self.steps.len()) * 100) / self.steps.len()) as u8
    }

    /// Rebuilds the observer snapshot from the live fields.
    pub fn refresh_snapshot(&mut self, sub_op_text: Option<String>) -> &ProcessSnapshot {
        let status_text = match (&self.phase, &self.failure_reason) {
            (ProcessPhase::Failed, Some(reason)) => format!("FAILED: {reason}"),
            (ProcessPhase::Failed, None) => "FAILED".to_string(),
            (ProcessPhase::Finished, _) => "FINISHED".to_string(),
            (ProcessPhase::Active, _) => self.status.label().to_string(),
        };
        self.snapshot.phase = self.phase;
        self.snapshot.status = self.status;
        self.snapshot.status_text = status_text;
        self.snapshot.percent = self.percent();
        self.snapshot.current_step_text = self
            .current_step()
            .map(|s| s.description.clone())
            .unwrap_or_default();
        if let Some(text) = sub_op_text {
            self.snapshot.sub_op_text = text;
        }
        self.snapshot.mission_id = self
            .outstanding_mission_id
            .clone()
            .or_else(|| self.completed_mission_id.clone());
        self.snapshot.flags = self.flags.clone();
        self.snapshot.updated_at_utc = Utc::now();
        &self.snapshot
    }
}
