//! Fleet-dispatch API: mission submission, mission detail polling, vehicle commands.

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::dispatch::core::model::MissionStatus;

pub mod http;
pub mod mock;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FleetError {
    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("http status {status}")]
    Http { status: u16 },

    #[error("fleet api retcode {retcode}: {message}")]
    Retcode { retcode: i64, message: String },

    #[error("decode error: {message}")]
    Decode { message: String },
}

impl FleetError {
    /// Failures worth another attempt on a later tick.
    pub fn is_transient(&self) -> bool {
        match self {
            FleetError::Transport { .. } => true,
            FleetError::Http { status } => *status >= 500 || *status == 408 || *status == 429,
            FleetError::Retcode { .. } | FleetError::Decode { .. } => false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MissionParameters {
    /// Vehicle the mission is addressed to.
    pub payload: String,
    #[serde(rename = "isLinkable")]
    pub is_linkable: bool,
    #[serde(rename = "linkedMission")]
    pub linked_mission: Option<String>,
    #[serde(rename = "linkWaitTimeout")]
    pub link_wait_timeout: u32,
}

/// `POST missions` body.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MissionRequest {
    pub requestor: String,
    #[serde(rename = "missiontype")]
    pub mission_type: String,
    #[serde(rename = "fromnode")]
    pub from_node: String,
    #[serde(rename = "tonode")]
    pub to_node: String,
    pub cardinality: String,
    pub priority: i32,
    pub deadline: DateTime<Utc>,
    #[serde(rename = "dispatchtime")]
    pub dispatch_time: DateTime<Utc>,
    pub parameters: MissionParameters,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted { mission_id: String },
    Rejected { reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MissionDetail {
    pub mission_id: String,
    pub navigation_state: i64,
    pub vehicle: Option<String>,
}

impl MissionDetail {
    pub fn status(&self) -> Option<MissionStatus> {
        MissionStatus::from_navigation_state(self.navigation_state)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VehicleCommand {
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl VehicleCommand {
    /// Takes a vehicle out of the fleet's dispatch pool.
    pub fn extract() -> Self {
        Self {
            name: "extract".to_string(),
            args: serde_json::json!({}),
        }
    }
}

pub type FleetFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, FleetError>> + Send + 'a>>;

pub trait FleetApi: Send + Sync {
    fn submit_mission<'a>(&'a self, request: &'a MissionRequest) -> FleetFuture<'a, SubmitOutcome>;

    /// `Ok(None)` when the API does not know the mission (empty result).
    fn mission_detail<'a>(&'a self, mission_id: &'a str) -> FleetFuture<'a, Option<MissionDetail>>;

    fn vehicle_command<'a>(
        &'a self,
        vehicle: &'a str,
        command: &'a VehicleCommand,
    ) -> FleetFuture<'a, ()>;
}

// --- wire payloads ---

/// Mission ids arrive as JSON strings or numbers depending on server version.
fn id_to_string(value: serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn deserialize_ids<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let values: Option<Vec<serde_json::Value>> = Option::deserialize(deserializer)?;
    Ok(values
        .unwrap_or_default()
        .into_iter()
        .filter_map(id_to_string)
        .collect())
}

fn deserialize_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<serde_json::Value> = Option::deserialize(deserializer)?;
    Ok(value.and_then(id_to_string))
}

#[derive(Clone, Debug, Default, Deserialize)]
pub(crate) struct SubmitPayload {
    #[serde(default, rename = "acceptedmissions", deserialize_with = "deserialize_ids")]
    pub accepted: Vec<String>,
    #[serde(default, rename = "rejectedmissions", deserialize_with = "deserialize_ids")]
    pub rejected: Vec<String>,
    #[serde(default, rename = "pendingmissions", deserialize_with = "deserialize_ids")]
    pub pending: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct SubmitResponse {
    pub retcode: i64,
    #[serde(default)]
    pub payload: Option<SubmitPayload>,
}

impl SubmitResponse {
    pub(crate) fn into_outcome(self) -> SubmitOutcome {
        if self.retcode != 0 {
            return SubmitOutcome::Rejected {
                reason: format!("retcode {}", self.retcode),
            };
        }
        let payload = self.payload.unwrap_or_default();
        match payload
            .accepted
            .into_iter()
            .chain(payload.pending)
            .next()
        {
            Some(mission_id) => SubmitOutcome::Accepted { mission_id },
            None if !payload.rejected.is_empty() => SubmitOutcome::Rejected {
                reason: format!("rejected missions {:?}", payload.rejected),
            },
            None => SubmitOutcome::Rejected {
                reason: "no mission accepted".to_string(),
            },
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct WireMission {
    #[serde(default, rename = "missionid", deserialize_with = "deserialize_id")]
    pub mission_id: Option<String>,
    #[serde(default, rename = "navigationstate")]
    pub navigation_state: Option<i64>,
    #[serde(default, rename = "assignedto")]
    pub assigned_to: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub(crate) struct DetailPayload {
    #[serde(default)]
    pub missions: Vec<WireMission>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct DetailResponse {
    pub retcode: i64,
    #[serde(default)]
    pub payload: Option<DetailPayload>,
}

impl DetailResponse {
    pub(crate) fn into_detail(self, requested_id: &str) -> Option<MissionDetail> {
        if self.retcode != 0 {
            return None;
        }
        let mission = self.payload?.missions.into_iter().next()?;
        Some(MissionDetail {
            mission_id: mission
                .mission_id
                .unwrap_or_else(|| requested_id.to_string()),
            navigation_state: mission.navigation_state?,
            vehicle: mission.assigned_to,
        })
    }
}
