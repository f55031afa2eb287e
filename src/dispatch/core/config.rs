//! Dispatch configuration (persisted as `dispatch.v1.json`).
//!
//! Constraints:
//! - top-level JSON must carry `schemaVersion: 1`
//! - every timeout is configurable per call site; missing fields take defaults

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::frame::FrameRoute;

pub const SCHEMA_VERSION_V1: u32 = 1;

/// How a failed register read inside a wait loop is treated.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum WaitReadFailure {
    /// Count the failed read as "value not reached yet".
    #[default]
    KeepWaiting,
    /// Abort the wait with the communication error.
    Fail,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestratorConfig {
    pub poll_interval_ms: u64,
    pub max_poll_misses: u32,
    pub retry_backoff_ms: u64,
    pub wait_interval_ms: u64,
    pub wait_timeout_ms: u64,
    pub wait_read_failure: WaitReadFailure,
    pub requestor: String,
    pub deadline_minutes: i64,
    pub reroute_on_drop_failure: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            max_poll_misses: 3,
            retry_backoff_ms: 2000,
            wait_interval_ms: 500,
            wait_timeout_ms: 60_000,
            wait_read_failure: WaitReadFailure::KeepWaiting,
            requestor: "agv-dispatch".to_string(),
            deadline_minutes: 60,
            reroute_on_drop_failure: true,
        }
    }
}

impl OrchestratorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn wait_interval(&self) -> Duration {
        Duration::from_millis(self.wait_interval_ms.max(1))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct PlcConfig {
    pub host: String,
    pub port: u16,
    #[serde(flatten)]
    pub route: FrameRoute,
    pub connect_timeout_ms: u64,
    pub io_timeout_ms: u64,
    /// Extra attempts for a sub-operation hit by a timeout or socket error.
    pub retry_count: u32,
    pub retry_delay_ms: u64,
}

impl Default for PlcConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            route: FrameRoute::default(),
            connect_timeout_ms: 5000,
            io_timeout_ms: 3000,
            retry_count: 2,
            retry_delay_ms: 200,
        }
    }
}

impl PlcConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct FleetConfig {
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// `None` keeps the HTTP client's default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8081/wms/rest".to_string(),
            api_key: None,
            timeout_ms: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ModbusConfig {
    pub ip: String,
    pub port: u16,
    pub unit_id: u8,
    pub timeout_ms: u64,
    pub retry_count: u32,
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
            port: 502,
            unit_id: 1,
            timeout_ms: 1000,
            retry_count: 2,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DispatchConfigV1 {
    pub schema_version: u32,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub plc: PlcConfig,
    #[serde(default)]
    pub fleet: FleetConfig,
    #[serde(default)]
    pub modbus: ModbusConfig,
}

impl Default for DispatchConfigV1 {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1,
            orchestrator: OrchestratorConfig::default(),
            plc: PlcConfig::default(),
            fleet: FleetConfig::default(),
            modbus: ModbusConfig::default(),
        }
    }
}
