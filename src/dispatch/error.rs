//! Error taxonomy shared by the executor and the orchestrator.
//!
//! Every adapter error maps to one `ErrorClass`; retry decisions are made on
//! the class, never on the concrete error.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::adapters::fleet::FleetError;
use super::adapters::modbus::GatewayError;
use super::adapters::plc::PlcError;
use super::adapters::store::StoreError;
use super::core::model::ProcessId;
use super::core::sub_op::SubOpValidationError;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorClass {
    /// I/O failure or "mission not found"; retried up to a bound.
    Transient,
    /// Negative answer from the far side (completion code, rejection); terminal.
    Protocol,
    /// Unknown rack or row; logged and treated as empty.
    MissingResource,
    OperatorDeclined,
    Cancelled,
    Unexpected,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        self == ErrorClass::Transient
    }
}

pub trait Classify {
    fn class(&self) -> ErrorClass;
}

impl Classify for PlcError {
    fn class(&self) -> ErrorClass {
        match self {
            PlcError::Timeout | PlcError::Comm { .. } => ErrorClass::Transient,
            PlcError::Frame(_) => ErrorClass::Protocol,
            PlcError::Device(_) => ErrorClass::Unexpected,
        }
    }
}

impl Classify for FleetError {
    fn class(&self) -> ErrorClass {
        if self.is_transient() {
            ErrorClass::Transient
        } else {
            ErrorClass::Protocol
        }
    }
}

impl Classify for GatewayError {
    fn class(&self) -> ErrorClass {
        match self {
            GatewayError::Timeout | GatewayError::Comm { .. } => ErrorClass::Transient,
            GatewayError::Exception { .. } => ErrorClass::Protocol,
        }
    }
}

impl Classify for StoreError {
    fn class(&self) -> ErrorClass {
        match self {
            StoreError::Backend { .. } => ErrorClass::Transient,
            StoreError::LedgerNotFound { .. } => ErrorClass::MissingResource,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("process {0} already registered")]
    DuplicateProcess(ProcessId),

    #[error("process {0} not found")]
    ProcessNotFound(ProcessId),

    #[error("process has no steps")]
    EmptySteps,

    #[error("step {step}: {source}")]
    InvalidStep {
        step: usize,
        #[source]
        source: SubOpValidationError,
    },

    #[error("rack store: {0}")]
    Store(#[from] StoreError),

    #[error("fleet api: {0}")]
    Fleet(#[from] FleetError),
}

impl Classify for OrchestratorError {
    fn class(&self) -> ErrorClass {
        match self {
            OrchestratorError::Store(e) => e.class(),
            OrchestratorError::Fleet(e) => e.class(),
            OrchestratorError::ProcessNotFound(_) => ErrorClass::MissingResource,
            OrchestratorError::DuplicateProcess(_)
            | OrchestratorError::EmptySteps
            | OrchestratorError::InvalidStep { .. } => ErrorClass::Unexpected,
        }
    }
}
