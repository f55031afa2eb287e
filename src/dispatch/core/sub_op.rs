//! Sub-operations: the smallest schedulable actions around a mission step.
//!
//! Variants carry only the parameters they need. Constructors validate the
//! fields that the type system cannot (word counts, timeouts), and
//! `SubOperation::validate` re-checks deserialized values before a process
//! is accepted.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::device::DeviceAddress;
use super::frame::MAX_WORDS_PER_REQUEST;
use super::model::{RackId, ScratchKey};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubOpValidationError {
    #[error("{op}: word count must be 1..={max}, got {got}")]
    WordCount { op: &'static str, max: u16, got: u16 },

    #[error("{op}: timeout must be greater than zero")]
    ZeroTimeout { op: &'static str },

    #[error("{op}: source and destination rack are the same ({rack})")]
    SameRack { op: &'static str, rack: RackId },

    #[error("{op}: flag name is empty")]
    EmptyFlag { op: &'static str },
}

/// Where a text value written to the PLC comes from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "from", content = "value")]
pub enum TextSource {
    Literal(String),
    Scratch(ScratchKey),
}

/// Where an integer value written to the PLC comes from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "from", content = "value")]
pub enum IntSource {
    Literal(i32),
    Scratch(ScratchKey),
}

/// Source side of a rack copy-and-clear.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "rackId")]
pub enum TransferSource {
    Rack(RackId),
    /// Staging location whose contents are typed in by the operator; values
    /// come from the UI scratch fields instead of another rack row.
    Staging,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SubOperation {
    ReadWord {
        address: DeviceAddress,
        into: ScratchKey,
    },
    ReadString {
        address: DeviceAddress,
        words: u16,
        into: ScratchKey,
    },
    ReadInt {
        address: DeviceAddress,
        into: ScratchKey,
    },
    WriteWord {
        address: DeviceAddress,
        value: IntSource,
    },
    WriteString {
        address: DeviceAddress,
        words: u16,
        value: TextSource,
    },
    WriteInt {
        address: DeviceAddress,
        value: IntSource,
    },
    /// Polls `address` until it reads `expected` or the timeout elapses
    /// (`None` takes the configured wait timeout).
    WaitForValue {
        address: DeviceAddress,
        expected: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    /// Loads bullet type, lot and box count of a rack into the scratch fields.
    RackRead { rack_id: RackId },
    /// Copies contents into `destination` and clears `source`.
    RackTransfer {
        source: TransferSource,
        destination: RackId,
    },
    /// Shows a scratch value in a UI field.
    Display { field: ScratchKey, from: ScratchKey },
    /// Fails unless the discrete input at `address` reads `expected`.
    GuardInput { address: u16, expected: bool },
    SetFlag { name: String, value: bool },
}

fn check_words(op: &'static str, words: u16) -> Result<(), SubOpValidationError> {
    if words == 0 || words > MAX_WORDS_PER_REQUEST {
        return Err(SubOpValidationError::WordCount {
            op,
            max: MAX_WORDS_PER_REQUEST,
            got: words,
        });
    }
    Ok(())
}

impl SubOperation {
    pub fn read_string(
        address: DeviceAddress,
        words: u16,
        into: ScratchKey,
    ) -> Result<Self, SubOpValidationError> {
        let op = Self::ReadString {
            address,
            words,
            into,
        };
        op.validate()?;
        Ok(op)
    }

    pub fn write_string(
        address: DeviceAddress,
        words: u16,
        value: TextSource,
    ) -> Result<Self, SubOpValidationError> {
        let op = Self::WriteString {
            address,
            words,
            value,
        };
        op.validate()?;
        Ok(op)
    }

    pub fn wait_for(
        address: DeviceAddress,
        expected: u16,
        timeout: Duration,
    ) -> Result<Self, SubOpValidationError> {
        let op = Self::WaitForValue {
            address,
            expected,
            timeout_ms: Some(timeout.as_millis().min(u128::from(u64::MAX)) as u64),
        };
        op.validate()?;
        Ok(op)
    }

    pub fn transfer(
        source: TransferSource,
        destination: RackId,
    ) -> Result<Self, SubOpValidationError> {
        let op = Self::RackTransfer {
            source,
            destination,
        };
        op.validate()?;
        Ok(op)
    }

    pub fn set_flag(name: impl Into<String>, value: bool) -> Result<Self, SubOpValidationError> {
        let op = Self::SetFlag {
            name: name.into(),
            value,
        };
        op.validate()?;
        Ok(op)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SubOperation::ReadWord { .. } => "readWord",
            SubOperation::ReadString { .. } => "readString",
            SubOperation::ReadInt { .. } => "readInt",
            SubOperation::WriteWord { .. } => "writeWord",
            SubOperation::WriteString { .. } => "writeString",
            SubOperation::WriteInt { .. } => "writeInt",
            SubOperation::WaitForValue { .. } => "waitForValue",
            SubOperation::RackRead { .. } => "rackRead",
            SubOperation::RackTransfer { .. } => "rackTransfer",
            SubOperation::Display { .. } => "display",
            SubOperation::GuardInput { .. } => "guardInput",
            SubOperation::SetFlag { .. } => "setFlag",
        }
    }

    pub fn validate(&self) -> Result<(), SubOpValidationError> {
        let op = self.name();
        match self {
            SubOperation::ReadString { words, .. } | SubOperation::WriteString { words, .. } => {
                check_words(op, *words)
            }
            SubOperation::WaitForValue { timeout_ms, .. } => {
                if *timeout_ms == Some(0) {
                    return Err(SubOpValidationError::ZeroTimeout { op });
                }
                Ok(())
            }
            SubOperation::RackTransfer {
                source: TransferSource::Rack(source),
                destination,
            } if source == destination => Err(SubOpValidationError::SameRack {
                op,
                rack: *destination,
            }),
            SubOperation::SetFlag { name, .. } if name.trim().is_empty() => {
                Err(SubOpValidationError::EmptyFlag { op })
            }
            _ => Ok(()),
        }
    }

    /// Destination rack of a transfer, if any.
    pub fn transfer_destination(&self) -> Option<RackId> {
        match self {
            SubOperation::RackTransfer { destination, .. } => Some(*destination),
            _ => None,
        }
    }
}

impl fmt::Display for SubOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubOperation::ReadWord { address, into } => write!(f, "read {address} -> {into:?}"),
            SubOperation::ReadString {
                address,
                words,
                into,
            } => write!(f, "read {address}x{words} -> {into:?}"),
            SubOperation::ReadInt { address, into } => write!(f, "read32 {address} -> {into:?}"),
            SubOperation::WriteWord { address, .. } => write!(f, "write {address}"),
            SubOperation::WriteString { address, words, .. } => {
                write!(f, "write {address}x{words}")
            }
            SubOperation::WriteInt { address, .. } => write!(f, "write32 {address}"),
            SubOperation::WaitForValue {
                address, expected, ..
            } => write!(f, "wait {address} == {expected}"),
            SubOperation::RackRead { rack_id } => write!(f, "rack read {rack_id}"),
            SubOperation::RackTransfer {
                source,
                destination,
            } => match source {
                TransferSource::Rack(src) => write!(f, "rack {src} -> {destination}"),
                TransferSource::Staging => write!(f, "staging -> {destination}"),
            },
            SubOperation::Display { field, .. } => write!(f, "display {field:?}"),
            SubOperation::GuardInput { address, expected } => {
                write!(f, "guard input {address} == {expected}")
            }
            SubOperation::SetFlag { name, value } => write!(f, "flag {name} = {value}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(text: &str) -> DeviceAddress {
        DeviceAddress::parse(text).unwrap()
    }

    #[test]
    fn constructors_reject_illegal_combinations() {
        assert!(matches!(
            SubOperation::read_string(d("D10"), 0, ScratchKey::LotNo),
            Err(SubOpValidationError::WordCount { got: 0, .. })
        ));
        assert!(matches!(
            SubOperation::wait_for(d("D10"), 1, Duration::ZERO),
            Err(SubOpValidationError::ZeroTimeout { .. })
        ));
        assert!(matches!(
            SubOperation::transfer(TransferSource::Rack(4), 4),
            Err(SubOpValidationError::SameRack { rack: 4, .. })
        ));
        assert!(SubOperation::set_flag(" ", true).is_err());
        assert!(SubOperation::transfer(TransferSource::Staging, 4).is_ok());
    }

    #[test]
    fn json_shape_is_tagged_and_camel_case() {
        let op = SubOperation::wait_for(d("D300"), 1, Duration::from_secs(60)).unwrap();
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "op": "waitForValue",
                "address": "D300",
                "expected": 1,
                "timeoutMs": 60000
            })
        );

        let parsed: SubOperation = serde_json::from_value(serde_json::json!({
            "op": "rackTransfer",
            "source": { "kind": "rack", "rackId": 7 },
            "destination": 9
        }))
        .unwrap();
        assert_eq!(parsed.transfer_destination(), Some(9));

        let default_wait: SubOperation = serde_json::from_value(serde_json::json!({
            "op": "waitForValue",
            "address": "D300",
            "expected": 2
        }))
        .unwrap();
        assert!(matches!(
            default_wait,
            SubOperation::WaitForValue { timeout_ms: None, .. }
        ));
    }
}
