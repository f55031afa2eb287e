//! Sub-operation executor.
//!
//! Runs one pre- or post-operation list of a step strictly in order. The
//! first failing or cancelled operation aborts the rest of the list; what
//! happens to the process is decided by the caller.
//!
//! Constraints:
//! - read operations write the process scratch fields; later operations read them
//! - cancellation is checked before every operation and inside every wait
//! - a rack transfer copies into the destination, then clears the source and
//!   releases its lock (the process records it so the finalizer skips it)

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use crate::dispatch::adapters::modbus::{GatewayError, ModbusGateway};
use crate::dispatch::adapters::plc::{PlcError, PlcFuture, PlcPort};
use crate::dispatch::adapters::store::{LedgerEntry, Rack, RackStore, StoreError};
use crate::dispatch::adapters::ui::{TimeoutDecision, TimeoutPrompt, UiPorts};
use crate::dispatch::core::config::WaitReadFailure;
use crate::dispatch::core::device::DeviceAddress;
use crate::dispatch::core::model::{MissionProcess, RackId, ScratchKey};
use crate::dispatch::core::sub_op::{IntSource, SubOperation, TextSource, TransferSource};
use crate::dispatch::error::{Classify, ErrorClass};

use super::policy::{PlcRetryPolicy, WaitPolicy};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecError {
    #[error("{op}: plc: {source}")]
    Plc {
        op: &'static str,
        #[source]
        source: PlcError,
    },

    #[error("{op}: modbus: {source}")]
    Gateway {
        op: &'static str,
        #[source]
        source: GatewayError,
    },

    #[error("{op}: store: {source}")]
    Store {
        op: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("guard input {address} is {actual}, expected {expected}")]
    GuardMismatch {
        address: u16,
        expected: bool,
        actual: bool,
    },

    #[error("{op}: {message}")]
    InvalidValue { op: &'static str, message: String },

    #[error("operator declined to keep waiting for {address} after {waited_ms} ms")]
    OperatorDeclined { address: String, waited_ms: u64 },

    #[error("cancelled")]
    Cancelled,

    /// A collaborator panicked inside the operation.
    #[error("{op}: unexpected failure: {message}")]
    Unexpected { op: &'static str, message: String },
}

impl Classify for ExecError {
    fn class(&self) -> ErrorClass {
        match self {
            ExecError::Plc { source, .. } => source.class(),
            ExecError::Gateway { source, .. } => source.class(),
            ExecError::Store { source, .. } => source.class(),
            ExecError::GuardMismatch { .. } => ErrorClass::Protocol,
            ExecError::InvalidValue { .. } => ErrorClass::Unexpected,
            ExecError::OperatorDeclined { .. } => ErrorClass::OperatorDeclined,
            ExecError::Cancelled => ErrorClass::Cancelled,
            ExecError::Unexpected { .. } => ErrorClass::Unexpected,
        }
    }
}

/// Resolves once the cancellation flag is set; never resolves if the sender
/// is gone without having set it.
pub(crate) async fn wait_stop(mut stop_rx: watch::Receiver<bool>) {
    loop {
        if *stop_rx.borrow() {
            return;
        }
        if stop_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "panic".to_string()
    }
}

/// Awaits `fut`; a panic inside it comes back as `ExecError::Unexpected`.
async fn contained<T>(
    op: &'static str,
    fut: impl Future<Output = Result<T, ExecError>>,
) -> Result<T, ExecError> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(ExecError::Unexpected {
            op,
            message: panic_message(payload.as_ref()),
        }),
    }
}

/// Contents moved by a rack transfer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Contents {
    bullet_type: String,
    lot_no: String,
    box_count: i32,
}

impl Contents {
    fn of(rack: &Rack) -> Self {
        Self {
            bullet_type: rack.bullet_type.clone(),
            lot_no: rack.lot_no.clone(),
            box_count: rack.box_count,
        }
    }
}

pub struct SubOperationExecutor {
    plc: Arc<dyn PlcPort>,
    gateway: Arc<dyn ModbusGateway>,
    store: Arc<dyn RackStore>,
    ui: UiPorts,
    wait: WaitPolicy,
    plc_retry: PlcRetryPolicy,
}

impl SubOperationExecutor {
    pub fn new(
        plc: Arc<dyn PlcPort>,
        gateway: Arc<dyn ModbusGateway>,
        store: Arc<dyn RackStore>,
        ui: UiPorts,
        wait: WaitPolicy,
    ) -> Self {
        Self {
            plc,
            gateway,
            store,
            ui,
            wait,
            plc_retry: PlcRetryPolicy::default(),
        }
    }

    pub fn set_plc_retry(&mut self, policy: PlcRetryPolicy) {
        self.plc_retry = policy;
    }

    pub fn store(&self) -> &Arc<dyn RackStore> {
        &self.store
    }

    pub fn gateway(&self) -> &Arc<dyn ModbusGateway> {
        &self.gateway
    }

    /// Runs `ops` in order; stops at the first error.
    pub async fn run_all(
        &self,
        process: &mut MissionProcess,
        ops: &[SubOperation],
    ) -> Result<(), ExecError> {
        for (i, op) in ops.iter().enumerate() {
            if process.is_cancelled() {
                return Err(ExecError::Cancelled);
            }
            let text = op.to_string();
            debug!(
                "[agv][exec] proc={} step={} op={}/{} {}",
                process.id,
                process.step_index,
                i + 1,
                ops.len(),
                text
            );
            let current = &mut *process;
            let outcome = contained(op.name(), async move {
                self.ui
                    .snapshots
                    .publish(current.refresh_snapshot(Some(text)));
                self.run_one(current, op).await
            })
            .await;

            if let Err(e) = outcome {
                warn!(
                    "[agv][exec] proc={} step={} op={} failed: {}",
                    process.id,
                    process.step_index,
                    op.name(),
                    e
                );
                return Err(e);
            }
        }
        Ok(())
    }

    pub async fn run_one(
        &self,
        process: &mut MissionProcess,
        op: &SubOperation,
    ) -> Result<(), ExecError> {
        let op_name = op.name();

        match op {
            SubOperation::ReadWord { address, into } => {
                let value = self
                    .plc_call(process, op_name, || self.plc.read_word(*address))
                    .await?;
                process.scratch.set_int(*into, i32::from(value));
            }
            SubOperation::ReadString {
                address,
                words,
                into,
            } => {
                let text = self
                    .plc_call(process, op_name, || self.plc.read_string(*address, *words))
                    .await?;
                if !process.scratch.set_text(*into, &text) {
                    return Err(ExecError::InvalidValue {
                        op: op_name,
                        message: format!("{text:?} is not a number for {into:?}"),
                    });
                }
            }
            SubOperation::ReadInt { address, into } => {
                let value = self
                    .plc_call(process, op_name, || self.plc.read_int32(*address))
                    .await?;
                process.scratch.set_int(*into, value);
            }
            SubOperation::WriteWord { address, value } => {
                let value = resolve_int(process, op_name, value)?;
                let word = to_word(value).ok_or_else(|| ExecError::InvalidValue {
                    op: op_name,
                    message: format!("{value} does not fit in one word"),
                })?;
                self.plc_call(process, op_name, || self.plc.write_word(*address, word))
                    .await?;
            }
            SubOperation::WriteString {
                address,
                words,
                value,
            } => {
                let text = match value {
                    TextSource::Literal(text) => text.clone(),
                    TextSource::Scratch(key) => process.scratch.text(*key),
                };
                self.plc_call(process, op_name, || {
                    self.plc.write_string(*address, *words, &text)
                })
                .await?;
            }
            SubOperation::WriteInt { address, value } => {
                let value = resolve_int(process, op_name, value)?;
                self.plc_call(process, op_name, || self.plc.write_int32(*address, value))
                    .await?;
            }
            SubOperation::WaitForValue {
                address,
                expected,
                timeout_ms,
            } => {
                self.wait_for_value(process, *address, *expected, *timeout_ms)
                    .await?;
            }
            SubOperation::RackRead { rack_id } => {
                let contents = self.rack_contents(op_name, *rack_id).await?;
                process.scratch.bullet_type = contents.bullet_type;
                process.scratch.lot_no = contents.lot_no;
                process.scratch.box_count = contents.box_count;
            }
            SubOperation::RackTransfer {
                source,
                destination,
            } => {
                self.transfer(process, source, *destination).await?;
            }
            SubOperation::Display { field, from } => {
                self.ui.scratch.set(*field, &process.scratch.text(*from));
            }
            SubOperation::GuardInput { address, expected } => {
                self.read_guard(*address, *expected).await?;
            }
            SubOperation::SetFlag { name, value } => {
                process.flags.insert(name.clone(), *value);
            }
        }
        Ok(())
    }

    /// One PLC call; timeouts and socket errors are retried within `plc_retry`.
    async fn plc_call<'c, T>(
        &self,
        process: &MissionProcess,
        op: &'static str,
        call: impl Fn() -> PlcFuture<'c, T>,
    ) -> Result<T, ExecError> {
        let mut attempt: u32 = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(source)
                    if source.class().is_retryable() && self.plc_retry.allows_retry(attempt) =>
                {
                    attempt += 1;
                    warn!(
                        "[agv][exec] proc={} {op} retry {attempt}/{}: {source}",
                        process.id, self.plc_retry.retries
                    );
                    tokio::select! {
                        _ = wait_stop(process.cancel_rx.clone()) => return Err(ExecError::Cancelled),
                        _ = tokio::time::sleep(self.plc_retry.delay) => {}
                    }
                }
                Err(source) => return Err(ExecError::Plc { op, source }),
            }
        }
    }

    /// Fails unless discrete input `address` reads `expected`.
    pub async fn check_guard(&self, address: u16, expected: bool) -> Result<(), ExecError> {
        contained("guardInput", self.read_guard(address, expected)).await
    }

    async fn read_guard(&self, address: u16, expected: bool) -> Result<(), ExecError> {
        let bits = self
            .gateway
            .read_discrete_inputs(address, 1)
            .await
            .map_err(|source| ExecError::Gateway {
                op: "guardInput",
                source,
            })?;
        let actual = bits.first().copied().unwrap_or(false);
        if actual != expected {
            return Err(ExecError::GuardMismatch {
                address,
                expected,
                actual,
            });
        }
        Ok(())
    }

    async fn wait_for_value(
        &self,
        process: &mut MissionProcess,
        address: DeviceAddress,
        expected: u16,
        timeout_ms: Option<u64>,
    ) -> Result<(), ExecError> {
        let timeout = self.wait.timeout_for(timeout_ms);
        let mut attempt: u32 = 0;

        loop {
            let started = Instant::now();
            let deadline = started + timeout;
            let mut last_value = None;

            loop {
                if process.is_cancelled() {
                    return Err(ExecError::Cancelled);
                }
                match self.plc.read_word(address).await {
                    Ok(value) if value == expected => return Ok(()),
                    Ok(value) => last_value = Some(value),
                    Err(e) => match self.wait.on_read_failure {
                        WaitReadFailure::KeepWaiting => {
                            debug!(
                                "[agv][exec] proc={} wait {address} read failed, still waiting: {e}",
                                process.id
                            );
                        }
                        WaitReadFailure::Fail => {
                            return Err(ExecError::Plc {
                                op: "waitForValue",
                                source: e,
                            });
                        }
                    },
                }

                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let pause = self.wait.interval.min(deadline - now);
                tokio::select! {
                    _ = wait_stop(process.cancel_rx.clone()) => return Err(ExecError::Cancelled),
                    _ = tokio::time::sleep(pause) => {}
                }
            }

            attempt += 1;
            let waited = started.elapsed();
            let prompt = TimeoutPrompt {
                process_id: process.id,
                address: address.to_string(),
                expected,
                last_value,
                waited,
                attempt,
            };
            let decision = tokio::select! {
                _ = wait_stop(process.cancel_rx.clone()) => return Err(ExecError::Cancelled),
                decision = self.ui.decider.decide(&prompt) => decision,
            };
            match decision {
                TimeoutDecision::Retry => {
                    info!(
                        "[agv][exec] proc={} wait {address} == {expected} timed out, operator retries (attempt {attempt})",
                        process.id
                    );
                }
                TimeoutDecision::Abort => {
                    return Err(ExecError::OperatorDeclined {
                        address: address.to_string(),
                        waited_ms: waited.as_millis().min(u128::from(u64::MAX)) as u64,
                    });
                }
            }
        }
    }

    /// Missing racks read as empty.
    async fn rack_contents(&self, op: &'static str, rack_id: RackId) -> Result<Contents, ExecError> {
        match self.store.get_rack(rack_id).await {
            Ok(Some(rack)) => Ok(Contents::of(&rack)),
            Ok(None) => {
                warn!("[agv][exec] rack {rack_id} not found, treated as empty");
                Ok(Contents::default())
            }
            Err(source) => Err(ExecError::Store { op, source }),
        }
    }

    fn staging_contents(&self, op: &'static str) -> Result<Contents, ExecError> {
        let box_text = self.ui.scratch.get(ScratchKey::BoxCount);
        let box_count = if box_text.trim().is_empty() {
            0
        } else {
            box_text
                .trim()
                .parse()
                .map_err(|_| ExecError::InvalidValue {
                    op,
                    message: format!("box count {box_text:?} is not a number"),
                })?
        };
        Ok(Contents {
            bullet_type: self.ui.scratch.get(ScratchKey::BulletType),
            lot_no: self.ui.scratch.get(ScratchKey::LotNo),
            box_count,
        })
    }

    async fn transfer(
        &self,
        process: &mut MissionProcess,
        source: &TransferSource,
        destination: RackId,
    ) -> Result<(), ExecError> {
        const OP: &str = "rackTransfer";
        let store_err = |source| ExecError::Store { op: OP, source };

        let contents = match source {
            TransferSource::Rack(rack_id) => self.rack_contents(OP, *rack_id).await?,
            TransferSource::Staging => self.staging_contents(OP)?,
        };

        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            process_id: process.id,
            source: match source {
                TransferSource::Rack(rack_id) => Some(*rack_id),
                TransferSource::Staging => None,
            },
            destination,
            bullet_type: contents.bullet_type.clone(),
            lot_no: contents.lot_no.clone(),
            box_count: contents.box_count,
            started_at_utc: Utc::now(),
            completed_at_utc: None,
        };
        self.store.insert_ledger(&entry).await.map_err(store_err)?;

        match self.store.get_rack(destination).await.map_err(store_err)? {
            Some(mut rack) => {
                rack.bullet_type = contents.bullet_type.clone();
                rack.lot_no = contents.lot_no.clone();
                rack.box_count = contents.box_count;
                self.store.update_rack(&rack).await.map_err(store_err)?;
            }
            None => warn!("[agv][exec] destination rack {destination} not found, copy skipped"),
        }

        match source {
            TransferSource::Rack(rack_id) => {
                self.clear_source_rack(process, *rack_id).await?;
            }
            TransferSource::Staging => {
                self.ui.scratch.set(ScratchKey::BulletType, "");
                self.ui.scratch.set(ScratchKey::LotNo, "");
                self.ui.scratch.set(ScratchKey::BoxCount, "0");
            }
        }

        self.store
            .complete_ledger(entry.id, Utc::now())
            .await
            .map_err(store_err)?;
        info!(
            "[agv][exec] proc={} transfer {} -> {destination} lot={:?} boxes={}",
            process.id, entry.source.map_or("staging".to_string(), |id| id.to_string()),
            contents.lot_no, contents.box_count
        );
        Ok(())
    }

    async fn clear_source_rack(
        &self,
        process: &mut MissionProcess,
        rack_id: RackId,
    ) -> Result<(), ExecError> {
        let store_err = |source| ExecError::Store {
            op: "rackTransfer",
            source,
        };
        let Some(mut rack) = self.store.get_rack(rack_id).await.map_err(store_err)? else {
            warn!("[agv][exec] source rack {rack_id} not found, clear skipped");
            return Ok(());
        };
        let was_locked = rack.locked;
        rack.clear_contents();
        rack.locked = false;
        self.store.update_rack(&rack).await.map_err(store_err)?;

        if process.locked_racks.contains(&rack_id) {
            process.released_racks.insert(rack_id);
        }
        if was_locked {
            self.ui.notifier.lock_state_changed(rack_id, false);
        }
        Ok(())
    }
}

fn resolve_int(
    process: &MissionProcess,
    op: &'static str,
    value: &IntSource,
) -> Result<i32, ExecError> {
    match value {
        IntSource::Literal(v) => Ok(*v),
        IntSource::Scratch(key) => process.scratch.int(*key).ok_or_else(|| ExecError::InvalidValue {
            op,
            message: format!("{key:?} = {:?} is not a number", process.scratch.text(*key)),
        }),
    }
}

/// Unsigned word, or a negative value in two's complement.
fn to_word(value: i32) -> Option<u16> {
    u16::try_from(value)
        .ok()
        .or_else(|| i16::try_from(value).ok().map(|v| v as u16))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::dispatch::adapters::modbus::mock::MemoryGateway;
    use crate::dispatch::adapters::plc::mock::MemoryPlc;
    use crate::dispatch::adapters::store::memory::MemoryRackStore;
    use crate::dispatch::adapters::ui::{AlwaysRetry, MemoryConsole, RetryTimes, ScratchPad};
    use crate::dispatch::core::device::DeviceError;
    use crate::dispatch::core::model::{MissionStepDefinition, ProcessContext};

    struct Fixture {
        plc: MemoryPlc,
        gateway: MemoryGateway,
        store: MemoryRackStore,
        console: MemoryConsole,
        executor: SubOperationExecutor,
    }

    fn fixture_with(console: MemoryConsole, on_read_failure: WaitReadFailure) -> Fixture {
        let plc = MemoryPlc::new();
        let gateway = MemoryGateway::new();
        let store = MemoryRackStore::with_racks([
            Rack {
                id: 1,
                node: "P01".to_string(),
                area: "A".to_string(),
                bullet_type: "5.56".to_string(),
                lot_no: "L-100".to_string(),
                box_count: 8,
                locked: true,
                visible: true,
                ..Rack::default()
            },
            Rack {
                id: 2,
                node: "P02".to_string(),
                area: "A".to_string(),
                visible: true,
                ..Rack::default()
            },
        ]);
        let executor = SubOperationExecutor::new(
            Arc::new(plc.clone()),
            Arc::new(gateway.clone()),
            Arc::new(store.clone()),
            UiPorts::from_console(&console),
            WaitPolicy {
                interval: Duration::from_millis(500),
                timeout: Duration::from_secs(60),
                on_read_failure,
            },
        );
        Fixture {
            plc,
            gateway,
            store,
            console,
            executor,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MemoryConsole::new(), WaitReadFailure::KeepWaiting)
    }

    fn process(locked: Vec<RackId>) -> (watch::Sender<bool>, MissionProcess) {
        let (tx, rx) = watch::channel(false);
        let p = MissionProcess::new(
            Uuid::new_v4(),
            "test",
            vec![MissionStepDefinition::new("s", "move", "A", "B", "AGV01")],
            locked,
            ProcessContext::default(),
            rx,
        );
        (tx, p)
    }

    fn d(text: &str) -> DeviceAddress {
        DeviceAddress::parse(text).unwrap()
    }

    #[tokio::test]
    async fn read_then_write_passes_values_through_scratch() {
        let f = fixture();
        f.plc.set_string(d("D200"), 5, "LOT-77");
        f.plc.set_word(d("D210"), 12);
        let (_tx, mut p) = process(vec![]);

        let ops = vec![
            SubOperation::ReadString {
                address: d("D200"),
                words: 5,
                into: ScratchKey::LotNo,
            },
            SubOperation::ReadWord {
                address: d("D210"),
                into: ScratchKey::BoxCount,
            },
            SubOperation::WriteString {
                address: d("D300"),
                words: 5,
                value: TextSource::Scratch(ScratchKey::LotNo),
            },
            SubOperation::WriteWord {
                address: d("D310"),
                value: IntSource::Scratch(ScratchKey::BoxCount),
            },
            SubOperation::Display {
                field: ScratchKey::LotNo,
                from: ScratchKey::LotNo,
            },
        ];
        f.executor.run_all(&mut p, &ops).await.unwrap();

        assert_eq!(f.plc.string(d("D300"), 5), "LOT-77");
        assert_eq!(f.plc.word(d("D310")), 12);
        assert_eq!(f.console.field(ScratchKey::LotNo), "LOT-77");
        assert!(!f.console.snapshots().is_empty());
    }

    #[tokio::test]
    async fn first_failure_aborts_the_rest() {
        let f = fixture();
        f.gateway.set_input(4, false);
        let (_tx, mut p) = process(vec![]);

        let ops = vec![
            SubOperation::WriteWord {
                address: d("D1"),
                value: IntSource::Literal(1),
            },
            SubOperation::GuardInput {
                address: 4,
                expected: true,
            },
            SubOperation::WriteWord {
                address: d("D2"),
                value: IntSource::Literal(2),
            },
        ];
        let err = f.executor.run_all(&mut p, &ops).await.unwrap_err();
        assert!(matches!(err, ExecError::GuardMismatch { address: 4, .. }));
        assert_eq!(f.plc.writes().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_process_runs_nothing() {
        let f = fixture();
        let (tx, mut p) = process(vec![]);
        tx.send(true).unwrap();

        let ops = vec![SubOperation::WriteWord {
            address: d("D1"),
            value: IntSource::Literal(1),
        }];
        let err = f.executor.run_all(&mut p, &ops).await.unwrap_err();
        assert_eq!(err, ExecError::Cancelled);
        assert_eq!(err.class(), ErrorClass::Cancelled);
        assert!(f.plc.writes().is_empty());
    }

    #[tokio::test]
    async fn rack_transfer_copies_clears_and_releases_source() {
        let f = fixture();
        let (_tx, mut p) = process(vec![1, 2]);

        let op = SubOperation::transfer(TransferSource::Rack(1), 2).unwrap();
        f.executor.run_all(&mut p, &[op]).await.unwrap();

        let dest = f.store.rack(2).unwrap();
        assert_eq!(dest.lot_no, "L-100");
        assert_eq!(dest.box_count, 8);
        let src = f.store.rack(1).unwrap();
        assert!(src.is_empty());
        assert!(!src.locked);

        assert!(p.released_racks.contains(&1));
        assert!(!p.released_racks.contains(&2));
        assert_eq!(f.console.lock_events(), vec![(1, false)]);

        let ledger = f.store.ledger();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].source, Some(1));
        assert!(ledger[0].completed_at_utc.is_some());
    }

    #[tokio::test]
    async fn staging_transfer_takes_values_from_ui_fields() {
        let f = fixture();
        f.console.type_field(ScratchKey::BulletType, "7.62");
        f.console.type_field(ScratchKey::LotNo, "L-STG");
        f.console.type_field(ScratchKey::BoxCount, "3");
        let (_tx, mut p) = process(vec![]);

        let op = SubOperation::transfer(TransferSource::Staging, 2).unwrap();
        f.executor.run_all(&mut p, &[op]).await.unwrap();

        let dest = f.store.rack(2).unwrap();
        assert_eq!(dest.bullet_type, "7.62");
        assert_eq!(dest.box_count, 3);
        assert_eq!(f.console.field(ScratchKey::LotNo), "");
        assert_eq!(f.store.ledger()[0].source, None);
    }

    #[tokio::test]
    async fn missing_rack_reads_as_empty() {
        let f = fixture();
        let (_tx, mut p) = process(vec![]);
        p.scratch.lot_no = "stale".to_string();

        f.executor
            .run_all(&mut p, &[SubOperation::RackRead { rack_id: 99 }])
            .await
            .unwrap();
        assert_eq!(p.scratch.lot_no, "");
        assert_eq!(p.scratch.box_count, 0);
    }

    #[tokio::test]
    async fn set_flag_is_published_with_snapshot() {
        let f = fixture();
        let (_tx, mut p) = process(vec![]);
        let ops = vec![
            SubOperation::set_flag("doorOpen", true).unwrap(),
            SubOperation::WriteWord {
                address: d("D1"),
                value: IntSource::Literal(-1),
            },
        ];
        f.executor.run_all(&mut p, &ops).await.unwrap();

        assert_eq!(p.flags.get("doorOpen"), Some(&true));
        assert_eq!(f.plc.word(d("D1")), 0xFFFF);
        let last = f.console.snapshots().pop().unwrap();
        assert_eq!(last.flags.get("doorOpen"), Some(&true));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_and_operator_declines() {
        let f = fixture();
        let (_tx, mut p) = process(vec![]);
        let op = SubOperation::wait_for(d("D500"), 1, Duration::from_secs(60)).unwrap();

        let err = f.executor.run_all(&mut p, &[op]).await.unwrap_err();
        match err {
            ExecError::OperatorDeclined { waited_ms, .. } => assert!(waited_ms >= 60_000),
            other => panic!("unexpected error: {other:?}"),
        }
        let prompts = f.console.prompts();
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].last_value, Some(0));
        // one read at start plus one per 500 ms interval up to the deadline
        assert!((120..=122).contains(&f.plc.read_count()));
    }

    #[tokio::test(start_paused = true)]
    async fn operator_retry_resets_the_timer() {
        let f = fixture_with(
            MemoryConsole::new().with_decider(RetryTimes(1)),
            WaitReadFailure::KeepWaiting,
        );
        let (_tx, mut p) = process(vec![]);
        let op = SubOperation::wait_for(d("D500"), 1, Duration::from_secs(2)).unwrap();

        let err = f.executor.run_all(&mut p, &[op]).await.unwrap_err();
        assert!(matches!(err, ExecError::OperatorDeclined { .. }));
        let attempts: Vec<u32> = f.console.prompts().iter().map(|p| p.attempt).collect();
        assert_eq!(attempts, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_succeeds_when_value_arrives() {
        let f = fixture_with(
            MemoryConsole::new().with_decider(AlwaysRetry),
            WaitReadFailure::KeepWaiting,
        );
        f.plc
            .script_reads(d("D500"), [Ok(0), Ok(0), Ok(1)]);
        let (_tx, mut p) = process(vec![]);
        let op = SubOperation::wait_for(d("D500"), 1, Duration::from_secs(5)).unwrap();

        f.executor.run_all(&mut p, &[op]).await.unwrap();
        assert_eq!(f.plc.read_count(), 3);
        assert!(f.console.prompts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_wait_read_keeps_waiting_by_default() {
        let f = fixture();
        f.plc.script_reads(
            d("D500"),
            [
                Err(PlcError::Timeout),
                Err(PlcError::Comm {
                    message: "reset".to_string(),
                }),
                Ok(1),
            ],
        );
        let (_tx, mut p) = process(vec![]);
        let op = SubOperation::wait_for(d("D500"), 1, Duration::from_secs(5)).unwrap();

        f.executor.run_all(&mut p, &[op]).await.unwrap();
        assert_eq!(f.plc.read_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_wait_read_aborts_when_configured_to_fail() {
        let f = fixture_with(MemoryConsole::new(), WaitReadFailure::Fail);
        f.plc.script_reads(d("D500"), [Err(PlcError::Timeout), Ok(1)]);
        let (_tx, mut p) = process(vec![]);
        let op = SubOperation::wait_for(d("D500"), 1, Duration::from_secs(5)).unwrap();

        let err = f.executor.run_all(&mut p, &[op]).await.unwrap_err();
        assert_eq!(
            err,
            ExecError::Plc {
                op: "waitForValue",
                source: PlcError::Timeout
            }
        );
        assert_eq!(err.class(), ErrorClass::Transient);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_a_running_wait() {
        let f = fixture();
        let (tx, mut p) = process(vec![]);
        let op = SubOperation::wait_for(d("D500"), 1, Duration::from_secs(60)).unwrap();

        let cancel = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            tx.send(true).unwrap();
            tx
        });
        let err = f.executor.run_all(&mut p, &[op]).await.unwrap_err();
        assert_eq!(err, ExecError::Cancelled);
        assert!(f.console.prompts().is_empty());
        let _tx = cancel.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn transient_plc_error_is_retried() {
        let f = fixture();
        f.plc.script_reads(d("D10"), [Err(PlcError::Timeout), Ok(5)]);
        let (_tx, mut p) = process(vec![]);

        let ops = vec![SubOperation::ReadWord {
            address: d("D10"),
            into: ScratchKey::BoxCount,
        }];
        f.executor.run_all(&mut p, &ops).await.unwrap();

        assert_eq!(p.scratch.box_count, 5);
        assert_eq!(f.plc.read_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn plc_retries_stop_at_the_bound() {
        let mut f = fixture();
        f.executor.set_plc_retry(PlcRetryPolicy {
            retries: 1,
            delay: Duration::from_millis(100),
        });
        f.plc.script_reads(
            d("D10"),
            [
                Err(PlcError::Timeout),
                Err(PlcError::Comm {
                    message: "reset".to_string(),
                }),
                Ok(5),
            ],
        );
        let (_tx, mut p) = process(vec![]);

        let ops = vec![SubOperation::ReadWord {
            address: d("D10"),
            into: ScratchKey::BoxCount,
        }];
        let err = f.executor.run_all(&mut p, &ops).await.unwrap_err();
        assert!(matches!(err, ExecError::Plc { op: "readWord", .. }));
        assert_eq!(f.plc.read_count(), 2);
    }

    #[tokio::test]
    async fn non_transient_plc_error_is_not_retried() {
        let f = fixture();
        f.plc
            .script_reads(d("D10"), [Err(PlcError::Device(DeviceError::OutOfRange(1))), Ok(5)]);
        let (_tx, mut p) = process(vec![]);

        let ops = vec![SubOperation::ReadWord {
            address: d("D10"),
            into: ScratchKey::BoxCount,
        }];
        f.executor.run_all(&mut p, &ops).await.unwrap_err();
        assert_eq!(f.plc.read_count(), 1);
    }

    struct BrokenPad;

    impl ScratchPad for BrokenPad {
        fn get(&self, _key: ScratchKey) -> String {
            String::new()
        }

        fn set(&self, _key: ScratchKey, _value: &str) {
            panic!("scratch pad offline");
        }
    }

    #[tokio::test]
    async fn panicking_port_fails_the_operation() {
        let f = fixture();
        let ui = UiPorts {
            scratch: Arc::new(BrokenPad),
            ..UiPorts::from_console(&f.console)
        };
        let executor = SubOperationExecutor::new(
            Arc::new(f.plc.clone()),
            Arc::new(f.gateway.clone()),
            Arc::new(f.store.clone()),
            ui,
            WaitPolicy::from_config(&Default::default()),
        );
        let (_tx, mut p) = process(vec![]);

        let ops = vec![
            SubOperation::Display {
                field: ScratchKey::LotNo,
                from: ScratchKey::LotNo,
            },
            SubOperation::WriteWord {
                address: d("D1"),
                value: IntSource::Literal(1),
            },
        ];
        let err = executor.run_all(&mut p, &ops).await.unwrap_err();
        assert_eq!(
            err,
            ExecError::Unexpected {
                op: "display",
                message: "scratch pad offline".to_string(),
            }
        );
        assert_eq!(err.class(), ErrorClass::Unexpected);
        assert!(f.plc.writes().is_empty());
    }
}
