//! Ports into the operator UI.
//!
//! The core depends on these narrow traits only. `MemoryConsole` implements
//! all of them for tests and headless runs.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::dispatch::core::model::{ProcessId, ProcessSnapshot, RackId, Scratch, ScratchKey};

/// The three operator-editable fields shared with sub-operations.
pub trait ScratchPad: Send + Sync {
    fn get(&self, key: ScratchKey) -> String;
    fn set(&self, key: ScratchKey, value: &str);
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ToastLevel {
    Info,
    Warning,
    Error,
}

pub trait OperatorNotifier: Send + Sync {
    fn lock_state_changed(&self, rack_id: RackId, locked: bool);
    fn toast(&self, level: ToastLevel, message: &str);
}

pub trait SnapshotSink: Send + Sync {
    fn publish(&self, snapshot: &ProcessSnapshot);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutDecision {
    /// Restart the wait with a fresh timer.
    Retry,
    Abort,
}

/// What the operator is asked about when a wait loop times out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimeoutPrompt {
    pub process_id: ProcessId,
    pub address: String,
    pub expected: u16,
    pub last_value: Option<u16>,
    pub waited: Duration,
    /// 1 for the first timeout of this wait, 2 after one retry, ...
    pub attempt: u32,
}

pub type DecisionFuture<'a> = Pin<Box<dyn Future<Output = TimeoutDecision> + Send + 'a>>;

pub trait TimeoutDecider: Send + Sync {
    fn decide<'a>(&'a self, prompt: &'a TimeoutPrompt) -> DecisionFuture<'a>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysRetry;

impl TimeoutDecider for AlwaysRetry {
    fn decide<'a>(&'a self, _prompt: &'a TimeoutPrompt) -> DecisionFuture<'a> {
        Box::pin(async { TimeoutDecision::Retry })
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysAbort;

impl TimeoutDecider for AlwaysAbort {
    fn decide<'a>(&'a self, _prompt: &'a TimeoutPrompt) -> DecisionFuture<'a> {
        Box::pin(async { TimeoutDecision::Abort })
    }
}

/// Retries the first `n` timeouts of a wait, then aborts.
#[derive(Clone, Copy, Debug)]
pub struct RetryTimes(pub u32);

impl TimeoutDecider for RetryTimes {
    fn decide<'a>(&'a self, prompt: &'a TimeoutPrompt) -> DecisionFuture<'a> {
        let decision = if prompt.attempt <= self.0 {
            TimeoutDecision::Retry
        } else {
            TimeoutDecision::Abort
        };
        Box::pin(async move { decision })
    }
}

/// The UI ports handed to the executor and orchestrator.
#[derive(Clone)]
pub struct UiPorts {
    pub scratch: Arc<dyn ScratchPad>,
    pub notifier: Arc<dyn OperatorNotifier>,
    pub snapshots: Arc<dyn SnapshotSink>,
    pub decider: Arc<dyn TimeoutDecider>,
}

impl UiPorts {
    pub fn from_console(console: &MemoryConsole) -> Self {
        let console = Arc::new(console.clone());
        Self {
            scratch: console.clone(),
            notifier: console.clone(),
            snapshots: console.clone(),
            decider: console,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Toast {
    pub level: ToastLevel,
    pub message: String,
}

struct ConsoleState {
    fields: Scratch,
    lock_events: Vec<(RackId, bool)>,
    toasts: Vec<Toast>,
    snapshots: Vec<ProcessSnapshot>,
    prompts: Vec<TimeoutPrompt>,
    field_writes: Vec<(ScratchKey, String)>,
}

/// Headless console: records every UI interaction and answers timeout
/// prompts through the configured decider (abort by default).
#[derive(Clone)]
pub struct MemoryConsole {
    state: Arc<Mutex<ConsoleState>>,
    decider: Arc<dyn TimeoutDecider>,
}

impl Default for MemoryConsole {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConsole {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ConsoleState {
                fields: Scratch::default(),
                lock_events: Vec::new(),
                toasts: Vec::new(),
                snapshots: Vec::new(),
                prompts: Vec::new(),
                field_writes: Vec::new(),
            })),
            decider: Arc::new(AlwaysAbort),
        }
    }

    pub fn with_decider(mut self, decider: impl TimeoutDecider + 'static) -> Self {
        self.decider = Arc::new(decider);
        self
    }

    /// Operator input, as if typed into the UI field.
    pub fn type_field(&self, key: ScratchKey, value: &str) {
        self.state.lock().fields.set_text(key, value);
    }

    pub fn field(&self, key: ScratchKey) -> String {
        self.state.lock().fields.text(key)
    }

    pub fn field_writes(&self) -> Vec<(ScratchKey, String)> {
        self.state.lock().field_writes.clone()
    }

    pub fn lock_events(&self) -> Vec<(RackId, bool)> {
        self.state.lock().lock_events.clone()
    }

    pub fn toasts(&self) -> Vec<Toast> {
        self.state.lock().toasts.clone()
    }

    pub fn snapshots(&self) -> Vec<ProcessSnapshot> {
        self.state.lock().snapshots.clone()
    }

    pub fn last_snapshot(&self, process_id: ProcessId) -> Option<ProcessSnapshot> {
        self.state
            .lock()
            .snapshots
            .iter()
            .rev()
            .find(|s| s.process_id == process_id)
            .cloned()
    }

    pub fn prompts(&self) -> Vec<TimeoutPrompt> {
        self.state.lock().prompts.clone()
    }
}

impl ScratchPad for MemoryConsole {
    fn get(&self, key: ScratchKey) -> String {
        self.field(key)
    }

    fn set(&self, key: ScratchKey, value: &str) {
        let mut state = self.state.lock();
        state.fields.set_text(key, value);
        state.field_writes.push((key, value.to_string()));
    }
}

impl OperatorNotifier for MemoryConsole {
    fn lock_state_changed(&self, rack_id: RackId, locked: bool) {
        self.state.lock().lock_events.push((rack_id, locked));
    }

    fn toast(&self, level: ToastLevel, message: &str) {
        match level {
            ToastLevel::Info => info!("[agv][ui] {message}"),
            ToastLevel::Warning | ToastLevel::Error => warn!("[agv][ui] {message}"),
        }
        self.state.lock().toasts.push(Toast {
            level,
            message: message.to_string(),
        });
    }
}

impl SnapshotSink for MemoryConsole {
    fn publish(&self, snapshot: &ProcessSnapshot) {
        self.state.lock().snapshots.push(snapshot.clone());
    }
}

impl TimeoutDecider for MemoryConsole {
    fn decide<'a>(&'a self, prompt: &'a TimeoutPrompt) -> DecisionFuture<'a> {
        self.state.lock().prompts.push(prompt.clone());
        self.decider.decide(prompt)
    }
}
