//! In-memory PLC for offline runs and tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{PlcError, PlcFuture, PlcPort};
use crate::dispatch::core::device::DeviceAddress;
use crate::dispatch::core::frame;

#[derive(Default)]
struct MemoryState {
    words: HashMap<DeviceAddress, u16>,
    /// Values handed out by successive `read_word` calls before falling back to `words`.
    scripted_reads: HashMap<DeviceAddress, VecDeque<Result<u16, PlcError>>>,
    writes: Vec<(DeviceAddress, Vec<u16>)>,
    reads: usize,
}

#[derive(Clone, Default)]
pub struct MemoryPlc {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryPlc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_word(&self, address: DeviceAddress, value: u16) {
        self.state.lock().words.insert(address, value);
    }

    pub fn word(&self, address: DeviceAddress) -> u16 {
        self.state.lock().words.get(&address).copied().unwrap_or(0)
    }

    pub fn set_string(&self, address: DeviceAddress, words: u16, text: &str) {
        let payload = frame::string_to_words(text, usize::from(words));
        self.store(address, &payload);
    }

    pub fn string(&self, address: DeviceAddress, words: u16) -> String {
        frame::words_to_string(&self.load(address, usize::from(words)))
    }

    /// Queues outcomes for the next `read_word` calls at `address`.
    pub fn script_reads(
        &self,
        address: DeviceAddress,
        outcomes: impl IntoIterator<Item = Result<u16, PlcError>>,
    ) {
        self.state
            .lock()
            .scripted_reads
            .entry(address)
            .or_default()
            .extend(outcomes);
    }

    /// Every write, in order: head address and the words written.
    pub fn writes(&self) -> Vec<(DeviceAddress, Vec<u16>)> {
        self.state.lock().writes.clone()
    }

    pub fn read_count(&self) -> usize {
        self.state.lock().reads
    }

    fn store(&self, head: DeviceAddress, words: &[u16]) {
        let mut state = self.state.lock();
        for (i, word) in words.iter().enumerate() {
            let addr = DeviceAddress {
                code: head.code,
                number: head.number + i as u32,
            };
            state.words.insert(addr, *word);
        }
    }

    fn load(&self, head: DeviceAddress, count: usize) -> Vec<u16> {
        let state = self.state.lock();
        (0..count)
            .map(|i| {
                let addr = DeviceAddress {
                    code: head.code,
                    number: head.number + i as u32,
                };
                state.words.get(&addr).copied().unwrap_or(0)
            })
            .collect()
    }

    fn record_write(&self, head: DeviceAddress, words: Vec<u16>) {
        self.store(head, &words);
        self.state.lock().writes.push((head, words));
    }

    fn next_read(&self, address: DeviceAddress) -> Result<u16, PlcError> {
        let mut state = self.state.lock();
        state.reads += 1;
        if let Some(outcome) = state
            .scripted_reads
            .get_mut(&address)
            .and_then(|queue| queue.pop_front())
        {
            return outcome;
        }
        Ok(state.words.get(&address).copied().unwrap_or(0))
    }
}

impl PlcPort for MemoryPlc {
    fn read_word<'a>(&'a self, address: DeviceAddress) -> PlcFuture<'a, u16> {
        Box::pin(async move { self.next_read(address) })
    }

    fn write_word<'a>(&'a self, address: DeviceAddress, value: u16) -> PlcFuture<'a, ()> {
        Box::pin(async move {
            self.record_write(address, vec![value]);
            Ok(())
        })
    }

    fn read_string<'a>(&'a self, address: DeviceAddress, words: u16) -> PlcFuture<'a, String> {
        Box::pin(async move {
            self.state.lock().reads += 1;
            Ok(frame::words_to_string(
                &self.load(address, usize::from(words)),
            ))
        })
    }

    fn write_string<'a>(
        &'a self,
        address: DeviceAddress,
        words: u16,
        text: &'a str,
    ) -> PlcFuture<'a, ()> {
        Box::pin(async move {
            self.record_write(address, frame::string_to_words(text, usize::from(words)));
            Ok(())
        })
    }

    fn read_int32<'a>(&'a self, address: DeviceAddress) -> PlcFuture<'a, i32> {
        Box::pin(async move {
            self.state.lock().reads += 1;
            Ok(frame::words_to_i32(&self.load(address, 2)).unwrap_or(0))
        })
    }

    fn write_int32<'a>(&'a self, address: DeviceAddress, value: i32) -> PlcFuture<'a, ()> {
        Box::pin(async move {
            self.record_write(address, frame::i32_to_words(value).to_vec());
            Ok(())
        })
    }
}
