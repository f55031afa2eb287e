use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::{LedgerEntry, Rack, RackStore, StoreError, StoreFuture};
use crate::dispatch::core::model::RackId;

#[derive(Default)]
struct MemoryState {
    racks: BTreeMap<RackId, Rack>,
    ledger: Vec<LedgerEntry>,
    lock_events: Vec<(RackId, bool)>,
    fail_next: u32,
}

/// Rack table held in memory; clones share the same table.
#[derive(Clone, Default)]
pub struct MemoryRackStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryRackStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_racks(racks: impl IntoIterator<Item = Rack>) -> Self {
        let store = Self::new();
        {
            let mut state = store.state.lock();
            for rack in racks {
                state.racks.insert(rack.id, rack);
            }
        }
        store
    }

    pub fn insert(&self, rack: Rack) {
        self.state.lock().racks.insert(rack.id, rack);
    }

    pub fn rack(&self, rack_id: RackId) -> Option<Rack> {
        self.state.lock().racks.get(&rack_id).cloned()
    }

    pub fn ledger(&self) -> Vec<LedgerEntry> {
        self.state.lock().ledger.clone()
    }

    /// Every `set_lock` call that matched a row, in order.
    pub fn lock_events(&self) -> Vec<(RackId, bool)> {
        self.state.lock().lock_events.clone()
    }

    /// The next `count` calls fail with a backend error.
    pub fn fail_next(&self, count: u32) {
        self.state.lock().fail_next = count;
    }

    fn check_fault(state: &mut MemoryState) -> Result<(), StoreError> {
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(StoreError::Backend {
                message: "injected fault".to_string(),
            });
        }
        Ok(())
    }

    fn get(&self, rack_id: RackId) -> Result<Option<Rack>, StoreError> {
        let mut state = self.state.lock();
        Self::check_fault(&mut state)?;
        Ok(state.racks.get(&rack_id).cloned())
    }

    fn update(&self, rack: &Rack) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        Self::check_fault(&mut state)?;
        match state.racks.get_mut(&rack.id) {
            Some(row) => {
                *row = rack.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn lock(&self, rack_id: RackId, locked: bool) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        Self::check_fault(&mut state)?;
        let Some(row) = state.racks.get_mut(&rack_id) else {
            return Ok(false);
        };
        row.locked = locked;
        state.lock_events.push((rack_id, locked));
        Ok(true)
    }

    fn find_empty(&self, area: &str) -> Result<Option<Rack>, StoreError> {
        let mut state = self.state.lock();
        Self::check_fault(&mut state)?;
        Ok(state
            .racks
            .values()
            .find(|r| r.area == area && r.visible && !r.locked && r.is_empty())
            .cloned())
    }

    fn insert_entry(&self, entry: &LedgerEntry) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        Self::check_fault(&mut state)?;
        state.ledger.push(entry.clone());
        Ok(())
    }

    fn complete_entry(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        Self::check_fault(&mut state)?;
        let entry = state
            .ledger
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(StoreError::LedgerNotFound { id })?;
        entry.completed_at_utc = Some(at);
        Ok(())
    }
}

impl RackStore for MemoryRackStore {
    fn get_rack<'a>(&'a self, rack_id: RackId) -> StoreFuture<'a, Option<Rack>> {
        Box::pin(async move { self.get(rack_id) })
    }

    fn update_rack<'a>(&'a self, rack: &'a Rack) -> StoreFuture<'a, bool> {
        Box::pin(async move { self.update(rack) })
    }

    fn set_lock<'a>(&'a self, rack_id: RackId, locked: bool) -> StoreFuture<'a, bool> {
        Box::pin(async move { self.lock(rack_id, locked) })
    }

    fn find_empty_rack<'a>(&'a self, area: &'a str) -> StoreFuture<'a, Option<Rack>> {
        Box::pin(async move { self.find_empty(area) })
    }

    fn insert_ledger<'a>(&'a self, entry: &'a LedgerEntry) -> StoreFuture<'a, ()> {
        Box::pin(async move { self.insert_entry(entry) })
    }

    fn complete_ledger<'a>(&'a self, id: Uuid, at: DateTime<Utc>) -> StoreFuture<'a, ()> {
        Box::pin(async move { self.complete_entry(id, at) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rack(id: RackId, area: &str, lot: &str) -> Rack {
        Rack {
            id,
            node: format!("N{id}"),
            area: area.to_string(),
            rack_type: "pallet".to_string(),
            lot_no: lot.to_string(),
            box_count: if lot.is_empty() { 0 } else { 2 },
            visible: true,
            ..Rack::default()
        }
    }

    #[tokio::test]
    async fn find_empty_skips_locked_and_filled_racks() {
        let store = MemoryRackStore::with_racks([
            rack(1, "A", "L1"),
            rack(2, "A", ""),
            rack(3, "A", ""),
            rack(4, "B", ""),
        ]);
        store.set_lock(2, true).await.unwrap();

        let found = store.find_empty_rack("A").await.unwrap().unwrap();
        assert_eq!(found.id, 3);
        assert_eq!(store.find_empty_rack("C").await.unwrap(), None);
    }

    #[tokio::test]
    async fn updates_on_unknown_rack_match_nothing() {
        let store = MemoryRackStore::new();
        assert_eq!(store.get_rack(9).await.unwrap(), None);
        assert!(!store.set_lock(9, true).await.unwrap());
        assert!(!store.update_rack(&rack(9, "A", "")).await.unwrap());
        assert!(store.lock_events().is_empty());
    }

    #[tokio::test]
    async fn ledger_completion_requires_existing_entry() {
        let store = MemoryRackStore::new();
        let entry = LedgerEntry {
            id: Uuid::from_u128(1),
            process_id: Uuid::from_u128(2),
            source: None,
            destination: 5,
            bullet_type: "7.62".to_string(),
            lot_no: "L9".to_string(),
            box_count: 3,
            started_at_utc: Utc::now(),
            completed_at_utc: None,
        };
        store.insert_ledger(&entry).await.unwrap();
        store.complete_ledger(entry.id, Utc::now()).await.unwrap();
        assert!(store.ledger()[0].completed_at_utc.is_some());

        let err = store
            .complete_ledger(Uuid::from_u128(3), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LedgerNotFound { .. }));
    }
}
