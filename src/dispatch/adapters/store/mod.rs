//! Rack table and transfer ledger.
//!
//! Each call is one independent statement; no transaction spans a step.
//! Update calls report whether a row matched instead of failing on a
//! missing rack.

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::dispatch::core::model::{ProcessId, RackId};

pub mod memory;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store backend error: {message}")]
    Backend { message: String },

    #[error("ledger entry not found: {id}")]
    LedgerNotFound { id: Uuid },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Rack {
    pub id: RackId,
    /// Fleet location tag of the slot.
    pub node: String,
    pub area: String,
    pub rack_type: String,
    pub bullet_type: String,
    pub lot_no: String,
    pub box_count: i32,
    pub locked: bool,
    pub visible: bool,
}

impl Rack {
    pub fn is_empty(&self) -> bool {
        self.bullet_type.trim().is_empty() && self.lot_no.trim().is_empty() && self.box_count == 0
    }

    /// Clears contents; identity, lock and visibility are untouched.
    pub fn clear_contents(&mut self) {
        self.bullet_type.clear();
        self.lot_no.clear();
        self.box_count = 0;
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub id: Uuid,
    pub process_id: ProcessId,
    /// `None` when the goods came from the staging location.
    pub source: Option<RackId>,
    pub destination: RackId,
    pub bullet_type: String,
    pub lot_no: String,
    pub box_count: i32,
    pub started_at_utc: DateTime<Utc>,
    pub completed_at_utc: Option<DateTime<Utc>>,
}

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

pub trait RackStore: Send + Sync {
    /// `Ok(None)` when the rack id is unknown.
    fn get_rack<'a>(&'a self, rack_id: RackId) -> StoreFuture<'a, Option<Rack>>;

    /// Overwrites the row with `rack.id`; `Ok(false)` when no row matched.
    fn update_rack<'a>(&'a self, rack: &'a Rack) -> StoreFuture<'a, bool>;

    /// `Ok(false)` when no row matched.
    fn set_lock<'a>(&'a self, rack_id: RackId, locked: bool) -> StoreFuture<'a, bool>;

    /// An unlocked, visible, empty rack in `area`, lowest id first.
    fn find_empty_rack<'a>(&'a self, area: &'a str) -> StoreFuture<'a, Option<Rack>>;

    fn insert_ledger<'a>(&'a self, entry: &'a LedgerEntry) -> StoreFuture<'a, ()>;

    fn complete_ledger<'a>(&'a self, id: Uuid, at: DateTime<Utc>) -> StoreFuture<'a, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rack_is_empty_only_without_contents() {
        let mut rack = Rack {
            id: 1,
            lot_no: "L-01".to_string(),
            box_count: 4,
            ..Rack::default()
        };
        assert!(!rack.is_empty());
        rack.clear_contents();
        assert!(rack.is_empty());

        rack.box_count = 1;
        assert!(!rack.is_empty());
    }
}
