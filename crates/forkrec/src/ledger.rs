//! The persisted, ordered record of a recording session's transactions.
//!
//! A ledger is an ordered sequence, not a set: rollback removes a contiguous
//! suffix. Records move `Pending -> Executed` when the fork confirms them,
//! or leave the ledger as `RolledBack` — removed records are discarded, never
//! re-activated. Every mutation is persisted through the [`Store`] so a
//! panel reload reconstructs identical state.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{RecordId, Store, StoreError, StoreExt, TransactionPayload, WindowId, LEDGERS_COLLECTION};

/// Lifecycle state of a recorded transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Appended to the ledger, not yet confirmed by the fork.
    Pending,
    /// Confirmed by forked execution.
    Executed,
    /// Removed by rollback. Terminal; only ever observed on records returned
    /// from a rollback, never on live ledger entries.
    RolledBack,
}

/// One recorded transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    /// Ledger-unique id.
    pub id: RecordId,
    /// Current lifecycle state.
    pub status: TransactionStatus,
    /// The intercepted transaction fields.
    pub payload: TransactionPayload,
    /// Metadata about the callee contract, supplied by the caller and stored
    /// verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_info: Option<Value>,
    /// Receipt returned by the fork once executed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<Value>,
}

/// Ledger invariant violations. These are programming errors in the caller,
/// not recoverable user conditions, and surface immediately.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The referenced record is not in the ledger.
    #[error("record {0} not found in ledger")]
    UnknownRecord(RecordId),
    /// The record is not in the state the transition requires.
    #[error("record {id} is {status:?}, expected Pending")]
    NotPending {
        /// The record.
        id: RecordId,
        /// Its actual status.
        status: TransactionStatus,
    },
    /// The rollback target sits before the rollback point.
    #[error("record {0} is protected by the rollback point")]
    BeforeRollbackPoint(RecordId),
}

/// The per-session ordered transaction sequence plus its derived flags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionLedger {
    records: Vec<TransactionRecord>,
    /// Index before which nothing may be removed.
    #[serde(default)]
    rollback_point: usize,
    /// Sticky until consumed via [`take_refresh_requested`]. Not persisted;
    /// a reload recomputes views anyway.
    ///
    /// [`take_refresh_requested`]: Self::take_refresh_requested
    #[serde(skip)]
    refresh_requested: bool,
}

impl TransactionLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the persisted ledger for a window, or an empty one if none was
    /// stored.
    pub fn load<S: Store>(store: &S, window_id: WindowId) -> Result<Self, StoreError> {
        Ok(store
            .get::<Self>(&window_id.to_string(), Some(LEDGERS_COLLECTION))?
            .unwrap_or_default())
    }

    /// Persists the full ledger under `ledgers[<window_id>]`.
    pub fn persist<S: Store>(&self, store: &S, window_id: WindowId) -> Result<(), StoreError> {
        store.set(&window_id.to_string(), self, Some(LEDGERS_COLLECTION))
    }

    /// Removes the persisted ledger for a window.
    pub fn discard_persisted<S: Store>(store: &S, window_id: WindowId) {
        store.remove(&window_id.to_string(), Some(LEDGERS_COLLECTION));
    }

    /// Appends a new `Pending` record and returns its id.
    pub fn append_pending(
        &mut self,
        payload: TransactionPayload,
        contract_info: Option<Value>,
    ) -> RecordId {
        let id = RecordId::random();
        debug!(record = %id, to = ?payload.to, "appending pending transaction");
        self.records.push(TransactionRecord {
            id: id.clone(),
            status: TransactionStatus::Pending,
            payload,
            contract_info,
            receipt: None,
        });
        self.refresh_requested = true;
        id
    }

    /// Marks a `Pending` record as `Executed` with the fork's receipt.
    pub fn confirm(&mut self, id: &RecordId, receipt: Value) -> Result<(), LedgerError> {
        let record = self
            .records
            .iter_mut()
            .find(|r| &r.id == id)
            .ok_or_else(|| LedgerError::UnknownRecord(id.clone()))?;
        if record.status != TransactionStatus::Pending {
            return Err(LedgerError::NotPending { id: id.clone(), status: record.status });
        }
        record.status = TransactionStatus::Executed;
        record.receipt = Some(receipt);
        self.refresh_requested = true;
        Ok(())
    }

    /// Truncates the ledger to everything strictly before the record with
    /// the given id, returning the removed suffix marked `RolledBack`.
    pub fn rollback_to(&mut self, id: &RecordId) -> Result<Vec<TransactionRecord>, LedgerError> {
        let position = self
            .records
            .iter()
            .position(|r| &r.id == id)
            .ok_or_else(|| LedgerError::UnknownRecord(id.clone()))?;
        if position < self.rollback_point {
            return Err(LedgerError::BeforeRollbackPoint(id.clone()));
        }
        let mut removed: Vec<_> = self.records.split_off(position);
        for record in &mut removed {
            record.status = TransactionStatus::RolledBack;
        }
        debug!(target_record = %id, removed = removed.len(), "rolled back ledger suffix");
        self.refresh_requested = true;
        Ok(removed)
    }

    /// Removes a single record by id, leaving every other record in place.
    /// The removed record is returned marked `RolledBack`. Used to clean up
    /// a record whose transaction the fork rejected; records appended while
    /// that transaction was in flight are untouched.
    pub fn discard(&mut self, id: &RecordId) -> Option<TransactionRecord> {
        let position = self.records.iter().position(|r| &r.id == id)?;
        let mut record = self.records.remove(position);
        record.status = TransactionStatus::RolledBack;
        if position < self.rollback_point {
            self.rollback_point -= 1;
        }
        self.refresh_requested = true;
        Some(record)
    }

    /// Rollback-to-start: removes every removable record.
    pub fn clear(&mut self) -> Vec<TransactionRecord> {
        let mut removed: Vec<_> = self.records.split_off(self.rollback_point);
        for record in &mut removed {
            record.status = TransactionStatus::RolledBack;
        }
        if !removed.is_empty() {
            self.refresh_requested = true;
        }
        removed
    }

    /// Protects the current prefix from rollback.
    pub fn seal(&mut self) {
        self.rollback_point = self.records.len();
    }

    /// The live record sequence, in insertion order.
    pub fn records(&self) -> &[TransactionRecord] {
        &self.records
    }

    /// Mutable access to one record, for annotation by the owning context.
    pub fn record_mut(&mut self, id: &RecordId) -> Option<&mut TransactionRecord> {
        self.records.iter_mut().find(|r| &r.id == id)
    }

    /// Index before which nothing may be removed.
    pub fn rollback_point(&self) -> usize {
        self.rollback_point
    }

    /// Whether the ledger holds no live records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Consumes the sticky refresh flag, returning whether a dependent view
    /// should recompute.
    pub fn take_refresh_requested(&mut self) -> bool {
        std::mem::take(&mut self.refresh_requested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use serde_json::json;

    fn payload(value: u64) -> TransactionPayload {
        TransactionPayload { value: alloy_primitives::U256::from(value), ..Default::default() }
    }

    #[test]
    fn pending_to_executed_transition() {
        let mut ledger = TransactionLedger::new();
        let id = ledger.append_pending(payload(1), None);
        assert_eq!(ledger.records()[0].status, TransactionStatus::Pending);

        ledger.confirm(&id, json!({ "status": "0x1" })).unwrap();
        assert_eq!(ledger.records()[0].status, TransactionStatus::Executed);
        assert!(ledger.records()[0].receipt.is_some());

        // Executed records cannot be confirmed again.
        let err = ledger.confirm(&id, json!({})).unwrap_err();
        assert!(matches!(err, LedgerError::NotPending { .. }));
    }

    #[test]
    fn rollback_keeps_strict_prefix_and_requests_refresh() {
        let mut ledger = TransactionLedger::new();
        let first = ledger.append_pending(payload(1), None);
        let second = ledger.append_pending(payload(2), None);
        let _third = ledger.append_pending(payload(3), None);
        let _ = ledger.take_refresh_requested();

        let removed = ledger.rollback_to(&second).unwrap();
        assert_eq!(removed.len(), 2);
        assert!(removed.iter().all(|r| r.status == TransactionStatus::RolledBack));
        assert_eq!(ledger.records().len(), 1);
        assert_eq!(ledger.records()[0].id, first);
        assert!(ledger.take_refresh_requested());
        // Consumed: second read is false.
        assert!(!ledger.take_refresh_requested());
    }

    #[test]
    fn rollback_of_unknown_record_fails_fast() {
        let mut ledger = TransactionLedger::new();
        ledger.append_pending(payload(1), None);
        let err = ledger.rollback_to(&RecordId::from("missing")).unwrap_err();
        assert!(matches!(err, LedgerError::UnknownRecord(_)));
    }

    #[test]
    fn rollback_point_protects_prefix() {
        let mut ledger = TransactionLedger::new();
        let first = ledger.append_pending(payload(1), None);
        ledger.seal();
        let second = ledger.append_pending(payload(2), None);

        let err = ledger.rollback_to(&first).unwrap_err();
        assert!(matches!(err, LedgerError::BeforeRollbackPoint(_)));

        ledger.rollback_to(&second).unwrap();
        assert_eq!(ledger.records().len(), 1);
    }

    #[test]
    fn discard_removes_only_the_target_record() {
        let mut ledger = TransactionLedger::new();
        let first = ledger.append_pending(payload(1), None);
        let second = ledger.append_pending(payload(2), None);
        let third = ledger.append_pending(payload(3), None);
        ledger.confirm(&second, json!({ "status": "0x1" })).unwrap();

        let removed = ledger.discard(&first).unwrap();
        assert_eq!(removed.status, TransactionStatus::RolledBack);

        // The surrounding records survive, order and state intact.
        let ids: Vec<_> = ledger.records().iter().map(|r| r.id.clone()).collect();
        assert_eq!(ids, vec![second.clone(), third]);
        assert_eq!(ledger.records()[0].status, TransactionStatus::Executed);

        assert!(ledger.discard(&first).is_none());
    }

    #[test]
    fn clear_is_rollback_to_start() {
        let mut ledger = TransactionLedger::new();
        ledger.append_pending(payload(1), None);
        ledger.append_pending(payload(2), None);
        let removed = ledger.clear();
        assert_eq!(removed.len(), 2);
        assert!(ledger.is_empty());
    }

    #[test]
    fn persists_and_reloads_identical_state() {
        let store = MemoryStore::new();
        let window = WindowId(7);

        let mut ledger = TransactionLedger::new();
        let id = ledger.append_pending(payload(42), Some(json!({ "name": "Vault" })));
        ledger.confirm(&id, json!({ "status": "0x1" })).unwrap();
        ledger.persist(&store, window).unwrap();

        let reloaded = TransactionLedger::load(&store, window).unwrap();
        assert_eq!(reloaded.records(), ledger.records());
        assert_eq!(reloaded.rollback_point(), ledger.rollback_point());

        TransactionLedger::discard_persisted(&store, window);
        assert!(TransactionLedger::load(&store, window).unwrap().is_empty());
    }
}
