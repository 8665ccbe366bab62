//! In-memory transaction machinery.
//!
//! Transactions journal their mutations instead of applying them: a
//! delete inside an active transaction is recorded in that transaction's
//! write set and in the shard-wide pending-delete table, and only
//! touches pages at commit. Inserts are persisted immediately (their pk
//! is invisible to nobody) and the journal entry exists so a rollback
//! can tombstone them again.
//!
//! Visibility follows from the pending-delete table: a pending delete
//! hides the row from its own transaction and nobody else. Commit
//! applies the write set, advances the logical commit clock, and from
//! then on every reader observes the delete (read-committed).
//!
//! The manager owns no I/O. The [`shard`](crate::shard) facade takes
//! write sets at commit/rollback and applies them through the pager.
//!
//! # Key Components
//!
//! - [`TransactionManager`]: id issue, logical clock, active set,
//!   pending-delete table.
//! - [`WriteOp`]: one journaled mutation.

use std::collections::HashMap;

use log::debug;

use crate::storage::{Pk, Rid, TransactionError};

pub type TxId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Active,
    Committed,
    RolledBack,
}

/// One journaled mutation inside a transaction's write set.
#[derive(Debug, Clone, Copy)]
pub enum WriteOp {
    /// Row already persisted at `rid`; undone by tombstoning.
    Insert { pk: Pk, rid: Rid },
    /// Delete pending until commit; `prior_flag` is the flag byte before
    /// the delete, kept for the journal's undo order.
    Delete { pk: Pk, rid: Rid, prior_flag: u8 },
}

/// Per-transaction state while the transaction is active.
#[derive(Debug)]
pub struct TxRecord {
    pub id: TxId,
    pub start_ts: u64,
    pub write_set: Vec<WriteOp>,
}

#[derive(Debug, Default)]
pub struct TransactionManager {
    next_id: TxId,
    clock: u64,
    active: HashMap<TxId, TxRecord>,
    pending_deletes: HashMap<Pk, TxId>,
    closed: HashMap<TxId, TxStatus>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of the logical commit clock.
    pub fn clock(&self) -> u64 {
        self.clock
    }

    /// Advances the commit clock; also called for auto-committed
    /// mutations performed outside any transaction.
    pub fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Opens a transaction and returns its id.
    pub fn begin(&mut self) -> TxId {
        self.next_id += 1;
        let id = self.next_id;
        let record = TxRecord {
            id,
            start_ts: self.clock,
            write_set: Vec::new(),
        };
        debug!("transaction {id} started at ts {}", record.start_ts);
        self.active.insert(id, record);
        id
    }

    /// Fails with `TransactionError::Closed` unless `id` is active.
    pub fn ensure_active(&self, id: TxId) -> Result<(), TransactionError> {
        if self.active.contains_key(&id) {
            Ok(())
        } else {
            Err(TransactionError::Closed)
        }
    }

    pub fn status(&self, id: TxId) -> Option<TxStatus> {
        if self.active.contains_key(&id) {
            Some(TxStatus::Active)
        } else {
            self.closed.get(&id).copied()
        }
    }

    /// The active transaction holding a pending delete on `pk`, if any.
    pub fn pending_delete_owner(&self, pk: Pk) -> Option<TxId> {
        self.pending_deletes.get(&pk).copied()
    }

    /// Whether `pk` is hidden from `viewer` by a pending delete. Pending
    /// deletes hide the row only from their own transaction.
    pub fn hidden_from(&self, pk: Pk, viewer: Option<TxId>) -> bool {
        match self.pending_delete_owner(pk) {
            Some(owner) => viewer == Some(owner),
            None => false,
        }
    }

    /// Journals an insert that was persisted at `rid`.
    pub fn record_insert(&mut self, id: TxId, pk: Pk, rid: Rid) -> Result<(), TransactionError> {
        let record = self.active.get_mut(&id).ok_or(TransactionError::Closed)?;
        record.write_set.push(WriteOp::Insert { pk, rid });
        Ok(())
    }

    /// Journals a delete of `pk` and marks it pending.
    ///
    /// A repeated delete inside the same transaction is a no-op; a pk
    /// pending under another active transaction is a write conflict.
    pub fn record_delete(
        &mut self,
        id: TxId,
        pk: Pk,
        rid: Rid,
        prior_flag: u8,
    ) -> Result<(), TransactionError> {
        self.ensure_active(id)?;
        match self.pending_deletes.get(&pk) {
            Some(owner) if *owner == id => return Ok(()),
            Some(_) => return Err(TransactionError::WriteConflict { pk }),
            None => {}
        }

        let record = self.active.get_mut(&id).ok_or(TransactionError::Closed)?;
        record.write_set.push(WriteOp::Delete {
            pk,
            rid,
            prior_flag,
        });
        self.pending_deletes.insert(pk, id);
        Ok(())
    }

    /// Removes `id` from the active set so its write set can be applied
    /// or undone. Must be paired with [`finish`](Self::finish).
    pub fn take_for_close(&mut self, id: TxId) -> Result<TxRecord, TransactionError> {
        self.active.remove(&id).ok_or(TransactionError::Closed)
    }

    /// Retires a record taken with `take_for_close`: clears its pending
    /// deletes, stores the terminal status, and advances the commit
    /// clock for commits.
    pub fn finish(&mut self, record: TxRecord, status: TxStatus) {
        for op in &record.write_set {
            if let WriteOp::Delete { pk, .. } = op {
                self.pending_deletes.remove(pk);
            }
        }
        if status == TxStatus::Committed {
            self.tick();
        }
        debug!("transaction {} finished: {status:?}", record.id);
        self.closed.insert(record.id, status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid(page_id: u32, slot: u16) -> Rid {
        Rid { slot, page_id }
    }

    #[test]
    fn ids_are_monotonic() {
        let mut manager = TransactionManager::new();
        let a = manager.begin();
        let b = manager.begin();
        assert!(b > a);
    }

    #[test]
    fn closed_transactions_are_rejected() {
        let mut manager = TransactionManager::new();
        let id = manager.begin();
        assert!(manager.ensure_active(id).is_ok());

        let record = manager.take_for_close(id).unwrap();
        manager.finish(record, TxStatus::Committed);

        assert!(matches!(
            manager.ensure_active(id),
            Err(TransactionError::Closed)
        ));
        assert_eq!(manager.status(id), Some(TxStatus::Committed));
        assert!(matches!(
            manager.record_insert(id, 1, rid(1, 0)),
            Err(TransactionError::Closed)
        ));
    }

    #[test]
    fn pending_delete_hides_only_from_owner() {
        let mut manager = TransactionManager::new();
        let owner = manager.begin();
        let peer = manager.begin();
        manager.record_delete(owner, 7, rid(1, 0), 0).unwrap();

        assert!(manager.hidden_from(7, Some(owner)));
        assert!(!manager.hidden_from(7, Some(peer)));
        assert!(!manager.hidden_from(7, None));
        assert!(!manager.hidden_from(8, Some(owner)));
    }

    #[test]
    fn same_transaction_redelete_is_a_noop() {
        let mut manager = TransactionManager::new();
        let id = manager.begin();
        manager.record_delete(id, 7, rid(1, 0), 0).unwrap();
        manager.record_delete(id, 7, rid(1, 0), 0).unwrap();

        let record = manager.take_for_close(id).unwrap();
        assert_eq!(record.write_set.len(), 1);
    }

    #[test]
    fn cross_transaction_delete_conflicts() {
        let mut manager = TransactionManager::new();
        let first = manager.begin();
        let second = manager.begin();
        manager.record_delete(first, 7, rid(1, 0), 0).unwrap();

        assert!(matches!(
            manager.record_delete(second, 7, rid(1, 0), 0),
            Err(TransactionError::WriteConflict { pk: 7 })
        ));
    }

    #[test]
    fn finish_clears_pending_and_ticks_clock() {
        let mut manager = TransactionManager::new();
        let id = manager.begin();
        manager.record_delete(id, 7, rid(1, 0), 0).unwrap();

        let before = manager.clock();
        let record = manager.take_for_close(id).unwrap();
        manager.finish(record, TxStatus::Committed);

        assert_eq!(manager.pending_delete_owner(7), None);
        assert_eq!(manager.clock(), before + 1);
    }

    #[test]
    fn rollback_does_not_advance_clock() {
        let mut manager = TransactionManager::new();
        let id = manager.begin();
        let before = manager.clock();

        let record = manager.take_for_close(id).unwrap();
        manager.finish(record, TxStatus::RolledBack);

        assert_eq!(manager.clock(), before);
        assert_eq!(manager.status(id), Some(TxStatus::RolledBack));
    }
}
