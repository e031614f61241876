// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Transaction handle and lifecycle.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::storage::Key;

use super::engine::TransactionEngine;
use super::error::TxnError;
use super::map::TransactionMap;
use super::versioned::{is_in_doubt, pack, VersionedValue};
use super::TransactionValidator;

/// Transaction lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    Open,
    Prepared,
    Committing,
    Closed,
}

struct TxnInner {
    /// Next log slot. Monotonically increases until close; a partial
    /// rollback rewinds it to the savepoint.
    log_id: u32,
    status: TxnStatus,
    savepoints: HashMap<String, u32>,
}

/// A single writer's transaction context.
///
/// A transaction is owned by one thread at a time; the handle is shared
/// with its [`TransactionMap`]s through `Arc`, so the mutable state sits
/// behind a mutex. Writes append to the engine's undo log before the
/// compare-and-swap that installs them, so the log always covers every
/// applied write.
pub struct Transaction {
    engine: TransactionEngine,
    id: u32,
    validator: Option<Arc<dyn TransactionValidator>>,
    /// Back-reference to the shared handle, set at construction via
    /// `Arc::new_cyclic`; lets `open_map` hand maps an owning clone.
    this: Weak<Transaction>,
    inner: Mutex<TxnInner>,
}

impl Transaction {
    pub(super) fn new(
        engine: TransactionEngine,
        id: u32,
        validator: Option<Arc<dyn TransactionValidator>>,
        this: Weak<Transaction>,
    ) -> Self {
        Self {
            engine,
            id,
            validator,
            this,
            inner: Mutex::new(TxnInner {
                log_id: 0,
                status: TxnStatus::Open,
                savepoints: HashMap::new(),
            }),
        }
    }

    /// Returns the transaction id.
    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Returns true if this transaction is in-doubt (odd id) and its
    /// writes require validation before foreign observers treat them as
    /// committed.
    #[inline]
    pub fn is_in_doubt(&self) -> bool {
        is_in_doubt(self.id)
    }

    /// Returns the current status.
    pub fn status(&self) -> TxnStatus {
        self.inner.lock().status
    }

    /// Returns the next log slot.
    pub fn log_id(&self) -> u32 {
        self.inner.lock().log_id
    }

    /// Returns the engine this transaction belongs to.
    #[inline]
    pub fn engine(&self) -> &TransactionEngine {
        &self.engine
    }

    pub(super) fn validator(&self) -> Option<&Arc<dyn TransactionValidator>> {
        self.validator.as_ref()
    }

    /// Fails unless the transaction can still accept writes.
    pub fn check_not_closed(&self) -> Result<(), TxnError> {
        let status = self.inner.lock().status;
        match status {
            TxnStatus::Open | TxnStatus::Prepared => Ok(()),
            _ => Err(TxnError::Closed {
                id: self.id,
                status,
            }),
        }
    }

    /// Reserves the current log slot, appends the undo entry for one
    /// write, and returns the packed operation id.
    ///
    /// Called before the compare-and-swap that installs the new value; on
    /// CAS failure the caller must invoke [`Transaction::log_undo`] so the
    /// log reflects only applied writes.
    pub(super) fn log(
        &self,
        map_id: u32,
        key: Key,
        prior: Option<VersionedValue>,
    ) -> Result<u64, TxnError> {
        let mut inner = self.inner.lock();
        match inner.status {
            TxnStatus::Open | TxnStatus::Prepared => {}
            status => {
                return Err(TxnError::Closed {
                    id: self.id,
                    status,
                })
            }
        }
        let operation_id = pack(self.id, inner.log_id);
        self.engine.undo_log().append(operation_id, map_id, key, prior);
        inner.log_id += 1;
        Ok(operation_id)
    }

    /// Pops the most recently appended undo entry after a failed
    /// compare-and-swap.
    pub(super) fn log_undo(&self) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.log_id > 0, "log_undo without a prior log");
        inner.log_id -= 1;
        self.engine.undo_log().remove(pack(self.id, inner.log_id));
    }

    /// Opens a transactional view over the map with the given id, reading
    /// at the latest log point.
    pub fn open_map(&self, map_id: u32) -> Result<TransactionMap, TxnError> {
        self.check_not_closed()?;
        let map = self.engine.open_storage_map(map_id)?;
        let this = self.this.upgrade().ok_or(TxnError::Closed {
            id: self.id,
            status: TxnStatus::Closed,
        })?;
        Ok(TransactionMap::new(this, map, map_id))
    }

    /// Records the current log id under a name and returns it.
    pub fn set_savepoint(&self, name: &str) -> u32 {
        let mut inner = self.inner.lock();
        let log_id = inner.log_id;
        inner.savepoints.insert(name.to_string(), log_id);
        log_id
    }

    /// Returns the log id recorded under a name.
    pub fn savepoint(&self, name: &str) -> Option<u32> {
        self.inner.lock().savepoints.get(name).copied()
    }

    /// Marks the transaction prepared (two-phase commit surface). Writes
    /// are still accepted until commit.
    pub fn prepare(&self) -> Result<(), TxnError> {
        let mut inner = self.inner.lock();
        match inner.status {
            TxnStatus::Open => {
                inner.status = TxnStatus::Prepared;
                Ok(())
            }
            from => Err(TxnError::IllegalState { id: self.id, from }),
        }
    }

    /// Commits all writes of this transaction.
    ///
    /// Every surviving write becomes committed atomically per key by
    /// flipping its operation id to zero; the undo entries are drained. A
    /// commit-time CAS failure is corruption-class and closes the
    /// transaction.
    pub fn commit(&self) -> Result<(), TxnError> {
        {
            let mut inner = self.inner.lock();
            match inner.status {
                TxnStatus::Open | TxnStatus::Prepared => inner.status = TxnStatus::Committing,
                from => return Err(TxnError::IllegalState { id: self.id, from }),
            }
        }
        let result = self.engine.commit_transaction(self.id);
        self.inner.lock().status = TxnStatus::Closed;
        result
    }

    /// Rolls back all writes of this transaction and closes it.
    ///
    /// Individual restore failures are logged, not raised.
    pub fn rollback(&self) -> Result<(), TxnError> {
        {
            let mut inner = self.inner.lock();
            match inner.status {
                TxnStatus::Open | TxnStatus::Prepared => {}
                from => return Err(TxnError::IllegalState { id: self.id, from }),
            }
            inner.status = TxnStatus::Closed;
            inner.savepoints.clear();
        }
        self.engine.rollback_transaction(self.id, 0);
        Ok(())
    }

    /// Rolls back writes with log ids at or past the savepoint, rewinds
    /// the log cursor, and invalidates savepoints taken after it.
    pub fn rollback_to_savepoint(&self, to_log_id: u32) -> Result<(), TxnError> {
        self.check_not_closed()?;
        self.engine.rollback_transaction(self.id, to_log_id);
        let mut inner = self.inner.lock();
        inner.log_id = to_log_id;
        inner.savepoints.retain(|_, v| *v <= to_log_id);
        Ok(())
    }

    /// Rolls back to a named savepoint.
    pub fn rollback_to_named_savepoint(&self, name: &str) -> Result<(), TxnError> {
        let to_log_id = self
            .savepoint(name)
            .ok_or_else(|| TxnError::UnknownSavepoint(name.to_string()))?;
        self.rollback_to_savepoint(to_log_id)
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("log_id", &inner.log_id)
            .field("status", &inner.status)
            .finish()
    }
}
