// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Transaction engine: id allocation, map registry, commit and rollback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::storage::{MemoryMap, StorageMap};

use super::error::TxnError;
use super::transaction::Transaction;
use super::undo::UndoLog;
use super::versioned::{log_of, tx_of, VersionedValue};
use super::TransactionValidator;

/// A storage map shared between the engine and the transactional views
/// over it.
pub type SharedStorageMap = Arc<dyn StorageMap<VersionedValue>>;

struct EngineInner {
    undo_log: UndoLog,
    maps: RwLock<HashMap<u32, SharedStorageMap>>,
    next_local_id: AtomicU32,
    next_in_doubt_id: AtomicU32,
    next_temp_id: AtomicU32,
}

/// Engine owning the undo log and the registry of storage maps.
///
/// The engine is a cheap-to-clone handle; transactions and their maps
/// keep clones of it, which is how the transaction/map/engine cycle is
/// expressed without ownership loops.
///
/// Local transactions get even ids, in-doubt (remotely coordinated)
/// transactions get odd ids; the parity is the only signal observers use
/// to decide whether a foreign write needs validation. Id 0 is never
/// allocated, so operation id 0 stays reserved for committed entries.
#[derive(Clone)]
pub struct TransactionEngine {
    inner: Arc<EngineInner>,
}

impl TransactionEngine {
    /// Creates a new engine with an empty undo log and map registry.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EngineInner {
                undo_log: UndoLog::new(),
                maps: RwLock::new(HashMap::new()),
                next_local_id: AtomicU32::new(2),
                next_in_doubt_id: AtomicU32::new(1),
                next_temp_id: AtomicU32::new(u32::MAX),
            }),
        }
    }

    /// Returns the engine's undo log.
    #[inline]
    pub fn undo_log(&self) -> &UndoLog {
        &self.inner.undo_log
    }

    /// Begins a local (even-id) transaction.
    pub fn begin(&self) -> Arc<Transaction> {
        self.begin_with(None)
    }

    /// Begins a local (even-id) transaction carrying a validator used when
    /// this transaction observes foreign in-doubt writes.
    pub fn begin_with(
        &self,
        validator: Option<Arc<dyn TransactionValidator>>,
    ) -> Arc<Transaction> {
        let id = self.inner.next_local_id.fetch_add(2, Ordering::Relaxed);
        Arc::new_cyclic(|this| Transaction::new(self.clone(), id, validator, this.clone()))
    }

    /// Begins an in-doubt (odd-id) transaction whose commit status other
    /// transactions must validate before trusting its writes.
    pub fn begin_in_doubt(
        &self,
        validator: Option<Arc<dyn TransactionValidator>>,
    ) -> Arc<Transaction> {
        let id = self.inner.next_in_doubt_id.fetch_add(2, Ordering::Relaxed);
        Arc::new_cyclic(|this| Transaction::new(self.clone(), id, validator, this.clone()))
    }

    /// Returns the storage map registered under the id, creating an
    /// in-memory one if absent.
    pub fn open_storage_map(&self, map_id: u32) -> Result<SharedStorageMap, TxnError> {
        if let Some(map) = self.inner.maps.read().get(&map_id) {
            return Ok(Arc::clone(map));
        }
        let mut maps = self.inner.maps.write();
        let map = maps
            .entry(map_id)
            .or_insert_with(|| Arc::new(MemoryMap::new(map_id)) as SharedStorageMap);
        Ok(Arc::clone(map))
    }

    /// Registers a storage map implementation under an id, replacing any
    /// existing registration.
    pub fn register_map(&self, map_id: u32, map: SharedStorageMap) {
        self.inner.maps.write().insert(map_id, map);
    }

    /// Destroys the storage map registered under the id.
    pub fn remove_map(&self, map_id: u32) {
        if let Some(map) = self.inner.maps.write().remove(&map_id) {
            map.remove_map();
        }
    }

    /// Creates a transient scratch map that is not registered with the
    /// engine. Used by size estimation to deduplicate keys.
    pub fn create_temp_map(&self) -> MemoryMap<i32> {
        let id = self.inner.next_temp_id.fetch_sub(1, Ordering::Relaxed);
        MemoryMap::new(id)
    }

    /// Asks the validator whether a foreign in-doubt transaction is known
    /// committed. Without a validator the answer is conservative: not
    /// valid, so readers fall back to the undo prior and writers observe
    /// the entry as locked.
    pub fn validate_transaction(
        &self,
        validator: Option<&Arc<dyn TransactionValidator>>,
        foreign_id: u32,
        observer_id: u32,
    ) -> bool {
        match validator {
            Some(v) => {
                let valid = v.validate(foreign_id, observer_id);
                debug!(foreign_id, observer_id, valid, "validated in-doubt transaction");
                valid
            }
            None => false,
        }
    }

    /// Retires an odd-id transaction the local thread has observed to be
    /// committed: flips each of its surviving writes to a committed clone
    /// and purges its undo entries.
    pub fn commit_after_validate(&self, foreign_id: u32) {
        let entries = self.inner.undo_log.entries_for(foreign_id);
        debug!(foreign_id, entries = entries.len(), "retiring validated transaction");
        for (_, entry) in &entries {
            let Some(map) = self.storage_map(entry.map_id) else {
                continue;
            };
            let Some(current) = map.get(&entry.key) else {
                continue;
            };
            if tx_of(current.operation_id) != foreign_id {
                continue;
            }
            if current.is_tombstone() {
                map.remove_key(&entry.key);
            } else {
                let committed = current.clone().into_committed();
                if let Err(e) = map.replace(&entry.key, &current, committed) {
                    warn!(foreign_id, error = %e, "retire failed for key {:?}", entry.key);
                }
            }
        }
        self.inner.undo_log.purge(foreign_id);
    }

    /// Commits a transaction: flips each surviving write to a committed
    /// clone in log order and drains the undo entries.
    ///
    /// The stored value's operation id matches the undo entry's only for
    /// the last write per key, so earlier entries for a rewritten key are
    /// skipped. A failed flip is corruption-class.
    pub(super) fn commit_transaction(&self, transaction_id: u32) -> Result<(), TxnError> {
        let entries = self.inner.undo_log.entries_for(transaction_id);
        debug!(transaction_id, entries = entries.len(), "committing transaction");
        for (operation_id, entry) in &entries {
            if let Some(map) = self.storage_map(entry.map_id) {
                if let Some(current) = map.get(&entry.key) {
                    if current.operation_id == *operation_id {
                        if current.is_tombstone() {
                            map.remove_key(&entry.key);
                        } else {
                            let committed = current.clone().into_committed();
                            match map.replace(&entry.key, &current, committed) {
                                Ok(true) => {}
                                Ok(false) | Err(_) => {
                                    return Err(TxnError::Corrupt {
                                        key: entry.key.clone(),
                                    });
                                }
                            }
                        }
                    }
                }
            }
            self.inner.undo_log.remove(*operation_id);
        }
        Ok(())
    }

    /// Rolls a transaction back to a log point: restores priors in reverse
    /// log order for every write with `log_id >= to_log_id` and drops the
    /// corresponding undo entries. Restore failures are logged, never
    /// raised.
    pub(super) fn rollback_transaction(&self, transaction_id: u32, to_log_id: u32) {
        let entries = self.inner.undo_log.entries_for(transaction_id);
        let tail: Vec<_> = entries
            .into_iter()
            .filter(|(id, _)| log_of(*id) >= to_log_id)
            .collect();
        debug!(transaction_id, to_log_id, entries = tail.len(), "rolling back transaction");
        for (operation_id, entry) in tail.into_iter().rev() {
            if let Some(map) = self.storage_map(entry.map_id) {
                match entry.prior {
                    None => {
                        map.remove_key(&entry.key);
                    }
                    Some(prior) => {
                        if let Err(e) = map.put(entry.key.clone(), prior) {
                            warn!(
                                transaction_id,
                                error = %e,
                                "rollback restore failed for key {:?}", entry.key
                            );
                        }
                    }
                }
            }
            self.inner.undo_log.remove(operation_id);
        }
    }

    fn storage_map(&self, map_id: u32) -> Option<SharedStorageMap> {
        self.inner.maps.read().get(&map_id).map(Arc::clone)
    }
}

impl Default for TransactionEngine {
    fn default() -> Self {
        Self::new()
    }
}
