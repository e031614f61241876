// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Undo log shared by all transactions of one engine.
//!
//! The log maps operation ids to the prior versioned value each write
//! displaced. Because operation ids pack `(transaction_id, log_id)` with
//! the transaction id in the high bits, one transaction's entries are
//! contiguous and in log-id order in the tree.
//!
//! All structural operations hold the single log mutex. The mutex is
//! leaf-level: no other lock may be acquired while holding it, which is
//! why the commit and rollback paths snapshot entries first and apply map
//! operations outside the lock.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::storage::Key;

use super::versioned::{pack, VersionedValue};

/// One recorded write: the map it hit, the key, and the value it displaced.
///
/// `prior == None` means the key did not exist before the write.
#[derive(Debug, Clone)]
pub struct UndoEntry {
    pub map_id: u32,
    pub key: Key,
    pub prior: Option<VersionedValue>,
}

/// Ordered log of uncommitted writes, keyed by operation id.
#[derive(Default)]
pub struct UndoLog {
    entries: Mutex<BTreeMap<u64, UndoEntry>>,
}

impl UndoLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the undo entry for one write.
    pub fn append(&self, operation_id: u64, map_id: u32, key: Key, prior: Option<VersionedValue>) {
        self.entries
            .lock()
            .insert(operation_id, UndoEntry { map_id, key, prior });
    }

    /// Removes and returns the entry for an operation id.
    pub fn remove(&self, operation_id: u64) -> Option<UndoEntry> {
        self.entries.lock().remove(&operation_id)
    }

    /// Returns the entry for an operation id, if still logged.
    ///
    /// Readers resolving visibility call this for single lookups; each
    /// lookup takes the mutex on its own.
    pub fn get(&self, operation_id: u64) -> Option<UndoEntry> {
        self.entries.lock().get(&operation_id).cloned()
    }

    /// Returns one transaction's entries in log-id order.
    pub fn entries_for(&self, transaction_id: u32) -> Vec<(u64, UndoEntry)> {
        let range = pack(transaction_id, 0)..=pack(transaction_id, u32::MAX);
        self.entries
            .lock()
            .range(range)
            .map(|(id, e)| (*id, e.clone()))
            .collect()
    }

    /// Removes all entries of one transaction.
    pub fn purge(&self, transaction_id: u32) {
        let range = pack(transaction_id, 0)..=pack(transaction_id, u32::MAX);
        let mut entries = self.entries.lock();
        let ids: Vec<u64> = entries.range(range).map(|(id, _)| *id).collect();
        for id in ids {
            entries.remove(&id);
        }
    }

    /// Returns a snapshot of the whole log in operation-id order.
    pub fn snapshot(&self) -> Vec<(u64, UndoEntry)> {
        self.entries
            .lock()
            .iter()
            .map(|(id, e)| (*id, e.clone()))
            .collect()
    }

    /// Returns the number of logged writes across all transactions.
    pub fn size_as_long(&self) -> u64 {
        self.entries.lock().len() as u64
    }
}
