// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Transactional view over one ordered storage map.
//!
//! A [`TransactionMap`] reads the shared [`StorageMap`] through a
//! visibility filter and writes through the optimistic protocol: reserve
//! an undo slot, then compare-and-swap the new versioned value into the
//! raw map. Losing the swap pops the undo slot again, so the undo log
//! only ever describes applied writes.
//!
//! Reads walk the undo log backwards from the stored value until they
//! reach a version that was effective at the map's read log point. A
//! foreign in-doubt (odd-id) write triggers the transaction's validator;
//! a validated writer is retired on the spot and the read restarts.

use std::sync::Arc;

use tracing::warn;

use crate::storage::{Key, KeyType, StorageCursor, StorageMap, Value, MAX_VALUE_SIZE};

use super::engine::SharedStorageMap;
use super::error::TxnError;
use super::transaction::Transaction;
use super::versioned::{is_in_doubt, log_of, tx_of, VersionedValue, COMMITTED};

/// A per-transaction view over one ordered map.
pub struct TransactionMap {
    map_id: u32,
    /// Own writes with a log id at or past this point are invisible to
    /// reads; used for statement-level snapshots ("update t set id=id+1"
    /// must not chase its own writes).
    read_log_id: u64,
    map: SharedStorageMap,
    transaction: Arc<Transaction>,
}

impl TransactionMap {
    pub(super) fn new(transaction: Arc<Transaction>, map: SharedStorageMap, map_id: u32) -> Self {
        Self {
            map_id,
            read_log_id: u64::MAX,
            map,
            transaction,
        }
    }

    /// Returns the map id.
    #[inline]
    pub fn map_id(&self) -> u32 {
        self.map_id
    }

    /// Sets the read savepoint. Afterwards, reads are based on it.
    pub fn set_savepoint(&mut self, savepoint: u64) {
        self.read_log_id = savepoint;
    }

    /// Returns a clone of this view bound to another transaction and read
    /// point.
    pub fn get_instance(&self, transaction: &Arc<Transaction>, savepoint: u64) -> TransactionMap {
        let mut m = TransactionMap::new(Arc::clone(transaction), Arc::clone(&self.map), self.map_id);
        m.set_savepoint(savepoint);
        m
    }

    /// Returns the size of the raw map, including uncommitted and
    /// transiently removed entries; an upper bound of the visible size.
    pub fn size_as_long_max(&self) -> u64 {
        self.map.size_as_long()
    }

    /// Returns the number of entries visible to this transaction.
    ///
    /// Cheap when the undo log is empty. When the undo log is larger than
    /// the raw map, every entry is resolved through the visibility filter;
    /// otherwise the undo log is scanned and invisible keys are subtracted
    /// once each, deduplicated through a transient map.
    pub fn size_as_long(&self) -> Result<u64, TxnError> {
        let size_raw = self.map.size_as_long();
        let undo = self.transaction.engine().undo_log();
        let undo_size = undo.size_as_long();
        if undo_size == 0 {
            return Ok(size_raw);
        }
        if undo_size > size_raw {
            // the undo log is larger than the map: count visible entries
            let mut size = 0u64;
            let mut cursor = self.map.cursor(None);
            while let Some((key, data)) = cursor.next()? {
                if let Some(resolved) = self.versioned_value(&key, self.read_log_id, Some(data))? {
                    if !resolved.is_tombstone() {
                        size += 1;
                    }
                }
            }
            return Ok(size);
        }
        // the undo log is smaller than the map: subtract entries of this
        // map that are invisible to us, counting each key once
        let snapshot = undo.snapshot();
        let mut size = self.map.size_as_long();
        let temp = self.transaction.engine().create_temp_map();
        for (_, entry) in snapshot {
            if entry.map_id != self.map_id {
                continue;
            }
            if self.get(&entry.key)?.is_none() && temp.put(entry.key.clone(), 1)?.is_none() {
                size = size.saturating_sub(1);
            }
        }
        temp.remove_map();
        Ok(size)
    }

    /// Returns the value visible at the read savepoint, or `None` if the
    /// key is absent or tombstoned.
    pub fn get(&self, key: &Key) -> Result<Option<Value>, TxnError> {
        self.get_at(key, self.read_log_id)
    }

    /// Returns the most recent value: latest committed, or this
    /// transaction's own newest write.
    pub fn get_latest(&self, key: &Key) -> Result<Option<Value>, TxnError> {
        self.get_at(key, u64::MAX)
    }

    /// Returns the value visible at an explicit log point.
    pub fn get_at(&self, key: &Key, max_log: u64) -> Result<Option<Value>, TxnError> {
        let current = self.map.get(key);
        let resolved = self.versioned_value(key, max_log, current)?;
        Ok(resolved.and_then(|v| v.value))
    }

    /// Whether the map contains a visible entry for the key.
    pub fn contains_key(&self, key: &Key) -> Result<bool, TxnError> {
        Ok(self.get(key)?.is_some())
    }

    /// Whether the latest physical write on the key belongs to this
    /// transaction.
    pub fn is_same_transaction(&self, key: &Key) -> bool {
        match self.map.get(key) {
            None => false,
            Some(data) => tx_of(data.operation_id) == self.transaction.id(),
        }
    }

    /// Resolves the versioned value that was effective at `max_log` from
    /// this transaction's viewpoint, walking the undo log past foreign and
    /// too-recent own writes.
    fn versioned_value(
        &self,
        key: &Key,
        max_log: u64,
        mut current: Option<VersionedValue>,
    ) -> Result<Option<VersionedValue>, TxnError> {
        loop {
            let Some(data) = current else {
                // doesn't exist or deleted by a committed transaction
                return Ok(None);
            };
            let id = data.operation_id;
            if id == COMMITTED {
                return Ok(Some(data));
            }
            let tx = tx_of(id);
            if tx == self.transaction.id() {
                if (log_of(id) as u64) < max_log {
                    // own write, old enough to be visible
                    return Ok(Some(data));
                }
            } else if is_in_doubt(tx) {
                let engine = self.transaction.engine();
                if engine.validate_transaction(
                    self.transaction.validator(),
                    tx,
                    self.transaction.id(),
                ) {
                    engine.commit_after_validate(tx);
                    current = self.map.get(key);
                    continue;
                }
            }
            // step to the value before the uncommitted write
            match self.transaction.engine().undo_log().get(id) {
                Some(entry) => current = entry.prior,
                None => {
                    // committed or rolled back in the meantime, or changed
                    // again by a transaction reusing the id
                    let reloaded = self.map.get(key);
                    if let Some(v) = &reloaded {
                        if v.operation_id == id {
                            return Err(TxnError::Corrupt { key: key.clone() });
                        }
                    }
                    current = reloaded;
                }
            }
        }
    }

    /// Updates the value for the key.
    ///
    /// Fails with [`TxnError::Locked`] if another transaction holds an
    /// uncommitted write on the key; retry and backoff are the caller's
    /// responsibility.
    pub fn put(&self, key: &Key, value: Value) -> Result<Option<Value>, TxnError> {
        if value.len() > MAX_VALUE_SIZE {
            return Err(crate::storage::StorageError::ValueTooLarge {
                size: value.len(),
                max: MAX_VALUE_SIZE,
            }
            .into());
        }
        self.set(key, Some(value))
    }

    /// Removes the entry for the key by installing a tombstone. Same
    /// locking rules as [`TransactionMap::put`].
    pub fn remove(&self, key: &Key) -> Result<Option<Value>, TxnError> {
        self.set(key, None)
    }

    /// Writes a committed value directly, bypassing MVCC and the undo
    /// log. Used for bulk loads and initialization.
    pub fn put_committed(&self, key: &Key, value: Value) -> Result<Option<Value>, TxnError> {
        if value.len() > MAX_VALUE_SIZE {
            return Err(crate::storage::StorageError::ValueTooLarge {
                size: value.len(),
                max: MAX_VALUE_SIZE,
            }
            .into());
        }
        let old = self
            .map
            .put(key.clone(), VersionedValue::committed(Some(value)))?;
        Ok(old.and_then(|v| v.value))
    }

    fn set(&self, key: &Key, value: Option<Value>) -> Result<Option<Value>, TxnError> {
        self.transaction.check_not_closed()?;
        let old = self.get(key)?;
        if self.try_set(key, value, false)? {
            Ok(old)
        } else {
            Err(TxnError::Locked { key: key.clone() })
        }
    }

    /// Tries to update the value for the key; fails if another open
    /// transaction changed the row.
    pub fn try_put(&self, key: &Key, value: Value) -> Result<bool, TxnError> {
        self.try_set(key, Some(value), false)
    }

    /// Tries to remove the entry for the key; fails if another open
    /// transaction changed the row.
    pub fn try_remove(&self, key: &Key) -> Result<bool, TxnError> {
        self.try_set(key, None, false)
    }

    /// Tries to set or remove the value (`None` removes). With
    /// `only_if_unchanged`, the value is only written if it has not
    /// changed since the map's read savepoint.
    ///
    /// Returns `false` on a concurrent update instead of blocking.
    pub fn try_set(
        &self,
        key: &Key,
        value: Option<Value>,
        only_if_unchanged: bool,
    ) -> Result<bool, TxnError> {
        let current = self.map.get(key);
        if only_if_unchanged {
            let old = self.versioned_value(key, self.read_log_id, current.clone())?;
            if !self.map.values_equal(old.as_ref(), current.as_ref()) {
                let Some(current_v) = &current else {
                    // entry vanished under a foreign commit
                    return Ok(false);
                };
                if tx_of(current_v.operation_id) == self.transaction.id() {
                    if value.is_none() {
                        // removing an entry that was added or changed in
                        // the same statement collapses to success; no undo
                        // entry is appended
                        return Ok(true);
                    } else if current_v.is_tombstone() {
                        // re-add an entry that was removed in the same
                        // statement
                    } else {
                        return Ok(false);
                    }
                } else {
                    return Ok(false);
                }
            }
        }
        match current {
            None => {
                // a new value
                let op = self.transaction.log(self.map_id, key.clone(), None)?;
                let new_value = VersionedValue::uncommitted(op, value);
                match self.map.put_if_absent(key.clone(), new_value) {
                    Ok(None) => Ok(true),
                    Ok(Some(_)) => {
                        // somebody else was faster
                        self.transaction.log_undo();
                        Ok(false)
                    }
                    Err(e) => {
                        self.transaction.log_undo();
                        Err(e.into())
                    }
                }
            }
            Some(current_v) if current_v.is_committed() => {
                // committed entry: overwrite it
                let op = self
                    .transaction
                    .log(self.map_id, key.clone(), Some(current_v.clone()))?;
                let new_value = VersionedValue::uncommitted(op, value);
                match self.map.replace(key, &current_v, new_value) {
                    Ok(true) => Ok(true),
                    Ok(false) => {
                        // somebody else was faster
                        self.transaction.log_undo();
                        Ok(false)
                    }
                    Err(e) => {
                        self.transaction.log_undo();
                        Err(e.into())
                    }
                }
            }
            Some(current_v) if tx_of(current_v.operation_id) == self.transaction.id() => {
                // added or updated by this transaction
                let op = self
                    .transaction
                    .log(self.map_id, key.clone(), Some(current_v.clone()))?;
                let new_value = VersionedValue::uncommitted(op, value);
                match self.map.replace(key, &current_v, new_value) {
                    Ok(true) => Ok(true),
                    Ok(false) => {
                        // unexpected: our uncommitted value was overwritten
                        self.transaction.log_undo();
                        Ok(false)
                    }
                    Err(e) => {
                        self.transaction.log_undo();
                        Err(e.into())
                    }
                }
            }
            Some(current_v) => {
                let tx = tx_of(current_v.operation_id);
                if is_in_doubt(tx) {
                    let engine = self.transaction.engine();
                    if engine.validate_transaction(
                        self.transaction.validator(),
                        tx,
                        self.transaction.id(),
                    ) {
                        engine.commit_after_validate(tx);
                        return self.try_set(key, value, only_if_unchanged);
                    }
                }
                // foreign transaction, not yet committed: locked
                Ok(false)
            }
        }
    }

    /// Returns the first visible key, or `None` if the view is empty.
    pub fn first_key(&self) -> Result<Option<Key>, TxnError> {
        self.key_iterator(None, false).next().transpose()
    }

    /// Returns the last visible key, or `None` if the view is empty.
    pub fn last_key(&self) -> Result<Option<Key>, TxnError> {
        let mut candidate = self.map.last_key();
        loop {
            let Some(key) = candidate else {
                return Ok(None);
            };
            if self.get(&key)?.is_some() {
                return Ok(Some(key));
            }
            candidate = self.map.lower_key(&key);
        }
    }

    /// Returns the smallest visible key strictly greater than the given
    /// key.
    pub fn higher_key(&self, key: &Key) -> Result<Option<Key>, TxnError> {
        let mut from = key.clone();
        loop {
            let Some(k) = self.map.higher_key(&from) else {
                return Ok(None);
            };
            if self.get(&k)?.is_some() {
                return Ok(Some(k));
            }
            from = k;
        }
    }

    /// Returns the largest visible key strictly smaller than the given
    /// key.
    pub fn lower_key(&self, key: &Key) -> Result<Option<Key>, TxnError> {
        let mut from = key.clone();
        loop {
            let Some(k) = self.map.lower_key(&from) else {
                return Ok(None);
            };
            if self.get(&k)?.is_some() {
                return Ok(Some(k));
            }
            from = k;
        }
    }

    /// Seeks `offset` keys forward or backward from the given key in the
    /// raw map. There might be no visible value for the returned key: the
    /// visibility filter is deliberately not applied, callers use this
    /// for statistical sampling over the physical key space.
    pub fn relative_key(&self, key: &Key, offset: i64) -> Option<Key> {
        let anchor = if offset > 0 {
            self.map.ceiling_key(key)
        } else {
            self.map.floor_key(key)
        }?;
        let index = self.map.index_of(&anchor)? as i64;
        let target = index.checked_add(offset)?;
        if target < 0 {
            return None;
        }
        self.map.key_at(target as u64)
    }

    /// Iterates over visible keys starting at `from` (inclusive), or over
    /// all physical keys when `include_uncommitted` is set.
    pub fn key_iterator(&self, from: Option<&Key>, include_uncommitted: bool) -> KeyIterator<'_> {
        KeyIterator {
            view: self,
            cursor: self.map.cursor(from),
            from: from.cloned(),
            last_key: None,
            include_uncommitted,
        }
    }

    /// Iterates over visible entries starting at `from` (inclusive), in
    /// key order.
    pub fn entry_iterator(&self, from: Option<&Key>) -> EntryIterator<'_> {
        EntryIterator {
            view: self,
            cursor: self.map.cursor(from),
            from: from.cloned(),
            last_key: None,
        }
    }

    /// Applies the visibility filter to an externally produced key
    /// iterator.
    pub fn wrap_iterator<'a, I>(
        &'a self,
        iter: I,
        include_uncommitted: bool,
    ) -> impl Iterator<Item = Result<Key, TxnError>> + 'a
    where
        I: Iterator<Item = Key> + 'a,
    {
        iter.filter_map(move |key| {
            if include_uncommitted {
                return Some(Ok(key));
            }
            match self.contains_key(&key) {
                Ok(true) => Some(Ok(key)),
                Ok(false) => None,
                Err(e) => Some(Err(e)),
            }
        })
    }

    /// Whether the underlying map has been destroyed.
    pub fn is_closed(&self) -> bool {
        self.map.is_closed()
    }

    /// Removes all entries. Non-transactional.
    pub fn clear(&self) {
        self.map.clear();
    }

    /// Destroys the underlying map. Non-transactional.
    pub fn remove_map(&self) {
        self.transaction.engine().remove_map(self.map_id);
    }

    /// Marks the underlying map volatile.
    pub fn set_volatile(&self, is_volatile: bool) {
        self.map.set_volatile(is_volatile);
    }

    /// Returns the key type of the underlying map.
    pub fn key_type(&self) -> KeyType {
        self.map.key_type()
    }
}

/// Steps a raw cursor, tolerating transient chunk loss by reseeking from
/// the last observed key and discarding it once.
fn advance(
    map: &SharedStorageMap,
    cursor: &mut Box<dyn StorageCursor<VersionedValue>>,
    from: Option<&Key>,
    last_key: Option<&Key>,
) -> Result<Option<(Key, VersionedValue)>, TxnError> {
    loop {
        match cursor.next() {
            Ok(entry) => return Ok(entry),
            Err(e) if e.is_transient() => {
                warn!(error = %e, "cursor lost its page, reseeking");
                loop {
                    *cursor = map.cursor(last_key.or(from));
                    if last_key.is_none() {
                        break;
                    }
                    // the reseeked cursor delivers the last observed key
                    // again; drop it
                    match cursor.next() {
                        Ok(Some(_)) => break,
                        Ok(None) => return Ok(None),
                        Err(e) if e.is_transient() => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Forward iterator over visible keys.
pub struct KeyIterator<'a> {
    view: &'a TransactionMap,
    cursor: Box<dyn StorageCursor<VersionedValue>>,
    from: Option<Key>,
    last_key: Option<Key>,
    include_uncommitted: bool,
}

impl Iterator for KeyIterator<'_> {
    type Item = Result<Key, TxnError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let step = advance(
                &self.view.map,
                &mut self.cursor,
                self.from.as_ref(),
                self.last_key.as_ref(),
            );
            match step {
                Ok(None) => return None,
                Ok(Some((key, _))) => {
                    self.last_key = Some(key.clone());
                    if self.include_uncommitted {
                        return Some(Ok(key));
                    }
                    match self.view.contains_key(&key) {
                        Ok(true) => return Some(Ok(key)),
                        Ok(false) => continue,
                        Err(e) => return Some(Err(e)),
                    }
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Forward iterator over visible entries.
pub struct EntryIterator<'a> {
    view: &'a TransactionMap,
    cursor: Box<dyn StorageCursor<VersionedValue>>,
    from: Option<Key>,
    last_key: Option<Key>,
}

impl Iterator for EntryIterator<'_> {
    type Item = Result<(Key, Value), TxnError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let step = advance(
                &self.view.map,
                &mut self.cursor,
                self.from.as_ref(),
                self.last_key.as_ref(),
            );
            match step {
                Ok(None) => return None,
                Ok(Some((key, data))) => {
                    self.last_key = Some(key.clone());
                    match self
                        .view
                        .versioned_value(&key, self.view.read_log_id, Some(data))
                    {
                        Ok(Some(resolved)) => {
                            if let Some(value) = resolved.value {
                                return Some(Ok((key, value)));
                            }
                        }
                        Ok(None) => {}
                        Err(e) => return Some(Err(e)),
                    }
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryMap, StorageError, StorageMap};
    use crate::txn::versioned::pack;
    use crate::txn::{TransactionEngine, TransactionValidator};
    use std::sync::atomic::{AtomicBool, Ordering};

    const MAP: u32 = 1;

    fn value(s: &str) -> Value {
        Value::from(s)
    }

    #[test]
    fn test_insert_then_read_same_transaction() {
        let engine = TransactionEngine::new();
        let t1 = engine.begin();
        let m1 = t1.open_map(MAP).unwrap();

        m1.put(&Key::from("a"), value("1")).unwrap();
        assert_eq!(m1.get(&Key::from("a")).unwrap(), Some(value("1")));
        t1.commit().unwrap();

        let t2 = engine.begin();
        let m2 = t2.open_map(MAP).unwrap();
        assert_eq!(m2.get(&Key::from("a")).unwrap(), Some(value("1")));
    }

    #[test]
    fn test_write_write_conflict() {
        let engine = TransactionEngine::new();
        let t1 = engine.begin();
        let m1 = t1.open_map(MAP).unwrap();
        m1.put(&Key::from("a"), value("1")).unwrap();

        let t2 = engine.begin();
        let m2 = t2.open_map(MAP).unwrap();
        assert!(!m2.try_put(&Key::from("a"), value("2")).unwrap());
        // the loser still reads the pre-state
        assert_eq!(m2.get(&Key::from("a")).unwrap(), None);
        // the raising form reports the lock
        assert!(matches!(
            m2.put(&Key::from("a"), value("2")),
            Err(TxnError::Locked { .. })
        ));

        t1.commit().unwrap();
        assert!(m2.try_put(&Key::from("a"), value("2")).unwrap());
        assert_eq!(m2.get(&Key::from("a")).unwrap(), Some(value("2")));
    }

    #[test]
    fn test_snapshot_read_over_foreign_uncommitted() {
        let engine = TransactionEngine::new();
        let t1 = engine.begin();
        let m1 = t1.open_map(MAP).unwrap();
        m1.put(&Key::from("a"), value("1")).unwrap();
        t1.commit().unwrap();

        let t2 = engine.begin();
        let m2 = t2.open_map(MAP).unwrap();
        assert_eq!(m2.get(&Key::from("a")).unwrap(), Some(value("1")));

        let t3 = engine.begin();
        let m3 = t3.open_map(MAP).unwrap();
        m3.put(&Key::from("a"), value("2")).unwrap();

        // the uncommitted foreign write resolves to its prior via undo
        assert_eq!(m2.get(&Key::from("a")).unwrap(), Some(value("1")));

        // committed foreign writes become visible atomically at the flip
        t3.commit().unwrap();
        assert_eq!(m2.get(&Key::from("a")).unwrap(), Some(value("2")));
    }

    #[test]
    fn test_own_write_visibility_against_read_savepoint() {
        let engine = TransactionEngine::new();
        let txn = engine.begin();
        let mut map = txn.open_map(MAP).unwrap();

        map.put_committed(&Key::from("x"), value("pre")).unwrap();
        map.put(&Key::from("x"), value("post")).unwrap(); // log id 0

        // read point after the write: sees the write
        map.set_savepoint(1);
        assert_eq!(map.get(&Key::from("x")).unwrap(), Some(value("post")));

        // read point at the write: sees the pre-image
        map.set_savepoint(0);
        assert_eq!(map.get(&Key::from("x")).unwrap(), Some(value("pre")));

        // get_latest ignores the read savepoint
        assert_eq!(map.get_latest(&Key::from("x")).unwrap(), Some(value("post")));
    }

    #[test]
    fn test_savepoint_rollback() {
        let engine = TransactionEngine::new();
        let t1 = engine.begin();
        let m = t1.open_map(MAP).unwrap();

        m.put(&Key::from("x"), value("10")).unwrap();
        let sp = t1.set_savepoint("s");
        m.put(&Key::from("x"), value("11")).unwrap();
        m.put(&Key::from("y"), value("20")).unwrap();

        t1.rollback_to_savepoint(sp).unwrap();

        assert_eq!(m.get(&Key::from("x")).unwrap(), Some(value("10")));
        assert_eq!(m.get(&Key::from("y")).unwrap(), None);
    }

    #[test]
    fn test_full_rollback_restores_preimage() {
        let engine = TransactionEngine::new();
        let setup = engine.begin();
        let m = setup.open_map(MAP).unwrap();
        m.put(&Key::from("a"), value("1")).unwrap();
        setup.commit().unwrap();

        let txn = engine.begin();
        let m = txn.open_map(MAP).unwrap();
        m.put(&Key::from("a"), value("2")).unwrap();
        m.remove(&Key::from("a")).unwrap();
        m.put(&Key::from("b"), value("3")).unwrap();
        txn.rollback().unwrap();

        let reader = engine.begin();
        let m = reader.open_map(MAP).unwrap();
        assert_eq!(m.get(&Key::from("a")).unwrap(), Some(value("1")));
        assert_eq!(m.get(&Key::from("b")).unwrap(), None);
    }

    #[test]
    fn test_tombstone_semantics() {
        let engine = TransactionEngine::new();
        let setup = engine.begin();
        let m = setup.open_map(MAP).unwrap();
        m.put(&Key::from("k"), value("v")).unwrap();
        setup.commit().unwrap();

        let t1 = engine.begin();
        let m1 = t1.open_map(MAP).unwrap();
        assert_eq!(m1.remove(&Key::from("k")).unwrap(), Some(value("v")));
        assert_eq!(m1.get(&Key::from("k")).unwrap(), None);

        // a foreign observer at a pre-remove snapshot still sees the value
        let t2 = engine.begin();
        let m2 = t2.open_map(MAP).unwrap();
        assert_eq!(m2.get(&Key::from("k")).unwrap(), Some(value("v")));

        // after commit the tombstone is physically gone
        t1.commit().unwrap();
        assert_eq!(m2.get(&Key::from("k")).unwrap(), None);
        assert_eq!(engine.open_storage_map(MAP).unwrap().get(&Key::from("k")), None);
    }

    #[test]
    fn test_in_doubt_validation_valid() {
        struct AlwaysValid;
        impl TransactionValidator for AlwaysValid {
            fn validate(&self, _foreign_id: u32, _observer_id: u32) -> bool {
                true
            }
        }

        let engine = TransactionEngine::new();
        let remote = engine.begin_in_doubt(None);
        let rm = remote.open_map(MAP).unwrap();
        rm.put(&Key::from("k"), value("7")).unwrap();

        let observer = engine.begin_with(Some(Arc::new(AlwaysValid)));
        let om = observer.open_map(MAP).unwrap();
        assert_eq!(om.get(&Key::from("k")).unwrap(), Some(value("7")));

        // the validated writer was retired: its value is now committed
        let stored = engine
            .open_storage_map(MAP)
            .unwrap()
            .get(&Key::from("k"))
            .unwrap();
        assert!(stored.is_committed());
    }

    #[test]
    fn test_in_doubt_validation_invalid() {
        struct NeverValid;
        impl TransactionValidator for NeverValid {
            fn validate(&self, _foreign_id: u32, _observer_id: u32) -> bool {
                false
            }
        }

        let engine = TransactionEngine::new();
        let setup = engine.begin();
        setup
            .open_map(MAP)
            .unwrap()
            .put(&Key::from("k"), value("old"))
            .unwrap();
        setup.commit().unwrap();

        let remote = engine.begin_in_doubt(None);
        remote
            .open_map(MAP)
            .unwrap()
            .put(&Key::from("k"), value("7"))
            .unwrap();

        let observer = engine.begin_with(Some(Arc::new(NeverValid)));
        let om = observer.open_map(MAP).unwrap();
        // invalid: the prior value from the undo log is visible
        assert_eq!(om.get(&Key::from("k")).unwrap(), Some(value("old")));
        // and the entry stays locked for writers
        assert!(!om.try_put(&Key::from("k"), value("8")).unwrap());
    }

    #[test]
    fn test_in_doubt_write_validation_unblocks_writer() {
        struct AlwaysValid;
        impl TransactionValidator for AlwaysValid {
            fn validate(&self, _foreign_id: u32, _observer_id: u32) -> bool {
                true
            }
        }

        let engine = TransactionEngine::new();
        let remote = engine.begin_in_doubt(None);
        remote
            .open_map(MAP)
            .unwrap()
            .put(&Key::from("k"), value("7"))
            .unwrap();

        let writer = engine.begin_with(Some(Arc::new(AlwaysValid)));
        let wm = writer.open_map(MAP).unwrap();
        // validation retires the in-doubt writer, then the write restarts
        assert!(wm.try_put(&Key::from("k"), value("8")).unwrap());
        assert_eq!(wm.get_latest(&Key::from("k")).unwrap(), Some(value("8")));
    }

    #[test]
    fn test_is_same_transaction() {
        let engine = TransactionEngine::new();
        let t1 = engine.begin();
        let m1 = t1.open_map(MAP).unwrap();
        m1.put(&Key::from("mine"), value("1")).unwrap();
        m1.put_committed(&Key::from("committed"), value("2")).unwrap();

        assert!(m1.is_same_transaction(&Key::from("mine")));
        assert!(!m1.is_same_transaction(&Key::from("committed")));
        assert!(!m1.is_same_transaction(&Key::from("absent")));

        let t2 = engine.begin();
        let m2 = t2.open_map(MAP).unwrap();
        assert!(!m2.is_same_transaction(&Key::from("mine")));
    }

    #[test]
    fn test_put_committed_appends_no_undo() {
        let engine = TransactionEngine::new();
        let txn = engine.begin();
        let m = txn.open_map(MAP).unwrap();
        m.put_committed(&Key::from("a"), value("1")).unwrap();
        assert_eq!(engine.undo_log().size_as_long(), 0);
        assert_eq!(txn.log_id(), 0);
        assert_eq!(m.get(&Key::from("a")).unwrap(), Some(value("1")));
    }

    #[test]
    fn test_try_set_unchanged_self_remove_appends_no_undo() {
        let engine = TransactionEngine::new();
        let txn = engine.begin();
        let mut m = txn.open_map(MAP).unwrap();

        m.put(&Key::from("a"), value("1")).unwrap();
        // statement boundary: reads are pinned before the write
        m.set_savepoint(0);
        let undo_before = engine.undo_log().size_as_long();

        // removing an entry added in the same statement collapses to
        // success without touching the map or the log
        assert!(m.try_set(&Key::from("a"), None, true).unwrap());
        assert_eq!(engine.undo_log().size_as_long(), undo_before);
        assert_eq!(m.get_latest(&Key::from("a")).unwrap(), Some(value("1")));
    }

    #[test]
    fn test_try_set_unchanged_readd_of_self_removed_entry() {
        let engine = TransactionEngine::new();
        let setup = engine.begin();
        setup
            .open_map(MAP)
            .unwrap()
            .put(&Key::from("a"), value("1"))
            .unwrap();
        setup.commit().unwrap();

        let txn = engine.begin();
        let mut m = txn.open_map(MAP).unwrap();
        m.remove(&Key::from("a")).unwrap();
        m.set_savepoint(0);

        // re-adding an entry removed in the same statement is permitted
        assert!(m.try_set(&Key::from("a"), Some(value("2")), true).unwrap());
        assert_eq!(m.get_latest(&Key::from("a")).unwrap(), Some(value("2")));
    }

    #[test]
    fn test_try_set_unchanged_rejects_self_update() {
        let engine = TransactionEngine::new();
        let txn = engine.begin();
        let mut m = txn.open_map(MAP).unwrap();
        m.put(&Key::from("a"), value("1")).unwrap();
        m.set_savepoint(0);

        // overwriting a value changed in the same statement is refused
        assert!(!m.try_set(&Key::from("a"), Some(value("2")), true).unwrap());
    }

    #[test]
    fn test_try_set_unchanged_rejects_foreign_change() {
        let engine = TransactionEngine::new();
        let t1 = engine.begin();
        t1.open_map(MAP)
            .unwrap()
            .put(&Key::from("a"), value("1"))
            .unwrap();

        let t2 = engine.begin();
        let m2 = t2.open_map(MAP).unwrap();
        assert!(!m2.try_set(&Key::from("a"), Some(value("2")), true).unwrap());
    }

    #[test]
    fn test_entry_iterator_matches_visible_gets() {
        let engine = TransactionEngine::new();
        let setup = engine.begin();
        let sm = setup.open_map(MAP).unwrap();
        sm.put(&Key::from("a"), value("1")).unwrap();
        sm.put(&Key::from("c"), value("3")).unwrap();
        setup.commit().unwrap();

        let txn = engine.begin();
        let m = txn.open_map(MAP).unwrap();
        m.put(&Key::from("b"), value("2")).unwrap(); // own, visible
        m.remove(&Key::from("c")).unwrap(); // own tombstone

        let foreign = engine.begin();
        foreign
            .open_map(MAP)
            .unwrap()
            .put(&Key::from("d"), value("4"))
            .unwrap(); // foreign uncommitted, invisible

        let entries: Vec<(Key, Value)> = m
            .entry_iterator(None)
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(
            entries,
            vec![
                (Key::from("a"), value("1")),
                (Key::from("b"), value("2")),
            ]
        );

        // the same set as pointwise gets, in key order
        for (k, v) in &entries {
            assert_eq!(m.get(k).unwrap().as_ref(), Some(v));
        }
    }

    #[test]
    fn test_key_iterator_include_uncommitted() {
        let engine = TransactionEngine::new();
        let t1 = engine.begin();
        let m1 = t1.open_map(MAP).unwrap();
        m1.put(&Key::from("a"), value("1")).unwrap();

        let t2 = engine.begin();
        let m2 = t2.open_map(MAP).unwrap();

        let visible: Vec<Key> = m2.key_iterator(None, false).map(|r| r.unwrap()).collect();
        assert!(visible.is_empty());

        let physical: Vec<Key> = m2.key_iterator(None, true).map(|r| r.unwrap()).collect();
        assert_eq!(physical, vec![Key::from("a")]);
    }

    #[test]
    fn test_key_iterator_from_is_inclusive() {
        let engine = TransactionEngine::new();
        let setup = engine.begin();
        let sm = setup.open_map(MAP).unwrap();
        for k in ["a", "b", "c"] {
            sm.put(&Key::from(k), value(k)).unwrap();
        }
        setup.commit().unwrap();

        let txn = engine.begin();
        let m = txn.open_map(MAP).unwrap();
        let keys: Vec<Key> = m
            .key_iterator(Some(&Key::from("b")), false)
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(keys, vec![Key::from("b"), Key::from("c")]);
    }

    #[test]
    fn test_wrap_iterator_filters_invisible_keys() {
        let engine = TransactionEngine::new();
        let setup = engine.begin();
        setup
            .open_map(MAP)
            .unwrap()
            .put(&Key::from("a"), value("1"))
            .unwrap();
        setup.commit().unwrap();

        let txn = engine.begin();
        let m = txn.open_map(MAP).unwrap();
        let input = vec![Key::from("a"), Key::from("ghost")];
        let filtered: Vec<Key> = m
            .wrap_iterator(input.clone().into_iter(), false)
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(filtered, vec![Key::from("a")]);

        let unfiltered: Vec<Key> = m
            .wrap_iterator(input.into_iter(), true)
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(unfiltered, vec![Key::from("a"), Key::from("ghost")]);
    }

    #[test]
    fn test_navigation_skips_invisible_keys() {
        let engine = TransactionEngine::new();
        let setup = engine.begin();
        let sm = setup.open_map(MAP).unwrap();
        sm.put(&Key::from("b"), value("2")).unwrap();
        sm.put(&Key::from("d"), value("4")).unwrap();
        setup.commit().unwrap();

        // foreign uncommitted writes around the committed ones
        let foreign = engine.begin();
        let fm = foreign.open_map(MAP).unwrap();
        fm.put(&Key::from("a"), value("x")).unwrap();
        fm.put(&Key::from("c"), value("x")).unwrap();
        fm.put(&Key::from("e"), value("x")).unwrap();

        let txn = engine.begin();
        let m = txn.open_map(MAP).unwrap();
        assert_eq!(m.first_key().unwrap(), Some(Key::from("b")));
        assert_eq!(m.last_key().unwrap(), Some(Key::from("d")));
        assert_eq!(m.higher_key(&Key::from("b")).unwrap(), Some(Key::from("d")));
        assert_eq!(m.lower_key(&Key::from("d")).unwrap(), Some(Key::from("b")));
        assert_eq!(m.higher_key(&Key::from("d")).unwrap(), None);
        assert_eq!(m.lower_key(&Key::from("b")).unwrap(), None);
    }

    #[test]
    fn test_relative_key_is_unfiltered() {
        let engine = TransactionEngine::new();
        let foreign = engine.begin();
        let fm = foreign.open_map(MAP).unwrap();
        fm.put(&Key::from("a"), value("x")).unwrap();
        fm.put(&Key::from("b"), value("x")).unwrap();
        fm.put(&Key::from("c"), value("x")).unwrap();

        let txn = engine.begin();
        let m = txn.open_map(MAP).unwrap();
        // nothing is visible, but relative_key seeks the raw key space
        assert_eq!(m.relative_key(&Key::from("a"), 2), Some(Key::from("c")));
        assert_eq!(m.relative_key(&Key::from("c"), -1), Some(Key::from("b")));
        assert_eq!(m.relative_key(&Key::from("a"), -1), None);
        assert_eq!(m.relative_key(&Key::from("c"), 5), None);
    }

    #[test]
    fn test_size_bounds() {
        let engine = TransactionEngine::new();
        let setup = engine.begin();
        let sm = setup.open_map(MAP).unwrap();
        sm.put(&Key::from("a"), value("1")).unwrap();
        sm.put(&Key::from("b"), value("2")).unwrap();
        setup.commit().unwrap();

        let txn = engine.begin();
        let m = txn.open_map(MAP).unwrap();
        m.remove(&Key::from("a")).unwrap();
        m.put(&Key::from("c"), value("3")).unwrap();

        // visible: b, c; raw: a(tombstone), b, c
        assert_eq!(m.size_as_long().unwrap(), 2);
        assert_eq!(m.size_as_long_max(), 3);
        assert!(m.size_as_long().unwrap() <= m.size_as_long_max());

        // after rolling back the only active transaction the sizes agree
        txn.rollback().unwrap();
        let reader = engine.begin();
        let m = reader.open_map(MAP).unwrap();
        assert_eq!(m.size_as_long().unwrap(), 2);
        assert_eq!(m.size_as_long_max(), 2);
    }

    #[test]
    fn test_size_with_undo_log_larger_than_map() {
        let engine = TransactionEngine::new();
        let setup = engine.begin();
        let sm = setup.open_map(MAP).unwrap();
        for k in ["a", "b", "c"] {
            sm.put(&Key::from(k), value(k)).unwrap();
        }
        setup.commit().unwrap();

        let txn = engine.begin();
        let m = txn.open_map(MAP).unwrap();
        // three removes and one rewrite: undo log (4) > raw map (3)
        m.remove(&Key::from("a")).unwrap();
        m.remove(&Key::from("b")).unwrap();
        m.remove(&Key::from("c")).unwrap();
        m.put(&Key::from("c"), value("again")).unwrap();

        assert!(engine.undo_log().size_as_long() > m.size_as_long_max());
        assert_eq!(m.size_as_long().unwrap(), 1);
    }

    #[test]
    fn test_size_counts_foreign_uncommitted_inserts_as_invisible() {
        let engine = TransactionEngine::new();
        let setup = engine.begin();
        let sm = setup.open_map(MAP).unwrap();
        for k in ["a", "b", "c", "d"] {
            sm.put(&Key::from(k), value(k)).unwrap();
        }
        setup.commit().unwrap();

        let foreign = engine.begin();
        foreign
            .open_map(MAP)
            .unwrap()
            .put(&Key::from("e"), value("x"))
            .unwrap();

        let txn = engine.begin();
        let m = txn.open_map(MAP).unwrap();
        assert_eq!(m.size_as_long().unwrap(), 4);
        assert_eq!(m.size_as_long_max(), 5);
    }

    #[test]
    fn test_corrupt_detection() {
        let engine = TransactionEngine::new();
        let raw = engine.open_storage_map(MAP).unwrap();
        // a stored uncommitted value whose undo entry never existed
        raw.put(
            Key::from("k"),
            VersionedValue::uncommitted(pack(100, 0), Some(value("v"))),
        )
        .unwrap();

        let txn = engine.begin();
        let m = txn.open_map(MAP).unwrap();
        assert!(matches!(
            m.get(&Key::from("k")),
            Err(TxnError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_write_after_close_is_rejected() {
        let engine = TransactionEngine::new();
        let txn = engine.begin();
        let m = txn.open_map(MAP).unwrap();
        txn.commit().unwrap();
        assert!(matches!(
            m.put(&Key::from("a"), value("1")),
            Err(TxnError::Closed { .. })
        ));
    }

    #[test]
    fn test_get_instance_rebinds_transaction_and_read_point() {
        let engine = TransactionEngine::new();
        let t1 = engine.begin();
        let m1 = t1.open_map(MAP).unwrap();
        m1.put_committed(&Key::from("a"), value("1")).unwrap();

        let t2 = engine.begin();
        let m2 = m1.get_instance(&t2, u64::MAX);
        assert_eq!(m2.map_id(), m1.map_id());
        assert_eq!(m2.get(&Key::from("a")).unwrap(), Some(value("1")));

        m2.put(&Key::from("b"), value("2")).unwrap();
        assert!(m2.is_same_transaction(&Key::from("b")));
        assert!(!m1.is_same_transaction(&Key::from("b")));
    }

    #[test]
    fn test_remove_map_closes_view() {
        let engine = TransactionEngine::new();
        let txn = engine.begin();
        let m = txn.open_map(MAP).unwrap();
        m.put_committed(&Key::from("a"), value("1")).unwrap();
        assert!(!m.is_closed());
        m.remove_map();
        assert!(m.is_closed());
    }

    /// Wraps a MemoryMap with a cursor that loses its page once, to
    /// exercise the iterator reseek path.
    struct ChunkyMap {
        inner: MemoryMap<VersionedValue>,
        tripped: Arc<AtomicBool>,
    }

    struct ChunkyCursor {
        inner: Box<dyn StorageCursor<VersionedValue>>,
        steps: u32,
        tripped: Arc<AtomicBool>,
    }

    impl StorageCursor<VersionedValue> for ChunkyCursor {
        fn next(&mut self) -> Result<Option<(Key, VersionedValue)>, StorageError> {
            self.steps += 1;
            if self.steps == 2 && !self.tripped.swap(true, Ordering::SeqCst) {
                return Err(StorageError::ChunkNotFound { chunk: 42 });
            }
            self.inner.next()
        }
    }

    impl StorageMap<VersionedValue> for ChunkyMap {
        fn get(&self, key: &Key) -> Option<VersionedValue> {
            self.inner.get(key)
        }
        fn put(
            &self,
            key: Key,
            v: VersionedValue,
        ) -> Result<Option<VersionedValue>, StorageError> {
            self.inner.put(key, v)
        }
        fn put_if_absent(
            &self,
            key: Key,
            v: VersionedValue,
        ) -> Result<Option<VersionedValue>, StorageError> {
            self.inner.put_if_absent(key, v)
        }
        fn replace(
            &self,
            key: &Key,
            old: &VersionedValue,
            new: VersionedValue,
        ) -> Result<bool, StorageError> {
            self.inner.replace(key, old, new)
        }
        fn remove_key(&self, key: &Key) -> Option<VersionedValue> {
            self.inner.remove_key(key)
        }
        fn cursor(&self, from: Option<&Key>) -> Box<dyn StorageCursor<VersionedValue>> {
            Box::new(ChunkyCursor {
                inner: self.inner.cursor(from),
                steps: 0,
                tripped: Arc::clone(&self.tripped),
            })
        }
        fn first_key(&self) -> Option<Key> {
            self.inner.first_key()
        }
        fn last_key(&self) -> Option<Key> {
            self.inner.last_key()
        }
        fn higher_key(&self, key: &Key) -> Option<Key> {
            self.inner.higher_key(key)
        }
        fn lower_key(&self, key: &Key) -> Option<Key> {
            self.inner.lower_key(key)
        }
        fn ceiling_key(&self, key: &Key) -> Option<Key> {
            self.inner.ceiling_key(key)
        }
        fn floor_key(&self, key: &Key) -> Option<Key> {
            self.inner.floor_key(key)
        }
        fn key_at(&self, index: u64) -> Option<Key> {
            self.inner.key_at(index)
        }
        fn index_of(&self, key: &Key) -> Option<u64> {
            self.inner.index_of(key)
        }
        fn size_as_long(&self) -> u64 {
            self.inner.size_as_long()
        }
        fn is_closed(&self) -> bool {
            self.inner.is_closed()
        }
        fn clear(&self) {
            self.inner.clear()
        }
        fn remove_map(&self) {
            self.inner.remove_map()
        }
        fn set_volatile(&self, is_volatile: bool) {
            self.inner.set_volatile(is_volatile)
        }
        fn is_volatile(&self) -> bool {
            self.inner.is_volatile()
        }
    }

    #[test]
    fn test_iterator_reseeks_after_chunk_loss() {
        let engine = TransactionEngine::new();
        engine.register_map(
            MAP,
            Arc::new(ChunkyMap {
                inner: MemoryMap::new(MAP),
                tripped: Arc::new(AtomicBool::new(false)),
            }),
        );

        let setup = engine.begin();
        let sm = setup.open_map(MAP).unwrap();
        for k in ["a", "b", "c", "d"] {
            sm.put(&Key::from(k), value(k)).unwrap();
        }
        setup.commit().unwrap();

        let txn = engine.begin();
        let m = txn.open_map(MAP).unwrap();
        let keys: Vec<Key> = m.key_iterator(None, false).map(|r| r.unwrap()).collect();
        assert_eq!(
            keys,
            vec![
                Key::from("a"),
                Key::from("b"),
                Key::from("c"),
                Key::from("d")
            ]
        );
    }

    #[test]
    fn test_clear_is_non_transactional() {
        let engine = TransactionEngine::new();
        let txn = engine.begin();
        let m = txn.open_map(MAP).unwrap();
        m.put_committed(&Key::from("a"), value("1")).unwrap();
        m.clear();
        assert_eq!(m.size_as_long_max(), 0);
        assert!(!m.is_closed());
    }
}
