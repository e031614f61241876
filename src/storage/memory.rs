// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! In-memory ordered map implementation.
//!
//! [`MemoryMap`] backs the transaction layer in tests, benchmarks and
//! embedded use. Atomicity of `put_if_absent` and `replace` comes from a
//! single `RwLock` around the tree; cursors are weakly consistent and
//! resume after the last observed key on every step, so they never hold
//! the lock between calls.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::error::StorageError;
use super::kv::{Key, MAX_KEY_SIZE};
use super::map::{StorageCursor, StorageMap};

struct Inner<V> {
    map_id: u32,
    entries: RwLock<BTreeMap<Key, V>>,
    closed: AtomicBool,
    is_volatile: AtomicBool,
}

/// An in-memory ordered [`StorageMap`].
pub struct MemoryMap<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for MemoryMap<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Clone + PartialEq + Send + Sync + 'static> MemoryMap<V> {
    /// Creates a new empty map with the given id.
    pub fn new(map_id: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                map_id,
                entries: RwLock::new(BTreeMap::new()),
                closed: AtomicBool::new(false),
                is_volatile: AtomicBool::new(false),
            }),
        }
    }

    /// Returns the map id.
    #[inline]
    pub fn map_id(&self) -> u32 {
        self.inner.map_id
    }

    fn check_open(&self) -> Result<(), StorageError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(StorageError::MapClosed {
                map_id: self.inner.map_id,
            });
        }
        Ok(())
    }

    fn check_key(&self, key: &Key) -> Result<(), StorageError> {
        if key.len() > MAX_KEY_SIZE {
            return Err(StorageError::KeyTooLarge {
                size: key.len(),
                max: MAX_KEY_SIZE,
            });
        }
        Ok(())
    }
}

impl<V: Clone + PartialEq + Send + Sync + 'static> StorageMap<V> for MemoryMap<V> {
    fn get(&self, key: &Key) -> Option<V> {
        self.inner.entries.read().get(key).cloned()
    }

    fn put(&self, key: Key, value: V) -> Result<Option<V>, StorageError> {
        self.check_open()?;
        self.check_key(&key)?;
        Ok(self.inner.entries.write().insert(key, value))
    }

    fn put_if_absent(&self, key: Key, value: V) -> Result<Option<V>, StorageError> {
        self.check_open()?;
        self.check_key(&key)?;
        let mut entries = self.inner.entries.write();
        match entries.get(&key) {
            Some(existing) => Ok(Some(existing.clone())),
            None => {
                entries.insert(key, value);
                Ok(None)
            }
        }
    }

    fn replace(&self, key: &Key, old: &V, new: V) -> Result<bool, StorageError> {
        self.check_open()?;
        let mut entries = self.inner.entries.write();
        match entries.get(key) {
            Some(existing) if existing == old => {
                entries.insert(key.clone(), new);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn remove_key(&self, key: &Key) -> Option<V> {
        self.inner.entries.write().remove(key)
    }

    fn cursor(&self, from: Option<&Key>) -> Box<dyn StorageCursor<V>> {
        Box::new(MemoryCursor {
            inner: Arc::clone(&self.inner),
            next_bound: from
                .map(|k| Bound::Included(k.clone()))
                .unwrap_or(Bound::Unbounded),
            done: false,
        })
    }

    fn first_key(&self) -> Option<Key> {
        self.inner.entries.read().keys().next().cloned()
    }

    fn last_key(&self) -> Option<Key> {
        self.inner.entries.read().keys().next_back().cloned()
    }

    fn higher_key(&self, key: &Key) -> Option<Key> {
        self.inner
            .entries
            .read()
            .range((Bound::Excluded(key.clone()), Bound::Unbounded))
            .next()
            .map(|(k, _)| k.clone())
    }

    fn lower_key(&self, key: &Key) -> Option<Key> {
        self.inner
            .entries
            .read()
            .range((Bound::Unbounded, Bound::Excluded(key.clone())))
            .next_back()
            .map(|(k, _)| k.clone())
    }

    fn ceiling_key(&self, key: &Key) -> Option<Key> {
        self.inner
            .entries
            .read()
            .range((Bound::Included(key.clone()), Bound::Unbounded))
            .next()
            .map(|(k, _)| k.clone())
    }

    fn floor_key(&self, key: &Key) -> Option<Key> {
        self.inner
            .entries
            .read()
            .range((Bound::Unbounded, Bound::Included(key.clone())))
            .next_back()
            .map(|(k, _)| k.clone())
    }

    fn key_at(&self, index: u64) -> Option<Key> {
        self.inner
            .entries
            .read()
            .keys()
            .nth(index as usize)
            .cloned()
    }

    fn index_of(&self, key: &Key) -> Option<u64> {
        self.inner
            .entries
            .read()
            .keys()
            .position(|k| k == key)
            .map(|i| i as u64)
    }

    fn size_as_long(&self) -> u64 {
        self.inner.entries.read().len() as u64
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn clear(&self) {
        self.inner.entries.write().clear();
    }

    fn remove_map(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.entries.write().clear();
    }

    fn set_volatile(&self, is_volatile: bool) {
        self.inner.is_volatile.store(is_volatile, Ordering::Release);
    }

    fn is_volatile(&self) -> bool {
        self.inner.is_volatile.load(Ordering::Acquire)
    }
}

struct MemoryCursor<V> {
    inner: Arc<Inner<V>>,
    next_bound: Bound<Key>,
    done: bool,
}

impl<V: Clone + PartialEq + Send + Sync + 'static> StorageCursor<V> for MemoryCursor<V> {
    fn next(&mut self) -> Result<Option<(Key, V)>, StorageError> {
        if self.done || self.inner.closed.load(Ordering::Acquire) {
            return Ok(None);
        }
        let entries = self.inner.entries.read();
        let bound = std::mem::replace(&mut self.next_bound, Bound::Unbounded);
        let next = entries
            .range((bound, Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone()));
        match &next {
            Some((k, _)) => self.next_bound = Bound::Excluded(k.clone()),
            None => self.done = true,
        }
        Ok(next)
    }
}
