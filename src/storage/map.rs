// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Ordered map trait and cursor types.
//!
//! [`StorageMap`] is the contract the transaction layer requires from the
//! ordered map underneath it. The important primitives are the atomic
//! `put_if_absent` and `replace`: `replace` compares the stored value for
//! equality and swaps in the new one as a single step, which is what
//! serializes concurrent writers on a single key.

use super::error::StorageError;
use super::kv::Key;

/// Describes how the keys of a map are typed and ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyType {
    /// Raw bytes, ordered lexicographically.
    #[default]
    Bytes,
}

impl KeyType {
    /// Compares two keys under this type's ordering.
    #[inline]
    pub fn compare(&self, a: &Key, b: &Key) -> std::cmp::Ordering {
        match self {
            KeyType::Bytes => a.cmp(b),
        }
    }
}

/// An ordered forward cursor over a [`StorageMap`].
///
/// Cursors are weakly consistent: they are not required to observe writes
/// made after creation. A cursor may fail with
/// [`StorageError::ChunkNotFound`] when the storage compacted away a page
/// mid-iteration; callers must tolerate that error and reseek from the
/// last key they observed.
pub trait StorageCursor<V>: Send {
    /// Advances the cursor and returns the next entry, or `None` when the
    /// map is exhausted.
    fn next(&mut self) -> Result<Option<(Key, V)>, StorageError>;
}

/// An ordered map with atomic single-key operations.
///
/// Implementations provide their own internal concurrency: `get`,
/// `put_if_absent` and `replace` are atomic with respect to each other.
/// The map outlives all transactional views of it; [`StorageMap::remove_map`]
/// destroys it.
pub trait StorageMap<V: Clone + PartialEq + Send + Sync + 'static>: Send + Sync {
    /// Returns the value for the key, if present.
    fn get(&self, key: &Key) -> Option<V>;

    /// Inserts or replaces the value, returning the previous one.
    fn put(&self, key: Key, value: V) -> Result<Option<V>, StorageError>;

    /// Inserts the value only if the key is absent.
    ///
    /// Returns the existing value on loss.
    fn put_if_absent(&self, key: Key, value: V) -> Result<Option<V>, StorageError>;

    /// Compare-and-swap: replaces the stored value with `new` only if it is
    /// currently equal to `old` under [`StorageMap::values_equal`].
    fn replace(&self, key: &Key, old: &V, new: V) -> Result<bool, StorageError>;

    /// Removes the entry for the key, returning the previous value.
    fn remove_key(&self, key: &Key) -> Option<V>;

    /// Opens a cursor positioned at the first key `>= from`, or at the
    /// start of the map when `from` is `None`.
    fn cursor(&self, from: Option<&Key>) -> Box<dyn StorageCursor<V>>;

    /// Returns the first key, or `None` if the map is empty.
    fn first_key(&self) -> Option<Key>;

    /// Returns the last key, or `None` if the map is empty.
    fn last_key(&self) -> Option<Key>;

    /// Returns the smallest key strictly greater than the given key.
    fn higher_key(&self, key: &Key) -> Option<Key>;

    /// Returns the largest key strictly smaller than the given key.
    fn lower_key(&self, key: &Key) -> Option<Key>;

    /// Returns the smallest key greater than or equal to the given key.
    fn ceiling_key(&self, key: &Key) -> Option<Key>;

    /// Returns the largest key smaller than or equal to the given key.
    fn floor_key(&self, key: &Key) -> Option<Key>;

    /// Returns the key at the given index in key order.
    fn key_at(&self, index: u64) -> Option<Key>;

    /// Returns the index of the key in key order, or `None` if absent.
    fn index_of(&self, key: &Key) -> Option<u64>;

    /// Returns the number of entries, including invisible ones.
    fn size_as_long(&self) -> u64;

    /// Returns true if the map has been destroyed.
    fn is_closed(&self) -> bool;

    /// Removes all entries. Non-transactional.
    fn clear(&self);

    /// Destroys the map. All subsequent operations observe a closed map.
    fn remove_map(&self);

    /// Marks the map volatile (changes need not be durable).
    fn set_volatile(&self, is_volatile: bool);

    /// Returns whether the map is volatile.
    fn is_volatile(&self) -> bool;

    /// Compares two optional values under the map's value equality.
    ///
    /// This is the equality that [`StorageMap::replace`] CASes on.
    fn values_equal(&self, a: Option<&V>, b: Option<&V>) -> bool {
        a == b
    }

    /// Returns the key type of this map.
    fn key_type(&self) -> KeyType {
        KeyType::Bytes
    }
}
