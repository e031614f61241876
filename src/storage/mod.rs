// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Ordered map storage layer.
//!
//! This module defines the [`StorageMap`] contract the transaction layer
//! sits on: an ordered map with atomic single-key operations
//! (`get`/`put_if_absent`/`replace`), ordered navigation, and weakly
//! consistent cursors. `replace` is a compare-and-swap on value equality
//! and is the primitive that serializes concurrent writers on a key.
//!
//! [`MemoryMap`] is the in-memory implementation used by the engine, the
//! tests and the benchmarks. The on-disk page format of a persistent
//! implementation is out of scope here; cursors of such an implementation
//! may fail transiently with [`StorageError::ChunkNotFound`] when a page
//! is compacted away mid-iteration, and callers are expected to reseek.

mod error;
mod kv;
mod map;
mod memory;

pub use error::StorageError;
pub use kv::{Key, Value, MAX_KEY_SIZE, MAX_VALUE_SIZE};
pub use map::{KeyType, StorageCursor, StorageMap};
pub use memory::MemoryMap;
