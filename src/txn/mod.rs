// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Transactional map layer with MVCC snapshot reads and optimistic
//! write locking.
//!
//! This module overlays the ordered [`StorageMap`](crate::storage::StorageMap)
//! with multi-version concurrency control:
//!
//! - Every stored entry is a [`VersionedValue`] carrying the operation id
//!   of the write that produced it; operation id 0 means committed.
//! - Reads reconstruct the value visible at a log point by walking the
//!   engine's [`UndoLog`] backwards from the stored value.
//! - Writers never block: they reserve an undo slot, then compare-and-swap
//!   the new value into the raw map. A lost swap pops the slot and reports
//!   a concurrent update; retry and backoff belong to the caller.
//! - Transactions with odd ids are in-doubt (remotely coordinated). When
//!   an observer meets such a write, its [`TransactionValidator`] decides
//!   whether the writer is known committed; if so the writer is retired on
//!   the spot and the operation restarts.
//!
//! # Example
//!
//! ```
//! use rubidiumdb::storage::{Key, Value};
//! use rubidiumdb::txn::TransactionEngine;
//!
//! # fn example() -> Result<(), rubidiumdb::txn::TxnError> {
//! let engine = TransactionEngine::new();
//!
//! let txn = engine.begin();
//! let map = txn.open_map(1)?;
//! map.put(&Key::from("counter"), Value::from("1"))?;
//! txn.commit()?;
//!
//! let reader = engine.begin();
//! let map = reader.open_map(1)?;
//! assert_eq!(map.get(&Key::from("counter"))?, Some(Value::from("1")));
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

mod engine;
mod error;
mod map;
mod transaction;
mod undo;
mod versioned;

pub use engine::{SharedStorageMap, TransactionEngine};
pub use error::TxnError;
pub use map::{EntryIterator, KeyIterator, TransactionMap};
pub use transaction::{Transaction, TxnStatus};
pub use undo::{UndoEntry, UndoLog};
pub use versioned::{is_in_doubt, log_of, pack, tx_of, VersionedValue, COMMITTED};

/// Decides whether a foreign in-doubt transaction is known committed.
///
/// Supplied at transaction creation; consulted when the transaction
/// observes a write with an odd transaction id. Implementations are
/// designed for a coordinator round-trip and may perform external I/O;
/// this is the only place a read or write can stall. Deadlines and
/// cancellation are the implementation's own concern, the engine never
/// wraps the call with a timeout.
pub trait TransactionValidator: Send + Sync {
    /// Returns true if the foreign transaction is known committed.
    fn validate(&self, foreign_id: u32, observer_id: u32) -> bool;
}
