// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Transaction error types.

use crate::storage::{Key, StorageError};

use super::transaction::TxnStatus;

/// Errors that can occur in transaction operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TxnError {
    /// Another transaction holds an uncommitted write on the key. This is
    /// recoverable: the caller may retry or back off; this layer never
    /// waits internally.
    #[error("entry is locked by another transaction at key {key:?}")]
    Locked { key: Key },

    /// An uncommitted entry's undo record disappeared while the entry
    /// still bears its operation id. Fatal to the transaction, not to the
    /// engine.
    #[error("transaction log might be corrupt for key {key:?}")]
    Corrupt { key: Key },

    /// A write was attempted on a transaction that is no longer open.
    #[error("transaction {id} is closed (status {status:?})")]
    Closed { id: u32, status: TxnStatus },

    /// A status transition that the lifecycle does not allow.
    #[error("transaction {id}: illegal transition from {from:?}")]
    IllegalState { id: u32, from: TxnStatus },

    /// No savepoint recorded under the given name.
    #[error("unknown savepoint {0:?}")]
    UnknownSavepoint(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}
