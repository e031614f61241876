// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Versioned value model and operation-id packing.
//!
//! Every physical entry in a transactional map carries the identity of the
//! write that produced it: a 64-bit operation id packing the transaction
//! id (high 32 bits) and the per-transaction log id (low 32 bits).
//! Operation id `0` is reserved to mean "committed"; transaction id 0 is
//! never allocated, so no real write packs to `0`.

use crate::storage::Value;

/// Operation id reserved for committed entries.
pub const COMMITTED: u64 = 0;

/// Packs a transaction id and log id into an operation id.
#[inline]
pub fn pack(transaction_id: u32, log_id: u32) -> u64 {
    ((transaction_id as u64) << 32) | (log_id as u64)
}

/// Extracts the transaction id from an operation id.
#[inline]
pub fn tx_of(operation_id: u64) -> u32 {
    (operation_id >> 32) as u32
}

/// Extracts the log id from an operation id.
#[inline]
pub fn log_of(operation_id: u64) -> u32 {
    operation_id as u32
}

/// Returns true if the transaction id denotes an in-doubt (remotely
/// coordinated) transaction. Odd ids require validation before their
/// writes may be treated as committed; even ids are locally authoritative.
#[inline]
pub fn is_in_doubt(transaction_id: u32) -> bool {
    transaction_id % 2 == 1
}

/// A versioned entry stored in a transactional map.
///
/// `operation_id == 0` means the entry is committed. `value == None`
/// encodes a tombstone (logical delete). Equality is structural over both
/// fields; it is what the storage map's compare-and-swap tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    pub operation_id: u64,
    pub value: Option<Value>,
}

impl VersionedValue {
    /// Creates a committed entry.
    #[inline]
    pub fn committed(value: Option<Value>) -> Self {
        Self {
            operation_id: COMMITTED,
            value,
        }
    }

    /// Creates an uncommitted entry owned by the write with the given
    /// operation id.
    #[inline]
    pub fn uncommitted(operation_id: u64, value: Option<Value>) -> Self {
        Self {
            operation_id,
            value,
        }
    }

    /// Returns true if this entry is committed.
    #[inline]
    pub fn is_committed(&self) -> bool {
        self.operation_id == COMMITTED
    }

    /// Returns true if this entry is a tombstone.
    #[inline]
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Returns a committed clone of this entry, keeping the value.
    #[inline]
    pub fn into_committed(self) -> Self {
        Self {
            operation_id: COMMITTED,
            value: self.value,
        }
    }
}
