// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! RubidiumDB: an embedded transactional key/value layer with MVCC
//! snapshot reads, optimistic write locking, savepoints, and undo-log
//! rollback
//!
//! This crate provides the transactional map layer of a relational
//! storage engine: transactions over ordered maps, an undo log shared by
//! all transactions of one engine, cooperative validation of in-doubt
//! remote transactions, and the MERGE (upsert) statement contract built
//! on top.

pub mod merge;
pub mod storage;
pub mod txn;

pub use storage::{
    Key, KeyType, MemoryMap, StorageCursor, StorageError, StorageMap, Value, MAX_KEY_SIZE,
    MAX_VALUE_SIZE,
};
pub use txn::{
    SharedStorageMap, Transaction, TransactionEngine, TransactionMap, TransactionValidator,
    TxnError, TxnStatus, UndoEntry, UndoLog, VersionedValue,
};
pub use merge::{
    Column, MergeError, MergeStatement, ParsedMerge, Row, RowSink, RowTrigger, SqlValue, Table,
};
