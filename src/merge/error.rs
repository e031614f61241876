// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Merge statement error types.

use crate::txn::TxnError;

/// Errors that can occur preparing or executing a MERGE statement.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    /// More than one existing row matched the key columns, or an insert
    /// collided on an index that does not match the declared keys.
    #[error("duplicate key in table {table:?}")]
    DuplicateKey { table: String },

    /// An insert collided on an index whose columns prefix-match the
    /// declared key columns: another transaction merged or inserted the
    /// same key concurrently.
    #[error("concurrent update in table {table:?}")]
    ConcurrentUpdate { table: String },

    /// A key column of an input row is NULL.
    #[error("column {column:?} contains null values")]
    NullKeyColumn { column: String },

    /// No key columns were declared and the table has no primary key.
    #[error("constraint {constraint:?} not found")]
    ConstraintNotFound { constraint: String },

    #[error("column count does not match")]
    ColumnCountMismatch,

    #[error("unknown column {0:?}")]
    UnknownColumn(String),

    /// The statement was executed before [`prepare`](crate::merge::MergeStatement::prepare).
    #[error("statement is not prepared")]
    NotPrepared,

    #[error("parse error: {0}")]
    Parse(String),

    #[error(transparent)]
    Txn(#[from] TxnError),
}
