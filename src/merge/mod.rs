// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! MERGE (upsert) statement contract over the transactional map layer.
//!
//! `MERGE INTO table(columns) [KEY(keys)] VALUES (...), (...)` composes
//! two primitives per input row: an update matching the declared key
//! columns, and an insert when nothing matched. An insert that collides
//! on an index prefix-matching the keys is reclassified as a concurrent
//! update, since it means another transaction merged the same key between
//! the two steps.
//!
//! The statement is transactional (all row effects ride on the caller's
//! [`Transaction`](crate::txn::Transaction)) and cacheable: a prepared
//! statement can be re-executed, and its [`plan_sql`](MergeStatement::plan_sql)
//! text parses back into an equivalent statement.

mod error;
mod statement;
mod table;

pub use error::MergeError;
pub use statement::{MergeStatement, ParsedMerge};
pub use table::{Column, Row, RowSink, RowTrigger, SqlValue, Table};
