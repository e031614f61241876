// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Minimal table model over the transactional map layer.
//!
//! A table's rows live in one transactional map: the key is the encoded
//! primary-key columns, the value the encoded full row. The encoding is
//! order-preserving for integers so the map iterates rows in key order.

use std::fmt;
use std::sync::Arc;

use crate::storage::{Key, Value};
use crate::txn::{Transaction, TransactionMap, TxnError};

use super::error::MergeError;

/// A literal SQL value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Text(String),
}

impl SqlValue {
    /// Returns true if this is NULL.
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

impl fmt::Display for SqlValue {
    /// Renders the value as a SQL literal; text quotes are doubled.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Int(i) => write!(f, "{i}"),
            SqlValue::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
        }
    }
}

const TAG_NULL: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_TEXT: u8 = 2;

fn encode_into(buf: &mut Vec<u8>, value: &SqlValue) {
    match value {
        SqlValue::Null => buf.push(TAG_NULL),
        SqlValue::Int(i) => {
            buf.push(TAG_INT);
            // flip the sign bit so negative values order below positive
            buf.extend_from_slice(&((*i as u64) ^ (1 << 63)).to_be_bytes());
        }
        SqlValue::Text(s) => {
            buf.push(TAG_TEXT);
            buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
            buf.extend_from_slice(s.as_bytes());
        }
    }
}

fn decode_from(buf: &[u8], pos: &mut usize) -> Result<SqlValue, MergeError> {
    let tag = *buf
        .get(*pos)
        .ok_or_else(|| MergeError::Parse("truncated row encoding".into()))?;
    *pos += 1;
    match tag {
        TAG_NULL => Ok(SqlValue::Null),
        TAG_INT => {
            let bytes: [u8; 8] = buf
                .get(*pos..*pos + 8)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| MergeError::Parse("truncated int encoding".into()))?;
            *pos += 8;
            Ok(SqlValue::Int((u64::from_be_bytes(bytes) ^ (1 << 63)) as i64))
        }
        TAG_TEXT => {
            let len_bytes: [u8; 4] = buf
                .get(*pos..*pos + 4)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| MergeError::Parse("truncated text length".into()))?;
            *pos += 4;
            let len = u32::from_be_bytes(len_bytes) as usize;
            let bytes = buf
                .get(*pos..*pos + len)
                .ok_or_else(|| MergeError::Parse("truncated text encoding".into()))?;
            *pos += len;
            let s = std::str::from_utf8(bytes)
                .map_err(|e| MergeError::Parse(format!("invalid utf-8 in row: {e}")))?;
            Ok(SqlValue::Text(s.to_string()))
        }
        other => Err(MergeError::Parse(format!("unknown value tag {other}"))),
    }
}

/// A table column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    name: String,
}

impl Column {
    /// Creates a column with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Returns the column name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// One table row: a value per column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    values: Vec<SqlValue>,
}

impl Row {
    /// Creates a row from column values.
    pub fn new(values: Vec<SqlValue>) -> Self {
        Self { values }
    }

    /// Returns the value of the column at the given index.
    #[inline]
    pub fn value(&self, index: usize) -> &SqlValue {
        &self.values[index]
    }

    /// Sets the value of the column at the given index.
    pub fn set_value(&mut self, index: usize, value: SqlValue) {
        self.values[index] = value;
    }

    /// Returns all column values.
    #[inline]
    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    fn encode(&self) -> Value {
        let mut buf = Vec::new();
        for v in &self.values {
            encode_into(&mut buf, v);
        }
        Value::new(buf)
    }

    fn decode(value: &Value, column_count: usize) -> Result<Self, MergeError> {
        let buf = value.as_bytes();
        let mut pos = 0;
        let mut values = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            values.push(decode_from(buf, &mut pos)?);
        }
        Ok(Self { values })
    }
}

/// Fired around row inserts; a suppressing before trigger skips the
/// insert itself.
pub trait RowTrigger: Send + Sync {
    /// Returns true to suppress the insert.
    fn before_row(&self, new_row: &Row) -> bool;

    fn after_row(&self, new_row: &Row);
}

/// A table whose rows live in one transactional map.
pub struct Table {
    name: String,
    columns: Vec<Column>,
    /// Indices of the primary-key columns, in key order. Empty means the
    /// table has no primary key.
    primary_key: Vec<usize>,
    map_id: u32,
    triggers: Vec<Arc<dyn RowTrigger>>,
}

impl Table {
    /// Creates a table storing its rows under the given map id.
    pub fn new(
        name: impl Into<String>,
        columns: Vec<Column>,
        primary_key: Vec<usize>,
        map_id: u32,
    ) -> Self {
        Self {
            name: name.into(),
            columns,
            primary_key,
            map_id,
            triggers: Vec::new(),
        }
    }

    /// Returns the table name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the columns.
    #[inline]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Returns the primary-key column indices, if a primary key exists.
    pub fn primary_key(&self) -> Option<&[usize]> {
        if self.primary_key.is_empty() {
            None
        } else {
            Some(&self.primary_key)
        }
    }

    /// Returns the id of the map holding the rows.
    #[inline]
    pub fn map_id(&self) -> u32 {
        self.map_id
    }

    /// Registers a row trigger.
    pub fn add_trigger(&mut self, trigger: Arc<dyn RowTrigger>) {
        self.triggers.push(trigger);
    }

    /// Resolves a column name to its index.
    pub fn column_index(&self, name: &str) -> Result<usize, MergeError> {
        self.columns
            .iter()
            .position(|c| c.name() == name)
            .ok_or_else(|| MergeError::UnknownColumn(name.to_string()))
    }

    /// Returns a row with every column NULL.
    pub fn template_row(&self) -> Row {
        Row::new(vec![SqlValue::Null; self.columns.len()])
    }

    /// Opens the transactional view over this table's rows.
    pub fn open(&self, txn: &Arc<Transaction>) -> Result<TransactionMap, TxnError> {
        txn.open_map(self.map_id)
    }

    /// Encodes the primary-key columns of a row into a map key.
    pub fn key_of(&self, row: &Row) -> Key {
        let mut buf = Vec::new();
        for &i in &self.primary_key {
            encode_into(&mut buf, row.value(i));
        }
        Key::new(buf)
    }

    /// Inserts a row, failing when a visible row already holds its
    /// primary key.
    pub fn add_row(&self, map: &TransactionMap, row: &Row) -> Result<(), MergeError> {
        let key = self.key_of(row);
        if map.get(&key)?.is_some() {
            return Err(MergeError::DuplicateKey {
                table: self.name.clone(),
            });
        }
        map.put(&key, row.encode())?;
        Ok(())
    }

    /// Replaces the row stored under `old_key` with the updated row,
    /// moving it when the primary key changed.
    pub fn update_row(
        &self,
        map: &TransactionMap,
        old_key: &Key,
        row: &Row,
    ) -> Result<(), MergeError> {
        let new_key = self.key_of(row);
        if new_key != *old_key {
            map.remove(old_key)?;
        }
        map.put(&new_key, row.encode())?;
        Ok(())
    }

    /// Returns the visible row stored under a key.
    pub fn get_row(&self, map: &TransactionMap, key: &Key) -> Result<Option<Row>, MergeError> {
        match map.get(key)? {
            Some(value) => Ok(Some(Row::decode(&value, self.columns.len())?)),
            None => Ok(None),
        }
    }

    /// Returns the visible rows with their keys, in key order.
    pub fn scan(&self, map: &TransactionMap) -> Result<Vec<(Key, Row)>, MergeError> {
        let mut rows = Vec::new();
        for entry in map.entry_iterator(None) {
            let (key, value) = entry?;
            rows.push((key, Row::decode(&value, self.columns.len())?));
        }
        Ok(rows)
    }

    /// Fires before-row triggers; returns true if any suppresses the
    /// insert.
    pub fn fire_before_row(&self, row: &Row) -> bool {
        self.triggers.iter().any(|t| t.before_row(row))
    }

    /// Fires after-row triggers.
    pub fn fire_after_row(&self, row: &Row) {
        for t in &self.triggers {
            t.after_row(row);
        }
    }
}

/// The shared surface of row-producing statements (MERGE, INSERT).
///
/// Statements implement this instead of inheriting shared state; the
/// execution helpers are free functions over the trait.
pub trait RowSink {
    /// Materializes the statement's input rows.
    fn create_rows(&mut self) -> Result<(), MergeError>;

    /// Replaces the materialized rows.
    fn set_rows(&mut self, rows: Vec<Row>);

    /// Returns the materialized rows.
    fn rows(&self) -> &[Row];

    /// Returns the target table.
    fn table(&self) -> &Table;
}
