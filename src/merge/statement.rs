// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! The MERGE (upsert) statement over the transactional map layer.
//!
//! For each input row the statement runs an update step matching the
//! declared key columns; when no row matched, it inserts. A duplicate-key
//! collision during that insert is reclassified as a concurrent update
//! when the violating index prefix-matches the declared keys, because it
//! means another transaction merged the same key in between the two
//! steps.

use std::sync::Arc;

use crate::txn::Transaction;

use super::error::MergeError;
use super::table::{Row, RowSink, SqlValue, Table};

/// A prepared MERGE statement:
/// `MERGE INTO table(columns) [KEY(keys)] VALUES (...), (...)`.
pub struct MergeStatement {
    table: Table,
    column_names: Option<Vec<String>>,
    key_names: Option<Vec<String>>,
    values: Vec<Vec<Option<SqlValue>>>,
    columns: Vec<usize>,
    keys: Vec<usize>,
    rows: Vec<Row>,
    prepared: bool,
}

impl MergeStatement {
    /// Creates an unprepared statement targeting the table.
    pub fn new(table: Table) -> Self {
        Self {
            table,
            column_names: None,
            key_names: None,
            values: Vec::new(),
            columns: Vec::new(),
            keys: Vec::new(),
            rows: Vec::new(),
            prepared: false,
        }
    }

    /// Declares the statement's column list. Defaults to all table
    /// columns.
    pub fn set_columns<S: Into<String>>(&mut self, names: Vec<S>) {
        self.column_names = Some(names.into_iter().map(Into::into).collect());
    }

    /// Declares the key columns. Defaults to the primary key.
    pub fn set_keys<S: Into<String>>(&mut self, names: Vec<S>) {
        self.key_names = Some(names.into_iter().map(Into::into).collect());
    }

    /// Adds one VALUES tuple; `None` stands for DEFAULT.
    pub fn add_values(&mut self, row: Vec<Option<SqlValue>>) {
        self.values.push(row);
    }

    /// Resolves columns and keys and validates the value tuples.
    pub fn prepare(&mut self) -> Result<(), MergeError> {
        self.columns = match &self.column_names {
            Some(names) => names
                .iter()
                .map(|n| self.table.column_index(n))
                .collect::<Result<_, _>>()?,
            None => (0..self.table.columns().len()).collect(),
        };
        for tuple in &self.values {
            if tuple.len() != self.columns.len() {
                return Err(MergeError::ColumnCountMismatch);
            }
        }
        self.keys = match &self.key_names {
            Some(names) => names
                .iter()
                .map(|n| self.table.column_index(n))
                .collect::<Result<_, _>>()?,
            None => self
                .table
                .primary_key()
                .ok_or_else(|| MergeError::ConstraintNotFound {
                    constraint: "PRIMARY KEY".to_string(),
                })?
                .to_vec(),
        };
        self.prepared = true;
        Ok(())
    }

    /// Merges all input rows within the transaction and returns the
    /// number of rows processed.
    pub fn execute(&mut self, txn: &Arc<Transaction>) -> Result<u64, MergeError> {
        if !self.prepared {
            return Err(MergeError::NotPrepared);
        }
        self.create_rows()?;
        let map = self.table.open(txn)?;
        let mut count = 0u64;
        for row in &self.rows {
            merge_row(&self.table, &map, &self.columns, &self.keys, row)?;
            count += 1;
        }
        Ok(count)
    }

    /// Emits the statement as SQL text. Parsing the result yields an
    /// equivalent statement.
    pub fn plan_sql(&self) -> String {
        let columns: Vec<String> = if self.prepared {
            self.columns
                .iter()
                .map(|&i| self.table.columns()[i].name().to_string())
                .collect()
        } else {
            match &self.column_names {
                Some(names) => names.clone(),
                None => self
                    .table
                    .columns()
                    .iter()
                    .map(|c| c.name().to_string())
                    .collect(),
            }
        };
        let keys: Option<Vec<String>> = if self.prepared {
            Some(
                self.keys
                    .iter()
                    .map(|&i| self.table.columns()[i].name().to_string())
                    .collect(),
            )
        } else {
            self.key_names.clone()
        };
        format_merge(self.table.name(), &columns, keys.as_deref(), &self.values)
    }
}

impl RowSink for MergeStatement {
    fn create_rows(&mut self) -> Result<(), MergeError> {
        if !self.prepared {
            return Err(MergeError::NotPrepared);
        }
        let mut rows = Vec::with_capacity(self.values.len());
        for tuple in &self.values {
            let mut row = self.table.template_row();
            for (i, v) in tuple.iter().enumerate() {
                // None is DEFAULT; the template already holds NULL
                if let Some(v) = v {
                    row.set_value(self.columns[i], v.clone());
                }
            }
            rows.push(row);
        }
        self.rows = rows;
        Ok(())
    }

    fn set_rows(&mut self, rows: Vec<Row>) {
        self.rows = rows;
    }

    fn rows(&self) -> &[Row] {
        &self.rows
    }

    fn table(&self) -> &Table {
        &self.table
    }
}

/// Merges one row: update the rows matching the key columns, insert when
/// none matched.
fn merge_row(
    table: &Table,
    map: &crate::txn::TransactionMap,
    columns: &[usize],
    keys: &[usize],
    row: &Row,
) -> Result<(), MergeError> {
    for &k in keys {
        if row.value(k).is_null() {
            return Err(MergeError::NullKeyColumn {
                column: table.columns()[k].name().to_string(),
            });
        }
    }

    // update step: set the statement columns on every row matching the
    // declared keys; a point lookup when the keys are the primary key
    let matches: Vec<_> = if table.primary_key() == Some(keys) {
        let key = table.key_of(row);
        match table.get_row(map, &key)? {
            Some(existing) => vec![(key, existing)],
            None => Vec::new(),
        }
    } else {
        table
            .scan(map)?
            .into_iter()
            .filter(|(_, existing)| keys.iter().all(|&k| existing.value(k) == row.value(k)))
            .collect()
    };
    if matches.len() > 1 {
        return Err(MergeError::DuplicateKey {
            table: table.name().to_string(),
        });
    }
    if let Some((old_key, existing)) = matches.into_iter().next() {
        let mut updated = existing;
        for &c in columns {
            updated.set_value(c, row.value(c).clone());
        }
        table.update_row(map, &old_key, &updated)?;
        return Ok(());
    }

    // insert step
    if table.fire_before_row(row) {
        return Ok(());
    }
    match table.add_row(map, row) {
        Ok(()) => {
            table.fire_after_row(row);
            Ok(())
        }
        Err(MergeError::DuplicateKey { .. }) => {
            // possibly a concurrent merge or insert: reclassify when the
            // violating index columns prefix-match the declared keys
            let index_columns = table.primary_key().unwrap_or(&[]);
            let index_matches_keys = !index_columns.is_empty()
                && index_columns.len() <= keys.len()
                && index_columns.iter().zip(keys).all(|(a, b)| a == b);
            if index_matches_keys {
                Err(MergeError::ConcurrentUpdate {
                    table: table.name().to_string(),
                })
            } else {
                Err(MergeError::DuplicateKey {
                    table: table.name().to_string(),
                })
            }
        }
        Err(e) => Err(e),
    }
}

/// Formats a MERGE statement; shared by [`MergeStatement::plan_sql`] and
/// [`ParsedMerge::to_sql`] so the round trip is textual.
fn format_merge(
    table: &str,
    columns: &[String],
    keys: Option<&[String]>,
    values: &[Vec<Option<SqlValue>>],
) -> String {
    let mut sql = String::from("MERGE INTO ");
    sql.push_str(table);
    sql.push('(');
    sql.push_str(&columns.join(", "));
    sql.push(')');
    if let Some(keys) = keys {
        sql.push_str(" KEY(");
        sql.push_str(&keys.join(", "));
        sql.push(')');
    }
    sql.push('\n');
    sql.push_str("VALUES ");
    let tuples: Vec<String> = values
        .iter()
        .map(|tuple| {
            let literals: Vec<String> = tuple
                .iter()
                .map(|v| match v {
                    None => "DEFAULT".to_string(),
                    Some(v) => v.to_string(),
                })
                .collect();
            format!("({})", literals.join(", "))
        })
        .collect();
    sql.push_str(&tuples.join(", "));
    sql
}

/// The structural form of a parsed MERGE statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMerge {
    pub table: String,
    pub columns: Vec<String>,
    pub keys: Option<Vec<String>>,
    pub values: Vec<Vec<Option<SqlValue>>>,
}

impl ParsedMerge {
    /// Parses `MERGE INTO table(columns) [KEY(keys)] VALUES (...), (...)`.
    pub fn parse(sql: &str) -> Result<Self, MergeError> {
        let mut tokens = Tokenizer::new(sql).tokenize()?.into_iter().peekable();

        expect_keyword(&mut tokens, "MERGE")?;
        expect_keyword(&mut tokens, "INTO")?;
        let table = expect_ident(&mut tokens)?;
        let columns = parse_ident_list(&mut tokens)?;
        let keys = if peek_keyword(&mut tokens, "KEY") {
            tokens.next();
            Some(parse_ident_list(&mut tokens)?)
        } else {
            None
        };
        expect_keyword(&mut tokens, "VALUES")?;

        let mut values = Vec::new();
        loop {
            values.push(parse_tuple(&mut tokens)?);
            match tokens.peek() {
                Some(Token::Comma) => {
                    tokens.next();
                }
                None => break,
                Some(t) => {
                    return Err(MergeError::Parse(format!("unexpected token {t:?}")));
                }
            }
        }
        Ok(Self {
            table,
            columns,
            keys,
            values,
        })
    }

    /// Emits the statement back as SQL text.
    pub fn to_sql(&self) -> String {
        format_merge(&self.table, &self.columns, self.keys.as_deref(), &self.values)
    }

    /// Binds the parsed statement to a table.
    pub fn into_statement(self, table: Table) -> Result<MergeStatement, MergeError> {
        if !table.name().eq_ignore_ascii_case(&self.table) {
            return Err(MergeError::Parse(format!(
                "statement targets table {:?}, not {:?}",
                self.table,
                table.name()
            )));
        }
        let mut stmt = MergeStatement::new(table);
        stmt.set_columns(self.columns);
        if let Some(keys) = self.keys {
            stmt.set_keys(keys);
        }
        for tuple in self.values {
            stmt.add_values(tuple);
        }
        Ok(stmt)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Str(String),
    LParen,
    RParen,
    Comma,
}

struct Tokenizer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
}

impl<'a> Tokenizer<'a> {
    fn new(sql: &'a str) -> Self {
        Self {
            chars: sql.chars().peekable(),
        }
    }

    fn tokenize(mut self) -> Result<Vec<Token>, MergeError> {
        let mut tokens = Vec::new();
        while let Some(&c) = self.chars.peek() {
            match c {
                c if c.is_whitespace() => {
                    self.chars.next();
                }
                '(' => {
                    self.chars.next();
                    tokens.push(Token::LParen);
                }
                ')' => {
                    self.chars.next();
                    tokens.push(Token::RParen);
                }
                ',' => {
                    self.chars.next();
                    tokens.push(Token::Comma);
                }
                '\'' => tokens.push(self.string()?),
                '-' => tokens.push(self.number()?),
                c if c.is_ascii_digit() => tokens.push(self.number()?),
                c if c.is_alphabetic() || c == '_' => tokens.push(self.ident()),
                other => {
                    return Err(MergeError::Parse(format!("unexpected character {other:?}")));
                }
            }
        }
        Ok(tokens)
    }

    fn string(&mut self) -> Result<Token, MergeError> {
        self.chars.next(); // opening quote
        let mut s = String::new();
        loop {
            match self.chars.next() {
                Some('\'') => {
                    // a doubled quote is an escaped quote
                    if self.chars.peek() == Some(&'\'') {
                        self.chars.next();
                        s.push('\'');
                    } else {
                        return Ok(Token::Str(s));
                    }
                }
                Some(c) => s.push(c),
                None => return Err(MergeError::Parse("unterminated string".to_string())),
            }
        }
    }

    fn number(&mut self) -> Result<Token, MergeError> {
        let mut s = String::new();
        if self.chars.peek() == Some(&'-') {
            s.push('-');
            self.chars.next();
        }
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_digit() {
                s.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        s.parse::<i64>()
            .map(Token::Int)
            .map_err(|e| MergeError::Parse(format!("bad integer {s:?}: {e}")))
    }

    fn ident(&mut self) -> Token {
        let mut s = String::new();
        while let Some(&c) = self.chars.peek() {
            if c.is_alphanumeric() || c == '_' {
                s.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        Token::Ident(s)
    }
}

type Tokens = std::iter::Peekable<std::vec::IntoIter<Token>>;

fn expect_keyword(tokens: &mut Tokens, keyword: &str) -> Result<(), MergeError> {
    match tokens.next() {
        Some(Token::Ident(s)) if s.eq_ignore_ascii_case(keyword) => Ok(()),
        other => Err(MergeError::Parse(format!(
            "expected {keyword}, found {other:?}"
        ))),
    }
}

fn peek_keyword(tokens: &mut Tokens, keyword: &str) -> bool {
    matches!(tokens.peek(), Some(Token::Ident(s)) if s.eq_ignore_ascii_case(keyword))
}

fn expect_ident(tokens: &mut Tokens) -> Result<String, MergeError> {
    match tokens.next() {
        Some(Token::Ident(s)) => Ok(s),
        other => Err(MergeError::Parse(format!(
            "expected identifier, found {other:?}"
        ))),
    }
}

fn expect_token(tokens: &mut Tokens, expected: Token) -> Result<(), MergeError> {
    match tokens.next() {
        Some(t) if t == expected => Ok(()),
        other => Err(MergeError::Parse(format!(
            "expected {expected:?}, found {other:?}"
        ))),
    }
}

fn parse_ident_list(tokens: &mut Tokens) -> Result<Vec<String>, MergeError> {
    expect_token(tokens, Token::LParen)?;
    let mut idents = vec![expect_ident(tokens)?];
    loop {
        match tokens.next() {
            Some(Token::Comma) => idents.push(expect_ident(tokens)?),
            Some(Token::RParen) => return Ok(idents),
            other => {
                return Err(MergeError::Parse(format!(
                    "expected , or ), found {other:?}"
                )))
            }
        }
    }
}

fn parse_tuple(tokens: &mut Tokens) -> Result<Vec<Option<SqlValue>>, MergeError> {
    expect_token(tokens, Token::LParen)?;
    let mut literals = vec![parse_literal(tokens)?];
    loop {
        match tokens.next() {
            Some(Token::Comma) => literals.push(parse_literal(tokens)?),
            Some(Token::RParen) => return Ok(literals),
            other => {
                return Err(MergeError::Parse(format!(
                    "expected , or ), found {other:?}"
                )))
            }
        }
    }
}

fn parse_literal(tokens: &mut Tokens) -> Result<Option<SqlValue>, MergeError> {
    match tokens.next() {
        Some(Token::Int(i)) => Ok(Some(SqlValue::Int(i))),
        Some(Token::Str(s)) => Ok(Some(SqlValue::Text(s))),
        Some(Token::Ident(s)) if s.eq_ignore_ascii_case("NULL") => Ok(Some(SqlValue::Null)),
        Some(Token::Ident(s)) if s.eq_ignore_ascii_case("DEFAULT") => Ok(None),
        other => Err(MergeError::Parse(format!(
            "expected literal, found {other:?}"
        ))),
    }
}
