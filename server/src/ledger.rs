//! Row store backing the wiki.
//!
//! Every attribute of every entry is one row `(idx, id, predicate, value, flags)`.
//! `idx` is assigned on insert and never reused, so it identifies a slot for
//! the lifetime of the row. Tables answer equality/conjunction conditions and
//! treat each single-row operation as atomic; there are no multi-row
//! transactions.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::attribute::{flags_to_bits, AttrFlags};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("row codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("corrupt row key: {0:?}")]
    Corrupt(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub idx: i64,
    pub id: String,
    pub predicate: String,
    pub value: String,
    pub flags: AttrFlags,
}

impl Row {
    pub fn cell(&self, column: Column) -> Cell {
        match column {
            Column::Idx => Cell::Integer(self.idx),
            Column::Id => Cell::Text(self.id.clone()),
            Column::Predicate => Cell::Text(self.predicate.clone()),
            Column::Value => Cell::Text(self.value.clone()),
            Column::Flags => Cell::Integer(flags_to_bits(self.flags)),
        }
    }

    fn matches_cell(&self, column: Column, cell: &Cell) -> bool {
        match (column, cell) {
            (Column::Idx, Cell::Integer(v)) => self.idx == *v,
            (Column::Flags, Cell::Integer(v)) => flags_to_bits(self.flags) == *v,
            (Column::Id, Cell::Text(v)) => &self.id == v,
            (Column::Predicate, Cell::Text(v)) => &self.predicate == v,
            (Column::Value, Cell::Text(v)) => &self.value == v,
            _ => false,
        }
    }
}

/// A row that has not been assigned an index yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRow {
    pub id: String,
    pub predicate: String,
    pub value: String,
    pub flags: AttrFlags,
}

impl NewRow {
    fn with_idx(self, idx: i64) -> Row {
        Row { idx, id: self.id, predicate: self.predicate, value: self.value, flags: self.flags }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    Idx,
    Id,
    Predicate,
    Value,
    Flags,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cell {
    Integer(i64),
    Text(String),
}

impl From<i64> for Cell {
    fn from(v: i64) -> Self { Cell::Integer(v) }
}

impl From<&str> for Cell {
    fn from(v: &str) -> Self { Cell::Text(v.to_string()) }
}

impl From<String> for Cell {
    fn from(v: String) -> Self { Cell::Text(v) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Eq(Column, Cell),
    And(Box<Condition>, Box<Condition>),
}

impl Condition {
    pub fn eq(column: Column, value: impl Into<Cell>) -> Self {
        Condition::Eq(column, value.into())
    }

    pub fn idx(idx: i64) -> Self {
        Condition::eq(Column::Idx, idx)
    }

    pub fn and(self, other: Condition) -> Self {
        Condition::And(Box::new(self), Box::new(other))
    }

    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Condition::Eq(column, cell) => row.matches_cell(*column, cell),
            Condition::And(a, b) => a.matches(row) && b.matches(row),
        }
    }

    /// Row index pinned by this condition, if any, so point lookups can skip a scan.
    fn pinned_idx(&self) -> Option<i64> {
        match self {
            Condition::Eq(Column::Idx, Cell::Integer(v)) => Some(*v),
            Condition::Eq(..) => None,
            Condition::And(a, b) => a.pinned_idx().or_else(|| b.pinned_idx()),
        }
    }
}

/// Column assignments applied by [`Table::update`]; `None` leaves a column untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowUpdate {
    pub id: Option<String>,
    pub predicate: Option<String>,
    pub value: Option<String>,
    pub flags: Option<AttrFlags>,
}

impl RowUpdate {
    pub fn predicate(mut self, predicate: impl Into<String>) -> Self {
        self.predicate = Some(predicate.into());
        self
    }

    pub fn value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn flags(mut self, flags: AttrFlags) -> Self {
        self.flags = Some(flags);
        self
    }

    fn apply(&self, row: &mut Row) {
        if let Some(id) = &self.id { row.id = id.clone(); }
        if let Some(p) = &self.predicate { row.predicate = p.clone(); }
        if let Some(v) = &self.value { row.value = v.clone(); }
        if let Some(f) = self.flags { row.flags = f; }
    }
}

pub trait Table: Send {
    /// Rows matching `condition` (all rows when `None`) in ascending index order.
    fn query(&self, condition: Option<&Condition>) -> Result<Vec<Row>, LedgerError>;
    /// Appends a row and returns its freshly assigned index.
    fn insert(&mut self, row: NewRow) -> Result<i64, LedgerError>;
    /// Returns the number of rows changed.
    fn update(&mut self, update: &RowUpdate, condition: &Condition) -> Result<usize, LedgerError>;
    /// Returns the number of rows removed.
    fn erase(&mut self, condition: &Condition) -> Result<usize, LedgerError>;
    fn flush(&self) -> Result<(), LedgerError> {
        Ok(())
    }
}

// =============================================================================
// sled
// =============================================================================

pub struct SledLedger {
    db: sled::Db,
}

impl SledLedger {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        Ok(Self { db: sled::open(path)? })
    }

    /// Opens (creating if needed) the named table. The row schema is fixed.
    pub fn create_table(&self, name: &str) -> Result<SledTable, LedgerError> {
        let tree = self.db.open_tree(name)?;
        Ok(SledTable { db: self.db.clone(), tree })
    }
}

pub struct SledTable {
    db: sled::Db,
    tree: sled::Tree,
}

impl SledTable {
    fn key(idx: i64) -> [u8; 8] {
        (idx as u64).to_be_bytes()
    }

    fn decode(key: &[u8], value: &[u8]) -> Result<Row, LedgerError> {
        if key.len() != 8 {
            return Err(LedgerError::Corrupt(key.to_vec()));
        }
        Ok(serde_json::from_slice(value)?)
    }

    fn matching(&self, condition: &Condition) -> Result<Vec<Row>, LedgerError> {
        if let Some(idx) = condition.pinned_idx() {
            let key = Self::key(idx);
            return match self.tree.get(key)? {
                Some(v) => {
                    let row = Self::decode(&key, &v)?;
                    Ok(if condition.matches(&row) { vec![row] } else { Vec::new() })
                }
                None => Ok(Vec::new()),
            };
        }
        self.query(Some(condition))
    }
}

impl Table for SledTable {
    fn query(&self, condition: Option<&Condition>) -> Result<Vec<Row>, LedgerError> {
        let mut rows = Vec::new();
        for kv in self.tree.iter() {
            let (k, v) = kv?;
            let row = Self::decode(&k, &v)?;
            if condition.map_or(true, |c| c.matches(&row)) {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    fn insert(&mut self, row: NewRow) -> Result<i64, LedgerError> {
        // generate_id starts at 0; keep indices strictly positive.
        let idx = self.db.generate_id()? as i64 + 1;
        let row = row.with_idx(idx);
        self.tree.insert(Self::key(idx), serde_json::to_vec(&row)?)?;
        Ok(idx)
    }

    fn update(&mut self, update: &RowUpdate, condition: &Condition) -> Result<usize, LedgerError> {
        let rows = self.matching(condition)?;
        for mut row in rows.iter().cloned() {
            update.apply(&mut row);
            self.tree.insert(Self::key(row.idx), serde_json::to_vec(&row)?)?;
        }
        Ok(rows.len())
    }

    fn erase(&mut self, condition: &Condition) -> Result<usize, LedgerError> {
        let rows = self.matching(condition)?;
        for row in &rows {
            self.tree.remove(Self::key(row.idx))?;
        }
        Ok(rows.len())
    }

    fn flush(&self) -> Result<(), LedgerError> {
        self.tree.flush()?;
        Ok(())
    }
}

// =============================================================================
// in-memory
// =============================================================================

#[derive(Debug, Default)]
pub struct MemoryTable {
    rows: BTreeMap<i64, Row>,
    next_idx: i64,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn matching_keys(&self, condition: &Condition) -> Vec<i64> {
        self.rows.values().filter(|r| condition.matches(r)).map(|r| r.idx).collect()
    }
}

impl Table for MemoryTable {
    fn query(&self, condition: Option<&Condition>) -> Result<Vec<Row>, LedgerError> {
        Ok(self
            .rows
            .values()
            .filter(|r| condition.map_or(true, |c| c.matches(r)))
            .cloned()
            .collect())
    }

    fn insert(&mut self, row: NewRow) -> Result<i64, LedgerError> {
        self.next_idx += 1;
        let idx = self.next_idx;
        self.rows.insert(idx, row.with_idx(idx));
        Ok(idx)
    }

    fn update(&mut self, update: &RowUpdate, condition: &Condition) -> Result<usize, LedgerError> {
        let keys = self.matching_keys(condition);
        for k in &keys {
            if let Some(row) = self.rows.get_mut(k) {
                update.apply(row);
            }
        }
        Ok(keys.len())
    }

    fn erase(&mut self, condition: &Condition) -> Result<usize, LedgerError> {
        let keys = self.matching_keys(condition);
        for k in &keys {
            self.rows.remove(k);
        }
        Ok(keys.len())
    }
}
