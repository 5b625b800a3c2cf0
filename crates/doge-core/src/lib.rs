//! Core record model for the DOGE savings scraper.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "doge-core";

/// Format used for run stamps: seconds precision, colons removed.
pub const RUN_STAMP_FORMAT: &str = "%Y-%m-%dT%H%M%S";

/// A nullable text cell. `None` is null.
pub type Cell = Option<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Contract,
    Grant,
    Property,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Contract, Category::Grant, Category::Property];

    /// Mode string used in logs and the run error log.
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Contract => "contract",
            Category::Grant => "grant",
            Category::Property => "property",
        }
    }

    /// Path segment of the primary source endpoint; also the key of the
    /// record array in its `result` object.
    pub fn endpoint(self) -> &'static str {
        match self {
            Category::Contract => "contracts",
            Category::Grant => "grants",
            Category::Property => "leases",
        }
    }

    pub fn file_prefix(self) -> &'static str {
        match self {
            Category::Contract => "doge-contract",
            Category::Grant => "doge-grant",
            Category::Property => "doge-property",
        }
    }

    /// Column holding the cross-reference link, if the category has one.
    pub fn link_column(self) -> Option<&'static str> {
        match self {
            Category::Contract => Some("fpds_link"),
            Category::Grant => Some("link"),
            Category::Property => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn run_stamp(at: DateTime<Utc>) -> String {
    at.format(RUN_STAMP_FORMAT).to_string()
}

/// `doge-grant` + `2025-06-29T204434` -> `doge-grant_2025-06-29T204434.csv`.
pub fn snapshot_filename(category: Category, stamp: &str) -> String {
    format!("{}_{}.csv", category.file_prefix(), stamp.replace(':', ""))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotName {
    pub category: Category,
    pub stamp: String,
}

impl SnapshotName {
    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(".csv")?;
        let (prefix, stamp) = stem.rsplit_once('_')?;
        let category = Category::ALL
            .into_iter()
            .find(|c| c.file_prefix() == prefix)?;
        NaiveDateTime::parse_from_str(stamp, RUN_STAMP_FORMAT).ok()?;
        Some(Self {
            category,
            stamp: stamp.to_string(),
        })
    }
}

/// Converts a JSON scalar into a cell. Nested values are kept as JSON text.
pub fn cell_from_json(value: &JsonValue) -> Cell {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

/// Ordered, column-named table of nullable text cells.
///
/// Every row has exactly one cell per column. Column names are unique.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordTable {
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl RecordTable {
    pub fn new(columns: Vec<String>) -> Self {
        let mut table = Self::default();
        for column in columns {
            table.ensure_column(&column);
        }
        table
    }

    /// Builds a table from JSON objects. Columns appear in first-seen order;
    /// keys missing from a record become null.
    pub fn from_json_records<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a serde_json::Map<String, JsonValue>>,
    {
        let mut table = Self::default();
        for record in records {
            let mut row: HashMap<&str, Cell> = HashMap::with_capacity(record.len());
            for (key, value) in record {
                table.ensure_column(key);
                row.insert(key.as_str(), cell_from_json(value));
            }
            let cells = table
                .columns
                .iter()
                .map(|c| row.remove(c.as_str()).flatten())
                .collect();
            table.rows.push(cells);
        }
        table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Adds a null-filled column if absent and returns its index.
    pub fn ensure_column(&mut self, name: &str) -> usize {
        if let Some(idx) = self.column_index(name) {
            return idx;
        }
        self.columns.push(name.to_string());
        for row in &mut self.rows {
            row.push(None);
        }
        self.columns.len() - 1
    }

    /// Appends a row. Short rows are null-padded; long rows are truncated.
    pub fn push_row(&mut self, mut cells: Vec<Cell>) {
        cells.resize(self.columns.len(), None);
        self.rows.push(cells);
    }

    pub fn cell(&self, row: usize, column: &str) -> Option<&str> {
        let col = self.column_index(column)?;
        self.rows.get(row)?.get(col)?.as_deref()
    }

    pub fn column_values(&self, column: &str) -> Option<Vec<Option<&str>>> {
        let col = self.column_index(column)?;
        Some(self.rows.iter().map(|r| r[col].as_deref()).collect())
    }

    /// Replaces every cell of a column via `f`, creating the column if needed.
    pub fn map_column<F>(&mut self, column: &str, mut f: F)
    where
        F: FnMut(Option<&str>) -> Cell,
    {
        let col = self.ensure_column(column);
        for row in &mut self.rows {
            row[col] = f(row[col].as_deref());
        }
    }

    pub fn set_cell(&mut self, row: usize, column: &str, value: Cell) {
        let col = self.ensure_column(column);
        if let Some(cells) = self.rows.get_mut(row) {
            cells[col] = value;
        }
    }

    /// Renames a column. A no-op when `from` is absent; if `to` already exists
    /// the rename is skipped so names stay unique.
    pub fn rename_column(&mut self, from: &str, to: &str) -> bool {
        if self.has_column(to) {
            return false;
        }
        match self.column_index(from) {
            Some(idx) => {
                self.columns[idx] = to.to_string();
                true
            }
            None => false,
        }
    }

    /// Rewrites every column name through `f`. A rewritten name that is
    /// already taken gets a `_<position>` suffix.
    pub fn rename_columns_with<F>(&mut self, mut f: F)
    where
        F: FnMut(&str) -> String,
    {
        let mut seen: Vec<String> = Vec::with_capacity(self.columns.len());
        for idx in 0..self.columns.len() {
            let renamed = f(&self.columns[idx]);
            let name = if seen.contains(&renamed) {
                format!("{renamed}_{idx}")
            } else {
                renamed
            };
            seen.push(name.clone());
            self.columns[idx] = name;
        }
    }

    /// Columns of `self` that also exist in `other`, in `self` order.
    pub fn shared_columns(&self, other: &RecordTable) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| other.has_column(c))
            .cloned()
            .collect()
    }

    /// New table holding only the rows at `indices`, in that order.
    pub fn select_rows(&self, indices: &[usize]) -> RecordTable {
        RecordTable {
            columns: self.columns.clone(),
            rows: indices
                .iter()
                .filter_map(|&i| self.rows.get(i).cloned())
                .collect(),
        }
    }

    /// Stacks `other` under `self`, taking the union of columns. Columns only
    /// in `other` are appended; missing cells are null.
    pub fn concat(&self, other: &RecordTable) -> RecordTable {
        let mut out = self.clone();
        let positions: Vec<usize> = other
            .columns
            .iter()
            .map(|c| out.ensure_column(c))
            .collect();
        for row in &other.rows {
            let mut cells = vec![None; out.columns.len()];
            for (src, &dst) in positions.iter().enumerate() {
                cells[dst] = row[src].clone();
            }
            out.rows.push(cells);
        }
        out
    }
}
