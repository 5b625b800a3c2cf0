//! Row-identity diff between a previous snapshot and a fresh scrape.

use std::collections::HashMap;

use doge_core::{Cell, RecordTable};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffOutcome {
    /// Rows of the new table with no full-value match in the old table.
    pub new_rows: RecordTable,
    /// For each new row that was dropped, the old-table positions it matched.
    /// Kept for audit; the old table itself is never touched.
    pub matched_old: Vec<Vec<usize>>,
}

impl DiffOutcome {
    pub fn matched_count(&self) -> usize {
        self.matched_old.len()
    }
}

/// Null and empty text share one key: a null cell persisted to CSV reads
/// back as an empty field.
fn key_part(cell: &Cell) -> Option<&str> {
    cell.as_deref().filter(|s| !s.is_empty())
}

fn comparison_key<'a>(row: &'a [Cell], positions: &[usize]) -> Vec<Option<&'a str>> {
    positions.iter().map(|&i| key_part(&row[i])).collect()
}

/// Keeps the rows of `new` that match no row of `old` on every column in
/// `columns`. Duplicate-blind: two identical new rows are both kept or both
/// dropped. Columns missing from either table are ignored.
pub fn diff(old: &RecordTable, new: &RecordTable, columns: &[String]) -> DiffOutcome {
    let shared: Vec<&String> = columns
        .iter()
        .filter(|c| old.has_column(c) && new.has_column(c))
        .collect();
    let old_positions: Vec<usize> = shared.iter().filter_map(|c| old.column_index(c)).collect();
    let new_positions: Vec<usize> = shared.iter().filter_map(|c| new.column_index(c)).collect();

    let mut index: HashMap<Vec<Option<&str>>, Vec<usize>> = HashMap::with_capacity(old.len());
    for (idx, row) in old.rows().iter().enumerate() {
        index
            .entry(comparison_key(row, &old_positions))
            .or_default()
            .push(idx);
    }

    let mut keep = Vec::new();
    let mut matched_old = Vec::new();
    for (idx, row) in new.rows().iter().enumerate() {
        match index.get(&comparison_key(row, &new_positions)) {
            Some(hits) => matched_old.push(hits.clone()),
            None => keep.push(idx),
        }
    }

    DiffOutcome {
        new_rows: new.select_rows(&keep),
        matched_old,
    }
}
