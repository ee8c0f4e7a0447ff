//! Generic snapshot-merge core shared by the entity reconcilers.
//!
//! The diff is an explicit keyed-map comparison rather than a relational
//! join: both sides are bucketed by key tuple, identical keys pair up
//! positionally (registrations may legitimately repeat a key), and the union
//! of keys is walked existing-side first so re-runs are order-insensitive.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use refwatch_core::{Key, Row, Table, Value};
use serde::Serialize;

use crate::error::ReconcileError;

/// Per-row classification produced by every merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RowStatus {
    Added,
    Changed,
    Unchanged,
    Removed,
}

impl RowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RowStatus::Added => "added",
            RowStatus::Changed => "changed",
            RowStatus::Unchanged => "unchanged",
            RowStatus::Removed => "removed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "added" => Some(RowStatus::Added),
            "changed" => Some(RowStatus::Changed),
            "unchanged" => Some(RowStatus::Unchanged),
            "removed" => Some(RowStatus::Removed),
            _ => None,
        }
    }
}

impl fmt::Display for RowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied merge rules. Column sets are explicit per entity type;
/// columns absent from either side are ignored rather than invented.
#[derive(Debug, Clone, Default)]
pub struct MergeSpec {
    /// Key tuple identifying one logical record.
    pub keys: Vec<String>,
    /// Columns the incoming snapshot may overwrite (never the keys).
    pub update_columns: Vec<String>,
    /// Columns whose effective change flips a row to `Changed`.
    pub comparison_columns: Vec<String>,
    /// Retain rows missing from the snapshot (classified `Unchanged`) instead
    /// of marking them `Removed`.
    pub keep_missing: bool,
    /// Defaults filled into null cells of newly added rows only.
    pub defaults: BTreeMap<String, Value>,
    /// Existing column which, when equal to `"changed"`, forces the row to be
    /// re-classified `Changed` even if the incoming data is identical.
    pub force_changed_column: Option<String>,
}

/// Merged table plus the classification of each row, index-aligned.
#[derive(Debug)]
pub struct MergeOutcome {
    pub merged: Table,
    pub status: Vec<RowStatus>,
}

impl MergeOutcome {
    pub fn rows_with(&self, wanted: RowStatus) -> Table {
        let mut out = Table::new(self.merged.columns().to_vec());
        for (row, status) in self.merged.rows().iter().zip(&self.status) {
            if *status == wanted {
                out.push(row.clone());
            }
        }
        out
    }

    pub fn count(&self, wanted: RowStatus) -> usize {
        self.status.iter().filter(|s| **s == wanted).count()
    }
}

/// Reconcile `existing` against a fresh `incoming` snapshot.
///
/// Overwrites are monotonic: a null incoming cell never erases existing data,
/// so transient scrape gaps cannot destroy history. Re-running with the same
/// snapshot yields only `Unchanged` rows and an identical table.
pub fn merge_snapshot(
    existing: &Table,
    incoming: &Table,
    spec: &MergeSpec,
) -> Result<MergeOutcome, ReconcileError> {
    for key in &spec.keys {
        if !incoming.has_column(key) {
            return Err(ReconcileError::MissingKeyColumn {
                column: key.clone(),
            });
        }
    }

    let update_columns: Vec<&String> = spec
        .update_columns
        .iter()
        .filter(|c| existing.has_column(c) && incoming.has_column(c) && !spec.keys.contains(c))
        .collect();

    // Unconsumed incoming occurrences per key; matched front-first so repeated
    // keys pair deterministically.
    let mut pending: BTreeMap<Key, VecDeque<usize>> = BTreeMap::new();
    for (index, row) in incoming.rows().iter().enumerate() {
        pending
            .entry(row.key(&spec.keys))
            .or_default()
            .push_back(index);
    }

    let mut merged = Table::new(existing.columns().to_vec());
    let mut status = Vec::with_capacity(existing.len() + incoming.len());

    for row in existing.rows() {
        let key = row.key(&spec.keys);
        match pending.get_mut(&key).and_then(VecDeque::pop_front) {
            Some(incoming_index) => {
                let update = &incoming.rows()[incoming_index];
                let mut next = row.clone();
                for column in &update_columns {
                    let value = update.get(column);
                    if !value.is_null() {
                        next.set((*column).clone(), value.clone());
                    }
                }

                let forced = spec
                    .force_changed_column
                    .as_deref()
                    .map(|column| row.get(column).as_str() == Some(RowStatus::Changed.as_str()))
                    .unwrap_or(false);
                let differs = spec
                    .comparison_columns
                    .iter()
                    .any(|column| row.get(column) != next.get(column));

                status.push(if forced || differs {
                    RowStatus::Changed
                } else {
                    RowStatus::Unchanged
                });
                merged.push(next);
            }
            None => {
                status.push(if spec.keep_missing {
                    RowStatus::Unchanged
                } else {
                    RowStatus::Removed
                });
                merged.push(row.clone());
            }
        }
    }

    // Whatever the existing side did not consume is a new record.
    for (index, row) in incoming.rows().iter().enumerate() {
        let key = row.key(&spec.keys);
        let unconsumed = pending
            .get(&key)
            .map_or(false, |queue| queue.contains(&index));
        if !unconsumed {
            continue;
        }

        let mut next = Row::new();
        for column in &spec.keys {
            next.set(column.clone(), row.get(column).clone());
        }
        for column in &update_columns {
            next.set((*column).clone(), row.get(column).clone());
        }
        for (column, value) in &spec.defaults {
            if merged.has_column(column) && next.get(column).is_null() {
                next.set(column.clone(), value.clone());
            }
        }
        merged.push(next);
        status.push(RowStatus::Added);
    }

    Ok(MergeOutcome { merged, status })
}
