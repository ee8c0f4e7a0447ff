//! Course-registration reconciliation.
//!
//! Registrations carry their lifecycle in a `status` column so the trigger
//! side can pick up added/changed rows between runs. The portal keeps
//! listing a registration after its cancellation, so cancelled rows already
//! known to the dataset are matched off against the snapshot before the
//! merge; otherwise every run would re-announce the same cancellation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use chrono::NaiveDate;
use refwatch_core::{ColumnType, Key, Order, Schema, Table, Value};
use refwatch_store::SnapshotStore;
use tracing::{info, warn};

use crate::engine::{merge_snapshot, MergeSpec, RowStatus};
use crate::error::ReconcileError;
use crate::report::RunReport;

const KEYS: [&str; 4] = ["course_label", "last_name", "first_name", "birthday"];

const COMPARISON_COLUMNS: [&str; 2] = ["registration_status", "participation_status"];

// Portal vocabulary for registration_status: approved, cancelled, waiting.
const CANCELLED: &str = "cancelled";

const SAVE_ORDER: [(&str, Order); 6] = [
    ("course_id", Order::Asc),
    ("course_label", Order::Asc),
    ("registration_status", Order::Asc),
    ("waiting_position", Order::Asc),
    ("last_name", Order::Asc),
    ("first_name", Order::Asc),
];

const CONFIRMATION_STATES: [&str; 3] = ["confirmed", "denied", "pending"];

pub fn schema() -> &'static Schema {
    static SCHEMA: OnceLock<Schema> = OnceLock::new();
    SCHEMA.get_or_init(|| {
        Schema::new("registrations")
            .column("course_id", ColumnType::Str)
            .column("course_label", ColumnType::Str)
            .column("last_name", ColumnType::Str)
            .column("first_name", ColumnType::Str)
            .column("birthday", ColumnType::Date)
            .column("registration_status", ColumnType::Str)
            .column("participation_status", ColumnType::Str)
            .column("waiting_position", ColumnType::Int)
            .column("confirmation_status", ColumnType::Str)
            .column("status", ColumnType::Str)
            .keys(&KEYS)
    })
}

fn defaults() -> BTreeMap<String, Value> {
    BTreeMap::from([
        ("confirmation_status".to_string(), Value::str("pending")),
        (
            "status".to_string(),
            Value::str(RowStatus::Unchanged.as_str()),
        ),
    ])
}

#[derive(Debug)]
pub struct RegistrationLedger {
    store: SnapshotStore,
    data: Table,
}

impl RegistrationLedger {
    pub fn new(store: SnapshotStore) -> Self {
        Self {
            store,
            data: Table::from_schema(schema()),
        }
    }

    pub fn data(&self) -> &Table {
        &self.data
    }

    pub fn load(&mut self) -> Result<bool, ReconcileError> {
        match self.store.load_latest(schema())? {
            Some(mut table) => {
                normalize_confirmation(&mut table);
                self.data = table;
                Ok(true)
            }
            None => {
                self.data = Table::from_schema(schema());
                Ok(false)
            }
        }
    }

    /// Merge a registration snapshot.
    ///
    /// Cancelled rows already in the dataset are set aside first. The portal
    /// keeps listing a cancelled registration, so for each known cancelled
    /// row one identical incoming row is subtracted before the merge; any
    /// surplus identical rows are still kept quiet instead of reappearing as
    /// added. Rows missing from the snapshot are classified removed; they
    /// stay in the dataset until the next save so the trigger side can still
    /// see them.
    pub fn update(
        &mut self,
        incoming: Table,
        report: &mut RunReport,
    ) -> Result<(), ReconcileError> {
        if incoming.is_empty() {
            return Ok(());
        }
        let mut incoming = incoming;
        let failures = incoming.conform(schema());
        for failure in &failures {
            warn!(column = %failure.column, error = %failure.error, "nulled unparsable registration cell");
        }
        report.add_coercion_failures("registrations", &failures);

        let known_cancelled = self
            .data
            .filter(|row| row.get("registration_status").as_str() == Some(CANCELLED));
        let active_existing = self
            .data
            .filter(|row| row.get("registration_status").as_str() != Some(CANCELLED));

        // Full-row equality over the snapshot's columns decides what counts
        // as "the same cancelled registration".
        let shared: Vec<String> = incoming
            .columns()
            .iter()
            .filter(|c| schema().has_column(c.as_str()) && c.as_str() != "status")
            .cloned()
            .collect();
        let incoming = subtract_matching(&incoming, &known_cancelled, &shared);
        if !known_cancelled.is_empty() {
            info!(
                rows = known_cancelled.len(),
                "known cancelled registrations set aside before merging"
            );
        }

        let spec = MergeSpec {
            keys: KEYS.iter().map(|k| k.to_string()).collect(),
            update_columns: schema()
                .column_names()
                .filter(|c| !KEYS.contains(c) && *c != "status")
                .map(str::to_string)
                .collect(),
            comparison_columns: COMPARISON_COLUMNS.iter().map(|c| c.to_string()).collect(),
            keep_missing: false,
            defaults: defaults(),
            force_changed_column: Some("status".to_string()),
        };
        let outcome = merge_snapshot(&active_existing, &incoming, &spec)?;
        let mut merged = outcome.merged;
        let mut status = outcome.status;

        // Surplus copies of a known cancelled row must not look like fresh
        // registrations.
        let cancelled_values: BTreeSet<Key> = known_cancelled
            .rows()
            .iter()
            .map(|row| row.key(&shared))
            .collect();
        for (row, status) in merged.rows().iter().zip(status.iter_mut()) {
            if *status == RowStatus::Added && cancelled_values.contains(&row.key(&shared)) {
                *status = RowStatus::Unchanged;
            }
        }

        for (row, status) in merged.rows_mut().iter_mut().zip(status.iter()) {
            if *status == RowStatus::Added
                && row.get("participation_status").as_str() == Some("pending")
            {
                row.set("confirmation_status", Value::str("pending"));
            }
            row.set("status", Value::str(status.as_str()));
        }

        // Cancelled history re-enters untouched.
        for row in known_cancelled.into_rows() {
            let mut row = row;
            row.set("status", Value::str(RowStatus::Unchanged.as_str()));
            merged.push(row);
        }

        normalize_confirmation(&mut merged);
        self.data = merged;
        Ok(())
    }

    /// Resolve `course_label` into `course_id` against the course catalog.
    /// A label matching zero or several courses is ambiguous; the row is
    /// dropped and reported rather than guessed at.
    pub fn insert_course_id(&mut self, courses: &Table, report: &mut RunReport) {
        let mut by_label: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for row in courses.rows() {
            if let Some(label) = row.get("label").as_str() {
                by_label
                    .entry(label.to_string())
                    .or_default()
                    .push(row.get("id").clone());
            }
        }

        // Resolution is repeated on every call; a previously resolved id is
        // stale the moment the catalog stops carrying exactly one match.
        let mut dropped = Table::new(self.data.columns().to_vec());
        let mut kept = Table::new(self.data.columns().to_vec());
        for row in self.data.rows() {
            let ids = row
                .get("course_label")
                .as_str()
                .and_then(|label| by_label.get(label));
            match ids {
                Some(ids) if ids.len() == 1 => {
                    let mut row = row.clone();
                    row.set("course_id", ids[0].clone());
                    kept.push(row);
                }
                _ => dropped.push(row.clone()),
            }
        }

        if !dropped.is_empty() {
            warn!(
                rows = dropped.len(),
                "dropped registrations whose course label did not resolve to exactly one course"
            );
            report.add_rows(
                "registrations",
                "course label did not resolve to exactly one course",
                dropped,
            );
        }
        self.data = kept;
    }

    pub fn added(&self) -> Table {
        self.rows_with_status(&[RowStatus::Added])
    }

    pub fn changed(&self, include_added: bool) -> Table {
        if include_added {
            self.rows_with_status(&[RowStatus::Changed, RowStatus::Added])
        } else {
            self.rows_with_status(&[RowStatus::Changed])
        }
    }

    pub fn unchanged(&self) -> Table {
        self.rows_with_status(&[RowStatus::Unchanged])
    }

    pub fn removed(&self) -> Table {
        self.rows_with_status(&[RowStatus::Removed])
    }

    fn rows_with_status(&self, wanted: &[RowStatus]) -> Table {
        self.data.filter(|row| {
            row.get("status")
                .as_str()
                .and_then(RowStatus::parse)
                .map_or(false, |status| wanted.contains(&status))
        })
    }

    /// Persist the dataset: removed rows are dropped for good, the lifecycle
    /// column resets, and rows take the canonical operator-facing order.
    pub fn save(&mut self, stamp: NaiveDate) -> Result<(), ReconcileError> {
        self.data.retain(|row| {
            row.get("status").as_str() != Some(RowStatus::Removed.as_str())
        });
        for row in self.data.rows_mut() {
            row.set("status", Value::str(RowStatus::Unchanged.as_str()));
        }
        normalize_confirmation(&mut self.data);
        self.data.sort_by(&SAVE_ORDER);
        self.store.save(&self.data, schema(), stamp)?;
        Ok(())
    }
}

/// Snap operator-managed confirmation values back to the known set; anything
/// unrecognized (including null) means the decision is still pending.
fn normalize_confirmation(table: &mut Table) {
    for row in table.rows_mut() {
        let valid = row
            .get("confirmation_status")
            .as_str()
            .map_or(false, |s| CONFIRMATION_STATES.contains(&s));
        if !valid {
            row.set("confirmation_status", Value::str("pending"));
        }
    }
}

/// Multiset subtraction: remove from `table` one occurrence per row of
/// `remove`, matching on row equality over `columns`.
fn subtract_matching(table: &Table, remove: &Table, columns: &[String]) -> Table {
    if remove.is_empty() {
        return table.clone();
    }
    let mut counts: BTreeMap<Key, usize> = BTreeMap::new();
    for row in remove.rows() {
        *counts.entry(row.key(columns)).or_insert(0) += 1;
    }
    let mut kept = Table::new(table.columns().to_vec());
    for row in table.rows() {
        match counts.get_mut(&row.key(columns)) {
            Some(count) if *count > 0 => *count -= 1,
            _ => kept.push(row.clone()),
        }
    }
    kept
}
