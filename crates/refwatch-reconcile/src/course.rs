//! Course catalog reconciliation.
//!
//! Courses are keyed by the portal's numeric id. The listing scrape only
//! yields shallow fields; the "deep" fields (contact info, exact deadlines)
//! come from a per-course detail fetch that is requested separately via
//! `courses_needing_deep_data`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use chrono::NaiveDate;
use refwatch_core::{ColumnType, Order, Schema, Table, Value};
use refwatch_store::SnapshotStore;
use tracing::{info, warn};

use crate::engine::{merge_snapshot, MergeSpec, RowStatus};
use crate::error::ReconcileError;
use crate::report::RunReport;

/// Columns only filled by the per-course detail fetch.
pub const DEEP_COLUMNS: &[&str] = &[
    "reregistration_end",
    "deregistration_end",
    "address",
    "remark",
    "contact_name",
    "contact_mail",
    "contact_phone",
    "contact_mobile",
];

/// Administrative counters owned locally; the portal never updates these.
const ADMIN_COLUMNS: &[&str] = &["management_reminder_count", "player_reminder_count"];

const SAVE_ORDER: &[(&str, Order)] = &[
    ("district", Order::Asc),
    ("type", Order::Asc),
    ("license_category", Order::Asc),
    ("license_type", Order::Asc),
    ("registration_end", Order::Asc),
];

pub fn schema() -> &'static Schema {
    static SCHEMA: OnceLock<Schema> = OnceLock::new();
    SCHEMA.get_or_init(|| {
        Schema::new("courses")
            .column("id", ColumnType::Str)
            .column("district", ColumnType::Str)
            .column("label", ColumnType::Str)
            .column("type", ColumnType::Str) // training, refresher
            .column("date_start", ColumnType::Date)
            .column("date_end", ColumnType::Date)
            .column("license_category", ColumnType::Str) // Halle, Beach
            .column("license_type", ColumnType::Str) // A, AK, B, BK, C, CP, CT, D
            .column("registration_start", ColumnType::Date)
            .column("registration_end", ColumnType::Date)
            .column("reregistration_end", ColumnType::Date)
            .column("deregistration_end", ColumnType::Date)
            .column("free_space", ColumnType::Int)
            .column("granted_space", ColumnType::Int)
            .column("waiting_count", ColumnType::Int)
            .column("city", ColumnType::Str)
            .column("address", ColumnType::Str)
            .column("remark", ColumnType::Str)
            .column("contact_name", ColumnType::Str)
            .column("contact_mail", ColumnType::Str)
            .column("contact_phone", ColumnType::Str)
            .column("contact_mobile", ColumnType::Str)
            .column("management_reminder_count", ColumnType::Int)
            .column("player_reminder_count", ColumnType::Int)
            .keys(&["id"])
    })
}

fn defaults() -> BTreeMap<String, Value> {
    ADMIN_COLUMNS
        .iter()
        .map(|c| (c.to_string(), Value::Int(0)))
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub enum ReminderCounter {
    Management,
    Player,
}

impl ReminderCounter {
    fn column(self) -> &'static str {
        match self {
            ReminderCounter::Management => "management_reminder_count",
            ReminderCounter::Player => "player_reminder_count",
        }
    }
}

#[derive(Debug)]
pub struct CourseCatalog {
    store: SnapshotStore,
    data: Table,
}

impl CourseCatalog {
    pub fn new(store: SnapshotStore) -> Self {
        Self {
            store,
            data: Table::from_schema(schema()),
        }
    }

    pub fn data(&self) -> &Table {
        &self.data
    }

    /// Load the latest snapshot; an empty catalog when none exists yet.
    pub fn load(&mut self) -> Result<bool, ReconcileError> {
        match self.store.load_latest(schema())? {
            Some(mut table) => {
                table.fill_defaults(&defaults());
                self.data = table;
                Ok(true)
            }
            None => {
                self.data = Table::from_schema(schema());
                Ok(false)
            }
        }
    }

    pub fn save(&mut self, stamp: NaiveDate) -> Result<(), ReconcileError> {
        self.data.sort_by(SAVE_ORDER);
        self.store.save(&self.data, schema(), stamp)?;
        Ok(())
    }

    /// Merge a fresh course listing. Courses never leave the catalog just
    /// because the portal stops listing them. Returns the newly added courses
    /// sorted by registration start, newest first.
    pub fn update(
        &mut self,
        mut incoming: Table,
        report: &mut RunReport,
    ) -> Result<Table, ReconcileError> {
        let failures = incoming.conform(schema());
        for failure in &failures {
            warn!(column = %failure.column, error = %failure.error, "nulled unparsable course cell");
        }
        report.add_coercion_failures("courses", &failures);

        let update_columns: Vec<String> = schema()
            .column_names()
            .filter(|c| *c != "id" && !ADMIN_COLUMNS.contains(c))
            .map(str::to_string)
            .collect();
        let spec = MergeSpec {
            keys: vec!["id".into()],
            comparison_columns: update_columns.clone(),
            update_columns,
            keep_missing: true,
            defaults: defaults(),
            force_changed_column: None,
        };

        let outcome = merge_snapshot(&self.data, &incoming, &spec)?;
        let mut added = outcome.rows_with(RowStatus::Added);
        self.data = outcome.merged;
        self.data.sort_by(&[
            ("district", Order::Asc),
            ("type", Order::Asc),
            ("license_category", Order::Asc),
            ("license_type", Order::Asc),
            ("registration_end", Order::Desc),
        ]);

        added.sort_by(&[("registration_start", Order::Desc)]);
        if !added.is_empty() {
            let ids: Vec<&str> = added
                .rows()
                .iter()
                .filter_map(|r| r.get("id").as_str())
                .collect();
            info!(?ids, "course update added new courses");
        }
        Ok(added)
    }

    /// Ids (among `ids`) whose row is still missing deep data entirely and
    /// therefore needs the secondary per-course fetch. A course with at least
    /// one deep field filled is left alone, since the portal rarely fills all
    /// of them.
    pub fn courses_needing_deep_data(&self, ids: &[String]) -> Vec<String> {
        let wanted: BTreeSet<&str> = ids.iter().map(String::as_str).collect();
        let columns = self.data.columns().to_vec();
        self.data
            .rows()
            .iter()
            .filter(|row| {
                row.get("id")
                    .as_str()
                    .map_or(false, |id| wanted.contains(id))
            })
            .filter(|row| columns.len() - row.non_null_count(&columns) >= DEEP_COLUMNS.len())
            .filter_map(|row| row.get("id").as_str().map(str::to_string))
            .collect()
    }

    /// Merge fetched per-course detail rows through the same engine.
    pub fn apply_course_details(
        &mut self,
        details: Table,
        report: &mut RunReport,
    ) -> Result<(), ReconcileError> {
        if details.is_empty() {
            return Ok(());
        }
        let before = self.data.len();
        self.update(details, report)?;
        if self.data.len() != before {
            warn!("course detail fetch introduced unknown course ids");
        }
        Ok(())
    }

    /// Audited in-place bump of a reminder counter. Returns false when the
    /// course id is unknown.
    pub fn increment_reminder(&mut self, id: &str, counter: ReminderCounter) -> bool {
        let column = counter.column();
        for row in self.data.rows_mut() {
            if row.get("id").as_str() == Some(id) {
                let next = row.get(column).as_int().unwrap_or(0) + 1;
                row.set(column, Value::Int(next));
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refwatch_core::Row;
    use tempfile::tempdir;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn mk_catalog() -> (CourseCatalog, tempfile::TempDir) {
        let dir = tempdir().expect("tempdir");
        let catalog =
            CourseCatalog::new(SnapshotStore::new(dir.path().join("courses"), "courses_data"));
        (catalog, dir)
    }

    fn mk_course(id: &str, label: &str) -> Row {
        Row::new()
            .with("id", id)
            .with("district", "Oberbayern")
            .with("label", label)
            .with("type", "training")
            .with("license_category", "Halle")
            .with("license_type", "D")
            .with("registration_start", date(2024, 1, 1))
            .with("registration_end", date(2024, 3, 1))
    }

    fn mk_incoming(rows: Vec<Row>) -> Table {
        let mut table = Table::from_schema(schema());
        for row in rows {
            table.push(row);
        }
        table
    }

    #[test]
    fn label_change_with_null_deadline_keeps_deadline() {
        let (mut catalog, _guard) = mk_catalog();
        let mut report = RunReport::new();
        catalog
            .update(mk_incoming(vec![mk_course("1", "C")]), &mut report)
            .unwrap();

        let mut renamed = mk_course("1", "C2");
        renamed.set("registration_end", Value::Null);
        let added = catalog
            .update(mk_incoming(vec![renamed]), &mut report)
            .unwrap();

        assert!(added.is_empty());
        let row = &catalog.data().rows()[0];
        assert_eq!(row.get("label").as_str(), Some("C2"));
        assert_eq!(
            row.get("registration_end"),
            &Value::Date(date(2024, 3, 1))
        );
    }

    #[test]
    fn new_courses_come_back_sorted_by_registration_start_desc() {
        let (mut catalog, _guard) = mk_catalog();
        let mut report = RunReport::new();

        let mut early = mk_course("1", "Early");
        early.set("registration_start", Value::Date(date(2024, 1, 1)));
        let mut late = mk_course("2", "Late");
        late.set("registration_start", Value::Date(date(2024, 2, 1)));

        let added = catalog
            .update(mk_incoming(vec![early, late]), &mut report)
            .unwrap();
        assert_eq!(added.rows()[0].get("label").as_str(), Some("Late"));
        assert_eq!(added.rows()[1].get("label").as_str(), Some("Early"));
        // reminder counters defaulted for new rows
        assert_eq!(
            added.rows()[0].get("management_reminder_count"),
            &Value::Int(0)
        );
    }

    #[test]
    fn delisted_courses_are_retained() {
        let (mut catalog, _guard) = mk_catalog();
        let mut report = RunReport::new();
        catalog
            .update(
                mk_incoming(vec![mk_course("1", "A"), mk_course("2", "B")]),
                &mut report,
            )
            .unwrap();
        catalog
            .update(mk_incoming(vec![mk_course("2", "B")]), &mut report)
            .unwrap();
        assert_eq!(catalog.data().len(), 2);
    }

    #[test]
    fn deep_data_query_selects_only_shallow_selected_courses() {
        let (mut catalog, _guard) = mk_catalog();
        let mut report = RunReport::new();

        let shallow = mk_course("1", "Shallow");
        let mut deep = mk_course("2", "Deep");
        deep.set("address", Value::str("Hallenweg 3"));
        deep.set("remark", Value::str("bring shoes"));
        deep.set("contact_name", Value::str("Orga"));
        deep.set("contact_mail", Value::str("orga@example.org"));
        deep.set("contact_phone", Value::str("089-1"));
        deep.set("contact_mobile", Value::str("0170-1"));
        deep.set("reregistration_end", Value::Date(date(2024, 2, 20)));
        deep.set("deregistration_end", Value::Date(date(2024, 2, 25)));
        deep.set("date_start", Value::Date(date(2024, 3, 10)));
        deep.set("date_end", Value::Date(date(2024, 3, 11)));
        deep.set("free_space", Value::Int(5));
        deep.set("granted_space", Value::Int(20));
        deep.set("waiting_count", Value::Int(0));
        deep.set("city", Value::str("München"));

        catalog
            .update(mk_incoming(vec![shallow, deep]), &mut report)
            .unwrap();

        let ids = vec!["1".to_string(), "2".to_string(), "99".to_string()];
        assert_eq!(catalog.courses_needing_deep_data(&ids), vec!["1"]);
    }

    #[test]
    fn reminder_increment_is_in_place_and_reports_unknown_ids() {
        let (mut catalog, _guard) = mk_catalog();
        let mut report = RunReport::new();
        catalog
            .update(mk_incoming(vec![mk_course("1", "A")]), &mut report)
            .unwrap();

        assert!(catalog.increment_reminder("1", ReminderCounter::Management));
        assert!(catalog.increment_reminder("1", ReminderCounter::Management));
        assert!(!catalog.increment_reminder("404", ReminderCounter::Player));

        let row = &catalog.data().rows()[0];
        assert_eq!(row.get("management_reminder_count"), &Value::Int(2));
        assert_eq!(row.get("player_reminder_count"), &Value::Int(0));
    }
}
