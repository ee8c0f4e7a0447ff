//! Person/license directory reconciliation.
//!
//! Persons are keyed by name + birthday. Incoming data is duplicate-prone
//! (two independently sourced exports, inconsistent completeness), so every
//! snapshot is collapsed deterministically before it touches the dataset, and
//! the losing rows land in a backup CSV instead of vanishing.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::{Datelike, NaiveDate};
use refwatch_core::{
    collapse_duplicates, fold_umlauts, ColumnType, Order, Row, Schema, Table, Value,
};
use refwatch_store::SnapshotStore;
use tracing::{debug, info, warn};

use crate::engine::{merge_snapshot, MergeSpec, RowStatus};
use crate::error::ReconcileError;
use crate::report::RunReport;

const KEYS: [&str; 3] = ["last_name", "first_name", "birthday"];

const DUPLICATES_BACKUP: &str = "duplicate_persons_loading.csv";
const DELETED_BACKUP: &str = "update_persons_deleted_entries.csv";

pub fn schema() -> &'static Schema {
    static SCHEMA: OnceLock<Schema> = OnceLock::new();
    SCHEMA.get_or_init(|| {
        Schema::new("persons")
            .column("last_name", ColumnType::Str)
            .column("first_name", ColumnType::Str)
            .column("birthday", ColumnType::Date)
            .column("sex", ColumnType::Str) // m, f
            .column("street", ColumnType::Str)
            .column("postalcode", ColumnType::Str)
            .column("city", ColumnType::Str)
            .column("phone", ColumnType::Str)
            .column("mobile", ColumnType::Str)
            .column("mail", ColumnType::Str)
            .column("license_category", ColumnType::Str) // Halle, Beach
            .column("license_type", ColumnType::Str) // A..D, DK = none
            .column("license_id", ColumnType::Str)
            .column("license_bvv_id", ColumnType::Str)
            .column("license_since", ColumnType::Date)
            .column("license_expire", ColumnType::Date)
            .column("club", ColumnType::Str)
            .column("club_membership_expire", ColumnType::Date)
            .column("club_team", ColumnType::Str)
            .column("wants_higher_license", ColumnType::Bool)
            .column("help_count", ColumnType::Int)
            .column("failed_higher_license_count", ColumnType::Int)
            .keys(&KEYS)
    })
}

/// Half-year membership buckets. The member list arrives at most twice a
/// year, so expiry statements are trusted per half-year window with one month
/// of slack to obtain the fresh list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MembershipWindow {
    pub current_end: NaiveDate,
    pub previous_end: NaiveDate,
}

pub fn membership_window(today: NaiveDate) -> MembershipWindow {
    let year = today.year();
    if today.month() <= 6 {
        MembershipWindow {
            current_end: NaiveDate::from_ymd_opt(year, 7, 31).expect("valid date"),
            previous_end: NaiveDate::from_ymd_opt(year - 1, 12, 31).expect("valid date"),
        }
    } else {
        MembershipWindow {
            current_end: NaiveDate::from_ymd_opt(year + 1, 1, 31).expect("valid date"),
            previous_end: NaiveDate::from_ymd_opt(year, 6, 30).expect("valid date"),
        }
    }
}

/// Combine the two independently sourced person snapshots into one.
///
/// The license export is authoritative for every identifying column; the
/// profile listing only contributes the license-registry id. The export's
/// organizational phone number (`phone2`) fills in when the personal one is
/// missing.
pub fn merge_license_snapshots(profile_listing: &Table, license_export: &Table) -> Table {
    let profile = collapse_duplicates(profile_listing, &["last_name", "first_name"]);
    let export = collapse_duplicates(license_export, &KEYS);
    if !profile.collisions.is_empty() || !export.collisions.is_empty() {
        debug!(
            profile = profile.collisions.len(),
            export = export.collisions.len(),
            "collapsed duplicate rows while merging license snapshots"
        );
    }

    let name_keys: Vec<String> = vec!["last_name".into(), "first_name".into()];
    let mut registry_ids: BTreeMap<Vec<Value>, Value> = BTreeMap::new();
    for row in profile.table.rows() {
        registry_ids
            .entry(row.key(&name_keys))
            .or_insert_with(|| row.get("license_bvv_id").clone());
    }

    let mut merged = export.table;
    merged.add_column("license_bvv_id");
    for row in merged.rows_mut() {
        if let Some(id) = registry_ids.get(&row.key(&name_keys)) {
            row.set("license_bvv_id", id.clone());
        }
        if row.get("phone").is_null() {
            let fallback = row.get("phone2").clone();
            row.set("phone", fallback);
        }
    }
    merged.drop_column("phone2");
    merged
}

/// Tunable merge behavior for `PersonDirectory::update`.
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Restrict which columns the snapshot may overwrite; all non-key columns
    /// when empty.
    pub columns: Vec<String>,
    /// Drop (and archive) persons missing from the snapshot.
    pub drop_missing: bool,
}

/// Filters for `persons_by_license`.
#[derive(Debug, Clone)]
pub struct LicenseFilter<'a> {
    pub category: &'a str,
    pub types: &'a [&'a str],
    pub only_club_members: bool,
    /// Allow licenses expired/expiring within this many days around today;
    /// only currently valid ones when absent.
    pub max_expire_offset_days: Option<i64>,
    pub wants_higher_license: Option<bool>,
    /// Treat expired licenses as type DK ("no recognized license") when
    /// searching for DK candidates.
    pub treat_expired_as_dk: bool,
}

impl<'a> LicenseFilter<'a> {
    pub fn new(category: &'a str, types: &'a [&'a str]) -> Self {
        Self {
            category,
            types,
            only_club_members: true,
            max_expire_offset_days: None,
            wants_higher_license: None,
            treat_expired_as_dk: true,
        }
    }
}

#[derive(Debug)]
pub struct PersonDirectory {
    store: SnapshotStore,
    data: Table,
    club_name: String,
}

impl PersonDirectory {
    pub fn new(store: SnapshotStore, club_name: impl Into<String>) -> Self {
        Self {
            store,
            data: Table::from_schema(schema()),
            club_name: club_name.into(),
        }
    }

    pub fn data(&self) -> &Table {
        &self.data
    }

    fn defaults(&self, today: NaiveDate) -> BTreeMap<String, Value> {
        let expire = today
            .with_year(today.year() + 1)
            .unwrap_or_else(|| today + chrono::Days::new(365));
        BTreeMap::from([
            ("license_category".to_string(), Value::str("Halle")),
            ("license_type".to_string(), Value::str("DK")),
            ("license_since".to_string(), Value::Date(today)),
            ("license_expire".to_string(), Value::Date(expire)),
            ("club".to_string(), Value::str(self.club_name.clone())),
            ("wants_higher_license".to_string(), Value::Bool(false)),
            ("help_count".to_string(), Value::Int(0)),
            ("failed_higher_license_count".to_string(), Value::Int(0)),
        ])
    }

    /// Coerce + collapse an incoming snapshot, archiving collided rows.
    fn validate(&self, mut table: Table, report: &mut RunReport) -> Result<Table, ReconcileError> {
        let failures = table.conform(schema());
        for failure in &failures {
            warn!(column = %failure.column, error = %failure.error, "nulled unparsable person cell");
        }
        report.add_coercion_failures("persons", &failures);

        let outcome = collapse_duplicates(&table, &KEYS);
        if !outcome.collisions.is_empty() {
            self.store.write_backup(DUPLICATES_BACKUP, &outcome.collisions)?;
            info!(
                rows = outcome.collisions.len(),
                backup = DUPLICATES_BACKUP,
                "collapsed duplicate persons, originals archived"
            );
            report.add_rows(
                "persons",
                "duplicate rows collapsed (most complete kept)",
                outcome.collisions,
            );
        }
        Ok(outcome.table)
    }

    pub fn load(&mut self) -> Result<bool, ReconcileError> {
        match self.store.load_latest(schema())? {
            Some(table) => {
                // hand-edited snapshots may have re-introduced duplicates
                let outcome = collapse_duplicates(&table, &KEYS);
                if !outcome.collisions.is_empty() {
                    self.store.write_backup(DUPLICATES_BACKUP, &outcome.collisions)?;
                }
                self.data = outcome.table;
                Ok(true)
            }
            None => {
                self.data = Table::from_schema(schema());
                Ok(false)
            }
        }
    }

    pub fn save(&mut self, stamp: NaiveDate) -> Result<(), ReconcileError> {
        self.data
            .sort_by(&[("last_name", Order::Asc), ("first_name", Order::Asc)]);
        self.store.save(&self.data, schema(), stamp)?;
        Ok(())
    }

    /// Merge a person snapshot. Persons absent from the snapshot are kept
    /// unless `drop_missing`, in which case they are archived first. Newly
    /// added persons receive the entity defaults (license "DK", club from
    /// config, membership window starting today).
    pub fn update(
        &mut self,
        incoming: Table,
        options: &UpdateOptions,
        today: NaiveDate,
        report: &mut RunReport,
    ) -> Result<(), ReconcileError> {
        if incoming.is_empty() {
            return Ok(());
        }
        let incoming = self.validate(incoming, report)?;

        let update_columns: Vec<String> = if options.columns.is_empty() {
            schema()
                .column_names()
                .filter(|c| !KEYS.contains(c))
                .map(str::to_string)
                .collect()
        } else {
            options.columns.clone()
        };
        let spec = MergeSpec {
            keys: KEYS.iter().map(|k| k.to_string()).collect(),
            update_columns,
            comparison_columns: Vec::new(),
            keep_missing: !options.drop_missing,
            defaults: self.defaults(today),
            force_changed_column: None,
        };

        let outcome = merge_snapshot(&self.data, &incoming, &spec)?;
        if options.drop_missing {
            let removed = outcome.rows_with(RowStatus::Removed);
            if !removed.is_empty() {
                let mut archive = removed;
                archive.sort_by(&[("last_name", Order::Asc), ("first_name", Order::Asc)]);
                self.store.write_backup(DELETED_BACKUP, &archive)?;
                info!(
                    rows = archive.len(),
                    backup = DELETED_BACKUP,
                    "dropped persons missing from snapshot, archived"
                );
                report.add_rows("persons", "dropped because missing from snapshot", archive);
            }
        }

        let keep: Vec<bool> = outcome
            .status
            .iter()
            .map(|s| !(options.drop_missing && *s == RowStatus::Removed))
            .collect();
        let mut merged = outcome.merged;
        let mut index = 0;
        merged.retain(|_| {
            let kept = keep[index];
            index += 1;
            kept
        });

        merged.sort_by(&[("last_name", Order::Asc), ("first_name", Order::Asc)]);
        self.data = merged;
        Ok(())
    }

    /// Recompute `club_membership_expire` against the externally supplied
    /// member list using the half-year bucket rule. Absence from the list can
    /// never extend membership past the last confirmed bucket.
    pub fn update_membership(&mut self, members: Option<&Table>, today: NaiveDate) {
        let window = membership_window(today);

        let mut list: BTreeMap<(String, String, Value), Value> = BTreeMap::new();
        if let Some(members) = members {
            for row in members.rows() {
                let key = member_key(row);
                list.entry(key)
                    .or_insert_with(|| row.get("club_membership_expire").clone());
            }
        }

        for row in self.data.rows_mut() {
            let current = row.get("club_membership_expire").clone();
            let next = match list.get(&member_key(row)) {
                Some(expire) if expire.is_null() => Value::Date(window.current_end),
                Some(expire) => expire.clone(),
                None => match current.as_date() {
                    Some(expire) if expire <= window.previous_end => current.clone(),
                    _ => Value::Date(window.previous_end),
                },
            };
            if next != current {
                debug!(
                    last_name = row.get("last_name").as_str().unwrap_or(""),
                    first_name = row.get("first_name").as_str().unwrap_or(""),
                    from = %current,
                    to = %next,
                    "updated club membership expiry"
                );
                row.set("club_membership_expire", next);
            }
        }
        info!(
            current_end = %window.current_end,
            previous_end = %window.previous_end,
            "recomputed club membership expiry for all persons"
        );
    }

    /// Persons whose membership has not expired (null counts as member).
    pub fn club_members(&self, today: NaiveDate) -> Table {
        self.data.filter(|row| {
            row.get("club_membership_expire")
                .as_date()
                .map_or(true, |expire| expire >= today)
        })
    }

    pub fn persons_by_license(&self, filter: &LicenseFilter<'_>, today: NaiveDate) -> Table {
        let base = if filter.only_club_members {
            self.club_members(today)
        } else {
            self.data.clone()
        };
        let mut base =
            base.filter(|row| row.get("license_category").as_str() == Some(filter.category));

        // an expired license grants nothing, so its holder counts as DK
        if filter.treat_expired_as_dk && matches!(filter.types, ["DK"]) {
            for row in base.rows_mut() {
                if row
                    .get("license_expire")
                    .as_date()
                    .map_or(false, |expire| expire <= today)
                {
                    row.set("license_type", Value::str("DK"));
                    row.set("license_expire", Value::Null);
                    row.set("wants_higher_license", Value::Bool(true));
                }
            }
        }

        let mut selected = base.filter(|row| {
            row.get("license_type")
                .as_str()
                .map_or(false, |ty| filter.types.contains(&ty))
        });

        selected = selected.filter(|row| match row.get("license_expire").as_date() {
            None => true,
            Some(expire) => match filter.max_expire_offset_days {
                Some(offset) => {
                    expire >= today - chrono::Duration::days(offset)
                        && expire <= today + chrono::Duration::days(offset)
                }
                None => expire >= today,
            },
        });

        if let Some(wants) = filter.wants_higher_license {
            selected = selected
                .filter(|row| row.get("wants_higher_license").as_bool().unwrap_or(false) == wants);
        }
        selected
    }

    /// Narrow in-place edit: bump `failed_higher_license_count` for each
    /// listed person.
    pub fn increment_failed_count(&mut self, names: &Table) {
        if names.is_empty() {
            return;
        }
        let keys: Vec<String> = KEYS.iter().map(|k| k.to_string()).collect();
        let unique = collapse_duplicates(names, &KEYS).table;
        for wanted in unique.rows() {
            let key = wanted.key(&keys);
            for row in self.data.rows_mut() {
                if row.key(&keys) == key {
                    let next = row.get("failed_higher_license_count").as_int().unwrap_or(0) + 1;
                    row.set("failed_higher_license_count", Value::Int(next));
                }
            }
        }
    }
}

/// Membership lists come from club software that spells umlauts literally
/// while the portal uses e-notation; fold both sides before matching.
fn member_key(row: &Row) -> (String, String, Value) {
    (
        fold_umlauts(row.get("last_name").as_str().unwrap_or("")),
        fold_umlauts(row.get("first_name").as_str().unwrap_or("")),
        row.get("birthday").clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn mk_directory() -> (PersonDirectory, tempfile::TempDir) {
        let dir = tempdir().expect("tempdir");
        let directory = PersonDirectory::new(
            SnapshotStore::new(dir.path().join("persons"), "persons_data"),
            "TSV Musterstadt",
        );
        (directory, dir)
    }

    fn mk_person(last: &str, first: &str) -> Row {
        Row::new()
            .with("last_name", last)
            .with("first_name", first)
            .with("birthday", date(1990, 1, 1))
    }

    fn mk_incoming(rows: Vec<Row>) -> Table {
        let mut table = Table::from_schema(schema());
        for row in rows {
            table.push(row);
        }
        table
    }

    #[test]
    fn added_person_receives_entity_defaults() {
        let (mut directory, _guard) = mk_directory();
        let mut report = RunReport::new();
        let today = date(2024, 3, 15);

        directory
            .update(
                mk_incoming(vec![mk_person("Doe", "Jane")]),
                &UpdateOptions::default(),
                today,
                &mut report,
            )
            .unwrap();

        let row = &directory.data().rows()[0];
        assert_eq!(row.get("license_type").as_str(), Some("DK"));
        assert_eq!(row.get("license_category").as_str(), Some("Halle"));
        assert_eq!(row.get("club").as_str(), Some("TSV Musterstadt"));
        assert_eq!(row.get("license_since"), &Value::Date(today));
        assert_eq!(
            row.get("license_expire"),
            &Value::Date(date(2025, 3, 15))
        );
        assert_eq!(row.get("help_count"), &Value::Int(0));
        assert_eq!(row.get("wants_higher_license"), &Value::Bool(false));
    }

    #[test]
    fn provided_license_type_beats_default() {
        let (mut directory, _guard) = mk_directory();
        let mut report = RunReport::new();
        let incoming = mk_incoming(vec![mk_person("Doe", "Jane").with("license_type", "C")]);
        directory
            .update(incoming, &UpdateOptions::default(), date(2024, 3, 15), &mut report)
            .unwrap();
        assert_eq!(
            directory.data().rows()[0].get("license_type").as_str(),
            Some("C")
        );
    }

    #[test]
    fn duplicate_incoming_rows_collapse_to_most_complete() {
        let (mut directory, _guard) = mk_directory();
        let mut report = RunReport::new();
        let sparse = mk_person("Doe", "Jane");
        let complete = mk_person("Doe", "Jane").with("mail", "jane@example.org");

        directory
            .update(
                mk_incoming(vec![sparse, complete]),
                &UpdateOptions::default(),
                date(2024, 3, 15),
                &mut report,
            )
            .unwrap();

        assert_eq!(directory.data().len(), 1);
        assert_eq!(
            directory.data().rows()[0].get("mail").as_str(),
            Some("jane@example.org")
        );
        assert_eq!(report.row_sections.len(), 1);
    }

    #[test]
    fn drop_missing_archives_before_deleting() {
        let (mut directory, _guard) = mk_directory();
        let mut report = RunReport::new();
        let today = date(2024, 3, 15);
        directory
            .update(
                mk_incoming(vec![mk_person("Doe", "Jane"), mk_person("Roe", "John")]),
                &UpdateOptions::default(),
                today,
                &mut report,
            )
            .unwrap();

        directory
            .update(
                mk_incoming(vec![mk_person("Doe", "Jane")]),
                &UpdateOptions {
                    drop_missing: true,
                    ..Default::default()
                },
                today,
                &mut report,
            )
            .unwrap();

        assert_eq!(directory.data().len(), 1);
        assert_eq!(
            directory.data().rows()[0].get("last_name").as_str(),
            Some("Doe")
        );
        let backup = directory.store.dir().join("backup").join(DELETED_BACKUP);
        assert!(backup.exists());
    }

    #[test]
    fn license_snapshot_merge_is_left_biased_with_phone_fallback() {
        let mut profile = Table::new(["last_name", "first_name", "license_bvv_id", "city"]);
        profile.push(
            Row::new()
                .with("last_name", "Doe")
                .with("first_name", "Jane")
                .with("license_bvv_id", "bvv-77")
                .with("city", "Profilstadt"),
        );

        let mut export = Table::new([
            "last_name",
            "first_name",
            "birthday",
            "city",
            "phone",
            "phone2",
        ]);
        let mut row = mk_person("Doe", "Jane").with("city", "Exportstadt");
        row.set("phone", Value::Null);
        row.set("phone2", Value::str("089-999"));
        export.push(row);

        let merged = merge_license_snapshots(&profile, &export);
        assert!(!merged.has_column("phone2"));
        let row = &merged.rows()[0];
        // export columns win, profile contributes only the registry id
        assert_eq!(row.get("city").as_str(), Some("Exportstadt"));
        assert_eq!(row.get("license_bvv_id").as_str(), Some("bvv-77"));
        assert_eq!(row.get("phone").as_str(), Some("089-999"));
    }

    #[test]
    fn membership_window_first_half_of_year() {
        let window = membership_window(date(2024, 3, 10));
        assert_eq!(window.current_end, date(2024, 7, 31));
        assert_eq!(window.previous_end, date(2023, 12, 31));
    }

    #[test]
    fn membership_window_second_half_of_year() {
        let window = membership_window(date(2024, 9, 10));
        assert_eq!(window.current_end, date(2025, 1, 31));
        assert_eq!(window.previous_end, date(2024, 6, 30));
    }

    fn directory_with_membership(expire: Value) -> (PersonDirectory, tempfile::TempDir) {
        let (mut directory, guard) = mk_directory();
        let mut report = RunReport::new();
        let mut row = mk_person("Doe", "Jane");
        row.set("club_membership_expire", expire);
        directory
            .update(
                mk_incoming(vec![row]),
                &UpdateOptions::default(),
                date(2024, 3, 15),
                &mut report,
            )
            .unwrap();
        (directory, guard)
    }

    #[test]
    fn member_present_inherits_list_expiry() {
        let (mut directory, _guard) = directory_with_membership(Value::Null);
        let mut members = Table::new(["last_name", "first_name", "birthday", "club_membership_expire"]);
        members.push(mk_person("Doe", "Jane").with("club_membership_expire", date(2026, 6, 30)));

        directory.update_membership(Some(&members), date(2024, 3, 15));
        assert_eq!(
            directory.data().rows()[0].get("club_membership_expire"),
            &Value::Date(date(2026, 6, 30))
        );
    }

    #[test]
    fn member_present_with_null_expiry_gets_current_bucket_end() {
        let (mut directory, _guard) = directory_with_membership(Value::Null);
        let mut members = Table::new(["last_name", "first_name", "birthday", "club_membership_expire"]);
        let mut row = mk_person("Doe", "Jane");
        row.set("club_membership_expire", Value::Null);
        members.push(row);

        directory.update_membership(Some(&members), date(2024, 3, 15));
        assert_eq!(
            directory.data().rows()[0].get("club_membership_expire"),
            &Value::Date(date(2024, 7, 31))
        );
    }

    #[test]
    fn absent_member_collapses_to_previous_bucket_end() {
        // expiry later than the prior bucket cannot survive absence
        let (mut directory, _guard) = directory_with_membership(Value::Date(date(2024, 7, 31)));
        directory.update_membership(Some(&Table::new(["last_name", "first_name", "birthday", "club_membership_expire"])), date(2024, 3, 15));
        assert_eq!(
            directory.data().rows()[0].get("club_membership_expire"),
            &Value::Date(date(2023, 12, 31))
        );
    }

    #[test]
    fn absent_member_with_earlier_expiry_is_untouched() {
        let (mut directory, _guard) = directory_with_membership(Value::Date(date(2023, 6, 30)));
        directory.update_membership(None, date(2024, 3, 15));
        assert_eq!(
            directory.data().rows()[0].get("club_membership_expire"),
            &Value::Date(date(2023, 6, 30))
        );
    }

    #[test]
    fn membership_matching_folds_umlauts() {
        let (mut directory, _guard) = mk_directory();
        let mut report = RunReport::new();
        directory
            .update(
                mk_incoming(vec![mk_person("Mueller", "Joerg")]),
                &UpdateOptions::default(),
                date(2024, 3, 15),
                &mut report,
            )
            .unwrap();

        let mut members = Table::new(["last_name", "first_name", "birthday", "club_membership_expire"]);
        members.push(
            Row::new()
                .with("last_name", "Müller")
                .with("first_name", "Jörg")
                .with("birthday", date(1990, 1, 1))
                .with("club_membership_expire", date(2026, 1, 31)),
        );

        directory.update_membership(Some(&members), date(2024, 3, 15));
        assert_eq!(
            directory.data().rows()[0].get("club_membership_expire"),
            &Value::Date(date(2026, 1, 31))
        );
    }

    #[test]
    fn expired_licenses_count_as_dk_candidates() {
        let (mut directory, _guard) = mk_directory();
        let mut report = RunReport::new();
        let today = date(2024, 6, 1);

        let expired = mk_person("Doe", "Jane")
            .with("license_type", "D")
            .with("license_expire", date(2024, 1, 1));
        let valid = mk_person("Roe", "John")
            .with("license_type", "D")
            .with("license_expire", date(2025, 1, 1));
        directory
            .update(
                mk_incoming(vec![expired, valid]),
                &UpdateOptions::default(),
                today,
                &mut report,
            )
            .unwrap();

        let dk = directory.persons_by_license(&LicenseFilter::new("Halle", &["DK"]), today);
        assert_eq!(dk.len(), 1);
        assert_eq!(dk.rows()[0].get("last_name").as_str(), Some("Doe"));
        assert_eq!(dk.rows()[0].get("wants_higher_license"), &Value::Bool(true));

        let d = directory.persons_by_license(&LicenseFilter::new("Halle", &["D"]), today);
        assert_eq!(d.len(), 1);
        assert_eq!(d.rows()[0].get("last_name").as_str(), Some("Roe"));
    }

    #[test]
    fn failed_count_increments_once_per_person() {
        let (mut directory, _guard) = mk_directory();
        let mut report = RunReport::new();
        directory
            .update(
                mk_incoming(vec![mk_person("Doe", "Jane")]),
                &UpdateOptions::default(),
                date(2024, 3, 15),
                &mut report,
            )
            .unwrap();

        let mut names = Table::new(["last_name", "first_name", "birthday"]);
        names.push(mk_person("Doe", "Jane"));
        names.push(mk_person("Doe", "Jane")); // duplicate must not double-count
        directory.increment_failed_count(&names);

        assert_eq!(
            directory.data().rows()[0].get("failed_higher_license_count"),
            &Value::Int(1)
        );
    }
}
