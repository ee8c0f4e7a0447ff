//! One scheduled reconciliation run, end to end.
//!
//! The pipeline wires the three entity reconcilers to a `SnapshotSource`,
//! guards against degenerate snapshots, and persists everything plus a run
//! report at the end. A single entity failing (or its feed missing) never
//! takes the run down; that dataset is left exactly as loaded.

use std::path::PathBuf;

use chrono::{DateTime, Local, NaiveDate, Utc};
use refwatch_core::{Table, Value};
use refwatch_store::SnapshotStore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::course::CourseCatalog;
use crate::error::ReconcileError;
use crate::person::{merge_license_snapshots, PersonDirectory, UpdateOptions};
use crate::registration::RegistrationLedger;
use crate::report::RunReport;
use crate::source::SnapshotSource;

const COURSES_BASE: &str = "courses_data";
const REGISTRATIONS_BASE: &str = "registrations_data";
const PERSONS_BASE: &str = "persons_data";

/// What one run did, for the operator-facing summary line.
#[derive(Debug)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub new_courses: usize,
    pub persons: usize,
    pub registrations_added: usize,
    pub registrations_changed: usize,
    pub registrations_removed: usize,
    pub report_path: PathBuf,
}

pub struct Pipeline {
    config: Config,
}

impl Pipeline {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run one reconciliation against today's date.
    pub fn run_once(&self, source: &dyn SnapshotSource) -> Result<RunSummary, ReconcileError> {
        self.run_at(source, Local::now().date_naive())
    }

    pub fn run_at(
        &self,
        source: &dyn SnapshotSource,
        today: NaiveDate,
    ) -> Result<RunSummary, ReconcileError> {
        let general = &self.config.general;
        let keep = general.keep_snapshots;
        let course_dir = general.data_dir.join("courses");
        let person_dir = general.data_dir.join("persons");

        let mut courses = CourseCatalog::new(
            SnapshotStore::new(&course_dir, COURSES_BASE).with_keep(keep),
        );
        let mut registrations = RegistrationLedger::new(
            SnapshotStore::new(&course_dir, REGISTRATIONS_BASE).with_keep(keep),
        );
        let mut persons = PersonDirectory::new(
            SnapshotStore::new(&person_dir, PERSONS_BASE).with_keep(keep),
            general.club_name.clone(),
        );

        courses.load()?;
        registrations.load()?;
        persons.load()?;

        let mut report = RunReport::new();
        info!(run_id = %report.run_id, %today, "reconciliation run started");

        let new_courses = self.reconcile_courses(source, &mut courses, &mut report)?;
        self.reconcile_registrations(source, &mut registrations, &courses, &mut report)?;
        self.complete_deep_data(source, &mut courses, &registrations, &mut report)?;
        self.reconcile_persons(source, &mut persons, today, &mut report)?;

        // saving resets the registration lifecycle column, count first
        let registrations_added = registrations.added().len();
        let registrations_changed = registrations.changed(false).len();
        let registrations_removed = registrations.removed().len();

        courses.save(today)?;
        registrations.save(today)?;
        persons.save(today)?;

        let report_path = report.write_json(&general.data_dir.join("reports"))?;
        let summary = RunSummary {
            run_id: report.run_id,
            started_at: report.started_at,
            finished_at: Utc::now(),
            new_courses: new_courses.len(),
            persons: persons.data().len(),
            registrations_added,
            registrations_changed,
            registrations_removed,
            report_path,
        };
        info!(
            run_id = %summary.run_id,
            new_courses = summary.new_courses,
            registrations_added = summary.registrations_added,
            registrations_changed = summary.registrations_changed,
            registrations_removed = summary.registrations_removed,
            "reconciliation run finished"
        );
        Ok(summary)
    }

    fn reconcile_courses(
        &self,
        source: &dyn SnapshotSource,
        courses: &mut CourseCatalog,
        report: &mut RunReport,
    ) -> Result<Table, ReconcileError> {
        let incoming = match self.take_feed("courses", source.courses(), report) {
            Some(table) => table,
            None => return Ok(Table::new(Vec::<String>::new())),
        };
        match courses.update(incoming, report) {
            Ok(added) => Ok(added),
            Err(error) => {
                self.skip_entity("courses", &error, report);
                Ok(Table::new(Vec::<String>::new()))
            }
        }
    }

    fn reconcile_registrations(
        &self,
        source: &dyn SnapshotSource,
        registrations: &mut RegistrationLedger,
        courses: &CourseCatalog,
        report: &mut RunReport,
    ) -> Result<(), ReconcileError> {
        let incoming = match self.take_feed("registrations", source.registrations(), report) {
            Some(table) => table,
            None => return Ok(()),
        };
        if let Err(error) = registrations.update(incoming, report) {
            self.skip_entity("registrations", &error, report);
            return Ok(());
        }
        registrations.insert_course_id(courses.data(), report);
        Ok(())
    }

    /// Courses referenced by a registration but still lacking all deep fields
    /// get a secondary detail fetch.
    fn complete_deep_data(
        &self,
        source: &dyn SnapshotSource,
        courses: &mut CourseCatalog,
        registrations: &RegistrationLedger,
        report: &mut RunReport,
    ) -> Result<(), ReconcileError> {
        let mut referenced: Vec<String> = registrations
            .data()
            .rows()
            .iter()
            .filter_map(|row| row.get("course_id").as_str().map(str::to_string))
            .collect();
        referenced.sort_unstable();
        referenced.dedup();

        let wanted = courses.courses_needing_deep_data(&referenced);
        if wanted.is_empty() {
            return Ok(());
        }
        let ids: Vec<Value> = wanted.iter().map(Value::str).collect();
        let details = source
            .course_details(&ids)
            .map_err(ReconcileError::from)?;
        match details {
            Some(details) if !details.is_empty() => {
                info!(courses = wanted.len(), "completing deep course data");
                courses.apply_course_details(details, report)?;
            }
            _ => {
                warn!(courses = wanted.len(), "deep course data wanted but not delivered");
                report.add_note(format!(
                    "{} courses lack deep data and no detail feed was delivered",
                    wanted.len()
                ));
            }
        }
        Ok(())
    }

    fn reconcile_persons(
        &self,
        source: &dyn SnapshotSource,
        persons: &mut PersonDirectory,
        today: NaiveDate,
        report: &mut RunReport,
    ) -> Result<(), ReconcileError> {
        let export = self.take_feed("license export", source.license_export(), report);
        if let Some(export) = export {
            let incoming = match self.take_feed("profile listing", source.profile_listing(), report)
            {
                Some(profile) => merge_license_snapshots(&profile, &export),
                None => export,
            };
            if let Err(error) = persons.update(incoming, &UpdateOptions::default(), today, report)
            {
                self.skip_entity("persons", &error, report);
                return Ok(());
            }
        }

        match source.membership_list().map_err(ReconcileError::from)? {
            Some(members) if !members.is_empty() => {
                persons.update_membership(Some(&members), today);
            }
            Some(_) => {
                warn!("membership list delivered empty, expiry left untouched");
                report.add_note("membership list delivered empty; expiry left untouched");
            }
            None => {}
        }
        Ok(())
    }

    /// Unwrap one feed. An absent feed is routine; an empty one is a failed
    /// scrape and must not be allowed to mass-remove a dataset.
    fn take_feed(
        &self,
        name: &str,
        feed: anyhow::Result<Option<Table>>,
        report: &mut RunReport,
    ) -> Option<Table> {
        match feed {
            Ok(Some(table)) if table.is_empty() => {
                warn!(feed = name, "snapshot feed arrived empty, leaving dataset untouched");
                report.add_note(format!("{name} snapshot was empty; dataset left untouched"));
                None
            }
            Ok(Some(table)) => Some(table),
            Ok(None) => None,
            Err(error) => {
                warn!(feed = name, %error, "snapshot feed failed, leaving dataset untouched");
                report.add_note(format!("{name} snapshot failed: {error:#}"));
                None
            }
        }
    }

    fn skip_entity(&self, entity: &str, error: &ReconcileError, report: &mut RunReport) {
        warn!(entity, %error, "entity update failed, dataset left as loaded");
        report.add_note(format!("{entity} update failed: {error}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GeneralConfig, ReminderConfig};
    use anyhow::Result;
    use refwatch_core::Row;
    use tempfile::tempdir;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[derive(Default)]
    struct FakeSource {
        courses: Option<Table>,
        registrations: Option<Table>,
        license_export: Option<Table>,
        profile_listing: Option<Table>,
        members: Option<Table>,
        course_details: Option<Table>,
    }

    impl SnapshotSource for FakeSource {
        fn courses(&self) -> Result<Option<Table>> {
            Ok(self.courses.clone())
        }
        fn course_details(&self, _ids: &[Value]) -> Result<Option<Table>> {
            Ok(self.course_details.clone())
        }
        fn registrations(&self) -> Result<Option<Table>> {
            Ok(self.registrations.clone())
        }
        fn license_export(&self) -> Result<Option<Table>> {
            Ok(self.license_export.clone())
        }
        fn profile_listing(&self) -> Result<Option<Table>> {
            Ok(self.profile_listing.clone())
        }
        fn membership_list(&self) -> Result<Option<Table>> {
            Ok(self.members.clone())
        }
    }

    fn mk_pipeline(data_dir: &std::path::Path) -> Pipeline {
        Pipeline::new(Config {
            general: GeneralConfig {
                data_dir: data_dir.to_path_buf(),
                club_name: "TSV Musterstadt".to_string(),
                districts: vec!["Oberbayern".to_string()],
                keep_snapshots: 2,
            },
            reminders: ReminderConfig::default(),
        })
    }

    fn mk_course_table() -> Table {
        let mut table = Table::new(["id", "district", "label", "registration_end"]);
        table.push(
            Row::new()
                .with("id", "7")
                .with("district", "Oberbayern")
                .with("label", "K-101")
                .with("registration_end", "2024-03-01"),
        );
        table
    }

    fn mk_registration_table() -> Table {
        let mut table = Table::new([
            "course_label",
            "last_name",
            "first_name",
            "birthday",
            "registration_status",
        ]);
        table.push(
            Row::new()
                .with("course_label", "K-101")
                .with("last_name", "Doe")
                .with("first_name", "Jane")
                .with("birthday", "1990-01-01")
                .with("registration_status", "approved"),
        );
        table
    }

    fn mk_license_table() -> Table {
        let mut table = Table::new(["last_name", "first_name", "birthday", "license_type"]);
        table.push(
            Row::new()
                .with("last_name", "Doe")
                .with("first_name", "Jane")
                .with("birthday", "1990-01-01")
                .with("license_type", "D"),
        );
        table
    }

    #[test]
    fn full_run_persists_all_entities_and_a_report() {
        let dir = tempdir().expect("tempdir");
        let pipeline = mk_pipeline(dir.path());
        let source = FakeSource {
            courses: Some(mk_course_table()),
            registrations: Some(mk_registration_table()),
            license_export: Some(mk_license_table()),
            ..FakeSource::default()
        };

        let summary = pipeline.run_at(&source, date(2024, 3, 15)).unwrap();
        assert_eq!(summary.new_courses, 1);
        assert_eq!(summary.persons, 1);
        assert_eq!(summary.registrations_added, 1);
        assert!(summary.report_path.exists());
        assert!(dir
            .path()
            .join("courses")
            .join("courses_data_2024-03-15.csv")
            .exists());
        assert!(dir
            .path()
            .join("courses")
            .join("registrations_data_2024-03-15.csv")
            .exists());
        assert!(dir
            .path()
            .join("persons")
            .join("persons_data_2024-03-15.csv")
            .exists());
    }

    #[test]
    fn second_run_with_same_feeds_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let pipeline = mk_pipeline(dir.path());
        let source = FakeSource {
            courses: Some(mk_course_table()),
            registrations: Some(mk_registration_table()),
            license_export: Some(mk_license_table()),
            ..FakeSource::default()
        };

        pipeline.run_at(&source, date(2024, 3, 15)).unwrap();
        let second = pipeline.run_at(&source, date(2024, 3, 16)).unwrap();
        assert_eq!(second.new_courses, 0);
        assert_eq!(second.registrations_added, 0);
        assert_eq!(second.registrations_changed, 0);
        assert_eq!(second.registrations_removed, 0);
    }

    #[test]
    fn empty_feed_leaves_the_dataset_untouched() {
        let dir = tempdir().expect("tempdir");
        let pipeline = mk_pipeline(dir.path());
        let seeded = FakeSource {
            registrations: Some(mk_registration_table()),
            courses: Some(mk_course_table()),
            ..FakeSource::default()
        };
        pipeline.run_at(&seeded, date(2024, 3, 15)).unwrap();

        // a failed scrape shows up as an empty table, not a missing feed
        let broken = FakeSource {
            registrations: Some(Table::new([
                "course_label",
                "last_name",
                "first_name",
                "birthday",
                "registration_status",
            ])),
            ..FakeSource::default()
        };
        let summary = pipeline.run_at(&broken, date(2024, 3, 16)).unwrap();
        assert_eq!(summary.registrations_removed, 0);
    }

    #[test]
    fn absent_feeds_still_produce_a_run_report() {
        let dir = tempdir().expect("tempdir");
        let pipeline = mk_pipeline(dir.path());
        let summary = pipeline
            .run_at(&FakeSource::default(), date(2024, 3, 15))
            .unwrap();
        assert!(summary.report_path.exists());
        assert_eq!(summary.new_courses, 0);
    }
}
