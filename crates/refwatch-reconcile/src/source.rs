//! Where fresh snapshots come from.
//!
//! The pipeline only sees the `SnapshotSource` trait, so tests feed it
//! in-memory tables while production drops portal exports into an inbox
//! directory. `Ok(None)` means "nothing fetched this run" and the pipeline
//! leaves the corresponding dataset alone.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use refwatch_core::{Row, Table, Value};
use tracing::debug;

pub trait SnapshotSource {
    fn courses(&self) -> Result<Option<Table>>;
    /// Detail pages for the given course ids; listing pages leave most course
    /// fields empty.
    fn course_details(&self, ids: &[Value]) -> Result<Option<Table>>;
    fn registrations(&self) -> Result<Option<Table>>;
    /// The license administration export, the authoritative person listing.
    fn license_export(&self) -> Result<Option<Table>>;
    /// The public profile listing; only source of the license registry id.
    fn profile_listing(&self) -> Result<Option<Table>>;
    /// Club member list, supplied out of band at most twice a year.
    fn membership_list(&self) -> Result<Option<Table>>;
}

/// Reads snapshots dropped as CSV files into one inbox directory. A missing
/// file is not an error; that feed simply was not delivered this run.
#[derive(Debug, Clone)]
pub struct DirSource {
    inbox: PathBuf,
}

impl DirSource {
    pub fn new(inbox: impl Into<PathBuf>) -> Self {
        Self {
            inbox: inbox.into(),
        }
    }

    fn read_optional(&self, name: &str) -> Result<Option<Table>> {
        let path = self.inbox.join(name);
        if !path.exists() {
            debug!(file = name, "no snapshot file in inbox");
            return Ok(None);
        }
        read_csv_table(&path).map(Some)
    }
}

impl SnapshotSource for DirSource {
    fn courses(&self) -> Result<Option<Table>> {
        self.read_optional("courses.csv")
    }

    fn course_details(&self, _ids: &[Value]) -> Result<Option<Table>> {
        self.read_optional("course_details.csv")
    }

    fn registrations(&self) -> Result<Option<Table>> {
        self.read_optional("registrations.csv")
    }

    fn license_export(&self) -> Result<Option<Table>> {
        self.read_optional("licenses.csv")
    }

    fn profile_listing(&self) -> Result<Option<Table>> {
        self.read_optional("profiles.csv")
    }

    fn membership_list(&self) -> Result<Option<Table>> {
        self.read_optional("members.csv")
    }
}

/// Read a CSV file into an all-string table. Typing happens later when the
/// entity reconciler conforms the table to its schema.
pub fn read_csv_table(path: &Path) -> Result<Table> {
    let file =
        File::open(path).with_context(|| format!("opening snapshot {}", path.display()))?;
    let mut reader = csv::Reader::from_reader(file);

    let headers: Vec<String> = reader
        .headers()
        .with_context(|| format!("reading header of {}", path.display()))?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect();

    let mut table = Table::new(headers.clone());
    for record in reader.records() {
        let record =
            record.with_context(|| format!("reading record from {}", path.display()))?;
        let mut row = Row::new();
        for (header, cell) in headers.iter().zip(record.iter()) {
            let value = if cell.is_empty() {
                Value::Null
            } else {
                Value::str(cell.replace("\\n", "\n"))
            };
            row.set(header.clone(), value);
        }
        table.push(row);
    }
    debug!(file = %path.display(), rows = table.len(), "read snapshot file");
    Ok(table)
}
