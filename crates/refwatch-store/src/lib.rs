//! Timestamped CSV snapshot persistence with bounded retention.
//!
//! Each entity dataset is written as `<base>_<date>.csv` (UTF-8 with BOM so
//! spreadsheet tools open it correctly); only the newest files are kept. A run
//! that dies before `save` leaves the previous snapshot untouched, because a
//! save always creates a new file instead of rewriting an old one.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use refwatch_core::{Row, Schema, Table, Value};
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "refwatch-store";

/// Number of snapshot files kept per entity unless configured otherwise.
pub const DEFAULT_KEEP: usize = 2;

const UTF8_BOM: &str = "\u{feff}";
const BACKUP_SUBDIR: &str = "backup";

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
    base_name: String,
    keep: usize,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>, base_name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            base_name: base_name.into(),
            keep: DEFAULT_KEEP,
        }
    }

    pub fn with_keep(mut self, keep: usize) -> Self {
        self.keep = keep.max(1);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load the newest snapshot, pruning files beyond the retention count.
    /// `None` when no snapshot exists yet.
    pub fn load_latest(&self, schema: &Schema) -> Result<Option<Table>> {
        if !self.dir.exists() {
            warn!(dir = %self.dir.display(), base = %self.base_name, "snapshot directory does not exist yet");
            return Ok(None);
        }

        let mut files = self.snapshot_files()?;
        if files.is_empty() {
            warn!(dir = %self.dir.display(), base = %self.base_name, "no snapshot files found");
            return Ok(None);
        }

        // Oldest first by (mtime, name); names carry ISO dates, so the name
        // tiebreak stays chronological.
        files.sort_by(|a, b| (a.1, &a.0).cmp(&(b.1, &b.0)));
        while files.len() > self.keep {
            let (name, _, path) = files.remove(0);
            fs::remove_file(&path)
                .with_context(|| format!("deleting expired snapshot {}", path.display()))?;
            info!(file = %name, "deleted expired snapshot");
        }

        let (name, _, path) = files.last().expect("at least one snapshot file");
        let table = self.read_csv(path, schema)?;
        info!(file = %name, rows = table.len(), "loaded snapshot");
        Ok(Some(table))
    }

    /// Write the table as a new dated snapshot. Empty tables are skipped so a
    /// failed scrape can never shadow real data with an empty file.
    pub fn save(&self, table: &Table, schema: &Schema, stamp: NaiveDate) -> Result<Option<PathBuf>> {
        let name = format!("{}_{}.csv", self.base_name, stamp.format("%Y-%m-%d"));
        if table.is_empty() {
            debug!(file = %name, "skipped saving snapshot because data was empty");
            return Ok(None);
        }

        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating snapshot directory {}", self.dir.display()))?;
        let path = self.dir.join(&name);
        self.write_csv(&path, table, Some(schema))?;
        info!(file = %name, rows = table.len(), "saved snapshot");
        Ok(Some(path))
    }

    /// Write an audit CSV (collapsed duplicates, deleted rows) under
    /// `backup/`. These files are overwritten per run, never pruned.
    pub fn write_backup(&self, name: &str, table: &Table) -> Result<Option<PathBuf>> {
        if table.is_empty() {
            return Ok(None);
        }
        let dir = self.dir.join(BACKUP_SUBDIR);
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating backup directory {}", dir.display()))?;
        let path = dir.join(name);
        self.write_csv(&path, table, None)?;
        info!(file = %path.display(), rows = table.len(), "wrote backup file");
        Ok(Some(path))
    }

    fn snapshot_files(&self) -> Result<Vec<(String, SystemTime, PathBuf)>> {
        let prefix = format!("{}_", self.base_name);
        let mut files = Vec::new();
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("listing snapshot directory {}", self.dir.display()))?;
        for entry in entries {
            let entry = entry.context("reading snapshot directory entry")?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(&prefix) || !name.ends_with(".csv") {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .with_context(|| format!("reading mtime of {}", name))?;
            files.push((name, modified, entry.path()));
        }
        Ok(files)
    }

    fn read_csv(&self, path: &Path, schema: &Schema) -> Result<Table> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading snapshot {}", path.display()))?;
        let text = text.strip_prefix(UTF8_BOM).unwrap_or(&text);

        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(text.as_bytes());
        let headers: Vec<String> = reader
            .headers()
            .with_context(|| format!("reading csv header of {}", path.display()))?
            .iter()
            .map(str::to_string)
            .collect();

        let mut table = Table::new(headers.clone());
        for record in reader.records() {
            let record =
                record.with_context(|| format!("reading csv record in {}", path.display()))?;
            let mut row = Row::new();
            for (column, cell) in headers.iter().zip(record.iter()) {
                row.set(column.clone(), Value::str(unescape_newlines(cell)));
            }
            table.push(row);
        }

        // Snapshot files may have been edited by hand; reindex to the schema
        // and null anything that no longer parses.
        table.align_to(schema);
        for failure in table.conform(schema) {
            warn!(
                file = %path.display(),
                row = failure.row,
                column = %failure.column,
                error = %failure.error,
                "nulled unparsable cell while loading snapshot"
            );
        }
        Ok(table)
    }

    fn write_csv(&self, path: &Path, table: &Table, schema: Option<&Schema>) -> Result<()> {
        // Only declared columns are persisted, in schema order.
        let columns: Vec<&str> = match schema {
            Some(schema) => schema
                .column_names()
                .filter(|c| table.has_column(c))
                .collect(),
            None => table.columns().iter().map(String::as_str).collect(),
        };

        let mut file = fs::File::create(path)
            .with_context(|| format!("creating snapshot file {}", path.display()))?;
        file.write_all(UTF8_BOM.as_bytes())
            .with_context(|| format!("writing BOM to {}", path.display()))?;

        let mut writer = csv::Writer::from_writer(file);
        writer
            .write_record(&columns)
            .with_context(|| format!("writing csv header to {}", path.display()))?;
        for row in table.rows() {
            let record: Vec<String> = columns
                .iter()
                .map(|column| escape_newlines(&row.get(column).to_string()))
                .collect();
            writer
                .write_record(&record)
                .with_context(|| format!("writing csv record to {}", path.display()))?;
        }
        writer
            .flush()
            .with_context(|| format!("flushing {}", path.display()))?;
        Ok(())
    }
}

fn escape_newlines(cell: &str) -> String {
    cell.replace('\n', "\\n")
}

fn unescape_newlines(cell: &str) -> String {
    cell.replace("\\n", "\n")
}
