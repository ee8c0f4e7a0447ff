//! Per-run report accumulator.
//!
//! One `RunReport` is created per scheduled run and threaded through the
//! reconcilers (no global accumulators). It collects everything an operator
//! needs to fix source data before the next run: collapsed duplicates,
//! dropped or ambiguous rows, nulled cells, and general notes. The report is
//! written as a JSON artifact next to the snapshots.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use refwatch_core::{CoercionFailure, Table};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

/// Rows that were dropped, collapsed, or otherwise need operator attention.
#[derive(Debug, Serialize)]
pub struct RowSection {
    pub entity: String,
    pub reason: String,
    pub rows: Table,
}

#[derive(Debug, Serialize)]
pub struct NulledCell {
    pub entity: String,
    pub row: usize,
    pub column: String,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub notes: Vec<String>,
    pub row_sections: Vec<RowSection>,
    pub nulled_cells: Vec<NulledCell>,
}

impl RunReport {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            notes: Vec::new(),
            row_sections: Vec::new(),
            nulled_cells: Vec::new(),
        }
    }

    pub fn add_note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    pub fn add_rows(&mut self, entity: &str, reason: &str, rows: Table) {
        if rows.is_empty() {
            return;
        }
        self.row_sections.push(RowSection {
            entity: entity.to_string(),
            reason: reason.to_string(),
            rows,
        });
    }

    pub fn add_coercion_failures(&mut self, entity: &str, failures: &[CoercionFailure]) {
        for failure in failures {
            self.nulled_cells.push(NulledCell {
                entity: entity.to_string(),
                row: failure.row,
                column: failure.column.clone(),
                detail: failure.error.to_string(),
            });
        }
    }

    /// Serialize into `<dir>/<run_id>.json`.
    pub fn write_json(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating reports directory {}", dir.display()))?;
        let path = dir.join(format!("{}.json", self.run_id));
        let json = serde_json::to_string_pretty(self).context("serializing run report")?;
        fs::write(&path, json)
            .with_context(|| format!("writing run report {}", path.display()))?;
        info!(report = %path.display(), "wrote run report");
        Ok(path)
    }
}

impl Default for RunReport {
    fn default() -> Self {
        Self::new()
    }
}
