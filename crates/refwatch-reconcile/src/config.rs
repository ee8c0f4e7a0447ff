//! Run configuration, loaded once per run from a YAML file and read-only
//! thereafter. The dynamic key-path lookups of earlier tooling are pinned
//! down to typed fields here.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use refwatch_store::DEFAULT_KEEP;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub general: GeneralConfig,
    #[serde(default)]
    pub reminders: ReminderConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Root directory for snapshots, backups and reports.
    pub data_dir: PathBuf,
    /// Club name stamped onto newly added persons.
    pub club_name: String,
    /// Districts the club cares about; used by the trigger consumer to filter
    /// newly added courses.
    #[serde(default)]
    pub districts: Vec<String>,
    /// Snapshot files kept per entity.
    #[serde(default = "default_keep_snapshots")]
    pub keep_snapshots: usize,
}

/// Reminder day offsets consumed by the notification trigger side; carried in
/// the same file so one config describes a run.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ReminderConfig {
    #[serde(default)]
    pub management_days_before_deregistration_end: Vec<i64>,
    #[serde(default)]
    pub player_days_before_course_start: Vec<i64>,
}

fn default_keep_snapshots() -> usize {
    DEFAULT_KEEP
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }
}
