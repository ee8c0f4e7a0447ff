//! Snapshot reconciliation for the referee course portal.
//!
//! Each scheduled run delivers fresh tabular snapshots (courses, persons,
//! registrations). The engine here computes a keyed diff against the locally
//! persisted dataset, applies field-level overwrite rules, and classifies
//! every row as added/changed/unchanged/removed so the notification side
//! reacts exactly once per transition.

pub const CRATE_NAME: &str = "refwatch-reconcile";

pub mod config;
pub mod course;
pub mod engine;
pub mod error;
pub mod person;
pub mod pipeline;
pub mod registration;
pub mod report;
pub mod source;

pub use config::Config;
pub use engine::{merge_snapshot, MergeOutcome, MergeSpec, RowStatus};
pub use error::ReconcileError;
pub use pipeline::{Pipeline, RunSummary};
pub use report::RunReport;
pub use source::{DirSource, SnapshotSource};
