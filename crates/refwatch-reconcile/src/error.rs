//! Error taxonomy for reconciliation runs.
//!
//! Only structural failures surface as errors: a snapshot missing one of its
//! key columns aborts that entity's run and leaves the previous dataset
//! untouched. Row-level problems (unparsable cells, duplicate keys, dangling
//! course labels) are recovered in place and aggregated into the run report.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("incoming snapshot is missing key column `{column}`")]
    MissingKeyColumn { column: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
