use std::path::PathBuf;

use polars::prelude::PolarsError;
use thiserror::Error;

/// Run-level failures. Per-product gaps never surface here; they are folded
/// into fallback values in the output tables instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("[{table}] missing columns: {columns:?}")]
    MissingColumns { table: String, columns: Vec<String> },
    #[error("concern rule set is empty")]
    EmptyRules,
    #[error("canonical product universe is empty")]
    EmptyUniverse,
    #[error("{table} empty; check upstream collection and rule inputs")]
    EmptyResult { table: String },
    #[error("no snapshot found in {dir:?} for prefix={prefix}")]
    SnapshotNotFound { dir: PathBuf, prefix: String },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Polars(#[from] PolarsError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn empty_result(table: &str) -> Self {
        PipelineError::EmptyResult {
            table: table.to_string(),
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
