//! Error types for the import pipeline
//!
//! Row-level validation problems are not errors here: they are data
//! (`ValidationError`) and never abort a job. Everything in this module
//! aborts the job it happens in.

use std::error::Error as StdError;

use thiserror::Error;

use crate::types::InvalidTransition;

/// Job state store failure
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("failed to encode or decode job state: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Source file could not be opened or read
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("cannot read source file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid xlsx file: {0}")]
    Xlsx(#[from] calamine::XlsxError),
    #[error("invalid csv file: {0}")]
    Csv(#[from] csv::Error),
    #[error("unsupported file type '{0}', expected .xlsx or .csv")]
    Unsupported(String),
    #[error("row reader stopped unexpectedly: {0}")]
    Reader(String),
}

/// Persistence sink failure
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Anything that aborts a running import
#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("job state store: {0}")]
    Store(#[from] StoreError),
    #[error("failed to persist rows: {0}")]
    Sink(#[from] SinkError),
    #[error("failed to write error artifact")]
    Artifact(#[source] std::io::Error),
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
    #[error("import task did not finish: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Render an error with its full source chain, one cause per line
pub fn error_chain(err: &dyn StdError) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str("\n  caused by: ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
