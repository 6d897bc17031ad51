//! Streaming parser and batcher
//!
//! Single pass over a [`RowStream`]: each row is validated, valid rows are
//! buffered and flushed to the [`RowSink`] in fixed-size batches, invalid
//! rows go to the job's error log and the error artifact. Progress is
//! published every `progress_interval` rows, independent of batching.
//!
//! The abort flag is polled once per row. Rows after a cancellation are
//! never validated or persisted.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use crate::defaults::{DEFAULT_BATCH_SIZE, DEFAULT_PROGRESS_INTERVAL};
use crate::error::ImportError;
use crate::services::artifact::ErrorArtifact;
use crate::services::job_store::JobStore;
use crate::services::sink::RowSink;
use crate::services::source::RowStream;
use crate::services::validation::RowValidator;
use crate::types::{JobId, JobResults, ParsedRow, Progress, ValidationError};

#[derive(Debug, Clone)]
pub struct ParserSettings {
    pub batch_size: usize,
    pub progress_interval: u64,
    pub results_dir: PathBuf,
}

impl Default for ParserSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            results_dir: PathBuf::from("."),
        }
    }
}

/// Outcome of one pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseSummary {
    pub processed_count: u64,
    pub valid_count: u64,
    pub error_count: u64,
    pub cancelled: bool,
    /// `result-<jobId>.txt`, present when at least one row was rejected
    pub artifact: Option<PathBuf>,
}

impl ParseSummary {
    pub fn results(&self) -> JobResults {
        JobResults {
            total_processed: self.processed_count,
            valid_rows: self.valid_count,
            error_count: self.error_count,
        }
    }
}

pub struct StreamingParser {
    store: JobStore,
    validator: RowValidator,
    sink: Arc<dyn RowSink>,
    settings: ParserSettings,
}

impl StreamingParser {
    pub fn new(store: JobStore, validator: RowValidator, sink: Arc<dyn RowSink>, settings: ParserSettings) -> Self {
        Self {
            store,
            validator,
            sink,
            settings,
        }
    }

    /// Consume `rows` for `job_id`. `on_progress` sees every published snapshot.
    ///
    /// Any read, store, sink or artifact fault aborts the pass. Batches
    /// flushed before the fault stay persisted.
    pub async fn run<F>(&self, mut rows: RowStream, job_id: JobId, mut on_progress: F) -> Result<ParseSummary, ImportError>
    where
        F: FnMut(&Progress) + Send,
    {
        let mut artifact = ErrorArtifact::new(&self.settings.results_dir, job_id);

        match self.consume(&mut rows, job_id, &mut artifact, &mut on_progress).await {
            Ok(mut summary) => {
                summary.artifact = artifact.finish().await.map_err(ImportError::Artifact)?;
                Ok(summary)
            }
            Err(e) => {
                artifact.discard().await;
                Err(e)
            }
        }
    }

    async fn consume<F>(
        &self,
        rows: &mut RowStream,
        job_id: JobId,
        artifact: &mut ErrorArtifact,
        on_progress: &mut F,
    ) -> Result<ParseSummary, ImportError>
    where
        F: FnMut(&Progress) + Send,
    {
        let batch_size = self.settings.batch_size.max(1);
        let interval = self.settings.progress_interval.max(1);
        let mut batch: Vec<ParsedRow> = Vec::with_capacity(batch_size);
        let mut progress = Progress::default();
        let mut cancelled = false;

        while let Some(next) = rows.next_row().await {
            if self.store.is_cancel_requested(job_id).await? {
                info!("Job {}: cancellation requested after {} rows", job_id, progress.processed);
                cancelled = true;
                break;
            }
            let raw = next?;
            let row_number = progress.processed + 1;

            let validation = self.validator.validate(&raw);
            match validation.row {
                Some(row) if validation.errors.is_empty() => {
                    batch.push(row);
                    progress.valid += 1;
                }
                _ => {
                    let error = ValidationError {
                        row_number,
                        messages: validation.errors,
                    };
                    self.store.append_error(job_id, &error).await?;
                    artifact.append(&error).await.map_err(ImportError::Artifact)?;
                    progress.errors += 1;
                }
            }
            progress.processed += 1;

            if batch.len() >= batch_size {
                self.flush(job_id, &mut batch).await?;
            }
            if progress.processed % interval == 0 {
                self.publish(job_id, &progress, on_progress).await?;
            }
        }

        // The pending tail is persisted on cancellation too, so valid
        // counts always match what reached the sink.
        self.flush(job_id, &mut batch).await?;
        self.publish(job_id, &progress, on_progress).await?;

        Ok(ParseSummary {
            processed_count: progress.processed,
            valid_count: progress.valid,
            error_count: progress.errors,
            cancelled,
            artifact: None,
        })
    }

    async fn flush(&self, job_id: JobId, batch: &mut Vec<ParsedRow>) -> Result<(), ImportError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.sink.save_batch(job_id, batch).await?;
        debug!("Job {}: flushed batch of {} rows", job_id, batch.len());
        batch.clear();
        Ok(())
    }

    async fn publish<F>(&self, job_id: JobId, progress: &Progress, on_progress: &mut F) -> Result<(), ImportError>
    where
        F: FnMut(&Progress) + Send,
    {
        self.store.put_progress(job_id, progress).await?;
        on_progress(progress);
        Ok(())
    }
}
