//! Import orchestrator
//!
//! Owns the job lifecycle. `submit` only writes the `pending` record and
//! spawns a tracked task; the task drives `pending -> processing ->
//! completed | cancelled | failed` around one [`StreamingParser`] pass.
//!
//! Each job has exactly one writer (its task), so status records are
//! rewritten whole without coordination. Status-set moves and record
//! writes are separate operations and may be observed out of step.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::defaults::DEFAULT_MAX_CONCURRENT_JOBS;
use crate::error::{error_chain, ImportError, StoreError};
use crate::services::job_store::JobStore;
use crate::services::parser::{ParseSummary, StreamingParser};
use crate::services::source::{RowStream, SourceKind};
use crate::types::{
    CancelOutcome, FileMeta, ImportJob, JobEvent, JobFailure, JobId, JobStatus, ValidationError,
};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_concurrent_jobs: usize,
    pub csv_delimiter: u8,
    /// Store the full error chain on failed jobs
    pub expose_error_detail: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: DEFAULT_MAX_CONCURRENT_JOBS,
            csv_delimiter: b',',
            expose_error_detail: false,
        }
    }
}

// ==========================================================================
// Source file guard
// ==========================================================================

/// Removes the uploaded file when dropped, on every exit path of a job
pub struct SourceFileGuard {
    path: PathBuf,
}

impl SourceFileGuard {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Drop for SourceFileGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed source file {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove source file {}: {}", self.path.display(), e),
        }
    }
}

// ==========================================================================
// Handles
// ==========================================================================

/// Returned by [`ImportOrchestrator::submit`]
pub struct SubmittedJob {
    pub job_id: JobId,
    pub handle: JobHandle,
}

/// Completion handle of a running job. Dropping it detaches the job.
pub struct JobHandle {
    inner: JoinHandle<Result<ImportJob, ImportError>>,
}

impl JobHandle {
    /// Wait for the job to reach a terminal state
    pub async fn wait(self) -> Result<ImportJob, ImportError> {
        self.inner.await?
    }
}

// ==========================================================================
// Orchestrator
// ==========================================================================

#[derive(Clone)]
pub struct ImportOrchestrator {
    store: JobStore,
    parser: Arc<StreamingParser>,
    limiter: Arc<Semaphore>,
    tracker: TaskTracker,
    settings: OrchestratorSettings,
}

impl ImportOrchestrator {
    pub fn new(store: JobStore, parser: StreamingParser, settings: OrchestratorSettings) -> Self {
        Self {
            store,
            parser: Arc::new(parser),
            limiter: Arc::new(Semaphore::new(settings.max_concurrent_jobs.max(1))),
            tracker: TaskTracker::new(),
            settings,
        }
    }

    /// Register a job and start it in the background. Does not touch the file.
    pub async fn submit(&self, file: FileMeta) -> Result<SubmittedJob, StoreError> {
        let job_id = Uuid::new_v4();
        let job = ImportJob::new(job_id, file, Utc::now());

        self.store.put(job_id, &job, Some(self.store.retention())).await?;
        self.store.add_to_status_set(JobStatus::Pending, job_id).await?;
        info!("Import job {} submitted: {} ({} bytes)", job_id, job.file.name, job.file.size);

        let worker = self.clone();
        let inner = self.tracker.spawn(async move {
            let result = worker.run_job(job).await;
            if let Err(e) = &result {
                error!("Job {}: lifecycle aborted: {}", job_id, error_chain(e));
            }
            result
        });

        Ok(SubmittedJob {
            job_id,
            handle: JobHandle { inner },
        })
    }

    /// Raise the abort flag of a non-terminal job
    pub async fn cancel(&self, job_id: JobId) -> Result<CancelOutcome, StoreError> {
        let Some(job) = self.store.get(job_id).await? else {
            return Ok(CancelOutcome::NotFound);
        };
        if job.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyFinished);
        }
        self.store.request_cancel(job_id).await?;
        info!("Job {}: cancellation requested while {}", job_id, job.status);
        Ok(CancelOutcome::Requested)
    }

    pub async fn get(&self, job_id: JobId) -> Result<Option<ImportJob>, StoreError> {
        self.store.get(job_id).await
    }

    pub async fn errors(&self, job_id: JobId) -> Result<Vec<ValidationError>, StoreError> {
        self.store.errors(job_id).await
    }

    pub async fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<JobId>, StoreError> {
        self.store.jobs_with_status(status).await
    }

    /// Stop accepting work and wait for every running job
    pub async fn shutdown(&self) {
        self.tracker.close();
        if !self.tracker.is_empty() {
            info!("Waiting for {} import job(s) to finish", self.tracker.len());
        }
        self.tracker.wait().await;
    }

    // ==========================================================================
    // Job task
    // ==========================================================================

    async fn run_job(&self, mut job: ImportJob) -> Result<ImportJob, ImportError> {
        let _source = SourceFileGuard::new(job.file.path.clone());
        let job_id = job.id;

        // Waiting jobs stay pending; the semaphore is never closed.
        let _permit = self.limiter.clone().acquire_owned().await.ok();

        self.transition(&mut job, JobEvent::Started).await?;
        info!("Job {}: processing {}", job_id, job.file.path.display());

        let event = match self.parse(&job).await {
            Ok(summary) if summary.cancelled => {
                info!(
                    "Job {}: cancelled after {} rows ({} valid, {} errors)",
                    job_id, summary.processed_count, summary.valid_count, summary.error_count
                );
                JobEvent::Cancelled(summary.results())
            }
            Ok(summary) => {
                info!(
                    "Job {}: completed, {} rows ({} valid, {} errors)",
                    job_id, summary.processed_count, summary.valid_count, summary.error_count
                );
                if let Some(path) = &summary.artifact {
                    info!("Job {}: error report written to {}", job_id, path.display());
                }
                JobEvent::Completed(summary.results())
            }
            Err(e) => {
                let chain = error_chain(&e);
                error!("Job {}: failed: {}", job_id, chain);
                JobEvent::Failed(JobFailure {
                    message: e.to_string(),
                    detail: self.settings.expose_error_detail.then_some(chain),
                })
            }
        };
        self.transition(&mut job, event).await?;

        Ok(self.store.get(job_id).await?.unwrap_or(job))
    }

    async fn parse(&self, job: &ImportJob) -> Result<ParseSummary, ImportError> {
        let kind = SourceKind::from_path(&job.file.path, self.settings.csv_delimiter)?;
        let rows = RowStream::open(job.file.path.clone(), kind);
        let job_id = job.id;
        self.parser
            .run(rows, job_id, |p| {
                debug!("Job {}: {} rows processed ({} valid)", job_id, p.processed, p.valid)
            })
            .await
    }

    /// Apply `event`, rewrite the full record and move the status-set membership
    async fn transition(&self, job: &mut ImportJob, event: JobEvent) -> Result<(), ImportError> {
        let from = job.apply(event, Utc::now())?;
        self.store.put(job.id, job, Some(self.store.retention())).await?;
        self.store.move_status(job.id, from, job.status).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SinkError;
    use crate::services::job_store::MemoryStateStore;
    use crate::services::parser::ParserSettings;
    use crate::services::sink::RowSink;
    use crate::services::validation::{RowValidator, ValidationConfig};
    use crate::types::ParsedRow;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::path::Path;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        rows: Mutex<Vec<ParsedRow>>,
    }

    #[async_trait]
    impl RowSink for RecordingSink {
        async fn save_batch(&self, _job_id: JobId, rows: &[ParsedRow]) -> Result<(), SinkError> {
            self.rows.lock().extend_from_slice(rows);
            Ok(())
        }
    }

    struct Fixture {
        uploads: tempfile::TempDir,
        results: tempfile::TempDir,
        store: JobStore,
        sink: Arc<RecordingSink>,
        orchestrator: ImportOrchestrator,
    }

    fn fixture(expose_error_detail: bool) -> Fixture {
        let uploads = tempfile::tempdir().unwrap();
        let results = tempfile::tempdir().unwrap();
        let store = JobStore::new(Arc::new(MemoryStateStore::new()), Duration::from_secs(60));
        let sink = Arc::new(RecordingSink::default());
        let parser = StreamingParser::new(
            store.clone(),
            RowValidator::new(ValidationConfig::default()),
            sink.clone(),
            ParserSettings {
                batch_size: 2,
                progress_interval: 1,
                results_dir: results.path().to_path_buf(),
            },
        );
        let orchestrator = ImportOrchestrator::new(
            store.clone(),
            parser,
            OrchestratorSettings {
                expose_error_detail,
                ..Default::default()
            },
        );
        Fixture {
            uploads,
            results,
            store,
            sink,
            orchestrator,
        }
    }

    fn upload(dir: &Path, name: &str, content: &str) -> FileMeta {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        FileMeta {
            name: name.to_string(),
            size: content.len() as u64,
            path,
        }
    }

    const THREE_ROWS: &str = "id,name,date\n1,Ada,01.01.2000\n2,,01.01.2000\n3,Cy,31.12.3000\n";

    #[tokio::test]
    async fn test_completed_job_end_to_end() {
        let fx = fixture(false);
        let file = upload(fx.uploads.path(), "rows.csv", THREE_ROWS);
        let path = file.path.clone();

        let submitted = fx.orchestrator.submit(file).await.unwrap();
        let job = submitted.handle.wait().await.unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        let results = job.results.unwrap();
        assert_eq!((results.total_processed, results.valid_rows, results.error_count), (3, 1, 2));
        assert!(job.started_at.is_some() && job.completed_at.is_some());
        assert!(job.failed_at.is_none());
        assert_eq!(job.progress.unwrap().processed, 3);
        assert!(!path.exists());
        assert_eq!(fx.sink.rows.lock().len(), 1);

        let id = submitted.job_id;
        assert_eq!(fx.orchestrator.jobs_with_status(JobStatus::Completed).await.unwrap(), vec![id]);
        assert!(fx.orchestrator.jobs_with_status(JobStatus::Pending).await.unwrap().is_empty());
        assert!(fx.orchestrator.jobs_with_status(JobStatus::Processing).await.unwrap().is_empty());

        let report = fx.results.path().join(format!("result-{}.txt", id));
        assert_eq!(
            std::fs::read_to_string(report).unwrap(),
            "2 - Name cannot be empty\n3 - Date cannot be in the future"
        );
        assert_eq!(fx.orchestrator.errors(id).await.unwrap().len(), 2);
        assert_eq!(fx.orchestrator.cancel(id).await.unwrap(), CancelOutcome::AlreadyFinished);
    }

    #[tokio::test]
    async fn test_submit_writes_pending_record() {
        let fx = fixture(false);
        let file = upload(fx.uploads.path(), "rows.csv", THREE_ROWS);

        let submitted = fx.orchestrator.submit(file).await.unwrap();
        let pending = fx.store.get(submitted.job_id).await.unwrap().unwrap();
        assert_eq!(pending.status, JobStatus::Pending);
        assert_eq!(
            fx.store.jobs_with_status(JobStatus::Pending).await.unwrap(),
            vec![submitted.job_id]
        );

        submitted.handle.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_unsupported_file_fails_and_is_removed() {
        let fx = fixture(false);
        let file = upload(fx.uploads.path(), "rows.txt", THREE_ROWS);
        let path = file.path.clone();

        let job = fx.orchestrator.submit(file).await.unwrap().handle.wait().await.unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        let failure = job.error.unwrap();
        assert!(failure.message.contains("unsupported file type"));
        assert!(failure.detail.is_none());
        assert!(job.failed_at.is_some());
        assert!(job.results.is_none());
        assert!(!path.exists());
        assert_eq!(fx.store.jobs_with_status(JobStatus::Failed).await.unwrap(), vec![job.id]);
    }

    #[tokio::test]
    async fn test_missing_file_failure_detail_in_development() {
        let fx = fixture(true);
        let file = FileMeta {
            name: "gone.csv".to_string(),
            size: 0,
            path: fx.uploads.path().join("gone.csv"),
        };

        let job = fx.orchestrator.submit(file).await.unwrap().handle.wait().await.unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        let detail = job.error.unwrap().detail.unwrap();
        assert!(detail.starts_with("cannot read source file"));
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let fx = fixture(false);
        let file = upload(fx.uploads.path(), "rows.csv", THREE_ROWS);
        let path = file.path.clone();

        let submitted = fx.orchestrator.submit(file).await.unwrap();
        let outcome = fx.orchestrator.cancel(submitted.job_id).await.unwrap();
        assert_eq!(outcome, CancelOutcome::Requested);

        let job = submitted.handle.wait().await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        let results = job.results.unwrap();
        assert_eq!(results.total_processed, 0);
        assert_eq!(results.valid_rows + results.error_count, results.total_processed);
        assert!(!path.exists());
        assert!(fx.sink.rows.lock().is_empty());
        assert_eq!(fx.store.jobs_with_status(JobStatus::Cancelled).await.unwrap(), vec![job.id]);
    }

    #[tokio::test]
    async fn test_cancel_unknown_job() {
        let fx = fixture(false);
        let outcome = fx.orchestrator.cancel(Uuid::new_v4()).await.unwrap();
        assert_eq!(outcome, CancelOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_detached_jobs() {
        let fx = fixture(false);
        let mut ids = Vec::new();
        for i in 0..3 {
            let file = upload(fx.uploads.path(), &format!("rows-{}.csv", i), THREE_ROWS);
            ids.push(fx.orchestrator.submit(file).await.unwrap().job_id);
        }

        fx.orchestrator.shutdown().await;

        for id in ids {
            let job = fx.store.get(id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Completed);
        }
        assert_eq!(fx.sink.rows.lock().len(), 3);
    }

    #[test]
    fn test_source_guard_ignores_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.xlsx");
        std::fs::write(&path, b"x").unwrap();
        drop(SourceFileGuard::new(path.clone()));
        assert!(!path.exists());
        drop(SourceFileGuard::new(path));
    }
}
