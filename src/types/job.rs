//! Import job record and its lifecycle
//!
//! A job moves `pending → processing → {completed | cancelled | failed}`.
//! Every status change goes through [`ImportJob::apply`], which is the
//! only place that knows the allowed edges.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Job identifier (random v4 UUID)
pub type JobId = Uuid;

/// Current status of an import job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Cancelled,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Cancelled,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::Failed
        )
    }

    /// Whether `self → next` is one of the four allowed edges
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Cancelled)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown job status '{}'", s))
    }
}

/// Uploaded file the job reads from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
    pub path: PathBuf,
}

/// Running counters, published while the job is processing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub processed: u64,
    pub valid: u64,
    pub errors: u64,
}

/// Final counters, set once when the job reaches `completed` or `cancelled`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResults {
    pub total_processed: u64,
    pub valid_rows: u64,
    pub error_count: u64,
}

/// Failure description stored on a `failed` job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFailure {
    pub message: String,
    /// Full error chain; only populated in development
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Something that happened to a job
#[derive(Debug, Clone)]
pub enum JobEvent {
    Started,
    Completed(JobResults),
    Cancelled(JobResults),
    Failed(JobFailure),
}

impl JobEvent {
    fn target(&self) -> JobStatus {
        match self {
            JobEvent::Started => JobStatus::Processing,
            JobEvent::Completed(_) => JobStatus::Completed,
            JobEvent::Cancelled(_) => JobStatus::Cancelled,
            JobEvent::Failed(_) => JobStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid job transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Status record of one import job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportJob {
    pub id: JobId,
    pub status: JobStatus,
    pub file: FileMeta,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    /// Latest snapshot, attached on read from its own key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<JobResults>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
}

impl ImportJob {
    pub fn new(id: JobId, file: FileMeta, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            status: JobStatus::Pending,
            file,
            created_at,
            started_at: None,
            completed_at: None,
            failed_at: None,
            progress: None,
            results: None,
            error: None,
        }
    }

    /// Apply `event` at time `at`. Returns the status the job left.
    ///
    /// Timestamps and results are only ever assigned here, once, on the
    /// edge that introduces them.
    pub fn apply(&mut self, event: JobEvent, at: DateTime<Utc>) -> Result<JobStatus, InvalidTransition> {
        let from = self.status;
        let to = event.target();
        if !from.can_transition_to(to) {
            return Err(InvalidTransition { from, to });
        }

        match event {
            JobEvent::Started => self.started_at = Some(at),
            JobEvent::Completed(results) | JobEvent::Cancelled(results) => {
                self.results = Some(results);
                self.completed_at = Some(at);
            }
            JobEvent::Failed(failure) => {
                self.error = Some(failure);
                self.failed_at = Some(at);
            }
        }
        self.status = to;
        Ok(from)
    }
}
