//! Job state store
//!
//! Two layers:
//! - [`StateStore`] is the raw backend: TTL-capable string keys, lists
//!   and sets (Redis in production, [`MemoryStateStore`] in tests and
//!   one-shot CLI runs).
//! - [`JobStore`] owns the key-space and speaks in job types.
//!
//! ## Keys
//! - `import:job:<id>:status`   - JSON `ImportJob`
//! - `import:job:<id>:progress` - JSON `Progress`
//! - `import:job:<id>:errors`   - list of JSON `ValidationError`
//! - `import:job:<id>:abort`    - `"1"` when cancellation was requested
//! - `import:status:<status>`   - set of job ids currently in that status
//!
//! Writes are last-write-wins per key. Nothing here is atomic across
//! keys; the status record and the status-set membership are updated
//! as independent operations.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::StoreError;
use crate::types::{ImportJob, JobId, JobStatus, Progress, ValidationError};

const KEY_PREFIX: &str = "import";
const ABORT_SENTINEL: &str = "1";

/// Raw key/value backend with lists and sets
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Set a string value; `None` keeps it until overwritten
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Append to the tail of a list, refreshing the list's TTL
    async fn push(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Whole list, head to tail
    async fn range(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn add_member(&self, key: &str, member: &str) -> Result<(), StoreError>;

    async fn remove_member(&self, key: &str, member: &str) -> Result<(), StoreError>;

    async fn members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Backend name for logs
    fn name(&self) -> &'static str;
}

// ==========================================================================
// In-memory backend
// ==========================================================================

enum Slot {
    Value(String),
    List(Vec<String>),
    Set(BTreeSet<String>),
}

struct Entry {
    slot: Slot,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Process-local backend. Expired keys are dropped lazily on access.
#[derive(Clone, Default)]
pub struct MemoryStateStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_live<R>(&self, key: &str, f: impl FnOnce(Option<&mut Entry>) -> R) -> R {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
        }
        f(entries.get_mut(key))
    }
}

fn deadline(ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|ttl| Instant::now() + ttl)
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                slot: Slot::Value(value),
                expires_at: deadline(ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.with_live(key, |entry| match entry.map(|e| &e.slot) {
            Some(Slot::Value(v)) => Some(v.clone()),
            _ => None,
        }))
    }

    async fn push(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError> {
        let pushed = self.with_live(key, |entry| match entry {
            Some(Entry { slot: Slot::List(items), expires_at }) => {
                items.push(value.clone());
                if ttl.is_some() {
                    *expires_at = deadline(ttl);
                }
                true
            }
            _ => false,
        });
        if !pushed {
            self.entries.lock().insert(
                key.to_string(),
                Entry {
                    slot: Slot::List(vec![value]),
                    expires_at: deadline(ttl),
                },
            );
        }
        Ok(())
    }

    async fn range(&self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.with_live(key, |entry| match entry.map(|e| &e.slot) {
            Some(Slot::List(items)) => items.clone(),
            _ => Vec::new(),
        }))
    }

    async fn add_member(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let added = self.with_live(key, |entry| match entry.map(|e| &mut e.slot) {
            Some(Slot::Set(set)) => {
                set.insert(member.to_string());
                true
            }
            _ => false,
        });
        if !added {
            self.entries.lock().insert(
                key.to_string(),
                Entry {
                    slot: Slot::Set(BTreeSet::from([member.to_string()])),
                    expires_at: None,
                },
            );
        }
        Ok(())
    }

    async fn remove_member(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.with_live(key, |entry| {
            if let Some(Slot::Set(set)) = entry.map(|e| &mut e.slot) {
                set.remove(member);
            }
        });
        Ok(())
    }

    async fn members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.with_live(key, |entry| match entry.map(|e| &e.slot) {
            Some(Slot::Set(set)) => set.iter().cloned().collect(),
            _ => Vec::new(),
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ==========================================================================
// Typed job store
// ==========================================================================

/// Job-level view of a [`StateStore`]
#[derive(Clone)]
pub struct JobStore {
    backend: Arc<dyn StateStore>,
    retention: Duration,
}

impl JobStore {
    /// `retention` applies to progress, error-log and abort keys; status
    /// records take their TTL per `put`.
    pub fn new(backend: Arc<dyn StateStore>, retention: Duration) -> Self {
        Self { backend, retention }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    fn job_key(job_id: JobId, suffix: &str) -> String {
        format!("{}:job:{}:{}", KEY_PREFIX, job_id, suffix)
    }

    fn status_set_key(status: JobStatus) -> String {
        format!("{}:status:{}", KEY_PREFIX, status)
    }

    /// Write the full status record. The progress snapshot is never part
    /// of the stored record; it lives under its own key.
    pub async fn put(&self, job_id: JobId, job: &ImportJob, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut record = job.clone();
        record.progress = None;
        let json = serde_json::to_string(&record)?;
        self.backend.set(&Self::job_key(job_id, "status"), json, ttl).await
    }

    /// Status record with the latest progress snapshot attached
    pub async fn get(&self, job_id: JobId) -> Result<Option<ImportJob>, StoreError> {
        let Some(json) = self.backend.get(&Self::job_key(job_id, "status")).await? else {
            return Ok(None);
        };
        let mut job: ImportJob = serde_json::from_str(&json)?;
        job.progress = self.progress(job_id).await?;
        Ok(Some(job))
    }

    pub async fn add_to_status_set(&self, status: JobStatus, job_id: JobId) -> Result<(), StoreError> {
        self.backend
            .add_member(&Self::status_set_key(status), &job_id.to_string())
            .await
    }

    pub async fn remove_from_status_set(&self, status: JobStatus, job_id: JobId) -> Result<(), StoreError> {
        self.backend
            .remove_member(&Self::status_set_key(status), &job_id.to_string())
            .await
    }

    /// Move a job between status sets (remove, then add)
    pub async fn move_status(&self, job_id: JobId, from: JobStatus, to: JobStatus) -> Result<(), StoreError> {
        self.remove_from_status_set(from, job_id).await?;
        self.add_to_status_set(to, job_id).await
    }

    /// Ids in a status set. Members whose record has expired are pruned.
    pub async fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<JobId>, StoreError> {
        let key = Self::status_set_key(status);
        let mut ids = Vec::new();
        for member in self.backend.members(&key).await? {
            let Ok(job_id) = member.parse::<JobId>() else {
                self.backend.remove_member(&key, &member).await?;
                continue;
            };
            if self.backend.get(&Self::job_key(job_id, "status")).await?.is_none() {
                debug!("Pruning expired job {} from '{}' set", job_id, status);
                self.backend.remove_member(&key, &member).await?;
                continue;
            }
            ids.push(job_id);
        }
        Ok(ids)
    }

    pub async fn put_progress(&self, job_id: JobId, progress: &Progress) -> Result<(), StoreError> {
        let json = serde_json::to_string(progress)?;
        self.backend
            .set(&Self::job_key(job_id, "progress"), json, Some(self.retention))
            .await
    }

    pub async fn progress(&self, job_id: JobId) -> Result<Option<Progress>, StoreError> {
        match self.backend.get(&Self::job_key(job_id, "progress")).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub async fn append_error(&self, job_id: JobId, error: &ValidationError) -> Result<(), StoreError> {
        let json = serde_json::to_string(error)?;
        self.backend
            .push(&Self::job_key(job_id, "errors"), json, Some(self.retention))
            .await
    }

    /// Error log in row order
    pub async fn errors(&self, job_id: JobId) -> Result<Vec<ValidationError>, StoreError> {
        self.backend
            .range(&Self::job_key(job_id, "errors"))
            .await?
            .iter()
            .map(|json| serde_json::from_str(json).map_err(StoreError::from))
            .collect()
    }

    pub async fn request_cancel(&self, job_id: JobId) -> Result<(), StoreError> {
        self.backend
            .set(&Self::job_key(job_id, "abort"), ABORT_SENTINEL.to_string(), Some(self.retention))
            .await
    }

    /// Only the exact sentinel counts; anything else means "continue"
    pub async fn is_cancel_requested(&self, job_id: JobId) -> Result<bool, StoreError> {
        Ok(self
            .backend
            .get(&Self::job_key(job_id, "abort"))
            .await?
            .is_some_and(|v| v == ABORT_SENTINEL))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FileMeta;
    use chrono::Utc;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn store() -> (MemoryStateStore, JobStore) {
        let backend = MemoryStateStore::new();
        let jobs = JobStore::new(Arc::new(backend.clone()), Duration::from_secs(60));
        (backend, jobs)
    }

    fn job(id: JobId) -> ImportJob {
        ImportJob::new(
            id,
            FileMeta {
                name: "a.xlsx".into(),
                size: 10,
                path: PathBuf::from("/tmp/a.xlsx"),
            },
            Utc::now(),
        )
    }

    // ==========================================================================
    // MemoryStateStore
    // ==========================================================================

    #[tokio::test]
    async fn test_memory_value_expires() {
        let store = MemoryStateStore::new();
        store.set("k", "v".into(), Some(Duration::from_millis(20))).await.unwrap();
        store.set("forever", "v".into(), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.get("forever").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn test_memory_list_keeps_order() {
        let store = MemoryStateStore::new();
        for v in ["a", "b", "c"] {
            store.push("list", v.into(), None).await.unwrap();
        }
        assert_eq!(store.range("list").await.unwrap(), vec!["a", "b", "c"]);
        assert!(store.range("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_set_membership() {
        let store = MemoryStateStore::new();
        store.add_member("s", "x").await.unwrap();
        store.add_member("s", "x").await.unwrap();
        store.add_member("s", "y").await.unwrap();
        store.remove_member("s", "x").await.unwrap();
        assert_eq!(store.members("s").await.unwrap(), vec!["y"]);
    }

    // ==========================================================================
    // JobStore
    // ==========================================================================

    #[tokio::test]
    async fn test_put_and_get_roundtrip_with_progress() {
        let (_, jobs) = store();
        let id = Uuid::new_v4();
        let record = job(id);
        jobs.put(id, &record, Some(jobs.retention())).await.unwrap();
        assert_eq!(jobs.get(id).await.unwrap(), Some(record.clone()));

        let progress = Progress { processed: 100, valid: 90, errors: 10 };
        jobs.put_progress(id, &progress).await.unwrap();
        let loaded = jobs.get(id).await.unwrap().unwrap();
        assert_eq!(loaded.progress, Some(progress));
    }

    #[tokio::test]
    async fn test_progress_never_stored_in_status_record() {
        let (backend, jobs) = store();
        let id = Uuid::new_v4();
        let mut record = job(id);
        record.progress = Some(Progress { processed: 1, valid: 1, errors: 0 });
        jobs.put(id, &record, None).await.unwrap();

        let raw = backend.get(&format!("import:job:{}:status", id)).await.unwrap().unwrap();
        assert!(!raw.contains("progress"));
    }

    #[tokio::test]
    async fn test_get_missing_job() {
        let (_, jobs) = store();
        assert!(jobs.get(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_status_record_expires_with_ttl() {
        let (_, jobs) = store();
        let id = Uuid::new_v4();
        jobs.put(id, &job(id), Some(Duration::from_millis(10))).await.unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert!(jobs.get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_move_status_keeps_job_in_one_set() {
        let (_, jobs) = store();
        let id = Uuid::new_v4();
        jobs.put(id, &job(id), None).await.unwrap();
        jobs.add_to_status_set(JobStatus::Pending, id).await.unwrap();
        jobs.move_status(id, JobStatus::Pending, JobStatus::Processing).await.unwrap();

        assert!(jobs.jobs_with_status(JobStatus::Pending).await.unwrap().is_empty());
        assert_eq!(jobs.jobs_with_status(JobStatus::Processing).await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_jobs_with_status_prunes_expired_records() {
        let (_, jobs) = store();
        let id = Uuid::new_v4();
        jobs.add_to_status_set(JobStatus::Completed, id).await.unwrap();
        assert!(jobs.jobs_with_status(JobStatus::Completed).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_error_log_in_row_order() {
        let (_, jobs) = store();
        let id = Uuid::new_v4();
        for row in [2, 3, 9] {
            jobs.append_error(id, &ValidationError { row_number: row, messages: vec!["bad".into()] })
                .await
                .unwrap();
        }
        let rows: Vec<u64> = jobs.errors(id).await.unwrap().iter().map(|e| e.row_number).collect();
        assert_eq!(rows, vec![2, 3, 9]);
    }

    #[tokio::test]
    async fn test_cancel_flag_sentinel_only() {
        let (backend, jobs) = store();
        let id = Uuid::new_v4();
        assert!(!jobs.is_cancel_requested(id).await.unwrap());

        backend.set(&format!("import:job:{}:abort", id), "yes".into(), None).await.unwrap();
        assert!(!jobs.is_cancel_requested(id).await.unwrap());

        jobs.request_cancel(id).await.unwrap();
        assert!(jobs.is_cancel_requested(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_jobs_do_not_interfere() {
        let (_, jobs) = store();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        jobs.put_progress(a, &Progress { processed: 5, valid: 5, errors: 0 }).await.unwrap();
        jobs.request_cancel(b).await.unwrap();
        assert!(jobs.progress(b).await.unwrap().is_none());
        assert!(!jobs.is_cancel_requested(a).await.unwrap());
    }
}
