//! Persistence sink and "rows created" notifications
//!
//! - [`RowSink`] durably stores one batch of validated rows and reports
//!   failure synchronously; a failed batch aborts the job.
//! - [`RowNotifier`] broadcasts persisted rows to live clients. Delivery
//!   is best-effort and never fails the import.

use std::sync::Arc;

use async_nats::Client;
use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, warn};

use crate::db::queries;
use crate::error::SinkError;
use crate::types::{JobId, ParsedRow, RowsCreatedEvent, StoredRow};

/// NATS subject for persisted-row broadcasts
pub const ROWS_CREATED_SUBJECT: &str = "import.rows.created";

#[async_trait]
pub trait RowSink: Send + Sync {
    /// Persist one batch. Must not return before the batch is stored or failed.
    async fn save_batch(&self, job_id: JobId, rows: &[ParsedRow]) -> Result<(), SinkError>;
}

#[async_trait]
pub trait RowNotifier: Send + Sync {
    async fn rows_created(&self, job_id: JobId, rows: Vec<StoredRow>);
}

// ==========================================================================
// PostgreSQL sink
// ==========================================================================

pub struct PgRowSink {
    pool: PgPool,
    notifier: Arc<dyn RowNotifier>,
}

impl PgRowSink {
    pub fn new(pool: PgPool, notifier: Arc<dyn RowNotifier>) -> Self {
        Self { pool, notifier }
    }
}

#[async_trait]
impl RowSink for PgRowSink {
    async fn save_batch(&self, job_id: JobId, rows: &[ParsedRow]) -> Result<(), SinkError> {
        let stored = queries::rows::insert_rows(&self.pool, rows).await?;
        debug!("Job {}: persisted batch of {} rows", job_id, stored.len());
        self.notifier.rows_created(job_id, stored).await;
        Ok(())
    }
}

// ==========================================================================
// Notifiers
// ==========================================================================

/// Publishes [`RowsCreatedEvent`] on [`ROWS_CREATED_SUBJECT`]
pub struct NatsRowNotifier {
    client: Client,
}

impl NatsRowNotifier {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RowNotifier for NatsRowNotifier {
    async fn rows_created(&self, job_id: JobId, rows: Vec<StoredRow>) {
        let event = RowsCreatedEvent { job_id, rows };
        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Job {}: failed to encode rows-created event: {}", job_id, e);
                return;
            }
        };
        if let Err(e) = self.client.publish(ROWS_CREATED_SUBJECT, payload.into()).await {
            warn!("Job {}: failed to publish rows-created event: {}", job_id, e);
        }
    }
}

/// For runs without a live-client channel (CLI one-shot imports)
pub struct NoopNotifier;

#[async_trait]
impl RowNotifier for NoopNotifier {
    async fn rows_created(&self, _job_id: JobId, _rows: Vec<StoredRow>) {}
}
