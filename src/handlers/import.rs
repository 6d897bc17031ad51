//! Import job handlers: submit, status, cancel, list, error log and the
//! grouped read of persisted rows

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_nats::{Client, Subscriber};
use futures::StreamExt;
use serde::Serialize;
use sqlx::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::queries;
use crate::defaults::{DEFAULT_GROUPED_PAGE_LIMIT, MAX_GROUPED_PAGE_LIMIT};
use crate::services::orchestrator::ImportOrchestrator;
use crate::services::source::SourceKind;
use crate::types::{
    CancelOutcome, CancelResponse, ErrorResponse, FileMeta, GroupedRowsRequest, ImportSubmitRequest,
    ImportSubmitResponse, JobErrorsResponse, JobIdRequest, ListByStatusRequest, ListByStatusResponse, Request,
    SuccessResponse,
};

pub const SUBJECT_SUBMIT: &str = "import.submit";
pub const SUBJECT_STATUS: &str = "import.status";
pub const SUBJECT_CANCEL: &str = "import.cancel";
pub const SUBJECT_LIST: &str = "import.list";
pub const SUBJECT_ERRORS: &str = "import.errors";
pub const SUBJECT_ROWS_GROUPED: &str = "import.rows.grouped";

// ==========================================================================
// Reply helpers
// ==========================================================================

async fn reply_json<T: Serialize>(client: &Client, reply: async_nats::Subject, body: &T) {
    let payload = match serde_json::to_vec(body) {
        Ok(payload) => payload,
        Err(e) => {
            error!("Failed to encode reply: {}", e);
            return;
        }
    };
    if let Err(e) = client.publish(reply, payload.into()).await {
        warn!("Failed to publish reply: {}", e);
    }
}

async fn reply_error(
    client: &Client,
    reply: async_nats::Subject,
    request_id: Uuid,
    code: &str,
    message: impl Into<String>,
) {
    reply_json(client, reply, &ErrorResponse::new(request_id, code, message)).await
}

fn extract_request_id(payload: &[u8]) -> Uuid {
    if let Ok(v) = serde_json::from_slice::<serde_json::Value>(payload) {
        if let Some(id_str) = v.get("id").and_then(|id| id.as_str()) {
            if let Ok(uuid) = Uuid::parse_str(id_str) {
                return uuid;
            }
        }
    }
    Uuid::new_v4()
}

// ==========================================================================
// Upload checks
// ==========================================================================

/// Resolve a submitted path to a file inside `upload_dir` with a supported extension
pub async fn prepare_upload(upload_dir: &Path, request: &ImportSubmitRequest) -> Result<FileMeta, String> {
    SourceKind::from_path(&request.file_path, b',').map_err(|e| e.to_string())?;

    let root = tokio::fs::canonicalize(upload_dir)
        .await
        .map_err(|e| format!("upload directory unavailable: {}", e))?;
    let path: PathBuf = tokio::fs::canonicalize(&request.file_path)
        .await
        .map_err(|_| format!("file not found: {}", request.file_path.display()))?;
    if !path.starts_with(&root) {
        return Err("file must be inside the upload directory".to_string());
    }

    let metadata = tokio::fs::metadata(&path)
        .await
        .map_err(|e| format!("cannot stat file: {}", e))?;
    if !metadata.is_file() {
        return Err("path is not a regular file".to_string());
    }

    Ok(FileMeta {
        name: request.file_name.clone(),
        size: request.file_size.unwrap_or(metadata.len()),
        path,
    })
}

/// Resolve `page`/`limit` against their defaults; both must be at least 1
pub fn page_params(request: &GroupedRowsRequest) -> Result<(u32, u32), String> {
    let page = request.page.unwrap_or(1);
    let limit = request.limit.unwrap_or(DEFAULT_GROUPED_PAGE_LIMIT);
    if page == 0 {
        return Err("page must be at least 1".to_string());
    }
    if limit == 0 || limit > MAX_GROUPED_PAGE_LIMIT {
        return Err(format!("limit must be between 1 and {}", MAX_GROUPED_PAGE_LIMIT));
    }
    Ok((page, limit))
}

// ==========================================================================
// Handlers
// ==========================================================================

/// Handle import.submit requests
pub async fn handle_submit(
    client: Client,
    mut subscriber: Subscriber,
    orchestrator: ImportOrchestrator,
    upload_dir: PathBuf,
) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        let reply = match msg.reply {
            Some(ref r) => r.clone(),
            None => continue,
        };

        let request: Request<ImportSubmitRequest> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                warn!("Failed to parse import submit request: {}", e);
                reply_error(&client, reply, extract_request_id(&msg.payload), "INVALID_REQUEST", e.to_string()).await;
                continue;
            }
        };

        let file = match prepare_upload(&upload_dir, &request.payload).await {
            Ok(file) => file,
            Err(message) => {
                warn!("Rejected import of {}: {}", request.payload.file_path.display(), message);
                reply_error(&client, reply, request.id, "INVALID_FILE", message).await;
                continue;
            }
        };

        match orchestrator.submit(file).await {
            Ok(submitted) => {
                let response = ImportSubmitResponse {
                    job_id: submitted.job_id,
                    message: "Import job accepted".to_string(),
                    status_subject: SUBJECT_STATUS.to_string(),
                };
                reply_json(&client, reply, &SuccessResponse::new(request.id, response)).await;
            }
            Err(e) => {
                error!("Failed to submit import job: {}", e);
                reply_error(&client, reply, request.id, "SUBMIT_ERROR", e.to_string()).await;
            }
        }
    }

    Ok(())
}

/// Handle import.status requests
pub async fn handle_status(client: Client, mut subscriber: Subscriber, orchestrator: ImportOrchestrator) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        let reply = match msg.reply {
            Some(ref r) => r.clone(),
            None => continue,
        };

        let request: Request<JobIdRequest> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                reply_error(&client, reply, extract_request_id(&msg.payload), "INVALID_REQUEST", e.to_string()).await;
                continue;
            }
        };

        match orchestrator.get(request.payload.job_id).await {
            Ok(Some(job)) => reply_json(&client, reply, &SuccessResponse::new(request.id, job)).await,
            Ok(None) => {
                reply_error(&client, reply, request.id, "NOT_FOUND", "Import job not found").await;
            }
            Err(e) => {
                error!("Failed to read import job {}: {}", request.payload.job_id, e);
                reply_error(&client, reply, request.id, "STORE_ERROR", e.to_string()).await;
            }
        }
    }

    Ok(())
}

/// Handle import.cancel requests
pub async fn handle_cancel(client: Client, mut subscriber: Subscriber, orchestrator: ImportOrchestrator) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        let reply = match msg.reply {
            Some(ref r) => r.clone(),
            None => continue,
        };

        let request: Request<JobIdRequest> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                reply_error(&client, reply, extract_request_id(&msg.payload), "INVALID_REQUEST", e.to_string()).await;
                continue;
            }
        };

        let job_id = request.payload.job_id;
        match orchestrator.cancel(job_id).await {
            Ok(outcome) => {
                let message = match outcome {
                    CancelOutcome::Requested => "Cancellation requested",
                    CancelOutcome::NotFound => "Import job not found",
                    CancelOutcome::AlreadyFinished => "Import job already finished",
                };
                info!("Cancel request for job {}: {:?}", job_id, outcome);
                let response = CancelResponse {
                    job_id,
                    outcome,
                    message: message.to_string(),
                };
                reply_json(&client, reply, &SuccessResponse::new(request.id, response)).await;
            }
            Err(e) => {
                error!("Failed to cancel import job {}: {}", job_id, e);
                reply_error(&client, reply, request.id, "STORE_ERROR", e.to_string()).await;
            }
        }
    }

    Ok(())
}

/// Handle import.list requests
pub async fn handle_list(client: Client, mut subscriber: Subscriber, orchestrator: ImportOrchestrator) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        let reply = match msg.reply {
            Some(ref r) => r.clone(),
            None => continue,
        };

        let request: Request<ListByStatusRequest> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                reply_error(&client, reply, extract_request_id(&msg.payload), "INVALID_REQUEST", e.to_string()).await;
                continue;
            }
        };

        let status = request.payload.status;
        match orchestrator.jobs_with_status(status).await {
            Ok(job_ids) => {
                let response = ListByStatusResponse { status, job_ids };
                reply_json(&client, reply, &SuccessResponse::new(request.id, response)).await;
            }
            Err(e) => {
                error!("Failed to list '{}' import jobs: {}", status, e);
                reply_error(&client, reply, request.id, "STORE_ERROR", e.to_string()).await;
            }
        }
    }

    Ok(())
}

/// Handle import.errors requests
pub async fn handle_errors(client: Client, mut subscriber: Subscriber, orchestrator: ImportOrchestrator) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        let reply = match msg.reply {
            Some(ref r) => r.clone(),
            None => continue,
        };

        let request: Request<JobIdRequest> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                reply_error(&client, reply, extract_request_id(&msg.payload), "INVALID_REQUEST", e.to_string()).await;
                continue;
            }
        };

        let job_id = request.payload.job_id;
        match orchestrator.errors(job_id).await {
            Ok(errors) => {
                let response = JobErrorsResponse { job_id, errors };
                reply_json(&client, reply, &SuccessResponse::new(request.id, response)).await;
            }
            Err(e) => {
                error!("Failed to read error log of job {}: {}", job_id, e);
                reply_error(&client, reply, request.id, "STORE_ERROR", e.to_string()).await;
            }
        }
    }

    Ok(())
}

/// Handle import.rows.grouped requests
pub async fn handle_rows_grouped(client: Client, mut subscriber: Subscriber, pool: PgPool) -> Result<()> {
    while let Some(msg) = subscriber.next().await {
        let reply = match msg.reply {
            Some(ref r) => r.clone(),
            None => continue,
        };

        let request: Request<GroupedRowsRequest> = match serde_json::from_slice(&msg.payload) {
            Ok(req) => req,
            Err(e) => {
                reply_error(&client, reply, extract_request_id(&msg.payload), "INVALID_REQUEST", e.to_string()).await;
                continue;
            }
        };

        let (page, limit) = match page_params(&request.payload) {
            Ok(params) => params,
            Err(message) => {
                reply_error(&client, reply, request.id, "INVALID_REQUEST", message).await;
                continue;
            }
        };

        match queries::rows::grouped_by_date(&pool, page, limit).await {
            Ok(response) => reply_json(&client, reply, &SuccessResponse::new(request.id, response)).await,
            Err(e) => {
                error!("Failed to read grouped rows (page {}, limit {}): {}", page, limit, e);
                reply_error(&client, reply, request.id, "DATABASE_ERROR", e.to_string()).await;
            }
        }
    }

    Ok(())
}
