//! NATS message handlers

pub mod import;

use anyhow::Result;
use async_nats::Client;
use sqlx::PgPool;
use tokio::select;
use tracing::{error, info};

use crate::config::Config;
use crate::services::orchestrator::ImportOrchestrator;

/// Serve the import control subjects until Ctrl-C or a handler exits
pub async fn start_handlers(
    client: Client,
    orchestrator: ImportOrchestrator,
    pool: PgPool,
    config: &Config,
) -> Result<()> {
    // Subscribe to all subjects
    let submit_sub = client.subscribe(import::SUBJECT_SUBMIT).await?;
    let status_sub = client.subscribe(import::SUBJECT_STATUS).await?;
    let cancel_sub = client.subscribe(import::SUBJECT_CANCEL).await?;
    let list_sub = client.subscribe(import::SUBJECT_LIST).await?;
    let errors_sub = client.subscribe(import::SUBJECT_ERRORS).await?;
    let grouped_sub = client.subscribe(import::SUBJECT_ROWS_GROUPED).await?;

    info!(
        "Subscribed to {}, {}, {}, {}, {}, {}",
        import::SUBJECT_SUBMIT,
        import::SUBJECT_STATUS,
        import::SUBJECT_CANCEL,
        import::SUBJECT_LIST,
        import::SUBJECT_ERRORS,
        import::SUBJECT_ROWS_GROUPED
    );

    let client_submit = client.clone();
    let orchestrator_submit = orchestrator.clone();
    let upload_dir = config.upload_dir.clone();
    let submit_handle = tokio::spawn(async move {
        import::handle_submit(client_submit, submit_sub, orchestrator_submit, upload_dir).await
    });

    let client_status = client.clone();
    let orchestrator_status = orchestrator.clone();
    let status_handle = tokio::spawn(async move {
        import::handle_status(client_status, status_sub, orchestrator_status).await
    });

    let client_cancel = client.clone();
    let orchestrator_cancel = orchestrator.clone();
    let cancel_handle = tokio::spawn(async move {
        import::handle_cancel(client_cancel, cancel_sub, orchestrator_cancel).await
    });

    let client_list = client.clone();
    let orchestrator_list = orchestrator.clone();
    let list_handle = tokio::spawn(async move {
        import::handle_list(client_list, list_sub, orchestrator_list).await
    });

    let client_errors = client.clone();
    let orchestrator_errors = orchestrator.clone();
    let errors_handle = tokio::spawn(async move {
        import::handle_errors(client_errors, errors_sub, orchestrator_errors).await
    });

    let client_grouped = client.clone();
    let grouped_handle = tokio::spawn(async move {
        import::handle_rows_grouped(client_grouped, grouped_sub, pool).await
    });

    let abort_handles = [
        submit_handle.abort_handle(),
        status_handle.abort_handle(),
        cancel_handle.abort_handle(),
        list_handle.abort_handle(),
        errors_handle.abort_handle(),
        grouped_handle.abort_handle(),
    ];

    info!("All handlers started, waiting for messages...");

    // Wait for shutdown or for any handler to finish
    select! {
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("Shutdown signal received, no longer accepting imports"),
                Err(e) => error!("Failed to listen for shutdown signal: {}", e),
            }
        }
        result = submit_handle => {
            error!("Import submit handler finished: {:?}", result);
        }
        result = status_handle => {
            error!("Import status handler finished: {:?}", result);
        }
        result = cancel_handle => {
            error!("Import cancel handler finished: {:?}", result);
        }
        result = list_handle => {
            error!("Import list handler finished: {:?}", result);
        }
        result = errors_handle => {
            error!("Import errors handler finished: {:?}", result);
        }
        result = grouped_handle => {
            error!("Grouped rows handler finished: {:?}", result);
        }
    }

    for handle in abort_handles {
        handle.abort();
    }

    Ok(())
}
