//! Configuration management

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{self, Context, Result};
use chrono::NaiveDate;

use crate::defaults::{
    DEFAULT_BATCH_SIZE, DEFAULT_JOB_RETENTION_SECS, DEFAULT_MAX_CONCURRENT_JOBS, DEFAULT_PROGRESS_INTERVAL,
};
use crate::services::validation::{default_min_date, ValidationConfig};

/// `REDIS_URL` value selecting the in-process store
pub const MEMORY_STORE_URL: &str = "memory";

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// NATS server URL
    pub nats_url: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Job state store backend, or `memory`
    pub redis_url: String,

    /// Retention window for every job key
    pub job_retention: Duration,

    /// Submitted files must live under this directory
    pub upload_dir: PathBuf,

    /// Where `result-<jobId>.txt` reports are written
    pub results_dir: PathBuf,

    pub batch_size: usize,
    pub progress_interval: u64,
    pub max_concurrent_jobs: usize,
    pub csv_delimiter: u8,

    pub validation: ValidationConfig,

    /// `APP_ENV=development` stores full failure detail on jobs
    pub development: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let nats_url = get("NATS_URL").unwrap_or_else(|| "nats://localhost:4222".to_string());

        let database_url = get("DATABASE_URL").context("DATABASE_URL must be set")?;

        let redis_url = get("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".to_string());

        let retention_secs: u64 = parse_or(&get, "IMPORT_JOB_TIMEOUT", DEFAULT_JOB_RETENTION_SECS)?;
        if retention_secs == 0 {
            anyhow::bail!("IMPORT_JOB_TIMEOUT must be greater than zero");
        }

        let batch_size: usize = parse_or(&get, "IMPORT_BATCH_SIZE", DEFAULT_BATCH_SIZE)?;
        if batch_size == 0 {
            anyhow::bail!("IMPORT_BATCH_SIZE must be greater than zero");
        }

        let progress_interval: u64 = parse_or(&get, "IMPORT_PROGRESS_INTERVAL", DEFAULT_PROGRESS_INTERVAL)?;
        if progress_interval == 0 {
            anyhow::bail!("IMPORT_PROGRESS_INTERVAL must be greater than zero");
        }

        let max_concurrent_jobs: usize = parse_or(&get, "IMPORT_MAX_CONCURRENT_JOBS", DEFAULT_MAX_CONCURRENT_JOBS)?;
        if max_concurrent_jobs == 0 {
            anyhow::bail!("IMPORT_MAX_CONCURRENT_JOBS must be greater than zero");
        }

        let csv_delimiter = match get("CSV_DELIMITER") {
            None => b',',
            Some(raw) => match raw.as_bytes() {
                [byte] => *byte,
                _ => anyhow::bail!("CSV_DELIMITER must be a single byte, got '{}'", raw),
            },
        };

        let min_date = match get("VALIDATION_MIN_DATE") {
            None => default_min_date(),
            Some(raw) => NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
                .with_context(|| format!("VALIDATION_MIN_DATE must be YYYY-MM-DD, got '{}'", raw))?,
        };

        let validation = ValidationConfig {
            allow_spaces_in_id: parse_bool(&get, "VALIDATION_ALLOW_SPACES_IN_ID")?,
            allow_negative_ids: parse_bool(&get, "VALIDATION_ALLOW_NEGATIVE_IDS")?,
            min_date,
        };

        let development = get("APP_ENV").is_some_and(|env| env.eq_ignore_ascii_case("development"));

        Ok(Self {
            nats_url,
            database_url,
            redis_url,
            job_retention: Duration::from_secs(retention_secs),
            upload_dir: PathBuf::from(get("UPLOAD_DIR").unwrap_or_else(|| "./uploads".to_string())),
            results_dir: PathBuf::from(get("RESULTS_DIR").unwrap_or_else(|| ".".to_string())),
            batch_size,
            progress_interval,
            max_concurrent_jobs,
            csv_delimiter,
            validation,
            development,
        })
    }

    pub fn uses_memory_store(&self) -> bool {
        self.redis_url == MEMORY_STORE_URL
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value '{}'", key, raw)),
    }
}

fn parse_bool(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<bool> {
    match get(key).as_deref().map(str::trim) {
        None | Some("") => Ok(false),
        Some("1") | Some("true") | Some("TRUE") | Some("yes") => Ok(true),
        Some("0") | Some("false") | Some("FALSE") | Some("no") => Ok(false),
        Some(other) => anyhow::bail!("{} must be a boolean, got '{}'", key, other),
    }
}
