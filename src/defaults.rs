/// Rows per persistence batch
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Rows between progress snapshots
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 100;

/// Retention of every job key, in seconds (one day)
pub const DEFAULT_JOB_RETENTION_SECS: u64 = 86_400;

pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 4;

/// Rows buffered between the file reader thread and the pipeline
pub const ROW_CHANNEL_CAPACITY: usize = 256;

/// Day zero of the spreadsheet serial date system
pub const SPREADSHEET_EPOCH: (i32, u32, u32) = (1899, 12, 30);

pub const DEFAULT_MIN_DATE: (i32, u32, u32) = (1900, 1, 1);

/// Display label, separator and chrono format of each accepted date text
pub const ACCEPTED_DATE_FORMATS: [(&str, char, &str); 3] = [
    ("DD.MM.YYYY", '.', "%d.%m.%Y"),
    ("DD/MM/YYYY", '/', "%d/%m/%Y"),
    ("DD-MM-YYYY", '-', "%d-%m-%Y"),
];

/// Dates per page of the grouped rows read
pub const DEFAULT_GROUPED_PAGE_LIMIT: u32 = 50;

pub const MAX_GROUPED_PAGE_LIMIT: u32 = 500;
