//! Streaming row sources
//!
//! The file is read on a blocking thread and handed to the async
//! pipeline through a bounded channel, one data row at a time. Memory
//! use is bounded by the channel capacity regardless of file size.
//! Dropping the [`RowStream`] stops the reader at its next send. A reader
//! that dies without reporting (a panic) surfaces as an error, not as the
//! end of the file.

use std::fs::File;
use std::path::{Path, PathBuf};

use calamine::{open_workbook, DataRef, Reader, Xlsx};
use chrono::NaiveDate;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::defaults::ROW_CHANNEL_CAPACITY;
use crate::error::SourceError;
use crate::types::{CellValue, RawRow};

/// Worksheet row index (0-based) holding the header
const XLSX_HEADER_ROW: u32 = 0;

/// Supported upload formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Xlsx,
    Csv { delimiter: u8 },
}

impl SourceKind {
    /// Pick the format from the file extension
    pub fn from_path(path: &Path, csv_delimiter: u8) -> Result<Self, SourceError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "xlsx" => Ok(SourceKind::Xlsx),
            "csv" => Ok(SourceKind::Csv { delimiter: csv_delimiter }),
            _ => Err(SourceError::Unsupported(ext)),
        }
    }
}

type RowResult = Result<RawRow, SourceError>;

/// Forward-only stream of data rows (headers already skipped)
pub struct RowStream {
    rx: mpsc::Receiver<RowResult>,
    reader: Option<JoinHandle<()>>,
}

impl RowStream {
    /// Start reading `path` in the background
    pub fn open(path: PathBuf, kind: SourceKind) -> Self {
        Self::spawn_reader(move |tx| {
            let result = match kind {
                SourceKind::Xlsx => read_xlsx(&path, tx),
                SourceKind::Csv { delimiter } => read_csv(&path, delimiter, tx),
            };
            debug!("Row reader for {} finished", path.display());
            result
        })
    }

    fn spawn_reader<F>(read: F) -> Self
    where
        F: FnOnce(&mpsc::Sender<RowResult>) -> Result<(), ReadStop> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(ROW_CHANNEL_CAPACITY);
        let reader = tokio::task::spawn_blocking(move || match read(&tx) {
            Ok(()) | Err(ReadStop::ReceiverGone) => {}
            Err(ReadStop::Failed(err)) => {
                let _ = tx.blocking_send(Err(err));
            }
        });
        Self {
            rx,
            reader: Some(reader),
        }
    }

    /// In-memory stream over ready rows
    #[cfg(test)]
    pub fn from_rows(rows: Vec<RawRow>) -> Self {
        let (tx, rx) = mpsc::channel(rows.len().max(1));
        for row in rows {
            let _ = tx.try_send(Ok(row));
        }
        Self { rx, reader: None }
    }

    /// Stream that yields `rows` and then loses its reader thread
    #[cfg(test)]
    pub fn from_rows_then_panic(rows: Vec<RawRow>) -> Self {
        Self::spawn_reader(move |tx| {
            for row in rows {
                send(tx, row)?;
            }
            panic!("reader crashed");
        })
    }

    /// Next data row. `None` only once the reader has finished cleanly.
    pub async fn next_row(&mut self) -> Option<RowResult> {
        if let Some(row) = self.rx.recv().await {
            return Some(row);
        }
        let reader = self.reader.take()?;
        match reader.await {
            Ok(()) => None,
            Err(e) => {
                error!("Row reader stopped unexpectedly: {}", e);
                Some(Err(SourceError::Reader(e.to_string())))
            }
        }
    }
}

enum ReadStop {
    ReceiverGone,
    Failed(SourceError),
}

impl From<std::io::Error> for ReadStop {
    fn from(err: std::io::Error) -> Self {
        ReadStop::Failed(err.into())
    }
}

impl From<calamine::XlsxError> for ReadStop {
    fn from(err: calamine::XlsxError) -> Self {
        ReadStop::Failed(err.into())
    }
}

impl From<csv::Error> for ReadStop {
    fn from(err: csv::Error) -> Self {
        ReadStop::Failed(err.into())
    }
}

fn send(tx: &mpsc::Sender<RowResult>, row: RawRow) -> Result<(), ReadStop> {
    tx.blocking_send(Ok(row)).map_err(|_| ReadStop::ReceiverGone)
}

// ==========================================================================
// XLSX
// ==========================================================================

/// Stream every worksheet cell by cell. Columns A-C are id, name, date.
/// Row 1 of each worksheet is its header; rows without any value are
/// not data rows.
fn read_xlsx(path: &Path, tx: &mpsc::Sender<RowResult>) -> Result<(), ReadStop> {
    let mut workbook: Xlsx<_> = open_workbook(path)?;
    let sheets = workbook.sheet_names();

    for sheet in sheets {
        let mut cells = workbook.worksheet_cells_reader(&sheet)?;
        let mut current: Option<SheetRow> = None;

        while let Some(cell) = cells.next_cell()? {
            let (row_idx, col) = cell.get_position();
            if current.as_ref().is_some_and(|r| r.index != row_idx) {
                if let Some(done) = current.take() {
                    done.emit(tx)?;
                }
            }
            current
                .get_or_insert_with(|| SheetRow::new(row_idx))
                .set(col, cell.get_value());
        }

        if let Some(done) = current.take() {
            done.emit(tx)?;
        }
    }
    Ok(())
}

/// Worksheet row being assembled from its cells
struct SheetRow {
    index: u32,
    row: RawRow,
    has_value: bool,
}

impl SheetRow {
    fn new(index: u32) -> Self {
        Self {
            index,
            row: RawRow {
                id: CellValue::Empty,
                name: CellValue::Empty,
                date: CellValue::Empty,
            },
            has_value: false,
        }
    }

    fn set(&mut self, col: u32, data: &DataRef<'_>) {
        if !matches!(data, DataRef::Empty) {
            self.has_value = true;
        }
        let value = cell_value(data);
        match col {
            0 => self.row.id = value,
            1 => self.row.name = value,
            2 => self.row.date = value,
            _ => {}
        }
    }

    fn emit(self, tx: &mpsc::Sender<RowResult>) -> Result<(), ReadStop> {
        if self.index == XLSX_HEADER_ROW || !self.has_value {
            return Ok(());
        }
        send(tx, self.row)
    }
}

fn cell_value(data: &DataRef<'_>) -> CellValue {
    match data {
        DataRef::Empty => CellValue::Empty,
        DataRef::Bool(b) => CellValue::Bool(*b),
        DataRef::Int(i) => CellValue::Number(*i as f64),
        DataRef::Float(f) => CellValue::Number(*f),
        DataRef::String(s) => CellValue::Text(s.clone()),
        DataRef::SharedString(s) => CellValue::Text(s.to_string()),
        // as_datetime honours the workbook's 1900/1904 date system
        DataRef::DateTime(dt) => match dt.as_datetime() {
            Some(moment) if dt.is_datetime() => CellValue::Date(moment.date()),
            _ => CellValue::Number(dt.as_f64()),
        },
        DataRef::DateTimeIso(s) => s
            .get(..10)
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
            .map_or_else(|| CellValue::Text(s.clone()), CellValue::Date),
        DataRef::Error(e) => CellValue::Text(e.to_string()),
        _ => CellValue::Empty,
    }
}

// ==========================================================================
// CSV
// ==========================================================================

fn read_csv(path: &Path, delimiter: u8, tx: &mpsc::Sender<RowResult>) -> Result<(), ReadStop> {
    let file = File::open(path)?;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_reader(file);

    for record in reader.records() {
        let record = record?;
        let cell = |i: usize| match record.get(i) {
            Some(v) => CellValue::Text(v.to_string()),
            None => CellValue::Empty,
        };
        send(tx, RawRow { id: cell(0), name: cell(1), date: cell(2) })?;
    }
    Ok(())
}
