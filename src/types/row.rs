//! Row types flowing through the import pipeline

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A single spreadsheet cell as delivered by a row source
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Empty,
    Bool(bool),
    Number(f64),
    Text(String),
    /// Cell object carrying display text (rich text, hyperlink)
    Rich { text: String },
    Date(NaiveDate),
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Empty => Ok(()),
            CellValue::Bool(b) => write!(f, "{}", b),
            CellValue::Number(n) => write!(f, "{}", n),
            CellValue::Text(s) => f.write_str(s),
            CellValue::Rich { text } => f.write_str(text),
            CellValue::Date(d) => write!(f, "{}", d.format("%d.%m.%Y")),
        }
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        CellValue::Text(value.to_string())
    }
}

/// The three input columns of a data row, unvalidated
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    pub id: CellValue,
    pub name: CellValue,
    pub date: CellValue,
}

impl RawRow {
    pub fn new(id: impl Into<CellValue>, name: impl Into<CellValue>, date: impl Into<CellValue>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            date: date.into(),
        }
    }
}

impl From<&ParsedRow> for RawRow {
    fn from(row: &ParsedRow) -> Self {
        Self {
            id: CellValue::Text(row.external_id.to_string()),
            name: CellValue::Text(row.name.clone()),
            date: CellValue::Date(row.date),
        }
    }
}

/// A row that passed validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedRow {
    pub external_id: i64,
    pub name: String,
    pub date: NaiveDate,
}

/// All reasons one data row was rejected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationError {
    /// 1-based position among data rows (header excluded)
    pub row_number: u64,
    pub messages: Vec<String>,
}

impl ValidationError {
    /// Line format used by the error artifact
    pub fn to_line(&self) -> String {
        format!("{} - {}", self.row_number, self.messages.join(", "))
    }
}

/// Validator output
#[derive(Debug, Clone, PartialEq)]
pub struct RowValidation {
    pub errors: Vec<String>,
    pub row: Option<ParsedRow>,
}

impl RowValidation {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}
