//! Row validation rules
//!
//! Pure functions from raw cells to a [`ParsedRow`] or a list of
//! human-readable reasons. Errors from the three columns accumulate
//! independently, so one row can report up to three messages.

use chrono::{Days, Local, NaiveDate};

use crate::defaults::{ACCEPTED_DATE_FORMATS, DEFAULT_MIN_DATE, SPREADSHEET_EPOCH};
use crate::types::{CellValue, ParsedRow, RawRow, RowValidation};

/// Switches for the ID and date rules
#[derive(Debug, Clone)]
pub struct ValidationConfig {
    pub allow_spaces_in_id: bool,
    pub allow_negative_ids: bool,
    pub min_date: NaiveDate,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            allow_spaces_in_id: false,
            allow_negative_ids: false,
            min_date: default_min_date(),
        }
    }
}

pub fn default_min_date() -> NaiveDate {
    let (y, m, d) = DEFAULT_MIN_DATE;
    NaiveDate::from_ymd_opt(y, m, d).unwrap_or(NaiveDate::MIN)
}

#[derive(Debug, Clone, Default)]
pub struct RowValidator {
    config: ValidationConfig,
}

impl RowValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    /// Validate against today's local date
    pub fn validate(&self, raw: &RawRow) -> RowValidation {
        self.validate_on(raw, Local::now().date_naive())
    }

    /// Validate with an explicit "today" for the future-date rule
    pub fn validate_on(&self, raw: &RawRow, today: NaiveDate) -> RowValidation {
        let mut errors = Vec::new();

        let id = self.validate_id(&raw.id).map_err(|e| errors.push(e)).ok();
        let name = validate_name(&raw.name).map_err(|e| errors.push(e)).ok();
        let date = self.validate_date(&raw.date, today).map_err(|e| errors.push(e)).ok();

        let row = match (id, name, date) {
            (Some(external_id), Some(name), Some(date)) if errors.is_empty() => Some(ParsedRow {
                external_id,
                name,
                date,
            }),
            _ => None,
        };

        RowValidation { errors, row }
    }

    fn validate_id(&self, raw: &CellValue) -> Result<i64, String> {
        let text = raw.to_string();
        let trimmed = text.trim();

        if trimmed.is_empty() {
            return Err("ID cannot be empty".to_string());
        }

        let has_whitespace = trimmed.chars().any(char::is_whitespace);
        if has_whitespace && !self.config.allow_spaces_in_id {
            return Err("ID cannot contain spaces".to_string());
        }
        let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();

        // Exact integer text never goes through f64
        if let Ok(id) = compact.parse::<i64>() {
            return self.check_id_sign(id < 0, id == 0).map(|()| id);
        }

        let numeric: f64 = match compact.parse::<f64>() {
            Ok(n) if n.is_finite() => n,
            _ => return Err("ID must be a valid number".to_string()),
        };

        if numeric.fract() != 0.0 {
            return Err("ID must be an integer".to_string());
        }

        self.check_id_sign(numeric < 0.0, numeric == 0.0)?;

        // 2^63 is exactly representable; anything at or past it overflows
        if numeric >= 9_223_372_036_854_775_808.0 || numeric < -9_223_372_036_854_775_808.0 {
            return Err("ID is out of range".to_string());
        }

        Ok(numeric as i64)
    }

    fn check_id_sign(&self, negative: bool, zero: bool) -> Result<(), String> {
        if negative && !self.config.allow_negative_ids {
            return Err("ID cannot be negative".to_string());
        }
        if zero {
            return Err("ID cannot be zero".to_string());
        }
        Ok(())
    }

    fn validate_date(&self, raw: &CellValue, today: NaiveDate) -> Result<NaiveDate, String> {
        let date = match raw {
            CellValue::Empty => return Err("Date cannot be empty".to_string()),
            CellValue::Date(date) => *date,
            CellValue::Number(serial) => {
                serial_to_date(*serial).ok_or_else(|| "Invalid Excel date value".to_string())?
            }
            CellValue::Text(text) | CellValue::Rich { text } => parse_date_text(text.trim())?,
            CellValue::Bool(_) => parse_date_text(raw.to_string().trim())?,
        };

        if date > today {
            return Err("Date cannot be in the future".to_string());
        }

        if date < self.config.min_date {
            return Err(format!(
                "Date cannot be before {}",
                self.config.min_date.format("%Y-%m-%d")
            ));
        }

        Ok(date)
    }
}

fn validate_name(raw: &CellValue) -> Result<String, String> {
    let name = raw.to_string();
    let name = name.trim();
    if name.is_empty() {
        return Err("Name cannot be empty".to_string());
    }
    Ok(name.to_string())
}

/// Convert a spreadsheet serial (days since 1899-12-30) to a calendar date.
/// Any time-of-day fraction is dropped.
pub fn serial_to_date(serial: f64) -> Option<NaiveDate> {
    if !serial.is_finite() {
        return None;
    }
    let (y, m, d) = SPREADSHEET_EPOCH;
    let epoch = NaiveDate::from_ymd_opt(y, m, d)?;
    let days = serial.floor();
    // Beyond this chrono cannot represent the result anyway
    if days.abs() > 100_000_000.0 {
        return None;
    }
    let days = days as i64;
    if days >= 0 {
        epoch.checked_add_days(Days::new(days as u64))
    } else {
        epoch.checked_sub_days(Days::new(days.unsigned_abs()))
    }
}

fn parse_date_text(text: &str) -> Result<NaiveDate, String> {
    if text.is_empty() {
        return Err("Date is empty after processing".to_string());
    }

    for (_, separator, chrono_format) in ACCEPTED_DATE_FORMATS {
        if has_strict_shape(text, separator) {
            if let Ok(date) = NaiveDate::parse_from_str(text, chrono_format) {
                return Ok(date);
            }
        }
    }

    let parts: Vec<&str> = text.split(['-', '.', '/']).collect();
    if let [day, month, year] = parts[..] {
        let day = leading_int(day);
        let month = leading_int(month);
        let year = leading_int(year);

        if let Some(month) = month {
            if !(1..=12).contains(&month) {
                return Err(format!("Invalid month '{}' in date '{}'", month, text));
            }
        }

        if let (Some(29), Some(2), Some(year)) = (day, month, year) {
            if !is_leap_year(year) {
                return Err(format!(
                    "Invalid day 29 for February in a non-leap year ({})",
                    year
                ));
            }
        }
    }

    Err(format!(
        "Invalid date format '{}'. Date must be in one of these formats: {}",
        text,
        accepted_formats_list()
    ))
}

/// `DD<sep>MM<sep>YYYY` with exactly two, two and four digits
fn has_strict_shape(text: &str, separator: char) -> bool {
    let parts: Vec<&str> = text.split(separator).collect();
    match parts[..] {
        [day, month, year] => {
            day.len() == 2
                && month.len() == 2
                && year.len() == 4
                && parts.iter().all(|p| p.bytes().all(|b| b.is_ascii_digit()))
        }
        _ => false,
    }
}

/// Leading optionally-signed integer of `s`, ignoring trailing garbage
fn leading_int(s: &str) -> Option<i64> {
    let s = s.trim_start();
    let (sign, digits) = match s.strip_prefix('-') {
        Some(rest) => (-1, rest),
        None => (1, s.strip_prefix('+').unwrap_or(s)),
    };
    let end = digits
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map_or(digits.len(), |(i, _)| i);
    digits[..end].parse::<i64>().ok().map(|n| sign * n)
}

pub fn is_leap_year(year: i64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

fn accepted_formats_list() -> String {
    ACCEPTED_DATE_FORMATS
        .iter()
        .map(|(label, _, _)| *label)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 15).unwrap()
    }

    fn validator() -> RowValidator {
        RowValidator::default()
    }

    fn check(id: CellValue, name: CellValue, date: CellValue) -> RowValidation {
        validator().validate_on(&RawRow { id, name, date }, today())
    }

    fn check_text(id: &str, name: &str, date: &str) -> RowValidation {
        validator().validate_on(&RawRow::new(id, name, date), today())
    }

    fn date_error(date: &str) -> Vec<String> {
        check_text("1", "Name", date).errors
    }

    // ==========================================================================
    // Whole row
    // ==========================================================================

    #[test]
    fn test_valid_row() {
        let result = check_text("123", "John Doe", "01.01.2020");
        assert!(result.is_valid());
        assert_eq!(
            result.row,
            Some(ParsedRow {
                external_id: 123,
                name: "John Doe".into(),
                date: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            })
        );
    }

    #[test]
    fn test_errors_accumulate_across_fields() {
        let result = check_text("", "", "");
        assert!(!result.is_valid());
        assert!(result.row.is_none());
        assert_eq!(
            result.errors,
            vec![
                "ID cannot be empty".to_string(),
                "Name cannot be empty".to_string(),
                "Date is empty after processing".to_string(),
            ]
        );
    }

    #[test]
    fn test_valid_flag_matches_error_list() {
        let samples = [
            check_text("1", "A", "01.01.2000"),
            check_text("0", "A", "01.01.2000"),
            check_text("1", " ", "01.01.2000"),
            check_text("1", "A", "nope"),
        ];
        for result in samples {
            assert_eq!(result.is_valid(), result.errors.is_empty());
            assert_eq!(result.is_valid(), result.row.is_some());
        }
    }

    #[test]
    fn test_revalidating_parsed_row_is_stable() {
        let rows = [
            check_text("  7  ", " Ada ", "29.02.2000"),
            check(CellValue::Number(44.0), CellValue::Text("Bob".into()), CellValue::Number(43831.0)),
            check(CellValue::Text("5".into()), CellValue::Rich { text: "Cy".into() }, CellValue::Date(today())),
        ];
        for first in rows {
            let parsed = first.row.expect("first pass valid");
            let second = validator().validate_on(&RawRow::from(&parsed), today());
            assert!(second.is_valid(), "{:?}", second.errors);
            assert_eq!(second.row, Some(parsed));
        }
    }

    // ==========================================================================
    // ID rule
    // ==========================================================================

    #[test]
    fn test_id_zero_rejected() {
        assert_eq!(check_text("0", "A", "01.01.2000").errors, vec!["ID cannot be zero"]);
    }

    #[test]
    fn test_id_negative_rejected_by_default() {
        assert_eq!(check_text("-5", "A", "01.01.2000").errors, vec!["ID cannot be negative"]);
    }

    #[test]
    fn test_id_negative_allowed_when_configured() {
        let v = RowValidator::new(ValidationConfig {
            allow_negative_ids: true,
            ..Default::default()
        });
        let result = v.validate_on(&RawRow::new("-5", "A", "01.01.2000"), today());
        assert_eq!(result.row.map(|r| r.external_id), Some(-5));
    }

    #[test]
    fn test_id_fraction_rejected() {
        assert_eq!(check_text("12.5", "A", "01.01.2000").errors, vec!["ID must be an integer"]);
        assert_eq!(
            check(CellValue::Number(12.5), "A".into(), "01.01.2000".into()).errors,
            vec!["ID must be an integer"]
        );
    }

    #[test]
    fn test_id_trimmed() {
        let result = check_text("  7  ", "A", "01.01.2000");
        assert_eq!(result.row.map(|r| r.external_id), Some(7));
    }

    #[test]
    fn test_id_inner_space_rejected() {
        assert_eq!(check_text("1 2", "A", "01.01.2000").errors, vec!["ID cannot contain spaces"]);
    }

    #[test]
    fn test_id_inner_space_allowed_when_configured() {
        let v = RowValidator::new(ValidationConfig {
            allow_spaces_in_id: true,
            ..Default::default()
        });
        let result = v.validate_on(&RawRow::new("1 2", "A", "01.01.2000"), today());
        assert_eq!(result.row.map(|r| r.external_id), Some(12));
    }

    #[test]
    fn test_id_not_numeric() {
        assert_eq!(check_text("abc", "A", "01.01.2000").errors, vec!["ID must be a valid number"]);
        assert_eq!(check_text("NaN", "A", "01.01.2000").errors, vec!["ID must be a valid number"]);
    }

    #[test]
    fn test_id_numeric_cell() {
        let result = check(CellValue::Number(44.0), "A".into(), "01.01.2000".into());
        assert_eq!(result.row.map(|r| r.external_id), Some(44));
    }

    #[test]
    fn test_id_out_of_range() {
        assert_eq!(
            check_text("1e30", "A", "01.01.2000").errors,
            vec!["ID is out of range"]
        );
    }

    #[test]
    fn test_id_keeps_full_integer_precision() {
        let ids = |id: &str| check_text(id, "A", "01.01.2000").row.map(|r| r.external_id);
        assert_eq!(ids("9007199254740993"), Some(9_007_199_254_740_993));
        assert_eq!(ids("9223372036854775807"), Some(i64::MAX));
        assert_eq!(ids("1e3"), Some(1000));
        assert_eq!(
            check_text("9223372036854775808", "A", "01.01.2000").errors,
            vec!["ID is out of range"]
        );
    }

    #[test]
    fn test_id_infinity_is_not_a_number() {
        for id in ["inf", "-inf", "infinity", "Infinity"] {
            assert_eq!(
                check_text(id, "A", "01.01.2000").errors,
                vec!["ID must be a valid number"],
                "{}",
                id
            );
        }
    }

    // ==========================================================================
    // Name rule
    // ==========================================================================

    #[test]
    fn test_name_trimmed_and_coerced() {
        let result = check(CellValue::Text("1".into()), CellValue::Number(2.0), "01.01.2000".into());
        assert_eq!(result.row.map(|r| r.name), Some("2".to_string()));

        let result = check_text("1", "   Eve  ", "01.01.2000");
        assert_eq!(result.row.map(|r| r.name), Some("Eve".to_string()));
    }

    #[test]
    fn test_name_empty_cell() {
        let result = check(CellValue::Text("1".into()), CellValue::Empty, "01.01.2000".into());
        assert_eq!(result.errors, vec!["Name cannot be empty"]);
    }

    // ==========================================================================
    // Date rule
    // ==========================================================================

    #[test]
    fn test_all_accepted_formats() {
        for text in ["15.03.2021", "15/03/2021", "15-03-2021"] {
            let result = check_text("1", "A", text);
            assert_eq!(
                result.row.map(|r| r.date),
                NaiveDate::from_ymd_opt(2021, 3, 15),
                "{}",
                text
            );
        }
    }

    #[test]
    fn test_leap_day_2000_valid() {
        assert!(check_text("1", "A", "29.02.2000").is_valid());
    }

    #[test]
    fn test_leap_day_1900_invalid() {
        assert_eq!(
            date_error("29.02.1900"),
            vec!["Invalid day 29 for February in a non-leap year (1900)"]
        );
    }

    #[test]
    fn test_future_date_rejected() {
        let tomorrow = today().succ_opt().unwrap().format("%d.%m.%Y").to_string();
        assert_eq!(date_error(&tomorrow), vec!["Date cannot be in the future"]);
        let now = today().format("%d.%m.%Y").to_string();
        assert!(check_text("1", "A", &now).is_valid());
    }

    #[test]
    fn test_min_date_bound_inclusive() {
        assert!(check_text("1", "A", "01.01.1900").is_valid());
        assert_eq!(date_error("31.12.1899"), vec!["Date cannot be before 1900-01-01"]);
    }

    #[test]
    fn test_min_date_configurable() {
        let v = RowValidator::new(ValidationConfig {
            min_date: NaiveDate::from_ymd_opt(2000, 1, 1).unwrap(),
            ..Default::default()
        });
        let result = v.validate_on(&RawRow::new("1", "A", "31.12.1999"), today());
        assert_eq!(result.errors, vec!["Date cannot be before 2000-01-01"]);
    }

    #[test]
    fn test_invalid_month() {
        assert_eq!(
            date_error("2020-31-12"),
            vec!["Invalid month '31' in date '2020-31-12'"]
        );
    }

    #[test]
    fn test_invalid_format_lists_accepted_formats() {
        assert_eq!(
            date_error("1.1.2020"),
            vec!["Invalid date format '1.1.2020'. Date must be in one of these formats: DD.MM.YYYY, DD/MM/YYYY, DD-MM-YYYY"]
        );
        assert!(date_error("yesterday")[0].starts_with("Invalid date format 'yesterday'"));
    }

    #[test]
    fn test_impossible_calendar_date() {
        assert!(date_error("31.04.2020")[0].starts_with("Invalid date format"));
    }

    #[test]
    fn test_mixed_separators_rejected() {
        assert!(date_error("01.01/2020")[0].starts_with("Invalid date format"));
    }

    #[test]
    fn test_serial_date() {
        let result = check(CellValue::Text("1".into()), "A".into(), CellValue::Number(43831.0));
        assert_eq!(result.row.map(|r| r.date), NaiveDate::from_ymd_opt(2020, 1, 1));

        let result = check(CellValue::Text("1".into()), "A".into(), CellValue::Number(43831.75));
        assert_eq!(result.row.map(|r| r.date), NaiveDate::from_ymd_opt(2020, 1, 1));
    }

    #[test]
    fn test_serial_date_invalid() {
        let result = check(CellValue::Text("1".into()), "A".into(), CellValue::Number(f64::INFINITY));
        assert_eq!(result.errors, vec!["Invalid Excel date value"]);
        let result = check(CellValue::Text("1".into()), "A".into(), CellValue::Number(1e12));
        assert_eq!(result.errors, vec!["Invalid Excel date value"]);
    }

    #[test]
    fn test_rich_text_date() {
        let result = check(
            CellValue::Text("1".into()),
            "A".into(),
            CellValue::Rich { text: " 05/06/2010 ".into() },
        );
        assert_eq!(result.row.map(|r| r.date), NaiveDate::from_ymd_opt(2010, 6, 5));
    }

    #[test]
    fn test_empty_date_cell() {
        let result = check(CellValue::Text("1".into()), "A".into(), CellValue::Empty);
        assert_eq!(result.errors, vec!["Date cannot be empty"]);
    }

    #[test]
    fn test_is_leap_year() {
        assert!(is_leap_year(2000));
        assert!(is_leap_year(2024));
        assert!(!is_leap_year(1900));
        assert!(!is_leap_year(2023));
    }
}
