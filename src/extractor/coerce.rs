//! Type coercion of recognized text into template cell values.

use std::sync::OnceLock;

use chrono::{Datelike, NaiveDate};
use regex::Regex;

use crate::models::ColumnType;
use crate::types::CellValue;

/// Date layouts accepted for four-digit years. Slash, dot and dash forms are day-first.
const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y", "%d.%m.%Y", "%d-%m-%Y", "%d %b %Y", "%d %B %Y",
    "%b %d, %Y", "%B %d, %Y", "%b %d %Y", "%B %d %Y",
];
const SHORT_YEAR_FORMATS: &[&str] = &["%d/%m/%y", "%d.%m.%y", "%d-%m-%y"];

fn short_year_date() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{1,2}[/.\-]\d{1,2}[/.\-]\d{2}$").expect("valid regex"))
}

fn numeric_shape() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9.,]*[0-9][0-9.,]*$").expect("valid regex"))
}

fn grouped(sep: char) -> Regex {
    let sep = regex::escape(&sep.to_string());
    Regex::new(&format!(r"^\d{{1,3}}({}\d{{3}})+$", sep)).expect("valid regex")
}

fn comma_grouped() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| grouped(','))
}

fn dot_grouped() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| grouped('.'))
}

/// Coerce raw text for a column. `Ok(None)` means the cell is blank; `Err` carries a
/// human-readable reason for a value that could not be read as the column's type.
pub fn coerce(raw: &str, column_type: ColumnType) -> Result<Option<CellValue>, String> {
    let text = raw.trim();
    if text.is_empty() {
        return Ok(None);
    }
    match column_type {
        ColumnType::Text => Ok(Some(CellValue::Text(text.to_string()))),
        ColumnType::Number => parse_number(text)
            .map(|n| Some(CellValue::Number(n)))
            .ok_or_else(|| format!("could not parse {:?} as a number", text)),
        ColumnType::Date => parse_date(text)
            .map(|d| Some(CellValue::Date(d)))
            .ok_or_else(|| format!("could not parse {:?} as a date", text)),
    }
}

/// Locale-tolerant number parsing.
///
/// Grouping may use spaces, apostrophes, commas or dots. When both `,` and `.` appear the
/// later one is the decimal separator. A single separator followed by exactly three digits
/// is read as grouping (`1,234` is 1234).
pub fn parse_number(raw: &str) -> Option<f64> {
    let mut s: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '\'' | '\u{2019}' | '_'))
        .collect();
    let negative = match s.chars().next() {
        Some('-') | Some('\u{2212}') => true,
        Some('+') => false,
        _ => {
            s.insert(0, '+');
            false
        }
    };
    let digits: String = s.chars().skip(1).collect();
    if !numeric_shape().is_match(&digits) {
        return None;
    }

    let commas = digits.matches(',').count();
    let dots = digits.matches('.').count();
    let normalized = if commas > 0 && dots > 0 {
        let last_comma = digits.rfind(',')?;
        let last_dot = digits.rfind('.')?;
        let (decimal, group) = if last_comma > last_dot { (',', '.') } else { ('.', ',') };
        let decimal_at = if decimal == ',' { last_comma } else { last_dot };
        let grouping = if group == ',' { comma_grouped() } else { dot_grouped() };
        if digits.matches(decimal).count() > 1 || !grouping.is_match(&digits[..decimal_at]) {
            return None;
        }
        digits.replace(group, "").replace(decimal, ".")
    } else if commas > 0 {
        if comma_grouped().is_match(&digits) {
            digits.replace(',', "")
        } else if commas == 1 {
            digits.replace(',', ".")
        } else {
            return None;
        }
    } else if dots > 1 {
        if dot_grouped().is_match(&digits) {
            digits.replace('.', "")
        } else {
            return None;
        }
    } else {
        digits
    };

    let value: f64 = normalized.parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(if negative { -value } else { value })
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let text = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let formats = if short_year_date().is_match(&text) {
        SHORT_YEAR_FORMATS
    } else {
        DATE_FORMATS
    };
    formats
        .iter()
        .filter_map(|f| NaiveDate::parse_from_str(&text, f).ok())
        .find(|d| (1900..=2100).contains(&d.year()))
}
