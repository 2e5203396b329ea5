use std::io::Cursor;
use std::path::{Path, PathBuf};

use calamine::{open_workbook_auto_from_rs, Data, Reader};
use chrono::Datelike;
use rust_xlsxwriter::{Color, DocProperties, ExcelDateTime, Format, FormatAlign, Workbook, Worksheet, XlsxError};

use crate::aggregator::{FlagReason, Table};
use crate::error::Error;
use crate::models::{ColumnType, Schema};
use crate::types::CellValue;

pub const DATA_SHEET: &str = "Data";
pub const REVIEW_SHEET: &str = "Review";
pub const FAILURES_SHEET: &str = "Failures";

const HEADER_BLUE: u32 = 0x2563EB;
const REVIEW_AMBER: u32 = 0xFDE68A;

/// Column index to Excel letter (0→A, 1→B, 25→Z, 26→AA).
fn col_index_to_letter(index: u32) -> String {
    let mut n = index;
    let mut s = String::new();
    loop {
        let r = (n % 26) as u8;
        s.insert(0, (b'A' + r) as char);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    s
}

/// Drop characters that corrupt sheet XML (control chars except tab, newline, CR).
/// `&`, `<` and `>` are escaped by the writer.
fn sanitize_cell(s: &str) -> String {
    s.chars()
        .filter(|&c| {
            let u = c as u32;
            matches!(c, '\t' | '\n' | '\r') || !(u < 0x20 || u == 0x7F || u == 0xFFFE || u == 0xFFFF)
        })
        .collect()
}

fn write_text_cell_safe(
    worksheet: &mut Worksheet,
    row: u32,
    col: u16,
    text: &str,
    format: &Format,
) -> Result<(), XlsxError> {
    let cleaned = sanitize_cell(text);
    worksheet.write_string_with_format(row, col, &cleaned, format).map(|_| ())
}

/// Estimate column width from text length (char count × 1.2, clamped 10–50).
fn estimate_text_width(text: &str) -> f64 {
    let w = text.chars().count() as f64 * 1.2;
    w.clamp(10.0, 50.0)
}

fn header_format() -> Format {
    Format::new()
        .set_bold()
        .set_background_color(Color::RGB(HEADER_BLUE))
        .set_font_color(Color::RGB(0xFFFFFF))
}

fn write_header(worksheet: &mut Worksheet, headers: &[&str], widths: &[f64]) -> Result<(), XlsxError> {
    let format = header_format();
    for (col, header) in headers.iter().enumerate() {
        write_text_cell_safe(worksheet, 0, col as u16, header, &format)?;
        let width = widths
            .get(col)
            .copied()
            .unwrap_or_else(|| estimate_text_width(header));
        worksheet.set_column_width(col as u16, width)?;
    }
    worksheet.set_freeze_panes(1, 0)?;
    Ok(())
}

/// Cell formats for one data row: text, number, date.
struct RowFormats {
    text: Format,
    number: Format,
    date: Format,
}

impl RowFormats {
    fn new(flagged: bool) -> Self {
        let base = |f: Format| {
            if flagged {
                f.set_background_color(Color::RGB(REVIEW_AMBER))
            } else {
                f
            }
        };
        Self {
            text: base(Format::new().set_text_wrap()),
            number: base(Format::new().set_align(FormatAlign::Right)),
            date: base(Format::new().set_num_format("yyyy-mm-dd")),
        }
    }
}

/// Reject tables that cannot be laid out under the schema header.
fn check_table(table: &Table, schema: &Schema) -> Result<(), Error> {
    if table.provenance.len() != table.rows.len() || table.flags.len() != table.rows.len() {
        return Err(Error::Serialization(format!(
            "{} rows but {} provenance entries and {} flags",
            table.rows.len(),
            table.provenance.len(),
            table.flags.len()
        )));
    }
    for (i, row) in table.rows.iter().enumerate() {
        let excel_row = i + 2;
        if row.cells.len() != schema.len() {
            return Err(Error::Serialization(format!(
                "row {} has {} cells for {} columns",
                excel_row,
                row.cells.len(),
                schema.len()
            )));
        }
        for (c, (cell, column)) in row.cells.iter().zip(schema.columns()).enumerate() {
            let at = format!("{}{}", col_index_to_letter(c as u32), excel_row);
            if !cell.column_name.trim().eq_ignore_ascii_case(column.name.trim()) {
                return Err(Error::Serialization(format!(
                    "cell {} belongs to '{}', expected '{}'",
                    at, cell.column_name, column.name
                )));
            }
            let type_matches = match (&cell.value, column.column_type) {
                (None, _) => true,
                (Some(CellValue::Text(_)), ColumnType::Text) => true,
                (Some(CellValue::Number(n)), ColumnType::Number) => n.is_finite(),
                (Some(CellValue::Date(_)), ColumnType::Date) => true,
                _ => false,
            };
            if !type_matches {
                return Err(Error::Serialization(format!(
                    "cell {} does not hold a {:?} value",
                    at, column.column_type
                )));
            }
        }
    }
    Ok(())
}

fn write_data_sheet(worksheet: &mut Worksheet, table: &Table, schema: &Schema) -> Result<(), Error> {
    worksheet.set_name(DATA_SHEET)?;
    let plain = RowFormats::new(false);
    let flagged = RowFormats::new(true);

    let mut widths: Vec<f64> = schema
        .columns()
        .iter()
        .map(|c| match c.column_type {
            ColumnType::Date => 12.0,
            _ => estimate_text_width(&c.name),
        })
        .collect();

    for (i, row) in table.rows.iter().enumerate() {
        let excel_row = (i + 1) as u32;
        let formats = if table.flags[i].is_some() { &flagged } else { &plain };
        for (c, cell) in row.cells.iter().enumerate() {
            let col = c as u16;
            match &cell.value {
                Some(CellValue::Text(s)) => {
                    write_text_cell_safe(worksheet, excel_row, col, s, &formats.text)?;
                    widths[c] = widths[c].max(estimate_text_width(s));
                }
                Some(CellValue::Number(n)) => {
                    worksheet.write_number_with_format(excel_row, col, *n, &formats.number)?;
                }
                Some(CellValue::Date(d)) => {
                    let date = ExcelDateTime::from_ymd(d.year() as u16, d.month() as u8, d.day() as u8)?;
                    worksheet.write_datetime_with_format(excel_row, col, &date, &formats.date)?;
                }
                None if table.flags[i].is_some() => {
                    worksheet.write_blank(excel_row, col, &formats.text)?;
                }
                None => {}
            }
        }
    }

    let headers: Vec<&str> = schema.columns().iter().map(|c| c.name.as_str()).collect();
    write_header(worksheet, &headers, &widths)?;
    Ok(())
}

fn write_review_sheet(worksheet: &mut Worksheet, table: &Table) -> Result<(), Error> {
    worksheet.set_name(REVIEW_SHEET)?;
    write_header(
        worksheet,
        &["Data row", "Image", "Row in image", "Confidence", "Reasons", "Warnings"],
        &[10.0, 30.0, 12.0, 12.0, 40.0, 50.0],
    )?;
    let wrap = Format::new().set_text_wrap();
    let percent = Format::new().set_num_format("0%");

    let mut out_row = 1u32;
    for (i, flag) in table.flags.iter().enumerate() {
        let Some(flag) = flag else { continue };
        let provenance = &table.provenance[i];
        let reasons = flag
            .reasons
            .iter()
            .map(|r| FlagReason::as_str(*r))
            .collect::<Vec<_>>()
            .join(", ");
        worksheet.write_number(out_row, 0, (i + 2) as f64)?;
        write_text_cell_safe(worksheet, out_row, 1, &provenance.image.original_name, &wrap)?;
        worksheet.write_number(out_row, 2, (provenance.row_index + 1) as f64)?;
        worksheet.write_number_with_format(out_row, 3, flag.confidence, &percent)?;
        write_text_cell_safe(worksheet, out_row, 4, &reasons, &wrap)?;
        write_text_cell_safe(worksheet, out_row, 5, &flag.warnings.join("\n"), &wrap)?;
        out_row += 1;
    }
    Ok(())
}

fn write_failures_sheet(worksheet: &mut Worksheet, table: &Table) -> Result<(), Error> {
    worksheet.set_name(FAILURES_SHEET)?;
    write_header(
        worksheet,
        &["Image ID", "Image", "Reason", "Detail"],
        &[38.0, 30.0, 24.0, 50.0],
    )?;
    let wrap = Format::new().set_text_wrap();

    let failures = table.failures.iter().map(|f| {
        (&f.image, f.reason.as_str(), f.detail.as_str())
    });
    let unprocessed = table
        .unprocessed
        .iter()
        .map(|image| (image, "NotProcessed", "Batch was cancelled before this image ran"));
    for (i, (image, reason, detail)) in failures.chain(unprocessed).enumerate() {
        let row = (i + 1) as u32;
        write_text_cell_safe(worksheet, row, 0, image.image_id.as_str(), &wrap)?;
        write_text_cell_safe(worksheet, row, 1, &image.original_name, &wrap)?;
        write_text_cell_safe(worksheet, row, 2, reason, &wrap)?;
        write_text_cell_safe(worksheet, row, 3, detail, &wrap)?;
    }
    Ok(())
}

/// Serialize a table into xlsx bytes: "Data", "Review" and "Failures" sheets.
///
/// The output depends only on the inputs; the document creation time is pinned so repeated
/// writes of the same table are byte-identical.
pub fn write(table: &Table, schema: &Schema) -> Result<Vec<u8>, Error> {
    check_table(table, schema)?;

    let mut workbook = Workbook::new();
    let created = ExcelDateTime::from_ymd(2000, 1, 1)?;
    let properties = DocProperties::new().set_creation_datetime(&created);
    workbook.set_properties(&properties);

    write_data_sheet(workbook.add_worksheet(), table, schema)?;
    write_review_sheet(workbook.add_worksheet(), table)?;
    write_failures_sheet(workbook.add_worksheet(), table)?;

    Ok(workbook.save_to_buffer()?)
}

/// Output path for an export: the given path (forced to `.xlsx`), or a fresh timestamped file in
/// Downloads (falling back to Desktop).
pub fn resolve_output_path(path_override: Option<&str>) -> Result<PathBuf, Error> {
    if let Some(p) = path_override.map(str::trim).filter(|p| !p.is_empty()) {
        let mut pb = PathBuf::from(p);
        if pb.extension().map(|e| e.to_str()) != Some(Some("xlsx")) {
            pb.set_extension("xlsx");
        }
        return Ok(pb);
    }
    let dir = dirs::download_dir()
        .or_else(dirs::desktop_dir)
        .ok_or_else(|| Error::Config("Could not find Downloads or Desktop folder.".to_string()))?;
    Ok(unique_export_path(&dir, "Handwriting", chrono::Local::now()))
}

/// `<prefix>_<timestamp>.xlsx` in `dir`, suffixed `_2`, `_3`, ... while the name is taken.
pub fn unique_export_path(
    dir: &Path,
    prefix: &str,
    now: chrono::DateTime<chrono::Local>,
) -> PathBuf {
    let stamp = now.format("%Y%m%d_%H%M%S");
    let mut p = dir.join(format!("{}_{}.xlsx", prefix, stamp));
    let mut counter = 2u32;
    while p.exists() {
        p = dir.join(format!("{}_{}_{}.xlsx", prefix, stamp, counter));
        counter += 1;
    }
    p
}

/// Write workbook bytes to disk, creating the parent directory if needed.
pub fn save(bytes: &[u8], path: &Path) -> Result<(), Error> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, bytes)?;
    tracing::info!(path = %path.display(), bytes = bytes.len(), "Saved workbook");
    Ok(())
}

/// Every sheet of a workbook as display strings, in sheet order.
pub fn read_sheets(bytes: &[u8]) -> Result<Vec<(String, Vec<Vec<String>>)>, Error> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes))
        .map_err(|e| Error::Read(e.to_string()))?;
    let mut sheets = Vec::new();
    for name in workbook.sheet_names() {
        let range = workbook
            .worksheet_range(&name)
            .map_err(|e| Error::Read(format!("Sheet {}: {}", name, e)))?;
        let rows = range
            .rows()
            .map(|row| row.iter().map(display_cell).collect())
            .collect();
        sheets.push((name, rows));
    }
    Ok(sheets)
}

fn display_cell(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(d) => d.format("%Y-%m-%d").to_string(),
            None => dt.as_f64().to_string(),
        },
        other => other.to_string(),
    }
}
