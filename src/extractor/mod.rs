//! Turns recognized regions into candidate rows for a template.

pub mod align;
pub mod coerce;

use std::sync::Arc;

use crate::models::Schema;
use crate::types::{mean, CandidateRow, Cell, RecognizedRegion};

pub use align::{AlignedLine, ColumnAlignment, ColumnClustering, Fragment, ReadingOrder, TemplateRegions};

/// Output of one extraction pass.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Extraction {
    pub rows: Vec<CandidateRow>,
    /// Mean of every cell confidence across the emitted rows.
    pub confidence: f64,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RowExtractor {
    alignment: Arc<dyn ColumnAlignment>,
    unscored_confidence: f64,
}

impl Default for RowExtractor {
    fn default() -> Self {
        Self::new(Arc::new(ReadingOrder))
    }
}

impl RowExtractor {
    pub fn new(alignment: Arc<dyn ColumnAlignment>) -> Self {
        Self {
            alignment,
            unscored_confidence: 0.5,
        }
    }

    pub fn with_unscored_confidence(mut self, confidence: f64) -> Self {
        self.unscored_confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn alignment_name(&self) -> &'static str {
        self.alignment.name()
    }

    /// Extract rows. Pure: the same regions and schema always give the same result.
    pub fn extract(&self, regions: &[RecognizedRegion], schema: &Schema) -> Extraction {
        let mut out = Extraction::default();
        if regions.iter().all(|r| r.text.trim().is_empty()) {
            out.warnings.push("no text recognized".to_string());
            return out;
        }

        for (line_no, line) in self.alignment.align(regions, schema).into_iter().enumerate() {
            if line.is_blank() {
                continue;
            }
            if is_header(&line, schema) {
                out.warnings
                    .push(format!("line {}: header line skipped", line_no + 1));
                continue;
            }
            let mut notes = line.notes.clone();
            let row = self.build_row(&line, schema, &mut notes);
            if !row_detected(&row, schema) {
                out.warnings
                    .push(format!("line {}: no row detected", line_no + 1));
                continue;
            }
            let row_no = out.rows.len() + 1;
            out.warnings
                .extend(notes.into_iter().map(|n| format!("row {}: {}", row_no, n)));
            out.rows.push(row);
        }

        out.confidence = mean(
            out.rows
                .iter()
                .flat_map(|r| r.cells.iter().map(|c| c.confidence)),
        );
        out
    }

    fn build_row(&self, line: &AlignedLine, schema: &Schema, notes: &mut Vec<String>) -> CandidateRow {
        let cells = schema
            .columns()
            .iter()
            .zip(&line.columns)
            .map(|(column, fragments)| {
                let text = fragments
                    .iter()
                    .map(|f| f.text.as_str())
                    .filter(|t| !t.is_empty())
                    .collect::<Vec<_>>()
                    .join(" ");
                if text.is_empty() {
                    return Cell::empty(&column.name);
                }
                let confidence = fragments
                    .iter()
                    .map(|f| f.confidence.unwrap_or(self.unscored_confidence).clamp(0.0, 1.0))
                    .fold(1.0_f64, f64::min);
                match coerce::coerce(&text, column.column_type) {
                    Ok(value) => Cell {
                        column_name: column.name.clone(),
                        value,
                        confidence,
                    },
                    Err(reason) => {
                        notes.push(format!("{}: {}", column.name, reason));
                        Cell::empty(&column.name)
                    }
                }
            })
            .collect();
        CandidateRow::new(cells)
    }
}

fn is_header(line: &AlignedLine, schema: &Schema) -> bool {
    let mut fields = line.fragments().map(|f| f.text.as_str()).filter(|t| !t.is_empty());
    let mut any = false;
    let all_names = fields.all(|t| {
        any = true;
        schema.index_of(t).is_some()
    });
    any && all_names
}

fn row_detected(row: &CandidateRow, schema: &Schema) -> bool {
    if schema.has_required() {
        schema
            .columns()
            .iter()
            .zip(&row.cells)
            .any(|(column, cell)| column.required && cell.value.is_some())
    } else {
        row.cells.iter().any(|c| c.value.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ColumnDef, ColumnType};
    use crate::types::CellValue;
    use chrono::NaiveDate;

    fn schema() -> Schema {
        Schema::new(vec![
            ColumnDef::new("Sample ID", ColumnType::Text, true),
            ColumnDef::new("Weight", ColumnType::Number, false),
            ColumnDef::new("Date", ColumnType::Date, false),
        ])
        .unwrap()
    }

    fn region(text: &str, conf: f64) -> RecognizedRegion {
        RecognizedRegion::new(text, Some(conf))
    }

    #[test]
    fn extracts_typed_rows_in_schema_order() {
        let regions = vec![
            region("Sample ID | Weight | Date", 0.99),
            region("S-1 | 12,5 | 05/03/2024", 0.9),
            region("S-2 | 7 | ", 0.8),
        ];
        let out = RowExtractor::default().extract(&regions, &schema());
        assert_eq!(out.rows.len(), 2);
        let first = &out.rows[0];
        assert_eq!(first.value("Sample ID"), Some(&CellValue::Text("S-1".into())));
        assert_eq!(first.value("Weight"), Some(&CellValue::Number(12.5)));
        assert_eq!(
            first.value("Date"),
            Some(&CellValue::Date(NaiveDate::from_ymd_opt(2024, 3, 5).unwrap()))
        );
        assert!(out.rows[1].value("Date").is_none());
        assert_eq!(out.rows[1].cell("Date").unwrap().confidence, 0.0);
        assert_eq!(out.warnings, vec!["line 1: header line skipped".to_string()]);
    }

    #[test]
    fn failed_coercion_nulls_the_cell_and_warns() {
        let out = RowExtractor::default().extract(&[region("S-3 | n/a", 0.9)], &schema());
        let row = &out.rows[0];
        assert!(row.value("Weight").is_none());
        assert_eq!(row.cell("Weight").unwrap().confidence, 0.0);
        assert_eq!(out.warnings.len(), 1);
        assert!(out.warnings[0].starts_with("row 1: Weight"));
    }

    #[test]
    fn lines_without_required_values_are_dropped() {
        let schema = Schema::new(vec![
            ColumnDef::new("Weight", ColumnType::Number, true),
            ColumnDef::new("Note", ColumnType::Text, false),
        ])
        .unwrap();
        let regions = vec![region("3 | ok", 0.9), region("n/a | smudged", 0.9)];
        let out = RowExtractor::default().extract(&regions, &schema);
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.warnings, vec!["line 2: no row detected".to_string()]);
    }

    #[test]
    fn optional_only_schema_accepts_any_value() {
        let schema = Schema::new(vec![
            ColumnDef::new("Note", ColumnType::Text, false),
            ColumnDef::new("Count", ColumnType::Number, false),
        ])
        .unwrap();
        let out = RowExtractor::default().extract(&[region(" | 9", 0.7)], &schema);
        assert_eq!(out.rows.len(), 1);
    }

    #[test]
    fn unscored_regions_use_the_default_and_merges_take_the_minimum() {
        let regions = vec![
            RecognizedRegion::new("S-1", None).at(10.0, 10.0, 30.0, 20.0),
            RecognizedRegion::new("1", Some(0.9)).at(200.0, 10.0, 10.0, 20.0),
            RecognizedRegion::new("2024-01-01", Some(0.8)).at(300.0, 10.0, 60.0, 20.0),
            RecognizedRegion::new("extra", Some(0.2)).at(400.0, 10.0, 30.0, 20.0),
        ];
        let out = RowExtractor::default()
            .with_unscored_confidence(0.4)
            .extract(&regions, &schema());
        let row = &out.rows[0];
        assert_eq!(row.cell("Sample ID").unwrap().confidence, 0.4);
        // "2024-01-01 extra" no longer parses as a date
        assert!(row.value("Date").is_none());
        assert!(out.warnings.iter().any(|w| w.contains("extra field")));
    }

    #[test]
    fn rows_spelling_only_column_names_are_reported() {
        let schema = Schema::new(vec![
            ColumnDef::new("Species", ColumnType::Text, true),
            ColumnDef::new("Site", ColumnType::Text, false),
        ])
        .unwrap();
        let regions = vec![region("Oak | North", 0.9), region("species | site", 0.9)];
        let out = RowExtractor::default().extract(&regions, &schema);
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.warnings, vec!["line 2: header line skipped".to_string()]);
    }

    #[test]
    fn empty_input_yields_no_rows() {
        let out = RowExtractor::default().extract(&[], &schema());
        assert!(out.rows.is_empty());
        assert_eq!(out.confidence, 0.0);
        assert_eq!(out.warnings, vec!["no text recognized".to_string()]);
    }
}
