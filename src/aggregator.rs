//! Merges per-image outcomes into one table in submission order.

use serde::Serialize;

use crate::config::DEFAULT_CONFIDENCE_THRESHOLD;
use crate::error::ErrorKind;
use crate::models::Schema;
use crate::types::{BatchJob, BatchStatus, CandidateRow, Cell, ImageId, JobOutcome};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRef {
    pub image_id: ImageId,
    pub original_name: String,
}

/// Where a table row came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowProvenance {
    pub image: ImageRef,
    /// Zero-based row index within the image.
    pub row_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FlagReason {
    LowImageConfidence,
    LowRowConfidence,
    MissingRequired,
}

impl FlagReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LowImageConfidence => "low image confidence",
            Self::LowRowConfidence => "low row confidence",
            Self::MissingRequired => "missing required value",
        }
    }
}

/// Marks a row for human review. Flagged rows are kept.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityFlag {
    pub reasons: Vec<FlagReason>,
    pub confidence: f64,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureEntry {
    pub image: ImageRef,
    pub reason: ErrorKind,
    pub detail: String,
}

/// Consolidated batch output. `rows`, `provenance` and `flags` are parallel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub status: BatchStatus,
    pub rows: Vec<CandidateRow>,
    pub provenance: Vec<RowProvenance>,
    pub flags: Vec<Option<QualityFlag>>,
    pub failures: Vec<FailureEntry>,
    /// Images never processed because the batch was cancelled.
    pub unprocessed: Vec<ImageRef>,
}

impl Table {
    pub fn flagged_count(&self) -> usize {
        self.flags.iter().filter(|f| f.is_some()).count()
    }

    pub fn summary(&self) -> BatchSummary {
        let images_succeeded = {
            let mut ids: Vec<&ImageId> = self.provenance.iter().map(|p| &p.image.image_id).collect();
            ids.dedup();
            ids.len()
        };
        BatchSummary {
            status: self.status,
            images_succeeded,
            images_failed: self.failures.len(),
            images_unprocessed: self.unprocessed.len(),
            rows: self.rows.len(),
            flagged_rows: self.flagged_count(),
            failures: self.failures.clone(),
            unprocessed: self.unprocessed.clone(),
        }
    }
}

/// Machine-readable report of a finished batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub status: BatchStatus,
    pub images_succeeded: usize,
    pub images_failed: usize,
    pub images_unprocessed: usize,
    pub rows: usize,
    pub flagged_rows: usize,
    pub failures: Vec<FailureEntry>,
    pub unprocessed: Vec<ImageRef>,
}

#[derive(Debug, Clone, Copy)]
pub struct Aggregator {
    threshold: f64,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIDENCE_THRESHOLD)
    }
}

impl Aggregator {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn aggregate(&self, job: &BatchJob) -> Table {
        let mut table = Table {
            status: job.status,
            rows: Vec::new(),
            provenance: Vec::new(),
            flags: Vec::new(),
            failures: Vec::new(),
            unprocessed: Vec::new(),
        };

        for image in &job.images {
            let image_ref = ImageRef {
                image_id: image.id.clone(),
                original_name: image.original_name.clone(),
            };
            match job.outcome(&image.id) {
                Some(JobOutcome::Succeeded(result)) => {
                    for (row_index, row) in result.rows.iter().enumerate() {
                        let row = in_schema_order(row, &job.schema);
                        let flag = self.flag(&row, &job.schema, result.overall_confidence, &result.warnings);
                        table.rows.push(row);
                        table.flags.push(flag);
                        table.provenance.push(RowProvenance {
                            image: image_ref.clone(),
                            row_index,
                        });
                    }
                }
                Some(JobOutcome::Failed(failure)) => table.failures.push(FailureEntry {
                    image: image_ref,
                    reason: failure.reason,
                    detail: failure.detail.clone(),
                }),
                None => table.unprocessed.push(image_ref),
            }
        }

        tracing::debug!(
            rows = table.rows.len(),
            flagged = table.flagged_count(),
            failures = table.failures.len(),
            "Aggregated batch"
        );
        table
    }

    fn flag(
        &self,
        row: &CandidateRow,
        schema: &Schema,
        image_confidence: f64,
        warnings: &[String],
    ) -> Option<QualityFlag> {
        let confidence = row.confidence();
        let mut reasons = Vec::new();
        if image_confidence < self.threshold {
            reasons.push(FlagReason::LowImageConfidence);
        }
        if confidence < self.threshold {
            reasons.push(FlagReason::LowRowConfidence);
        }
        let missing = schema
            .columns()
            .iter()
            .zip(&row.cells)
            .any(|(column, cell)| column.required && cell.value.is_none());
        if missing {
            reasons.push(FlagReason::MissingRequired);
        }
        if reasons.is_empty() {
            return None;
        }
        Some(QualityFlag {
            reasons,
            confidence,
            warnings: warnings.to_vec(),
        })
    }
}

/// One cell per schema column, in schema order, matched by name.
fn in_schema_order(row: &CandidateRow, schema: &Schema) -> CandidateRow {
    CandidateRow::new(
        schema
            .columns()
            .iter()
            .map(|column| {
                row.cell(&column.name)
                    .map(|cell| Cell {
                        column_name: column.name.clone(),
                        ..cell.clone()
                    })
                    .unwrap_or_else(|| Cell::empty(&column.name))
            })
            .collect(),
    )
}
