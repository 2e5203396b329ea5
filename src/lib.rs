//! Batch extraction of handwritten tabular data into a typed spreadsheet.
//!
//! Images are recognized concurrently by a [`BatchOrchestrator`], merged in submission order
//! by the [`Aggregator`] and serialized with [`excel::write`].

pub mod aggregator;
pub mod config;
pub mod error;
pub mod excel;
pub mod extractor;
pub mod job;
pub mod models;
pub mod orchestrator;
pub mod recognizer;
pub mod types;

pub use aggregator::{Aggregator, BatchSummary, FlagReason, QualityFlag, Table};
pub use config::Settings;
pub use error::{Error, ErrorKind, JobError, RecognizerError, SchemaError};
pub use extractor::{ColumnAlignment, ColumnClustering, ReadingOrder, RowExtractor, TemplateRegions};
pub use models::{ColumnDef, ColumnType, Schema};
pub use orchestrator::{BatchHandle, BatchOrchestrator, MAX_BATCH_SIZE};
pub use recognizer::Recognizer;
pub use types::{BatchJob, BatchStatus, Image, ImageId, JobOutcome, Progress};
