//! Processing of a single image: recognize, extract, classify the outcome.

use std::time::Duration;

use crate::error::{ErrorKind, JobError};
use crate::extractor::RowExtractor;
use crate::models::Schema;
use crate::recognizer::Recognizer;
use crate::types::{Image, JobResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// One attempt at one image. Retries are the orchestrator's business.
#[derive(Debug)]
pub struct ImageJob<'a> {
    image: &'a Image,
    state: JobState,
}

impl<'a> ImageJob<'a> {
    pub fn new(image: &'a Image) -> Self {
        Self {
            image,
            state: JobState::Queued,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub async fn run(
        &mut self,
        schema: &Schema,
        recognizer: &dyn Recognizer,
        extractor: &RowExtractor,
        timeout: Duration,
    ) -> Result<JobResult, JobError> {
        self.state = JobState::Running;
        tracing::debug!(
            image_id = %self.image.id,
            name = %self.image.original_name,
            recognizer = recognizer.name(),
            "Job started"
        );

        let result = self.execute(schema, recognizer, extractor, timeout).await;
        match &result {
            Ok(r) => {
                self.state = JobState::Succeeded;
                tracing::info!(
                    image_id = %self.image.id,
                    rows = r.rows.len(),
                    confidence = r.overall_confidence,
                    "Job succeeded"
                );
            }
            Err(e) => {
                self.state = JobState::Failed;
                tracing::warn!(image_id = %self.image.id, error = %e, "Job failed");
            }
        }
        result
    }

    async fn execute(
        &self,
        schema: &Schema,
        recognizer: &dyn Recognizer,
        extractor: &RowExtractor,
        timeout: Duration,
    ) -> Result<JobResult, JobError> {
        let bytes = &self.image.bytes;
        if bytes.is_empty() {
            return Err(JobError::new(ErrorKind::InvalidImage, "Image is empty"));
        }
        if !infer::is_image(bytes) {
            let detail = match infer::get(bytes) {
                Some(kind) => format!("Not an image ({})", kind.mime_type()),
                None => "Unrecognized file content".to_string(),
            };
            return Err(JobError::new(ErrorKind::InvalidImage, detail));
        }

        let regions = tokio::time::timeout(timeout, recognizer.recognize(self.image))
            .await
            .map_err(|_| {
                JobError::new(
                    ErrorKind::RecognizerTimeout,
                    format!("No response within {}s", timeout.as_secs_f64()),
                )
            })??;

        let extraction = extractor.extract(&regions, schema);
        if extraction.rows.is_empty() {
            let detail = if extraction.warnings.is_empty() {
                "No rows found".to_string()
            } else {
                extraction.warnings.join("; ")
            };
            return Err(JobError::new(ErrorKind::NoDataExtracted, detail));
        }

        Ok(JobResult {
            image_id: self.image.id.clone(),
            rows: extraction.rows,
            overall_confidence: extraction.confidence,
            warnings: extraction.warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RecognizerError;
    use crate::models::{ColumnDef, ColumnType};
    use crate::recognizer::{Script, ScriptedRecognizer};
    use crate::types::RecognizedRegion;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR\0\0\0\x01\0\0\0\x01\x08\x02\0\0\0";

    fn schema() -> Schema {
        Schema::new(vec![
            ColumnDef::new("Sample ID", ColumnType::Text, true),
            ColumnDef::new("Weight", ColumnType::Number, false),
        ])
        .unwrap()
    }

    async fn run(image: &Image, recognizer: &ScriptedRecognizer) -> (Result<JobResult, JobError>, JobState) {
        let mut job = ImageJob::new(image);
        assert_eq!(job.state(), JobState::Queued);
        assert!(!job.state().is_terminal());
        let result = job
            .run(&schema(), recognizer, &RowExtractor::default(), Duration::from_secs(5))
            .await;
        assert!(job.state().is_terminal());
        (result, job.state())
    }

    #[tokio::test]
    async fn recognized_rows_succeed() {
        let recognizer = ScriptedRecognizer::new().on(
            "a.png",
            Script::Regions(vec![RecognizedRegion::new("S-1 | 2.5", Some(0.8))]),
        );
        let image = Image::with_id("a", "a.png", PNG.to_vec());
        let (result, state) = run(&image, &recognizer).await;
        let result = result.unwrap();
        assert_eq!(state, JobState::Succeeded);
        assert_eq!(result.image_id.as_str(), "a");
        assert_eq!(result.rows.len(), 1);
        assert!((result.overall_confidence - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn non_images_never_reach_the_recognizer() {
        let recognizer = ScriptedRecognizer::new();
        let image = Image::with_id("t", "notes.txt", b"plain text".to_vec());
        let (result, state) = run(&image, &recognizer).await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::InvalidImage);
        assert_eq!(state, JobState::Failed);
        assert_eq!(recognizer.calls("notes.txt"), 0);
    }

    #[tokio::test]
    async fn empty_extraction_is_no_data() {
        let recognizer = ScriptedRecognizer::new().on("blank.png", Script::Regions(vec![]));
        let image = Image::with_id("b", "blank.png", PNG.to_vec());
        let err = run(&image, &recognizer).await.0.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoDataExtracted);
        assert!(err.detail.contains("no text recognized"));
    }

    #[tokio::test]
    async fn recognizer_errors_are_classified() {
        let recognizer = ScriptedRecognizer::new()
            .on("down.png", Script::Fail(RecognizerError::Unavailable("503".into())));
        let image = Image::with_id("d", "down.png", PNG.to_vec());
        let err = run(&image, &recognizer).await.0.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RecognizerUnavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_recognizer_times_out() {
        let recognizer = ScriptedRecognizer::new().on("slow.png", Script::Hang);
        let image = Image::with_id("s", "slow.png", PNG.to_vec());
        let mut job = ImageJob::new(&image);
        let err = job
            .run(&schema(), &recognizer, &RowExtractor::default(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::RecognizerTimeout);
    }
}
