//! Batch orchestration: a bounded worker pool over the images of one submission.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::error::{Error, ErrorKind, JobError};
use crate::extractor::RowExtractor;
use crate::job::ImageJob;
use crate::models::Schema;
use crate::recognizer::Recognizer;
use crate::types::{BatchJob, BatchStatus, Image, JobFailure, JobOutcome, Progress};

/// Largest accepted batch.
pub const MAX_BATCH_SIZE: usize = 100;

/// Shared receiver for workers pulling from one bounded queue.
struct SharedReceiver<T> {
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<T>>>,
}

impl<T> SharedReceiver<T> {
    fn new(rx: mpsc::Receiver<T>) -> Self {
        Self {
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }

    async fn recv(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }
}

impl<T> Clone for SharedReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

pub struct BatchOrchestrator {
    recognizer: Arc<dyn Recognizer>,
    extractor: RowExtractor,
    settings: Settings,
}

impl BatchOrchestrator {
    pub fn new(recognizer: Arc<dyn Recognizer>, extractor: RowExtractor, settings: Settings) -> Self {
        Self {
            recognizer,
            extractor,
            settings,
        }
    }

    /// Validate and start a batch. Must be called inside a tokio runtime.
    pub fn submit(&self, images: Vec<Image>, schema: Schema) -> Result<BatchHandle, Error> {
        if images.is_empty() || images.len() > MAX_BATCH_SIZE {
            return Err(Error::BatchTooLarge {
                count: images.len(),
                max: MAX_BATCH_SIZE,
            });
        }
        let mut seen = HashSet::with_capacity(images.len());
        if let Some(dup) = images.iter().find(|image| !seen.insert(&image.id)) {
            return Err(Error::DuplicateImage(dup.id.to_string()));
        }

        let total = images.len();
        let (progress, _) = watch::channel(Progress {
            completed: 0,
            total,
            status: BatchStatus::Pending,
        });
        let batch = Arc::new(Batch {
            id: uuid::Uuid::new_v4().to_string(),
            schema,
            slots: Mutex::new(vec![None; total]),
            images,
            recognizer: self.recognizer.clone(),
            extractor: self.extractor.clone(),
            settings: self.settings.clone(),
            completed: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
            progress,
            finished: OnceLock::new(),
        });

        let workers = self.settings.workers.clamp(1, total);
        tracing::info!(
            batch_id = %batch.id,
            images = total,
            workers,
            recognizer = batch.recognizer.name(),
            alignment = batch.extractor.alignment_name(),
            "Batch submitted"
        );

        let (tx, rx) = mpsc::channel(workers);
        spawn_feeder(total, tx, batch.cancel.clone());
        let rx = SharedReceiver::new(rx);
        let handles = (0..workers)
            .map(|i| spawn_worker(i, rx.clone(), batch.clone()))
            .collect::<Vec<_>>();

        batch.progress.send_replace(Progress {
            completed: 0,
            total,
            status: BatchStatus::Running,
        });

        let coordinator = batch.clone();
        tokio::spawn(async move {
            for handle in handles {
                if let Err(e) = handle.await {
                    tracing::error!(batch_id = %coordinator.id, error = %e, "Worker task failed");
                }
            }
            coordinator.finish();
        });

        Ok(BatchHandle { batch })
    }
}

struct Batch {
    id: String,
    schema: Schema,
    images: Vec<Image>,
    recognizer: Arc<dyn Recognizer>,
    extractor: RowExtractor,
    settings: Settings,
    /// Write-once outcome per submission index.
    slots: Mutex<Vec<Option<JobOutcome>>>,
    completed: AtomicUsize,
    cancel: CancellationToken,
    progress: watch::Sender<Progress>,
    finished: OnceLock<Arc<BatchJob>>,
}

impl Batch {
    fn total(&self) -> usize {
        self.images.len()
    }

    async fn process(&self, index: usize) -> JobOutcome {
        let image = &self.images[index];
        let mut attempt = 0u32;
        loop {
            let mut job = ImageJob::new(image);
            let err: JobError = match job
                .run(
                    &self.schema,
                    self.recognizer.as_ref(),
                    &self.extractor,
                    self.settings.job_timeout,
                )
                .await
            {
                Ok(result) => return JobOutcome::Succeeded(result),
                Err(e) => e,
            };

            if !err.kind.is_transient() || attempt >= self.settings.max_retries {
                return JobOutcome::Failed(JobFailure {
                    image_id: image.id.clone(),
                    reason: err.kind,
                    detail: err.detail,
                });
            }
            let delay = self
                .settings
                .retry_backoff
                .saturating_mul(2u32.saturating_pow(attempt));
            attempt += 1;
            tracing::warn!(
                image_id = %image.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient failure, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Store an outcome unless the slot is taken or the batch was cancelled.
    fn record(&self, index: usize, outcome: JobOutcome) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if self.cancel.is_cancelled() || slots[index].is_some() {
            return false;
        }
        slots[index] = Some(outcome);
        let completed = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        self.progress.send_replace(Progress {
            completed,
            total: self.total(),
            status: BatchStatus::Running,
        });
        true
    }

    /// Outcome for a job whose task died instead of returning.
    fn crashed(&self, index: usize, error: JoinError) -> JobOutcome {
        let image = &self.images[index];
        let detail = if error.is_panic() {
            let payload = error.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            format!("Recognizer crashed: {}", message)
        } else {
            format!("Job task stopped: {}", error)
        };
        tracing::error!(image_id = %image.id, detail = %detail, "Job crashed");
        JobOutcome::Failed(JobFailure {
            image_id: image.id.clone(),
            reason: ErrorKind::RecognizerUnavailable,
            detail,
        })
    }

    /// Give every image still without an outcome a failure. Only valid once no worker runs.
    fn fail_unfinished(&self) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        for (index, slot) in slots.iter_mut().enumerate() {
            if slot.is_none() {
                let image = &self.images[index];
                tracing::error!(image_id = %image.id, "Image left without an outcome");
                *slot = Some(JobOutcome::Failed(JobFailure {
                    image_id: image.id.clone(),
                    reason: ErrorKind::RecognizerUnavailable,
                    detail: "Worker stopped before the image was processed".to_string(),
                }));
                self.completed.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn snapshot(&self, status: BatchStatus) -> BatchJob {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let results = slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                slot.as_ref()
                    .map(|outcome| (self.images[i].id.clone(), outcome.clone()))
            })
            .collect();
        BatchJob {
            id: self.id.clone(),
            schema: self.schema.clone(),
            images: self.images.clone(),
            status,
            results,
        }
    }

    fn finish(&self) {
        if !self.cancel.is_cancelled() {
            self.fail_unfinished();
        }
        let completed = self.completed.load(Ordering::SeqCst);
        let job = if completed < self.total() {
            self.snapshot(BatchStatus::Cancelled)
        } else {
            let mut job = self.snapshot(BatchStatus::Completed);
            if job.failure_count() > 0 {
                job.status = BatchStatus::PartiallyFailed;
            }
            job
        };
        tracing::info!(
            batch_id = %self.id,
            status = ?job.status,
            succeeded = job.success_count(),
            failed = job.failure_count(),
            "Batch finished"
        );
        let status = job.status;
        let _ = self.finished.set(Arc::new(job));
        self.progress.send_replace(Progress {
            completed,
            total: self.total(),
            status,
        });
    }
}

fn spawn_feeder(total: usize, tx: mpsc::Sender<usize>, cancel: CancellationToken) {
    tokio::spawn(async move {
        for index in 0..total {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                sent = tx.send(index) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
    });
}

fn spawn_worker(worker: usize, rx: SharedReceiver<usize>, batch: Arc<Batch>) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::debug!(batch_id = %batch.id, worker, "Worker started");
        loop {
            let index = tokio::select! {
                biased;
                _ = batch.cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(index) => index,
                    None => break,
                },
            };
            // Own task per job so a panicking recognizer fails one image, not the worker.
            let task = tokio::spawn({
                let batch = batch.clone();
                async move { batch.process(index).await }
            });
            let abort = task.abort_handle();
            let outcome = tokio::select! {
                biased;
                _ = batch.cancel.cancelled() => {
                    abort.abort();
                    tracing::debug!(
                        image_id = %batch.images[index].id,
                        "Abandoned in-flight job"
                    );
                    break;
                }
                joined = task => match joined {
                    Ok(outcome) => outcome,
                    Err(e) => batch.crashed(index, e),
                },
            };
            if !batch.record(index, outcome) {
                tracing::debug!(image_id = %batch.images[index].id, "Discarded late result");
            }
        }
        tracing::debug!(batch_id = %batch.id, worker, "Worker stopped");
    })
}

/// Caller's view of a running batch.
#[derive(Clone)]
pub struct BatchHandle {
    batch: Arc<Batch>,
}

impl std::fmt::Debug for BatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchHandle")
            .field("id", &self.batch.id)
            .field("progress", &self.poll())
            .finish()
    }
}

impl BatchHandle {
    pub fn id(&self) -> &str {
        &self.batch.id
    }

    /// Current progress snapshot.
    pub fn poll(&self) -> Progress {
        *self.batch.progress.borrow()
    }

    /// Receiver that is notified on every progress change.
    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.batch.progress.subscribe()
    }

    /// Stop dispatching and abandon in-flight jobs. Recorded results are kept.
    pub fn cancel(&self) {
        if !self.batch.cancel.is_cancelled() {
            tracing::info!(batch_id = %self.batch.id, "Batch cancelled");
        }
        self.batch.cancel.cancel();
    }

    /// Wait until every worker has exited and return the frozen batch.
    pub async fn wait(&self) -> Arc<BatchJob> {
        let mut rx = self.subscribe();
        let terminal = rx.wait_for(|p| p.status.is_terminal()).await.map(|p| p.status);
        match self.batch.finished.get() {
            Some(job) => job.clone(),
            None => {
                let status = terminal.unwrap_or(BatchStatus::Cancelled);
                Arc::new(self.batch.snapshot(status))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::{ErrorKind, RecognizerError};
    use crate::recognizer::{Script, ScriptedRecognizer};
    use crate::types::RecognizedRegion;
    use crate::models::{ColumnDef, ColumnType};

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    fn schema() -> Schema {
        Schema::new(vec![ColumnDef::new("Sample ID", ColumnType::Text, true)]).unwrap()
    }

    fn image(name: &str) -> Image {
        Image::with_id(name, name, PNG.to_vec())
    }

    fn rows(text: &str) -> Script {
        Script::Regions(vec![RecognizedRegion::new(text, Some(0.9))])
    }

    fn settings(workers: usize) -> Settings {
        Settings {
            workers,
            retry_backoff: Duration::from_millis(10),
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn rejects_empty_and_oversized_batches() {
        let orchestrator = BatchOrchestrator::new(
            Arc::new(ScriptedRecognizer::new()),
            RowExtractor::default(),
            settings(4),
        );
        let err = orchestrator.submit(vec![], schema()).unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::BatchTooLarge));
        let many = (0..101).map(|i| image(&format!("{i}.png"))).collect();
        assert!(matches!(
            orchestrator.submit(many, schema()),
            Err(Error::BatchTooLarge { count: 101, .. })
        ));
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_workers() {
        let mut recognizer = ScriptedRecognizer::new();
        let mut images = Vec::new();
        for i in 0..8 {
            let name = format!("{i}.png");
            recognizer = recognizer
                .on(&name, rows("S-1"))
                .with_delay(&name, Duration::from_millis(20));
            images.push(image(&name));
        }
        let recognizer = Arc::new(recognizer);
        let orchestrator =
            BatchOrchestrator::new(recognizer.clone(), RowExtractor::default(), settings(2));
        let job = orchestrator.submit(images, schema()).unwrap().wait().await;
        assert_eq!(job.status, BatchStatus::Completed);
        assert_eq!(job.success_count(), 8);
        assert_eq!(recognizer.max_concurrency(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let recognizer = Arc::new(
            ScriptedRecognizer::new()
                .on_sequence(
                    "flaky.png",
                    vec![
                        Script::Fail(RecognizerError::Unavailable("503".into())),
                        Script::Fail(RecognizerError::Timeout("slow".into())),
                        rows("S-1"),
                    ],
                )
                .on("down.png", Script::Fail(RecognizerError::Unavailable("503".into()))),
        );
        let orchestrator =
            BatchOrchestrator::new(recognizer.clone(), RowExtractor::default(), settings(2));
        let job = orchestrator
            .submit(vec![image("flaky.png"), image("down.png")], schema())
            .unwrap()
            .wait()
            .await;
        assert!(job.outcome(&"flaky.png".into()).unwrap().is_success());
        assert_eq!(recognizer.calls("flaky.png"), 3);
        match job.outcome(&"down.png".into()) {
            Some(JobOutcome::Failed(f)) => assert_eq!(f.reason, ErrorKind::RecognizerUnavailable),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(recognizer.calls("down.png"), 3);
        assert_eq!(job.status, BatchStatus::PartiallyFailed);
    }

    #[tokio::test]
    async fn invalid_images_are_not_retried() {
        let recognizer = Arc::new(
            ScriptedRecognizer::new()
                .on("bad.png", Script::Fail(RecognizerError::InvalidImage("blurred".into()))),
        );
        let orchestrator =
            BatchOrchestrator::new(recognizer.clone(), RowExtractor::default(), settings(1));
        let job = orchestrator
            .submit(vec![image("bad.png")], schema())
            .unwrap()
            .wait()
            .await;
        assert_eq!(recognizer.calls("bad.png"), 1);
        assert_eq!(job.failure_count(), 1);
    }

    #[tokio::test]
    async fn duplicate_image_ids_are_rejected() {
        let orchestrator = BatchOrchestrator::new(
            Arc::new(ScriptedRecognizer::new()),
            RowExtractor::default(),
            settings(2),
        );
        let images = vec![
            Image::with_id("x", "a.png", PNG.to_vec()),
            Image::with_id("y", "b.png", PNG.to_vec()),
            Image::with_id("x", "c.png", PNG.to_vec()),
        ];
        let err = orchestrator.submit(images, schema()).unwrap_err();
        assert!(matches!(&err, Error::DuplicateImage(id) if id == "x"), "{:?}", err);
    }

    #[tokio::test]
    async fn a_panicking_recognizer_fails_only_its_image() {
        let recognizer = ScriptedRecognizer::new()
            .on("a.png", rows("S-1"))
            .on("boom.png", Script::Panic("decoder bug".into()))
            .on("c.png", rows("S-3"));
        let orchestrator =
            BatchOrchestrator::new(Arc::new(recognizer), RowExtractor::default(), settings(1));
        let handle = orchestrator
            .submit(vec![image("a.png"), image("boom.png"), image("c.png")], schema())
            .unwrap();
        let job = handle.wait().await;

        assert_eq!(job.status, BatchStatus::PartiallyFailed);
        assert_eq!(job.results.len(), 3);
        assert_eq!(job.success_count(), 2);
        match job.outcome(&"boom.png".into()) {
            Some(JobOutcome::Failed(f)) => {
                assert_eq!(f.reason, ErrorKind::RecognizerUnavailable);
                assert!(f.detail.contains("decoder bug"), "{}", f.detail);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(handle.poll().completed, 3);
    }

    #[tokio::test]
    async fn progress_is_pushed_to_subscribers() {
        let recognizer = ScriptedRecognizer::new().on("a.png", rows("S-1")).on("b.png", rows("S-2"));
        let orchestrator =
            BatchOrchestrator::new(Arc::new(recognizer), RowExtractor::default(), settings(1));
        let handle = orchestrator
            .submit(vec![image("a.png"), image("b.png")], schema())
            .unwrap();
        let mut rx = handle.subscribe();
        let done = rx.wait_for(|p| p.status.is_terminal()).await.map(|p| *p).unwrap();
        assert_eq!(done.completed, 2);
        assert_eq!(done.status, BatchStatus::Completed);
        assert_eq!(handle.poll(), done);
        assert_eq!(handle.wait().await.results.len(), 2);
    }
}
